use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};

use crate::lsp::ClientConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_command: String,
    pub server_args: Vec<String>,
    pub client_name: String,
    pub request_timeout: Option<Duration>,
    pub request: Option<String>,
    pub params: serde_json::Value,
    pub verbosity: u8,
}

impl Config {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_name: self.client_name.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "demo-lsp-client")]
#[command(about = "Drive a language server over stdio and print its traffic", long_about = None)]
pub struct Cli {
    /// Language server executable
    pub server: String,
    /// Arguments passed to the language server
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub server_args: Vec<String>,
    /// Name sent as clientInfo.name during initialize
    #[arg(long, default_value = "demo-language-client")]
    pub client_name: String,
    /// Seconds to wait for each response (0 waits forever)
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,
    /// Send one request after the handshake, print its result and exit
    #[arg(long)]
    pub request: Option<String>,
    /// JSON params for --request
    #[arg(long, requires = "request")]
    pub params: Option<String>,
    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn into_config(self) -> anyhow::Result<Config> {
        let params = match self.params {
            Some(raw) => serde_json::from_str(&raw).context("--params is not valid JSON")?,
            None => serde_json::Value::Null,
        };
        Ok(Config {
            server_command: self.server,
            server_args: self.server_args,
            client_name: self.client_name,
            request_timeout: (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
            request: self.request,
            params,
            verbosity: self.verbose,
        })
    }
}
