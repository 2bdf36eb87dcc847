//! `window/logMessage` output.

use std::io::{self, Write};
use std::sync::Mutex;

use lsp_types::{LogMessageParams, MessageType};
use serde_json::Value;

use crate::lsp::handler::NotificationHandler;

/// Writes server log messages to a text sink, one line each.
pub struct Console {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Console {
            sink: Mutex::new(Box::new(sink)),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    pub fn log_message(&self, params: &LogMessageParams) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(sink, "{}{}", prefix(params.typ), params.message)?;
        sink.flush()
    }
}

fn prefix(typ: MessageType) -> &'static str {
    if typ == MessageType::ERROR {
        "[error] "
    } else if typ == MessageType::WARNING {
        " [warn] "
    } else if typ == MessageType::INFO {
        " [info] "
    } else if typ == MessageType::LOG {
        "  [log] "
    } else {
        ""
    }
}

#[async_trait::async_trait]
impl NotificationHandler for Console {
    async fn handle(&self, params: Value) -> anyhow::Result<()> {
        let params: LogMessageParams = serde_json::from_value(params)?;
        self.log_message(&params)?;
        Ok(())
    }
}
