use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::cli::Config;
use crate::lsp::stdio_transport::{pump_reader, pump_writer, spawn_server};
use crate::lsp::{spawn_demuxer, AsyncQueue, FromServer, LspClient};

const TARGET: &str = "demo_lsp_client::app";
const INBOUND_HIGH_WATERMARK: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> anyhow::Result<()> {
    let (mut child, writer, reader) = spawn_server(&config.server_command, &config.server_args)?;
    let cancel = CancellationToken::new();

    let inbound = Arc::new(AsyncQueue::with_high_watermark(INBOUND_HIGH_WATERMARK));
    let outbound = Arc::new(AsyncQueue::new());
    let from_server = Arc::new(FromServer::new());

    let demuxer = spawn_demuxer(Arc::clone(&inbound), Arc::clone(&from_server), cancel.clone());
    let reader_task = tokio::spawn(pump_reader(reader, inbound, cancel.clone()));
    let writer_task = tokio::spawn(pump_writer(Arc::clone(&outbound), writer, cancel.clone()));

    let client = Arc::new(LspClient::new(
        outbound,
        Arc::clone(&from_server),
        config.client_config(),
    ));

    let session = drive(&client, &config, &cancel).await;

    if !cancel.is_cancelled() {
        match timeout(SHUTDOWN_GRACE, client.shutdown()).await {
            Ok(Ok(())) => info!(target: TARGET, "Server shut down"),
            Ok(Err(e)) => warn!(target: TARGET, "Shutdown failed: {}", e),
            Err(_) => warn!(target: TARGET, "Server did not answer shutdown in time"),
        }
    }
    cancel.cancel();

    demuxer.join().await;
    for (name, task) in [("reader", reader_task), ("writer", writer_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: TARGET, "{} pump failed: {:#}", name, e),
            Err(e) => warn!(target: TARGET, "{} pump panicked: {}", name, e),
        }
    }

    match timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(status) => {
            let status = status.context("failed to wait for language server")?;
            info!(target: TARGET, "Server exited with {}", status);
        }
        Err(_) => {
            warn!(target: TARGET, "Server still running, killing it");
            child.kill().await.context("failed to kill language server")?;
        }
    }

    session
}

/// Handshake, then either answer the one-shot request or forward server
/// traffic until interrupted.
async fn drive(
    client: &Arc<LspClient>,
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let capabilities = client
        .initialize()
        .await
        .context("initialize handshake failed")?;
    info!(
        target: TARGET,
        "Server capabilities: {}",
        capabilities.get("capabilities").unwrap_or(&capabilities)
    );

    // Stops when the session is cancelled, after shutdown.
    tokio::spawn({
        let client = Arc::clone(client);
        let cancel = cancel.clone();
        async move { client.serve(cancel).await }
    });

    match &config.request {
        Some(method) => {
            let result = client
                .request(method, config.params.clone())
                .await
                .with_context(|| format!("request {} failed", method))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for ctrl-c")?;
                    info!(target: TARGET, "Interrupted");
                }
                _ = cancel.cancelled() => warn!(target: TARGET, "Connection to server lost"),
            }
            Ok(())
        }
    }
}
