// low-level stdio plumbing: moves raw bytes between the server's pipes and the queues
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::lsp::queue::AsyncQueue;

const TARGET: &str = "demo_lsp_client::stdio";
const READ_CHUNK: usize = 8 * 1024;

/// Spawn a language server with piped stdin/stdout. Its stderr is inherited.
pub fn spawn_server(exe: &str, args: &[String]) -> anyhow::Result<(Child, ChildStdin, ChildStdout)> {
    let mut cmd = Command::new(exe);
    cmd.args(args);

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start language server `{}`", exe))?;

    let writer = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to take child stdin"))?;
    let reader = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to take child stdout"))?;

    Ok((child, writer, reader))
}

/// Copy chunks from `reader` into `inbound` as they arrive.
///
/// Chunks are enqueued exactly as read, with no regard for frame boundaries.
/// EOF or a read error cancels `cancel`, since the connection is gone.
pub async fn pump_reader<R>(
    mut reader: R,
    inbound: Arc<AsyncQueue<Vec<u8>>>,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let result = read_loop(&mut reader, &inbound, &cancel).await;
    if let Err(e) = &result {
        warn!(target: TARGET, "Reader stopped: {:#}", e);
    }
    cancel.cancel();
    result
}

async fn read_loop<R>(
    reader: &mut R,
    inbound: &AsyncQueue<Vec<u8>>,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read.context("failed to read from server")?,
        };
        if read == 0 {
            debug!(target: TARGET, "Server closed its output");
            return Ok(());
        }
        inbound.enqueue(buf[..read].to_vec());
    }
}

/// Write frames from `outbound` to `writer` in order.
///
/// On cancellation, frames already queued are still written before returning.
pub async fn pump_writer<W>(
    outbound: Arc<AsyncQueue<Vec<u8>>>,
    mut writer: W,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let result = write_loop(&outbound, &mut writer, &cancel).await;
    if let Err(e) = &result {
        warn!(target: TARGET, "Writer stopped: {:#}", e);
        cancel.cancel();
    }
    result
}

async fn write_loop<W>(
    outbound: &AsyncQueue<Vec<u8>>,
    writer: &mut W,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.dequeue() => frame,
        };
        write_frame(writer, &frame).await?;
    }
    while let Some(frame) = outbound.try_dequeue() {
        write_frame(writer, &frame).await?;
    }
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer
        .write_all(frame)
        .await
        .context("failed to write to server")?;
    writer.flush().await.context("failed to flush server input")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::codec::{encode, FrameDecoder};
    use tokio::io::duplex;

    #[tokio::test]
    async fn reader_forwards_bytes_until_eof() {
        let (mut a, b) = duplex(16);
        let inbound = Arc::new(AsyncQueue::new());
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump_reader(b, Arc::clone(&inbound), cancel.clone()));

        let frame = encode(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#);
        a.write_all(&frame).await.unwrap();
        drop(a);

        pump.await.unwrap().unwrap();
        assert!(cancel.is_cancelled());

        let mut received = Vec::new();
        while let Some(chunk) = inbound.try_dequeue() {
            received.extend(chunk);
        }
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn writer_writes_frames_in_order() {
        let (a, mut b) = duplex(1024);
        let outbound = Arc::new(AsyncQueue::new());
        let cancel = CancellationToken::new();

        outbound.enqueue(encode(r#"{"jsonrpc":"2.0","method":"test","params":{}}"#));
        outbound.enqueue(encode(r#"{"jsonrpc":"2.0","method":"exit","params":null}"#));

        let pump = tokio::spawn(pump_writer(Arc::clone(&outbound), a, cancel.clone()));

        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        while seen.len() < 2 {
            let n = b.read(&mut buf).await.unwrap();
            decoder.push(&buf[..n]);
            while let Some(payload) = decoder.next_frame().unwrap() {
                seen.push(String::from_utf8(payload).unwrap());
            }
        }
        assert!(seen[0].contains("\"method\":\"test\""));
        assert!(seen[1].contains("\"method\":\"exit\""));

        cancel.cancel();
        pump.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn writer_flushes_queued_frames_on_cancel() {
        let (a, mut b) = duplex(1024);
        let outbound = Arc::new(AsyncQueue::new());
        let cancel = CancellationToken::new();

        let frame = encode(r#"{"jsonrpc":"2.0","method":"exit","params":null}"#);
        outbound.enqueue(frame.clone());
        cancel.cancel();

        pump_writer(Arc::clone(&outbound), a, cancel).await.unwrap();

        let mut written = vec![0u8; frame.len()];
        b.read_exact(&mut written).await.unwrap();
        assert_eq!(written, frame);
    }

    #[tokio::test]
    async fn writer_error_cancels_session() {
        let (a, b) = duplex(64);
        drop(b);
        let outbound = Arc::new(AsyncQueue::new());
        let cancel = CancellationToken::new();
        outbound.enqueue(encode("{}"));

        let result = pump_writer(outbound, a, cancel.clone()).await;
        assert!(result.is_err());
        assert!(cancel.is_cancelled());
    }
}
