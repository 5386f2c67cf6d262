//! Pump tasks moving bytes between OS descriptors and streams.
//!
//! A process's piped stdio is connected to pipeline streams by small copy
//! tasks. The OS pipe supplies backpressure on the process side: while a
//! pump is suspended on a full stream it stops reading, the kernel pipe
//! fills, and the process blocks in `write(2)`.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use super::stderr_sample::SharedSample;
use super::stream::StreamWriter;

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn log_copy_error(identity: &str, what: &str, err: &io::Error) {
    match err.kind() {
        // Consumer went away or teardown is in progress; both expected.
        io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted => {
            tracing::debug!(identity = %identity, what, "pump stopped: {}", err);
        }
        _ => tracing::warn!(identity = %identity, what, "pump failed: {}", err),
    }
}

/// Copy `reader` into `writer` until end of data, then shut `writer` down.
pub(crate) fn spawn_copy<R, W>(
    identity: String,
    what: &'static str,
    mut reader: R,
    mut writer: W,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(bytes) => tracing::trace!(identity = %identity, what, bytes, "pump finished"),
            Err(e) => log_copy_error(&identity, what, &e),
        }
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(identity = %identity, what, "shutdown after pump: {}", e);
        }
    })
}

/// Copy stderr to `writer`, keeping a tail sample on the way.
///
/// Keeps reading after the sink fails so the producer never blocks on a
/// stderr nobody consumes.
pub(crate) fn spawn_tee<R>(
    identity: String,
    mut reader: R,
    sample: Option<SharedSample>,
    mut writer: BoxWriter,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        let mut sink_open = true;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log_copy_error(&identity, "stderr", &e);
                    break;
                }
            };
            if let Some(sample) = &sample {
                sample
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(&buf[..n]);
            }
            if sink_open && let Err(e) = writer.write_all(&buf[..n]).await {
                log_copy_error(&identity, "stderr", &e);
                sink_open = false;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Write fixed bytes into a stream, then close it.
pub(crate) fn spawn_feed(identity: String, data: Arc<[u8]>, mut writer: StreamWriter) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = writer.write(&data).await {
            log_copy_error(&identity, "stdin", &e.into());
        }
        let _ = writer.close().await;
    })
}
