use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

use super::Transport;
use crate::error::{Error, Result};
use crate::pool::AncillaryFd;

const PIPE_CAPACITY: usize = 16 * 1024 * 1024;

/// One end of an in-memory duplex byte channel. The loopback transport for
/// tests and same-process peers.
pub struct PipeTransport {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Creates a connected transport pair.
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    (PipeTransport::new(a), PipeTransport::new(b))
}

impl PipeTransport {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        PipeTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    fn closed_err() -> Error {
        Error::ErrTransportIo("pipe transport closed".to_owned())
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let notified = self.close_notify.notified();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_err());
        }
        tokio::select! {
            _ = notified => Err(Self::closed_err()),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(buf).await?;
                Ok(buf.len())
            } => result,
        }
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<Option<AncillaryFd>> {
        let notified = self.close_notify.notified();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_err());
        }
        tokio::select! {
            _ = notified => Err(Self::closed_err()),
            result = async {
                let mut reader = self.reader.lock().await;
                reader.read_exact(buf).await?;
                Ok(None)
            } => result,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.close_notify.notify_waiters();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}
