use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, Notify};

use super::Transport;
use crate::error::{Error, Result};
use crate::pool::AncillaryFd;

/// Link transport over a TCP/IP connection.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl TcpTransport {
    /// Connects to a listening peer.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| Error::ErrInitTcpIp)?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an accepted connection.
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        TcpTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    fn closed_err() -> Error {
        Error::ErrTransportIo("tcp transport closed".to_owned())
    }
}

#[async_trait]
impl Transport for TcpTransport {
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
