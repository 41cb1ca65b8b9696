pub mod pipe;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::pool::AncillaryFd;

/// Connection speed reported by USB-class transports; informational.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbSpeed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl fmt::Display for UsbSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            UsbSpeed::Unknown => "Unknown",
            UsbSpeed::Low => "Low",
            UsbSpeed::Full => "Full",
            UsbSpeed::High => "High",
            UsbSpeed::Super => "Super",
            UsbSpeed::SuperPlus => "SuperPlus",
        };
        write!(f, "{s}")
    }
}

/// Opaque duplex byte channel a link runs over.
///
/// The engine frames its own traffic, so implementations only move bytes:
/// `send` writes a whole buffer, `recv_exact` fills a whole buffer. A failed
/// or partial transfer is link-fatal; there is no retry at this layer.
#[async_trait]
pub trait Transport {
    /// Writes the whole buffer as one transfer.
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Fills `buf` completely, returning an ancillary file descriptor if
    /// the transport delivered one alongside the bytes.
    async fn recv_exact(&self, buf: &mut [u8]) -> Result<Option<AncillaryFd>>;

    /// Closes the channel and wakes any blocked `send`/`recv_exact`.
    /// Must be idempotent.
    async fn close(&self) -> Result<()>;

    /// Transfer-size multiple the transport prefers for bulk writes; the
    /// codec stitches payload fragments to this boundary. 1 means no
    /// alignment constraint.
    fn write_alignment(&self) -> usize {
        1
    }

    /// Whether ancillary file descriptors can travel with the payload.
    fn supports_fd_passing(&self) -> bool {
        false
    }

    fn usb_speed(&self) -> UsbSpeed {
        UsbSpeed::Unknown
    }

    fn mx_serial(&self) -> String {
        "UNKNOWN".to_owned()
    }
}
