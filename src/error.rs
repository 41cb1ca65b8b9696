use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("link is already open")]
    ErrAlreadyOpen,
    #[error("communication is not open")]
    ErrCommunicationNotOpen,
    #[error("wire round-trip was not acknowledged")]
    ErrCommunicationFail,
    #[error("protocol invariant violated")]
    ErrCommunicationUnknownError,
    #[error("device not found")]
    ErrDeviceNotFound,
    #[error("device already in use")]
    ErrDeviceAlreadyInUse,
    #[error("insufficient permissions to open device")]
    ErrInsufficientPermissions,
    #[error("operation timed out")]
    ErrTimeout,
    #[error("stream or pool exhausted")]
    ErrOutOfMemory,
    #[error("USB transport initialization failed")]
    ErrInitUsb,
    #[error("TCP/IP transport initialization failed")]
    ErrInitTcpIp,
    #[error("PCIe transport initialization failed")]
    ErrInitPcie,
    #[error("not implemented")]
    ErrNotImplemented,

    #[error("raw is too small for an event header")]
    ErrEventHeaderTooSmall,
    #[error("event header contains an unknown event type")]
    ErrUnknownEventType,
    #[error("event header padding is non-zero")]
    ErrEventHeaderPaddingNonZero,
    #[error("stream name is not valid ASCII")]
    ErrStreamNameNotAscii,
    #[error("stream name exceeds the wire name field")]
    ErrStreamNameTooLong,

    #[error("no such stream on this link")]
    ErrNoSuchStream,
    #[error("stream has been closed")]
    ErrStreamClosed,
    #[error("stream table is full")]
    ErrStreamTableFull,
    #[error("no packet to release")]
    ErrNoPacketToRelease,
    #[error("no packet matches the released buffer")]
    ErrNoSuchPacket,
    #[error("packet pool is full")]
    ErrPacketPoolFull,

    #[error("link table is full")]
    ErrLinkTableFull,
    #[error("event queue is full")]
    ErrEventQueueFull,
    #[error("event misrouted across links")]
    ErrEventMisrouted,

    #[error("transport io error: {0}")]
    ErrTransportIo(String),

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::ErrTransportIo(error.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            e @ Error::ErrTimeout => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            e @ Error::ErrStreamClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            e @ Error::ErrCommunicationNotOpen => {
                io::Error::new(io::ErrorKind::NotConnected, e.to_string())
            }
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}
