//! Transport-agnostic stream multiplexing for Tokio
//!
//! xlink connects a host process to one or more peer endpoints over a
//! single duplex byte channel (TCP/IP, UNIX-domain or in-memory pipes, or
//! any [`Transport`] implementation) and multiplexes named packet streams
//! on top of it: discrete packets with per-stream flow control,
//! at-most-once delivery, back-pressure on full peers, and a cooperative
//! reset handshake for teardown.
//!
//! Each link runs a small per-connection engine, a scheduler task pairing
//! requests with responses and a reader task feeding remote events, so
//! reads and writes on independent streams proceed concurrently while a
//! single stream stays strictly ordered.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod api;
mod codec;
pub mod discovery;
pub mod error;
mod event;
pub mod link;
mod pool;
mod queue;
pub mod registry;
mod stream;
pub mod transport;

pub use crate::api::{InitOptions, StreamHandle};
pub use crate::error::{Error, Result};
pub use crate::event::{Timespec, MAX_STREAM_NAME_LENGTH};
pub use crate::link::{Config, Link, LinkState};
pub use crate::pool::{AncillaryFd, OwnedPacket, PacketDesc, MAX_PACKETS_PER_STREAM};
pub use crate::registry::{CallbackId, LinkDownCallback, LinkId, INVALID_LINK_ID, MAX_LINKS};
pub use crate::stream::{FillSide, MAX_STREAMS};
pub use crate::transport::{Transport, UsbSpeed};
