
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::event::{Timespec, INVALID_STREAM_ID, INVALID_STREAM_ID_OUT_OF_MEMORY, MAX_STREAM_NAME_LENGTH};
use crate::pool::{AncillaryFd, OwnedPacket, PacketDesc, PacketPool, MAX_PACKETS_PER_STREAM};

/// Streams per link.
pub const MAX_STREAMS: usize = 32;

/// Which side's occupancy a fill-level query refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FillSide {
    /// Bytes buffered locally for this side's reader.
    Local,
    /// This side's estimate of the peer's occupancy.
    Remote,
}

/// A named logical channel bound to one link.
///
/// `write_size` is the capacity the peer allocated for our writes;
/// `read_size` is what we allocated for the peer. The fill levels bound the
/// outstanding bytes in each direction and drive the flow control.
pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) write_size: u32,
    pub(crate) read_size: u32,
    pub(crate) local_fill_level: u32,
    pub(crate) local_fill_packets: u32,
    pub(crate) remote_fill_level: u32,
    pub(crate) remote_fill_packets: u32,
    pub(crate) close_initiated: bool,
    pub(crate) packets: PacketPool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("write_size", &self.write_size)
            .field("read_size", &self.read_size)
            .field("local_fill_level", &self.local_fill_level)
            .field("remote_fill_level", &self.remote_fill_level)
            .field("close_initiated", &self.close_initiated)
            .finish()
    }
}

impl Stream {
    fn new(id: u32, name: String, read_size: u32, write_size: u32) -> Self {
        Stream {
            id,
            name,
            write_size,
            read_size,
            local_fill_level: 0,
            local_fill_packets: 0,
            remote_fill_level: 0,
            remote_fill_packets: 0,
            close_initiated: false,
            packets: PacketPool::new(),
        }
    }

    /// Whether the peer can still absorb `size` more bytes from us.
    pub(crate) fn has_remote_space_for(&self, size: u32) -> bool {
        if self.remote_fill_packets as usize >= MAX_PACKETS_PER_STREAM
            || self.remote_fill_level + size > self.write_size
        {
            log::debug!(
                "S{}: no space in stream '{}' for {}: PKT {}, FILL {} SIZE {}",
                self.id,
                self.name,
                size,
                self.remote_fill_packets,
                self.remote_fill_level,
                self.write_size
            );
            return false;
        }
        true
    }

    /// Stores an incoming packet and raises the local fill level.
    pub(crate) fn push_packet(
        &mut self,
        data: Bytes,
        fd: Option<AncillaryFd>,
        t_remote_sent: Timespec,
        t_received: Timespec,
    ) -> Result<()> {
        let size = data.len() as u32;
        self.packets.push(data, fd, t_remote_sent, t_received)?;
        self.local_fill_level += size;
        self.local_fill_packets += 1;
        Ok(())
    }

    pub(crate) fn peek_packet(&mut self) -> Option<PacketDesc> {
        self.packets.peek_next()
    }

    pub(crate) fn move_packet(&mut self) -> Option<OwnedPacket> {
        self.packets.move_next()
    }

    /// Releases the oldest handed-out packet and lowers the local fill
    /// level by the released byte count.
    pub(crate) fn release_packet(&mut self) -> Option<u32> {
        let released = self.packets.release_front()?;
        self.local_fill_level = self.local_fill_level.saturating_sub(released);
        self.local_fill_packets = self.local_fill_packets.saturating_sub(1);
        Some(released)
    }

    pub(crate) fn release_specific_packet(&mut self, ptr: usize) -> Result<u32> {
        let released = self.packets.release_specific(ptr)?;
        self.local_fill_level = self.local_fill_level.saturating_sub(released);
        self.local_fill_packets = self.local_fill_packets.saturating_sub(1);
        Ok(released)
    }

    pub(crate) fn fill_level(&self, side: FillSide) -> u32 {
        match side {
            FillSide::Local => self.local_fill_level,
            FillSide::Remote => self.remote_fill_level,
        }
    }
}

/// Per-link table mapping stream id to stream; allocates ids and enforces
/// name uniqueness. Ids increase monotonically and are never reused while
/// the link is alive.
#[derive(Default)]
pub(crate) struct StreamTable {
    slots: Vec<Option<Stream>>,
    next_stream_id: u32,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_STREAMS);
        slots.resize_with(MAX_STREAMS, || None);
        StreamTable {
            slots,
            next_stream_id: 0,
        }
    }

    /// Opens a stream or updates the missing side of an existing one.
    ///
    /// Returns the stream id, `INVALID_STREAM_ID` for an unusable name and
    /// `INVALID_STREAM_ID_OUT_OF_MEMORY` when the table is full or the id
    /// space for the public handle encoding is exhausted.
    pub(crate) fn open_or_update(
        &mut self,
        name: &str,
        read_size: u32,
        write_size: u32,
        forced_id: Option<u32>,
    ) -> u32 {
        if name.is_empty() || name.len() >= MAX_STREAM_NAME_LENGTH || !name.is_ascii() {
            return INVALID_STREAM_ID;
        }

        if let Some(stream) = self.slots.iter_mut().flatten().find(|s| s.name == name) {
            if stream.read_size == 0 {
                stream.read_size = read_size;
            }
            if stream.write_size == 0 {
                stream.write_size = write_size;
            }
            return stream.id;
        }

        let id = match forced_id {
            Some(id) => id,
            None => {
                // stream ids share a 32-bit handle with the link id
                if self.next_stream_id > 0x00FF_FFFF {
                    log::error!("max stream id reached");
                    return INVALID_STREAM_ID_OUT_OF_MEMORY;
                }
                let id = self.next_stream_id;
                self.next_stream_id += 1;
                id
            }
        };

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(Stream::new(id, name.to_owned(), read_size, write_size));
                id
            }
            None => INVALID_STREAM_ID_OUT_OF_MEMORY,
        }
    }

    pub(crate) fn get_by_id(&mut self, id: u32) -> Option<&mut Stream> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|stream| stream.id == id)
    }

    pub(crate) fn get_by_name(&mut self, name: &str) -> Option<&mut Stream> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|stream| stream.name == name)
    }

    pub(crate) fn id_by_name(&self, name: &str) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .find(|stream| stream.name == name)
            .map(|stream| stream.id)
    }

    /// Frees the slot holding `id`; the id itself is not reused.
    pub(crate) fn free(&mut self, id: u32) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|s| s.id) == Some(id) {
                *slot = None;
                return;
            }
        }
    }

    pub(crate) fn ids(&self) -> Vec<u32> {
        self.slots.iter().flatten().map(|s| s.id).collect()
    }

    /// Drops every stream and its buffered packets; used on link teardown.
    pub(crate) fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(stream) = slot {
                stream.packets.drain();
            }
            *slot = None;
        }
    }

    pub(crate) fn ensure_open(&mut self, id: u32) -> Result<&mut Stream> {
        self.get_by_id(id).ok_or(Error::ErrNoSuchStream)
    }
}
