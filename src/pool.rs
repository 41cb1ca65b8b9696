use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::event::Timespec;

/// Upper bound on packets buffered per stream, per direction.
pub const MAX_PACKETS_PER_STREAM: usize = 64;

/// Opaque ancillary file descriptor carried alongside a packet buffer.
/// Transports without descriptor passing deliver `None`.
pub type AncillaryFd = i64;

/// Descriptor of a packet still owned by its pool. The buffer stays alive
/// until the pool slot is released.
#[derive(Default, Debug, Clone)]
pub struct PacketDesc {
    pub data: Bytes,
    pub length: u32,
    pub t_remote_sent: Timespec,
    pub t_received: Timespec,
    pub fd: Option<AncillaryFd>,
}

/// A packet whose buffer ownership was transferred out of the pool.
/// Dropping it deallocates the buffer.
#[derive(Default, Debug)]
pub struct OwnedPacket {
    pub data: Bytes,
    pub length: u32,
    pub t_remote_sent: Timespec,
    pub t_received: Timespec,
    pub fd: Option<AncillaryFd>,
}

#[derive(Default, Debug)]
struct Slot {
    /// None once the buffer has been moved out; length survives so the
    /// later release can still return the credit.
    data: Option<Bytes>,
    length: u32,
    t_remote_sent: Timespec,
    t_received: Timespec,
    fd: Option<AncillaryFd>,
}

/// Fixed ring of packet slots with three cursors:
/// `first_free` is where the producer writes, `first_unused` is the oldest
/// packet not yet handed to a reader, `first_blocked` is the oldest packet
/// handed out but not yet released.
pub(crate) struct PacketPool {
    slots: Vec<Slot>,
    first_free: usize,
    first_unused: usize,
    first_blocked: usize,
    available: usize,
    blocked: usize,
}

impl Default for PacketPool {
    fn default() -> Self {
        PacketPool::new()
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("first_free", &self.first_free)
            .field("first_unused", &self.first_unused)
            .field("first_blocked", &self.first_blocked)
            .field("available", &self.available)
            .field("blocked", &self.blocked)
            .finish()
    }
}

fn circular_increment(i: usize) -> usize {
    (i + 1) % MAX_PACKETS_PER_STREAM
}

fn circular_decrement(i: usize) -> usize {
    (i + MAX_PACKETS_PER_STREAM - 1) % MAX_PACKETS_PER_STREAM
}

impl PacketPool {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PACKETS_PER_STREAM);
        slots.resize_with(MAX_PACKETS_PER_STREAM, Slot::default);
        PacketPool {
            slots,
            first_free: 0,
            first_unused: 0,
            first_blocked: 0,
            available: 0,
            blocked: 0,
        }
    }

    pub(crate) fn available_packets(&self) -> usize {
        self.available
    }

    pub(crate) fn blocked_packets(&self) -> usize {
        self.blocked
    }

    /// Stores an incoming packet at `first_free`.
    pub(crate) fn push(
        &mut self,
        data: Bytes,
        fd: Option<AncillaryFd>,
        t_remote_sent: Timespec,
        t_received: Timespec,
    ) -> Result<()> {
        if self.available + self.blocked >= MAX_PACKETS_PER_STREAM {
            return Err(Error::ErrPacketPoolFull);
        }
        let slot = &mut self.slots[self.first_free];
        slot.length = data.len() as u32;
        slot.data = Some(data);
        slot.fd = fd;
        slot.t_remote_sent = t_remote_sent;
        slot.t_received = t_received;
        self.first_free = circular_increment(self.first_free);
        self.available += 1;
        Ok(())
    }

    /// Hands out the oldest unused packet; the pool keeps buffer ownership.
    pub(crate) fn peek_next(&mut self) -> Option<PacketDesc> {
        if self.available == 0 {
            return None;
        }
        let slot = &self.slots[self.first_unused];
        let desc = PacketDesc {
            data: slot.data.clone().unwrap_or_default(),
            length: slot.length,
            t_remote_sent: slot.t_remote_sent,
            t_received: slot.t_received,
            fd: slot.fd,
        };
        self.available -= 1;
        self.first_unused = circular_increment(self.first_unused);
        self.blocked += 1;
        Some(desc)
    }

    /// Hands out the oldest unused packet and transfers buffer ownership to
    /// the caller. The slot keeps the length so that the subsequent release
    /// frees the equivalent credit.
    pub(crate) fn move_next(&mut self) -> Option<OwnedPacket> {
        if self.available == 0 {
            return None;
        }
        let slot = &mut self.slots[self.first_unused];
        let packet = OwnedPacket {
            data: slot.data.take().unwrap_or_default(),
            length: slot.length,
            t_remote_sent: slot.t_remote_sent,
            t_received: slot.t_received,
            fd: slot.fd.take(),
        };
        self.available -= 1;
        self.first_unused = circular_increment(self.first_unused);
        self.blocked += 1;
        Some(packet)
    }

    /// Releases the packet at the head of the handed-out region and returns
    /// the released byte count, or None when there is nothing to release.
    pub(crate) fn release_front(&mut self) -> Option<u32> {
        if self.blocked == 0 {
            return None;
        }
        let slot = &mut self.slots[self.first_blocked];
        let released = slot.length;
        slot.data = None;
        slot.length = 0;
        slot.fd = None;
        self.first_blocked = circular_increment(self.first_blocked);
        self.blocked -= 1;
        Some(released)
    }

    /// Releases the handed-out packet whose buffer starts at `ptr` and
    /// compacts the region `[first_blocked .. first_free)` by shifting later
    /// slots down by one. Moved-out packets no longer have a buffer and
    /// cannot be matched here; release them through `release_front`.
    pub(crate) fn release_specific(&mut self, ptr: usize) -> Result<u32> {
        if self.blocked == 0 {
            return Err(Error::ErrNoPacketToRelease);
        }

        let mut index = self.first_blocked;
        let mut found = false;
        while index != self.first_unused {
            if let Some(data) = &self.slots[index].data {
                if data.as_ptr() as usize == ptr {
                    found = true;
                    break;
                }
            }
            index = circular_increment(index);
        }
        if !found {
            return Err(Error::ErrNoSuchPacket);
        }

        let released = self.slots[index].length;
        self.slots[index].data = None;
        self.slots[index].fd = None;
        self.blocked -= 1;

        if index != self.first_blocked {
            let mut curr = index;
            let mut next = circular_increment(curr);
            while curr != self.first_free {
                self.slots.swap(curr, next);
                curr = next;
                next = circular_increment(next);
            }
            self.first_unused = circular_decrement(self.first_unused);
            self.first_free = circular_decrement(self.first_free);
        } else {
            self.first_blocked = circular_increment(self.first_blocked);
        }

        Ok(released)
    }

    /// Drains every packet still in the pool; used on link teardown.
    pub(crate) fn drain(&mut self) -> u32 {
        let mut total = 0;
        while self.peek_next().is_some() || self.blocked > 0 {
            if let Some(released) = self.release_front() {
                total += released;
            }
        }
        total
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(len: usize, tag: u8) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    #[test]
    fn test_push_peek_release() -> Result<()> {
        let mut pool = PacketPool::new();
        pool.push(packet(8, 1), None, Timespec::default(), Timespec::default())?;
        pool.push(packet(16, 2), None, Timespec::default(), Timespec::default())?;
        assert_eq!(pool.available_packets(), 2);

        let first = pool.peek_next().expect("first packet");
        assert_eq!(first.length, 8);
        assert_eq!(first.data[0], 1);
        assert_eq!(pool.available_packets(), 1);
        assert_eq!(pool.blocked_packets(), 1);

        assert_eq!(pool.release_front(), Some(8));
        assert_eq!(pool.blocked_packets(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_capacity() -> Result<()> {
        let mut pool = PacketPool::new();
        for i in 0..MAX_PACKETS_PER_STREAM {
            pool.push(
                packet(4, i as u8),
                None,
                Timespec::default(),
                Timespec::default(),
            )?;
        }
        assert_eq!(
            pool.push(packet(4, 0), None, Timespec::default(), Timespec::default()),
            Err(Error::ErrPacketPoolFull)
        );

        // one handed out but unreleased packet still counts against capacity
        pool.peek_next().expect("peek");
        assert_eq!(
            pool.push(packet(4, 0), None, Timespec::default(), Timespec::default()),
            Err(Error::ErrPacketPoolFull)
        );

        pool.release_front().expect("release");
        pool.push(packet(4, 0), None, Timespec::default(), Timespec::default())?;
        Ok(())
    }

    #[test]
    fn test_move_keeps_length_for_release() -> Result<()> {
        let mut pool = PacketPool::new();
        pool.push(packet(32, 7), None, Timespec::default(), Timespec::default())?;

        let moved = pool.move_next().expect("moved packet");
        assert_eq!(moved.length, 32);
        assert_eq!(moved.data.len(), 32);

        // buffer is gone from the slot but the credit is still released
        assert_eq!(pool.release_front(), Some(32));
        Ok(())
    }

    #[test]
    fn test_release_specific_compacts() -> Result<()> {
        let mut pool = PacketPool::new();
        for i in 0..4u8 {
            pool.push(
                packet(8 + i as usize, i),
                None,
                Timespec::default(),
                Timespec::default(),
            )?;
        }
        let _a = pool.peek_next().expect("a");
        let b = pool.peek_next().expect("b");
        let _c = pool.peek_next().expect("c");
        assert_eq!(pool.blocked_packets(), 3);

        // release the middle packet by pointer
        let released = pool.release_specific(b.data.as_ptr() as usize)?;
        assert_eq!(released, 9);
        assert_eq!(pool.blocked_packets(), 2);

        // remaining order is preserved: a, then c
        assert_eq!(pool.release_front(), Some(8));
        assert_eq!(pool.release_front(), Some(10));
        assert_eq!(pool.release_front(), None);

        // the unread packet survived compaction
        let d = pool.peek_next().expect("d");
        assert_eq!(d.length, 11);
        Ok(())
    }

    #[test]
    fn test_release_specific_unknown_ptr() -> Result<()> {
        let mut pool = PacketPool::new();
        pool.push(packet(8, 1), None, Timespec::default(), Timespec::default())?;
        pool.peek_next().expect("peek");
        assert_eq!(pool.release_specific(0xdead), Err(Error::ErrNoSuchPacket));
        Ok(())
    }

    #[test]
    fn test_drain() -> Result<()> {
        let mut pool = PacketPool::new();
        for i in 0..5u8 {
            pool.push(packet(10, i), None, Timespec::default(), Timespec::default())?;
        }
        pool.peek_next().expect("peek");
        assert_eq!(pool.drain(), 50);
        assert_eq!(pool.available_packets(), 0);
        assert_eq!(pool.blocked_packets(), 0);
        Ok(())
    }
}
