use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::pool::OwnedPacket;

/// Widest stream name the fixed wire header can carry, terminator included.
pub const MAX_STREAM_NAME_LENGTH: usize = 40;

pub(crate) const INVALID_STREAM_ID: u32 = 0xDEAD_DEAD;
pub(crate) const INVALID_STREAM_ID_OUT_OF_MEMORY: u32 = 0xDEAD_FFFF;

/// Event types on the wire. Each request has exactly one response type,
/// `resp = req + REQUEST_LAST + 1`.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum EventType {
    #[default]
    WriteReq = 0,
    WriteFdReq = 1,
    ReadReq = 2,
    ReadRelReq = 3,
    ReadRelSpecReq = 4,
    CreateStreamReq = 5,
    CloseStreamReq = 6,
    PingReq = 7,
    ResetReq = 8,

    WriteResp = 10,
    WriteFdResp = 11,
    ReadResp = 12,
    ReadRelResp = 13,
    ReadRelSpecResp = 14,
    CreateStreamResp = 15,
    CloseStreamResp = 16,
    PingResp = 17,
    ResetResp = 18,
}

pub(crate) const REQUEST_LAST: u8 = 9;

impl EventType {
    pub(crate) fn is_request(self) -> bool {
        (self as u8) < REQUEST_LAST
    }

    /// The response type answering this request.
    pub(crate) fn response(self) -> EventType {
        EventType::try_from(self as u8 + REQUEST_LAST + 1).unwrap_or(EventType::WriteResp)
    }

    /// The request type this response answers.
    pub(crate) fn request(self) -> EventType {
        EventType::try_from((self as u8).wrapping_sub(REQUEST_LAST + 1))
            .unwrap_or(EventType::WriteReq)
    }

    pub(crate) fn carries_payload(self) -> bool {
        matches!(self, EventType::WriteReq | EventType::WriteFdReq)
    }
}

impl TryFrom<u8> for EventType {
    type Error = crate::error::Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(EventType::WriteReq),
            1 => Ok(EventType::WriteFdReq),
            2 => Ok(EventType::ReadReq),
            3 => Ok(EventType::ReadRelReq),
            4 => Ok(EventType::ReadRelSpecReq),
            5 => Ok(EventType::CreateStreamReq),
            6 => Ok(EventType::CloseStreamReq),
            7 => Ok(EventType::PingReq),
            8 => Ok(EventType::ResetReq),
            10 => Ok(EventType::WriteResp),
            11 => Ok(EventType::WriteFdResp),
            12 => Ok(EventType::ReadResp),
            13 => Ok(EventType::ReadRelResp),
            14 => Ok(EventType::ReadRelSpecResp),
            15 => Ok(EventType::CreateStreamResp),
            16 => Ok(EventType::CloseStreamResp),
            17 => Ok(EventType::PingResp),
            18 => Ok(EventType::ResetResp),
            _ => Err(crate::error::Error::ErrUnknownEventType),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            EventType::WriteReq => "WRITE_REQ",
            EventType::WriteFdReq => "WRITE_FD_REQ",
            EventType::ReadReq => "READ_REQ",
            EventType::ReadRelReq => "READ_REL_REQ",
            EventType::ReadRelSpecReq => "READ_REL_SPEC_REQ",
            EventType::CreateStreamReq => "CREATE_STREAM_REQ",
            EventType::CloseStreamReq => "CLOSE_STREAM_REQ",
            EventType::PingReq => "PING_REQ",
            EventType::ResetReq => "RESET_REQ",
            EventType::WriteResp => "WRITE_RESP",
            EventType::WriteFdResp => "WRITE_FD_RESP",
            EventType::ReadResp => "READ_RESP",
            EventType::ReadRelResp => "READ_REL_RESP",
            EventType::ReadRelSpecResp => "READ_REL_SPEC_RESP",
            EventType::CreateStreamResp => "CREATE_STREAM_RESP",
            EventType::CloseStreamResp => "CLOSE_STREAM_RESP",
            EventType::PingResp => "PING_RESP",
            EventType::ResetResp => "RESET_RESP",
        };
        write!(f, "{s}")
    }
}

pub(crate) const FLAG_ACK: u16 = 1;
pub(crate) const FLAG_NACK: u16 = 1 << 1;
pub(crate) const FLAG_BLOCK: u16 = 1 << 2;
pub(crate) const FLAG_LOCAL_SERVE: u16 = 1 << 3;
pub(crate) const FLAG_SIZE_TOO_BIG: u16 = 1 << 4;
pub(crate) const FLAG_NO_SUCH_STREAM: u16 = 1 << 5;
pub(crate) const FLAG_BUFFER_FULL: u16 = 1 << 6;
pub(crate) const FLAG_TERMINATE: u16 = 1 << 7;
pub(crate) const FLAG_MOVE_SEMANTIC: u16 = 1 << 8;
pub(crate) const FLAG_DROPPED: u16 = 1 << 9;
pub(crate) const FLAG_CAN_NOT_BE_SERVED: u16 = 1 << 10;

/// Bitfield carried in the event header.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct EventFlags(pub(crate) u16);

impl EventFlags {
    pub(crate) fn contains(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub(crate) fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub(crate) fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    /// ack=1, nack=0
    pub(crate) fn acknowledge(&mut self) {
        self.set(FLAG_ACK);
        self.clear(FLAG_NACK);
    }

    /// ack=0, nack=1
    pub(crate) fn not_acknowledge(&mut self) {
        self.clear(FLAG_ACK);
        self.set(FLAG_NACK);
    }

    pub(crate) fn ack(self) -> bool {
        self.contains(FLAG_ACK)
    }

    pub(crate) fn nack(self) -> bool {
        self.contains(FLAG_NACK)
    }
}

/// Monotonic timestamp split across the header's three time fields.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

impl Timespec {
    pub(crate) fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timespec {
            sec: d.as_secs(),
            nsec: d.subsec_nanos(),
        }
    }
}

/// Fixed-size event header; the canonical wire layout lives in the codec.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventHeader {
    pub(crate) id: u32,
    pub(crate) typ: EventType,
    pub(crate) stream_name: String,
    pub(crate) stream_id: u32,
    pub(crate) size: u32,
    pub(crate) flags: EventFlags,
    pub(crate) t_nsec: u32,
    pub(crate) t_sec_lsb: u32,
    pub(crate) t_sec_msb: u32,
}

impl EventHeader {
    pub(crate) fn stamp(&mut self, ts: Timespec) {
        self.t_sec_lsb = ts.sec as u32;
        self.t_sec_msb = (ts.sec >> 32) as u32;
        self.t_nsec = ts.nsec;
    }

    pub(crate) fn timestamp(&self) -> Timespec {
        Timespec {
            sec: self.t_sec_lsb as u64 | ((self.t_sec_msb as u64) << 32),
            nsec: self.t_nsec,
        }
    }
}

impl fmt::Display for EventHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} id={} stream={} size={} flags={:#x}",
            self.typ, self.id, self.stream_id, self.size, self.flags.0
        )
    }
}

/// Where an event entered the dispatcher from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EventOrigin {
    Local,
    Remote,
}

/// Unit of scheduler work: a request being issued locally, a request
/// received from the peer, or the response to a pending local request.
#[derive(Default, Debug, Clone)]
pub(crate) struct Event {
    pub(crate) header: EventHeader,
    /// Link the event was created against; misrouted events are NACKed.
    pub(crate) link_id: u8,
    /// Outbound payload for write requests.
    pub(crate) data: Option<Bytes>,
    /// Optional second payload half (scatter writes).
    pub(crate) data2: Option<Bytes>,
    /// Buffer address identifying the slot for a specific release.
    pub(crate) release_ptr: Option<usize>,
}

impl Event {
    pub(crate) fn new(typ: EventType, stream_id: u32, size: u32, link_id: u8) -> Self {
        Event {
            header: EventHeader {
                id: next_event_id(),
                typ,
                stream_id,
                size,
                ..Default::default()
            },
            link_id,
            ..Default::default()
        }
    }
}

/// Completion value posted back to the API caller when its event is served.
#[derive(Default, Debug)]
pub(crate) struct EventResult {
    pub(crate) header: EventHeader,
    pub(crate) packet: Option<OwnedPacket>,
    /// Takes precedence over the header flags when set.
    pub(crate) error: Option<crate::error::Error>,
}

static EVENT_ID: AtomicU32 = AtomicU32::new(0xa);

/// Global monotonic event id, wrapping back to 0xa at i32::MAX.
pub(crate) fn next_event_id() -> u32 {
    let id = EVENT_ID.fetch_add(1, Ordering::SeqCst);
    if id >= i32::MAX as u32 {
        EVENT_ID.store(0xa, Ordering::SeqCst);
        return 0xa;
    }
    id
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_response_pairing() {
        let reqs = [
            EventType::WriteReq,
            EventType::WriteFdReq,
            EventType::ReadReq,
            EventType::ReadRelReq,
            EventType::ReadRelSpecReq,
            EventType::CreateStreamReq,
            EventType::CloseStreamReq,
            EventType::PingReq,
            EventType::ResetReq,
        ];
        for req in reqs {
            let resp = req.response();
            assert!(!resp.is_request(), "{resp} classified as request");
            assert_eq!(resp as u8, req as u8 + REQUEST_LAST + 1);
            assert_eq!(resp.request(), req, "{resp} did not map back to {req}");
        }
    }

    #[test]
    fn test_flags() {
        let mut flags = EventFlags::default();
        flags.acknowledge();
        assert!(flags.ack() && !flags.nack());
        flags.not_acknowledge();
        assert!(!flags.ack() && flags.nack());
        flags.set(FLAG_BLOCK);
        flags.set(FLAG_LOCAL_SERVE);
        assert!(flags.contains(FLAG_BLOCK));
        flags.clear(FLAG_BLOCK);
        assert!(!flags.contains(FLAG_BLOCK));
        assert!(flags.contains(FLAG_LOCAL_SERVE));
    }

    #[test]
    fn test_header_timestamp_split() {
        let mut header = EventHeader::default();
        let ts = Timespec {
            sec: 0x1_2345_6789,
            nsec: 987_654_321,
        };
        header.stamp(ts);
        assert_eq!(header.t_sec_lsb, 0x2345_6789);
        assert_eq!(header.t_sec_msb, 0x1);
        assert_eq!(header.timestamp(), ts);
    }

    #[test]
    fn test_event_id_monotonic() {
        let a = next_event_id();
        let b = next_event_id();
        assert!(b > a || b == 0xa);
    }
}
