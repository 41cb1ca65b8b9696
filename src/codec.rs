use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::event::{Event, EventFlags, EventHeader, EventType, MAX_STREAM_NAME_LENGTH};
use crate::pool::AncillaryFd;
use crate::transport::Transport;

/// Fixed wire event header, little-endian:
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0      | 4    | id |
/// | 4      | 1+3  | type, padding |
/// | 8      | 40   | stream_name (NUL-terminated, zero-padded) |
/// | 48     | 4    | stream_id |
/// | 52     | 4    | size |
/// | 56     | 2+2  | flags, padding |
/// | 60     | 4    | t_nsec |
/// | 64     | 4    | t_sec_lsb |
/// | 68     | 4    | t_sec_msb |
///
/// The payload immediately follows for write events, `size` bytes long.
pub(crate) const EVENT_HEADER_SIZE: usize = 72;

pub(crate) fn marshal_header(header: &EventHeader) -> Result<BytesMut> {
    if header.stream_name.len() >= MAX_STREAM_NAME_LENGTH {
        return Err(Error::ErrStreamNameTooLong);
    }
    if !header.stream_name.is_ascii() {
        return Err(Error::ErrStreamNameNotAscii);
    }

    let mut writer = BytesMut::with_capacity(EVENT_HEADER_SIZE);
    writer.put_u32_le(header.id);
    writer.put_u8(header.typ as u8);
    writer.put_bytes(0, 3);

    writer.put_slice(header.stream_name.as_bytes());
    writer.put_bytes(0, MAX_STREAM_NAME_LENGTH - header.stream_name.len());

    writer.put_u32_le(header.stream_id);
    writer.put_u32_le(header.size);
    writer.put_u16_le(header.flags.0);
    writer.put_bytes(0, 2);
    writer.put_u32_le(header.t_nsec);
    writer.put_u32_le(header.t_sec_lsb);
    writer.put_u32_le(header.t_sec_msb);

    Ok(writer)
}

pub(crate) fn unmarshal_header(raw: &Bytes) -> Result<EventHeader> {
    if raw.len() < EVENT_HEADER_SIZE {
        return Err(Error::ErrEventHeaderTooSmall);
    }

    let reader = &mut raw.clone();
    let id = reader.get_u32_le();
    let typ = EventType::try_from(reader.get_u8())?;
    reader.advance(3);

    let mut name_bytes = [0u8; MAX_STREAM_NAME_LENGTH];
    reader.copy_to_slice(&mut name_bytes);
    let name_len = name_bytes
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(MAX_STREAM_NAME_LENGTH);
    let stream_name = std::str::from_utf8(&name_bytes[..name_len])
        .map_err(|_| Error::ErrStreamNameNotAscii)?
        .to_owned();
    if !stream_name.is_ascii() {
        return Err(Error::ErrStreamNameNotAscii);
    }

    let stream_id = reader.get_u32_le();
    let size = reader.get_u32_le();
    let flags = EventFlags(reader.get_u16_le());
    reader.advance(2);
    let t_nsec = reader.get_u32_le();
    let t_sec_lsb = reader.get_u32_le();
    let t_sec_msb = reader.get_u32_le();

    Ok(EventHeader {
        id,
        typ,
        stream_name,
        stream_id,
        size,
        flags,
        t_nsec,
        t_sec_lsb,
        t_sec_msb,
    })
}

/// Encodes the header and, for write events, the payload, onto the
/// transport. A failure here is link-fatal for the caller.
pub(crate) async fn write_event(transport: &(dyn Transport + Send + Sync), event: &Event) -> Result<()> {
    let header = marshal_header(&event.header)?;
    transport.send(&header).await?;

    if event.header.typ.carries_payload() {
        let data = event.data.as_deref().unwrap_or(&[]);
        write_multipart(transport, data, event.data2.as_deref()).await?;
    }

    Ok(())
}

/// Writes a payload given as one or two fragments. When the transport
/// requires aligned transfers and a second fragment follows, the trailing
/// sub-alignment remainder of the first fragment is stitched together with
/// the head of the second through a bounce buffer, so every transfer except
/// the last lands on the alignment boundary and the peer sees a single
/// logical payload.
pub(crate) async fn write_multipart(
    transport: &(dyn Transport + Send + Sync),
    data: &[u8],
    data2: Option<&[u8]>,
) -> Result<()> {
    let alignment = transport.write_alignment().max(1);
    let data2 = match data2 {
        Some(d2) if !d2.is_empty() => d2,
        _ => {
            if !data.is_empty() {
                transport.send(data).await?;
            }
            return Ok(());
        }
    };

    if alignment == 1 {
        if !data.is_empty() {
            transport.send(data).await?;
        }
        transport.send(data2).await?;
        return Ok(());
    }

    let aligned = data.len() - data.len() % alignment;
    if aligned > 0 {
        transport.send(&data[..aligned]).await?;
    }

    let tail = &data[aligned..];
    let mut consumed2 = 0;
    if !tail.is_empty() {
        let take = std::cmp::min(alignment - tail.len(), data2.len());
        let mut bounce = Vec::with_capacity(tail.len() + take);
        bounce.extend_from_slice(tail);
        bounce.extend_from_slice(&data2[..take]);
        transport.send(&bounce).await?;
        consumed2 = take;
    }

    if consumed2 < data2.len() {
        transport.send(&data2[consumed2..]).await?;
    }

    Ok(())
}

/// Reads exactly one event header.
pub(crate) async fn read_header(transport: &(dyn Transport + Send + Sync)) -> Result<EventHeader> {
    let mut raw = vec![0u8; EVENT_HEADER_SIZE];
    transport.recv_exact(&mut raw).await?;
    unmarshal_header(&Bytes::from(raw))
}

/// Reads the `size`-byte payload following a write event's header.
pub(crate) async fn read_payload(
    transport: &(dyn Transport + Send + Sync),
    size: u32,
) -> Result<(Bytes, Option<AncillaryFd>)> {
    let mut raw = vec![0u8; size as usize];
    let fd = transport.recv_exact(&mut raw).await?;
    Ok((Bytes::from(raw), fd))
}
