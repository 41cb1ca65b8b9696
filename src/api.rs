//! Handle-based public surface.
//!
//! These functions mirror the classic host API: links are addressed by
//! [`LinkId`], streams by a combined [`StreamHandle`], and everything is
//! routed through the process-wide link registry. [`crate::link::Link`]
//! offers the same operations on an owned object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::discovery::{self, DeviceDesc, DeviceDiscovery, DeviceFilter};
use crate::error::{Error, Result};
use crate::link::{Config, Link};
use crate::pool::{OwnedPacket, PacketDesc};
use crate::registry::{self, CallbackId, LinkDownCallback, LinkId};
use crate::stream::FillSide;

/// Public stream handle: low 24 bits stream id on the link, high 8 bits
/// link id.
pub type StreamHandle = u32;

const STREAM_ID_MASK: u32 = 0x00FF_FFFF;

/// Options consumed once by [`initialize`].
#[derive(Default)]
pub struct InitOptions {
    /// Device enumeration backends for the find functions.
    pub discovery: Vec<Arc<dyn DeviceDiscovery>>,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Process-global initialisation; idempotent, later calls are no-ops.
pub fn initialize(options: InitOptions) -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    for provider in options.discovery {
        discovery::register_provider(provider);
    }
    Ok(())
}

fn combine_ids(link_id: LinkId, stream_id: u32) -> StreamHandle {
    ((link_id as u32) << 24) | (stream_id & STREAM_ID_MASK)
}

fn split_handle(handle: StreamHandle) -> (LinkId, u32) {
    ((handle >> 24) as LinkId, handle & STREAM_ID_MASK)
}

fn link_by_id(id: LinkId) -> Result<Arc<Link>> {
    registry::get(id).ok_or(Error::ErrCommunicationNotOpen)
}

fn link_by_handle(handle: StreamHandle) -> Result<(Arc<Link>, u32)> {
    let (link_id, stream_id) = split_handle(handle);
    Ok((link_by_id(link_id)?, stream_id))
}

/// Opens the client side of a link over an established transport.
pub async fn connect(config: Config) -> Result<LinkId> {
    let link = Link::connect(config).await?;
    Ok(link.id())
}

/// Serves the peer side of a link over an established transport.
pub async fn server(config: Config) -> Result<LinkId> {
    let link = Link::serve(config).await?;
    Ok(link.id())
}

/// Opens a named stream on the link; `write_size` is the peer-side buffer
/// backing this side's writes.
pub async fn open_stream(link: LinkId, name: &str, write_size: u32) -> Result<StreamHandle> {
    let l = link_by_id(link)?;
    let stream_id = l.open_stream(name, write_size).await?;
    Ok(combine_ids(link, stream_id))
}

/// Closes this side's write half of the stream, blocking until the peer
/// has drained everything outstanding.
pub async fn close_stream(handle: StreamHandle) -> Result<()> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.close_stream(stream_id).await
}

/// Sends one packet, blocking while the peer's buffer is full.
pub async fn write_data(handle: StreamHandle, data: &Bytes) -> Result<()> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.write(stream_id, data.clone(), None).await
}

/// Timed write; `ErrTimeout` leaves the link healthy.
pub async fn write_data_with_timeout(
    handle: StreamHandle,
    data: &Bytes,
    timeout_ms: u32,
) -> Result<()> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.write(stream_id, data.clone(), Some(timeout_ms)).await
}

/// Sends `data` immediately followed by `data2` as a single packet.
pub async fn write_data2(handle: StreamHandle, data: &Bytes, data2: &Bytes) -> Result<()> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.write2(stream_id, data.clone(), data2.clone()).await
}

/// Receives the next packet; ownership stays with the stream until
/// [`release_data`].
pub async fn read_data(handle: StreamHandle) -> Result<PacketDesc> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.read(stream_id, None).await
}

/// Timed read; a zero timeout never blocks.
pub async fn read_data_with_timeout(handle: StreamHandle, timeout_ms: u32) -> Result<PacketDesc> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.read(stream_id, Some(timeout_ms)).await
}

/// Receives the next packet with buffer ownership moved to the caller;
/// the flow-control credit is returned immediately, deallocation is the
/// caller's (drop's) job.
pub async fn read_move_data(handle: StreamHandle) -> Result<OwnedPacket> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.read_move(stream_id, None).await
}

/// Deallocates a packet obtained through [`read_move_data`]. Must not be
/// combined with [`release_data`] for the same packet.
pub fn deallocate_move_data(packet: OwnedPacket) {
    drop(packet);
}

/// Releases the oldest unreleased packet back to the peer.
pub async fn release_data(handle: StreamHandle) -> Result<()> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.release(stream_id).await
}

/// Releases the specific packet described by `packet`.
pub async fn release_specific_data(handle: StreamHandle, packet: &PacketDesc) -> Result<()> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.release_specific(stream_id, packet).await
}

/// Occupancy of the stream's buffer on the given side.
pub async fn get_fill_level(handle: StreamHandle, side: FillSide) -> Result<u32> {
    let (link, stream_id) = link_by_handle(handle)?;
    link.fill_level(stream_id, side).await
}

/// Cooperative reset of one link. Returns within the timeout regardless of
/// peer behaviour; the link id is invalid afterwards.
pub async fn reset_remote(link: LinkId, timeout_ms: u32) -> Result<()> {
    let l = link_by_id(link)?;
    l.reset(Some(timeout_ms)).await
}

/// Resets every live link.
pub async fn reset_all() -> Result<()> {
    const RESET_ALL_TIMEOUT_MS: u32 = 2000;
    for link in registry::active_links() {
        if let Err(err) = link.reset(Some(RESET_ALL_TIMEOUT_MS)).await {
            log::warn!("failed to reset link {}: {err}", link.id());
        }
    }
    Ok(())
}

/// Registers a callback fired once whenever a link goes down.
pub fn add_link_down_callback(callback: LinkDownCallback) -> CallbackId {
    registry::add_link_down_callback(callback)
}

pub fn remove_link_down_callback(id: CallbackId) -> bool {
    registry::remove_link_down_callback(id)
}

/// Every reachable device matching the filter.
pub fn find_all_suitable_devices(filter: &DeviceFilter) -> Result<Vec<DeviceDesc>> {
    discovery::find_all_suitable_devices(filter)
}

/// First reachable device matching the filter.
pub fn find_first_suitable_device(filter: &DeviceFilter) -> Result<DeviceDesc> {
    discovery::find_first_suitable_device(filter)
}
