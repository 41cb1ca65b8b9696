use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::link::Link;

/// Process-wide bound on simultaneously open links.
pub const MAX_LINKS: usize = 32;

/// Opaque link identifier, unique while its link is alive.
pub type LinkId = u8;

pub const INVALID_LINK_ID: LinkId = 0xFF;

/// Identifier returned by [`add_link_down_callback`].
pub type CallbackId = usize;

/// Called with the link id when a link goes down; runs off the dispatcher,
/// so it may call back into the API.
pub type LinkDownCallback = Arc<dyn Fn(LinkId) + Send + Sync>;

enum LinkSlot {
    Free,
    /// Id handed out, link still handshaking.
    Reserved,
    Active(Arc<Link>),
}

lazy_static! {
    static ref LINKS: Mutex<Vec<LinkSlot>> = {
        let mut slots = Vec::with_capacity(MAX_LINKS);
        slots.resize_with(MAX_LINKS, || LinkSlot::Free);
        Mutex::new(slots)
    };
    static ref CALLBACKS: Mutex<Vec<Option<LinkDownCallback>>> = Mutex::new(vec![]);
}

/// Claims a free slot and returns its link id.
pub(crate) fn reserve_slot() -> Result<LinkId> {
    let mut links = LINKS.lock().unwrap();
    for (idx, slot) in links.iter_mut().enumerate() {
        if matches!(slot, LinkSlot::Free) {
            *slot = LinkSlot::Reserved;
            return Ok(idx as LinkId);
        }
    }
    Err(Error::ErrLinkTableFull)
}

/// Publishes a handshaken link under its reserved id.
pub(crate) fn install(id: LinkId, link: Arc<Link>) {
    let mut links = LINKS.lock().unwrap();
    if let Some(slot) = links.get_mut(id as usize) {
        *slot = LinkSlot::Active(link);
    }
}

/// Returns a reserved slot that never handshook.
pub(crate) fn release_slot(id: LinkId) {
    let mut links = LINKS.lock().unwrap();
    if let Some(slot) = links.get_mut(id as usize) {
        *slot = LinkSlot::Free;
    }
}

/// Looks up an active link. Lock is held only for the clone.
pub fn get(id: LinkId) -> Option<Arc<Link>> {
    let links = LINKS.lock().unwrap();
    match links.get(id as usize) {
        Some(LinkSlot::Active(link)) => Some(Arc::clone(link)),
        _ => None,
    }
}

/// Snapshot of every active link.
pub fn active_links() -> Vec<Arc<Link>> {
    let links = LINKS.lock().unwrap();
    links
        .iter()
        .filter_map(|slot| match slot {
            LinkSlot::Active(link) => Some(Arc::clone(link)),
            _ => None,
        })
        .collect()
}

/// Registers a callback invoked once whenever a link goes down.
pub fn add_link_down_callback(callback: LinkDownCallback) -> CallbackId {
    let mut callbacks = CALLBACKS.lock().unwrap();
    for (idx, entry) in callbacks.iter_mut().enumerate() {
        if entry.is_none() {
            *entry = Some(callback);
            return idx;
        }
    }
    callbacks.push(Some(callback));
    callbacks.len() - 1
}

pub fn remove_link_down_callback(id: CallbackId) -> bool {
    let mut callbacks = CALLBACKS.lock().unwrap();
    match callbacks.get_mut(id) {
        Some(entry @ Some(_)) => {
            *entry = None;
            true
        }
        _ => false,
    }
}

/// Frees the dead link's slot and fans the notification out to the
/// registered callbacks. Invoked exactly once per link by the dispatcher's
/// idempotent teardown; callbacks run on their own task so they may call
/// back into the API without deadlocking against the dispatcher.
pub(crate) fn handle_link_down(id: LinkId) {
    release_slot(id);

    let callbacks: Vec<LinkDownCallback> = {
        let list = CALLBACKS.lock().unwrap();
        list.iter().flatten().cloned().collect()
    };
    if callbacks.is_empty() {
        return;
    }

    let fire = move || {
        for callback in callbacks {
            callback(id);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { fire() });
        }
        Err(_) => fire(),
    }
}
