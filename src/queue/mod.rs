#[cfg(test)]
mod queue_test;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::event::{
    Event, EventOrigin, EventResult, EventType, FLAG_CAN_NOT_BE_SERVED, FLAG_DROPPED,
};
use crate::pool::OwnedPacket;

/// Pending events per direction per dispatcher.
pub(crate) const MAX_EVENTS: usize = 64;

/// Lifecycle of an event inside the dispatcher queue.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EventState {
    /// Slot is free.
    #[default]
    Served,
    /// Just enqueued, not yet classified.
    Allocated,
    /// Local request sent, awaiting the peer's response.
    Pending,
    /// Held because a resource is not available.
    Blocked,
    /// Un-blocked, to be retried ahead of fresh work.
    Ready,
    /// Abandoned by its caller; the late response only reclaims the slot.
    Dropped,
}

pub(crate) struct EventSlot {
    pub(crate) state: EventState,
    pub(crate) origin: EventOrigin,
    pub(crate) event: Event,
    completer: Option<oneshot::Sender<EventResult>>,
}

impl Default for EventSlot {
    fn default() -> Self {
        EventSlot {
            state: EventState::Served,
            origin: EventOrigin::Local,
            event: Event::default(),
            completer: None,
        }
    }
}

/// Bounded ring of pending events with state tags. One instance per
/// direction (local, remote) per dispatcher; the dispatcher's mutex guards
/// all access.
pub(crate) struct EventQueue {
    slots: Vec<EventSlot>,
    /// Insertion scan cursor.
    cur: usize,
    /// Processing scan cursor.
    cur_proc: usize,
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_EVENTS);
        slots.resize_with(MAX_EVENTS, EventSlot::default);
        EventQueue {
            slots,
            cur: 0,
            cur_proc: 0,
        }
    }

    fn scan_from(&self, start: usize, state: EventState) -> Option<usize> {
        for offset in 0..MAX_EVENTS {
            let idx = (start + offset) % MAX_EVENTS;
            if self.slots[idx].state == state {
                return Some(idx);
            }
        }
        None
    }

    /// Writes `event` into the first free slot ahead of the insertion
    /// cursor and tags it `Allocated`.
    pub(crate) fn enqueue(
        &mut self,
        event: Event,
        origin: EventOrigin,
        completer: Option<oneshot::Sender<EventResult>>,
    ) -> Result<usize> {
        let idx = self
            .scan_from(self.cur, EventState::Served)
            .ok_or(Error::ErrEventQueueFull)?;
        let slot = &mut self.slots[idx];
        slot.event = event;
        slot.origin = origin;
        slot.completer = completer;
        slot.state = EventState::Allocated;
        self.cur = (idx + 1) % MAX_EVENTS;
        Ok(idx)
    }

    /// Returns the next `Allocated` slot in processing order.
    pub(crate) fn next_to_process(&mut self) -> Option<usize> {
        let idx = self.scan_from(self.cur_proc, EventState::Allocated)?;
        self.cur_proc = (idx + 1) % MAX_EVENTS;
        Some(idx)
    }

    /// First previously-blocked slot that has been released for retry.
    pub(crate) fn search_ready(&self) -> Option<usize> {
        self.scan_from(0, EventState::Ready)
    }

    pub(crate) fn slot(&mut self, idx: usize) -> &mut EventSlot {
        &mut self.slots[idx]
    }

    pub(crate) fn slot_ref(&self, idx: usize) -> &EventSlot {
        &self.slots[idx]
    }

    /// Completes the caller (unless the event was dropped) and frees the
    /// slot.
    pub(crate) fn post_and_mark_served(
        &mut self,
        idx: usize,
        packet: Option<OwnedPacket>,
        error: Option<Error>,
    ) {
        let slot = &mut self.slots[idx];
        if let Some(completer) = slot.completer.take() {
            if slot.state != EventState::Dropped {
                let _ = completer.send(EventResult {
                    header: slot.event.header.clone(),
                    packet,
                    error,
                });
            }
        }
        slot.event.data = None;
        slot.event.data2 = None;
        slot.state = EventState::Served;
    }

    fn matches(slot: &EventSlot, id: Option<u32>, typ: EventType, stream_id: u32) -> bool {
        id.map_or(true, |id| slot.event.header.id == id)
            && slot.event.header.typ == typ
            && slot.event.header.stream_id == stream_id
    }

    /// Flips the first matching `Blocked` slot to `Ready`.
    pub(crate) fn unblock(&mut self, id: Option<u32>, typ: EventType, stream_id: u32) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.state == EventState::Blocked && Self::matches(slot, id, typ, stream_id) {
                log::debug!("unblocked {} id={}", slot.event.header.typ, slot.event.header.id);
                slot.state = EventState::Ready;
                return true;
            }
        }
        false
    }

    /// Marks the first matching slot served without posting its completer;
    /// used when the caller abandons a local read.
    pub(crate) fn serve(&mut self, id: Option<u32>, typ: EventType, stream_id: u32) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.state != EventState::Served && Self::matches(slot, id, typ, stream_id) {
                slot.completer = None;
                slot.event.data = None;
                slot.event.data2 = None;
                slot.state = EventState::Served;
                return true;
            }
        }
        false
    }

    /// Caller-abandonment for writes: a blocked write never reached the
    /// wire and is served in place; a pending one already did, so it
    /// converts to `Dropped` and waits for its response to reclaim the slot
    /// (and the flow-control credit).
    pub(crate) fn serve_or_drop(&mut self, id: Option<u32>, typ: EventType, stream_id: u32) {
        for slot in self.slots.iter_mut() {
            if slot.state == EventState::Served || !Self::matches(slot, id, typ, stream_id) {
                continue;
            }
            match typ {
                EventType::ReadReq => {
                    slot.event.header.flags.clear(FLAG_DROPPED);
                    slot.event.header.flags.clear(FLAG_CAN_NOT_BE_SERVED);
                    slot.completer = None;
                    slot.state = EventState::Served;
                }
                EventType::WriteReq | EventType::WriteFdReq => {
                    if slot.state == EventState::Blocked {
                        slot.event.header.flags.clear(FLAG_DROPPED);
                        slot.event.header.flags.clear(FLAG_CAN_NOT_BE_SERVED);
                        slot.completer = None;
                        slot.event.data = None;
                        slot.event.data2 = None;
                        slot.state = EventState::Served;
                    } else {
                        slot.event.header.flags.set(FLAG_DROPPED);
                        slot.event.header.flags.clear(FLAG_CAN_NOT_BE_SERVED);
                        slot.completer = None;
                        slot.state = EventState::Dropped;
                    }
                }
                _ => {}
            }
            return;
        }
    }

    /// Locates the local request a response answers: a `Pending` or
    /// `Dropped` slot with the same id whose type is the response's request.
    pub(crate) fn find_response_target(&self, id: u32, resp: EventType) -> Option<usize> {
        let req = resp.request();
        self.slots.iter().position(|slot| {
            (slot.state == EventState::Pending || slot.state == EventState::Dropped)
                && slot.event.header.id == id
                && slot.event.header.typ == req
        })
    }

    /// Completes every slot currently in `state` with `error`; used during
    /// link teardown so no caller is left hanging.
    pub(crate) fn free_with_state(&mut self, state: EventState, error: Error) -> usize {
        let mut freed = 0;
        for idx in 0..MAX_EVENTS {
            if self.slots[idx].state == state {
                self.post_and_mark_served(idx, None, Some(error.clone()));
                freed += 1;
            }
        }
        freed
    }

    #[cfg(test)]
    pub(crate) fn count_state(&self, state: EventState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }
}
