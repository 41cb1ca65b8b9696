use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use super::LinkState;
use crate::error::{Error, Result};
use crate::event::{
    Event, EventOrigin, EventResult, EventType, Timespec, FLAG_ACK, FLAG_BLOCK, FLAG_LOCAL_SERVE,
    FLAG_MOVE_SEMANTIC, FLAG_SIZE_TOO_BIG, INVALID_STREAM_ID, INVALID_STREAM_ID_OUT_OF_MEMORY,
};
use crate::pool::{AncillaryFd, OwnedPacket};
use crate::queue::{EventQueue, EventState};
use crate::registry;
use crate::stream::StreamTable;
use crate::transport::Transport;

/// Which side of the link this dispatcher drives. The client initiates
/// reset and owns stream-id assignment; the server accepts both.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// What the scheduler must put on the wire after a processing step.
pub(crate) enum Outbound {
    /// A local request already marked `Pending`.
    Request(Event),
    /// A synthesised response to a remote request; `then_reset` finishes
    /// the reset handshake after the send.
    Response { event: Event, then_reset: bool },
}

/// Per-link state machine: stream table, the two event queues, and the
/// request/response classification tables. Owned behind one tokio mutex;
/// the scheduler task, the reader task and API callers all funnel through
/// it, which also serialises packet-pool access per stream.
pub(crate) struct Dispatcher {
    pub(crate) name: String,
    pub(crate) link_id: u8,
    pub(crate) role: Role,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) streams: StreamTable,
    local_queue: EventQueue,
    remote_queue: EventQueue,
    /// Strict local/remote alternation bit.
    local_priority: bool,
    transport: Arc<dyn Transport + Send + Sync>,
    notify_tx: mpsc::Sender<()>,
    closed_tx: watch::Sender<bool>,
    ping_tx: Option<mpsc::Sender<()>>,
    max_stream_buffer_size: u32,
    /// Set once the reset handshake is finished on this side; the
    /// scheduler exits its loop and tears the link down.
    resetting: bool,
    /// Reset already ran; makes teardown idempotent.
    reset_done: bool,
    fd_down: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        link_id: u8,
        role: Role,
        state: Arc<AtomicU8>,
        transport: Arc<dyn Transport + Send + Sync>,
        notify_tx: mpsc::Sender<()>,
        closed_tx: watch::Sender<bool>,
        ping_tx: mpsc::Sender<()>,
        max_stream_buffer_size: u32,
    ) -> Self {
        Dispatcher {
            name,
            link_id,
            role,
            state,
            streams: StreamTable::new(),
            local_queue: EventQueue::new(),
            remote_queue: EventQueue::new(),
            local_priority: false,
            transport,
            notify_tx,
            closed_tx,
            ping_tx: Some(ping_tx),
            max_stream_buffer_size,
            resetting: false,
            reset_done: false,
            fd_down: false,
        }
    }

    pub(crate) fn link_state(&self) -> LinkState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_link_state(&self, new_state: LinkState) {
        let old_state = LinkState::from(self.state.swap(new_state as u8, Ordering::SeqCst));
        if old_state != new_state {
            log::debug!("[{}] state change: '{old_state}' => '{new_state}'", self.name);
        }
    }

    pub(crate) fn resetting(&self) -> bool {
        self.resetting
    }

    fn awake_scheduler(&self) {
        let _ = self.notify_tx.try_send(());
    }

    /// Appends a local event and hands back the completion channel.
    pub(crate) fn add_local_event(
        &mut self,
        event: Event,
    ) -> Result<oneshot::Receiver<EventResult>> {
        if self.reset_done {
            // nobody would ever complete it
            return Err(Error::ErrCommunicationNotOpen);
        }
        let (tx, rx) = oneshot::channel();
        self.local_queue
            .enqueue(event, EventOrigin::Local, Some(tx))?;
        self.awake_scheduler();
        Ok(rx)
    }

    /// Appends an event received from the peer.
    pub(crate) fn add_remote_event(&mut self, event: Event) {
        if let Err(err) = self.remote_queue.enqueue(event, EventOrigin::Remote, None) {
            log::error!("[{}] failed to enqueue remote event: {err}", self.name);
            return;
        }
        self.awake_scheduler();
    }

    /// Stores an inbound write payload into the receiving stream's pool.
    /// The reader thread already consumed the bytes off the wire.
    pub(crate) fn store_inbound_packet(
        &mut self,
        stream_id: u32,
        data: Bytes,
        fd: Option<AncillaryFd>,
        t_remote_sent: Timespec,
        t_received: Timespec,
    ) -> Result<()> {
        let size = data.len();
        let stream = self.streams.ensure_open(stream_id)?;
        stream.push_packet(data, fd, t_remote_sent, t_received)?;
        log::debug!(
            "[{}] S{stream_id}: got write of {size}, local fill level {} out of {}",
            self.name,
            stream.local_fill_level,
            stream.read_size
        );
        Ok(())
    }

    /// Abandonment hooks used by the timed API calls.
    pub(crate) fn serve_local_event(&mut self, id: u32, typ: EventType, stream_id: u32) {
        self.local_queue.serve(Some(id), typ, stream_id);
    }

    pub(crate) fn serve_or_drop_local_event(&mut self, id: u32, typ: EventType, stream_id: u32) {
        self.local_queue.serve_or_drop(Some(id), typ, stream_id);
    }

    /// Picks the next event to process: un-blocked local retries first,
    /// then the higher-priority queue, alternating local/remote every
    /// iteration so neither side starves.
    pub(crate) fn next_event(&mut self) -> Option<(EventOrigin, usize)> {
        if let Some(idx) = self.local_queue.search_ready() {
            return Some((EventOrigin::Local, idx));
        }

        let local_first = self.local_priority;
        self.local_priority = !self.local_priority;

        if local_first {
            if let Some(idx) = self.local_queue.next_to_process() {
                return Some((EventOrigin::Local, idx));
            }
            self.remote_queue
                .next_to_process()
                .map(|idx| (EventOrigin::Remote, idx))
        } else {
            if let Some(idx) = self.remote_queue.next_to_process() {
                return Some((EventOrigin::Remote, idx));
            }
            self.local_queue
                .next_to_process()
                .map(|idx| (EventOrigin::Local, idx))
        }
    }

    /// Classifies one event and applies its state transitions. Returns what
    /// must go on the wire afterwards; the scheduler performs the send
    /// outside the lock.
    pub(crate) fn process(&mut self, origin: EventOrigin, idx: usize) -> Option<Outbound> {
        match origin {
            EventOrigin::Local => self.process_local(idx),
            EventOrigin::Remote => self.process_remote(idx),
        }
    }

    fn process_local(&mut self, idx: usize) -> Option<Outbound> {
        let mut event = self.local_queue.slot(idx).event.clone();

        if event.link_id != self.link_id {
            log::error!(
                "[{}] link id mismatch between event and scheduler: {} != {}",
                self.name,
                event.link_id,
                self.link_id
            );
            event.header.flags.not_acknowledge();
            self.local_queue.slot(idx).event = event;
            self.local_queue
                .post_and_mark_served(idx, None, Some(Error::ErrEventMisrouted));
            return None;
        }

        let disposition = self.local_get_response(&mut event);
        self.local_queue.slot(idx).event = event.clone();

        // request serve: park, complete locally, or leave pending for the
        // peer's response
        let flags = event.header.flags;
        if flags.contains(FLAG_BLOCK) {
            self.local_queue.slot(idx).state = EventState::Blocked;
            return None;
        }
        if flags.contains(FLAG_LOCAL_SERVE) || (!flags.ack() && flags.nack()) {
            self.local_queue
                .post_and_mark_served(idx, disposition.packet, disposition.error);
            return None;
        }

        if !disposition.send {
            self.local_queue.post_and_mark_served(idx, None, disposition.error);
            return None;
        }

        self.local_queue.slot(idx).state = EventState::Pending;
        let mut outbound = event;
        outbound.header.stamp(Timespec::now());
        self.local_queue.slot(idx).event.header = outbound.header.clone();
        Some(Outbound::Request(outbound))
    }

    fn process_remote(&mut self, idx: usize) -> Option<Outbound> {
        let event = self.remote_queue.slot(idx).event.clone();

        let outbound = if event.header.typ.is_request() {
            self.remote_request_response(&event)
        } else {
            self.serve_response(&event);
            None
        };

        self.remote_queue.slot(idx).state = EventState::Served;
        outbound
    }

    /// Local-side disposition of a request before it is (maybe) sent.
    fn local_get_response(&mut self, event: &mut Event) -> LocalDisposition {
        let typ = event.header.typ;
        log::debug!("[{}] local {}", self.name, event.header);
        match typ {
            EventType::WriteReq | EventType::WriteFdReq => {
                let stream_id = event.header.stream_id;
                let size = event.header.size;
                let stream = match self.streams.get_by_id(stream_id) {
                    Some(stream) => stream,
                    None => {
                        log::debug!("[{}] stream {stream_id} has been closed", self.name);
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        return LocalDisposition::fail(Error::ErrStreamClosed);
                    }
                };
                if stream.write_size == 0 {
                    // local write raced a close; never reaches the wire
                    event.header.flags.not_acknowledge();
                    return LocalDisposition {
                        send: false,
                        packet: None,
                        error: Some(Error::ErrStreamClosed),
                    };
                }
                event.header.flags.acknowledge();
                event.header.flags.clear(FLAG_LOCAL_SERVE);
                if !stream.has_remote_space_for(size) {
                    log::debug!(
                        "[{}] S{stream_id}: peer full, parking write (event {})",
                        self.name,
                        event.header.id
                    );
                    event.header.flags.set(FLAG_BLOCK);
                    event.header.flags.set(FLAG_LOCAL_SERVE);
                } else {
                    event.header.flags.clear(FLAG_BLOCK);
                    stream.remote_fill_level += size;
                    stream.remote_fill_packets += 1;
                    log::debug!(
                        "[{}] S{stream_id}: local write of {size}, remote fill level {} out of {}",
                        self.name,
                        stream.remote_fill_level,
                        stream.write_size
                    );
                }
                LocalDisposition::send()
            }
            EventType::ReadReq => {
                let stream_id = event.header.stream_id;
                let move_semantic = event.header.flags.contains(FLAG_MOVE_SEMANTIC);
                let stream = match self.streams.get_by_id(stream_id) {
                    Some(stream) => stream,
                    None => {
                        log::debug!("[{}] stream {stream_id} has been closed", self.name);
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        return LocalDisposition::fail(Error::ErrStreamClosed);
                    }
                };
                let packet = if move_semantic {
                    stream.move_packet()
                } else {
                    stream.peek_packet().map(|desc| OwnedPacket {
                        data: desc.data,
                        length: desc.length,
                        t_remote_sent: desc.t_remote_sent,
                        t_received: desc.t_received,
                        fd: desc.fd,
                    })
                };
                event.header.flags.set(FLAG_LOCAL_SERVE);
                match packet {
                    Some(packet) => {
                        event.header.flags.acknowledge();
                        event.header.flags.clear(FLAG_BLOCK);
                        event.header.size = packet.length;
                        LocalDisposition {
                            send: false,
                            packet: Some(packet),
                            error: None,
                        }
                    }
                    None => {
                        event.header.flags.set(FLAG_BLOCK);
                        LocalDisposition::local()
                    }
                }
            }
            EventType::ReadRelReq => {
                let stream_id = event.header.stream_id;
                let stream = match self.streams.get_by_id(stream_id) {
                    Some(stream) => stream,
                    None => {
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        return LocalDisposition::fail(Error::ErrNoSuchStream);
                    }
                };
                match stream.release_packet() {
                    Some(released) => {
                        event.header.flags.acknowledge();
                        event.header.size = released;
                        LocalDisposition::send()
                    }
                    None => {
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        LocalDisposition::fail(Error::ErrNoPacketToRelease)
                    }
                }
            }
            EventType::ReadRelSpecReq => {
                let stream_id = event.header.stream_id;
                let ptr = event.release_ptr.unwrap_or(0);
                let stream = match self.streams.get_by_id(stream_id) {
                    Some(stream) => stream,
                    None => {
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        return LocalDisposition::fail(Error::ErrNoSuchStream);
                    }
                };
                match stream.release_specific_packet(ptr) {
                    Ok(released) => {
                        event.header.flags.acknowledge();
                        event.header.size = released;
                        LocalDisposition::send()
                    }
                    Err(err) => {
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        LocalDisposition::fail(err)
                    }
                }
            }
            EventType::CreateStreamReq => {
                event.header.flags.acknowledge();
                if self.role == Role::Client {
                    let id = self.streams.open_or_update(
                        &event.header.stream_name,
                        0,
                        event.header.size,
                        None,
                    );
                    if id == INVALID_STREAM_ID || id == INVALID_STREAM_ID_OUT_OF_MEMORY {
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        let error = if id == INVALID_STREAM_ID {
                            Error::ErrStreamNameTooLong
                        } else {
                            Error::ErrOutOfMemory
                        };
                        return LocalDisposition::fail(error);
                    }
                    event.header.stream_id = id;
                    log::debug!(
                        "[{}] create stream '{}' opened locally with id {id}",
                        self.name,
                        event.header.stream_name
                    );
                } else {
                    // stream opens with the forced id carried by the
                    // client's response
                    event.header.stream_id = INVALID_STREAM_ID;
                }
                LocalDisposition::send()
            }
            EventType::CloseStreamReq => {
                let stream_id = event.header.stream_id;
                let stream = match self.streams.get_by_id(stream_id) {
                    Some(stream) => stream,
                    None => {
                        event.header.flags.not_acknowledge();
                        event.header.flags.set(FLAG_LOCAL_SERVE);
                        return LocalDisposition::fail(Error::ErrNoSuchStream);
                    }
                };
                event.header.flags.acknowledge();
                if stream.remote_fill_level != 0 {
                    stream.close_initiated = true;
                    event.header.flags.set(FLAG_BLOCK);
                    event.header.flags.set(FLAG_LOCAL_SERVE);
                } else {
                    event.header.flags.clear(FLAG_BLOCK);
                    event.header.flags.clear(FLAG_LOCAL_SERVE);
                }
                LocalDisposition::send()
            }
            EventType::PingReq | EventType::ResetReq => {
                event.header.flags.acknowledge();
                LocalDisposition::send()
            }
            _ => {
                // responses never originate locally
                log::error!(
                    "[{}] cannot classify local event {}",
                    self.name,
                    event.header
                );
                event.header.flags.not_acknowledge();
                event.header.flags.set(FLAG_LOCAL_SERVE);
                LocalDisposition::fail(Error::ErrCommunicationUnknownError)
            }
        }
    }

    /// Serves a request received from the peer and synthesises its
    /// response.
    fn remote_request_response(&mut self, event: &Event) -> Option<Outbound> {
        let typ = event.header.typ;
        log::debug!("[{}] remote {}", self.name, event.header);
        let mut response = Event {
            header: event.header.clone(),
            link_id: self.link_id,
            ..Default::default()
        };
        response.header.typ = typ.response();
        response.header.flags = Default::default();
        response.header.stream_name = String::new();

        match typ {
            EventType::WriteReq | EventType::WriteFdReq => {
                // payload already sits in the receiving stream's pool
                response.header.flags.acknowledge();
                if self
                    .local_queue
                    .unblock(None, EventType::ReadReq, event.header.stream_id)
                {
                    self.awake_scheduler();
                }
            }
            EventType::ReadRelReq | EventType::ReadRelSpecReq => {
                response.header.flags.acknowledge();
                let stream_id = event.header.stream_id;
                let size = event.header.size;
                let mut unblock_close = false;
                if let Some(stream) = self.streams.get_by_id(stream_id) {
                    stream.remote_fill_level = stream.remote_fill_level.saturating_sub(size);
                    stream.remote_fill_packets = stream.remote_fill_packets.saturating_sub(1);
                    log::debug!(
                        "[{}] S{stream_id}: remote release of {size}, remote fill level {} out of {}",
                        self.name,
                        stream.remote_fill_level,
                        stream.write_size
                    );
                    unblock_close = stream.close_initiated && stream.local_fill_level == 0;
                } else {
                    log::warn!("[{}] remote release on unknown stream {stream_id}", self.name);
                }

                self.local_queue.unblock(None, EventType::WriteReq, stream_id);
                self.local_queue
                    .unblock(None, EventType::WriteFdReq, stream_id);
                if unblock_close {
                    self.local_queue
                        .unblock(None, EventType::CloseStreamReq, stream_id);
                }
                self.awake_scheduler();
            }
            EventType::CreateStreamReq => {
                response.header.flags.acknowledge();
                // write size from the peer means read size on this side
                let forced = if self.role == Role::Server {
                    Some(event.header.stream_id)
                } else {
                    None
                };
                let id = if event.header.size > self.max_stream_buffer_size {
                    log::warn!(
                        "[{}] create stream '{}' wants {} bytes, only {} available",
                        self.name,
                        event.header.stream_name,
                        event.header.size,
                        self.max_stream_buffer_size
                    );
                    INVALID_STREAM_ID
                } else {
                    self.streams.open_or_update(
                        &event.header.stream_name,
                        event.header.size,
                        0,
                        forced,
                    )
                };
                if id == INVALID_STREAM_ID || id == INVALID_STREAM_ID_OUT_OF_MEMORY {
                    response.header.flags.clear(FLAG_ACK);
                    response.header.flags.set(FLAG_SIZE_TOO_BIG);
                } else {
                    response.header.stream_id = id;
                    response.header.stream_name = event.header.stream_name.clone();
                    response.header.size = event.header.size;
                    log::debug!("[{}] creating stream {id}", self.name);
                }
            }
            EventType::CloseStreamReq => {
                let stream_id = event.header.stream_id;
                let mut free_slot = false;
                match self.streams.get_by_id(stream_id) {
                    None => {
                        // a NACKed close can be retried after the stream
                        // is already gone
                        response.header.flags.acknowledge();
                        log::debug!(
                            "[{}] close request on already closed stream {stream_id}",
                            self.name
                        );
                    }
                    Some(stream) => {
                        if stream.local_fill_level == 0 {
                            response.header.flags.acknowledge();
                            if stream.read_size != 0 {
                                stream.read_size = 0;
                                stream.close_initiated = false;
                            }
                            free_slot = stream.write_size == 0;
                        } else {
                            log::debug!(
                                "[{}] S{stream_id}: fifo not empty, close NACKed",
                                self.name
                            );
                            response.header.flags.not_acknowledge();
                            response.header.flags.set(FLAG_BLOCK);
                            stream.close_initiated = true;
                        }
                    }
                }
                if free_slot {
                    self.streams.free(stream_id);
                }
            }
            EventType::PingReq => {
                response.header.flags.acknowledge();
                if let Some(ping_tx) = &self.ping_tx {
                    let _ = ping_tx.try_send(());
                }
            }
            EventType::ResetReq => {
                log::debug!("[{}] reset request received, acknowledging", self.name);
                response.header.flags.acknowledge();
                // send the response, then tear the link down
                return Some(Outbound::Response {
                    event: response,
                    then_reset: true,
                });
            }
            EventType::ReadReq => {
                // reads are local; nothing travels for them
                return None;
            }
            _ => return None,
        }

        Some(Outbound::Response {
            event: response,
            then_reset: false,
        })
    }

    /// Applies a response's side effects and matches it against the local
    /// `Pending` request with the same id and complementary type.
    fn serve_response(&mut self, event: &Event) {
        let typ = event.header.typ;
        log::debug!("[{}] response {}", self.name, event.header);

        let idx = match self.local_queue.find_response_target(event.header.id, typ) {
            Some(idx) => idx,
            None => {
                log::error!(
                    "[{}] no request for this response: {}",
                    self.name,
                    event.header
                );
                return;
            }
        };

        if self.local_queue.slot_ref(idx).state == EventState::Dropped {
            // the caller abandoned this write; the response only reclaims
            // the slot, accounting settles through the normal release flow
            log::debug!("[{}] response for dropped event {}", self.name, event.header.id);
            self.local_queue.post_and_mark_served(idx, None, None);
            return;
        }

        match typ {
            EventType::CreateStreamResp => {
                if event.header.flags.ack() {
                    if self.role == Role::Server {
                        // adopt the id assigned by the client
                        let id = self.streams.open_or_update(
                            &event.header.stream_name,
                            0,
                            event.header.size,
                            Some(event.header.stream_id),
                        );
                        log::debug!(
                            "[{}] stream opened with forced id {id} from the host",
                            self.name
                        );
                    }
                } else if event.header.flags.contains(FLAG_SIZE_TOO_BIG) {
                    // the half-open local side is useless if the peer
                    // refused the create
                    let local_id = self.local_queue.slot_ref(idx).event.header.stream_id;
                    if local_id != INVALID_STREAM_ID {
                        self.streams.free(local_id);
                    }
                }
            }
            EventType::CloseStreamResp => {
                if event.header.flags.nack() && event.header.flags.contains(FLAG_BLOCK) {
                    // peer still has unread data; retry on its next release
                    let slot = self.local_queue.slot(idx);
                    slot.state = EventState::Blocked;
                    if let Some(stream) = self.streams.get_by_id(event.header.stream_id) {
                        stream.close_initiated = true;
                    }
                    return;
                }
                if event.header.flags.ack() {
                    let stream_id = event.header.stream_id;
                    let mut free_slot = false;
                    if let Some(stream) = self.streams.get_by_id(stream_id) {
                        stream.write_size = 0;
                        stream.close_initiated = false;
                        free_slot = stream.read_size == 0;
                    }
                    if free_slot {
                        self.streams.free(stream_id);
                    }
                }
            }
            EventType::ResetResp => {
                log::debug!("[{}] reset response received", self.name);
                self.resetting = true;
            }
            _ => {}
        }

        // propagate the peer's flags back to the caller
        self.local_queue.slot(idx).event.header.flags = event.header.flags;
        self.local_queue.post_and_mark_served(idx, None, None);
    }

    pub(crate) fn begin_reset(&mut self) {
        self.resetting = true;
    }

    /// Closes the transport without the full teardown; used by timed reset
    /// to wake the blocked reader, which then drives the teardown.
    pub(crate) async fn close_transport(&mut self) {
        if !self.fd_down {
            self.fd_down = true;
            let _ = self.transport.close().await;
        }
    }

    /// Idempotent link teardown: close the transport so blocked I/O wakes,
    /// complete every outstanding caller with an error, drop all streams,
    /// signal the closed watch and fire the link-down notification.
    pub(crate) async fn reset(&mut self) {
        if self.reset_done {
            return;
        }
        self.reset_done = true;
        self.resetting = true;

        log::debug!("[{}] closing link..", self.name);

        self.close_transport().await;
        self.set_link_state(LinkState::Down);

        for state in [
            EventState::Pending,
            EventState::Blocked,
            EventState::Ready,
            EventState::Allocated,
        ] {
            self.local_queue
                .free_with_state(state, Error::ErrCommunicationFail);
        }
        for state in [
            EventState::Allocated,
            EventState::Pending,
            EventState::Blocked,
            EventState::Ready,
            EventState::Dropped,
        ] {
            self.remote_queue
                .free_with_state(state, Error::ErrCommunicationFail);
        }
        self.local_queue
            .free_with_state(EventState::Dropped, Error::ErrCommunicationFail);

        self.streams.reset();

        // wake a server still parked in its startup handshake
        self.ping_tx.take();

        let _ = self.closed_tx.send(true);
        registry::handle_link_down(self.link_id);

        // a scheduler parked on its notify channel must observe the reset
        self.awake_scheduler();

        log::debug!("[{}] link closed", self.name);
    }

    /// Drops every local waiter after a wire failure; the link is unusable.
    pub(crate) fn free_local_waiters(&mut self) {
        for state in [EventState::Pending, EventState::Blocked] {
            self.local_queue
                .free_with_state(state, Error::ErrCommunicationFail);
        }
    }
}

struct LocalDisposition {
    /// Whether the request still has to travel to the peer.
    send: bool,
    packet: Option<OwnedPacket>,
    error: Option<Error>,
}

impl LocalDisposition {
    fn send() -> Self {
        LocalDisposition {
            send: true,
            packet: None,
            error: None,
        }
    }

    fn local() -> Self {
        LocalDisposition {
            send: false,
            packet: None,
            error: None,
        }
    }

    fn fail(error: Error) -> Self {
        LocalDisposition {
            send: false,
            packet: None,
            error: Some(error),
        }
    }
}
