#[cfg(test)]
mod link_test;

pub(crate) mod dispatcher;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::codec;
use crate::error::{Error, Result};
use crate::event::{
    Event, EventResult, EventType, Timespec, FLAG_MOVE_SEMANTIC, FLAG_SIZE_TOO_BIG,
    INVALID_STREAM_ID, MAX_STREAM_NAME_LENGTH,
};
use crate::pool::{OwnedPacket, PacketDesc};
use crate::registry::{self, LinkId};
use crate::stream::FillSide;
use crate::transport::{Transport, UsbSpeed};
use dispatcher::{Dispatcher, Outbound, Role};

/// Largest per-stream buffer a peer's create request is granted when the
/// config does not say otherwise.
pub(crate) const DEFAULT_STREAM_BUFFER_SIZE: u32 = 32 * 1024 * 1024;

/// link state enums
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    NotInit = 0,
    Up = 1,
    Down = 2,
}

impl From<u8> for LinkState {
    fn from(v: u8) -> LinkState {
        match v {
            1 => LinkState::Up,
            2 => LinkState::Down,
            _ => LinkState::NotInit,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            LinkState::NotInit => "NotInit",
            LinkState::Up => "Up",
            LinkState::Down => "Down",
        };
        write!(f, "{s}")
    }
}

/// Config collects the arguments of link construction into a single
/// structure.
pub struct Config {
    pub transport: Arc<dyn Transport + Send + Sync>,
    /// Upper bound granted to a peer's create-stream request; 0 selects the
    /// default.
    pub max_stream_buffer_size: u32,
    pub name: String,
}

/// A single live connection to one peer endpoint over one transport.
///
/// A link owns a dispatcher (scheduler task + reader task) multiplexing
/// named streams over the transport. Most applications go through the
/// handle-based functions in [`crate::api`]; the methods here are the same
/// operations bound to an owned link object.
pub struct Link {
    name: String,
    link_id: LinkId,
    role: Role,
    state: Arc<AtomicU8>,
    transport: Arc<dyn Transport + Send + Sync>,
    closed_rx: watch::Receiver<bool>,
    usb_speed: UsbSpeed,
    mx_serial: String,
    pub(crate) dispatcher: Arc<Mutex<Dispatcher>>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("link_id", &self.link_id)
            .field("role", &self.role)
            .field("state", &self.link_state())
            .finish()
    }
}

impl Link {
    /// Connects the client side of a link and performs the ping handshake.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        Link::new(config, Role::Client).await
    }

    /// Serves the peer side of a link; blocks until the client's ping
    /// arrives.
    pub async fn serve(config: Config) -> Result<Arc<Self>> {
        Link::new(config, Role::Server).await
    }

    async fn new(config: Config, role: Role) -> Result<Arc<Self>> {
        let link_id = registry::reserve_slot()?;
        let transport = Arc::clone(&config.transport);
        let name = config.name;
        let max_stream_buffer_size = if config.max_stream_buffer_size == 0 {
            DEFAULT_STREAM_BUFFER_SIZE
        } else {
            config.max_stream_buffer_size
        };

        let state = Arc::new(AtomicU8::new(LinkState::NotInit as u8));
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (ping_tx, mut ping_rx) = mpsc::channel(1);

        let dispatcher = Arc::new(Mutex::new(Dispatcher::new(
            name.clone(),
            link_id,
            role,
            Arc::clone(&state),
            Arc::clone(&transport),
            notify_tx,
            closed_tx,
            ping_tx,
            max_stream_buffer_size,
        )));

        let sched_name = name.clone();
        let sched_dispatcher = Arc::clone(&dispatcher);
        let sched_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            Link::scheduler_loop(sched_name, sched_dispatcher, sched_transport, notify_rx).await;
        });

        let reader_name = name.clone();
        let reader_dispatcher = Arc::clone(&dispatcher);
        let reader_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            Link::reader_loop(reader_name, reader_dispatcher, reader_transport, role).await;
        });

        let link = Arc::new(Link {
            name,
            link_id,
            role,
            state,
            closed_rx,
            usb_speed: transport.usb_speed(),
            mx_serial: transport.mx_serial(),
            transport,
            dispatcher,
        });

        match role {
            Role::Client => {
                let result = link
                    .submit(Event::new(EventType::PingReq, 0, 0, link_id))
                    .await;
                match result {
                    Ok(completed) if completed.header.flags.ack() => {}
                    _ => {
                        link.close().await;
                        return Err(Error::ErrCommunicationFail);
                    }
                }
            }
            Role::Server => {
                if ping_rx.recv().await.is_none() {
                    link.close().await;
                    return Err(Error::ErrCommunicationFail);
                }
            }
        }

        link.state.store(LinkState::Up as u8, Ordering::SeqCst);
        registry::install(link_id, Arc::clone(&link));
        log::debug!("[{}] link {link_id} up ({role:?})", link.name);
        Ok(link)
    }

    /// Scheduler task: drains both event queues, pushes requests and
    /// responses onto the wire, and tears the link down when the reset
    /// handshake finishes or the wire breaks.
    async fn scheduler_loop(
        name: String,
        dispatcher: Arc<Mutex<Dispatcher>>,
        transport: Arc<dyn Transport + Send + Sync>,
        mut notify_rx: mpsc::Receiver<()>,
    ) {
        log::debug!("[{name}] scheduler loop entered");

        'outer: loop {
            loop {
                let (processed, outbound, stop) = {
                    let mut d = dispatcher.lock().await;
                    match d.next_event() {
                        Some((origin, idx)) => {
                            let outbound = d.process(origin, idx);
                            (true, outbound, d.resetting())
                        }
                        None => (false, None, d.resetting()),
                    }
                };

                match outbound {
                    Some(Outbound::Request(event)) => {
                        if let Err(err) = codec::write_event(&*transport, &event).await {
                            log::warn!("[{name}] event sending failed: {err}");
                            let mut d = dispatcher.lock().await;
                            d.free_local_waiters();
                            d.reset().await;
                            break 'outer;
                        }
                    }
                    Some(Outbound::Response { event, then_reset }) => {
                        if let Err(err) = codec::write_event(&*transport, &event).await {
                            log::warn!("[{name}] response sending failed: {err}");
                            let mut d = dispatcher.lock().await;
                            d.free_local_waiters();
                            d.reset().await;
                            break 'outer;
                        }
                        if then_reset {
                            log::debug!("[{name}] reset response sent, stopping scheduler");
                            let mut d = dispatcher.lock().await;
                            d.begin_reset();
                            break 'outer;
                        }
                    }
                    None => {}
                }

                if stop {
                    break 'outer;
                }
                if !processed {
                    break;
                }
            }

            if notify_rx.recv().await.is_none() {
                break;
            }
        }

        let mut d = dispatcher.lock().await;
        d.reset().await;
        log::debug!("[{name}] scheduler loop exited");
    }

    /// Reader task: decodes one event at a time and enqueues it as remote
    /// work. Exits on wire failure or on the terminal reset event for the
    /// role; the scheduler drains afterwards.
    async fn reader_loop(
        name: String,
        dispatcher: Arc<Mutex<Dispatcher>>,
        transport: Arc<dyn Transport + Send + Sync>,
        role: Role,
    ) {
        log::debug!("[{name}] reader loop entered");

        loop {
            let header = match codec::read_header(&*transport).await {
                Ok(header) => header,
                Err(err) => {
                    log::debug!("[{name}] failed to receive event: {err}");
                    let mut d = dispatcher.lock().await;
                    d.reset().await;
                    break;
                }
            };

            let terminal = matches!(
                (role, header.typ),
                (Role::Server, EventType::ResetReq) | (Role::Client, EventType::ResetResp)
            );

            let mut event = Event {
                header,
                ..Default::default()
            };

            if event.header.typ.carries_payload() {
                let (data, fd) = match codec::read_payload(&*transport, event.header.size).await {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::warn!("[{name}] failed to receive payload: {err}");
                        let mut d = dispatcher.lock().await;
                        d.reset().await;
                        break;
                    }
                };
                let t_received = Timespec::now();
                let t_remote_sent = event.header.timestamp();

                let mut d = dispatcher.lock().await;
                event.link_id = d.link_id;
                if let Err(err) = d.store_inbound_packet(
                    event.header.stream_id,
                    data,
                    fd,
                    t_remote_sent,
                    t_received,
                ) {
                    log::warn!(
                        "[{name}] dropping write for stream {}: {err}",
                        event.header.stream_id
                    );
                    continue;
                }
                d.add_remote_event(event);
            } else {
                let mut d = dispatcher.lock().await;
                event.link_id = d.link_id;
                d.add_remote_event(event);
            }

            if terminal {
                log::debug!("[{name}] terminal reset event read, stopping reader");
                break;
            }
        }

        log::debug!("[{name}] reader loop exited");
    }

    /// Queues a local event and waits for the scheduler to complete it.
    pub(crate) async fn submit(&self, event: Event) -> Result<EventResult> {
        let rx = {
            let mut d = self.dispatcher.lock().await;
            d.add_local_event(event)?
        };
        let result = rx.await.map_err(|_| Error::ErrCommunicationFail)?;
        match result.error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Timed variant: an expired wait abandons the event in place so a late
    /// completion still finds a landing slot.
    pub(crate) async fn submit_timed(
        &self,
        event: Event,
        timeout_ms: Option<u32>,
    ) -> Result<EventResult> {
        let id = event.header.id;
        let typ = event.header.typ;
        let stream_id = event.header.stream_id;

        let rx = {
            let mut d = self.dispatcher.lock().await;
            d.add_local_event(event)?
        };

        let ms = match timeout_ms {
            None => {
                let result = rx.await.map_err(|_| Error::ErrCommunicationFail)?;
                return match result.error {
                    Some(err) => Err(err),
                    None => Ok(result),
                };
            }
            Some(ms) => ms,
        };

        match tokio::time::timeout(Duration::from_millis(ms as u64), rx).await {
            Ok(Ok(result)) => match result.error {
                Some(err) => Err(err),
                None => Ok(result),
            },
            Ok(Err(_)) => Err(Error::ErrCommunicationFail),
            Err(_) => {
                let mut d = self.dispatcher.lock().await;
                match typ {
                    EventType::ReadReq => d.serve_local_event(id, typ, stream_id),
                    EventType::WriteReq | EventType::WriteFdReq => {
                        d.serve_or_drop_local_event(id, typ, stream_id)
                    }
                    _ => {}
                }
                Err(Error::ErrTimeout)
            }
        }
    }

    fn check_up(&self) -> Result<()> {
        if self.link_state() != LinkState::Up {
            return Err(Error::ErrCommunicationNotOpen);
        }
        Ok(())
    }

    /// Opens (or attaches to) the named stream. `write_size` is the buffer
    /// the peer must allocate for this side's writes; passing 0 only
    /// resolves the id of a stream the peer already created.
    pub async fn open_stream(&self, name: &str, write_size: u32) -> Result<u32> {
        self.check_up()?;
        if name.is_empty() || name.len() >= MAX_STREAM_NAME_LENGTH {
            return Err(Error::ErrStreamNameTooLong);
        }
        if !name.is_ascii() {
            return Err(Error::ErrStreamNameNotAscii);
        }

        if write_size > 0 {
            let mut event = Event::new(
                EventType::CreateStreamReq,
                INVALID_STREAM_ID,
                write_size,
                self.link_id,
            );
            event.header.stream_name = name.to_owned();

            let completed = self.submit(event).await?;
            let flags = completed.header.flags;
            if !flags.ack() {
                if flags.contains(FLAG_SIZE_TOO_BIG) {
                    return Err(Error::ErrOutOfMemory);
                }
                return Err(Error::ErrCommunicationFail);
            }
        }

        let mut d = self.dispatcher.lock().await;
        d.streams
            .id_by_name(name)
            .ok_or(Error::ErrNoSuchStream)
    }

    /// Closes this side's write half; completes once the peer has drained
    /// everything outstanding.
    pub async fn close_stream(&self, stream_id: u32) -> Result<()> {
        self.check_up()?;
        let completed = self
            .submit(Event::new(EventType::CloseStreamReq, stream_id, 0, self.link_id))
            .await?;
        if completed.header.flags.ack() {
            Ok(())
        } else {
            Err(Error::ErrCommunicationFail)
        }
    }

    /// Sends one packet; blocks while the peer's buffer is full.
    pub async fn write(&self, stream_id: u32, data: Bytes, timeout_ms: Option<u32>) -> Result<()> {
        self.check_up()?;
        let mut event = Event::new(
            EventType::WriteReq,
            stream_id,
            data.len() as u32,
            self.link_id,
        );
        event.data = Some(data);

        let completed = self.submit_timed(event, timeout_ms).await?;
        if completed.header.flags.ack() {
            Ok(())
        } else {
            Err(Error::ErrCommunicationFail)
        }
    }

    /// Scatter variant: the payload is `data` immediately followed by
    /// `data2`, delivered to the peer as one packet.
    pub async fn write2(&self, stream_id: u32, data: Bytes, data2: Bytes) -> Result<()> {
        self.check_up()?;
        let size = (data.len() + data2.len()) as u32;
        let mut event = Event::new(EventType::WriteReq, stream_id, size, self.link_id);
        event.data = Some(data);
        event.data2 = Some(data2);

        let completed = self.submit_timed(event, None).await?;
        if completed.header.flags.ack() {
            Ok(())
        } else {
            Err(Error::ErrCommunicationFail)
        }
    }

    /// Write carrying an ancillary descriptor alongside the payload; needs
    /// a transport with descriptor passing.
    pub async fn write_fd(&self, stream_id: u32, data: Bytes) -> Result<()> {
        self.check_up()?;
        if !self.transport.supports_fd_passing() {
            return Err(Error::ErrNotImplemented);
        }
        let mut event = Event::new(
            EventType::WriteFdReq,
            stream_id,
            data.len() as u32,
            self.link_id,
        );
        event.data = Some(data);

        let completed = self.submit_timed(event, None).await?;
        if completed.header.flags.ack() {
            Ok(())
        } else {
            Err(Error::ErrCommunicationFail)
        }
    }

    /// Receives the next packet; the pool keeps buffer ownership until
    /// [`Link::release`].
    pub async fn read(&self, stream_id: u32, timeout_ms: Option<u32>) -> Result<PacketDesc> {
        self.check_up()?;
        let event = Event::new(EventType::ReadReq, stream_id, 0, self.link_id);
        let completed = self.submit_timed(event, timeout_ms).await?;
        if !completed.header.flags.ack() {
            return Err(Error::ErrCommunicationFail);
        }
        let packet = completed
            .packet
            .ok_or(Error::ErrCommunicationUnknownError)?;
        Ok(PacketDesc {
            data: packet.data,
            length: packet.length,
            t_remote_sent: packet.t_remote_sent,
            t_received: packet.t_received,
            fd: packet.fd,
        })
    }

    /// Receives the next packet and takes buffer ownership out of the
    /// pool; the accounting credit is returned to the peer immediately, so
    /// the caller only deallocates (drops) the packet.
    pub async fn read_move(
        &self,
        stream_id: u32,
        timeout_ms: Option<u32>,
    ) -> Result<OwnedPacket> {
        self.check_up()?;
        let mut event = Event::new(EventType::ReadReq, stream_id, 0, self.link_id);
        event.header.flags.set(FLAG_MOVE_SEMANTIC);

        let completed = self.submit_timed(event, timeout_ms).await?;
        if !completed.header.flags.ack() {
            return Err(Error::ErrCommunicationFail);
        }
        let packet = completed
            .packet
            .ok_or(Error::ErrCommunicationUnknownError)?;

        self.release(stream_id).await?;
        Ok(packet)
    }

    /// Releases the oldest handed-out packet back to the peer.
    pub async fn release(&self, stream_id: u32) -> Result<()> {
        self.check_up()?;
        let completed = self
            .submit(Event::new(EventType::ReadRelReq, stream_id, 0, self.link_id))
            .await?;
        if completed.header.flags.ack() {
            Ok(())
        } else {
            Err(Error::ErrCommunicationFail)
        }
    }

    /// Releases the handed-out packet holding this descriptor's buffer.
    pub async fn release_specific(&self, stream_id: u32, packet: &PacketDesc) -> Result<()> {
        self.check_up()?;
        let mut event = Event::new(EventType::ReadRelSpecReq, stream_id, 0, self.link_id);
        event.release_ptr = Some(packet.data.as_ptr() as usize);

        let completed = self.submit(event).await?;
        if completed.header.flags.ack() {
            Ok(())
        } else {
            Err(Error::ErrCommunicationFail)
        }
    }

    /// Current occupancy of the stream's buffers, from either side's
    /// perspective. Reports 0 for a stream that has fully closed.
    pub async fn fill_level(&self, stream_id: u32, side: FillSide) -> Result<u32> {
        let mut d = self.dispatcher.lock().await;
        Ok(d.streams
            .get_by_id(stream_id)
            .map(|stream| stream.fill_level(side))
            .unwrap_or(0))
    }

    /// Initiates the cooperative reset handshake and waits for the link to
    /// finish tearing down. An unresponsive peer surfaces as `ErrTimeout`
    /// once `timeout_ms` expires; the link is down either way.
    pub async fn reset(&self, timeout_ms: Option<u32>) -> Result<()> {
        if self.link_state() != LinkState::Up {
            log::warn!("[{}] link is down, closing without reset", self.name);
            self.close().await;
            return Err(Error::ErrCommunicationNotOpen);
        }

        let event = Event::new(EventType::ResetReq, 0, 0, self.link_id);
        log::debug!("[{}] sending reset remote event", self.name);

        let rx = {
            let mut d = self.dispatcher.lock().await;
            d.add_local_event(event)?
        };

        let result = match timeout_ms {
            None => {
                let _ = rx.await;
                Ok(())
            }
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms as u64), rx).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    // closing the transport wakes the blocked reader, which
                    // then drives the teardown
                    let mut d = self.dispatcher.lock().await;
                    d.close_transport().await;
                    Err(Error::ErrTimeout)
                }
            },
        };

        self.wait_closed().await;
        result
    }

    /// Hard-closes the link and cleans up its state.
    pub async fn close(&self) {
        let mut d = self.dispatcher.lock().await;
        d.reset().await;
    }

    async fn wait_closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        while !*closed_rx.borrow() {
            if closed_rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn id(&self) -> LinkId {
        self.link_id
    }

    pub fn link_state(&self) -> LinkState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Peer connection speed captured at connect time.
    pub fn peer_usb_speed(&self) -> UsbSpeed {
        self.usb_speed
    }

    /// Peer serial captured at connect time.
    pub fn peer_mx_id(&self) -> &str {
        &self.mx_serial
    }
}
