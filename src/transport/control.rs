//! Request/reply control channel.
//!
//! One I/O thread owns the listener and every peer socket. It accepts
//! connections, reassembles frames, answers heartbeats, writes queued
//! replies, and reports connection lifecycle events. Requests and events are
//! handed to the server over channels; the server never touches a socket.
//!
//! Outgoing frames go through a per-peer backlog that is flushed only as far
//! as the socket accepts, so a peer that stops reading never holds up the
//! others. A peer whose backlog outgrows [`MAX_PEER_BACKLOG`] is closed.

use super::framing::{write_frame, ControlFrame, FrameReader, MAX_CONTROL_FRAME};
use crate::{Result, ServerError};
use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-peer read timeout; bounds one poll of one socket.
const PEER_POLL: Duration = Duration::from_millis(2);
const IDLE_SLEEP: Duration = Duration::from_millis(5);
/// Longest a flush waits on a socket with no send space.
const WRITE_POLL: Duration = Duration::from_millis(1);
/// Unsent bytes a peer may accumulate before it is closed.
pub const MAX_PEER_BACKLOG: usize = 4 * MAX_CONTROL_FRAME;

/// Transport-assigned connection identifier, unique for the process.
pub type PeerId = u64;

/// Connection lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The peer completed its first exchange on an accepted connection.
    Connected,
    /// A TCP connection was accepted.
    Accepted,
    /// The peer went away (EOF, reset, or heartbeat silence).
    Disconnected,
    /// The server closed the connection (shutdown or protocol violation).
    Closed,
    /// Accepting failed transiently and will be retried.
    ConnectRetried,
}

bitflags! {
    /// Selects which [`EventKind`]s are delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const CONNECTED = 1 << 0;
        const ACCEPTED = 1 << 1;
        const DISCONNECTED = 1 << 2;
        const CLOSED = 1 << 3;
        const CONNECT_RETRIED = 1 << 4;
    }
}

impl EventKind {
    fn mask(self) -> EventMask {
        match self {
            EventKind::Connected => EventMask::CONNECTED,
            EventKind::Accepted => EventMask::ACCEPTED,
            EventKind::Disconnected => EventMask::DISCONNECTED,
            EventKind::Closed => EventMask::CLOSED,
            EventKind::ConnectRetried => EventMask::CONNECT_RETRIED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub peer: PeerId,
    pub kind: EventKind,
    pub addr: Option<SocketAddr>,
}

/// Keep-alive settings for the control channel.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Ping an idle peer this often.
    pub interval: Duration,
    /// Declare a peer dead after this much silence.
    pub timeout: Duration,
    /// Time-to-live advertised to the peer in every ping.
    pub ttl: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(3000),
            ttl: Duration::from_millis(5000),
        }
    }
}

impl HeartbeatConfig {
    fn ttl_deciseconds(&self) -> u16 {
        u16::try_from(self.ttl.as_millis() / 100).unwrap_or(u16::MAX)
    }
}

/// One decoded request message.
#[derive(Debug)]
pub struct IncomingRequest {
    pub peer: PeerId,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    reader: FrameReader,
    last_rx: Instant,
    last_ping: Instant,
    greeted: bool,
    outbox: Vec<u8>,
}

impl Peer {
    /// Append one frame to the backlog. False once the peer is too far behind.
    fn queue(&mut self, frame: &ControlFrame) -> bool {
        write_frame(&mut self.outbox, &frame.encode()).is_ok()
            && self.outbox.len() <= MAX_PEER_BACKLOG
    }

    /// Write as much of the backlog as the socket takes without blocking.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    break
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct Channels {
    requests: Sender<IncomingRequest>,
    events: Sender<ConnectionEvent>,
    replies: Receiver<(PeerId, Vec<u8>)>,
    mask: EventMask,
}

impl Channels {
    fn emit(&self, peer: PeerId, kind: EventKind, addr: Option<SocketAddr>) {
        if self.mask.contains(kind.mask()) {
            let _ = self.events.send(ConnectionEvent { peer, kind, addr });
        }
    }
}

pub struct ControlTransport {
    local_addr: SocketAddr,
    requests: Receiver<IncomingRequest>,
    events: Receiver<ConnectionEvent>,
    replies: Sender<(PeerId, Vec<u8>)>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ControlTransport {
    /// Bind the control endpoint and start the I/O thread.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        heartbeat: HeartbeatConfig,
        mask: EventMask,
    ) -> Result<ControlTransport> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (requests_tx, requests) = crossbeam_channel::unbounded();
        let (events_tx, events) = crossbeam_channel::unbounded();
        let (replies, replies_rx) = crossbeam_channel::unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let channels = Channels {
            requests: requests_tx,
            events: events_tx,
            replies: replies_rx,
            mask,
        };
        let stop_clone = stop_flag.clone();
        let thread = std::thread::Builder::new()
            .name("tofd-control".into())
            .spawn(move || control_io_loop(listener, channels, heartbeat, stop_clone))
            .map_err(|e| ServerError::ThreadSpawn(format!("Failed to spawn control thread: {}", e)))?;

        log::info!("Control channel listening on {}", local_addr);

        Ok(ControlTransport {
            local_addr,
            requests,
            events,
            replies,
            stop_flag,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Incoming requests, in arrival order per peer.
    pub fn requests(&self) -> &Receiver<IncomingRequest> {
        &self.requests
    }

    /// Connection lifecycle events selected by the mask.
    pub fn events(&self) -> &Receiver<ConnectionEvent> {
        &self.events
    }

    /// Queue a reply for `peer`. Replies to peers that are already gone are
    /// silently discarded by the I/O thread.
    pub fn reply(&self, peer: PeerId, payload: Vec<u8>) -> Result<()> {
        self.replies
            .send((peer, payload))
            .map_err(|_| ServerError::Disconnected)
    }

    pub fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Control I/O thread panicked");
            }
        }
    }
}

impl Drop for ControlTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn control_io_loop(
    listener: TcpListener,
    channels: Channels,
    heartbeat: HeartbeatConfig,
    stop_flag: Arc<AtomicBool>,
) {
    let mut peers: HashMap<PeerId, Peer> = HashMap::new();
    let mut next_id: PeerId = 1;
    let ttl_ds = heartbeat.ttl_deciseconds();

    while !stop_flag.load(Ordering::Relaxed) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => match configure_peer(&stream) {
                    Ok(()) => {
                        let id = next_id;
                        next_id += 1;
                        log::info!("Control peer {} accepted from {}", id, addr);
                        let now = Instant::now();
                        peers.insert(
                            id,
                            Peer {
                                stream,
                                addr,
                                reader: FrameReader::new(MAX_CONTROL_FRAME),
                                last_rx: now,
                                last_ping: now,
                                greeted: false,
                                outbox: Vec::new(),
                            },
                        );
                        channels.emit(id, EventKind::Accepted, Some(addr));
                    }
                    Err(e) => log::warn!("Failed to configure control peer {}: {}", addr, e),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("Error accepting control connection: {}", e);
                    channels.emit(0, EventKind::ConnectRetried, None);
                    break;
                }
            }
        }

        let mut gone: Vec<(PeerId, EventKind)> = Vec::new();

        while let Ok((id, payload)) = channels.replies.try_recv() {
            let Some(peer) = peers.get_mut(&id) else {
                log::debug!("Dropping reply for departed peer {}", id);
                continue;
            };
            if !peer.queue(&ControlFrame::Message(payload)) && !gone.iter().any(|&(g, _)| g == id) {
                log::warn!("Control peer {} is not reading its replies", id);
                gone.push((id, EventKind::Closed));
            }
        }

        for (&id, peer) in peers.iter_mut() {
            if gone.iter().any(|&(g, _)| g == id) {
                continue;
            }
            if let Some(kind) = service_peer(id, peer, &channels, &heartbeat, ttl_ds) {
                gone.push((id, kind));
            }
        }

        for (id, kind) in gone {
            if let Some(peer) = peers.remove(&id) {
                let _ = peer.stream.shutdown(std::net::Shutdown::Both);
                log::info!("Control peer {} ({}) {:?}", id, peer.addr, kind);
                channels.emit(id, kind, Some(peer.addr));
            }
        }

        if peers.is_empty() {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    for (id, peer) in peers.drain() {
        let _ = peer.stream.shutdown(std::net::Shutdown::Both);
        channels.emit(id, EventKind::Closed, Some(peer.addr));
    }
    log::info!("Control I/O thread stopped");
}

fn configure_peer(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(PEER_POLL))?;
    stream.set_write_timeout(Some(WRITE_POLL))?;
    stream.set_nodelay(true)
}

/// Read whatever the peer sent and run its heartbeat. Returns the event to
/// emit if the peer must be dropped.
fn service_peer(
    id: PeerId,
    peer: &mut Peer,
    channels: &Channels,
    heartbeat: &HeartbeatConfig,
    ttl_ds: u16,
) -> Option<EventKind> {
    match peer.reader.poll(&mut peer.stream) {
        Ok(Some(body)) => {
            peer.last_rx = Instant::now();
            if !peer.greeted {
                peer.greeted = true;
                channels.emit(id, EventKind::Connected, Some(peer.addr));
            }
            match ControlFrame::decode(body) {
                Ok(ControlFrame::Message(payload)) => {
                    let _ = channels.requests.send(IncomingRequest {
                        peer: id,
                        payload,
                        received_at: peer.last_rx,
                    });
                }
                Ok(ControlFrame::Ping { .. }) => {
                    if !peer.queue(&ControlFrame::Pong) {
                        log::warn!("Control peer {} is not reading its pongs", id);
                        return Some(EventKind::Closed);
                    }
                }
                Ok(ControlFrame::Pong) => log::trace!("Pong from peer {}", id),
                Err(e) => {
                    log::warn!("Protocol error from peer {}: {}", id, e);
                    return Some(EventKind::Closed);
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            return match e.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => Some(EventKind::Disconnected),
                _ => {
                    log::warn!("Read error from peer {}: {}", id, e);
                    Some(EventKind::Closed)
                }
            };
        }
    }

    let silent = peer.last_rx.elapsed();
    if silent >= heartbeat.timeout {
        log::warn!("Control peer {} silent for {:?}, assuming dead", id, silent);
        return Some(EventKind::Disconnected);
    }
    if silent >= heartbeat.interval && peer.last_ping.elapsed() >= heartbeat.interval {
        peer.last_ping = Instant::now();
        if !peer.queue(&ControlFrame::Ping { ttl_ds }) {
            log::warn!("Control peer {} is not reading its pings", id);
            return Some(EventKind::Closed);
        }
    }
    if let Err(e) = peer.flush() {
        log::warn!("Failed to write to peer {}: {}", id, e);
        return Some(EventKind::Disconnected);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::{read_frame, write_frame};

    fn bind(heartbeat: HeartbeatConfig) -> ControlTransport {
        ControlTransport::bind("127.0.0.1:0", heartbeat, EventMask::all()).unwrap()
    }

    fn next_event(transport: &ControlTransport) -> ConnectionEvent {
        transport
            .events()
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
    }

    #[test]
    fn test_request_reply_round_trip() {
        let transport = bind(HeartbeatConfig::default());
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();

        let accepted = next_event(&transport);
        assert_eq!(accepted.kind, EventKind::Accepted);

        ControlFrame::Message(b"ping?".to_vec()).write_to(&mut client).unwrap();
        let request = transport.requests().recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(request.peer, accepted.peer);
        assert_eq!(request.payload, b"ping?");
        assert_eq!(next_event(&transport).kind, EventKind::Connected);

        transport.reply(request.peer, b"pong!".to_vec()).unwrap();
        let body = read_frame(&mut client, MAX_CONTROL_FRAME).unwrap();
        assert_eq!(ControlFrame::decode(body).unwrap(), ControlFrame::Message(b"pong!".to_vec()));
    }

    #[test]
    fn test_client_close_emits_disconnected() {
        let transport = bind(HeartbeatConfig::default());
        let client = TcpStream::connect(transport.local_addr()).unwrap();
        let accepted = next_event(&transport);
        drop(client);
        let event = next_event(&transport);
        assert_eq!(event.kind, EventKind::Disconnected);
        assert_eq!(event.peer, accepted.peer);
    }

    #[test]
    fn test_silent_peer_times_out() {
        let transport = bind(HeartbeatConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            ttl: Duration::from_millis(200),
        });
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        assert_eq!(next_event(&transport).kind, EventKind::Accepted);

        // The server pings while we stay silent.
        let body = read_frame(&mut client, MAX_CONTROL_FRAME).unwrap();
        assert_eq!(ControlFrame::decode(body).unwrap(), ControlFrame::Ping { ttl_ds: 2 });
        assert_eq!(next_event(&transport).kind, EventKind::Disconnected);
    }

    #[test]
    fn test_server_answers_ping() {
        let transport = bind(HeartbeatConfig::default());
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        ControlFrame::Ping { ttl_ds: 10 }.write_to(&mut client).unwrap();
        let body = read_frame(&mut client, MAX_CONTROL_FRAME).unwrap();
        assert_eq!(ControlFrame::decode(body).unwrap(), ControlFrame::Pong);
    }

    #[test]
    fn test_garbage_closes_peer() {
        let transport = bind(HeartbeatConfig::default());
        let mut client = TcpStream::connect(transport.local_addr()).unwrap();
        assert_eq!(next_event(&transport).kind, EventKind::Accepted);
        write_frame(&mut client, &[0x7f]).unwrap();
        assert_eq!(next_event(&transport).kind, EventKind::Connected);
        assert_eq!(next_event(&transport).kind, EventKind::Closed);
    }

    #[test]
    fn test_unread_replies_do_not_stall_other_peers() {
        let transport = bind(HeartbeatConfig::default());
        let _deaf = TcpStream::connect(transport.local_addr()).unwrap();
        let deaf = next_event(&transport);
        assert_eq!(deaf.kind, EventKind::Accepted);
        let mut active = TcpStream::connect(transport.local_addr()).unwrap();
        assert_eq!(next_event(&transport).kind, EventKind::Accepted);

        let blob = vec![0x55u8; 256 * 1024];
        let mut closed = false;
        for round in 0..400 {
            transport.reply(deaf.peer, blob.clone()).unwrap();
            if round % 20 == 0 {
                let started = Instant::now();
                ControlFrame::Message(vec![1]).write_to(&mut active).unwrap();
                let request = transport.requests().recv_timeout(Duration::from_secs(2)).unwrap();
                transport.reply(request.peer, b"ok".to_vec()).unwrap();
                let body = read_frame(&mut active, MAX_CONTROL_FRAME).unwrap();
                assert_eq!(ControlFrame::decode(body).unwrap(), ControlFrame::Message(b"ok".to_vec()));
                assert!(
                    started.elapsed() < Duration::from_millis(500),
                    "round trip took {:?}",
                    started.elapsed()
                );
            }
            while let Ok(event) = transport.events().try_recv() {
                if event.peer == deaf.peer && event.kind == EventKind::Closed {
                    closed = true;
                }
            }
            if closed {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(closed, "peer that never reads was not cut off");
    }

    #[test]
    fn test_mask_filters_events() {
        let transport =
            ControlTransport::bind("127.0.0.1:0", HeartbeatConfig::default(), EventMask::DISCONNECTED)
                .unwrap();
        let client = TcpStream::connect(transport.local_addr()).unwrap();
        drop(client);
        assert_eq!(next_event(&transport).kind, EventKind::Disconnected);
    }
}
