//! Process-level wiring: control transport, frame channel, connection monitor
//! and the RPC loop.
//!
//! Two threads touch the session. The monitor thread feeds connection events
//! into the [`ConnectionSupervisor`]; the RPC thread answers requests. Both go
//! through one connection-state lock taken with a bounded wait.

use crate::config::ServerConfig;
use crate::dispatch::CommandDispatcher;
use crate::protocol::{self, Response, ONLY_ONE_CLIENT};
use crate::sensor::SensorEnumerator;
use crate::session::{ServerSession, SessionSnapshot};
use crate::supervisor::{ClientState, ConnectionState, ConnectionSupervisor};
use crate::transport::{ControlTransport, EventMask, FrameChannel, IncomingRequest, PeerId};
use crate::types::Status;
use crate::{Result, ServerError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const REQUEST_POLL: Duration = Duration::from_millis(10);
const EVENT_POLL: Duration = Duration::from_millis(50);
/// How long a request may wait for its peer's Accepted event.
const PENDING_GRACE: Duration = Duration::from_secs(1);

/// State guarded by the connection-state lock.
pub struct ServerCore {
    pub session: ServerSession,
    pub supervisor: ConnectionSupervisor,
    pub dispatcher: CommandDispatcher,
}

#[derive(Debug, Default)]
struct Counters {
    answered: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
}

pub struct Server {
    control: ControlTransport,
    frames: Arc<FrameChannel>,
    core: Arc<Mutex<ServerCore>>,
    running: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
    lock_timeout: Duration,
    pending: VecDeque<IncomingRequest>,
    counters: Arc<Counters>,
}

impl Server {
    /// Bind both endpoints and start the connection monitor.
    pub fn bind(config: &ServerConfig, enumerator: Box<dyn SensorEnumerator>) -> Result<Server> {
        config.validate()?;
        let frames = Arc::new(FrameChannel::bind(
            config.network.frame_addr.as_str(),
            config.streaming.send_high_water_mark,
        )?);
        let control = ControlTransport::bind(
            config.network.control_addr.as_str(),
            config.heartbeat(),
            EventMask::all(),
        )?;

        let session = ServerSession::new(enumerator, frames.clone(), config.session());
        let core = Arc::new(Mutex::new(ServerCore {
            session,
            supervisor: ConnectionSupervisor::new(),
            dispatcher: CommandDispatcher::new(),
        }));
        let running = Arc::new(AtomicBool::new(true));
        let lock_timeout = config.connection_lock_timeout();

        let monitor = {
            let events = control.events().clone();
            let core = core.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("tofd-monitor".into())
                .spawn(move || monitor_loop(events, core, running, lock_timeout))
                .map_err(|e| {
                    ServerError::ThreadSpawn(format!("Failed to spawn monitor thread: {}", e))
                })?
        };

        log::info!(
            "Server ready: control {}, frames {}, compression {}",
            control.local_addr(),
            frames.local_addr(),
            config.streaming.compression
        );

        Ok(Server {
            control,
            frames,
            core,
            running,
            monitor: Some(monitor),
            lock_timeout,
            pending: VecDeque::new(),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn frame_addr(&self) -> SocketAddr {
        self.frames.local_addr()
    }

    /// Flag that keeps the RPC loop alive; clear it to shut down.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Serve requests until the running flag is cleared, then tear down.
    pub fn run(mut self) -> Result<()> {
        log::info!("Serving requests");
        while self.running.load(Ordering::Relaxed) {
            self.poll_once();
        }
        self.shutdown();
        Ok(())
    }

    /// Run the server on its own thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let control_addr = self.control_addr();
        let frame_addr = self.frame_addr();
        let running = self.running.clone();
        let core = self.core.clone();
        let counters = self.counters.clone();
        let frames = self.frames.clone();
        let thread = std::thread::Builder::new()
            .name("tofd-rpc".into())
            .spawn(move || {
                if let Err(e) = self.run() {
                    log::error!("Server stopped with error: {}", e);
                }
            })
            .map_err(|e| ServerError::ThreadSpawn(format!("Failed to spawn RPC thread: {}", e)))?;
        Ok(ServerHandle {
            control_addr,
            frame_addr,
            running,
            core,
            counters,
            frames,
            thread: Some(thread),
        })
    }

    /// Retry deferred requests, then wait briefly for a new one.
    fn poll_once(&mut self) {
        let mut deferred = VecDeque::new();
        let mut blocked: HashSet<PeerId> = HashSet::new();
        while let Some(request) = self.pending.pop_front() {
            if blocked.contains(&request.peer) {
                deferred.push_back(request);
                continue;
            }
            if let Some(request) = self.process(request) {
                blocked.insert(request.peer);
                deferred.push_back(request);
            }
        }
        self.pending = deferred;

        match self.control.requests().recv_timeout(REQUEST_POLL) {
            Ok(request) => {
                // Keep per-peer order behind anything still deferred.
                if self.pending.iter().any(|p| p.peer == request.peer) {
                    self.pending.push_back(request);
                } else if let Some(request) = self.process(request) {
                    self.pending.push_back(request);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("Control transport stopped; shutting down");
                self.running.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Answer one request. Returns it back if it must be retried later.
    fn process(&mut self, request: IncomingRequest) -> Option<IncomingRequest> {
        let Some(mut core) = self.core.try_lock_for(self.lock_timeout) else {
            log::warn!(
                "Connection state lock busy for {:?}; deferring request from peer {}",
                self.lock_timeout,
                request.peer
            );
            return Some(request);
        };

        let response = match core.supervisor.role(request.peer) {
            Some(ConnectionState::Connected) => {
                let ServerCore {
                    session,
                    dispatcher,
                    ..
                } = &mut *core;
                match protocol::decode_request(&request.payload) {
                    Ok(decoded) => dispatcher.dispatch(session, &decoded),
                    Err(e) => {
                        log::warn!("Undecodable request from peer {}: {}", request.peer, e);
                        Response::unknown()
                    }
                }
            }
            Some(ConnectionState::Busy) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Response::with_status(Status::Busy).message(ONLY_ONE_CLIENT)
            }
            None => {
                drop(core);
                if request.received_at.elapsed() < PENDING_GRACE {
                    return Some(request);
                }
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping request from unknown peer {}", request.peer);
                return None;
            }
        };
        drop(core);

        match protocol::encode_response(&response) {
            Ok(bytes) => {
                if let Err(e) = self.control.reply(request.peer, bytes) {
                    log::warn!("Failed to queue reply for peer {}: {}", request.peer, e);
                }
                self.counters.answered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!("Failed to encode response: {}", e),
        }
        None
    }

    /// Stop the monitor, release the client and the sensor, close sockets.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                log::error!("Monitor thread panicked");
            }
        }
        {
            let mut core = self.core.lock();
            let ServerCore {
                session,
                supervisor,
                ..
            } = &mut *core;
            supervisor.reset(session);
            session.shutdown();
        }
        self.control.shutdown();
        log::info!(
            "Server stopped ({} answered, {} rejected)",
            self.counters.answered.load(Ordering::Relaxed),
            self.counters.rejected.load(Ordering::Relaxed)
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.monitor.is_some() {
            self.shutdown();
        }
    }
}

fn monitor_loop(
    events: Receiver<crate::transport::ConnectionEvent>,
    core: Arc<Mutex<ServerCore>>,
    running: Arc<AtomicBool>,
    lock_timeout: Duration,
) {
    while running.load(Ordering::Relaxed) {
        let event = match events.recv_timeout(EVENT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        log::debug!("Connection event {:?} for peer {}", event.kind, event.peer);

        // Events are never dropped; keep retrying the lock while running.
        loop {
            if let Some(mut core) = core.try_lock_for(lock_timeout) {
                let ServerCore {
                    session,
                    supervisor,
                    ..
                } = &mut *core;
                supervisor.handle(&event, session);
                break;
            }
            if !running.load(Ordering::Relaxed) {
                return;
            }
            log::warn!("Connection state lock busy; retrying {:?}", event.kind);
        }
    }
    log::info!("Monitor thread stopped");
}

/// Handle to a server running on its own thread.
pub struct ServerHandle {
    control_addr: SocketAddr,
    frame_addr: SocketAddr,
    running: Arc<AtomicBool>,
    core: Arc<Mutex<ServerCore>>,
    counters: Arc<Counters>,
    frames: Arc<FrameChannel>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn frame_addr(&self) -> SocketAddr {
        self.frame_addr
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core.lock().session.snapshot()
    }

    pub fn client_state(&self) -> ClientState {
        self.core.lock().supervisor.state()
    }

    /// Run `f` against the session under the connection-state lock.
    pub fn with_session<R>(&self, f: impl FnOnce(&ServerSession) -> R) -> R {
        f(&self.core.lock().session)
    }

    /// Frame buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.with_session(|session| session.buffers().live_buffers())
    }

    /// Whether a frame-channel peer is attached.
    pub fn has_frame_peer(&self) -> bool {
        self.frames.has_peer()
    }

    /// Requests answered with the one-client rejection.
    pub fn rejected_requests(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("RPC thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
