//! One-way frame channel.
//!
//! A dedicated writer thread owns the listener and the stream peer socket.
//! Producers hand payloads over a bounded queue (the high-water mark) and
//! give up after the send timeout, so a stalled peer costs dropped frames,
//! never unbounded memory. A frame that reached the socket is always written
//! whole; a slow peer keeps its connection and just sees gaps.

use super::framing::MAX_STREAM_FRAME;
use crate::streaming::{FrameSink, FrameSinkFactory, SendOutcome};
use crate::{Result, ServerError};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const QUEUE_POLL: Duration = Duration::from_millis(10);
/// Socket write timeout. Only bounds how long the writer goes without
/// checking for stop and release; a timed-out write is resumed.
const WRITE_POLL: Duration = Duration::from_millis(50);

struct Shared {
    has_peer: AtomicBool,
    release: AtomicBool,
    stop: AtomicBool,
    written: AtomicU64,
    discarded: AtomicU64,
}

pub struct FrameChannel {
    local_addr: SocketAddr,
    queue: Sender<Vec<u8>>,
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FrameChannel {
    /// Bind the frame endpoint and start the writer thread.
    pub fn bind<A: ToSocketAddrs>(addr: A, high_water_mark: usize) -> Result<FrameChannel> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (queue, queue_rx) = crossbeam_channel::bounded(high_water_mark.max(1));
        let shared = Arc::new(Shared {
            has_peer: AtomicBool::new(false),
            release: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            written: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tofd-frames".into())
                .spawn(move || frame_writer_loop(listener, queue_rx, &shared))
                .map_err(|e| {
                    ServerError::ThreadSpawn(format!("Failed to spawn frame writer thread: {}", e))
                })?
        };

        log::info!(
            "Frame channel listening on {} (hwm {})",
            local_addr,
            high_water_mark
        );

        Ok(FrameChannel {
            local_addr,
            queue,
            shared,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn publisher(&self) -> FramePublisher {
        FramePublisher {
            queue: self.queue.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Disconnect the current stream peer and discard queued frames.
    pub fn release_peer(&self) {
        self.shared.release.store(true, Ordering::Release);
    }

    pub fn has_peer(&self) -> bool {
        self.shared.has_peer.load(Ordering::Acquire)
    }

    /// Payloads waiting for the writer thread.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Frames fully written to a peer socket.
    pub fn frames_written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Frame writer thread panicked");
            }
        }
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FrameSinkFactory for FrameChannel {
    fn open_sink(&self) -> Box<dyn FrameSink> {
        Box::new(self.publisher())
    }

    fn release(&self) {
        self.release_peer();
    }
}

/// Producer handle for the frame channel.
pub struct FramePublisher {
    queue: Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl FrameSink for FramePublisher {
    fn send(&mut self, payload: Vec<u8>, timeout: Duration) -> SendOutcome {
        if !self.shared.has_peer.load(Ordering::Acquire) {
            return SendOutcome::Disconnected;
        }
        match self.queue.send_timeout(payload, timeout) {
            Ok(()) => SendOutcome::Sent,
            Err(SendTimeoutError::Timeout(_)) => SendOutcome::Dropped,
            Err(SendTimeoutError::Disconnected(_)) => SendOutcome::Disconnected,
        }
    }
}

fn frame_writer_loop(listener: TcpListener, queue: Receiver<Vec<u8>>, shared: &Shared) {
    let mut peer: Option<(TcpStream, SocketAddr)> = None;

    while !shared.stop.load(Ordering::Relaxed) {
        if shared.release.swap(false, Ordering::AcqRel) {
            if let Some((stream, addr)) = peer.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                log::info!("Released stream peer {}", addr);
            }
            shared.has_peer.store(false, Ordering::Release);
            let stale = queue.try_iter().count();
            if stale > 0 {
                log::debug!("Discarded {} queued frames on release", stale);
            }
        }

        match listener.accept() {
            Ok((stream, addr)) => match configure_peer(&stream) {
                Ok(()) => {
                    if let Some((old, old_addr)) = peer.replace((stream, addr)) {
                        let _ = old.shutdown(std::net::Shutdown::Both);
                        log::info!("Stream peer {} replaced by {}", old_addr, addr);
                    } else {
                        log::info!("Stream peer connected: {}", addr);
                    }
                    shared.has_peer.store(true, Ordering::Release);
                }
                Err(e) => log::warn!("Failed to configure stream peer {}: {}", addr, e),
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("Error accepting stream connection: {}", e),
        }

        let payload = match queue.recv_timeout(QUEUE_POLL) {
            Ok(payload) => payload,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let Some((stream, addr)) = peer.as_mut() else {
            shared.discarded.fetch_add(1, Ordering::Relaxed);
            log::trace!("No stream peer, discarding frame");
            continue;
        };
        if payload.len() > MAX_STREAM_FRAME {
            shared.discarded.fetch_add(1, Ordering::Relaxed);
            log::warn!("Discarding oversized frame of {} bytes", payload.len());
            continue;
        }
        match write_whole_frame(stream, &payload, shared) {
            Ok(true) => {
                shared.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => log::debug!("Frame write to {} abandoned", addr),
            Err(e) => {
                log::warn!("Stream peer {} dropped: {}", addr, e);
                if let Some((stream, _)) = peer.take() {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
                shared.has_peer.store(false, Ordering::Release);
            }
        }
    }

    log::info!(
        "Frame writer stopped ({} written, {} discarded)",
        shared.written.load(Ordering::Relaxed),
        shared.discarded.load(Ordering::Relaxed)
    );
}

/// Write one length-prefixed frame, waiting out a peer that is slow to
/// drain. Returns `Ok(false)` if stop or release interrupted the write; any
/// other error means the peer is gone.
fn write_whole_frame(stream: &mut TcpStream, payload: &[u8], shared: &Shared) -> io::Result<bool> {
    let header = (payload.len() as u32).to_be_bytes();
    for part in [&header[..], payload] {
        let mut offset = 0;
        while offset < part.len() {
            match stream.write(&part[offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => offset += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    if shared.stop.load(Ordering::Relaxed) || shared.release.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(true)
}

fn configure_peer(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_POLL))?;
    stream.set_nodelay(true)
}
