use crate::buffers::{FrameBufferSet, FrameWait};
use crate::codec::{Codec, FrameEncoder};
use crate::stats::{CompressionStats, CompressionSummary};
use crate::{Result, ServerError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PAUSE_SLEEP: Duration = Duration::from_millis(10);
/// Interval between progress logs while `stop` waits for the thread.
const STOP_LOG_STEP: Duration = Duration::from_millis(500);

/// Result of handing one payload to the frame transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The peer did not keep up within the send timeout.
    Dropped,
    /// No peer, or the transport is gone.
    Disconnected,
}

/// Push side of the frame channel.
pub trait FrameSink: Send {
    /// Hand over one payload, waiting at most `timeout`. Never retries.
    fn send(&mut self, payload: Vec<u8>, timeout: Duration) -> SendOutcome;
}

/// Source of frame sinks for successive streaming sessions.
pub trait FrameSinkFactory: Send + Sync {
    fn open_sink(&self) -> Box<dyn FrameSink>;
    /// Drop the current stream peer, if any.
    fn release(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    pub codec: Codec,
    pub wait_timeout: Duration,
    pub send_timeout: Duration,
    /// Bound on how long `stop` blocks waiting for the thread.
    pub stop_grace: Duration,
    pub stats_window: usize,
    pub stats_log_interval: Duration,
    /// Re-send the frame already in the send buffer instead of capturing.
    pub repeat_frame: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            codec: Codec::None,
            wait_timeout: Duration::from_millis(500),
            send_timeout: Duration::from_millis(1000),
            stop_grace: Duration::from_millis(5000),
            stats_window: 50,
            stats_log_interval: Duration::from_millis(5000),
            repeat_frame: false,
        }
    }
}

/// Snapshot of the streaming counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingStats {
    pub frames_sent: u64,
    /// Frames skipped because the peer did not keep up.
    pub frames_dropped: u64,
    /// Frames discarded while no stream peer was attached.
    pub frames_without_peer: u64,
    pub bytes_sent: u64,
}

struct Shared {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_without_peer: AtomicU64,
    bytes_sent: AtomicU64,
    compression: Mutex<CompressionStats>,
}

impl Shared {
    fn snapshot(&self) -> StreamingStats {
        StreamingStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_without_peer: self.frames_without_peer.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Background thread copying ready frames into the send buffer, optionally
/// compressing them, and pushing them to the frame channel.
///
/// Frames the peer cannot take within the send timeout are dropped.
pub struct StreamingLoop {
    buffers: Arc<FrameBufferSet>,
    shared: Arc<Shared>,
    stop_grace: Duration,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StreamingLoop {
    pub fn spawn(
        buffers: Arc<FrameBufferSet>,
        sink: Box<dyn FrameSink>,
        config: StreamingConfig,
    ) -> Result<StreamingLoop> {
        let shared = Arc::new(Shared {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_without_peer: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            compression: Mutex::new(CompressionStats::new(config.stats_window)),
        });

        buffers.begin_streaming();
        let spawned = {
            let buffers = buffers.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tofd-stream".into())
                .spawn(move || streaming_loop(&buffers, sink, config, &shared))
        };
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                buffers.streaming_exited();
                return Err(ServerError::ThreadSpawn(format!(
                    "Failed to spawn streaming thread: {}",
                    e
                )));
            }
        };

        Ok(StreamingLoop {
            buffers,
            shared,
            stop_grace: config.stop_grace,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> StreamingStats {
        self.shared.snapshot()
    }

    pub fn compression_summary(&self) -> Option<CompressionSummary> {
        self.shared.compression.lock().summary()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.buffers.is_streaming()
    }

    /// Stop the thread and wait for it, up to the configured grace period.
    /// Returns false if the thread had to be detached.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        self.buffers.request_stream_stop();

        let deadline = Instant::now() + self.stop_grace;
        loop {
            if self.buffers.wait_streaming_exit(STOP_LOG_STEP) {
                if thread.join().is_err() {
                    log::error!("Streaming thread panicked");
                }
                return true;
            }
            if Instant::now() >= deadline {
                log::error!(
                    "Streaming thread did not stop within {:?}, detaching it",
                    self.stop_grace
                );
                return false;
            }
            log::info!("Waiting for streaming thread to stop...");
        }
    }
}

impl Drop for StreamingLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Confirms thread exit to `stop`, also when the loop unwinds.
struct ExitGuard<'a>(&'a FrameBufferSet);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.streaming_exited();
    }
}

fn streaming_loop(
    buffers: &FrameBufferSet,
    mut sink: Box<dyn FrameSink>,
    config: StreamingConfig,
    shared: &Shared,
) {
    let _exit = ExitGuard(buffers);
    let mut encoder = FrameEncoder::new(config.codec);
    let mut last_summary = Instant::now();
    let mut last_logged = shared.snapshot();

    log::info!(
        "Streaming loop started (codec: {}, repeat: {})",
        config.codec,
        config.repeat_frame
    );

    loop {
        let lease = if config.repeat_frame {
            if buffers.stream_stop_requested() {
                break;
            }
            match buffers.lease_send() {
                Some(lease) => lease,
                None => {
                    std::thread::sleep(PAUSE_SLEEP);
                    continue;
                }
            }
        } else {
            match buffers.wait_frame_ready(config.wait_timeout) {
                FrameWait::Stopped => break,
                FrameWait::Idle => continue,
                FrameWait::Paused => {
                    std::thread::sleep(PAUSE_SLEEP);
                    continue;
                }
                FrameWait::Ready(lease) => lease,
            }
        };

        let started = Instant::now();
        let (encoded, original_bytes) = {
            let frame = lease.lock();
            (encoder.encode(&frame), frame.len() * 2)
        };
        drop(lease);

        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to encode frame: {}", e);
                continue;
            }
        };
        if config.codec != Codec::None {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            shared
                .compression
                .lock()
                .record(elapsed_ms, original_bytes, payload.len());
        }

        let len = payload.len() as u64;
        match sink.send(payload, config.send_timeout) {
            SendOutcome::Sent => {
                shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                shared.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            SendOutcome::Dropped => {
                shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Frame dropped: peer not keeping up");
            }
            SendOutcome::Disconnected => {
                shared.frames_without_peer.fetch_add(1, Ordering::Relaxed);
                log::trace!("Frame discarded: no stream peer");
            }
        }

        if last_summary.elapsed() >= config.stats_log_interval {
            log_summary(shared, &last_logged, last_summary.elapsed());
            last_logged = shared.snapshot();
            last_summary = Instant::now();
        }
    }

    let totals = shared.snapshot();
    log::info!(
        "Streaming loop stopped: {} sent, {} dropped, {} without peer, {} bytes",
        totals.frames_sent,
        totals.frames_dropped,
        totals.frames_without_peer,
        totals.bytes_sent
    );
}

fn log_summary(shared: &Shared, previous: &StreamingStats, elapsed: Duration) {
    let now = shared.snapshot();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let sent = now.frames_sent - previous.frames_sent;
    let dropped = now.frames_dropped - previous.frames_dropped;
    let bytes = now.bytes_sent - previous.bytes_sent;
    log::info!(
        "Streaming: {:.1} fps, {:.2} MB/s, {} dropped",
        sent as f64 / secs,
        bytes as f64 / secs / 1_000_000.0,
        dropped
    );
    if let Some(c) = shared.compression.lock().summary() {
        log::info!(
            "Compression over last {}: time {:.2}/{:.2}/{:.2} ms, ratio {:.1}/{:.1}/{:.1} % (min/avg/max)",
            c.samples,
            c.time_ms.min,
            c.time_ms.average,
            c.time_ms.max,
            c.ratio_pct.min,
            c.ratio_pct.average,
            c.ratio_pct.max
        );
    }
}
