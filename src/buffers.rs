//! Double-buffered frame storage shared by the capture and streaming loops.
//!
//! All cross-thread pipeline state lives in one mutex-guarded
//! [`PipelineState`] with a single frame condition variable for the
//! capture/send handshake and a second one signalled whenever the last
//! outstanding [`BufferLease`] is released. A resize raises the
//! reallocation flag, waits on that second condition variable until no lease
//! is outstanding (bounded), then swaps in fresh buffers and bumps the
//! generation. Completions carrying a stale generation are discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Decrements the live-buffer counter when the buffer is freed.
struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One raw pixel buffer.
pub struct FrameBuffer {
    data: Mutex<Vec<u16>>,
    _live: LiveToken,
}

impl FrameBuffer {
    fn new(element_count: usize, live: &Arc<AtomicUsize>) -> Self {
        Self {
            data: Mutex::new(vec![0; element_count]),
            _live: LiveToken::new(live),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PipelineState {
    capture: Arc<FrameBuffer>,
    send: Arc<FrameBuffer>,
    element_count: usize,
    generation: u64,
    capture_requested: bool,
    frame_ready: bool,
    reallocating: bool,
    leases: usize,
    capture_shutdown: bool,
    streaming_stop: bool,
    streaming_running: bool,
}

/// Result of [`FrameBufferSet::resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeOutcome {
    /// False when the quiescence wait timed out and the swap went ahead anyway.
    pub quiesced: bool,
    pub waited: Duration,
}

/// What the capture loop should do next.
pub enum CaptureWait<'a> {
    Shutdown,
    /// No request within the timeout.
    Idle,
    /// A reallocation is in progress or no mode has been selected yet.
    Paused,
    Ready(BufferLease<'a>),
}

/// What the streaming loop should do next.
pub enum FrameWait<'a> {
    Stopped,
    Idle,
    Paused,
    /// Lease on the send buffer, already holding a copy of the latest frame.
    Ready(BufferLease<'a>),
}

/// A loop's in-flight reference to one of the buffers.
///
/// Dropping the lease tells a pending resize that this loop is done with the
/// buffer.
pub struct BufferLease<'a> {
    set: &'a FrameBufferSet,
    buffer: Arc<FrameBuffer>,
    generation: u64,
}

impl BufferLease<'_> {
    pub fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        self.buffer.lock()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        self.set.release_lease();
    }
}

pub struct FrameBufferSet {
    state: Mutex<PipelineState>,
    frame_cv: Condvar,
    quiesced: Condvar,
    live: Arc<AtomicUsize>,
}

impl FrameBufferSet {
    pub fn new(element_count: usize) -> Self {
        let live = Arc::new(AtomicUsize::new(0));
        let state = PipelineState {
            capture: Arc::new(FrameBuffer::new(element_count, &live)),
            send: Arc::new(FrameBuffer::new(element_count, &live)),
            element_count,
            generation: 0,
            capture_requested: false,
            frame_ready: false,
            reallocating: false,
            leases: 0,
            capture_shutdown: false,
            streaming_stop: true,
            streaming_running: false,
        };
        Self {
            state: Mutex::new(state),
            frame_cv: Condvar::new(),
            quiesced: Condvar::new(),
            live,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| {
            log::error!("Frame pipeline lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn wait_frame<'a>(
        &self,
        state: MutexGuard<'a, PipelineState>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, PipelineState>> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (state, _) = self
            .frame_cv
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Some(state)
    }

    fn lease(&self, state: &mut PipelineState, buffer: Arc<FrameBuffer>) -> BufferLease<'_> {
        state.leases += 1;
        BufferLease {
            set: self,
            buffer,
            generation: state.generation,
        }
    }

    fn release_lease(&self) {
        let mut state = self.lock();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            self.quiesced.notify_all();
        }
    }

    fn replace_buffers(&self, state: &mut PipelineState, element_count: usize) {
        state.capture_requested = false;
        state.frame_ready = false;
        state.capture = Arc::new(FrameBuffer::new(element_count, &self.live));
        state.send = Arc::new(FrameBuffer::new(element_count, &self.live));
        state.element_count = element_count;
        state.generation += 1;
    }

    /// Replace both buffers with fresh zeroed ones without waiting for
    /// quiescence. Only safe while neither loop is running.
    pub fn allocate(&self, element_count: usize) {
        let mut state = self.lock();
        self.replace_buffers(&mut state, element_count);
        drop(state);
        self.frame_cv.notify_all();
    }

    /// Quiesce both loops, then reallocate both buffers at the new size.
    ///
    /// Waits up to `timeout` for outstanding leases to be released. If the
    /// wait times out the swap proceeds anyway: leaseholders keep the old
    /// buffers alive and their results are discarded by generation.
    pub fn resize(&self, element_count: usize, timeout: Duration) -> ResizeOutcome {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.lock();
        state.reallocating = true;
        let mut quiesced = true;
        while state.leases > 0 {
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "Buffers still in use by {} loop(s) after {:?}, reallocating anyway",
                    state.leases,
                    timeout
                );
                quiesced = false;
                break;
            }
            let (guard, _) = self
                .quiesced
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        self.replace_buffers(&mut state, element_count);
        state.reallocating = false;
        log::info!(
            "Frame buffers reallocated: {} elements, generation {}",
            element_count,
            state.generation
        );
        drop(state);
        self.frame_cv.notify_all();
        ResizeOutcome {
            quiesced,
            waited: started.elapsed(),
        }
    }

    /// Block until a capture is requested, the loop is told to exit, or
    /// `timeout` elapses. A granted request is consumed.
    pub fn wait_capture_request(&self, timeout: Duration) -> CaptureWait<'_> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.capture_shutdown {
                return CaptureWait::Shutdown;
            }
            if state.reallocating {
                return CaptureWait::Paused;
            }
            if state.capture_requested {
                if state.element_count == 0 {
                    return CaptureWait::Paused;
                }
                state.capture_requested = false;
                let buffer = state.capture.clone();
                return CaptureWait::Ready(self.lease(&mut state, buffer));
            }
            state = match self.wait_frame(state, deadline) {
                Some(state) => state,
                None => return CaptureWait::Idle,
            };
        }
    }

    /// Publish a filled capture buffer. Returns false when the frame was
    /// discarded because the buffers were replaced while it was captured.
    pub fn complete_capture(&self, lease: BufferLease<'_>) -> bool {
        let published = {
            let mut state = self.lock();
            if lease.generation == state.generation && !state.reallocating {
                state.frame_ready = true;
                true
            } else {
                false
            }
        };
        drop(lease);
        if published {
            self.frame_cv.notify_all();
        } else {
            log::debug!("Discarded frame captured into replaced buffers");
        }
        published
    }

    /// Block until a frame is ready, then copy it into the send buffer and
    /// request the next capture. The copy happens under the pipeline lock;
    /// encoding and transmission happen on the returned lease without it.
    pub fn wait_frame_ready(&self, timeout: Duration) -> FrameWait<'_> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.streaming_stop {
                return FrameWait::Stopped;
            }
            if state.reallocating {
                return FrameWait::Paused;
            }
            if state.frame_ready {
                Self::copy_capture_to_send(&state);
                state.frame_ready = false;
                state.capture_requested = true;
                let buffer = state.send.clone();
                let lease = self.lease(&mut state, buffer);
                drop(state);
                self.frame_cv.notify_all();
                return FrameWait::Ready(lease);
            }
            state = match self.wait_frame(state, deadline) {
                Some(state) => state,
                None => return FrameWait::Idle,
            };
        }
    }

    fn copy_capture_to_send(state: &PipelineState) {
        let capture = state.capture.lock();
        let mut send = state.send.lock();
        if capture.len() == send.len() {
            send.copy_from_slice(&capture);
        } else {
            log::error!(
                "Buffer size mismatch: capture {} vs send {}",
                capture.len(),
                send.len()
            );
        }
    }

    /// Copy the capture buffer into the send buffer outside the handshake.
    pub fn swap_into_send(&self) {
        let state = self.lock();
        Self::copy_capture_to_send(&state);
    }

    /// Lease the capture buffer directly, bypassing the request flag.
    pub fn lease_capture(&self) -> Option<BufferLease<'_>> {
        let mut state = self.lock();
        if state.reallocating || state.element_count == 0 {
            return None;
        }
        let buffer = state.capture.clone();
        Some(self.lease(&mut state, buffer))
    }

    /// Lease the send buffer as-is, for re-sending the same frame.
    pub fn lease_send(&self) -> Option<BufferLease<'_>> {
        let mut state = self.lock();
        if state.reallocating || state.streaming_stop {
            return None;
        }
        let buffer = state.send.clone();
        Some(self.lease(&mut state, buffer))
    }

    pub fn request_capture(&self) {
        self.lock().capture_requested = true;
        self.frame_cv.notify_all();
    }

    /// Clear a previous capture shutdown so a new capture loop can run.
    pub fn arm_capture(&self) {
        self.lock().capture_shutdown = false;
    }

    pub fn shutdown_capture(&self) {
        self.lock().capture_shutdown = true;
        self.frame_cv.notify_all();
    }

    /// Mark the streaming loop as running. Discards any frame captured
    /// before this point.
    pub fn begin_streaming(&self) {
        let mut state = self.lock();
        state.streaming_stop = false;
        state.streaming_running = true;
        state.frame_ready = false;
    }

    pub fn request_stream_stop(&self) {
        self.lock().streaming_stop = true;
        self.frame_cv.notify_all();
    }

    pub fn stream_stop_requested(&self) -> bool {
        self.lock().streaming_stop
    }

    /// Called by the streaming thread as its last action.
    pub fn streaming_exited(&self) {
        self.lock().streaming_running = false;
        self.frame_cv.notify_all();
    }

    /// Wait up to `step` for the streaming thread to confirm exit.
    pub fn wait_streaming_exit(&self, step: Duration) -> bool {
        let deadline = Instant::now() + step;
        let mut state = self.lock();
        while state.streaming_running {
            state = match self.wait_frame(state, deadline) {
                Some(state) => state,
                None => return false,
            };
        }
        true
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming_running
    }

    pub fn element_count(&self) -> usize {
        self.lock().element_count
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Frame buffers currently allocated, including replaced buffers still
    /// held by a lease.
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Outstanding leases.
    pub fn leases(&self) -> usize {
        self.lock().leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(200);

    fn capture_lease(set: &FrameBufferSet) -> BufferLease<'_> {
        set.request_capture();
        match set.wait_capture_request(WAIT) {
            CaptureWait::Ready(lease) => lease,
            _ => panic!("expected a capture lease"),
        }
    }

    #[test]
    fn test_capture_send_handshake() {
        let set = FrameBufferSet::new(8);
        set.begin_streaming();

        let lease = capture_lease(&set);
        lease.lock().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(set.complete_capture(lease));

        let send = match set.wait_frame_ready(WAIT) {
            FrameWait::Ready(lease) => lease,
            _ => panic!("expected a ready frame"),
        };
        assert_eq!(*send.lock(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        drop(send);

        // Copy completion requests the next capture.
        assert!(matches!(set.wait_capture_request(WAIT), CaptureWait::Ready(_)));
        assert_eq!(set.leases(), 0);
    }

    #[test]
    fn test_wait_without_request_is_idle() {
        let set = FrameBufferSet::new(8);
        let wait = set.wait_capture_request(Duration::from_millis(20));
        assert!(matches!(wait, CaptureWait::Idle));
    }

    #[test]
    fn test_empty_buffers_pause_capture() {
        let set = FrameBufferSet::new(0);
        set.request_capture();
        assert!(matches!(set.wait_capture_request(WAIT), CaptureWait::Paused));
    }

    #[test]
    fn test_resize_waits_for_lease_release() {
        let set = Arc::new(FrameBufferSet::new(16));
        let lease_taken = Arc::new(std::sync::Barrier::new(2));

        let holder = {
            let set = set.clone();
            let lease_taken = lease_taken.clone();
            thread::spawn(move || {
                let lease = capture_lease(&set);
                lease_taken.wait();
                thread::sleep(Duration::from_millis(60));
                assert!(!set.complete_capture(lease));
            })
        };

        lease_taken.wait();
        let outcome = set.resize(32, Duration::from_secs(2));
        holder.join().unwrap();

        assert!(outcome.quiesced);
        assert!(outcome.waited >= Duration::from_millis(40));
        assert_eq!(set.element_count(), 32);
        assert_eq!(set.live_buffers(), 2);
    }

    #[test]
    fn test_resize_timeout_proceeds_and_discards_stale_frame() {
        let set = FrameBufferSet::new(16);
        let lease = capture_lease(&set);

        let outcome = set.resize(4, Duration::from_millis(30));
        assert!(!outcome.quiesced);
        assert_eq!(set.element_count(), 4);

        // The stale lease still points at the old, intact buffer.
        assert_eq!(lease.lock().len(), 16);
        assert_eq!(set.live_buffers(), 3);
        assert!(!set.complete_capture(lease));
        assert_eq!(set.live_buffers(), 2);
    }

    #[test]
    fn test_repeated_resizes_keep_two_buffers() {
        let set = FrameBufferSet::new(4);
        for n in 1..20 {
            set.resize(n * 10, WAIT);
            assert_eq!(set.element_count(), n * 10);
            let lease = set.lease_capture().unwrap();
            assert_eq!(lease.lock().len(), n * 10);
        }
        assert_eq!(set.live_buffers(), 2);
        assert_eq!(set.generation(), 19);
    }

    #[test]
    fn test_stream_stop_wakes_waiter() {
        let set = Arc::new(FrameBufferSet::new(4));
        set.begin_streaming();
        let waiter = {
            let set = set.clone();
            thread::spawn(move || {
                let stopped = matches!(
                    set.wait_frame_ready(Duration::from_secs(5)),
                    FrameWait::Stopped
                );
                stopped
            })
        };
        thread::sleep(Duration::from_millis(20));
        set.request_stream_stop();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_streaming_exit_confirmation() {
        let set = FrameBufferSet::new(4);
        set.begin_streaming();
        assert!(!set.wait_streaming_exit(Duration::from_millis(10)));
        set.streaming_exited();
        assert!(set.wait_streaming_exit(Duration::from_millis(10)));
        assert!(!set.is_streaming());
    }
}
