use crate::buffers::{CaptureWait, FrameBufferSet};
use crate::gateway::SensorGateway;
use crate::{Result, ServerError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sleep between iterations while the buffers are being reallocated.
const PAUSE_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Bound on each wait for a capture request.
    pub wait_timeout: Duration,
    /// Timeout handed to the driver for each frame read.
    pub frame_timeout: Duration,
    /// Delay before retrying after a failed read.
    pub retry_backoff: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(500),
            frame_timeout: Duration::from_millis(1000),
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// Counters maintained by the capture thread.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub captured: AtomicU64,
    pub failed: AtomicU64,
    /// Frames captured into buffers that were replaced mid-read.
    pub discarded: AtomicU64,
}

/// Background thread pulling frames from the sensor into the capture buffer.
///
/// Idles until the streaming side requests a frame, reads one with the
/// pipeline lock released, then publishes it as ready.
pub struct CaptureLoop {
    buffers: Arc<FrameBufferSet>,
    stats: Arc<CaptureStats>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureLoop {
    pub fn spawn(
        gateway: Arc<SensorGateway>,
        buffers: Arc<FrameBufferSet>,
        config: CaptureConfig,
    ) -> Result<CaptureLoop> {
        let stats = Arc::new(CaptureStats::default());
        buffers.arm_capture();

        let thread = {
            let buffers = buffers.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name("tofd-capture".into())
                .spawn(move || capture_loop(&gateway, &buffers, config, &stats))
                .map_err(|e| {
                    ServerError::ThreadSpawn(format!("Failed to spawn capture thread: {}", e))
                })?
        };

        Ok(CaptureLoop {
            buffers,
            stats,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread to exit and join it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.buffers.shutdown_capture();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(
    gateway: &SensorGateway,
    buffers: &FrameBufferSet,
    config: CaptureConfig,
    stats: &CaptureStats,
) {
    log::info!("Capture loop started");
    let mut consecutive_failures = 0u32;

    loop {
        let lease = match buffers.wait_capture_request(config.wait_timeout) {
            CaptureWait::Shutdown => break,
            CaptureWait::Idle => continue,
            CaptureWait::Paused => {
                std::thread::sleep(PAUSE_SLEEP);
                continue;
            }
            CaptureWait::Ready(lease) => lease,
        };

        let result = {
            let mut frame = lease.lock();
            gateway.get_frame(frame.as_mut_slice(), config.frame_timeout)
        };

        match result {
            Ok(()) => {
                consecutive_failures = 0;
                if buffers.complete_capture(lease) {
                    stats.captured.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(status) => {
                drop(lease);
                stats.failed.fetch_add(1, Ordering::Relaxed);
                consecutive_failures += 1;
                if consecutive_failures == 1 {
                    log::warn!("Frame capture failed: {}", status);
                } else {
                    log::debug!(
                        "Frame capture failed: {} ({} in a row)",
                        status,
                        consecutive_failures
                    );
                }
                std::thread::sleep(config.retry_backoff);
                // Nobody will ask again once streaming is gone.
                if buffers.is_streaming() {
                    buffers.request_capture();
                }
            }
        }
    }

    log::info!("Capture loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::FrameWait;
    use crate::interrupts::InterruptQueue;
    use crate::sim::{self, SimulatedSensor};
    use std::time::Instant;

    fn setup() -> (Arc<SimulatedSensor>, Arc<SensorGateway>, Arc<FrameBufferSet>) {
        let sensor = Arc::new(SimulatedSensor::new().with_frame_interval(Duration::from_millis(2)));
        let gateway = Arc::new(SensorGateway::new(
            sensor.clone(),
            Arc::new(InterruptQueue::default()),
        ));
        gateway.open().unwrap();
        let details = gateway.set_mode_by_index(0).unwrap();
        let buffers = Arc::new(FrameBufferSet::new(details.element_count()));
        (sensor, gateway, buffers)
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            wait_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn next_frame(buffers: &FrameBufferSet) -> Vec<u16> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let FrameWait::Ready(lease) = buffers.wait_frame_ready(Duration::from_millis(50)) {
                let frame = lease.lock().clone();
                return frame;
            }
        }
        panic!("no frame within deadline");
    }

    #[test]
    fn test_captures_on_request() {
        let (_sensor, gateway, buffers) = setup();
        let capture = CaptureLoop::spawn(gateway.clone(), buffers.clone(), config()).unwrap();
        gateway.start().unwrap();
        buffers.begin_streaming();
        buffers.request_capture();

        let first = sim::verify_frame(&next_frame(&buffers)).unwrap();
        let second = sim::verify_frame(&next_frame(&buffers)).unwrap();
        assert!(second > first);
        assert!(capture.stats().captured.load(Ordering::Relaxed) >= 2);
        capture.stop();
    }

    #[test]
    fn test_failures_are_retried() {
        let (sensor, gateway, buffers) = setup();
        let capture = CaptureLoop::spawn(gateway.clone(), buffers.clone(), config()).unwrap();
        gateway.start().unwrap();
        sensor.fail_next_frames(3);
        buffers.begin_streaming();
        buffers.request_capture();

        assert!(sim::verify_frame(&next_frame(&buffers)).is_some());
        assert_eq!(capture.stats().failed.load(Ordering::Relaxed), 3);
        capture.stop();
    }

    #[test]
    fn test_stop_joins_idle_thread() {
        let (_sensor, gateway, buffers) = setup();
        let capture = CaptureLoop::spawn(gateway, buffers, config()).unwrap();
        assert!(capture.is_running());
        let started = Instant::now();
        capture.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
