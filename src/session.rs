//! Owner of all mutable server state.
//!
//! One `ServerSession` lives for the whole process. RPC handlers and the
//! connection supervisor reach the sensor, the frame buffers and both loops
//! only through it.

use crate::buffers::FrameBufferSet;
use crate::capture::{CaptureConfig, CaptureLoop};
use crate::gateway::SensorGateway;
use crate::interrupts::InterruptQueue;
use crate::sensor::SensorEnumerator;
use crate::streaming::{FrameSinkFactory, StreamingConfig, StreamingLoop, StreamingStats};
use crate::types::{CardVersion, ModeDetails, SensorInfo, Status, StatusResult};
use std::sync::Arc;
use std::time::Duration;

/// Timing and sizing knobs for the session's loops.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub streaming: StreamingConfig,
    /// Bound on the buffer quiescence wait during a mode change.
    pub quiesce_timeout: Duration,
    pub interrupt_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            streaming: StreamingConfig::default(),
            quiesce_timeout: Duration::from_millis(1000),
            interrupt_capacity: crate::interrupts::DEFAULT_CAPACITY,
        }
    }
}

/// Engagement flags and thread liveness, for comparing session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub engaged: bool,
    pub capture_running: bool,
    pub streaming_running: bool,
    pub stream_off: bool,
}

pub struct ServerSession {
    enumerator: Box<dyn SensorEnumerator>,
    sensors_created: bool,
    gateway: Option<Arc<SensorGateway>>,
    engaged: bool,
    interrupts: Arc<InterruptQueue>,
    buffers: Arc<FrameBufferSet>,
    capture: Option<CaptureLoop>,
    streaming: Option<StreamingLoop>,
    last_streaming: StreamingStats,
    frames: Arc<dyn FrameSinkFactory>,
    repeat_frame: bool,
    config: SessionConfig,
}

impl ServerSession {
    pub fn new(
        enumerator: Box<dyn SensorEnumerator>,
        frames: Arc<dyn FrameSinkFactory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            enumerator,
            sensors_created: false,
            gateway: None,
            engaged: false,
            interrupts: Arc::new(InterruptQueue::new(config.interrupt_capacity)),
            buffers: Arc::new(FrameBufferSet::new(0)),
            capture: None,
            streaming: None,
            last_streaming: StreamingStats::default(),
            frames,
            repeat_frame: false,
            config,
        }
    }

    pub fn gateway(&self) -> Option<&Arc<SensorGateway>> {
        self.gateway.as_ref()
    }

    pub fn interrupts(&self) -> &InterruptQueue {
        &self.interrupts
    }

    pub fn buffers(&self) -> &Arc<FrameBufferSet> {
        &self.buffers
    }

    pub fn sensors_created(&self) -> bool {
        self.sensors_created
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some() || self.buffers.is_streaming()
    }

    pub fn repeat_frame(&self) -> bool {
        self.repeat_frame
    }

    pub fn set_repeat_frame(&mut self, enabled: bool) {
        if enabled != self.repeat_frame {
            log::info!("Same-frame repeat mode {}", if enabled { "on" } else { "off" });
        }
        self.repeat_frame = enabled;
    }

    /// Counters of the running streaming loop, or of the last one.
    pub fn streaming_stats(&self) -> StreamingStats {
        self.streaming
            .as_ref()
            .map_or(self.last_streaming, StreamingLoop::stats)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            engaged: self.engaged,
            capture_running: self.capture.as_ref().is_some_and(CaptureLoop::is_running),
            streaming_running: self.is_streaming(),
            stream_off: self.gateway.as_ref().map_or(true, |g| g.is_stream_off()),
        }
    }

    /// Enumerate sensors once, select the first depth sensor and subscribe to
    /// its interrupts.
    pub fn find_sensors(&mut self) -> StatusResult<SensorInfo> {
        if !self.sensors_created {
            if let Err(status) = self.enumerator.search_sensors() {
                log::warn!("Sensor search failed: {}", status);
                return Err(Status::Unavailable);
            }
            self.sensors_created = true;
        }

        let gateway = match &self.gateway {
            Some(gateway) => gateway.clone(),
            None => {
                let sensor = self
                    .enumerator
                    .depth_sensors()
                    .into_iter()
                    .next()
                    .ok_or(Status::Unreachable)?;
                let gateway = Arc::new(SensorGateway::new(sensor, self.interrupts.clone()));
                self.gateway = Some(gateway.clone());
                gateway
            }
        };

        // Interrupts are best-effort; a failed subscription is not fatal.
        if let Err(status) = gateway.register_interrupts() {
            log::warn!("Continuing without sensor interrupts: {}", status);
        }

        Ok(SensorInfo {
            name: gateway.name().to_string(),
            card_version: CardVersion {
                kernel: self.enumerator.kernel_version(),
                uboot: self.enumerator.uboot_version(),
                sd: self.enumerator.sd_version(),
            },
        })
    }

    fn require_gateway(&self) -> StatusResult<Arc<SensorGateway>> {
        self.gateway.clone().ok_or(Status::Unreachable)
    }

    /// Open the sensor and start the capture thread.
    pub fn open(&mut self) -> StatusResult<()> {
        let gateway = self.require_gateway()?;
        let status = gateway.open();
        self.engaged = true;

        if self.capture.is_none() {
            match CaptureLoop::spawn(gateway, self.buffers.clone(), self.config.capture) {
                Ok(capture) => self.capture = Some(capture),
                Err(e) => {
                    log::error!("{}", e);
                    return Err(Status::GenericError);
                }
            }
        }
        status
    }

    /// Start the sensor and the streaming loop, then trigger the first capture.
    pub fn start(&mut self) -> StatusResult<()> {
        let gateway = self.require_gateway()?;
        self.stop_streaming();

        gateway.start()?;

        if self.repeat_frame {
            self.capture_repeat_frame(&gateway);
        }

        let config = StreamingConfig {
            repeat_frame: self.repeat_frame,
            ..self.config.streaming
        };
        match StreamingLoop::spawn(self.buffers.clone(), self.frames.open_sink(), config) {
            Ok(streaming) => self.streaming = Some(streaming),
            Err(e) => {
                log::error!("{}", e);
                return Err(Status::GenericError);
            }
        }

        if !self.repeat_frame {
            self.buffers.request_capture();
        }
        Ok(())
    }

    /// Capture twice into the capture buffer and stage the second frame for
    /// endless re-sending. The first frame after a reset may be corrupt.
    fn capture_repeat_frame(&self, gateway: &SensorGateway) {
        let Some(lease) = self.buffers.lease_capture() else {
            log::error!("No frame buffers allocated; select a mode before starting");
            return;
        };
        for _ in 0..2 {
            let mut frame = lease.lock();
            if let Err(status) = gateway.get_frame(frame.as_mut_slice(), self.config.capture.frame_timeout) {
                log::error!("Failed to get frame for repeat mode: {}", status);
            }
        }
        drop(lease);
        self.buffers.swap_into_send();
    }

    fn stop_streaming(&mut self) {
        if let Some(streaming) = self.streaming.take() {
            self.last_streaming = streaming.stats();
            if !streaming.stop() {
                log::warn!("Streaming thread detached during stop");
            }
        }
    }

    /// Stop streaming and the sensor. Safe to call repeatedly.
    pub fn stop(&mut self) -> StatusResult<()> {
        let gateway = self.require_gateway()?;
        self.stop_streaming();
        gateway.stop()
    }

    fn check_mode_change(&self) -> StatusResult<Arc<SensorGateway>> {
        let gateway = self.require_gateway()?;
        if self.is_streaming() {
            log::warn!("Rejecting mode change while streaming");
            return Err(Status::Busy);
        }
        Ok(gateway)
    }

    fn resize_for(&self, details: &ModeDetails) {
        let outcome = self
            .buffers
            .resize(details.element_count(), self.config.quiesce_timeout);
        if !outcome.quiesced {
            log::warn!(
                "Mode {} applied without buffer quiescence after {:?}",
                details.mode_number,
                outcome.waited
            );
        }
    }

    /// Select a mode and size the frame buffers for it. Busy while streaming.
    pub fn set_mode_by_index(&mut self, mode: u8) -> StatusResult<ModeDetails> {
        let gateway = self.check_mode_change()?;
        let details = gateway.set_mode_by_index(mode)?;
        self.resize_for(&details);
        Ok(details)
    }

    pub fn set_mode(&mut self, details: &ModeDetails) -> StatusResult<()> {
        let gateway = self.check_mode_change()?;
        gateway.set_mode(details)?;
        self.resize_for(details);
        Ok(())
    }

    /// Release every sensor resource and forget the selected sensor.
    pub fn hang_up(&mut self) {
        if self.sensors_created {
            self.cleanup_sensors();
        }
        self.engaged = false;
    }

    fn cleanup_sensors(&mut self) {
        self.stop_streaming();
        if let Some(gateway) = &self.gateway {
            let _ = gateway.stop();
        }
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(gateway) = self.gateway.take() {
            gateway.unregister_interrupts();
        }
        self.interrupts.clear();
        self.repeat_frame = false;
        self.sensors_created = false;
        self.engaged = false;
        log::info!("Sensor resources released");
    }

    /// The primary client is gone: stop streaming, drop the stream peer and
    /// release the sensor.
    pub fn teardown_client(&mut self) {
        self.stop_streaming();
        self.frames.release();
        self.hang_up();
    }

    pub fn shutdown(&mut self) {
        self.teardown_client();
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.hang_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedEnumerator, SimulatedSensor};
    use crate::streaming::{FrameSink, SendOutcome};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct NullFrames {
        releases: Mutex<usize>,
    }

    struct NullSink;

    impl FrameSink for NullSink {
        fn send(&mut self, _payload: Vec<u8>, _timeout: Duration) -> SendOutcome {
            SendOutcome::Sent
        }
    }

    impl FrameSinkFactory for NullFrames {
        fn open_sink(&self) -> Box<dyn FrameSink> {
            Box::new(NullSink)
        }

        fn release(&self) {
            *self.releases.lock() += 1;
        }
    }

    fn session() -> (Arc<SimulatedSensor>, ServerSession) {
        let sensor = Arc::new(SimulatedSensor::new().with_frame_interval(Duration::from_millis(1)));
        let enumerator = SimulatedEnumerator::new(vec![sensor.clone()]);
        let config = SessionConfig {
            capture: CaptureConfig {
                wait_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            streaming: StreamingConfig {
                wait_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        };
        let session = ServerSession::new(Box::new(enumerator), Arc::new(NullFrames::default()), config);
        (sensor, session)
    }

    #[test]
    fn test_operations_need_a_sensor() {
        let (_, mut session) = session();
        assert_eq!(session.open(), Err(Status::Unreachable));
        assert_eq!(session.stop(), Err(Status::Unreachable));
    }

    #[test]
    fn test_no_sensor_attached() {
        let mut session = ServerSession::new(
            Box::new(SimulatedEnumerator::empty()),
            Arc::new(NullFrames::default()),
            SessionConfig::default(),
        );
        assert_eq!(session.find_sensors(), Err(Status::Unreachable));
    }

    #[test]
    fn test_find_sensors_reports_versions() {
        let (sensor, mut session) = session();
        let info = session.find_sensors().unwrap();
        assert_eq!(info.name, "sim-tof");
        assert_eq!(info.card_version.kernel, "sim-kernel-1.0");
        assert!(sensor.has_interrupt_callback());
    }

    #[test]
    fn test_mode_change_rejected_while_streaming() {
        let (_, mut session) = session();
        session.find_sensors().unwrap();
        session.open().unwrap();
        session.set_mode_by_index(0).unwrap();
        session.start().unwrap();

        assert_eq!(session.set_mode_by_index(1), Err(Status::Busy));
        assert_eq!(session.buffers().element_count(), 64 * 64 * 4);

        session.stop().unwrap();
        let details = session.set_mode_by_index(1).unwrap();
        assert_eq!(session.buffers().element_count(), details.element_count());
    }

    #[test]
    fn test_rapid_mode_switches_keep_buffers_consistent() {
        let (_, mut session) = session();
        session.find_sensors().unwrap();
        session.open().unwrap();
        for i in 0..30u8 {
            let details = session.set_mode_by_index(i % 3).unwrap();
            assert_eq!(session.buffers().element_count(), details.element_count());
            let lease = session.buffers().lease_capture().unwrap();
            assert_eq!(lease.lock().len(), details.element_count());
        }
        assert_eq!(session.buffers().live_buffers(), 2);
    }

    #[test]
    fn test_double_stop_reaches_hardware_once() {
        let (sensor, mut session) = session();
        session.find_sensors().unwrap();
        session.open().unwrap();
        session.set_mode_by_index(0).unwrap();
        session.start().unwrap();

        assert_eq!(session.stop(), Ok(()));
        assert_eq!(session.stop(), Ok(()));
        assert_eq!(sensor.stop_calls(), 1);
    }

    #[test]
    fn test_hang_up_restores_pre_open_state() {
        let (sensor, mut session) = session();
        session.find_sensors().unwrap();
        let before = session.snapshot();

        session.open().unwrap();
        session.set_mode_by_index(0).unwrap();
        session.start().unwrap();
        sensor.raise_interrupt(5);
        assert!(session.interrupts().has_pending());
        assert!(session.snapshot().capture_running);
        session.stop().unwrap();
        session.hang_up();

        assert_eq!(session.snapshot(), before);
        assert!(!session.sensors_created());
        assert!(session.interrupts().is_empty());
        assert!(!sensor.has_interrupt_callback());
    }

    #[test]
    fn test_teardown_releases_stream_peer() {
        let frames = Arc::new(NullFrames::default());
        let sensor = Arc::new(SimulatedSensor::new());
        let mut session = ServerSession::new(
            Box::new(SimulatedEnumerator::new(vec![sensor.clone()])),
            frames.clone(),
            SessionConfig::default(),
        );
        session.find_sensors().unwrap();
        session.open().unwrap();
        session.set_mode_by_index(0).unwrap();
        session.start().unwrap();

        session.teardown_client();
        assert_eq!(*frames.releases.lock(), 1);
        assert!(!session.is_engaged());
        assert!(!sensor.is_streaming());
        assert!(!session.snapshot().streaming_running);
    }

    #[test]
    fn test_repeat_mode_stages_second_frame() {
        let (sensor, mut session) = session();
        session.find_sensors().unwrap();
        session.open().unwrap();
        session.set_mode_by_index(1).unwrap();
        session.set_repeat_frame(true);
        session.start().unwrap();
        assert_eq!(sensor.frames_delivered(), 2);
        session.stop().unwrap();
    }
}
