use crate::interrupts::InterruptQueue;
use crate::sensor::{DepthSensor, InterruptCallback};
use crate::types::{DepthComputeParams, ModeDetails, StatusResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Exclusive owner of the selected depth sensor.
///
/// Thin synchronous wrapper that logs driver failures, forwards interrupts
/// into the [`InterruptQueue`], and keeps the stream-off flag so repeated
/// stops never reach the hardware twice.
pub struct SensorGateway {
    sensor: Arc<dyn DepthSensor>,
    interrupts: Arc<InterruptQueue>,
    name: String,
    stream_off: AtomicBool,
    callback_registered: AtomicBool,
}

impl SensorGateway {
    pub fn new(sensor: Arc<dyn DepthSensor>, interrupts: Arc<InterruptQueue>) -> Self {
        let name = sensor.name();
        log::info!("Selected depth sensor: {}", name);
        Self {
            sensor,
            interrupts,
            name,
            stream_off: AtomicBool::new(true),
            callback_registered: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the sensor is known to be stopped.
    pub fn is_stream_off(&self) -> bool {
        self.stream_off.load(Ordering::Acquire)
    }

    /// Subscribe to hardware interrupts; each code is pushed into the queue.
    pub fn register_interrupts(&self) -> StatusResult<()> {
        if self.callback_registered.load(Ordering::Acquire) {
            return Ok(());
        }
        let queue = self.interrupts.clone();
        let callback: InterruptCallback = Arc::new(move |code| {
            log::debug!("Sensor interrupt: status = {}", code);
            queue.push(code);
        });
        let result = self.sensor.register_interrupt_callback(callback);
        match result {
            Ok(()) => self.callback_registered.store(true, Ordering::Release),
            Err(status) => log::warn!("Could not register interrupt callback: {}", status),
        }
        result
    }

    pub fn unregister_interrupts(&self) {
        if !self.callback_registered.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(status) = self.sensor.unregister_interrupt_callback() {
            log::warn!("Could not unregister interrupt callback: {}", status);
        }
    }

    pub fn open(&self) -> StatusResult<()> {
        self.logged("open", self.sensor.open())
    }

    pub fn start(&self) -> StatusResult<()> {
        // Expect a stream-off after every start attempt, even a failed one.
        self.stream_off.store(false, Ordering::Release);
        self.logged("start", self.sensor.start())
    }

    /// Stop streaming. A no-op returning `Ok` when already stopped.
    pub fn stop(&self) -> StatusResult<()> {
        if self.is_stream_off() {
            log::debug!("Sensor already stopped, skipping stream-off");
            return Ok(());
        }
        let result = self.logged("stop", self.sensor.stop());
        self.stream_off.store(result.is_ok(), Ordering::Release);
        result
    }

    pub fn available_modes(&self) -> StatusResult<Vec<u8>> {
        self.logged("available_modes", self.sensor.available_modes())
    }

    pub fn mode_details(&self, mode: u8) -> StatusResult<ModeDetails> {
        self.logged("mode_details", self.sensor.mode_details(mode))
    }

    /// Select a mode by index and return its descriptor.
    pub fn set_mode_by_index(&self, mode: u8) -> StatusResult<ModeDetails> {
        self.logged("set_mode_by_index", self.sensor.set_mode_by_index(mode))?;
        self.mode_details(mode)
    }

    pub fn set_mode(&self, details: &ModeDetails) -> StatusResult<()> {
        self.logged("set_mode", self.sensor.set_mode(details))
    }

    /// Blocking frame read. Failures are left to the caller to log; the
    /// capture loop sees plenty of them while the sensor is stopped.
    pub fn get_frame(&self, frame: &mut [u16], timeout: Duration) -> StatusResult<()> {
        self.sensor.get_frame(frame, timeout)
    }

    pub fn available_controls(&self) -> StatusResult<Vec<String>> {
        self.logged("available_controls", self.sensor.available_controls())
    }

    pub fn set_control(&self, name: &str, value: &str) -> StatusResult<()> {
        self.logged("set_control", self.sensor.set_control(name, value))
    }

    pub fn control(&self, name: &str) -> StatusResult<String> {
        self.logged("control", self.sensor.control(name))
    }

    pub fn set_sensor_configuration(&self, configuration: &str) -> StatusResult<()> {
        self.logged(
            "set_sensor_configuration",
            self.sensor.set_sensor_configuration(configuration),
        )
    }

    pub fn init_target_depth_compute(&self, ini: &[u8], calibration: &[u8]) -> StatusResult<()> {
        self.logged(
            "init_target_depth_compute",
            self.sensor.init_target_depth_compute(ini, calibration),
        )
    }

    pub fn read_register(&self, cmd: u16, delay_us: u32) -> StatusResult<u16> {
        self.logged("read_register", self.sensor.read_register(cmd, delay_us))
    }

    pub fn write_register(&self, cmd: u16, value: u16, delay_us: u32) -> StatusResult<()> {
        self.logged(
            "write_register",
            self.sensor.write_register(cmd, value, delay_us),
        )
    }

    pub fn read_payload_cmd(&self, cmd: u32, data: &mut [u8]) -> StatusResult<()> {
        self.logged("read_payload_cmd", self.sensor.read_payload_cmd(cmd, data))
    }

    pub fn read_payload(&self, data: &mut [u8]) -> StatusResult<()> {
        self.logged("read_payload", self.sensor.read_payload(data))
    }

    pub fn write_payload_cmd(&self, cmd: u32, data: &[u8]) -> StatusResult<()> {
        self.logged("write_payload_cmd", self.sensor.write_payload_cmd(cmd, data))
    }

    pub fn write_payload(&self, data: &[u8]) -> StatusResult<()> {
        self.logged("write_payload", self.sensor.write_payload(data))
    }

    pub fn chip_status(&self) -> StatusResult<(i32, i32)> {
        self.logged("chip_status", self.sensor.chip_status())
    }

    pub fn depth_compute_params(&self) -> StatusResult<DepthComputeParams> {
        self.logged("depth_compute_params", self.sensor.depth_compute_params())
    }

    pub fn set_depth_compute_params(&self, params: &DepthComputeParams) -> StatusResult<()> {
        self.logged(
            "set_depth_compute_params",
            self.sensor.set_depth_compute_params(params),
        )
    }

    pub fn ini_params_for_mode(&self, mode: i32) -> StatusResult<String> {
        self.logged("ini_params_for_mode", self.sensor.ini_params_for_mode(mode))
    }

    fn logged<T>(&self, operation: &str, result: StatusResult<T>) -> StatusResult<T> {
        if let Err(status) = &result {
            log::warn!("Sensor {} failed: {}", operation, status);
        }
        result
    }
}

impl Drop for SensorGateway {
    fn drop(&mut self) {
        self.unregister_interrupts();
    }
}
