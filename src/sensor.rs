//! Driver seam for the depth sensor hardware.
//!
//! The server never talks to hardware directly: everything goes through a
//! [`DepthSensor`] obtained from a [`SensorEnumerator`]. Implementations are
//! synchronous and must be callable from several threads at once (the capture
//! thread reads frames while the RPC thread reads registers).

use crate::types::{DepthComputeParams, ModeDetails, StatusResult};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by the driver, on an arbitrary thread, for every
/// asynchronous hardware status event.
pub type InterruptCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Black-box synchronous driver interface.
pub trait DepthSensor: Send + Sync {
    fn name(&self) -> String;

    fn open(&self) -> StatusResult<()>;
    fn start(&self) -> StatusResult<()>;
    fn stop(&self) -> StatusResult<()>;

    fn available_modes(&self) -> StatusResult<Vec<u8>>;
    fn mode_details(&self, mode: u8) -> StatusResult<ModeDetails>;
    fn set_mode_by_index(&self, mode: u8) -> StatusResult<()>;
    fn set_mode(&self, details: &ModeDetails) -> StatusResult<()>;

    /// Block until the next frame lands in `frame` or `timeout` elapses.
    ///
    /// `frame` must be exactly the element count of the active mode. On error
    /// its content is unspecified.
    fn get_frame(&self, frame: &mut [u16], timeout: Duration) -> StatusResult<()>;

    fn available_controls(&self) -> StatusResult<Vec<String>>;
    fn set_control(&self, name: &str, value: &str) -> StatusResult<()>;
    fn control(&self, name: &str) -> StatusResult<String>;

    fn set_sensor_configuration(&self, configuration: &str) -> StatusResult<()>;
    fn init_target_depth_compute(&self, ini: &[u8], calibration: &[u8]) -> StatusResult<()>;

    /// Read a 16-bit register through the imager's command interface.
    fn read_register(&self, cmd: u16, delay_us: u32) -> StatusResult<u16>;
    fn write_register(&self, cmd: u16, value: u16, delay_us: u32) -> StatusResult<()>;

    /// Issue a payload read command. `data` arrives pre-filled with the
    /// command arguments and is overwritten with the answer.
    fn read_payload_cmd(&self, cmd: u32, data: &mut [u8]) -> StatusResult<()>;
    fn read_payload(&self, data: &mut [u8]) -> StatusResult<()>;
    fn write_payload_cmd(&self, cmd: u32, data: &[u8]) -> StatusResult<()>;
    fn write_payload(&self, data: &[u8]) -> StatusResult<()>;

    /// Returns `(chip_status, imager_status)`.
    fn chip_status(&self) -> StatusResult<(i32, i32)>;

    fn depth_compute_params(&self) -> StatusResult<DepthComputeParams>;
    fn set_depth_compute_params(&self, params: &DepthComputeParams) -> StatusResult<()>;
    fn ini_params_for_mode(&self, mode: i32) -> StatusResult<String>;

    fn register_interrupt_callback(&self, callback: InterruptCallback) -> StatusResult<()>;
    fn unregister_interrupt_callback(&self) -> StatusResult<()>;
}

/// Discovers the sensors attached to the board.
pub trait SensorEnumerator: Send {
    fn search_sensors(&mut self) -> StatusResult<()>;
    fn depth_sensors(&self) -> Vec<Arc<dyn DepthSensor>>;

    fn kernel_version(&self) -> String;
    fn uboot_version(&self) -> String;
    fn sd_version(&self) -> String;
}
