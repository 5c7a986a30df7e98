use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of a sensor driver call, reported verbatim to the remote client.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    Ok = 0,
    /// Device is busy, or the request conflicts with the current pipeline state.
    Busy = 1,
    /// Device could not be reached (missing, unplugged, never enumerated).
    Unreachable = 2,
    InvalidArgument = 3,
    /// Operation is not available in the current device state.
    Unavailable = 4,
    GenericError = 5,
    Timeout = 6,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Convert into a Rust result, tagging failures with the operation name.
    pub fn into_result(self, operation: &'static str) -> crate::Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(crate::ServerError::Sensor {
                operation,
                status: self,
            })
        }
    }

    /// Collapse a driver result into its status code.
    pub fn of<T>(result: &StatusResult<T>) -> Status {
        match result {
            Ok(_) => Status::Ok,
            Err(status) => *status,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Busy => "BUSY",
            Status::Unreachable => "UNREACHABLE",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::Unavailable => "UNAVAILABLE",
            Status::GenericError => "GENERIC_ERROR",
            Status::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Result of a driver call. The error side never holds [`Status::Ok`].
pub type StatusResult<T> = std::result::Result<T, Status>;

/// Whether the server recognised the requested operation at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServerStatus {
    #[default]
    RequestAccepted,
    RequestUnknown,
}

/// Description of one sensor mode (resolution and pixel layout).
///
/// Immutable once read from the driver; selecting another mode yields a new
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModeDetails {
    pub mode_number: u8,
    pub pixel_format_index: u8,
    pub frame_width_in_bytes: u32,
    pub frame_height_in_bytes: u32,
    pub base_resolution_width: u32,
    pub base_resolution_height: u32,
    pub metadata_size: u32,
    pub is_pcm: bool,
    pub number_of_phases: u8,
    /// Frame components produced in this mode, e.g. `["raw", "depth", "ab", "conf"]`.
    pub frame_content: Vec<String>,
}

impl ModeDetails {
    /// Number of 16-bit elements a processed frame of this mode occupies.
    ///
    /// PCM modes carry one plane per phase; every other mode carries four
    /// planes (depth, AB, confidence, metadata).
    pub fn element_count(&self) -> usize {
        let pixels = self.base_resolution_width as usize * self.base_resolution_height as usize;
        if self.is_pcm {
            pixels * self.number_of_phases as usize
        } else {
            pixels * 4
        }
    }
}

/// Versions of the software image running on the camera's host board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CardVersion {
    pub kernel: String,
    pub uboot: String,
    pub sd: String,
}

/// Sensor identification returned by `FindSensors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SensorInfo {
    pub name: String,
    pub card_version: CardVersion,
}

/// Depth compute tuning parameters, keyed by INI name.
pub type DepthComputeParams = BTreeMap<String, String>;

/// Ordered depth compute parameter keys as exchanged over the wire.
///
/// `GetDepthComputeParam` answers all twelve; `SetDepthComputeParam` takes the
/// first eleven (`headerSize` is read-only).
pub const DEPTH_COMPUTE_KEYS: [&str; 12] = [
    "abThreshMin",
    "abSumThresh",
    "confThresh",
    "radialThreshMin",
    "radialThreshMax",
    "jblfApplyFlag",
    "jblfWindowSize",
    "jblfGaussianSigma",
    "jblfExponentialTerm",
    "jblfMaxEdge",
    "jblfABThreshold",
    "headerSize",
];

/// Number of depth compute keys a client may write.
pub const WRITABLE_DEPTH_COMPUTE_KEYS: usize = 11;

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u32, height: u32, is_pcm: bool, phases: u8) -> ModeDetails {
        ModeDetails {
            base_resolution_width: width,
            base_resolution_height: height,
            is_pcm,
            number_of_phases: phases,
            ..Default::default()
        }
    }

    #[test]
    fn test_element_count_pcm_uses_phases() {
        assert_eq!(mode(64, 48, true, 3).element_count(), 64 * 48 * 3);
    }

    #[test]
    fn test_element_count_processed_uses_four_planes() {
        assert_eq!(mode(512, 512, false, 2).element_count(), 512 * 512 * 4);
    }

    #[test]
    fn test_status_into_result() {
        assert!(Status::Ok.into_result("open").is_ok());
        let err = Status::Busy.into_result("open").unwrap_err();
        assert_eq!(err.to_string(), "Sensor returned BUSY during open");
    }
}
