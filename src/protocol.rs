use crate::types::{ModeDetails, SensorInfo, ServerStatus, Status};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// -- Messages on the control channel --

/// Reply text for `ServerConnect` when the caller may proceed.
pub const CONNECTION_ALLOWED: &str = "Connection Allowed";
/// Reply text for any peer other than the primary client.
pub const ONLY_ONE_CLIENT: &str = "Only 1 client connection allowed";
/// Reply text for unrecognised operation names.
pub const FUNCTION_NOT_FOUND: &str = "Function not found";

macro_rules! operations {
    ($($variant:ident),+ $(,)?) => {
        /// Every operation the server understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Operation {
            $($variant),+
        }

        impl Operation {
            pub const ALL: &'static [Operation] = &[$(Operation::$variant),+];

            /// Wire name of the operation.
            pub fn name(self) -> &'static str {
                match self {
                    $(Operation::$variant => stringify!($variant)),+
                }
            }

            pub fn from_name(name: &str) -> Option<Operation> {
                match name {
                    $(stringify!($variant) => Some(Operation::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

operations! {
    FindSensors,
    Open,
    Start,
    Stop,
    GetAvailableModes,
    GetModeDetails,
    SetModeByIndex,
    SetMode,
    GetAvailableControls,
    SetControl,
    GetControl,
    SetSensorConfiguration,
    InitTargetDepthCompute,
    Adsd3500ReadCmd,
    Adsd3500WriteCmd,
    Adsd3500ReadPayloadCmd,
    Adsd3500ReadPayload,
    Adsd3500WritePayloadCmd,
    Adsd3500WritePayload,
    Adsd3500GetStatus,
    GetInterrupts,
    HangUp,
    GetDepthComputeParam,
    SetDepthComputeParam,
    GetIniArray,
    ServerConnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Operation::from_name(s).ok_or_else(|| format!("unknown operation '{}'", s))
    }
}

/// A client command: operation name plus positional parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Request {
    pub func_name: String,
    pub int32_params: Vec<i32>,
    pub string_params: Vec<String>,
    pub bytes_params: Vec<Vec<u8>>,
    /// Mode descriptor for `SetMode`.
    pub mode_details: Option<ModeDetails>,
}

impl Request {
    pub fn new(operation: Operation) -> Self {
        Self::named(operation.name())
    }

    /// Request with an arbitrary, possibly unknown, operation name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            func_name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_int32(mut self, value: i32) -> Self {
        self.int32_params.push(value);
        self
    }

    pub fn with_string(mut self, value: impl Into<String>) -> Self {
        self.string_params.push(value.into());
        self
    }

    pub fn with_bytes(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.bytes_params.push(value.into());
        self
    }

    pub fn with_mode_details(mut self, details: ModeDetails) -> Self {
        self.mode_details = Some(details);
        self
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_name(&self.func_name)
    }

    pub fn int32(&self, index: usize) -> Option<i32> {
        self.int32_params.get(index).copied()
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        self.string_params.get(index).map(String::as_str)
    }

    pub fn bytes(&self, index: usize) -> Option<&[u8]> {
        self.bytes_params.get(index).map(Vec::as_slice)
    }
}

/// Server answer to one [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    pub server_status: ServerStatus,
    pub status: Status,
    pub int32_payload: Vec<i32>,
    pub string_payload: Vec<String>,
    pub bytes_payload: Vec<Vec<u8>>,
    pub message: String,
    /// True if hardware interrupts are waiting to be fetched.
    pub interrupt_pending: bool,
    pub mode_details: Option<ModeDetails>,
    pub sensor_info: Option<SensorInfo>,
}

impl Response {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn unknown() -> Self {
        Self {
            server_status: ServerStatus::RequestUnknown,
            message: FUNCTION_NOT_FOUND.to_string(),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    Ok(bincode::serialize(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    Ok(bincode::serialize(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_are_unique_and_parse_back() {
        assert_eq!(Operation::ALL.len(), 26);
        for &op in Operation::ALL {
            assert_eq!(op.name().parse::<Operation>().unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_name() {
        let request = Request::named("Reboot");
        assert_eq!(request.operation(), None);
        assert!("Reboot".parse::<Operation>().is_err());
    }

    #[test]
    fn test_request_survives_encoding() {
        let request = Request::new(Operation::Adsd3500WritePayloadCmd)
            .with_int32(0x13)
            .with_int32(4)
            .with_bytes(vec![1, 2, 3, 4]);
        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.int32(1), Some(4));
        assert_eq!(decoded.bytes(0), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(decoded.string(0), None);
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(decode_response(&[0xff; 3]).is_err());
    }
}
