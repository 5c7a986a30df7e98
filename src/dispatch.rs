use crate::gateway::SensorGateway;
use crate::protocol::{Operation, Request, Response, CONNECTION_ALLOWED};
use crate::session::ServerSession;
use crate::types::{
    DepthComputeParams, Status, StatusResult, DEPTH_COMPUTE_KEYS, WRITABLE_DEPTH_COMPUTE_KEYS,
};
use std::sync::Arc;

/// Control name that switches same-frame repeat mode on ("1") or off.
pub const NET_LINK_TEST_CONTROL: &str = "netlinktest";

/// Maps decoded requests onto session and sensor operations.
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    handled: u64,
    unknown: u64,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests answered so far, recognised and unrecognised.
    pub fn counts(&self) -> (u64, u64) {
        (self.handled, self.unknown)
    }

    /// Execute one request. Every response carries the interrupt-pending flag.
    pub fn dispatch(&mut self, session: &mut ServerSession, request: &Request) -> Response {
        let mut response = match request.operation() {
            Some(operation) => {
                self.handled += 1;
                log::debug!("{} function", operation);
                handle(session, operation, request)
            }
            None => {
                self.unknown += 1;
                log::error!("Unknown function name: {}", request.func_name);
                Response::unknown()
            }
        };
        response.interrupt_pending = session.interrupts().has_pending();
        response
    }
}

fn status_response(result: StatusResult<()>) -> Response {
    Response::with_status(Status::of(&result))
}

fn missing(what: &str) -> Response {
    Response::with_status(Status::InvalidArgument).message(format!("Missing parameter: {}", what))
}

fn gateway_of(session: &ServerSession) -> Result<Arc<SensorGateway>, Response> {
    session.gateway().cloned().ok_or_else(|| {
        Response::with_status(Status::Unreachable).message("No depth sensor selected; call FindSensors first")
    })
}

/// Payload length parameter, rejected if negative or larger than `u16`.
fn payload_len(request: &Request, index: usize) -> Result<usize, Response> {
    let len = request.int32(index).ok_or_else(|| missing("payload length"))?;
    u16::try_from(len)
        .map(usize::from)
        .map_err(|_| Response::with_status(Status::InvalidArgument).message("Invalid payload length"))
}

/// Operations that work without a selected sensor.
fn needs_sensor(operation: Operation) -> bool {
    !matches!(
        operation,
        Operation::FindSensors
            | Operation::ServerConnect
            | Operation::GetInterrupts
            | Operation::HangUp
    )
}

fn handle(session: &mut ServerSession, operation: Operation, request: &Request) -> Response {
    let gateway = if needs_sensor(operation) {
        match gateway_of(session) {
            Ok(gateway) => Some(gateway),
            Err(response) => return response,
        }
    } else {
        None
    };

    match (operation, gateway) {
        (Operation::FindSensors, _) => find_sensors(session),
        (Operation::ServerConnect, _) => Response::default().message(CONNECTION_ALLOWED),
        (Operation::GetInterrupts, _) => {
            let mut response = Response::default();
            response.int32_payload = session.interrupts().drain();
            response
        }
        (Operation::HangUp, _) => {
            session.hang_up();
            Response::default()
        }
        (Operation::Open, _) => status_response(session.open()),
        (Operation::Start, _) => status_response(session.start()),
        (Operation::Stop, _) => status_response(session.stop()),
        (Operation::SetModeByIndex, _) => set_mode_by_index(session, request),
        (Operation::SetMode, _) => set_mode(session, request),
        (Operation::SetControl, Some(gateway)) => set_control(session, &gateway, request),
        (operation, Some(gateway)) => sensor_operation(&gateway, operation, request),
        (operation, None) => {
            log::error!("{} has no handler", operation);
            Response::with_status(Status::GenericError)
        }
    }
}

fn find_sensors(session: &mut ServerSession) -> Response {
    match session.find_sensors() {
        Ok(info) => {
            let mut response = Response::default();
            response.string_payload = vec![
                info.name.clone(),
                info.card_version.kernel.clone(),
                info.card_version.uboot.clone(),
                info.card_version.sd.clone(),
            ];
            response.sensor_info = Some(info);
            response
        }
        Err(Status::Unreachable) => {
            Response::with_status(Status::Unreachable).message("No depth sensors are available")
        }
        Err(status) => {
            Response::with_status(status).message("Failed to create a target sensor enumerator")
        }
    }
}

fn set_mode_by_index(session: &mut ServerSession, request: &Request) -> Response {
    let Some(mode) = request.int32(0) else {
        return missing("mode");
    };
    let Ok(mode) = u8::try_from(mode) else {
        return Response::with_status(Status::InvalidArgument).message("Invalid mode");
    };
    match session.set_mode_by_index(mode) {
        Ok(details) => {
            let mut response = Response::default();
            response.mode_details = Some(details);
            response
        }
        Err(Status::Busy) => busy_streaming(),
        Err(status) => Response::with_status(status),
    }
}

fn set_mode(session: &mut ServerSession, request: &Request) -> Response {
    let Some(details) = &request.mode_details else {
        return missing("mode details");
    };
    match session.set_mode(details) {
        Ok(()) => Response::default(),
        Err(Status::Busy) => busy_streaming(),
        Err(status) => Response::with_status(status),
    }
}

fn busy_streaming() -> Response {
    Response::with_status(Status::Busy).message("Cannot change mode while streaming. Stop first.")
}

fn set_control(session: &mut ServerSession, gateway: &SensorGateway, request: &Request) -> Response {
    let (Some(name), Some(value)) = (request.string(0), request.string(1)) else {
        return missing("control name and value");
    };
    let result = gateway.set_control(name, value);
    if name == NET_LINK_TEST_CONTROL {
        session.set_repeat_frame(value == "1");
    }
    status_response(result)
}

/// Operations that only need the sensor.
fn sensor_operation(gateway: &SensorGateway, operation: Operation, request: &Request) -> Response {
    let result: Result<Response, Response> = (|| {
        let mut response = Response::default();
        match operation {
            Operation::GetAvailableModes => {
                response.int32_payload = gateway
                    .available_modes()
                    .map_err(Response::with_status)?
                    .into_iter()
                    .map(i32::from)
                    .collect();
            }
            Operation::GetModeDetails => {
                let mode = request.int32(0).ok_or_else(|| missing("mode"))?;
                let mode = u8::try_from(mode)
                    .map_err(|_| Response::with_status(Status::InvalidArgument))?;
                response.mode_details =
                    Some(gateway.mode_details(mode).map_err(Response::with_status)?);
            }
            Operation::GetAvailableControls => {
                response.string_payload =
                    gateway.available_controls().map_err(Response::with_status)?;
            }
            Operation::GetControl => {
                let name = request.string(0).ok_or_else(|| missing("control name"))?;
                response
                    .string_payload
                    .push(gateway.control(name).map_err(Response::with_status)?);
            }
            Operation::SetSensorConfiguration => {
                let configuration = request.string(0).ok_or_else(|| missing("configuration"))?;
                return Ok(status_response(gateway.set_sensor_configuration(configuration)));
            }
            Operation::InitTargetDepthCompute => {
                let ini = truncated(request, 0, 0).ok_or_else(|| missing("ini bytes"))?;
                let calibration = truncated(request, 1, 1).ok_or_else(|| missing("calibration bytes"))?;
                return Ok(status_response(gateway.init_target_depth_compute(ini, calibration)));
            }
            Operation::Adsd3500ReadCmd => {
                let cmd = request.int32(0).ok_or_else(|| missing("command"))?;
                let delay_us = request.int32(1).unwrap_or(0).max(0) as u32;
                let value = gateway
                    .read_register(cmd as u16, delay_us)
                    .map_err(Response::with_status)?;
                response.int32_payload.push(i32::from(value));
            }
            Operation::Adsd3500WriteCmd => {
                let cmd = request.int32(0).ok_or_else(|| missing("command"))?;
                let value = request.int32(1).ok_or_else(|| missing("value"))?;
                let delay_us = request.int32(2).unwrap_or(0).max(0) as u32;
                return Ok(status_response(gateway.write_register(
                    cmd as u16,
                    value as u16,
                    delay_us,
                )));
            }
            Operation::Adsd3500ReadPayloadCmd => {
                let cmd = request.int32(0).ok_or_else(|| missing("command"))?;
                let len = payload_len(request, 1)?;
                let mut data = vec![0u8; len];
                // The first four bytes carry the command arguments.
                if let Some(args) = request.bytes(0) {
                    let n = args.len().min(4).min(len);
                    data[..n].copy_from_slice(&args[..n]);
                }
                gateway
                    .read_payload_cmd(cmd as u32, &mut data)
                    .map_err(Response::with_status)?;
                response.bytes_payload.push(data);
            }
            Operation::Adsd3500ReadPayload => {
                let len = payload_len(request, 0)?;
                let mut data = vec![0u8; len];
                gateway.read_payload(&mut data).map_err(Response::with_status)?;
                response.bytes_payload.push(data);
            }
            Operation::Adsd3500WritePayloadCmd => {
                let cmd = request.int32(0).ok_or_else(|| missing("command"))?;
                let len = payload_len(request, 1)?;
                let data = request.bytes(0).ok_or_else(|| missing("payload"))?;
                let data = &data[..len.min(data.len())];
                return Ok(status_response(gateway.write_payload_cmd(cmd as u32, data)));
            }
            Operation::Adsd3500WritePayload => {
                let len = payload_len(request, 0)?;
                let data = request.bytes(0).ok_or_else(|| missing("payload"))?;
                let data = &data[..len.min(data.len())];
                return Ok(status_response(gateway.write_payload(data)));
            }
            Operation::Adsd3500GetStatus => {
                let (chip, imager) = gateway.chip_status().map_err(Response::with_status)?;
                response.int32_payload = vec![chip, imager];
            }
            Operation::GetDepthComputeParam => {
                let params = gateway.depth_compute_params().map_err(Response::with_status)?;
                response.string_payload = DEPTH_COMPUTE_KEYS
                    .iter()
                    .map(|key| params.get(*key).cloned().unwrap_or_default())
                    .collect();
            }
            Operation::SetDepthComputeParam => {
                if request.string_params.len() < WRITABLE_DEPTH_COMPUTE_KEYS {
                    return Err(missing("depth compute values"));
                }
                let params: DepthComputeParams = DEPTH_COMPUTE_KEYS[..WRITABLE_DEPTH_COMPUTE_KEYS]
                    .iter()
                    .zip(&request.string_params)
                    .map(|(key, value)| (key.to_string(), value.clone()))
                    .collect();
                return Ok(status_response(gateway.set_depth_compute_params(&params)));
            }
            Operation::GetIniArray => {
                let mode = request.int32(0).ok_or_else(|| missing("mode"))?;
                response
                    .string_payload
                    .push(gateway.ini_params_for_mode(mode).map_err(Response::with_status)?);
            }
            other => {
                log::error!("{} routed to the sensor table", other);
                return Err(Response::with_status(Status::GenericError));
            }
        }
        Ok(response)
    })();
    result.unwrap_or_else(|response| response)
}

/// Byte parameter `bytes_index`, cut to the length in `len_index` if given.
fn truncated(request: &Request, bytes_index: usize, len_index: usize) -> Option<&[u8]> {
    let bytes = request.bytes(bytes_index)?;
    let len = request
        .int32(len_index)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(bytes.len());
    Some(&bytes[..len.min(bytes.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FUNCTION_NOT_FOUND;
    use crate::session::SessionConfig;
    use crate::sim::{SimulatedEnumerator, SimulatedSensor};
    use crate::streaming::{FrameSink, FrameSinkFactory, SendOutcome};
    use crate::types::ServerStatus;
    use std::time::Duration;

    struct Discard;

    impl FrameSink for Discard {
        fn send(&mut self, _payload: Vec<u8>, _timeout: Duration) -> SendOutcome {
            SendOutcome::Disconnected
        }
    }

    impl FrameSinkFactory for Discard {
        fn open_sink(&self) -> Box<dyn FrameSink> {
            Box::new(Discard)
        }

        fn release(&self) {}
    }

    fn setup() -> (Arc<SimulatedSensor>, ServerSession, CommandDispatcher) {
        let sensor = Arc::new(SimulatedSensor::new().with_frame_interval(Duration::from_millis(1)));
        let session = ServerSession::new(
            Box::new(SimulatedEnumerator::new(vec![sensor.clone()])),
            Arc::new(Discard),
            SessionConfig::default(),
        );
        (sensor, session, CommandDispatcher::new())
    }

    fn call(d: &mut CommandDispatcher, s: &mut ServerSession, request: Request) -> Response {
        d.dispatch(s, &request)
    }

    #[test]
    fn test_unknown_operation_leaves_state_alone() {
        let (_, mut session, mut dispatcher) = setup();
        let before = session.snapshot();
        let response = call(&mut dispatcher, &mut session, Request::named("SelfDestruct"));
        assert_eq!(response.server_status, ServerStatus::RequestUnknown);
        assert_eq!(response.message, FUNCTION_NOT_FOUND);
        assert_eq!(session.snapshot(), before);
        assert_eq!(dispatcher.counts(), (0, 1));
    }

    #[test]
    fn test_sensor_operations_before_find_are_unreachable() {
        let (_, mut session, mut dispatcher) = setup();
        for op in [Operation::Open, Operation::GetAvailableModes, Operation::Adsd3500GetStatus] {
            let response = call(&mut dispatcher, &mut session, Request::new(op));
            assert_eq!(response.status, Status::Unreachable, "{}", op);
            assert_eq!(response.server_status, ServerStatus::RequestAccepted);
        }
    }

    #[test]
    fn test_find_sensors_fills_info() {
        let (_, mut session, mut dispatcher) = setup();
        let response = call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.sensor_info.unwrap().name, "sim-tof");
        assert_eq!(response.string_payload.len(), 4);
    }

    #[test]
    fn test_register_round_trip() {
        let (_, mut session, mut dispatcher) = setup();
        call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        let write = Request::new(Operation::Adsd3500WriteCmd)
            .with_int32(0x0025)
            .with_int32(0x1234);
        assert_eq!(call(&mut dispatcher, &mut session, write).status, Status::Ok);
        let read = Request::new(Operation::Adsd3500ReadCmd).with_int32(0x0025);
        assert_eq!(call(&mut dispatcher, &mut session, read).int32_payload, vec![0x1234]);
    }

    #[test]
    fn test_missing_parameter_is_invalid_argument() {
        let (_, mut session, mut dispatcher) = setup();
        call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        let response = call(&mut dispatcher, &mut session, Request::new(Operation::GetModeDetails));
        assert_eq!(response.status, Status::InvalidArgument);
        let response = call(
            &mut dispatcher,
            &mut session,
            Request::new(Operation::Adsd3500ReadPayload).with_int32(-1),
        );
        assert_eq!(response.status, Status::InvalidArgument);
    }

    #[test]
    fn test_payload_commands() {
        let (_, mut session, mut dispatcher) = setup();
        call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        let write = Request::new(Operation::Adsd3500WritePayload)
            .with_int32(3)
            .with_bytes(vec![7, 8, 9, 10]);
        assert_eq!(call(&mut dispatcher, &mut session, write).status, Status::Ok);
        let read = Request::new(Operation::Adsd3500ReadPayload).with_int32(3);
        assert_eq!(
            call(&mut dispatcher, &mut session, read).bytes_payload,
            vec![vec![7, 8, 9]]
        );
    }

    #[test]
    fn test_depth_compute_params_round_trip() {
        let (_, mut session, mut dispatcher) = setup();
        call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));

        let mut set = Request::new(Operation::SetDepthComputeParam);
        for i in 0..WRITABLE_DEPTH_COMPUTE_KEYS {
            set = set.with_string(format!("{}", 100 + i));
        }
        assert_eq!(call(&mut dispatcher, &mut session, set).status, Status::Ok);

        let get = call(&mut dispatcher, &mut session, Request::new(Operation::GetDepthComputeParam));
        assert_eq!(get.string_payload.len(), DEPTH_COMPUTE_KEYS.len());
        assert_eq!(get.string_payload[0], "100");
        assert_eq!(get.string_payload[10], "110");
    }

    #[test]
    fn test_interrupts_are_drained_and_flagged() {
        let (sensor, mut session, mut dispatcher) = setup();
        let response = call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        assert!(!response.interrupt_pending);

        sensor.raise_interrupt(11);
        sensor.raise_interrupt(12);
        let response = call(&mut dispatcher, &mut session, Request::new(Operation::ServerConnect));
        assert!(response.interrupt_pending);

        let response = call(&mut dispatcher, &mut session, Request::new(Operation::GetInterrupts));
        assert_eq!(response.int32_payload, vec![11, 12]);
        assert!(!response.interrupt_pending);
    }

    #[test]
    fn test_set_mode_while_streaming_is_busy() {
        let (_, mut session, mut dispatcher) = setup();
        call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        call(&mut dispatcher, &mut session, Request::new(Operation::Open));
        let response = call(
            &mut dispatcher,
            &mut session,
            Request::new(Operation::SetModeByIndex).with_int32(0),
        );
        assert_eq!(response.mode_details.unwrap().mode_number, 0);
        call(&mut dispatcher, &mut session, Request::new(Operation::Start));

        let response = call(
            &mut dispatcher,
            &mut session,
            Request::new(Operation::SetModeByIndex).with_int32(1),
        );
        assert_eq!(response.status, Status::Busy);
        assert!(response.message.contains("Stop first"));
        call(&mut dispatcher, &mut session, Request::new(Operation::Stop));
    }

    #[test]
    fn test_netlinktest_control_toggles_repeat() {
        let (_, mut session, mut dispatcher) = setup();
        call(&mut dispatcher, &mut session, Request::new(Operation::FindSensors));
        let on = Request::new(Operation::SetControl)
            .with_string(NET_LINK_TEST_CONTROL)
            .with_string("1");
        assert_eq!(call(&mut dispatcher, &mut session, on).status, Status::Ok);
        assert!(session.repeat_frame());
    }
}
