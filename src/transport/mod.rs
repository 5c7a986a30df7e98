//! TCP transports for the control and frame channels.

pub mod control;
pub mod frames;
pub mod framing;

pub use control::{
    ConnectionEvent, ControlTransport, EventKind, EventMask, HeartbeatConfig, IncomingRequest,
    PeerId,
};
pub use frames::{FrameChannel, FramePublisher};
pub use framing::{ControlFrame, FrameReader, MAX_CONTROL_FRAME, MAX_STREAM_FRAME};
