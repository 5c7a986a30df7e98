//! # tofd - streaming and control server for time-of-flight depth cameras
//!
//! Owns one depth sensor and serves it to a single remote client:
//! - Request/reply control channel with heartbeat (open/start/stop, modes,
//!   controls, register and payload access, depth-compute parameters)
//! - One-way frame channel pushing raw or compressed (LZ4, RVL) frames
//! - Double-buffered capture/stream pipeline with drop-on-backpressure
//! - Single-client enforcement with automatic teardown on disconnect
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tofd::client::ControlClient;
//! use tofd::protocol::{Operation, Request};
//! use tofd::sim::{SimulatedEnumerator, SimulatedSensor};
//! use tofd::{Server, ServerConfig};
//!
//! let sensor = Arc::new(SimulatedSensor::new());
//! let server = Server::bind(&ServerConfig::default(), Box::new(SimulatedEnumerator::new(vec![sensor])))
//!     .unwrap()
//!     .spawn()
//!     .unwrap();
//!
//! let client = ControlClient::connect(server.control_addr()).unwrap();
//! let response = client
//!     .request(&Request::new(Operation::FindSensors), Duration::from_secs(1))
//!     .unwrap();
//! println!("sensor: {:?}", response.sensor_info);
//! ```

pub mod error;
pub mod types;
pub mod sensor;
pub mod sim;
pub mod gateway;
pub mod interrupts;
pub mod buffers;
pub mod capture;
pub mod rvl;
pub mod codec;
pub mod stats;
pub mod streaming;
pub mod protocol;
pub mod transport;
pub mod session;
pub mod dispatch;
pub mod supervisor;
pub mod server;
pub mod client;
pub mod config;

pub use error::ServerError;
pub use types::*;
pub use codec::Codec;
pub use config::ServerConfig;
pub use server::{Server, ServerHandle};
pub use session::ServerSession;

/// Result type alias for tofd operations.
pub type Result<T> = std::result::Result<T, ServerError>;
