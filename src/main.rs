//! tofd - depth camera streaming and control server.
//!
//! Serves one client at a time:
//! - **Control channel** (default port 5556): request/reply commands with heartbeat
//! - **Frame channel** (default port 5555): one-way frame push, raw or compressed
//!
//! This binary drives the bundled simulated sensor.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tofd::sim::{sim_modes, SimulatedEnumerator, SimulatedSensor};
use tofd::{Codec, Server, ServerConfig, ServerError};

#[derive(Debug, Parser)]
#[command(name = "tofd", version, about = "Depth camera streaming and control server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TOFD_CONFIG")]
    config: Option<PathBuf>,

    /// Frame compression: none, lz4 or rvl
    #[arg(long)]
    compression: Option<Codec>,

    /// Control channel bind address
    #[arg(long)]
    control_addr: Option<String>,

    /// Frame channel bind address
    #[arg(long)]
    frame_addr: Option<String>,

    /// Number of modes the simulated sensor offers (1-256)
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..=256))]
    sim_modes: u16,
}

fn main() -> tofd::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("tofd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(codec) = args.compression {
        config.streaming.compression = codec;
    }
    if let Some(addr) = args.control_addr {
        config.network.control_addr = addr;
    }
    if let Some(addr) = args.frame_addr {
        config.network.frame_addr = addr;
    }

    let sensor = Arc::new(SimulatedSensor::with_modes(sim_modes(usize::from(args.sim_modes))));
    let enumerator = SimulatedEnumerator::new(vec![sensor]);
    let server = Server::bind(&config, Box::new(enumerator))?;

    let running = server.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::Relaxed);
    })
    .map_err(|e| ServerError::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("tofd running. Press Ctrl-C to stop.");
    server.run()
}
