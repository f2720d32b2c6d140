//! # sensor-fleet: producer/consumer telemetry fleet
//!
//! A set of sensors sample values on a fixed period and ship them over a
//! pluggable transport (TCP socket, shared memory or an OS pipe) to ingestion
//! loops that fan every message out to a tree of sinks.
//!
//! ## Architecture
//!
//! - **Sensors**: one thread each, sampling a [`sensor::Probe`] and sending
//!   [`Message`]s through a [`transport::ClientHandle`]
//! - **Transport**: [`transport::ConnectionFactory`] creates pairs; socket
//!   listeners are shared per address
//! - **Ingestion**: one loop per listening resource, forwarding into a
//!   [`SinkAggregator`]
//! - **Shutdown**: producers stop first, loops drain, sinks flush last
//!
//! ## Example
//!
//! ```ignore
//! use sensor_fleet::{config::FleetConfig, Fleet};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = FleetConfig::load_or_default("sensor-fleet.toml");
//!     let _guard = sensor_fleet::logging::init(&config.logging)?;
//!     let fleet = Fleet::from_config(&config)?;
//!     std::thread::sleep(config.run_for());
//!     println!("{}", fleet.shutdown());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fleet;
pub mod ingestion;
pub mod logging;
pub mod message;
pub mod sensor;
pub mod shutdown;
pub mod sink;
pub mod transport;

// Re-export commonly used types
pub use config::FleetConfig;
pub use error::{FleetError, Result, ResultExt};
pub use fleet::Fleet;
pub use ingestion::{IngestionLoop, LoopReport, LoopState};
pub use message::{Message, Payload};
pub use sensor::{Probe, ProbePattern, Sensor, SensorReport};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownTimeouts};
pub use sink::{BuiltinSink, Sink, SinkAggregator};
pub use transport::{ConnectionFactory, Strategy};
