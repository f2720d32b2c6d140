//! Configuration module for the sensor fleet
//!
//! A [`FleetConfig`] describes a complete run: the transport, the sensors,
//! the sinks, shutdown deadlines and logging. Files are TOML or JSON,
//! chosen by extension. Every section has defaults, so partial files work.
//!
//! # Example
//!
//! ```toml
//! run_for_secs = 30
//!
//! [transport]
//! strategy = "socket"
//! address = "127.0.0.1:33333"
//!
//! [[sensors]]
//! id = 0
//! name = "Load"
//! sampling_period_ms = 500
//! probe = { kind = "load_average" }
//!
//! [[sinks]]
//! kind = "csv"
//! path = "sensorlog.csv"
//!
//! [[sinks]]
//! kind = "screen"
//! ```

use crate::error::{FleetError, Result};
use crate::sensor::{PatternProbe, ProbePattern};
use crate::shutdown::ShutdownTimeouts;
use crate::sink::{BuiltinSink, CsvSink, MemorySink, PlotSink, ScreenSink, SqlSink};
use crate::transport::{self, Strategy, TransportSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up by the binary
pub const DEFAULT_CONFIG_FILE: &str = "sensor-fleet.toml";

/// Default run duration of the binary in seconds
pub const DEFAULT_RUN_FOR_SECS: u64 = 10;

/// Default log filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,sensor_fleet=debug";

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Format::Toml),
            Some("json") => Ok(Format::Json),
            other => Err(FleetError::Config(format!(
                "unsupported config extension {:?} for {:?} (expected .toml or .json)",
                other, path
            ))),
        }
    }
}

// ==================== Fleet ====================

/// Complete description of a fleet run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub version: u32,
    /// How long the binary runs before shutting down
    pub run_for_secs: u64,
    pub transport: TransportConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
    pub sensors: Vec<SensorConfig>,
    pub sinks: Vec<SinkConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            run_for_secs: DEFAULT_RUN_FOR_SECS,
            transport: TransportConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
            sensors: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

impl FleetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file; the format follows the extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = Format::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("Failed to read config file {:?}: {}", path, e)))?;

        match format {
            Format::Toml => toml::from_str(&content)
                .map_err(|e| FleetError::Config(format!("Failed to parse config file {:?}: {}", path, e))),
            Format::Json => serde_json::from_str(&content)
                .map_err(|e| FleetError::Config(format!("Failed to parse config file {:?}: {}", path, e))),
        }
    }

    /// Load a config file, falling back to [`FleetConfig::sample`] if it is
    /// missing or invalid
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let (config, fallback) = Self::load_or_sample(path);
        if let Some(reason) = fallback {
            tracing::warn!("{}; using defaults", reason);
        }
        config
    }

    /// Like [`FleetConfig::load_or_default`] but hands back why the sample
    /// was used instead of logging it, for callers that set up logging from
    /// the loaded config.
    pub fn load_or_sample(path: impl AsRef<Path>) -> (Self, Option<String>) {
        let path = path.as_ref();
        if !path.exists() {
            return (Self::sample(), Some(format!("No config at {:?}", path)));
        }
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Self::sample(), Some(e.to_string())),
        }
    }

    /// Save the config; the format follows the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let format = Format::from_path(path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| FleetError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let content = match format {
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| FleetError::Config(format!("Failed to serialize config: {}", e)))?,
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| FleetError::Config(format!("Failed to serialize config: {}", e)))?,
        };

        std::fs::write(path, content)
            .map_err(|e| FleetError::Config(format!("Failed to write config file {:?}: {}", path, e)))
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.transport.poll_interval_ms == 0 {
            return Err(FleetError::Config("transport.poll_interval_ms must be positive".into()));
        }
        if self.transport.queue_depth == 0 {
            return Err(FleetError::Config("transport.queue_depth must be positive".into()));
        }

        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(sensor.id) {
                return Err(FleetError::Config(format!("duplicate sensor id {}", sensor.id)));
            }
            if sensor.name.is_empty() {
                return Err(FleetError::Config(format!("sensor {} has an empty name", sensor.id)));
            }
            if sensor.sampling_period_ms == 0 {
                return Err(FleetError::Config(format!(
                    "sensor {} ({}) has a zero sampling period",
                    sensor.id, sensor.name
                )));
            }
        }

        for (i, sink) in self.sinks.iter().enumerate() {
            if sink.needs_path() && sink.path().is_none() {
                return Err(FleetError::Config(format!("sink {} ({}) needs a path", i, sink.kind())));
            }
        }
        Ok(())
    }

    /// Two synthetic sensors printed to the screen
    pub fn sample() -> Self {
        Self {
            sensors: vec![
                SensorConfig::new(0, "Load", 500, ProbePattern::LoadAverage),
                SensorConfig::new(
                    1,
                    "Wave",
                    250,
                    ProbePattern::Sine {
                        frequency: 0.2,
                        amplitude: 1.0,
                        offset: 0.0,
                    },
                ),
            ],
            sinks: vec![SinkConfig::Screen],
            ..Self::default()
        }
    }

    pub fn run_for(&self) -> Duration {
        Duration::from_secs(self.run_for_secs)
    }
}

// ==================== Transport ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Strategy for sensors that do not pick one
    pub strategy: Strategy,
    /// Listening address for the socket strategy
    pub address: SocketAddr,
    /// Directory for shared-memory regions; platform runtime dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shm_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Bound of the pipe consumer queue
    pub queue_depth: usize,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let address = transport::DEFAULT_SOCKET_ADDRESS
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 33333)));
        Self {
            strategy: Strategy::default(),
            address,
            shm_dir: None,
            poll_interval_ms: transport::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            queue_depth: transport::DEFAULT_QUEUE_DEPTH,
            max_frame_size: transport::framing::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_frame_size: self.max_frame_size,
            queue_depth: self.queue_depth,
            shm_dir: self.shm_dir.clone().unwrap_or_else(transport::default_shm_dir),
        }
    }
}

// ==================== Shutdown ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Deadline for sensors to exit after producer-stop
    pub sensor_timeout_ms: u64,
    /// Deadline for ingestion loops to exit after server-stop
    pub loop_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            sensor_timeout_ms: 5000,
            loop_timeout_ms: 5000,
        }
    }
}

impl ShutdownConfig {
    pub fn timeouts(&self) -> ShutdownTimeouts {
        ShutdownTimeouts {
            sensors: Duration::from_millis(self.sensor_timeout_ms),
            loops: Duration::from_millis(self.loop_timeout_ms),
        }
    }
}

// ==================== Logging ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence
    pub filter: String,
    /// Directory for daily-rolling log files; console only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Log file name prefix
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: "sensor-fleet.log".to_string(),
        }
    }
}

// ==================== Sensors ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: i64,
    pub name: String,
    pub sampling_period_ms: u64,
    #[serde(default)]
    pub probe: ProbePattern,
    /// Uniform noise amplitude added to each sample
    #[serde(default, skip_serializing_if = "is_zero")]
    pub noise: f64,
    /// Overrides `transport.strategy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Overrides `transport.address` for the socket strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl SensorConfig {
    pub fn new(id: i64, name: impl Into<String>, sampling_period_ms: u64, probe: ProbePattern) -> Self {
        Self {
            id,
            name: name.into(),
            sampling_period_ms,
            probe,
            noise: 0.0,
            strategy: None,
            address: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn sampling_period(&self) -> Duration {
        Duration::from_millis(self.sampling_period_ms)
    }

    /// Probe for this sensor, seeded by its id so runs are repeatable
    pub fn build_probe(&self) -> PatternProbe {
        PatternProbe::new(self.probe)
            .with_noise(self.noise)
            .with_seed(0x9E37_79B9_7F4A_7C15 ^ self.id as u64)
    }
}

// ==================== Sinks ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    Csv {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Sql {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
    },
    Screen,
    Memory,
    Plot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_points: Option<usize>,
    },
}

impl SinkConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::Csv { .. } => "csv",
            SinkConfig::Sql { .. } => "sql",
            SinkConfig::Screen => "screen",
            SinkConfig::Memory => "memory",
            SinkConfig::Plot { .. } => "plot",
        }
    }

    fn needs_path(&self) -> bool {
        matches!(self, SinkConfig::Csv { .. } | SinkConfig::Sql { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SinkConfig::Csv { path } | SinkConfig::Sql { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    /// Open the sink this entry describes
    pub fn build(&self) -> Result<BuiltinSink> {
        let missing_path = || FleetError::Config(format!("{} sink needs a path", self.kind()));
        Ok(match self {
            SinkConfig::Csv { path } => CsvSink::create(path.as_ref().ok_or_else(missing_path)?)?.into(),
            SinkConfig::Sql { path, table } => {
                SqlSink::create(path.as_ref().ok_or_else(missing_path)?, table.as_deref())?.into()
            }
            SinkConfig::Screen => ScreenSink::stdout().into(),
            SinkConfig::Memory => MemorySink::new().into(),
            SinkConfig::Plot { max_points } => {
                PlotSink::new(max_points.unwrap_or(crate::sink::plot::DEFAULT_MAX_POINTS)).into()
            }
        })
    }
}
