//! Test data builders for creating fleets and configs

use super::fast_settings;
use sensor_fleet::config::{FleetConfig, SensorConfig, SinkConfig};
use sensor_fleet::shutdown::ShutdownTimeouts;
use sensor_fleet::sink::MemorySink;
use sensor_fleet::{ConnectionFactory, Fleet, ProbePattern, SinkAggregator, Strategy};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;

/// A fleet wired to a memory sink, plus the directory its regions live in
pub struct TestFleet {
    pub fleet: Fleet,
    pub memory: MemorySink,
    pub dir: TempDir,
}

/// Builder for a hand-assembled [`Fleet`]
pub struct FleetBuilder {
    address: SocketAddr,
    timeouts: ShutdownTimeouts,
}

impl FleetBuilder {
    pub fn new() -> Self {
        Self {
            address: super::free_local_addr(),
            timeouts: ShutdownTimeouts {
                sensors: Duration::from_secs(2),
                loops: Duration::from_secs(2),
            },
        }
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn timeouts(mut self, timeouts: ShutdownTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> TestFleet {
        let dir = TempDir::new().expect("temp dir");
        let factory = ConnectionFactory::new(fast_settings(dir.path()), self.address);
        let sink = SinkAggregator::new();
        let memory = MemorySink::new();
        sink.add(memory.clone()).expect("add memory sink");
        TestFleet {
            fleet: Fleet::new(factory, sink, self.timeouts),
            memory,
            dir,
        }
    }
}

/// Builder for a [`FleetConfig`] with constant-valued sensors
pub struct ConfigBuilder {
    config: FleetConfig,
}

impl ConfigBuilder {
    pub fn new(strategy: Strategy) -> Self {
        let mut config = FleetConfig::default();
        config.transport.strategy = strategy;
        config.transport.address = super::free_local_addr();
        config.transport.poll_interval_ms = 5;
        config.shutdown.sensor_timeout_ms = 2000;
        config.shutdown.loop_timeout_ms = 2000;
        Self { config }
    }

    pub fn shm_dir(mut self, dir: &TempDir) -> Self {
        self.config.transport.shm_dir = Some(dir.path().to_path_buf());
        self
    }

    pub fn sensor(mut self, id: i64, name: &str, period_ms: u64, value: f64) -> Self {
        self.config
            .sensors
            .push(SensorConfig::new(id, name, period_ms, ProbePattern::Constant { value }));
        self
    }

    pub fn sink(mut self, sink: SinkConfig) -> Self {
        self.config.sinks.push(sink);
        self
    }

    pub fn build(self) -> FleetConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new(Strategy::Pipe)
            .sensor(0, "Load", 10, 1.0)
            .sink(SinkConfig::Memory)
            .build();

        assert_eq!(config.transport.strategy, Strategy::Pipe);
        assert_eq!(config.sensors.len(), 1);
        assert!(config.validate().is_ok());
    }
}
