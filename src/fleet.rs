//! Fleet orchestration
//!
//! A [`Fleet`] owns everything a run needs: the sink aggregator, the
//! connection factory, one thread per sensor and one per ingestion loop.
//! [`Fleet::shutdown`] drives the two-phase stop through the
//! [`ShutdownCoordinator`] and flushes the sinks last.
//!
//! ```ignore
//! let mut fleet = Fleet::new(factory, SinkAggregator::new(), ShutdownTimeouts::default());
//! fleet.sink().add(MemorySink::new())?;
//! fleet.spawn_sensor(0, "Load", Duration::from_millis(100), || Some(1.0), Strategy::Pipe, None)?;
//! std::thread::sleep(Duration::from_secs(1));
//! println!("{}", fleet.shutdown());
//! ```

use crate::config::FleetConfig;
use crate::error::Result;
use crate::ingestion::{LoopReport, LoopState, LoopStateHandle};
use crate::sensor::{Probe, Sensor, SensorReport};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownTimeouts, Worker};
use crate::sink::SinkAggregator;
use crate::transport::{ConnectionFactory, Strategy};
use std::net::SocketAddr;
use std::time::Duration;

pub struct Fleet {
    factory: ConnectionFactory,
    sink: SinkAggregator,
    coordinator: ShutdownCoordinator,
    sensors: Vec<Worker<SensorReport>>,
    loops: Vec<Worker<LoopReport>>,
    loop_states: Vec<LoopStateHandle>,
    finished: bool,
}

impl Fleet {
    pub fn new(factory: ConnectionFactory, sink: SinkAggregator, timeouts: ShutdownTimeouts) -> Self {
        Self {
            factory,
            sink,
            coordinator: ShutdownCoordinator::new(timeouts),
            sensors: Vec::new(),
            loops: Vec::new(),
            loop_states: Vec::new(),
            finished: false,
        }
    }

    /// Validate `config`, open its sinks and start its sensors
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        config.validate()?;

        let sink = SinkAggregator::new();
        for entry in &config.sinks {
            sink.add(entry.build()?)?;
        }

        let factory = ConnectionFactory::new(config.transport.settings(), config.transport.address);
        let mut fleet = Self::new(factory, sink, config.shutdown.timeouts());
        for sensor in &config.sensors {
            fleet.spawn_sensor(
                sensor.id,
                &sensor.name,
                sensor.sampling_period(),
                sensor.build_probe(),
                sensor.strategy.unwrap_or(config.transport.strategy),
                sensor.address,
            )?;
        }

        tracing::info!(
            "Fleet started: {} sensor(s), {} loop(s), {} sink(s)",
            fleet.sensors.len(),
            fleet.loops.len(),
            fleet.sink.len()
        );
        Ok(fleet)
    }

    /// Create a transport pair for a new sensor, start the ingestion loop if
    /// the pair brought a new listening resource, then start the sensor.
    pub fn spawn_sensor(
        &mut self,
        id: i64,
        name: &str,
        sampling_period: Duration,
        probe: impl Probe + 'static,
        strategy: Strategy,
        address: Option<SocketAddr>,
    ) -> Result<()> {
        let pair = self.factory.create(strategy, name, &self.sink, address)?;

        if let Some(ingestion) = pair.ingestion {
            self.loop_states.push(ingestion.state());
            self.loops.push(ingestion.spawn(self.coordinator.server_stop().clone())?);
        }

        let sensor = Sensor::new(id, name, sampling_period, probe, pair.client);
        let stop = self.coordinator.producer_stop().clone();
        self.sensors
            .push(Worker::spawn(format!("sensor-{}", name), move || sensor.run(&stop))?);
        tracing::debug!("Sensor {} ({}) spawned over {}", id, name, strategy);
        Ok(())
    }

    pub fn sink(&self) -> &SinkAggregator {
        &self.sink
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    /// Current state of every ingestion loop, in start order
    pub fn loop_states(&self) -> Vec<LoopState> {
        self.loop_states.iter().map(LoopStateHandle::get).collect()
    }

    /// Stop sensors, then loops, then flush sinks
    pub fn shutdown(mut self) -> ShutdownReport {
        self.finished = true;
        let sensors = std::mem::take(&mut self.sensors);
        let loops = std::mem::take(&mut self.loops);
        let report = self.coordinator.drain(sensors, loops);

        if let Err(e) = self.sink.flush() {
            tracing::warn!("Flushing sinks failed: {}", e);
        }
        report
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        if !self.finished {
            // Dropped without shutdown: let every thread wind down on its own
            self.coordinator.abort();
        }
    }
}
