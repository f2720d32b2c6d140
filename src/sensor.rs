//! Sensors: producing execution units
//!
//! A [`Sensor`] samples its [`Probe`] once per sampling period, stamps the
//! value and sends it through its own producer handle. It shares nothing with
//! the server side except the transport.
//!
//! # Probes
//!
//! Anything implementing [`Probe`] can feed a sensor, including closures.
//! [`PatternProbe`] generates synthetic signals and reads a few host metrics
//! from `/proc` on Linux.
//!
//! A probe that returns `None` skips that tick: nothing is sent. Only the
//! stop signal produces the end-of-stream sentinel.

use crate::error::FleetError;
use crate::message::{Message, TimestampClock};
use crate::shutdown::StopSignal;
use crate::transport::ClientHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// External data source sampled by a sensor
pub trait Probe: Send {
    /// Current value, or `None` when no value is available this tick
    fn sample(&mut self) -> Option<f64>;
}

impl<F> Probe for F
where
    F: FnMut() -> Option<f64> + Send,
{
    fn sample(&mut self) -> Option<f64> {
        self()
    }
}

/// Signal shape produced by a [`PatternProbe`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbePattern {
    /// Constant value
    Constant { value: f64 },
    /// Sine wave
    Sine {
        frequency: f64,
        amplitude: f64,
        #[serde(default)]
        offset: f64,
    },
    /// Counter that increments by `step` and wraps inside `[min, max]`
    Counter { step: f64, min: f64, max: f64 },
    /// Uniform values within range
    Random { min: f64, max: f64 },
    /// Sawtooth wave
    Sawtooth { period: f64, amplitude: f64 },
    /// Square wave
    Square { period: f64, amplitude: f64 },
    /// Triangle wave
    Triangle { period: f64, amplitude: f64 },
    /// 1-minute load average from `/proc/loadavg`
    LoadAverage,
    /// Available memory in GB from `/proc/meminfo`
    MemoryAvailable,
}

impl Default for ProbePattern {
    fn default() -> Self {
        ProbePattern::Sine {
            frequency: 1.0,
            amplitude: 100.0,
            offset: 0.0,
        }
    }
}

/// Probe generating values from a [`ProbePattern`]
#[derive(Debug, Clone)]
pub struct PatternProbe {
    pattern: ProbePattern,
    started: Instant,
    counter: f64,
    noise_amplitude: f64,
    rng: u64,
}

impl PatternProbe {
    pub fn new(pattern: ProbePattern) -> Self {
        let counter = match pattern {
            ProbePattern::Counter { min, step, .. } => min - step,
            _ => 0.0,
        };
        Self {
            pattern,
            started: Instant::now(),
            counter,
            noise_amplitude: 0.0,
            rng: 0x2545_F491_4F6C_DD1D,
        }
    }

    /// Add uniform noise of the given amplitude
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    /// Seed the noise/random generator
    pub fn with_seed(mut self, seed: u64) -> Self {
        // xorshift must not start at zero
        self.rng = seed.max(1);
        self
    }

    pub fn pattern(&self) -> ProbePattern {
        self.pattern
    }

    /// Value at `elapsed_secs` after the probe started
    pub fn value_at(&mut self, elapsed_secs: f64) -> Option<f64> {
        let base = match self.pattern {
            ProbePattern::Constant { value } => value,
            ProbePattern::Sine {
                frequency,
                amplitude,
                offset,
            } => offset + amplitude * (2.0 * std::f64::consts::PI * frequency * elapsed_secs).sin(),
            ProbePattern::Counter { step, min, max } => {
                self.counter += step;
                if self.counter > max {
                    self.counter = min;
                } else if self.counter < min {
                    self.counter = max;
                }
                self.counter
            }
            ProbePattern::Random { min, max } => min + self.next_unit() * (max - min),
            ProbePattern::Sawtooth { period, amplitude } => {
                let t = elapsed_secs % period;
                amplitude * (t / period)
            }
            ProbePattern::Square { period, amplitude } => {
                if elapsed_secs % period < period / 2.0 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            ProbePattern::Triangle { period, amplitude } => {
                let t = elapsed_secs % period;
                let half = period / 2.0;
                if t < half {
                    amplitude * (2.0 * t / half - 1.0)
                } else {
                    amplitude * (1.0 - 2.0 * (t - half) / half)
                }
            }
            ProbePattern::LoadAverage => host::load_average()?,
            ProbePattern::MemoryAvailable => host::memory_available_gb()?,
        };

        if self.noise_amplitude > 0.0 {
            Some(base + (self.next_unit() - 0.5) * 2.0 * self.noise_amplitude)
        } else {
            Some(base)
        }
    }

    /// xorshift64, mapped to [0, 1]
    fn next_unit(&mut self) -> f64 {
        let mut s = self.rng;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng = s;
        (s as f64) / (u64::MAX as f64)
    }
}

impl Probe for PatternProbe {
    fn sample(&mut self) -> Option<f64> {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.value_at(elapsed)
    }
}

/// Host metrics; `None` where the source is unavailable
mod host {
    pub fn load_average() -> Option<f64> {
        let text = std::fs::read_to_string("/proc/loadavg").ok()?;
        text.split_whitespace().next()?.parse().ok()
    }

    pub fn memory_available_gb() -> Option<f64> {
        let text = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available_kb(&text).map(|kb| kb * 1024.0 * 1e-9)
    }

    pub(super) fn parse_mem_available_kb(meminfo: &str) -> Option<f64> {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix("MemAvailable:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    }
}

/// Outcome of a sensor run
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReport {
    pub id: i64,
    pub name: String,
    /// Readings sent, not counting the sentinel
    pub sent: u64,
    pub sentinel_sent: bool,
    /// The error that ended the run early, if any
    pub last_error: Option<String>,
}

impl fmt::Display for SensorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor {} ({}): sent {}", self.id, self.name, self.sent)?;
        if self.sentinel_sent {
            write!(f, ", end-of-stream sent")?;
        }
        if let Some(err) = &self.last_error {
            write!(f, ", stopped by error: {}", err)?;
        }
        Ok(())
    }
}

/// A producing unit: probe, sampling period and its own producer handle.
pub struct Sensor {
    id: i64,
    name: String,
    sampling_period: Duration,
    probe: Box<dyn Probe>,
    client: Box<dyn ClientHandle>,
    clock: TimestampClock,
}

impl Sensor {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        sampling_period: Duration,
        probe: impl Probe + 'static,
        client: Box<dyn ClientHandle>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            sampling_period,
            probe: Box::new(probe),
            client,
            clock: TimestampClock::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sample and send until `stop` is raised or the transport fails.
    ///
    /// On stop the sentinel is sent and the producer handle closed before
    /// returning.
    pub fn run(mut self, stop: &StopSignal) -> SensorReport {
        let mut report = SensorReport {
            id: self.id,
            name: self.name.clone(),
            sent: 0,
            sentinel_sent: false,
            last_error: None,
        };
        tracing::debug!(
            "Sensor {} ({}) started over {}, period {:?}",
            self.id,
            self.name,
            self.client.strategy(),
            self.sampling_period
        );

        loop {
            if stop.wait_timeout(self.sampling_period) {
                let sentinel = Message::end_of_stream(self.id, self.name.as_str(), self.clock.now());
                match self.client.send(&sentinel) {
                    Ok(()) => report.sentinel_sent = true,
                    Err(e) => {
                        tracing::debug!("Sensor {} could not send end-of-stream: {}", self.name, e);
                        report.last_error = Some(e.to_string());
                    }
                }
                tracing::debug!("{} received stop signal, closing connection", self.name);
                break;
            }

            let Some(value) = self.probe.sample() else {
                continue;
            };

            let message = Message::reading(self.id, self.name.as_str(), value, self.clock.now());
            match self.client.send(&message) {
                Ok(()) => report.sent += 1,
                Err(FleetError::Serialization(reason)) => {
                    tracing::warn!("Sensor {} skipped a reading: {}", self.name, reason);
                }
                Err(e) => {
                    if stop.is_raised() || e.is_shutdown_expected() {
                        tracing::debug!("Sensor {} connection ended: {}", self.name, e);
                    } else {
                        tracing::warn!("Sensor {} connection not available: {}", self.name, e);
                    }
                    report.last_error = Some(e.to_string());
                    break;
                }
            }
        }

        self.client.close();
        tracing::debug!("{}", report);
        report
    }
}
