//! Plot sink: rolling per-sensor series for a live chart
//!
//! Each sensor name gets a ring buffer of `[seconds, value]` points. The x
//! coordinate is the time elapsed since that sensor's first timestamp; when a
//! timestamp cannot be parsed the running sample index is used instead. When
//! a buffer reaches `max_points` the oldest point is evicted.
//!
//! The sink is cheap to clone and every clone reads the same buffers, so a
//! renderer on another thread can poll [`PlotSink::series`] while the
//! aggregator appends.

use super::Sink;
use crate::error::Result;
use crate::message::Message;
use chrono::NaiveDateTime;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Default number of points kept per series
pub const DEFAULT_MAX_POINTS: usize = 10_000;

#[derive(Debug)]
struct Series {
    points: VecDeque<[f64; 2]>,
    origin: Option<NaiveDateTime>,
    samples: u64,
    last_value: Option<f64>,
}

impl Series {
    fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.min(1024)),
            origin: None,
            samples: 0,
            last_value: None,
        }
    }

    fn push(&mut self, message: &Message, value: f64, max_points: usize) {
        let x = match (message.parsed_timestamp(), self.origin) {
            (Some(ts), Some(origin)) => (ts - origin).num_microseconds().unwrap_or(0) as f64 / 1e6,
            (Some(ts), None) => {
                self.origin = Some(ts);
                0.0
            }
            (None, _) => self.samples as f64,
        };

        if self.points.len() >= max_points {
            self.points.pop_front();
        }
        self.points.push_back([x, value]);
        self.samples += 1;
        self.last_value = Some(value);
    }
}

#[derive(Debug, Clone)]
pub struct PlotSink {
    series: Arc<Mutex<HashMap<String, Series>>>,
    max_points: usize,
}

impl Default for PlotSink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POINTS)
    }
}

impl PlotSink {
    pub fn new(max_points: usize) -> Self {
        Self {
            series: Arc::new(Mutex::new(HashMap::new())),
            max_points: max_points.max(1),
        }
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Points for one sensor, oldest first
    pub fn series(&self, name: &str) -> Vec<[f64; 2]> {
        self.lock()
            .get(name)
            .map(|s| s.points.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Latest value seen for one sensor
    pub fn last_value(&self, name: &str) -> Option<f64> {
        self.lock().get(name).and_then(|s| s.last_value)
    }

    /// Sensor names with at least one point, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Series>> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sink for PlotSink {
    fn name(&self) -> &str {
        "plot"
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        let Some(value) = message.data() else {
            return Ok(());
        };
        let max_points = self.max_points;
        self.lock()
            .entry(message.name().to_string())
            .or_insert_with(|| Series::new(max_points))
            .push(message, value, max_points);
        Ok(())
    }
}
