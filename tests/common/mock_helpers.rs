//! Probes and sinks with scripted behaviour

use sensor_fleet::{Message, Result, FleetError, Sink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Probe yielding 1.0, 2.0, 3.0, ...
pub fn counting_probe() -> impl FnMut() -> Option<f64> + Send + 'static {
    let mut next = 0.0;
    move || {
        next += 1.0;
        Some(next)
    }
}

/// Sink that rejects every message and counts the attempts
#[derive(Clone, Default)]
pub struct FailingSink {
    attempts: Arc<AtomicU64>,
}

impl FailingSink {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn append(&mut self, _message: &Message) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(FleetError::Sink("rejected".into()))
    }
}
