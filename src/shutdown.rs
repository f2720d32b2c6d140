//! Cooperative shutdown
//!
//! Two independent [`StopSignal`]s drive the fleet down:
//!
//! 1. *producer-stop* is raised; every sensor sends its end-of-stream
//!    sentinel on its next tick, closes its handle and exits.
//! 2. The coordinator joins the sensors, bounded by a deadline.
//! 3. *server-stop* is raised; ingestion loops drain what is already in
//!    flight, close their channels and exit.
//! 4. The coordinator joins the loops, bounded by a deadline.
//!
//! Step 2 completes (or times out) before step 3 starts, so a server-side
//! close never races an in-flight client send.

use crate::error::{FleetError, Result};
use crate::ingestion::LoopReport;
use crate::sensor::SensorReport;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SignalInner {
    raised: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Cancellation token shared between an orchestrator and its workers.
/// Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<SignalInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early when the signal is raised.
    /// Returns whether the signal is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_raised() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.inner.cond.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_raised()
    }
}

/// Outcome of a deadline-bounded join
#[derive(Debug)]
pub enum JoinOutcome<T> {
    Finished(T),
    Panicked(String),
    /// Still running at the deadline; the worker is handed back
    TimedOut(Worker<T>),
}

/// A named thread whose join can be bounded by a deadline.
///
/// The spawned closure owns the sending half of a completion channel; the
/// channel disconnects when the thread exits, normally or by panic.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    handle: JoinHandle<T>,
    done: Receiver<()>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done_tx = done_tx;
                f()
            })
            .map_err(|e| FleetError::from(e).with_context(format!("spawn thread {}", name)))?;

        Ok(Self { name, handle, done })
    }
}

impl<T> Worker<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the thread exits. A panic is returned as its message.
    pub fn join(self) -> std::result::Result<T, String> {
        self.handle.join().map_err(|panic| {
            panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string())
        })
    }

    /// Join, giving up at `deadline`
    pub fn join_deadline(self, deadline: Instant) -> JoinOutcome<T> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) if !self.handle.is_finished() => JoinOutcome::TimedOut(self),
            _ => match self.join() {
                Ok(value) => JoinOutcome::Finished(value),
                Err(reason) => JoinOutcome::Panicked(reason),
            },
        }
    }
}

/// Join deadlines for each shutdown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimeouts {
    pub sensors: Duration,
    pub loops: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            sensors: Duration::from_millis(5000),
            loops: Duration::from_millis(5000),
        }
    }
}

/// What happened during a shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub sensors: Vec<SensorReport>,
    pub loops: Vec<LoopReport>,
    /// Workers that missed their deadline; they are left detached
    pub timed_out: Vec<String>,
    /// Workers that panicked, with the panic message
    pub panicked: Vec<(String, String)>,
}

impl ShutdownReport {
    /// True when every unit exited on its own within its deadline
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.panicked.is_empty()
    }

    /// Messages received across all loops
    pub fn total_received(&self) -> u64 {
        self.loops.iter().map(|l| l.received).sum()
    }

    /// Readings sent across all sensors
    pub fn total_sent(&self) -> u64 {
        self.sensors.iter().map(|s| s.sent).sum()
    }
}

impl std::fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Shutdown {}: {} sensor(s) sent {}, {} loop(s) received {}",
            if self.is_clean() { "clean" } else { "incomplete" },
            self.sensors.len(),
            self.total_sent(),
            self.loops.len(),
            self.total_received()
        )?;
        for sensor in &self.sensors {
            writeln!(f, "  {}", sensor)?;
        }
        for lp in &self.loops {
            writeln!(f, "  {}", lp)?;
        }
        for name in &self.timed_out {
            writeln!(f, "  {} missed its deadline", name)?;
        }
        for (name, reason) in &self.panicked {
            writeln!(f, "  {} panicked: {}", name, reason)?;
        }
        Ok(())
    }
}

/// Owns the two stop signals and runs the shutdown sequence.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    producer_stop: StopSignal,
    server_stop: StopSignal,
    timeouts: ShutdownTimeouts,
}

impl ShutdownCoordinator {
    pub fn new(timeouts: ShutdownTimeouts) -> Self {
        Self {
            producer_stop: StopSignal::new(),
            server_stop: StopSignal::new(),
            timeouts,
        }
    }

    /// Signal observed by sensors
    pub fn producer_stop(&self) -> &StopSignal {
        &self.producer_stop
    }

    /// Signal observed by ingestion loops
    pub fn server_stop(&self) -> &StopSignal {
        &self.server_stop
    }

    pub fn timeouts(&self) -> ShutdownTimeouts {
        self.timeouts
    }

    /// Run the full sequence over the given workers.
    pub fn drain(
        &self,
        sensors: Vec<Worker<SensorReport>>,
        loops: Vec<Worker<LoopReport>>,
    ) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        tracing::info!("Stopping {} sensor(s)", sensors.len());
        self.producer_stop.raise();
        let deadline = Instant::now() + self.timeouts.sensors;
        report.sensors = join_all(sensors, deadline, &mut report.timed_out, &mut report.panicked);

        tracing::info!("Stopping {} ingestion loop(s)", loops.len());
        self.server_stop.raise();
        let deadline = Instant::now() + self.timeouts.loops;
        report.loops = join_all(loops, deadline, &mut report.timed_out, &mut report.panicked);

        if report.is_clean() {
            tracing::info!("Shutdown complete");
        } else {
            tracing::warn!(
                "Shutdown incomplete: {} timed out, {} panicked",
                report.timed_out.len(),
                report.panicked.len()
            );
        }
        report
    }

    /// Raise both signals without waiting
    pub fn abort(&self) {
        self.producer_stop.raise();
        self.server_stop.raise();
    }
}

fn join_all<T>(
    workers: Vec<Worker<T>>,
    deadline: Instant,
    timed_out: &mut Vec<String>,
    panicked: &mut Vec<(String, String)>,
) -> Vec<T> {
    let mut results = Vec::with_capacity(workers.len());
    for worker in workers {
        let name = worker.name().to_string();
        match worker.join_deadline(deadline) {
            JoinOutcome::Finished(value) => results.push(value),
            JoinOutcome::Panicked(reason) => {
                tracing::error!("{} panicked: {}", name, reason);
                panicked.push((name, reason));
            }
            JoinOutcome::TimedOut(_) => {
                tracing::warn!("{} did not stop before its deadline", name);
                timed_out.push(name);
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_early_when_raised() {
        let signal = StopSignal::new();
        let raiser = signal.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            raiser.raise();
        });

        assert!(signal.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_when_not_raised() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        signal.raise();
        signal.raise();
        assert!(signal.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_join_deadline_outcomes() {
        let quick = Worker::spawn("quick", || 42).unwrap();
        assert!(matches!(
            quick.join_deadline(Instant::now() + Duration::from_secs(1)),
            JoinOutcome::Finished(42)
        ));

        let gate = StopSignal::new();
        let slow_gate = gate.clone();
        let slow = Worker::spawn("slow", move || slow_gate.wait_timeout(Duration::from_secs(10))).unwrap();
        let slow = match slow.join_deadline(Instant::now() + Duration::from_millis(10)) {
            JoinOutcome::TimedOut(worker) => worker,
            other => panic!("expected timeout, got {other:?}"),
        };
        gate.raise();
        assert!(matches!(
            slow.join_deadline(Instant::now() + Duration::from_secs(1)),
            JoinOutcome::Finished(true)
        ));

        let boom = Worker::spawn("boom", || -> u8 { panic!("probe exploded") }).unwrap();
        match boom.join_deadline(Instant::now() + Duration::from_secs(1)) {
            JoinOutcome::Panicked(reason) => assert!(reason.contains("probe exploded")),
            other => panic!("expected panic, got {other:?}"),
        }
    }

    #[test]
    fn test_drain_orders_phases() {
        let coordinator = ShutdownCoordinator::new(ShutdownTimeouts::default());
        let producer_stop = coordinator.producer_stop().clone();
        let server_stop = coordinator.server_stop().clone();

        // The sensor checks that server-stop is still down when it is told to stop
        let sensor = Worker::spawn("sensor-Load", move || {
            producer_stop.wait_timeout(Duration::from_secs(5));
            assert!(!server_stop.is_raised());
            SensorReport {
                id: 0,
                name: "Load".into(),
                sent: 3,
                sentinel_sent: true,
                last_error: None,
            }
        })
        .unwrap();

        let report = coordinator.drain(vec![sensor], Vec::new());
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.total_sent(), 3);
        assert!(coordinator.server_stop().is_raised());
    }
}
