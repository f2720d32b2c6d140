//! Server-side ingestion loops
//!
//! An [`IngestionLoop`] turns transport bytes into [`SinkAggregator::append`]
//! calls. There is one loop per listening resource:
//!
//! - a socket listener: the loop accepts clients in a cycle and hands each
//!   accepted channel to its own reader thread, so a slow client never
//!   blocks the others
//! - a shared-memory region or pipe: the loop reads its single channel
//!   directly
//!
//! # State machine
//!
//! ```text
//! IDLE -> LISTENING -> READING <-> DISPATCHING -> STOPPING -> CLOSED
//! ```
//!
//! Every blocking call is bounded by the poll interval, so the server-stop
//! signal is observed at most one interval late. After it is raised, readers
//! drain: they keep reading while data arrives within one poll interval and
//! exit at the first empty poll. Anything sent before the producers stopped
//! is therefore still delivered.

use crate::error::{FleetError, Result};
use crate::shutdown::{StopSignal, Worker};
use crate::sink::SinkAggregator;
use crate::transport::socket::{self, SocketListener};
use crate::transport::ServerHandle;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Observable phase of an ingestion loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Listening = 1,
    Reading = 2,
    Dispatching = 3,
    Stopping = 4,
    Closed = 5,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Idle,
            1 => LoopState::Listening,
            2 => LoopState::Reading,
            3 => LoopState::Dispatching,
            4 => LoopState::Stopping,
            _ => LoopState::Closed,
        }
    }
}

/// Shared view of a loop's current [`LoopState`]
#[derive(Debug, Clone)]
pub struct LoopStateHandle(Arc<AtomicU8>);

impl LoopStateHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(LoopState::Idle as u8)))
    }

    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Why a loop or channel finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The producer sent its end-of-stream sentinel
    Sentinel,
    /// Server-stop was observed and the channel drained
    Stopped,
    /// The producer closed without a sentinel
    PeerClosed,
    /// Abrupt failure, treated as an implicit sentinel
    TransportFailed(String),
}

/// Summary returned by [`IngestionLoop::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub name: String,
    /// Messages forwarded to the aggregator (sentinels excluded)
    pub received: u64,
    /// Frames skipped because they failed to decode
    pub malformed: u64,
    /// Channels served
    pub channels: usize,
    /// Channels that ended with a transport failure
    pub failed_channels: usize,
    pub end_reason: EndReason,
}

impl fmt::Display for LoopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: received {} over {} channel(s), {} malformed, {} failed, ended by {:?}",
            self.name, self.received, self.channels, self.malformed, self.failed_channels, self.end_reason
        )
    }
}

/// Counters for one channel
#[derive(Debug)]
struct ChannelStats {
    received: u64,
    malformed: u64,
    end: EndReason,
}

/// Source of accepted channels for a listening loop
trait Acceptor {
    fn accept_channel(&self, timeout: Duration) -> Result<Option<Box<dyn ServerHandle>>>;

    /// Called once, after every reader has exited
    fn retire(&self) {}
}

impl Acceptor for SocketListener {
    fn accept_channel(&self, timeout: Duration) -> Result<Option<Box<dyn ServerHandle>>> {
        Ok(self
            .accept_timeout(timeout)?
            .map(|channel| Box::new(channel) as Box<dyn ServerHandle>))
    }

    fn retire(&self) {
        socket::release_listener(self);
    }
}

enum LoopSource {
    Listener(Arc<SocketListener>),
    Channel(Box<dyn ServerHandle>),
}

/// Receive loop bound to one listening resource.
pub struct IngestionLoop {
    name: String,
    source: LoopSource,
    sink: SinkAggregator,
    poll_interval: Duration,
    state: LoopStateHandle,
}

impl IngestionLoop {
    /// Loop serving every client of a socket listener
    pub fn for_listener(listener: Arc<SocketListener>, sink: SinkAggregator, poll_interval: Duration) -> Self {
        Self {
            name: format!("ingest-{}", listener.local_addr()),
            source: LoopSource::Listener(listener),
            sink,
            poll_interval,
            state: LoopStateHandle::new(),
        }
    }

    /// Loop reading a single shared-memory or pipe channel
    pub fn for_channel(handle: Box<dyn ServerHandle>, sink: SinkAggregator, poll_interval: Duration) -> Self {
        Self {
            name: format!("ingest-{}", handle.label()),
            source: LoopSource::Channel(handle),
            sink,
            poll_interval,
            state: LoopStateHandle::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoopStateHandle {
        self.state.clone()
    }

    /// Start the loop on its own thread
    pub fn spawn(self, stop: StopSignal) -> Result<Worker<LoopReport>> {
        let name = self.name.clone();
        Worker::spawn(name, move || self.run(&stop))
    }

    /// Serve until a sentinel (single channel) or until `stop` is raised.
    pub fn run(self, stop: &StopSignal) -> LoopReport {
        let IngestionLoop {
            name,
            source,
            sink,
            poll_interval,
            state,
        } = self;
        tracing::info!("Ingestion loop {} started", name);

        let report = match source {
            LoopSource::Channel(mut handle) => {
                let stats = read_channel(handle.as_mut(), &sink, stop, poll_interval, Some(&state));
                state.set(LoopState::Stopping);
                handle.close();
                LoopReport {
                    name,
                    received: stats.received,
                    malformed: stats.malformed,
                    channels: 1,
                    failed_channels: usize::from(matches!(stats.end, EndReason::TransportFailed(_))),
                    end_reason: stats.end,
                }
            }
            LoopSource::Listener(listener) => serve_listener(name, listener.as_ref(), &sink, stop, poll_interval, &state),
        };

        state.set(LoopState::Closed);
        tracing::info!("{}", report);
        report
    }
}

fn serve_listener(
    name: String,
    listener: &dyn Acceptor,
    sink: &SinkAggregator,
    stop: &StopSignal,
    poll_interval: Duration,
    state: &LoopStateHandle,
) -> LoopReport {
    state.set(LoopState::Listening);
    let mut readers: Vec<Worker<ChannelStats>> = Vec::new();
    let mut finished: Vec<ChannelStats> = Vec::new();
    let mut channels = 0usize;

    let mut spawn_reader = |channel: Box<dyn ServerHandle>, readers: &mut Vec<Worker<ChannelStats>>| {
        channels += 1;
        let label = channel.label();
        let sink = sink.clone();
        let stop = stop.clone();
        let spawned = Worker::spawn(format!("{}-reader-{}", name, channels), move || {
            let mut channel = channel;
            let stats = read_channel(channel.as_mut(), &sink, &stop, poll_interval, None);
            channel.close();
            stats
        });
        match spawned {
            Ok(worker) => readers.push(worker),
            Err(e) => tracing::warn!("Dropping {}: {}", label, e),
        }
    };

    while !stop.is_raised() {
        match listener.accept_channel(poll_interval) {
            Ok(Some(channel)) => spawn_reader(channel, &mut readers),
            Ok(None) => {}
            Err(e) if stop.is_raised() => {
                let race = FleetError::ShutdownRace(e.to_string());
                tracing::debug!("{}: {}", name, race);
                break;
            }
            Err(e) => {
                tracing::warn!("{}: accept failed: {}", name, e);
                stop.wait_timeout(poll_interval);
            }
        }

        // Reap readers whose channel already ended
        let (done, running): (Vec<_>, Vec<_>) = readers.drain(..).partition(|r| r.is_finished());
        readers = running;
        finished.extend(done.into_iter().filter_map(join_reader));
    }

    state.set(LoopState::Stopping);

    // Clients that connected before the producers stopped may still be queued
    loop {
        match listener.accept_channel(Duration::ZERO) {
            Ok(Some(channel)) => spawn_reader(channel, &mut readers),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("{}: {}", name, FleetError::ShutdownRace(e.to_string()));
                break;
            }
        }
    }

    finished.extend(readers.into_iter().filter_map(join_reader));

    // The listener goes away only after every reader has exited
    listener.retire();

    LoopReport {
        name,
        received: finished.iter().map(|s| s.received).sum(),
        malformed: finished.iter().map(|s| s.malformed).sum(),
        channels,
        failed_channels: finished
            .iter()
            .filter(|s| matches!(s.end, EndReason::TransportFailed(_)))
            .count(),
        end_reason: EndReason::Stopped,
    }
}

fn join_reader(reader: Worker<ChannelStats>) -> Option<ChannelStats> {
    let name = reader.name().to_string();
    match reader.join() {
        Ok(stats) => Some(stats),
        Err(reason) => {
            tracing::error!("{} panicked: {}", name, reason);
            None
        }
    }
}

/// Read one channel until it ends, forwarding every reading to `sink`.
fn read_channel(
    handle: &mut dyn ServerHandle,
    sink: &SinkAggregator,
    stop: &StopSignal,
    poll_interval: Duration,
    state: Option<&LoopStateHandle>,
) -> ChannelStats {
    let label = handle.label();
    let set_state = |s: LoopState| {
        if let Some(state) = state {
            state.set(s);
        }
    };

    let mut stats = ChannelStats {
        received: 0,
        malformed: 0,
        end: EndReason::Stopped,
    };
    let mut draining = false;
    tracing::debug!("Reading {}", label);

    loop {
        if !draining && stop.is_raised() {
            tracing::debug!("{}: stop observed, draining", label);
            draining = true;
        }

        set_state(LoopState::Reading);
        match handle.receive_timeout(poll_interval) {
            Ok(Some(message)) if message.is_end_of_stream() => {
                tracing::debug!("{}: end of stream from {}", label, message.name());
                stats.end = EndReason::Sentinel;
                break;
            }
            Ok(Some(message)) => {
                set_state(LoopState::Dispatching);
                stats.received += 1;
                if let Err(e) = sink.append(&message) {
                    tracing::warn!("{}: {}", label, e);
                }
            }
            Ok(None) => {
                if draining {
                    stats.end = EndReason::Stopped;
                    break;
                }
            }
            Err(FleetError::MalformedMessage(reason)) => {
                stats.malformed += 1;
                tracing::warn!("{}: skipping malformed message: {}", label, reason);
            }
            Err(e) => {
                stats.end = match e.root() {
                    FleetError::ConnectionClosed => {
                        tracing::debug!("{}: peer closed", label);
                        EndReason::PeerClosed
                    }
                    FleetError::ShutdownRace(_) => {
                        tracing::debug!("{}: {}", label, e);
                        EndReason::Stopped
                    }
                    _ => {
                        if stop.is_raised() {
                            tracing::debug!("{}: ended during shutdown: {}", label, e);
                        } else {
                            tracing::warn!("{}: channel failed: {}", label, e);
                        }
                        EndReason::TransportFailed(e.to_string())
                    }
                };
                break;
            }
        }
    }

    set_state(LoopState::Stopping);
    handle.close();
    tracing::debug!(
        "{}: {} received, {} malformed, ended by {:?}",
        label,
        stats.received,
        stats.malformed,
        stats.end
    );
    stats
}
