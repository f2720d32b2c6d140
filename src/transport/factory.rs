//! Connection factory
//!
//! Creates transport pairs for a strategy and wires the server side to an
//! ingestion loop over a given sink.
//!
//! For the socket strategy the listener is a per-address singleton: the first
//! pair for an address binds it and comes back with a fresh
//! [`IngestionLoop`]; later pairs share that listener, come back without a
//! loop, and their client is accepted by the loop already running.

use super::{pipe, shared_memory, socket, ClientHandle, ServerSide, Strategy, TransportSettings};
use crate::error::{Result, ResultExt};
use crate::ingestion::IngestionLoop;
use crate::sink::SinkAggregator;
use std::net::SocketAddr;

/// A created pair: producer handle plus, when this pair owns a new
/// listening resource, the loop that must be started to serve it.
pub struct TransportPair {
    pub strategy: Strategy,
    pub ingestion: Option<IngestionLoop>,
    pub client: Box<dyn ClientHandle>,
}

impl TransportPair {
    /// True when the caller has to run [`TransportPair::ingestion`]
    pub fn needs_loop(&self) -> bool {
        self.ingestion.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    settings: TransportSettings,
    default_address: SocketAddr,
}

impl ConnectionFactory {
    pub fn new(settings: TransportSettings, default_address: SocketAddr) -> Self {
        Self {
            settings,
            default_address,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn default_address(&self) -> SocketAddr {
        self.default_address
    }

    /// Create raw server and client sides without attaching a sink.
    ///
    /// `label` names the channel in logs and in shared-memory file names.
    /// `address` only applies to the socket strategy.
    pub fn open(
        &self,
        strategy: Strategy,
        label: &str,
        address: Option<SocketAddr>,
    ) -> Result<(ServerSide, Box<dyn ClientHandle>)> {
        self.open_for(strategy, label, address, None)
    }

    /// `owner` tags a newly bound listener; joining a listener tagged with a
    /// different owner fails before any client connects.
    fn open_for(
        &self,
        strategy: Strategy,
        label: &str,
        address: Option<SocketAddr>,
        owner: Option<usize>,
    ) -> Result<(ServerSide, Box<dyn ClientHandle>)> {
        match strategy {
            Strategy::Socket => {
                let requested = address.unwrap_or(self.default_address);
                let (listener, created) = socket::acquire_for(requested, &self.settings, owner)?;
                let client = socket::SocketClient::connect(listener.local_addr(), &self.settings)
                    .with_context(|| format!("client {} on {}", label, requested))?;
                let server = if created {
                    ServerSide::Listener(listener)
                } else {
                    ServerSide::Attached(requested)
                };
                Ok((server, Box::new(client)))
            }
            Strategy::SharedMemory => {
                let (server, client) = shared_memory::create_pair(label, &self.settings)?;
                Ok((ServerSide::Channel(Box::new(server)), Box::new(client)))
            }
            Strategy::Pipe => {
                let (server, client) = pipe::create_pair(label, &self.settings)?;
                Ok((ServerSide::Channel(Box::new(server)), Box::new(client)))
            }
        }
    }

    /// Create a pair whose server side forwards to `sink`.
    ///
    /// A socket pair for an address already served by a running loop joins
    /// that loop, which must forward to the same aggregator (or a clone of
    /// it); any other `sink` is a `Config` error.
    pub fn create(
        &self,
        strategy: Strategy,
        label: &str,
        sink: &SinkAggregator,
        address: Option<SocketAddr>,
    ) -> Result<TransportPair> {
        let (server, client) = self.open_for(strategy, label, address, Some(sink.identity()))?;
        let poll_interval = self.settings.poll_interval;
        let ingestion = match server {
            ServerSide::Listener(listener) => Some(IngestionLoop::for_listener(listener, sink.clone(), poll_interval)),
            ServerSide::Channel(handle) => Some(IngestionLoop::for_channel(handle, sink.clone(), poll_interval)),
            ServerSide::Attached(addr) => {
                tracing::debug!("{} joins the listener on {}", label, addr);
                None
            }
        };

        tracing::debug!("Created {} pair for {}", strategy, label);
        Ok(TransportPair {
            strategy,
            ingestion,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use crate::message::Message;
    use crate::sink::MemorySink;
    use crate::shutdown::StopSignal;
    use crate::transport::ServerHandle;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    fn factory(dir: &TempDir) -> ConnectionFactory {
        let settings = TransportSettings {
            poll_interval: Duration::from_millis(5),
            shm_dir: dir.path().to_path_buf(),
            ..TransportSettings::default()
        };
        ConnectionFactory::new(settings, "127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_open_channel_strategies() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        for strategy in [Strategy::SharedMemory, Strategy::Pipe] {
            let (server, mut client) = factory.open(strategy, "Load", None).unwrap();
            let ServerSide::Channel(mut server) = server else {
                panic!("{strategy} should yield a dedicated channel");
            };
            assert_eq!(server.strategy(), strategy);
            client.send(&Message::reading(0, "Load", 2.5, "T1")).unwrap();
            assert_eq!(server.receive().unwrap().data(), Some(2.5));
        }
    }

    #[test]
    #[serial]
    fn test_second_socket_pair_shares_listener() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let sink = SinkAggregator::new();
        let memory = MemorySink::new();
        sink.add(memory.clone()).unwrap();

        let mut first = factory.create(Strategy::Socket, "Load", &sink, None).unwrap();
        let mut second = factory.create(Strategy::Socket, "Temp", &sink, None).unwrap();
        assert!(first.needs_loop());
        assert!(!second.needs_loop());

        let stop = StopSignal::new();
        let worker = first.ingestion.take().unwrap().spawn(stop.clone()).unwrap();
        first.client.send(&Message::reading(0, "Load", 1.0, "T1")).unwrap();
        second.client.send(&Message::reading(1, "Temp", 2.0, "T1")).unwrap();
        first.client.close();
        second.client.close();

        stop.raise();
        let report = worker.join().unwrap();
        assert_eq!(report.channels, 2);
        assert_eq!(report.received, 2);
        assert_eq!(memory.len(), 2);
        assert!(socket::lookup("127.0.0.1:0".parse().unwrap()).is_none());
    }

    #[test]
    #[serial]
    fn test_unserved_listener_is_rebound() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let sink = SinkAggregator::new();
        let memory = MemorySink::new();
        sink.add(memory.clone()).unwrap();

        let abandoned = factory.create(Strategy::Socket, "A", &sink, None).unwrap();
        assert!(abandoned.needs_loop());
        drop(abandoned);
        assert!(socket::lookup("127.0.0.1:0".parse().unwrap()).is_none());

        let mut pair = factory.create(Strategy::Socket, "B", &sink, None).unwrap();
        assert!(pair.needs_loop());
        let stop = StopSignal::new();
        let worker = pair.ingestion.take().unwrap().spawn(stop.clone()).unwrap();
        pair.client.send(&Message::reading(1, "B", 4.0, "T1")).unwrap();
        pair.client.close();

        stop.raise();
        let report = worker.join().unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(memory.messages_for("B").len(), 1);
    }

    #[test]
    #[serial]
    fn test_socket_pair_for_other_sink_is_rejected() {
        let dir = TempDir::new().unwrap();
        let factory = factory(&dir);
        let sink_a = SinkAggregator::new();
        let sink_b = SinkAggregator::new();

        let first = factory.create(Strategy::Socket, "A", &sink_a, None).unwrap();
        let err = factory.create(Strategy::Socket, "B", &sink_b, None).err().unwrap();
        assert!(matches!(err, FleetError::Config(_)), "{err}");

        let joined = factory.create(Strategy::Socket, "C", &sink_a.clone(), None).unwrap();
        assert!(!joined.needs_loop());
        drop(joined);
        drop(first);
    }
}
