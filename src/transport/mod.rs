//! Pluggable inter-process transports.
//!
//! Three structurally different strategies converge on one boundary:
//!
//! - [`ClientHandle`] - owned by the producing sensor, exposes `send`
//! - [`ServerHandle`] - owned by an ingestion loop, exposes a blocking
//!   `receive` and a bounded [`ServerHandle::receive_timeout`]
//!
//! # Strategies
//!
//! - **Socket** ([`socket`]) - TCP stream, length-prefixed frames. One
//!   listener per address, shared by every pair created for that address.
//! - **Shared memory** ([`shared_memory`]) - file-backed region holding one
//!   in-flight message, guarded by an atomic state word.
//! - **Pipe** ([`pipe`]) - unidirectional byte stream, length-prefixed frames.
//!
//! Pairs are created through the [`ConnectionFactory`].

pub mod factory;
pub mod framing;
pub mod pipe;
pub mod shared_memory;
pub mod socket;

pub use factory::{ConnectionFactory, TransportPair};
pub use socket::SocketListener;

use crate::error::Result;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default listening address for the socket strategy
pub const DEFAULT_SOCKET_ADDRESS: &str = "127.0.0.1:33333";

/// Default interval at which blocking waits recheck stop signals
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default bound of the pipe consumer's frame queue
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Transport strategy tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Socket,
    SharedMemory,
    Pipe,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Socket => "socket",
            Strategy::SharedMemory => "shared_memory",
            Strategy::Pipe => "pipe",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = crate::error::FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socket" => Ok(Strategy::Socket),
            "shared_memory" | "shm" => Ok(Strategy::SharedMemory),
            "pipe" => Ok(Strategy::Pipe),
            other => Err(crate::error::FleetError::Config(format!(
                "unknown transport strategy '{}'",
                other
            ))),
        }
    }
}

/// Tunables shared by every transport
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Upper bound on any single blocking wait before stop signals are rechecked
    pub poll_interval: Duration,
    /// Largest encoded message accepted on the wire
    pub max_frame_size: usize,
    /// Bound of the pipe consumer queue
    pub queue_depth: usize,
    /// Directory holding shared-memory regions
    pub shm_dir: PathBuf,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_frame_size: framing::DEFAULT_MAX_FRAME_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            shm_dir: default_shm_dir(),
        }
    }
}

/// Platform runtime directory, falling back to the temp directory
pub fn default_shm_dir() -> PathBuf {
    dirs_next::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Producer side of a transport pair.
pub trait ClientHandle: Send {
    fn strategy(&self) -> Strategy;

    /// Send one message. Fails with `Transport` when the peer is broken or
    /// gone and with `ConnectionClosed` after [`ClientHandle::close`].
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Release the channel. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Consumer side of a single channel.
pub trait ServerHandle: Send {
    fn strategy(&self) -> Strategy;

    /// Human-readable channel label for logs
    fn label(&self) -> String;

    /// Wait up to `timeout` for the next message; `Ok(None)` when nothing
    /// arrived. A frame that fails to decode is consumed and reported as
    /// `MalformedMessage`; later calls continue with the next frame.
    fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Block until a message is available. Fails with `ConnectionClosed`
    /// when the peer has gone away gracefully.
    fn receive(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.receive_timeout(DEFAULT_POLL_INTERVAL)? {
                return Ok(message);
            }
        }
    }

    /// Release the channel. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Server side of a freshly created pair.
pub enum ServerSide {
    /// A listener created by this pair; an ingestion loop must be started for it
    Listener(Arc<SocketListener>),
    /// A socket pair whose listener is already served by a running loop
    Attached(SocketAddr),
    /// A dedicated single-channel consumer
    Channel(Box<dyn ServerHandle>),
}

impl ServerSide {
    /// True when the caller has to start a new ingestion loop
    pub fn needs_loop(&self) -> bool {
        !matches!(self, ServerSide::Attached(_))
    }
}

impl fmt::Debug for ServerSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSide::Listener(l) => write!(f, "Listener({})", l.local_addr()),
            ServerSide::Attached(addr) => write!(f, "Attached({})", addr),
            ServerSide::Channel(h) => write!(f, "Channel({})", h.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_and_display() {
        for strategy in [Strategy::Socket, Strategy::SharedMemory, Strategy::Pipe] {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), strategy);
        }
        assert_eq!("shm".parse::<Strategy>().unwrap(), Strategy::SharedMemory);
        assert!("carrier-pigeon".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&Strategy::SharedMemory).unwrap();
        assert_eq!(json, "\"shared_memory\"");
    }
}
