//! Socket transport.
//!
//! One [`SocketListener`] per requested address, kept in a process-wide
//! registry. The first pair created for an address binds the listener and
//! hands it to a new ingestion loop; later pairs for the same address only
//! connect a client, and the running loop accepts it.
//!
//! Accept and read never block indefinitely: the listener is non-blocking
//! and polled, accepted sockets carry a read timeout, so stop signals are
//! rechecked at a bounded interval.

use super::framing::{write_frame, Fill, FrameDecoder};
use super::{ClientHandle, ServerHandle, Strategy, TransportSettings};
use crate::error::{FleetError, Result, ResultExt};
use crate::message::Message;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Pending connection backlog for each listener
const LISTEN_BACKLOG: i32 = 128;

/// Sleep between non-blocking accept attempts
const ACCEPT_POLL_STEP: Duration = Duration::from_millis(5);

/// Smallest read timeout the OS accepts
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

type Registry = Mutex<HashMap<SocketAddr, Weak<SocketListener>>>;

static LISTENERS: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    LISTENERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Return the listener registered for `addr`, binding it on first use.
///
/// The boolean is true when this call created the listener, which makes the
/// caller responsible for serving it with an ingestion loop. The registry
/// only holds weak references: once every strong handle is gone (the loop
/// exited, or was dropped without running) the address is free again.
pub fn acquire(addr: SocketAddr, settings: &TransportSettings) -> Result<(Arc<SocketListener>, bool)> {
    acquire_for(addr, settings, None)
}

/// Like [`acquire`], tagging a new listener with `owner`, the identity of
/// the consumer its loop forwards to. Joining a listener tagged with a
/// different owner is a `Config` error.
pub fn acquire_for(
    addr: SocketAddr,
    settings: &TransportSettings,
    owner: Option<usize>,
) -> Result<(Arc<SocketListener>, bool)> {
    let mut listeners = registry().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = listeners.get(&addr).and_then(Weak::upgrade) {
        if let (Some(theirs), Some(ours)) = (existing.owner, owner) {
            if theirs != ours {
                return Err(FleetError::Config(format!(
                    "{} is already served by a loop forwarding to a different sink",
                    addr
                )));
            }
        }
        return Ok((existing, false));
    }

    let listener = Arc::new(SocketListener::bind(addr, settings, owner)?);
    listeners.insert(addr, Arc::downgrade(&listener));
    tracing::info!("Listening on {} (requested {})", listener.local_addr(), addr);
    Ok((listener, true))
}

/// Drop the registry entry for `addr`. Returns false if no live listener
/// was registered.
pub fn release(addr: SocketAddr) -> bool {
    let removed = registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&addr)
        .is_some_and(|entry| entry.strong_count() > 0);
    if removed {
        tracing::debug!("Released listener registered for {}", addr);
    }
    removed
}

/// Drop the registry entry for `listener`'s address if it still points at
/// `listener`.
pub fn release_listener(listener: &SocketListener) -> bool {
    let mut listeners = registry().lock().unwrap_or_else(PoisonError::into_inner);
    let addr = listener.requested_addr();
    let ours = listeners
        .get(&addr)
        .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), listener));
    if ours {
        listeners.remove(&addr);
        tracing::debug!("Released listener registered for {}", addr);
    }
    ours
}

/// Listener registered for `addr`, if it is still alive
pub fn lookup(addr: SocketAddr) -> Option<Arc<SocketListener>> {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&addr)
        .and_then(Weak::upgrade)
}

/// Number of live listeners in this process
pub fn listener_count() -> usize {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .filter(|entry| entry.strong_count() > 0)
        .count()
}

/// Requested addresses that currently have a live listener
pub fn registered_addresses() -> Vec<SocketAddr> {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|(_, entry)| entry.strong_count() > 0)
        .map(|(addr, _)| *addr)
        .collect()
}

/// Shared listening endpoint for one address.
#[derive(Debug)]
pub struct SocketListener {
    requested: SocketAddr,
    local: SocketAddr,
    listener: TcpListener,
    accepted: AtomicUsize,
    settings: TransportSettings,
    owner: Option<usize>,
}

impl SocketListener {
    fn bind(addr: SocketAddr, settings: &TransportSettings, owner: Option<usize>) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .context("create listening socket")?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into()).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => FleetError::ResourceBusy(format!("{} is already bound", addr)),
            _ => FleetError::from(e).with_context(format!("bind {}", addr)),
        })?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        Ok(Self {
            requested: addr,
            local,
            listener,
            accepted: AtomicUsize::new(0),
            settings: settings.clone(),
            owner,
        })
    }

    /// Address this listener is registered under
    pub fn requested_addr(&self) -> SocketAddr {
        self.requested
    }

    /// Address clients connect to (differs from the requested one for port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Identity of the consumer this listener's loop forwards to, if tagged
    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    /// Number of channels accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for the next client. A zero timeout tries once.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<SocketChannel>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let channel = SocketChannel::from_accepted(stream, peer, &self.settings)?;
                    self.accepted.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!("Accepted {} on {}", peer, self.local);
                    return Ok(Some(channel));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL_STEP.min(deadline - now));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Server side of one accepted client socket.
#[derive(Debug)]
pub struct SocketChannel {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    decoder: FrameDecoder,
    read_timeout: Duration,
}

impl SocketChannel {
    fn from_accepted(stream: TcpStream, peer: SocketAddr, settings: &TransportSettings) -> Result<Self> {
        // Accepted sockets may inherit non-blocking mode from the listener
        stream.set_nonblocking(false)?;
        let read_timeout = settings.poll_interval.max(MIN_READ_TIMEOUT);
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            peer,
            decoder: FrameDecoder::new(settings.max_frame_size),
            read_timeout,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl ServerHandle for SocketChannel {
    fn strategy(&self) -> Strategy {
        Strategy::Socket
    }

    fn label(&self) -> String {
        format!("socket:{}", self.peer)
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(FleetError::ConnectionClosed);
        };

        let timeout = timeout.max(MIN_READ_TIMEOUT);
        if timeout != self.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
            self.read_timeout = timeout;
        }

        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Message::deserialize(&frame).map(Some);
            }
            match self.decoder.fill_from(stream)? {
                Fill::Data => continue,
                Fill::Idle => return Ok(None),
                Fill::Eof => return Err(self.decoder.eof_error()),
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!("Closed server channel for {}", self.peer);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer side of the socket strategy.
#[derive(Debug)]
pub struct SocketClient {
    stream: Option<TcpStream>,
    server: SocketAddr,
    max_frame_size: usize,
}

impl SocketClient {
    /// Connect to a listener
    pub fn connect(server: SocketAddr, settings: &TransportSettings) -> Result<Self> {
        let stream = TcpStream::connect(server).map_err(|e| {
            FleetError::Transport(format!("connect to {} failed: {}", server, e))
        })?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            server,
            max_frame_size: settings.max_frame_size,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }
}

impl ClientHandle for SocketClient {
    fn strategy(&self) -> Strategy {
        Strategy::Socket
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(FleetError::ConnectionClosed);
        };
        let body = message.serialize()?;
        write_frame(stream, &body, self.max_frame_size)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn loopback_any() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_accept_times_out_without_clients() {
        let listener = SocketListener::bind(loopback_any(), &TransportSettings::default(), None).unwrap();
        let started = Instant::now();
        assert!(listener.accept_timeout(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(listener.accepted(), 0);
    }

    #[test]
    fn test_send_and_receive_over_loopback() {
        let settings = TransportSettings::default();
        let listener = SocketListener::bind(loopback_any(), &settings, None).unwrap();
        let mut client = SocketClient::connect(listener.local_addr(), &settings).unwrap();
        let mut channel = listener
            .accept_timeout(Duration::from_secs(1))
            .unwrap()
            .expect("client should be accepted");

        let msg = Message::reading(7, "Load", 0.25, "T1");
        client.send(&msg).unwrap();
        client.close();

        assert_eq!(channel.receive().unwrap(), msg);
        let err = loop {
            match channel.receive_timeout(Duration::from_millis(20)) {
                Ok(None) => continue,
                Ok(Some(m)) => panic!("unexpected message {m:?}"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, FleetError::ConnectionClosed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let settings = TransportSettings::default();
        let listener = SocketListener::bind(loopback_any(), &settings, None).unwrap();
        let mut client = SocketClient::connect(listener.local_addr(), &settings).unwrap();
        let mut channel = listener.accept_timeout(Duration::from_secs(1)).unwrap().unwrap();

        client.close();
        client.close();
        channel.close();
        channel.close();
        assert!(client.is_closed());
        assert!(channel.is_closed());
        assert!(matches!(
            client.send(&Message::reading(1, "x", 1.0, "T")),
            Err(FleetError::ConnectionClosed)
        ));
    }

    #[test]
    #[serial]
    fn test_registry_binds_once_per_address() {
        let addr = loopback_any();
        let settings = TransportSettings::default();
        let (first, created) = acquire(addr, &settings).unwrap();
        assert!(created);
        let (second, created_again) = acquire(addr, &settings).unwrap();
        assert!(!created_again);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registered_addresses().iter().filter(|a| **a == addr).count(), 1);

        assert!(release(addr));
        assert!(!release(addr));
        assert!(lookup(addr).is_none());
    }

    #[test]
    fn test_bound_port_is_resource_busy() {
        let settings = TransportSettings::default();
        let holder = std::net::TcpListener::bind(loopback_any()).unwrap();
        let taken = holder.local_addr().unwrap();
        let err = SocketListener::bind(taken, &settings, None).unwrap_err();
        assert!(err.is_fatal(), "expected ResourceBusy, got {err}");
    }

    #[test]
    #[serial]
    fn test_dropped_listener_frees_its_address() {
        let addr = loopback_any();
        let settings = TransportSettings::default();
        let (first, created) = acquire(addr, &settings).unwrap();
        assert!(created);
        drop(first);

        assert!(lookup(addr).is_none());
        assert!(!registered_addresses().contains(&addr));
        let (_second, created_again) = acquire(addr, &settings).unwrap();
        assert!(created_again);
        release(addr);
    }

    #[test]
    #[serial]
    fn test_owner_mismatch_is_rejected() {
        let addr = loopback_any();
        let settings = TransportSettings::default();
        let (first, _) = acquire_for(addr, &settings, Some(1)).unwrap();
        assert_eq!(first.owner(), Some(1));

        let err = acquire_for(addr, &settings, Some(2)).unwrap_err();
        assert!(matches!(err, FleetError::Config(_)), "{err}");
        let (same, created) = acquire_for(addr, &settings, Some(1)).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &same));

        assert!(release_listener(&first));
        assert!(!release_listener(&first));
    }
}
