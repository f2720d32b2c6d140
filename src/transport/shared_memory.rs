//! Shared-memory transport.
//!
//! A named, file-backed region holding exactly one in-flight message. Both
//! ends map the same file; the consumer creates it and unlinks it on close.
//!
//! # Region layout
//!
//! ```text
//! offset  size  field
//!      0     8  magic "SFLTSHM1"
//!      8     4  version
//!     12     4  payload capacity
//!     16     4  state word (0 = EMPTY, 1 = FULL), atomic
//!     20     4  payload length, atomic
//!     24     8  sequence number of the last written message
//!     32     4  producer-closed flag, atomic
//!     36     4  consumer-closed flag, atomic
//!     64     N  payload slot
//! ```
//!
//! The producer waits for EMPTY, writes the payload and length, then
//! publishes FULL with release ordering. The consumer waits for FULL with
//! acquire ordering, copies the payload out and stores EMPTY. Waits are
//! bounded polls so both sides notice a closed peer.

use super::{ClientHandle, ServerHandle, Strategy, TransportSettings};
use crate::error::{FleetError, Result, ResultExt};
use crate::message::Message;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MAGIC: &[u8; 8] = b"SFLTSHM1";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;

const OFFSET_VERSION: usize = 8;
const OFFSET_CAPACITY: usize = 12;
const OFFSET_STATE: usize = 16;
const OFFSET_LEN: usize = 20;
const OFFSET_SEQUENCE: usize = 24;
const OFFSET_PRODUCER_CLOSED: usize = 32;
const OFFSET_CONSUMER_CLOSED: usize = 36;

const STATE_EMPTY: u32 = 0;
const STATE_FULL: u32 = 1;

/// Sleep between polls of the state word
const POLL_STEP: Duration = Duration::from_micros(500);

static REGION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a unique region path for `label` inside `dir`
pub fn region_path(dir: &Path, label: &str) -> PathBuf {
    let seq = REGION_COUNTER.fetch_add(1, Ordering::SeqCst);
    let label: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    dir.join(format!("sensor-fleet-{}-{}-{}.shm", std::process::id(), seq, label))
}

/// One mapping of a region file.
struct Region {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    capacity: usize,
}

impl Region {
    fn create(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    FleetError::ResourceBusy(format!("shared-memory region {:?} already exists", path))
                }
                _ => FleetError::from(e).with_context(format!("create region {:?}", path)),
            })?;
        file.set_len((HEADER_SIZE + capacity) as u64)
            .with_context(|| format!("size region {:?}", path))?;

        // SAFETY: the file was just created by us and sized above; every
        // concurrent access to the header goes through atomics.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.context("map region")?;
        mmap[..8].copy_from_slice(MAGIC);
        mmap[OFFSET_VERSION..OFFSET_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
        mmap[OFFSET_CAPACITY..OFFSET_CAPACITY + 4].copy_from_slice(&(capacity as u32).to_le_bytes());

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            capacity,
        })
    }

    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open region {:?}", path))?;

        // SAFETY: the region is only written through this module's protocol.
        let mmap = unsafe { MmapMut::map_mut(&file) }.context("map region")?;
        if mmap.len() < HEADER_SIZE || &mmap[..8] != MAGIC {
            return Err(FleetError::Transport(format!(
                "{:?} is not a shared-memory region",
                path
            )));
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&mmap[OFFSET_VERSION..OFFSET_VERSION + 4]);
        let version = u32::from_le_bytes(word);
        if version != VERSION {
            return Err(FleetError::Transport(format!(
                "region version {} (expected {})",
                version, VERSION
            )));
        }
        word.copy_from_slice(&mmap[OFFSET_CAPACITY..OFFSET_CAPACITY + 4]);
        let capacity = u32::from_le_bytes(word) as usize;
        if mmap.len() < HEADER_SIZE + capacity {
            return Err(FleetError::Transport(format!(
                "region {:?} shorter than its declared capacity",
                path
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            capacity,
        })
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= HEADER_SIZE);
        // SAFETY: the mapping is page aligned, `offset` is a 4-byte aligned
        // header field that lives as long as `self`, and AtomicU32 has the
        // same layout as u32.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn state(&self) -> &AtomicU32 {
        self.atomic_u32(OFFSET_STATE)
    }

    fn producer_closed(&self) -> bool {
        self.atomic_u32(OFFSET_PRODUCER_CLOSED).load(Ordering::Acquire) != 0
    }

    fn consumer_closed(&self) -> bool {
        self.atomic_u32(OFFSET_CONSUMER_CLOSED).load(Ordering::Acquire) != 0
    }
}

/// Create a region and return its two ends.
pub fn create_pair(label: &str, settings: &TransportSettings) -> Result<(ShmServer, ShmClient)> {
    std::fs::create_dir_all(&settings.shm_dir)
        .with_context(|| format!("create shared-memory directory {:?}", settings.shm_dir))?;
    let path = region_path(&settings.shm_dir, label);
    let server = ShmServer::create(&path, settings.max_frame_size)?;
    let client = ShmClient::open(&path)?;
    Ok((server, client))
}

/// Consumer side: owns the region file.
pub struct ShmServer {
    region: Option<Region>,
    path: PathBuf,
    buf: Vec<u8>,
}

impl ShmServer {
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        let region = Region::create(path, capacity)?;
        tracing::debug!("Created shared-memory region {:?} ({} bytes)", path, capacity);
        Ok(Self {
            region: Some(region),
            path: path.to_path_buf(),
            buf: Vec::with_capacity(capacity),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the pending payload out and mark the slot EMPTY.
    fn take_payload(region: &Region, buf: &mut Vec<u8>) -> Result<Message> {
        let len = region.atomic_u32(OFFSET_LEN).load(Ordering::Relaxed) as usize;
        buf.clear();
        let result = if len > region.capacity {
            Err(FleetError::MalformedMessage(format!(
                "payload length {} exceeds region capacity {}",
                len, region.capacity
            )))
        } else {
            buf.extend_from_slice(&region.mmap[HEADER_SIZE..HEADER_SIZE + len]);
            Message::deserialize(buf)
        };
        region.state().store(STATE_EMPTY, Ordering::Release);
        result
    }
}

impl ServerHandle for ShmServer {
    fn strategy(&self) -> Strategy {
        Strategy::SharedMemory
    }

    fn label(&self) -> String {
        format!("shm:{}", self.path.display())
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let Some(region) = self.region.as_ref() else {
            return Err(FleetError::ConnectionClosed);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if region.state().load(Ordering::Acquire) == STATE_FULL {
                return Self::take_payload(region, &mut self.buf).map(Some);
            }
            if region.producer_closed() {
                // The producer may have published a last message before closing
                if region.state().load(Ordering::Acquire) == STATE_FULL {
                    return Self::take_payload(region, &mut self.buf).map(Some);
                }
                return Err(FleetError::ConnectionClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_STEP.min(deadline - now));
        }
    }

    fn close(&mut self) {
        if let Some(region) = self.region.take() {
            region.atomic_u32(OFFSET_CONSUMER_CLOSED).store(1, Ordering::Release);
            drop(region);
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("Removed shared-memory region {:?}", self.path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove region {:?}: {}", self.path, e),
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.region.is_none()
    }
}

impl Drop for ShmServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer side: maps an existing region.
pub struct ShmClient {
    region: Option<Region>,
    sequence: u64,
}

impl ShmClient {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            region: Some(Region::open(path)?),
            sequence: 0,
        })
    }

    /// Number of messages published so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl ClientHandle for ShmClient {
    fn strategy(&self) -> Strategy {
        Strategy::SharedMemory
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let Some(region) = self.region.as_mut() else {
            return Err(FleetError::ConnectionClosed);
        };

        let body = message.serialize()?;
        if body.len() > region.capacity {
            return Err(FleetError::Transport(format!(
                "message of {} bytes exceeds region capacity {}",
                body.len(),
                region.capacity
            )));
        }

        // Wait for the consumer to drain the previous message
        while region.state().load(Ordering::Acquire) != STATE_EMPTY {
            if region.consumer_closed() {
                return Err(FleetError::Transport("shared-memory consumer closed".into()));
            }
            std::thread::sleep(POLL_STEP);
        }
        if region.consumer_closed() {
            return Err(FleetError::Transport("shared-memory consumer closed".into()));
        }

        region.mmap[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(&body);
        self.sequence += 1;
        region.mmap[OFFSET_SEQUENCE..OFFSET_SEQUENCE + 8].copy_from_slice(&self.sequence.to_le_bytes());
        region.atomic_u32(OFFSET_LEN).store(body.len() as u32, Ordering::Relaxed);
        region.state().store(STATE_FULL, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(region) = self.region.take() {
            region.atomic_u32(OFFSET_PRODUCER_CLOSED).store(1, Ordering::Release);
        }
    }

    fn is_closed(&self) -> bool {
        self.region.is_none()
    }
}

impl Drop for ShmClient {
    fn drop(&mut self) {
        self.close();
    }
}
