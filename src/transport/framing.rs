//! Length-prefixed framing for byte-stream transports.
//!
//! ```text
//! [4 bytes: length (big-endian)][N bytes: encoded Message]
//! ```
//!
//! Sockets and pipes are not self-delimiting; every message travels as one
//! frame. [`FrameDecoder`] is resumable: a read that times out halfway
//! through a frame keeps the partial bytes for the next call.

use crate::error::{FleetError, Result};
use std::io::{self, Read, Write};

/// Length prefix size (4 bytes, big-endian u32)
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (64 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Bytes requested from the reader per fill
const READ_CHUNK_SIZE: usize = 4096;

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8], max_frame_size: usize) -> Result<()> {
    if body.len() > max_frame_size {
        return Err(FleetError::Transport(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            body.len(),
            max_frame_size
        )));
    }

    // Single buffer so the prefix and body leave in one write call
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Outcome of one read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// New bytes were buffered
    Data,
    /// The read timed out or would block; nothing new
    Idle,
    /// The peer closed its end
    Eof,
}

/// Resumable decoder for length-prefixed frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
            max_frame_size,
        }
    }

    /// Pop a complete frame body if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(FleetError::Transport(format!(
                "declared frame length {} exceeds limit of {} bytes",
                len, self.max_frame_size
            )));
        }

        let end = LENGTH_PREFIX_SIZE + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let body = self.buf[LENGTH_PREFIX_SIZE..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(body))
    }

    /// Read once from `reader` into the buffer.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        match reader.read(&mut chunk) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(Fill::Data)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Fill::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Error to report once the peer has closed: graceful on a frame
    /// boundary, abrupt inside a frame.
    pub fn eof_error(&self) -> FleetError {
        if self.buf.is_empty() {
            FleetError::ConnectionClosed
        } else {
            FleetError::Transport(format!(
                "peer closed with {} bytes of an unfinished frame",
                self.buf.len()
            ))
        }
    }

    /// Number of buffered bytes not yet returned as a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Block until a whole frame is read. `Ok(None)` on a clean close.
pub fn read_frame_blocking<R: Read>(decoder: &mut FrameDecoder, reader: &mut R) -> Result<Option<Vec<u8>>> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(Some(frame));
        }
        match decoder.fill_from(reader)? {
            Fill::Data | Fill::Idle => continue,
            Fill::Eof => {
                return match decoder.eof_error() {
                    FleetError::ConnectionClosed => Ok(None),
                    err => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out one byte per call, then reports a timeout once.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        stalled: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == 2 && !self.stalled {
                self.stalled = true;
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_frames_decode_in_order() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first", DEFAULT_MAX_FRAME_SIZE).unwrap();
        write_frame(&mut wire, b"second", DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame_blocking(&mut decoder, &mut cursor).unwrap().unwrap(), b"first");
        assert_eq!(read_frame_blocking(&mut decoder, &mut cursor).unwrap().unwrap(), b"second");
        assert!(read_frame_blocking(&mut decoder, &mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_survives_timeout() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"abc", DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut reader = Trickle { data: wire, pos: 0, stalled: false };

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(decoder.fill_from(&mut reader).unwrap(), Fill::Data);
        assert_eq!(decoder.fill_from(&mut reader).unwrap(), Fill::Data);
        assert_eq!(decoder.fill_from(&mut reader).unwrap(), Fill::Idle);
        assert_eq!(decoder.pending(), 2);

        let frame = read_frame_blocking(&mut decoder, &mut reader).unwrap();
        assert_eq!(frame.unwrap(), b"abc");
    }

    #[test]
    fn test_eof_inside_frame_is_transport_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"truncated", DEFAULT_MAX_FRAME_SIZE).unwrap();
        wire.truncate(7);

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
        let err = read_frame_blocking(&mut decoder, &mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, FleetError::Transport(_)));
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let mut sink = Vec::new();
        assert!(write_frame(&mut sink, &[0u8; 16], 8).is_err());
        assert!(sink.is_empty());

        let mut decoder = FrameDecoder::new(8);
        let mut cursor = Cursor::new(1024u32.to_be_bytes().to_vec());
        decoder.fill_from(&mut cursor).unwrap();
        assert!(matches!(decoder.next_frame(), Err(FleetError::Transport(_))));
    }
}
