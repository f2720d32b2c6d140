//! Pipe transport.
//!
//! An anonymous OS pipe carrying length-prefixed frames. Reads from a pipe
//! cannot time out, so the consumer runs a small pump thread that performs
//! the blocking reads and forwards frames over a bounded channel; the
//! ingestion loop waits on that channel with a timeout.

use super::framing::{read_frame_blocking, write_frame, FrameDecoder};
use super::{ClientHandle, ServerHandle, Strategy, TransportSettings};
use crate::error::{FleetError, Result, ResultExt};
use crate::message::Message;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::{PipeReader, PipeWriter};
use std::thread;
use std::time::Duration;

/// Event forwarded by the pump thread
#[derive(Debug)]
enum PumpEvent {
    Frame(Vec<u8>),
    /// Writer closed on a frame boundary
    Closed,
    /// Truncated frame or read failure
    Failed(String),
}

/// Create a pipe and return its two ends.
pub fn create_pair(label: &str, settings: &TransportSettings) -> Result<(PipeServer, PipeClient)> {
    let (reader, writer) = std::io::pipe().context("create pipe")?;
    let server = PipeServer::spawn(label, reader, settings)?;
    let client = PipeClient::new(writer, settings);
    Ok((server, client))
}

fn pump(mut reader: PipeReader, max_frame_size: usize, events: Sender<PumpEvent>) {
    let mut decoder = FrameDecoder::new(max_frame_size);
    loop {
        let event = match read_frame_blocking(&mut decoder, &mut reader) {
            Ok(Some(frame)) => PumpEvent::Frame(frame),
            Ok(None) => PumpEvent::Closed,
            Err(e) => PumpEvent::Failed(e.to_string()),
        };
        let last = !matches!(event, PumpEvent::Frame(_));
        // A send error means the consumer is gone; stop reading
        if events.send(event).is_err() || last {
            return;
        }
    }
}

/// Consumer side of a pipe.
pub struct PipeServer {
    label: String,
    events: Option<Receiver<PumpEvent>>,
    finished: Option<FleetError>,
}

impl PipeServer {
    fn spawn(label: &str, reader: PipeReader, settings: &TransportSettings) -> Result<Self> {
        let (tx, rx) = bounded(settings.queue_depth.max(1));
        let max_frame_size = settings.max_frame_size;
        thread::Builder::new()
            .name(format!("pipe-pump-{}", label))
            .spawn(move || pump(reader, max_frame_size, tx))
            .context("spawn pipe pump thread")?;

        Ok(Self {
            label: label.to_string(),
            events: Some(rx),
            finished: None,
        })
    }

    fn end_error(reason: &FleetError) -> FleetError {
        match reason {
            FleetError::Transport(detail) => FleetError::Transport(detail.clone()),
            _ => FleetError::ConnectionClosed,
        }
    }
}

impl ServerHandle for PipeServer {
    fn strategy(&self) -> Strategy {
        Strategy::Pipe
    }

    fn label(&self) -> String {
        format!("pipe:{}", self.label)
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if let Some(reason) = &self.finished {
            return Err(Self::end_error(reason));
        }
        let Some(events) = self.events.as_ref() else {
            return Err(FleetError::ConnectionClosed);
        };

        let end = match events.recv_timeout(timeout) {
            Ok(PumpEvent::Frame(frame)) => return Message::deserialize(&frame).map(Some),
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Ok(PumpEvent::Closed) => FleetError::ConnectionClosed,
            Ok(PumpEvent::Failed(reason)) => FleetError::Transport(reason),
            Err(RecvTimeoutError::Disconnected) => FleetError::Transport("pipe pump exited".into()),
        };
        let err = Self::end_error(&end);
        self.finished = Some(end);
        Err(err)
    }

    fn close(&mut self) {
        // Dropping the receiver makes the pump exit on its next frame
        if self.events.take().is_some() {
            tracing::debug!("Closed pipe consumer {}", self.label);
        }
    }

    fn is_closed(&self) -> bool {
        self.events.is_none()
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer side of a pipe.
pub struct PipeClient {
    writer: Option<PipeWriter>,
    max_frame_size: usize,
}

impl PipeClient {
    fn new(writer: PipeWriter, settings: &TransportSettings) -> Self {
        Self {
            writer: Some(writer),
            max_frame_size: settings.max_frame_size,
        }
    }
}

impl ClientHandle for PipeClient {
    fn strategy(&self) -> Strategy {
        Strategy::Pipe
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(FleetError::ConnectionClosed);
        };
        let body = message.serialize()?;
        write_frame(writer, &body, self.max_frame_size)
    }

    fn close(&mut self) {
        // Dropping the write end delivers EOF to the reader
        self.writer.take();
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_delivers_then_reports_close() {
        let (mut server, mut client) = create_pair("Load", &TransportSettings::default()).unwrap();

        client.send(&Message::reading(0, "Load", 2.5, "T1")).unwrap();
        client.send(&Message::end_of_stream(0, "Load", "T2")).unwrap();
        client.close();

        assert_eq!(server.receive().unwrap().data(), Some(2.5));
        assert!(server.receive().unwrap().is_end_of_stream());
        assert!(matches!(server.receive(), Err(FleetError::ConnectionClosed)));
        // Stays closed on later calls
        assert!(matches!(
            server.receive_timeout(Duration::from_millis(1)),
            Err(FleetError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_idle_pipe_times_out() {
        let (mut server, _client) = create_pair("Idle", &TransportSettings::default()).unwrap();
        assert!(server.receive_timeout(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_send_after_reader_gone_is_transport_error() {
        let (mut server, mut client) = create_pair("Gone", &TransportSettings::default()).unwrap();
        server.close();
        drop(server);

        // The pump drops the read end once it fails to forward a frame
        client.send(&Message::reading(1, "Gone", 0.0, "T")).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let err = (0..100)
            .find_map(|i| client.send(&Message::reading(1, "Gone", i as f64, "T")).err())
            .expect("writes to an abandoned pipe must fail");
        assert!(matches!(err, FleetError::Transport(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut server, mut client) = create_pair("Twice", &TransportSettings::default()).unwrap();
        client.close();
        client.close();
        server.close();
        server.close();
        assert!(client.is_closed() && server.is_closed());
        assert!(matches!(
            client.send(&Message::reading(1, "x", 1.0, "T")),
            Err(FleetError::ConnectionClosed)
        ));
    }
}
