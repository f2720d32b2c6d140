//! Screen sink: one tab-separated line per message

use super::Sink;
use crate::error::{Result, ResultExt};
use crate::message::Message;
use std::io::{self, Write};

pub struct ScreenSink {
    out: Box<dyn Write + Send>,
}

impl ScreenSink {
    /// Write to stdout
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

impl Default for ScreenSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl Sink for ScreenSink {
    fn name(&self) -> &str {
        "screen"
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        writeln!(self.out, "{}", message).context("write to screen")
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("flush screen")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tab_separated_lines() {
        let buf = Shared::default();
        let mut sink = ScreenSink::new(Box::new(buf.clone()));
        sink.append(&Message::reading(0, "Load", 2.5, "T1")).unwrap();
        sink.append(&Message::end_of_stream(0, "Load", "T2")).unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "0\tLoad\t2.5\tT1\n0\tLoad\t<end>\tT2\n");
    }
}
