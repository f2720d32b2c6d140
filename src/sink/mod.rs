//! Sinks: destinations for ingested messages
//!
//! Every sink implements the [`Sink`] capability. The closed set of built-in
//! variants lives in [`BuiltinSink`], which also wraps the
//! [`SinkAggregator`] itself so composites nest, and user-defined sinks via
//! [`BuiltinSink::Custom`].
//!
//! Sinks do no locking of their own; the aggregator serializes calls into
//! each child.

pub mod aggregator;
pub mod csv;
pub mod memory;
pub mod plot;
pub mod screen;
pub mod sql;

pub use aggregator::{SinkAggregator, SinkId};
pub use csv::CsvSink;
pub use memory::MemorySink;
pub use plot::PlotSink;
pub use screen::ScreenSink;
pub use sql::SqlSink;

use crate::error::Result;
use crate::message::Message;

/// Destination for messages.
pub trait Sink: Send {
    /// Short name for logs
    fn name(&self) -> &str {
        "sink"
    }

    /// Record one message
    fn append(&mut self, message: &Message) -> Result<()>;

    /// Push buffered output to its destination
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Snapshot of retained messages, for sinks that keep history.
    /// Each call is a fresh copy, not a live view.
    fn history(&self) -> Option<Vec<Message>> {
        None
    }
}

/// Built-in sink variants
pub enum BuiltinSink {
    Csv(CsvSink),
    Sql(SqlSink),
    Plot(PlotSink),
    Screen(ScreenSink),
    Memory(MemorySink),
    Composite(SinkAggregator),
    Custom(Box<dyn Sink>),
}

impl BuiltinSink {
    /// The nested aggregator, if this is a composite
    pub(crate) fn as_composite(&self) -> Option<&SinkAggregator> {
        match self {
            BuiltinSink::Composite(agg) => Some(agg),
            _ => None,
        }
    }
}

impl Sink for BuiltinSink {
    fn name(&self) -> &str {
        match self {
            BuiltinSink::Csv(s) => s.name(),
            BuiltinSink::Sql(s) => s.name(),
            BuiltinSink::Plot(s) => s.name(),
            BuiltinSink::Screen(s) => s.name(),
            BuiltinSink::Memory(s) => s.name(),
            BuiltinSink::Composite(s) => s.name(),
            BuiltinSink::Custom(s) => s.name(),
        }
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        match self {
            BuiltinSink::Csv(s) => s.append(message),
            BuiltinSink::Sql(s) => s.append(message),
            BuiltinSink::Plot(s) => s.append(message),
            BuiltinSink::Screen(s) => s.append(message),
            BuiltinSink::Memory(s) => s.append(message),
            BuiltinSink::Composite(s) => s.append(message),
            BuiltinSink::Custom(s) => s.append(message),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            BuiltinSink::Csv(s) => s.flush(),
            BuiltinSink::Sql(s) => s.flush(),
            BuiltinSink::Plot(s) => s.flush(),
            BuiltinSink::Screen(s) => s.flush(),
            BuiltinSink::Memory(s) => s.flush(),
            BuiltinSink::Composite(s) => Sink::flush(s),
            BuiltinSink::Custom(s) => s.flush(),
        }
    }

    fn history(&self) -> Option<Vec<Message>> {
        match self {
            BuiltinSink::Memory(s) => s.history(),
            BuiltinSink::Composite(s) => s.history(),
            BuiltinSink::Custom(s) => s.history(),
            _ => None,
        }
    }
}

impl From<CsvSink> for BuiltinSink {
    fn from(s: CsvSink) -> Self {
        BuiltinSink::Csv(s)
    }
}

impl From<SqlSink> for BuiltinSink {
    fn from(s: SqlSink) -> Self {
        BuiltinSink::Sql(s)
    }
}

impl From<PlotSink> for BuiltinSink {
    fn from(s: PlotSink) -> Self {
        BuiltinSink::Plot(s)
    }
}

impl From<ScreenSink> for BuiltinSink {
    fn from(s: ScreenSink) -> Self {
        BuiltinSink::Screen(s)
    }
}

impl From<MemorySink> for BuiltinSink {
    fn from(s: MemorySink) -> Self {
        BuiltinSink::Memory(s)
    }
}

impl From<SinkAggregator> for BuiltinSink {
    fn from(s: SinkAggregator) -> Self {
        BuiltinSink::Composite(s)
    }
}

impl From<Box<dyn Sink>> for BuiltinSink {
    fn from(s: Box<dyn Sink>) -> Self {
        BuiltinSink::Custom(s)
    }
}
