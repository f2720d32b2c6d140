//! Composite sink fanning every message out to a runtime-mutable set of children
//!
//! # Locking
//!
//! The child list sits behind an `RwLock`; each child behind its own
//! `Mutex`. `append` takes a snapshot of the list under the read lock,
//! releases it, then delivers to each child in order while holding only that
//! child's mutex. Consequences:
//!
//! - `add`/`remove` never wait for an in-flight delivery to finish
//! - a child present when `append` starts always receives the message
//! - a child added during an `append` may or may not see that message
//! - concurrent appends are serialized per child, so records never interleave

use super::{BuiltinSink, Sink};
use crate::error::{FleetError, Result};
use crate::message::Message;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type SharedSink = Arc<Mutex<BuiltinSink>>;

/// Handle to a child of an aggregator, returned by [`SinkAggregator::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

#[derive(Default)]
struct Children {
    next_id: u64,
    entries: Vec<(SinkId, SharedSink)>,
}

/// Thread-safe composite sink. Clones share the same child list.
#[derive(Clone, Default)]
pub struct SinkAggregator {
    children: Arc<RwLock<Children>>,
}

impl SinkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child. An aggregator that (transitively) contains this one is
    /// rejected.
    pub fn add(&self, sink: impl Into<BuiltinSink>) -> Result<SinkId> {
        let sink = sink.into();
        if let Some(nested) = sink.as_composite() {
            if nested.same_as(self) || nested.contains(self) {
                return Err(FleetError::Sink(
                    "adding this aggregator would create a cycle".into(),
                ));
            }
        }

        let mut children = self.write();
        let id = SinkId(children.next_id);
        children.next_id += 1;
        children.entries.push((id, Arc::new(Mutex::new(sink))));
        tracing::debug!("Added {} ({} children)", id, children.entries.len());
        Ok(id)
    }

    /// Remove a child. Returns false if `id` is not present.
    pub fn remove(&self, id: SinkId) -> bool {
        let mut children = self.write();
        let before = children.entries.len();
        children.entries.retain(|(child, _)| *child != id);
        let removed = children.entries.len() != before;
        if removed {
            tracing::debug!("Removed {}", id);
        }
        removed
    }

    /// Ids of the current children, in insertion order
    pub fn ids(&self) -> Vec<SinkId> {
        self.read().entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Deliver `message` to every current child.
    ///
    /// A failing child does not stop delivery to the others; the error
    /// reports how many children failed.
    pub fn append(&self, message: &Message) -> Result<()> {
        let mut failed = 0usize;
        for (id, child) in self.snapshot() {
            let mut sink = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = sink.append(message) {
                failed += 1;
                tracing::warn!(
                    "{} rejected message from sensor {} ({}): {}",
                    id,
                    message.id(),
                    message.name(),
                    e
                );
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(FleetError::Sink(format!(
                "{} child sink(s) failed to append",
                failed
            )))
        }
    }

    /// Flush every current child
    pub fn flush(&self) -> Result<()> {
        let mut failed = 0usize;
        for (id, child) in self.snapshot() {
            let mut sink = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = sink.flush() {
                failed += 1;
                tracing::warn!("{} failed to flush: {}", id, e);
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(FleetError::Sink(format!("{} child sink(s) failed to flush", failed)))
        }
    }

    /// Retained history of every child, concatenated in child order.
    ///
    /// Each call starts a fresh iteration over a copy; children without
    /// history contribute nothing.
    pub fn iterate(&self) -> std::vec::IntoIter<Message> {
        let mut all = Vec::new();
        for (_, child) in self.snapshot() {
            let sink = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(history) = sink.history() {
                all.extend(history);
            }
        }
        all.into_iter()
    }

    fn snapshot(&self) -> Vec<(SinkId, SharedSink)> {
        self.read().entries.clone()
    }

    fn same_as(&self, other: &SinkAggregator) -> bool {
        Arc::ptr_eq(&self.children, &other.children)
    }

    /// Identity shared by all clones; stable while any clone is alive
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.children) as usize
    }

    /// True if `target` is reachable through nested composites
    fn contains(&self, target: &SinkAggregator) -> bool {
        self.snapshot().iter().any(|(_, child)| {
            let sink = child.lock().unwrap_or_else(PoisonError::into_inner);
            match sink.as_composite() {
                Some(nested) => nested.same_as(target) || nested.contains(target),
                None => false,
            }
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Children> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Children> {
        self.children.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SinkAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkAggregator")
            .field("children", &self.ids())
            .finish()
    }
}

impl Sink for SinkAggregator {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        SinkAggregator::append(self, message)
    }

    fn flush(&mut self) -> Result<()> {
        SinkAggregator::flush(self)
    }

    fn history(&self) -> Option<Vec<Message>> {
        Some(self.iterate().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use mockall::mock;
    use mockall::predicate::*;
    use std::thread;

    mock! {
        pub Recorder {}

        impl Sink for Recorder {
            fn append(&mut self, message: &Message) -> Result<()>;
            fn flush(&mut self) -> Result<()>;
        }
    }

    fn reading(id: i64, name: &str, value: f64) -> Message {
        Message::reading(id, name, value, format!("T{value}"))
    }

    #[test]
    fn test_fan_out_completeness() {
        let agg = SinkAggregator::new();
        let sinks: Vec<MemorySink> = (0..3).map(|_| MemorySink::new()).collect();
        for sink in &sinks {
            agg.add(sink.clone()).unwrap();
        }

        let sent: Vec<Message> = (0..50).map(|i| reading(0, "Load", i as f64)).collect();
        for msg in &sent {
            agg.append(msg).unwrap();
        }

        for sink in &sinks {
            assert_eq!(sink.messages(), sent);
        }
    }

    #[test]
    fn test_each_child_sees_each_message_once() {
        let mut child = MockRecorder::new();
        child
            .expect_append()
            .with(function(|m: &Message| m.name() == "Load"))
            .times(3)
            .returning(|_| Ok(()));

        let agg = SinkAggregator::new();
        agg.add(BuiltinSink::Custom(Box::new(child))).unwrap();
        for i in 0..3 {
            agg.append(&reading(0, "Load", i as f64)).unwrap();
        }
    }

    #[test]
    fn test_failing_child_does_not_block_others() {
        let mut broken = MockRecorder::new();
        broken
            .expect_append()
            .times(2)
            .returning(|_| Err(FleetError::Sink("disk full".into())));

        let memory = MemorySink::new();
        let agg = SinkAggregator::new();
        agg.add(BuiltinSink::Custom(Box::new(broken))).unwrap();
        agg.add(memory.clone()).unwrap();

        for i in 0..2 {
            let err = agg.append(&reading(1, "Temp", i as f64)).unwrap_err();
            assert!(err.to_string().contains("1 child sink(s)"));
        }
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn test_flush_reaches_children() {
        let mut child = MockRecorder::new();
        child.expect_flush().times(1).returning(|| Ok(()));

        let agg = SinkAggregator::new();
        agg.add(BuiltinSink::Custom(Box::new(child))).unwrap();
        agg.flush().unwrap();
    }

    #[test]
    fn test_removed_sink_stops_receiving() {
        let agg = SinkAggregator::new();
        let kept = MemorySink::new();
        let dropped = MemorySink::new();
        agg.add(kept.clone()).unwrap();
        let id = agg.add(dropped.clone()).unwrap();

        agg.append(&reading(0, "Load", 1.0)).unwrap();
        assert!(agg.remove(id));
        assert!(!agg.remove(id));
        agg.append(&reading(0, "Load", 2.0)).unwrap();

        assert_eq!(kept.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_iterate_concatenates_children_in_order() {
        let agg = SinkAggregator::new();
        let first = MemorySink::new();
        let second = MemorySink::new();
        agg.add(first.clone()).unwrap();
        agg.add(second.clone()).unwrap();

        agg.append(&reading(0, "Load", 1.0)).unwrap();
        let mut extra = second.clone();
        extra.append(&reading(1, "Temp", 9.0)).unwrap();

        let names: Vec<String> = agg.iterate().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["Load", "Load", "Temp"]);
        // Restartable
        assert_eq!(agg.iterate().count(), 3);
    }

    #[test]
    fn test_nested_composite_and_cycle_rejection() {
        let outer = SinkAggregator::new();
        let inner = SinkAggregator::new();
        let memory = MemorySink::new();
        inner.add(memory.clone()).unwrap();
        outer.add(inner.clone()).unwrap();

        outer.append(&reading(0, "Load", 3.0)).unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(outer.iterate().count(), 1);

        assert!(inner.add(outer.clone()).is_err());
        assert!(outer.add(outer.clone()).is_err());
    }

    #[test]
    fn test_concurrent_appends_do_not_cross_talk() {
        let agg = SinkAggregator::new();
        let memory = MemorySink::new();
        agg.add(memory.clone()).unwrap();

        let handles: Vec<_> = ["Load", "Memory"]
            .into_iter()
            .enumerate()
            .map(|(sensor, name)| {
                let agg = agg.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        agg.append(&reading(sensor as i64, name, i as f64)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let all = memory.messages();
        assert_eq!(all.len(), 1000);
        for (sensor, name) in ["Load", "Memory"].into_iter().enumerate() {
            let values: Vec<f64> = all
                .iter()
                .filter(|m| m.id() == sensor as i64)
                .inspect(|m| assert_eq!(m.name(), name))
                .filter_map(Message::data)
                .collect();
            assert_eq!(values, (0..500).map(|i| i as f64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_add_during_appends() {
        let agg = SinkAggregator::new();
        let early = MemorySink::new();
        agg.add(early.clone()).unwrap();

        let writer = {
            let agg = agg.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    agg.append(&reading(0, "Load", i as f64)).unwrap();
                }
            })
        };
        let late = MemorySink::new();
        agg.add(late.clone()).unwrap();
        writer.join().unwrap();

        assert_eq!(early.len(), 200);
        // The late sink sees a suffix of the stream, each message once
        let late_values: Vec<f64> = late.messages().iter().filter_map(Message::data).collect();
        let start = 200 - late_values.len();
        assert_eq!(late_values, (start..200).map(|i| i as f64).collect::<Vec<_>>());
    }
}
