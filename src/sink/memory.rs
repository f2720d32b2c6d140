//! In-memory sink retaining every message

use super::Sink;
use crate::error::Result;
use crate::message::Message;
use std::sync::{Arc, Mutex, PoisonError};

/// Keeps every appended message. Clones share one history, so a test can
/// hold a clone while the original sits inside an aggregator.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the history in arrival order
    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    /// Messages recorded for one sensor name
    pub fn messages_for(&self, name: &str) -> Vec<Message> {
        self.lock().iter().filter(|m| m.name() == name).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        self.lock().push(message.clone());
        Ok(())
    }

    fn history(&self) -> Option<Vec<Message>> {
        Some(self.messages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_history() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.append(&Message::reading(0, "Load", 2.5, "T1")).unwrap();
        writer.append(&Message::reading(1, "Temp", 21.0, "T2")).unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.messages_for("Load"), vec![Message::reading(0, "Load", 2.5, "T1")]);
        assert_eq!(sink.history().unwrap().len(), 2);

        sink.clear();
        assert!(writer.is_empty());
    }
}
