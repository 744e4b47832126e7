//! A [`Log`] kept in the memory of a single node.
//!
//! Every topic sits behind its own lock, so appends to different topics
//! proceed in parallel while appends to the same topic are serialized. The
//! table of topics is only locked exclusively while a topic is created.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_lock::Mutex;
use async_lock::RwLock;
use async_trait::async_trait;
use tracing::debug;

use crate::message::LogEntry;
use crate::message::Offsets;

use super::Log;
use super::Polled;

#[derive(Debug)]
struct Topic {
    entries: Vec<LogEntry>,
    committed: u64,
    next_offset: u64,
}

impl Default for Topic {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            committed: 0,
            next_offset: 1,
        }
    }
}

impl Topic {
    fn append(&mut self, msg: i64) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.push(LogEntry(offset, msg));

        offset
    }

    fn suffix(&self, from: u64) -> Vec<LogEntry> {
        // entries are sorted by offset
        let start = self.entries.partition_point(|e| e.offset() < from);

        self.entries[start..].to_vec()
    }
}

/// The node-local log.
#[derive(Debug, Default)]
pub struct LocalLog {
    topics: RwLock<HashMap<String, Arc<Mutex<Topic>>>>,
}

impl LocalLog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn existing(&self, topic: &str) -> Option<Arc<Mutex<Topic>>> {
        self.topics.read().await.get(topic).map(Arc::clone)
    }

    async fn get_or_create(&self, topic: &str) -> Arc<Mutex<Topic>> {
        if let Some(existing) = self.existing(topic).await {
            return existing;
        }

        let mut topics = self.topics.write().await;

        Arc::clone(topics.entry(topic.to_owned()).or_insert_with(|| {
            debug!("Creating topic `{}`.", topic);
            Arc::default()
        }))
    }
}

#[async_trait]
impl Log for LocalLog {
    type Error = Infallible;

    async fn send(&self, topic: &str, msg: i64) -> Result<u64, Self::Error> {
        let entry = self.get_or_create(topic).await;
        let offset = entry.lock().await.append(msg);

        Ok(offset)
    }

    async fn poll(&self, offsets: &Offsets) -> Result<Polled, Self::Error> {
        let mut polled = Polled::new();

        for (topic, from) in offsets {
            let entries = match self.existing(topic).await {
                Some(entry) => entry.lock().await.suffix(*from),
                None => Vec::new(),
            };

            polled.insert(topic.clone(), entries);
        }

        Ok(polled)
    }

    async fn commit_offsets(&self, offsets: &Offsets) -> Result<(), Self::Error> {
        for (topic, offset) in offsets {
            let entry = self.get_or_create(topic).await;
            let mut entry = entry.lock().await;

            entry.committed = entry.committed.max(*offset);
        }

        Ok(())
    }

    async fn list_committed_offsets(&self, topics: &[String]) -> Result<Offsets, Self::Error> {
        let mut committed = Offsets::new();

        for topic in topics {
            if let Some(entry) = self.existing(topic).await {
                let offset = entry.lock().await.committed;

                if offset > 0 {
                    committed.insert(topic.clone(), offset);
                }
            }
        }

        Ok(committed)
    }
}
