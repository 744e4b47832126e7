//! A [`Log`] kept in the cluster's key-value services.
//!
//! Each offset is claimed individually in the linearizable service: the first
//! send to store its token under `claim_<topic>_<offset>` owns the offset.
//! Claims are created with compare-and-swap against the claimant's own token,
//! so repeating a claim whose reply got lost succeeds instead of moving on to
//! the next offset. `offset_<topic>` merely records the highest offset claimed
//! so far and tells senders where to start. Commit indices live in the
//! linearizable service as well, payloads in the sequentially consistent one
//! under `<topic>_<offset>`.
//!
//! Claiming an offset and storing its payload are two separate steps. A node
//! that crashes in between leaves a ghost: an offset that was handed out but
//! will never be readable. Polls stop at the first missing offset, so a ghost
//! hides all later entries from polls that start at or before it.
use async_trait::async_trait;
use tracing::debug;
use tracing::trace;

use crate::cas::optimistic_update;
use crate::cas::read_or_zero;
use crate::cas::Updated;
use crate::error::KvError;
use crate::kv::Kv;
use crate::message::LogEntry;
use crate::message::Offsets;

use super::Log;
use super::Polled;

const DEFAULT_POLL_WINDOW: u64 = 10;

/// The key-value backed log.
#[derive(Debug)]
pub struct KvLog<L, S> {
    linearizable: L,
    sequential: S,
    poll_window: u64,
}

impl<L: Kv, S: Kv> KvLog<L, S> {
    /// Creates a log that keeps offsets in `linearizable` and payloads in
    /// `sequential`.
    pub fn new(linearizable: L, sequential: S) -> Self {
        Self {
            linearizable,
            sequential,
            poll_window: DEFAULT_POLL_WINDOW,
        }
    }

    /// Maximal number of entries returned per topic and poll.
    pub fn with_poll_window(self, poll_window: u64) -> Self {
        assert!(poll_window > 0);

        Self {
            poll_window,
            ..self
        }
    }

    async fn allocate_offset(&self, topic: &str) -> Result<u64, KvError> {
        let token = claim_token();
        let highest = read_or_zero(&self.linearizable, &offset_key(topic)).await?;
        let mut offset = to_offset(&offset_key(topic), highest)?.saturating_add(1);

        while !self.claim(topic, offset, token).await? {
            trace!("Offset {} of `{}` is taken, trying the next.", offset, topic);

            offset = offset.saturating_add(1);
        }

        self.raise_highest(topic, offset).await?;

        Ok(offset)
    }

    /// Tries to claim `offset` for the send identified by `token`.
    ///
    /// Returns `false` if another send owns it.
    async fn claim(&self, topic: &str, offset: u64, token: i64) -> Result<bool, KvError> {
        let key = claim_key(topic, offset);

        loop {
            match self
                .linearizable
                .compare_and_swap(&key, token, token, true)
                .await
            {
                Ok(()) => return Ok(true),
                Err(KvError::PreconditionFailed) => return Ok(false),
                Err(err) if err.is_transient() => {
                    trace!("Claiming `{}` failed transiently: {}", key, err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn raise_highest(&self, topic: &str, offset: u64) -> Result<(), KvError> {
        let key = offset_key(topic);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        loop {
            let updated = optimistic_update(&self.linearizable, &key, |current| match current {
                Some(current) if current >= offset => None,
                _ => Some(offset),
            })
            .await?;

            if updated != Updated::Raced {
                return Ok(());
            }
        }
    }

    async fn store_entry(&self, topic: &str, offset: u64, msg: i64) -> Result<(), KvError> {
        let key = entry_key(topic, offset);

        loop {
            match self.sequential.write(&key, msg).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    trace!("Storing `{}` failed transiently: {}", key, err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<L: Kv, S: Kv> Log for KvLog<L, S> {
    type Error = KvError;

    async fn send(&self, topic: &str, msg: i64) -> Result<u64, Self::Error> {
        let offset = self.allocate_offset(topic).await?;
        self.store_entry(topic, offset, msg).await?;

        debug!("Appended {} to `{}` at {}.", msg, topic, offset);

        Ok(offset)
    }

    async fn poll(&self, offsets: &Offsets) -> Result<Polled, Self::Error> {
        let mut polled = Polled::new();

        for (topic, from) in offsets {
            let from = (*from).max(1);
            let mut entries = Vec::new();

            for offset in from..from.saturating_add(self.poll_window) {
                match self.sequential.read(&entry_key(topic, offset)).await {
                    Ok(msg) => entries.push(LogEntry(offset, msg)),
                    Err(KvError::NotFound) => break,
                    Err(err) => return Err(err),
                }
            }

            polled.insert(topic.clone(), entries);
        }

        Ok(polled)
    }

    async fn commit_offsets(&self, offsets: &Offsets) -> Result<(), Self::Error> {
        for (topic, offset) in offsets {
            // nothing is committed below the first offset
            if *offset == 0 {
                continue;
            }

            let key = commit_key(topic);
            let offset = i64::try_from(*offset).unwrap_or(i64::MAX);

            loop {
                let updated = optimistic_update(&self.linearizable, &key, |current| {
                    match current {
                        Some(current) if current >= offset => None,
                        _ => Some(offset),
                    }
                })
                .await?;

                if updated != Updated::Raced {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn list_committed_offsets(&self, topics: &[String]) -> Result<Offsets, Self::Error> {
        let mut committed = Offsets::new();

        for topic in topics {
            let key = commit_key(topic);

            match self.linearizable.read(&key).await {
                Ok(offset) => {
                    committed.insert(topic.clone(), to_offset(&key, offset)?);
                }
                Err(KvError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(committed)
    }
}

/// Identifies a single send among all claimants of an offset.
fn claim_token() -> i64 {
    use rand::Rng;

    rand::thread_rng().gen()
}

fn offset_key(topic: &str) -> String {
    format!("offset_{topic}")
}

fn claim_key(topic: &str, offset: u64) -> String {
    format!("claim_{topic}_{offset}")
}

fn commit_key(topic: &str) -> String {
    format!("commit_{topic}")
}

fn entry_key(topic: &str, offset: u64) -> String {
    format!("{topic}_{offset}")
}

fn to_offset(key: &str, value: i64) -> Result<u64, KvError> {
    u64::try_from(value).map_err(|_| KvError::Corrupt {
        key: key.to_owned(),
        value,
    })
}
