//! Optimistic read-modify-write on a single key.
//!
//! The key-value services offer compare-and-swap as their only atomic
//! primitive. [`optimistic_update`] turns that into an arbitrary update: read
//! the current value, compute the next one, swap, and start over whenever
//! another writer got there first.
//!
//! A swap that times out may or may not have taken effect. Retrying it is
//! harmless for idempotent updates, e.g. raising a value to a maximum, but
//! would apply other updates twice. [`OnTimeout`] selects between the two.
use tracing::trace;

use crate::error::KvError;
use crate::kv::Kv;

/// Result of a completed [`optimistic_update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Updated {
    /// The key was moved from `from` to `to`. `from` is `None` if the key
    /// did not exist before.
    Swapped { from: Option<i64>, to: i64 },

    /// The update function declined to change the current value.
    Kept(Option<i64>),

    /// The service reported the key missing while swapping, i.e. a
    /// concurrent initializer raced ahead.
    Raced,
}

/// How a swap whose outcome is unknown is dealt with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnTimeout {
    /// Start over. Only correct for idempotent updates.
    Retry,

    /// Give up with [`KvError::Timeout`], leaving the outcome indefinite.
    Fail,
}

/// Applies the idempotent `update` to the value stored under `key`.
///
/// `update` receives the current value (`None` if absent) and returns the
/// value to store, or `None` to leave the key untouched. It may be called any
/// number of times, once per attempt.
///
/// Precondition failures and transient errors are retried without bound.
/// Other errors are returned.
pub async fn optimistic_update<K, F>(kv: &K, key: &str, update: F) -> Result<Updated, KvError>
where
    K: Kv + ?Sized,
    F: FnMut(Option<i64>) -> Option<i64> + Send,
{
    update_with(kv, key, OnTimeout::Retry, update).await
}

/// Like [`optimistic_update`], but swaps that time out are handled according
/// to `on_timeout`.
///
/// Reads that time out are always retried, they have no effect.
pub async fn update_with<K, F>(
    kv: &K,
    key: &str,
    on_timeout: OnTimeout,
    mut update: F,
) -> Result<Updated, KvError>
where
    K: Kv + ?Sized,
    F: FnMut(Option<i64>) -> Option<i64> + Send,
{
    loop {
        let current = match kv.read(key).await {
            Ok(value) => Some(value),
            Err(KvError::NotFound) => None,
            Err(err) if err.is_transient() => {
                trace!("Reading `{}` failed transiently: {}", key, err);
                continue;
            }
            Err(err) => return Err(err),
        };

        let next = match update(current) {
            Some(next) => next,
            None => return Ok(Updated::Kept(current)),
        };

        match kv
            .compare_and_swap(key, current.unwrap_or(0), next, true)
            .await
        {
            Ok(()) => {
                return Ok(Updated::Swapped {
                    from: current,
                    to: next,
                })
            }
            Err(KvError::PreconditionFailed) => {
                trace!("Lost race for `{}` at {:?}, retrying.", key, current);
            }
            Err(KvError::NotFound) => return Ok(Updated::Raced),
            Err(KvError::Timeout) if on_timeout == OnTimeout::Fail => {
                tracing::debug!("Swapping `{}` timed out, outcome unknown.", key);
                return Err(KvError::Timeout);
            }
            Err(err) if err.is_transient() => {
                trace!("Swapping `{}` failed transiently: {}", key, err);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Reads `key`, treating absence as zero. Transient failures are retried.
pub async fn read_or_zero<K: Kv + ?Sized>(kv: &K, key: &str) -> Result<i64, KvError> {
    loop {
        match kv.read(key).await {
            Ok(value) => return Ok(value),
            Err(KvError::NotFound) => return Ok(0),
            Err(err) if err.is_transient() => {
                trace!("Reading `{}` failed transiently: {}", key, err);
            }
            Err(err) => return Err(err),
        }
    }
}
