//! Turns the substrate's lossy request/reply exchange into reliable delivery.
//!
//! [`until_acked`] re-issues a request until it is acknowledged, consulting a
//! [`RetryPolicy`] after each failed attempt. [`Outbox`] runs such loops in
//! the background so that the request which caused a delivery can be
//! answered without waiting for it.
//!
//! Deliveries may reach their destination more than once. Receivers must
//! apply them idempotently.
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

use crate::communicator::Communicator;
use crate::error::ErrorCode;
use crate::error::RpcError;
use crate::error::SpawnError;
use crate::executor::Executor;
use crate::message::Payload;
use crate::NodeId;

/// Policy that determines whether a failed delivery attempt is repeated.
#[async_trait]
pub trait RetryPolicy: Send + 'static {
    /// Determines whether another attempt should be made.
    ///
    /// The given `error` is the reason the latest attempt failed. Returning
    /// `Ok(())` implies that another attempt should be made.
    async fn eval(&mut self, error: &RpcError) -> Result<(), AbortedError>;
}

#[async_trait]
impl RetryPolicy for Box<dyn RetryPolicy + Send> {
    async fn eval(&mut self, error: &RpcError) -> Result<(), AbortedError> {
        let p = &mut **self;
        p.eval(error).await
    }
}

/// Delivery was given up on.
#[derive(Debug, Error)]
#[error("delivery was aborted after {attempts} attempt(s)")]
pub struct AbortedError {
    pub attempts: usize,
}

/// Implementation of [`RetryPolicy`] that retries forever, pausing for a
/// random duration of up to `max_pause` between attempts.
///
/// Gives up only once the communicator is shut down.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryIndefinitely {
    max_pause_ms: u64,
    attempts: usize,
}

impl RetryIndefinitely {
    pub fn pausing_up_to(max_pause: Duration) -> Self {
        Self {
            max_pause_ms: max_pause.as_millis() as u64,
            attempts: 0,
        }
    }
}

#[async_trait]
impl RetryPolicy for RetryIndefinitely {
    async fn eval(&mut self, error: &RpcError) -> Result<(), AbortedError> {
        self.attempts += 1;

        if let RpcError::ShutDown = error {
            return Err(AbortedError {
                attempts: self.attempts,
            });
        }

        if self.max_pause_ms > 0 {
            use rand::Rng;

            let delay = rand::thread_rng().gen_range(0..=self.max_pause_ms);
            let delay = Duration::from_millis(delay);

            futures_timer::Delay::new(delay).await;
        }

        Ok(())
    }
}

/// Sends `payload` to `dest` until it is acknowledged or `policy` gives up.
///
/// Each attempt waits at most `timeout`. Any reply counts as an
/// acknowledgement, including an `error` reply, unless it reports the
/// destination as temporarily unavailable.
pub async fn until_acked<C, P>(
    communicator: &C,
    dest: &NodeId,
    payload: &Payload,
    timeout: Duration,
    mut policy: P,
) -> Result<Payload, AbortedError>
where
    C: Communicator,
    P: RetryPolicy,
{
    loop {
        let err = match communicator.rpc(dest, payload.clone(), timeout).await {
            Ok(Payload::Error {
                code: ErrorCode::TemporarilyUnavailable,
                text,
            }) => RpcError::Unavailable(text),
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };

        trace!("Delivering `{}` to {} failed: {}", payload.kind(), dest, err);

        policy.eval(&err).await?;
    }
}

/// Deliveries towards a single destination.
#[derive(Debug, Default)]
struct Lane {
    queue: VecDeque<Payload>,
    workers: usize,
}

impl Lane {
    /// Queues `payload`. Gossip is merged into gossip queued last.
    fn enqueue(&mut self, payload: Payload) {
        if let Payload::Gossip { messages: more } = &payload {
            if let Some(Payload::Gossip { messages }) = self.queue.back_mut() {
                messages.extend(more.iter().copied());
                messages.sort_unstable();
                messages.dedup();

                return;
            }
        }

        self.queue.push_back(payload);
    }
}

/// Background delivery of messages that must not be lost.
///
/// Every [`post`][Outbox::post]ed message is retried until acknowledged or
/// until the outbox is [shut down][Outbox::shut_down]. At most
/// `max_in_flight` deliveries towards a single destination run at a time,
/// each in a task of its own. Further messages wait in a queue, where gossip
/// batches are merged, so that a destination that stays unreachable costs
/// neither tasks nor more than one queued batch of gossip.
#[derive(Debug)]
pub struct Outbox<C, E> {
    communicator: C,
    executor: E,
    timeout: Duration,
    max_in_flight: usize,
    max_pause: Duration,
    lanes: Arc<Mutex<HashMap<NodeId, Lane>>>,
    shut_down: Arc<AtomicBool>,
}

impl<C: Clone, E: Clone> Clone for Outbox<C, E> {
    fn clone(&self) -> Self {
        Self {
            communicator: self.communicator.clone(),
            executor: self.executor.clone(),
            timeout: self.timeout,
            max_in_flight: self.max_in_flight,
            max_pause: self.max_pause,
            lanes: Arc::clone(&self.lanes),
            shut_down: Arc::clone(&self.shut_down),
        }
    }
}

impl<C: Communicator, E: Executor> Outbox<C, E> {
    pub fn new(communicator: C, executor: E, timeout: Duration, max_in_flight: usize) -> Self {
        assert!(max_in_flight > 0);

        Self {
            communicator,
            executor,
            timeout,
            max_in_flight,
            max_pause: Duration::ZERO,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pause between failed attempts, chosen at random up to `max_pause`.
    pub fn with_retry_pause(self, max_pause: Duration) -> Self {
        Self { max_pause, ..self }
    }

    /// Delivers `payload` to `dest` in the background.
    ///
    /// Does nothing once the outbox is shut down.
    pub async fn post(&self, dest: NodeId, payload: Payload) -> Result<(), SpawnError> {
        if self.is_shut_down() {
            trace!("Outbox is shut down, dropping `{}` for {}.", payload.kind(), dest);
            return Ok(());
        }

        let start_worker = {
            let mut lanes = self.lanes.lock().await;
            let lane = lanes.entry(dest.clone()).or_default();

            lane.enqueue(payload);

            if lane.workers < self.max_in_flight {
                lane.workers += 1;
                true
            } else {
                false
            }
        };

        if start_worker {
            if let Err(err) = self.executor.execute(self.clone().drain(dest.clone())) {
                if let Some(lane) = self.lanes.lock().await.get_mut(&dest) {
                    lane.workers -= 1;
                }

                return Err(err);
            }
        }

        Ok(())
    }

    /// Number of messages for `dest` that wait for a delivery slot.
    pub async fn backlog(&self, dest: &NodeId) -> usize {
        self.lanes
            .lock()
            .await
            .get(dest)
            .map(|lane| lane.queue.len())
            .unwrap_or(0)
    }

    /// Stops all retry loops before their next attempt.
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    async fn drain(self, dest: NodeId) {
        while let Some(payload) = self.next_for(&dest).await {
            let policy = Stoppable {
                inner: RetryIndefinitely::pausing_up_to(self.max_pause),
                shut_down: Arc::clone(&self.shut_down),
            };

            match until_acked(&self.communicator, &dest, &payload, self.timeout, policy).await {
                Ok(_) => trace!("Delivered `{}` to {}.", payload.kind(), dest),
                Err(err) => {
                    tracing::debug!("Abandoned `{}` for {}: {}", payload.kind(), dest, err)
                }
            }
        }
    }

    /// Takes the next message for `dest`, retiring the calling worker if
    /// there is none.
    async fn next_for(&self, dest: &NodeId) -> Option<Payload> {
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.get_mut(dest)?;

        let next = if self.is_shut_down() {
            None
        } else {
            lane.queue.pop_front()
        };

        if next.is_none() {
            lane.workers -= 1;
        }

        next
    }
}

struct Stoppable<P> {
    inner: P,
    shut_down: Arc<AtomicBool>,
}

#[async_trait]
impl<P: RetryPolicy> RetryPolicy for Stoppable<P> {
    async fn eval(&mut self, error: &RpcError) -> Result<(), AbortedError> {
        if self.shut_down.load(Ordering::Acquire) {
            return self.inner.eval(&RpcError::ShutDown).await;
        }

        self.inner.eval(error).await
    }
}
