//! The deployed runtime: one JSON message per line on stdin and stdout.
//!
//! [`Stdio`] is the [`Communicator`] through which engines reach their peers
//! and the key-value services. [`serve`] reads inbound messages, routes
//! replies to the requests awaiting them and hands everything else to a
//! [`Handler`], one task per message.
//!
//! Logging must go to stderr, stdout belongs to the protocol. Both ends may
//! be replaced, see [`Stdio::with_output`] and [`serve_from`].
use std::collections::HashMap;
use std::io::BufRead;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::oneshot;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::communicator::Communicator;
use crate::error::ErrorCode;
use crate::error::IoError;
use crate::error::RpcError;
use crate::executor::Executor;
use crate::handler::answer;
use crate::handler::Handler;
use crate::message::Body;
use crate::message::Message;
use crate::message::Payload;
use crate::message::RawMessage;
use crate::util::deadline;
use crate::NodeId;

#[derive(Debug)]
struct Membership {
    node_id: NodeId,
    node_ids: Vec<NodeId>,
}

struct Output(Mutex<Box<dyn Write + Send>>);

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Inner {
    membership: OnceLock<Membership>,
    next_msg_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Payload>>>,
    output: Output,
    shut_down: AtomicBool,
}

/// Communicator speaking over stdin and stdout.
#[derive(Clone, Debug)]
pub struct Stdio {
    inner: Arc<Inner>,
}

impl Stdio {
    pub fn new() -> Self {
        Self::with_output(std::io::stdout())
    }

    /// Creates a communicator that writes its messages to `output`.
    pub fn with_output<W: Write + Send + 'static>(output: W) -> Self {
        Self {
            inner: Arc::new(Inner {
                membership: OnceLock::new(),
                next_msg_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                output: Output(Mutex::new(Box::new(output))),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn next_msg_id(&self) -> u64 {
        self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn src(&self) -> Result<NodeId, RpcError> {
        self.node_id().ok_or(RpcError::Uninitialized)
    }

    fn emit(&self, message: &Message) -> Result<(), IoError> {
        let line = serde_json::to_string(message)
            .map_err(|err| IoError::new("failed to encode message", err.into()))?;

        let mut output = self.inner.output.0.lock_blocking();
        writeln!(output, "{}", line)
            .and_then(|()| output.flush())
            .map_err(|err| IoError::new("failed to write message", err))
    }

    fn reply(&self, request: &Message, payload: Payload) -> Result<(), IoError> {
        let reply = request.reply(Some(self.next_msg_id()), payload);
        trace!("Replying to {} with `{}`.", reply.dest, reply.body.payload.kind());

        self.emit(&reply)
    }

    fn reject(&self, line: &str, err: serde_json::Error) -> Result<(), IoError> {
        let raw: RawMessage = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::warn!("Dropping unparsable input: {}", err);
                return Ok(());
            }
        };

        // replies and fire-and-forget messages can't be answered
        if raw.body.in_reply_to.is_some() || raw.body.msg_id.is_none() {
            debug!("Dropping malformed message from {}: {}", raw.src, err);
            return Ok(());
        }

        let kind = raw.body.kind.unwrap_or_default();
        debug!("Rejecting malformed `{}` from {}: {}", kind, raw.src, err);

        self.emit(&Message {
            src: raw.dest,
            dest: raw.src,
            body: Body {
                msg_id: Some(self.next_msg_id()),
                in_reply_to: raw.body.msg_id,
                payload: Payload::error(ErrorCode::MalformedRequest, err.to_string()),
            },
        })
    }

    fn complete(&self, in_reply_to: u64, payload: Payload) {
        let waiting = self.inner.pending.lock_blocking().remove(&in_reply_to);

        match waiting {
            Some(send) => {
                // the requester may have timed out in the meantime
                let _ = send.send(payload);
            }
            None => trace!("Dropping late reply to {}.", in_reply_to),
        }
    }

    fn initialize(&self, node_id: NodeId, node_ids: Vec<NodeId>) -> bool {
        let membership = Membership { node_id, node_ids };

        match self.inner.membership.set(membership) {
            Ok(()) => true,
            Err(rejected) => {
                tracing::warn!("Ignoring re-initialization as {}.", rejected.node_id);
                false
            }
        }
    }

    /// Fails all outstanding and future requests with [`RpcError::ShutDown`].
    pub fn shut_down(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.pending.lock_blocking().clear();
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl Default for Stdio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Communicator for Stdio {
    fn node_id(&self) -> Option<NodeId> {
        self.inner.membership.get().map(|m| m.node_id.clone())
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.inner
            .membership
            .get()
            .map(|m| m.node_ids.clone())
            .unwrap_or_default()
    }

    fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::ShutDown);
        }

        let message = Message {
            src: self.src()?,
            dest: dest.clone(),
            body: Body {
                msg_id: Some(self.next_msg_id()),
                in_reply_to: None,
                payload,
            },
        };

        Ok(self.emit(&message)?)
    }

    async fn rpc(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, RpcError> {
        if self.is_shut_down() {
            return Err(RpcError::ShutDown);
        }

        let src = self.src()?;
        let msg_id = self.next_msg_id();
        let (send, recv) = oneshot::channel();

        self.inner.pending.lock().await.insert(msg_id, send);

        let message = Message {
            src,
            dest: dest.clone(),
            body: Body {
                msg_id: Some(msg_id),
                in_reply_to: None,
                payload,
            },
        };

        if let Err(err) = self.emit(&message) {
            self.inner.pending.lock().await.remove(&msg_id);
            return Err(err.into());
        }

        match deadline(recv, timeout).await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(oneshot::Canceled)) => Err(RpcError::ShutDown),
            None => {
                self.inner.pending.lock().await.remove(&msg_id);
                Err(RpcError::Timeout)
            }
        }
    }
}

/// Installs a subscriber that logs to stderr, filtered by `GLOMERS_LOG`.
pub fn install_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("GLOMERS_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if installed.is_err() {
        debug!("A subscriber was already installed.");
    }
}

/// Serves `handler` until stdin is closed.
pub fn serve<H, E>(stdio: &Stdio, handler: H, executor: E) -> Result<(), IoError>
where
    H: Handler,
    E: Executor,
{
    serve_from(stdio, std::io::stdin().lock(), handler, executor)
}

/// Serves `handler` with the messages read from `input`, one per line, until
/// `input` is exhausted. `stdio` is shut down afterwards.
///
/// `init` is answered here, after `handler` has been initialized. Replies are
/// routed to the [`Communicator::rpc`] calls awaiting them. Every other
/// message is handled in a task of its own, spawned on `executor`, and
/// answered unless it lacks a `msg_id`. Lines that don't parse are answered
/// with a malformed-request error when possible.
pub fn serve_from<R, H, E>(stdio: &Stdio, input: R, handler: H, executor: E) -> Result<(), IoError>
where
    R: BufRead,
    H: Handler,
    E: Executor,
{
    let handler = Arc::new(handler);

    for line in input.lines() {
        let line = line.map_err(|err| IoError::new("failed to read message", err))?;

        if line.trim().is_empty() {
            continue;
        }

        let message: Message = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                stdio.reject(&line, err)?;
                continue;
            }
        };

        dispatch(stdio, &handler, &executor, message)?;
    }

    info!("Input closed, shutting down.");
    stdio.shut_down();

    Ok(())
}

fn dispatch<H, E>(
    stdio: &Stdio,
    handler: &Arc<H>,
    executor: &E,
    message: Message,
) -> Result<(), IoError>
where
    H: Handler,
    E: Executor,
{
    if let Some(in_reply_to) = message.body.in_reply_to {
        stdio.complete(in_reply_to, message.body.payload);
        return Ok(());
    }

    if let Payload::Init { node_id, node_ids } = &message.body.payload {
        if stdio.initialize(node_id.clone(), node_ids.clone()) {
            info!("Initialized as {} of {} node(s).", node_id, node_ids.len());

            futures::executor::block_on(handler.init(node_id, node_ids));
        }

        return stdio.reply(&message, Payload::InitOk);
    }

    let request = message.body.payload.clone();
    let task = {
        let stdio = stdio.clone();
        let handler = Arc::clone(handler);

        async move {
            let reply = answer(&*handler, message.src.clone(), request).await;

            if message.body.msg_id.is_none() {
                return;
            }

            if let Err(err) = stdio.reply(&message, reply) {
                tracing::error!("Failed to reply: {}", err);
            }
        }
    };

    if let Err(err) = executor.execute(task) {
        tracing::warn!("Failed to spawn handler task: {}", err);
    }

    Ok(())
}
