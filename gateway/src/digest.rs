//! Shared ingress: one Redis subscriber per dispatch opcode, decoding once
//! and fanning out to every registered session (§4.4).
//!
//! Grounded in the pub/sub consumer shape used across the pack's Redis
//! reference examples (a background task owning the subscription, a
//! concurrent map of per-subscriber handles) and in
//! `services/receiver/src/session.rs`'s `tokio::select!` cancellation style.

use crate::metrics::Metrics;
use futures_util::StreamExt;
use proto::DispatchPayload;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Recommended bound for a session's inbound dispatch channel (§4.4).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A registered session's inbound slot. Cloning the `closed` flag into the
/// handle lets `unregister` mark it dead without needing the sender to be
/// dropped from every holder simultaneously — unregistration is then
/// idempotent without a dedicated once-primitive crate.
#[derive(Clone)]
struct SubscriberHandle {
    sender: mpsc::Sender<Arc<DispatchPayload>>,
    closed: Arc<AtomicBool>,
}

impl SubscriberHandle {
    /// Non-blocking send. Returns `false` on a full or closed channel —
    /// the digest must never block on a slow consumer.
    fn try_send(&self, msg: Arc<DispatchPayload>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.sender.try_send(msg).is_ok()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One instance per dispatch opcode; in practice, one (`Dispatch`).
pub struct Digest {
    subscribers: RwLock<HashMap<String, SubscriberHandle>>,
    metrics: Arc<dyn Metrics>,
}

impl Digest {
    #[must_use]
    pub fn new(metrics: Arc<dyn Metrics>) -> Arc<Self> {
        Arc::new(Self { subscribers: RwLock::new(HashMap::new()), metrics })
    }

    /// Registers `session_id` with a fresh bounded channel. Replaces any
    /// prior registration for the same id (register is idempotent per
    /// §4.4: re-registering simply supersedes the old handle, which is
    /// then marked closed so in-flight clones stop delivering to it).
    pub async fn register(
        &self,
        session_id: impl Into<String>,
        capacity: usize,
    ) -> mpsc::Receiver<Arc<DispatchPayload>> {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = SubscriberHandle { sender: tx, closed: Arc::new(AtomicBool::new(false)) };
        let mut subs = self.subscribers.write().await;
        if let Some(prev) = subs.insert(session_id.into(), handle) {
            prev.close();
        }
        rx
    }

    /// Removes and closes the subscriber for `session_id`. Idempotent: a
    /// second call on an already-removed id is a silent no-op.
    pub async fn unregister(&self, session_id: &str) {
        if let Some(handle) = self.subscribers.write().await.remove(session_id) {
            handle.close();
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Decodes one raw Redis message and fans it out. Public so tests (and
    /// the fake-Redis integration harness) can drive the digest without a
    /// live Redis connection.
    pub async fn handle_raw_message(&self, raw: &str) {
        let msg: DispatchPayload = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed dispatch message");
                self.metrics.digest_decode_error();
                return;
            }
        };
        self.fan_out(msg).await;
    }

    async fn fan_out(&self, msg: DispatchPayload) {
        let msg = Arc::new(msg);
        let subs = self.subscribers.read().await;
        for (session_id, handle) in subs.iter() {
            if !handle.try_send(Arc::clone(&msg)) {
                tracing::debug!(session_id, "channel_blocked");
                self.metrics.channel_blocked(session_id);
            }
        }
    }

    /// Runs the background consumer until `shutdown` fires. Reconnects are
    /// not attempted here: a dropped Redis connection ends the task, and
    /// the caller (the server supervisor) decides whether to restart it.
    pub async fn run(
        self: Arc<Self>,
        client: redis::Client,
        channel: String,
        shutdown: CancellationToken,
    ) -> redis::RedisResult<()> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        let mut stream = pubsub.into_on_message();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                next = stream.next() => {
                    let Some(msg) = next else { return Ok(()) };
                    let Ok(payload) = msg.get_payload::<String>() else {
                        self.metrics.digest_decode_error();
                        continue;
                    };
                    self.handle_raw_message(&payload).await;
                }
            }
        }
    }
}
