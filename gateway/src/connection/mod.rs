//! Transport-agnostic session core (§4.5): the state machine, heartbeat and
//! sequence bookkeeping, and the once-primitives behind the ready/close
//! signals. Each transport (`ws`, `sse`) wraps a `SessionCore` and supplies
//! its own write path through the `Transport` trait.

pub mod sse;
pub mod ws;

use crate::error::SessionError;
use proto::{CloseCode, WsMessage};
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    EventStream,
}

/// One-way state machine (§4.5): `Opening -> Ready -> Draining -> Closed`,
/// with `Opening -> Closed` on a failed greet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Ready,
    Draining,
    Closed,
}

/// Per-transport write path. Implementors must serialize concurrent writes
/// themselves (e.g. behind an internal mutex) — `Connection::write` does
/// not add its own lock on top.
pub trait Transport: Send + Sync {
    /// `sequence` is the outbound frame's assigned id, already reserved by
    /// `Connection::write` — transports that frame an explicit `id:` field
    /// (SSE) use it directly instead of keeping a second counter.
    fn write_message(
        &self,
        msg: &WsMessage,
        sequence: u64,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;

    /// Sends the protocol-specific close frame/status. Called at most once
    /// per session; `Connection::send_close` guarantees that.
    fn close(&self, code: CloseCode) -> impl std::future::Future<Output = ()> + Send;
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SessionCore {
    session_id: String,
    pub transport_kind: TransportKind,
    pub heartbeat_interval_ms: u64,
    pub subscription_limit: u32,
    pub actor_identity: Option<String>,
    pub created_at: SystemTime,
    sequence: AtomicU64,
    heartbeat_count: AtomicU64,
    state: RwLock<SessionState>,
    ready_once: OnceCell<()>,
    ready_signal: CancellationToken,
    close_once: OnceCell<()>,
    close_signal: CancellationToken,
    /// Derived from the server's root; cancelling it releases every
    /// blocking operation owned by this session (§5).
    pub cancel: CancellationToken,
}

impl SessionCore {
    #[must_use]
    pub fn new(
        transport_kind: TransportKind,
        heartbeat_interval_ms: u64,
        subscription_limit: u32,
        actor_identity: Option<String>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            session_id: random_session_id(),
            transport_kind,
            heartbeat_interval_ms,
            subscription_limit,
            actor_identity,
            created_at: SystemTime::now(),
            sequence: AtomicU64::new(0),
            heartbeat_count: AtomicU64::new(0),
            state: RwLock::new(SessionState::Opening),
            ready_once: OnceCell::new(),
            ready_signal: CancellationToken::new(),
            close_once: OnceCell::new(),
            close_signal: CancellationToken::new(),
            cancel: parent_cancel.child_token(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Outbound sequence ids are monotonic and gapless (§5 ordering
    /// guarantee); callers must serialize writes so assignment and send
    /// happen as one step.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_heartbeat_count(&self) -> u64 {
        self.heartbeat_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Fires the ready signal exactly once, transitioning `Opening -> Ready`.
    pub async fn set_ready(&self) {
        self.ready_once
            .get_or_init(|| async {
                *self.state.write().await = SessionState::Ready;
                self.ready_signal.cancel();
            })
            .await;
    }

    pub async fn on_ready(&self) {
        self.ready_signal.cancelled().await;
    }

    pub async fn begin_draining(&self) {
        let mut state = self.state.write().await;
        if *state == SessionState::Ready {
            *state = SessionState::Draining;
        }
    }

    /// Fires the close signal exactly once, transitioning to `Closed` from
    /// any prior state.
    pub async fn set_closed(&self) {
        self.close_once
            .get_or_init(|| async {
                *self.state.write().await = SessionState::Closed;
                self.close_signal.cancel();
                self.cancel.cancel();
            })
            .await;
    }

    pub async fn on_close(&self) {
        self.close_signal.cancelled().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_signal.is_cancelled()
    }
}

/// Binds a `SessionCore` to a concrete `Transport`, exposing the §4.5
/// interface contract (`Greet`, `SendHeartbeat`, `SendAck`, ...).
pub struct Connection<T: Transport> {
    pub core: SessionCore,
    transport: T,
}

impl<T: Transport> Connection<T> {
    pub fn new(core: SessionCore, transport: T) -> Self {
        Self { core, transport }
    }

    pub fn session_id(&self) -> &str {
        self.core.session_id()
    }

    /// Escape hatch for transports that need to reach their own inherent
    /// methods (e.g. SSE's keepalive probe) outside the `Transport` trait.
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn greet(&self, instance_info: Option<serde_json::Value>) -> Result<(), SessionError> {
        let hello = WsMessage::Hello(proto::HelloPayload {
            heartbeat_interval: self.core.heartbeat_interval_ms,
            session_id: self.core.session_id().to_owned(),
            subscription_limit: self.core.subscription_limit,
            instance_info,
        });
        self.write(&hello).await?;
        self.core.set_ready().await;
        Ok(())
    }

    pub async fn send_heartbeat(&self) -> Result<(), SessionError> {
        let count = self.core.next_heartbeat_count();
        self.write(&WsMessage::Heartbeat(proto::HeartbeatPayload { count })).await
    }

    pub async fn send_ack(&self, command: &str, data: serde_json::Value) -> Result<(), SessionError> {
        self.write(&WsMessage::Ack(proto::AckPayload { command: command.to_owned(), data })).await
    }

    pub async fn send_error(
        &self,
        message: &str,
        fields: std::collections::HashMap<String, String>,
    ) -> Result<(), SessionError> {
        self.write(&WsMessage::Error(proto::ErrorPayload { message: message.to_owned(), fields }))
            .await
    }

    pub async fn write(&self, msg: &WsMessage) -> Result<(), SessionError> {
        if self.core.is_closed() {
            return Err(SessionError::PeerClosed);
        }
        let sequence = self.core.next_sequence();
        self.transport.write_message(msg, sequence).await
    }

    /// Sends end-of-stream plus the transport's close frame, then waits up
    /// to `drain` before returning. Idempotent: a second call observes
    /// `set_closed` already fired and does nothing further.
    pub async fn send_close(&self, code: CloseCode, drain: std::time::Duration) {
        if self.core.is_closed() {
            return;
        }
        let _ = self
            .write(&WsMessage::EndOfStream(proto::EndOfStreamPayload {
                code,
                message: code.message().to_owned(),
            }))
            .await;
        self.transport.close(code).await;
        self.core.set_closed().await;
        if !drain.is_zero() {
            tokio::time::sleep(drain).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTransport {
        written: Arc<Mutex<Vec<WsMessage>>>,
        closed_with: Arc<Mutex<Option<CloseCode>>>,
    }

    impl Transport for RecordingTransport {
        async fn write_message(&self, msg: &WsMessage, _sequence: u64) -> Result<(), SessionError> {
            self.written.lock().unwrap().push(msg.clone());
            Ok(())
        }

        async fn close(&self, code: CloseCode) {
            *self.closed_with.lock().unwrap() = Some(code);
        }
    }

    fn make_connection() -> Connection<RecordingTransport> {
        let cancel = CancellationToken::new();
        let core = SessionCore::new(TransportKind::WebSocket, 45_000, 500, None, &cancel);
        Connection::new(core, RecordingTransport::default())
    }

    #[tokio::test]
    async fn greet_transitions_to_ready_and_fires_once() {
        let conn = make_connection();
        assert_eq!(conn.core.state().await, SessionState::Opening);
        conn.greet(None).await.unwrap();
        assert_eq!(conn.core.state().await, SessionState::Ready);
        conn.core.on_ready().await; // resolves immediately, already fired
    }

    #[tokio::test]
    async fn send_close_is_idempotent_and_sends_one_close_frame() {
        let conn = make_connection();
        conn.greet(None).await.unwrap();
        conn.send_close(CloseCode::NormalClosure, std::time::Duration::ZERO).await;
        conn.send_close(CloseCode::NormalClosure, std::time::Duration::ZERO).await;

        let closes = conn.transport.written.lock().unwrap().iter().filter(|m| matches!(m, WsMessage::EndOfStream(_))).count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let conn = make_connection();
        conn.greet(None).await.unwrap();
        conn.send_close(CloseCode::NormalClosure, std::time::Duration::ZERO).await;
        let err = conn.write(&WsMessage::Heartbeat(proto::HeartbeatPayload { count: 1 })).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sequence_numbers_are_strictly_increasing() {
        let conn = make_connection();
        conn.greet(None).await.unwrap();
        conn.send_heartbeat().await.unwrap();
        conn.send_heartbeat().await.unwrap();
        // greet (seq 0) + two heartbeats (seq 1, 2) = next call starts at 3
        assert_eq!(conn.core.next_sequence(), 3);
    }
}
