//! WebSocket transport (§4.6): bidirectional read loop on top of
//! `axum::extract::ws`. The read loop shape — a dedicated reader task
//! feeding a command channel into a `tokio::select!` main loop alongside a
//! heartbeat tick and the dispatch channel — follows
//! `services/server/src/ws_forwarder.rs`.

use super::{Connection, SessionCore, Transport, TransportKind};
use crate::digest::Digest;
use crate::error::SessionError;
use crate::handler::Handler;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use proto::{CloseCode, WsMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl Transport for WsTransport {
    async fn write_message(&self, msg: &WsMessage, _sequence: u64) -> Result<(), SessionError> {
        let json = serde_json::to_string(msg).map_err(|e| SessionError::Protocol(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::TransportWrite(e.to_string()))
    }

    async fn close(&self, code: CloseCode) {
        let frame = CloseFrame { code: code.as_u16(), reason: code.message().into() };
        let _ = self.sink.lock().await.send(Message::Close(Some(frame))).await;
    }
}

enum ReaderEvent {
    Inbound(WsMessage),
    InvalidPayload,
    UnknownOperation,
    /// Peer close eligible for resume attachment: any code in
    /// `CloseCode::is_resumable`'s set, or the socket ending without a
    /// close frame at all.
    ResumableClose,
    /// Peer close with an unrecognized or non-resumable code, or a
    /// transport-level read error — torn down immediately, no resume
    /// buffer.
    UnexpectedClose,
}

fn is_resumable_code(code: u16) -> bool {
    CloseCode::from_u16(code).is_some_and(CloseCode::is_resumable)
}

/// Reads frames until the peer closes, the stream ends, or the channel to
/// the main loop is gone. Sends every classified event so the main loop can
/// keep pulling commands across the session's whole lifetime, not just its
/// first one.
async fn run_reader(
    mut stream: impl Stream<Item = Result<Message, axum::Error>> + Unpin,
    reader_tx: mpsc::Sender<ReaderEvent>,
) {
    loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(msg) if WsMessage::is_client_sendable(msg.op_name()) => ReaderEvent::Inbound(msg),
                Ok(_) => ReaderEvent::UnknownOperation,
                Err(_) => ReaderEvent::InvalidPayload,
            },
            Some(Ok(Message::Close(Some(frame)))) if is_resumable_code(frame.code) => ReaderEvent::ResumableClose,
            Some(Ok(Message::Close(_))) => ReaderEvent::UnexpectedClose,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => ReaderEvent::ResumableClose,
        };
        let keep_reading = matches!(event, ReaderEvent::Inbound(_));
        if reader_tx.send(event).await.is_err() || !keep_reading {
            return;
        }
    }
}

async fn handle_inbound(
    conn: &Connection<WsTransport>,
    handler: &mut Handler,
    msg: WsMessage,
    effect_cancel: &CancellationToken,
) {
    let result = match msg {
        WsMessage::Subscribe(p) => handler.subscribe(conn, p).await,
        WsMessage::Unsubscribe(p) => handler.unsubscribe(conn, p).await,
        WsMessage::Resume(p) => handler.on_resume(conn, p, effect_cancel).await,
        WsMessage::Bridge(v) => {
            handler.on_bridge(conn.session_id(), v).await;
            Ok(())
        }
        WsMessage::Heartbeat(_) | WsMessage::Identify(_) | WsMessage::Signal(_) => Ok(()),
        _ => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!(error = ?err, session_id = conn.session_id(), "failed handling inbound command");
    }
}

/// Drives one WebSocket session end to end: greet, register with the
/// digest, then select over the reader channel, heartbeat tick, inbound
/// dispatch channel, and server shutdown, until the session closes.
pub async fn run(
    socket: WebSocket,
    heartbeat_interval_ms: u64,
    subscription_limit: u32,
    actor_identity: Option<String>,
    instance_info: Option<serde_json::Value>,
    mut handler: Handler,
    digest: Arc<Digest>,
    server_cancel: CancellationToken,
) {
    let core = SessionCore::new(
        TransportKind::WebSocket,
        heartbeat_interval_ms,
        subscription_limit,
        actor_identity,
        &server_cancel,
    );
    let (sink, stream) = socket.split();
    let conn = Connection::new(core, WsTransport { sink: Mutex::new(sink) });

    if let Err(err) = conn.greet(instance_info).await {
        tracing::warn!(error = ?err, "greet failed, dropping connection before it became ready");
        return;
    }

    let session_id = conn.session_id().to_owned();
    let mut dispatch_rx = digest.register(session_id.clone(), crate::digest::DEFAULT_CHANNEL_CAPACITY).await;
    let effect_cancel = conn.core.cancel.clone();

    let (reader_tx, mut reader_rx) = mpsc::channel::<ReaderEvent>(1);
    let reader_cancel = conn.core.cancel.clone();
    let reader = tokio::spawn(async move {
        tokio::select! {
            biased;
            () = reader_cancel.cancelled() => {}
            () = run_reader(stream, reader_tx) => {}
        }
    });

    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms.max(1)));
    heartbeat.tick().await; // first tick fires immediately; consume it

    let mut resume_handoff = false;

    loop {
        tokio::select! {
            biased;
            () = server_cancel.cancelled() => {
                conn.send_close(CloseCode::Restart, Duration::from_secs(5)).await;
                break;
            }
            _ = heartbeat.tick() => {
                if conn.send_heartbeat().await.is_err() {
                    break;
                }
            }
            event = reader_rx.recv() => {
                match event {
                    Some(ReaderEvent::Inbound(msg)) => handle_inbound(&conn, &mut handler, msg, &effect_cancel).await,
                    Some(ReaderEvent::InvalidPayload) => {
                        let _ = conn.send_error("invalid payload", Default::default()).await;
                        conn.send_close(CloseCode::InvalidPayload, Duration::from_secs(5)).await;
                        break;
                    }
                    Some(ReaderEvent::UnknownOperation) => {
                        conn.send_close(CloseCode::UnknownOperation, Duration::from_secs(5)).await;
                        break;
                    }
                    Some(ReaderEvent::ResumableClose) => {
                        match handler.attach_resume_buffer(&session_id).await {
                            Ok(()) => resume_handoff = true,
                            Err(err) => tracing::warn!(error = ?err, "failed to attach resume buffer on close"),
                        }
                        conn.core.set_closed().await;
                        break;
                    }
                    Some(ReaderEvent::UnexpectedClose) | None => {
                        conn.core.set_closed().await;
                        break;
                    }
                }
            }
            dispatch = dispatch_rx.recv() => {
                let Some(msg) = dispatch else { continue };
                if let Err(err) = handler.on_dispatch(&conn, (*msg).clone(), &effect_cancel).await {
                    tracing::warn!(error = ?err, "on_dispatch failed, terminating session");
                    break;
                }
            }
        }
    }

    reader.abort();
    conn.core.set_closed().await;

    if resume_handoff {
        let resume_ttl = handler.resume_ttl();
        spawn_resume_drain(handler, dispatch_rx, digest, session_id, resume_ttl);
    } else {
        digest.unregister(&session_id).await;
    }
}

/// Keeps a just-attached resume buffer fed after the socket is gone: stays
/// registered with `digest` under the session's id for the resume TTL,
/// pushing every dispatch it receives, then unregisters.
fn spawn_resume_drain(
    mut handler: Handler,
    mut dispatch_rx: mpsc::Receiver<Arc<proto::DispatchPayload>>,
    digest: Arc<Digest>,
    session_id: String,
    resume_ttl: Duration,
) {
    tokio::spawn(async move {
        let drain_cancel = CancellationToken::new();
        let deadline = tokio::time::sleep(resume_ttl);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                () = &mut deadline => break,
                dispatch = dispatch_rx.recv() => {
                    match dispatch {
                        Some(msg) => {
                            if let Err(err) =
                                handler.buffer_for_resume(&session_id, (*msg).clone(), &drain_cancel).await
                            {
                                tracing::warn!(error = ?err, "resume buffer push failed, ending drain early");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        digest.unregister(&session_id).await;
    });
}
