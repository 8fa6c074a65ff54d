//! EventStream (SSE) transport (§4.7): write-only, raw `event:`/`data:`/
//! `id:` framing rather than `axum::response::sse::Sse`, because the wire
//! format here is fixed by the spec rather than left to the library.
//!
//! True `MSG_PEEK` liveness probing has no equivalent through axum's
//! hyper-backed socket abstraction. Liveness is instead inferred from the
//! writer's send failures against the body channel, polled on the same
//! 1-second cadence the original probe used — a send only fails once the
//! receiving `Body` stream (and so the underlying connection) has been
//! torn down, which is the same signal a `MSG_PEEK` would have produced
//! for a fully-dead peer, though it won't catch a half-open silent one
//! quite as early.

use super::{Connection, SessionCore, Transport, TransportKind};
use crate::digest::Digest;
use crate::error::SessionError;
use crate::handler::Handler;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use proto::{Condition, WsMessage};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

const LIVENESS_PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub struct SseTransport {
    frames: mpsc::Sender<String>,
}

impl SseTransport {
    fn frame(op: &str, json: &str, sequence: u64) -> String {
        format!("event: {}\ndata: {}\nid: {}\n\n", op.to_lowercase(), json, sequence)
    }

    /// Sends a comment-only keepalive frame, which SSE clients ignore but
    /// which still exercises the write path for liveness detection.
    async fn probe(&self) -> bool {
        self.frames.send(": keepalive\n\n".to_owned()).await.is_ok()
    }
}

impl Transport for SseTransport {
    async fn write_message(&self, msg: &WsMessage, sequence: u64) -> Result<(), SessionError> {
        let json = serde_json::to_string(msg).map_err(|e| SessionError::Protocol(e.to_string()))?;
        self.frames
            .send(Self::frame(msg.op_name(), &json, sequence))
            .await
            .map_err(|_| SessionError::TransportWrite("sse body receiver dropped".to_owned()))
    }

    /// There is no protocol close frame on SSE; the body stream simply
    /// ends, which axum turns into the final chunk.
    async fn close(&self, _code: proto::CloseCode) {}
}

/// Parses the inline subscription mini-language (§4.7, §6):
/// `evt1.a<k=v;k2=v2>,evt2.b`. Unparseable conditions degrade to an empty
/// condition set rather than rejecting the whole connection.
#[must_use]
pub fn parse_subscriptions(subspec: &str) -> Vec<(String, Condition)> {
    subspec
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|sub| match sub.find('<') {
            Some(angle_start) => {
                let event_type = sub[..angle_start].to_owned();
                let cond_str = sub[angle_start + 1..].trim_end_matches('>');
                let mut condition = Condition::new();
                for pair in cond_str.split(';') {
                    let pair = pair.trim();
                    if let Some((k, v)) = pair.split_once('=') {
                        condition.insert(k.trim().to_owned(), v.trim().to_owned());
                    }
                }
                (event_type, condition)
            }
            None => (sub.to_owned(), Condition::new()),
        })
        .collect()
}

async fn session_loop(
    conn: Connection<SseTransport>,
    subscriptions: Vec<(String, Condition)>,
    mut handler: Handler,
    digest: Arc<Digest>,
    server_cancel: CancellationToken,
) {
    if let Err(err) = conn.greet(None).await {
        tracing::warn!(error = ?err, "sse greet failed");
        return;
    }

    for (event_type, condition) in subscriptions {
        if let Err(err) = handler.event_map.subscribe(&event_type, condition, false, None).await {
            tracing::warn!(error = ?err, event_type, "inline subscription rejected");
        }
    }

    let session_id = conn.session_id().to_owned();
    let mut dispatch_rx = digest.register(session_id.clone(), crate::digest::DEFAULT_CHANNEL_CAPACITY).await;
    let effect_cancel = conn.core.cancel.clone();

    let mut heartbeat = tokio::time::interval(Duration::from_millis(conn.core.heartbeat_interval_ms.max(1)));
    heartbeat.tick().await;
    let mut liveness = tokio::time::interval(LIVENESS_PROBE_INTERVAL);
    liveness.tick().await;

    loop {
        tokio::select! {
            biased;
            () = server_cancel.cancelled() => {
                conn.send_close(proto::CloseCode::Restart, Duration::from_secs(5)).await;
                break;
            }
            _ = liveness.tick() => {
                // accessed through Connection so closed-state and sequence
                // bookkeeping stay consistent with every other write.
                if !probe_alive(&conn).await {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if conn.send_heartbeat().await.is_err() {
                    break;
                }
            }
            dispatch = dispatch_rx.recv() => {
                let Some(msg) = dispatch else { continue };
                if let Err(err) = handler.on_dispatch(&conn, (*msg).clone(), &effect_cancel).await {
                    tracing::warn!(error = ?err, "on_dispatch failed, terminating sse session");
                    break;
                }
            }
        }
    }

    digest.unregister(&session_id).await;
    conn.core.set_closed().await;
}

async fn probe_alive(conn: &Connection<SseTransport>) -> bool {
    if conn.core.is_closed() {
        return false;
    }
    // A keepalive comment carries no sequence id, so it goes straight to
    // the transport rather than through `Connection::write`.
    conn.transport().probe().await
}

/// Builds the SSE response and spawns the session task that feeds it.
/// `subspec` is the raw string after `/v3@`, if the client connected
/// through the inline-subscription URL form.
pub fn start<G: Send + 'static>(
    subspec: Option<String>,
    heartbeat_interval_ms: u64,
    subscription_limit: u32,
    actor_identity: Option<String>,
    handler: Handler,
    digest: Arc<Digest>,
    server_cancel: CancellationToken,
    admission_guard: G,
) -> Response {
    let (frame_tx, frame_rx) = mpsc::channel::<String>(64);
    let core = SessionCore::new(
        TransportKind::EventStream,
        heartbeat_interval_ms,
        subscription_limit,
        actor_identity,
        &server_cancel,
    );
    let conn = Connection::new(core, SseTransport { frames: frame_tx });
    let subscriptions = subspec.map(|s| parse_subscriptions(&s)).unwrap_or_default();

    tokio::spawn(async move {
        let _guard = admission_guard;
        session_loop(conn, subscriptions, handler, digest, server_cancel).await;
    });

    let stream = ReceiverStream::new(frame_rx).map(|frame| Ok::<_, Infallible>(frame));
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_with_conditions_and_plain_event() {
        let subs = parse_subscriptions("evt1.a<k=v;k2=v2>,evt2.b");
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].0, "evt1.a");
        assert_eq!(subs[0].1.get("k"), Some(&"v".to_owned()));
        assert_eq!(subs[0].1.get("k2"), Some(&"v2".to_owned()));
        assert_eq!(subs[1].0, "evt2.b");
        assert!(subs[1].1.is_empty());
    }

    #[test]
    fn ignores_blank_segments() {
        let subs = parse_subscriptions("emote.create, ,emote.delete");
        assert_eq!(subs.len(), 2);
    }
}
