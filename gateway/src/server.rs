//! Server / Admission (§4.9): upgrade acceptance, the concurrency gate, and
//! the axum router. `build_router` mirrors `services/server/src/lib.rs`'s
//! `build_router(state, ...) -> Router` shape: one router wired to one
//! shared state value.

use crate::config::Config;
use crate::connection::{sse, ws};
use crate::digest::Digest;
use crate::handler::Handler;
use crate::metrics::Metrics;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("server is draining")]
    Locked,
    #[error("connection limit reached")]
    Full,
}

/// Process-wide admission gate (§9 redesign note: a value object, not
/// ambient globals). Shared by `Arc` across every accepted connection.
pub struct Admission {
    active_conns: AtomicU32,
    connection_limit: u32,
    locked: AtomicBool,
    drained: Notify,
}

/// RAII handle returned by a successful [`Admission::try_admit`]. Dropping
/// it — on task exit, panic or not — decrements the active count. Holds an
/// owning `Arc` rather than a borrow so it can be moved into a spawned
/// session task and live for that task's whole lifetime.
pub struct AdmissionGuard {
    admission: Arc<Admission>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.admission.active_conns.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.admission.drained.notify_waiters();
        }
    }
}

impl Admission {
    #[must_use]
    pub fn new(connection_limit: u32) -> Self {
        Self {
            active_conns: AtomicU32::new(0),
            connection_limit,
            locked: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionGuard, AdmissionError> {
        if self.locked.load(Ordering::Acquire) {
            return Err(AdmissionError::Locked);
        }
        if self.active_conns.fetch_add(1, Ordering::AcqRel) >= self.connection_limit {
            self.active_conns.fetch_sub(1, Ordering::AcqRel);
            return Err(AdmissionError::Full);
        }
        Ok(AdmissionGuard { admission: Arc::clone(self) })
    }

    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.active_conns.load(Ordering::Acquire)
    }

    /// Sets the drain gate; new connections are rejected from this point.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    /// Waits for the active count to hit zero, or `timeout`, whichever
    /// comes first (§4.9: "wait for active count to hit 0 or a 30s
    /// timeout").
    pub async fn wait_drained(&self, timeout: Duration) {
        if self.active_count() == 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.drained.notified()).await;
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub digest: Arc<Digest>,
    pub redis_client: redis::Client,
    pub admission: Arc<Admission>,
    pub metrics: Arc<dyn Metrics>,
    pub server_cancel: CancellationToken,
}

fn is_websocket_upgrade(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn admit_or_reject(state: &GatewayState) -> Result<AdmissionGuard, Response> {
    match state.admission.try_admit() {
        Ok(guard) => Ok(guard),
        Err(AdmissionError::Locked) => Err((StatusCode::LOCKED, "server draining").into_response()),
        Err(AdmissionError::Full) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response())
        }
    }
}

fn new_handler(state: &GatewayState) -> Handler {
    Handler::new(state.redis_client.clone(), state.config.bridge_url.clone(), state.config.resume_ttl)
}

/// `GET /v3`: upgrades to WebSocket when the request carries the
/// `Upgrade: websocket` header, otherwise serves SSE. The admission guard
/// acquired here is moved into whichever session task actually runs, so it
/// stays held for that session's whole lifetime, not just this handler.
async fn handle_v3(State(state): State<GatewayState>, req: Request) -> Response {
    let guard = match admit_or_reject(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };

    if is_websocket_upgrade(&req) {
        let Ok(ws_upgrade) = WebSocketUpgrade::from_request(req, &state).await else {
            return (StatusCode::BAD_REQUEST, "invalid websocket upgrade").into_response();
        };
        return ws_upgrade.on_upgrade(move |socket| async move {
            let _guard = guard;
            ws::run(
                socket,
                state.config.heartbeat_interval_ms,
                state.config.subscription_limit,
                None,
                None,
                new_handler(&state),
                Arc::clone(&state.digest),
                state.server_cancel.clone(),
            )
            .await;
        });
    }

    run_sse(&state, None, guard)
}

/// `GET /v3@{subspec}`: SSE with the inline subscription mini-language.
/// axum's router can't split a literal `@` out of a path segment, so this
/// is reached through the fallback rather than a declared route.
async fn v3_fallback(State(state): State<GatewayState>, req: Request) -> Response {
    let path = req.uri().path();
    let Some(subspec) = path.strip_prefix("/v3@") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let subspec = subspec.to_owned();

    let guard = match admit_or_reject(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };

    run_sse(&state, Some(subspec), guard)
}

fn run_sse(state: &GatewayState, subspec: Option<String>, guard: AdmissionGuard) -> Response {
    sse::start(
        subspec,
        state.config.heartbeat_interval_ms,
        state.config.subscription_limit,
        None,
        new_handler(state),
        Arc::clone(&state.digest),
        state.server_cancel.clone(),
        guard,
    )
}

#[derive(serde::Deserialize)]
struct MutationBody {
    #[serde(default)]
    condition: std::collections::HashMap<String, String>,
}

/// `PUT`/`DELETE /v3/sessions/{sid}/events/{evt}`: out-of-band subscription
/// mutation. The core only forwards it over
/// `events:session_mutation` — applying it is a different session's
/// problem (its own mutation-channel subscriber), per §6.
async fn mutate_session_subscription(
    State(state): State<GatewayState>,
    Path((session_id, event_type)): Path<(String, String)>,
    method: axum::http::Method,
    body: Option<axum::Json<MutationBody>>,
) -> Response {
    let action = if method == axum::http::Method::PUT { "subscribe" } else { "unsubscribe" };
    let condition = body.map(|b| b.0.condition).unwrap_or_default();
    let payload = serde_json::json!({
        "action": action,
        "session_id": session_id,
        "type": event_type,
        "condition": condition,
    });

    let Ok(mut conn) = state.redis_client.get_multiplexed_tokio_connection().await else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let publish_result: redis::RedisResult<i64> =
        redis::AsyncCommands::publish(&mut conn, "events:session_mutation", payload.to_string()).await;
    match publish_result {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to publish session mutation");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn health(State(state): State<GatewayState>) -> Response {
    axum::Json(serde_json::json!({
        "status": "ok",
        "active_connections": state.admission.active_count(),
    }))
    .into_response()
}

#[must_use]
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v3", get(handle_v3))
        .route(
            "/v3/sessions/{sid}/events/{evt}",
            axum::routing::put(mutate_session_subscription).delete(mutate_session_subscription),
        )
        .route("/health", get(health))
        .fallback(v3_fallback)
        .with_state(state)
}

/// Initiates graceful drain (§4.9): locks admission, then waits for active
/// sessions to hit zero or the timeout. The caller is responsible for
/// stopping the HTTP listener afterward and for wiring in whatever
/// triggers this (signal, sentinel file) — both are bootstrap concerns.
pub async fn drain(state: &GatewayState, timeout: Duration) {
    state.admission.lock();
    state.server_cancel.cancel();
    state.admission.wait_drained(timeout).await;
}

/// Background task: republishes the active-connection gauge every 10s
/// (§4.9), through the injected `Metrics` trait rather than a concrete
/// exporter.
pub async fn report_active_connections(state: GatewayState, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = tick.tick() => {
                state.metrics.active_connections(state.admission.active_count());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_rejects_beyond_connection_limit() {
        let admission = Arc::new(Admission::new(2));
        let g1 = admission.try_admit().unwrap();
        let g2 = admission.try_admit().unwrap();
        assert!(admission.try_admit().is_err());
        drop(g1);
        assert_eq!(admission.active_count(), 1);
        drop(g2);
        assert_eq!(admission.active_count(), 0);
    }

    #[test]
    fn admission_rejects_everything_once_locked() {
        let admission = Arc::new(Admission::new(10));
        admission.lock();
        assert!(matches!(admission.try_admit(), Err(AdmissionError::Locked)));
    }

    #[tokio::test]
    async fn wait_drained_returns_immediately_with_no_active_connections() {
        let admission = Admission::new(10);
        admission.wait_drained(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn wait_drained_unblocks_when_last_guard_drops() {
        let admission = Arc::new(Admission::new(10));
        let guard = admission.try_admit().unwrap();
        let admission_clone = Arc::clone(&admission);
        let waiter = tokio::spawn(async move {
            admission_clone.wait_drained(Duration::from_secs(5)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        waiter.await.unwrap();
    }
}
