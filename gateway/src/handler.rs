//! Command processor (§4.8): validates inbound commands, applies dispatch
//! effects, and owns the write-or-buffer decision for outbound dispatches.
//!
//! `Handler` holds a non-owning relationship to `Connection` — every method
//! takes the connection by reference rather than storing one, breaking the
//! cyclic reference the source couples them with (§9).

use crate::connection::{Connection, Transport};
use crate::dedup::DedupCache;
use crate::error::SessionError;
use crate::event_map::{matching_ids, EventMap, EventMapError};
use crate::resume::{PersistedSubscription, ResumeBuffer};
use proto::{
    AckPayload, Condition, DispatchPayload, OutboundDispatchPayload, ResumePayload, SubscribePayload,
    UnsubscribePayload, CloseCode, MAX_CONDITION_KEYS, MAX_CONDITION_KEY_LEN, MAX_CONDITION_VALUE_LEN,
    MAX_TYPE_LEN,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn validate_type(event_type: &str) -> Result<(), &'static str> {
    if event_type.is_empty() {
        return Err("type must not be empty");
    }
    if event_type.len() > MAX_TYPE_LEN {
        return Err("type exceeds max length");
    }
    if event_type.split('.').count() < 2 {
        return Err("type must have at least 2 dotted components");
    }
    Ok(())
}

fn validate_condition(condition: &Condition) -> Result<(), &'static str> {
    if condition.len() > MAX_CONDITION_KEYS {
        return Err("too many condition keys");
    }
    for (k, v) in condition {
        if k.len() > MAX_CONDITION_KEY_LEN {
            return Err("condition key exceeds max length");
        }
        if v.len() > MAX_CONDITION_VALUE_LEN {
            return Err("condition value exceeds max length");
        }
    }
    Ok(())
}

/// One per session, owned exclusively by that session's main-loop task —
/// the dedup cache it carries is mutated lock-free on that assumption.
pub struct Handler {
    pub event_map: Arc<EventMap>,
    dedup: DedupCache,
    resume: Option<ResumeBuffer>,
    redis_client: redis::Client,
    bridge_client: reqwest::Client,
    bridge_url: Option<String>,
    resume_ttl: Duration,
}

impl Handler {
    #[must_use]
    pub fn new(redis_client: redis::Client, bridge_url: Option<String>, resume_ttl: Duration) -> Self {
        Self {
            event_map: Arc::new(EventMap::new()),
            dedup: DedupCache::default(),
            resume: None,
            redis_client,
            bridge_client: reqwest::Client::new(),
            bridge_url,
            resume_ttl,
        }
    }

    pub fn has_active_resume_buffer(&self) -> bool {
        self.resume.is_some()
    }

    /// The TTL window a resume buffer attached by this handler stays live
    /// for, shared by the Redis-side buffer and the post-close drain task
    /// that keeps feeding it.
    #[must_use]
    pub fn resume_ttl(&self) -> Duration {
        self.resume_ttl
    }

    /// Attaches a fresh resume buffer ahead of teardown (§4.6): called when
    /// the peer closes with a resumable code.
    pub async fn attach_resume_buffer(
        &mut self,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let conn = self
            .redis_client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(crate::resume::ResumeError::from)?;
        let mut buffer = ResumeBuffer::new(conn, session_id.to_owned()).with_ttl(self.resume_ttl);
        let persisted: Vec<PersistedSubscription> = self.event_map.snapshot_persistable().await;
        buffer.start(&persisted).await?;
        self.resume = Some(buffer);
        Ok(())
    }

    /// Post-close counterpart to [`Handler::on_dispatch`]: applies the same
    /// whisper filter, dedup, and effect steps, then pushes straight to the
    /// resume buffer instead of writing to a (by now closed) transport.
    /// Used by the drain task that keeps a resumable session's buffer fed
    /// during the recovery window.
    pub async fn buffer_for_resume(
        &mut self,
        session_id: &str,
        msg: DispatchPayload,
        effect_cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let is_whisper = msg.whisper.as_deref().is_some_and(|target| target == session_id);
        if msg.whisper.is_some() && !is_whisper {
            return Ok(());
        }

        if let Some(hash) = msg.hash {
            if !self.dedup.add_dispatch(hash) {
                return Ok(());
            }
        }

        if let Some(effect) = &msg.effect {
            self.apply_effect(effect, effect_cancel).await;
        }

        if let Some(resume) = self.resume.as_mut() {
            let _ = resume.push(&msg).await;
        }
        Ok(())
    }

    pub async fn subscribe<T: Transport>(
        &self,
        conn: &Connection<T>,
        payload: SubscribePayload,
    ) -> Result<(), SessionError> {
        if let Err(reason) = validate_type(&payload.event_type).and_then(|()| validate_condition(&payload.condition)) {
            conn.send_error(reason, HashMap::new()).await?;
            conn.send_close(CloseCode::InvalidPayload, Duration::from_secs(5)).await;
            return Ok(());
        }

        if payload.condition.is_empty() && conn.core.actor_identity.is_none() {
            conn.send_error("anonymous subscriptions require a non-empty condition", HashMap::new())
                .await?;
            conn.send_close(CloseCode::InsufficientPrivilege, Duration::from_secs(5)).await;
            return Ok(());
        }

        if self.event_map.count().await >= conn.core.subscription_limit as i32 {
            conn.send_error("subscription limit reached", HashMap::new()).await?;
            conn.send_close(CloseCode::RateLimit, Duration::from_secs(5)).await;
            return Ok(());
        }

        match self.event_map.subscribe(&payload.event_type, payload.condition.clone(), false, None).await {
            Ok(id) => {
                conn.send_ack(
                    "Subscribe",
                    serde_json::json!({"id": id, "type": payload.event_type, "condition": payload.condition}),
                )
                .await
            }
            Err(EventMapError::AlreadySubscribed) => {
                conn.send_error("already subscribed", HashMap::new()).await?;
                conn.send_close(CloseCode::AlreadySubscribed, Duration::from_secs(5)).await;
                Ok(())
            }
            Err(EventMapError::NotSubscribed) => unreachable!("subscribe never returns NotSubscribed"),
        }
    }

    pub async fn unsubscribe<T: Transport>(
        &self,
        conn: &Connection<T>,
        payload: UnsubscribePayload,
    ) -> Result<(), SessionError> {
        match self.event_map.unsubscribe(&payload.event_type, &payload.condition).await {
            Ok(_id) => {
                conn.send_ack(
                    "Unsubscribe",
                    serde_json::json!({"type": payload.event_type, "condition": payload.condition}),
                )
                .await
            }
            Err(EventMapError::NotSubscribed) => {
                conn.send_error("not subscribed", HashMap::new()).await?;
                conn.send_close(CloseCode::NotSubscribed, Duration::from_secs(5)).await;
                Ok(())
            }
            Err(EventMapError::AlreadySubscribed) => unreachable!("unsubscribe never returns AlreadySubscribed"),
        }
    }

    /// Applies one inbound dispatch: filter, dedup, effect, then write or
    /// buffer (§4.8 `OnDispatch`).
    pub async fn on_dispatch<T: Transport>(
        &mut self,
        conn: &Connection<T>,
        msg: DispatchPayload,
        effect_cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let is_whisper = msg
            .whisper
            .as_deref()
            .is_some_and(|target| target == conn.session_id());
        if msg.whisper.is_some() && !is_whisper {
            return Ok(());
        }

        let matches = if is_whisper {
            Vec::new()
        } else {
            match self.event_map.get(&msg.event_type).await {
                Some(subs) => matching_ids(&subs, &msg.conditions),
                None => Vec::new(),
            }
        };

        if let Some(hash) = msg.hash {
            if !self.dedup.add_dispatch(hash) {
                return Ok(());
            }
        }

        if let Some(effect) = &msg.effect {
            self.apply_effect(effect, effect_cancel).await;
        }

        let should_write = is_whisper || !matches.is_empty();

        if let Some(resume) = self.resume.as_mut() {
            let _ = resume.push(&msg).await;
            return Ok(());
        }

        if should_write {
            conn.write(&proto::WsMessage::Dispatch(OutboundDispatchPayload {
                event_type: msg.event_type,
                matches,
                d: msg.d,
            }))
            .await?;
        }
        Ok(())
    }

    async fn apply_effect(&mut self, effect: &proto::Effect, effect_cancel: &CancellationToken) {
        for add in &effect.add_subscriptions {
            let ttl = if add.ttl > 0 { Some(Instant::now() + Duration::from_millis(add.ttl)) } else { None };
            match self.event_map.subscribe(&add.event_type, add.condition.clone(), true, ttl).await {
                Ok(id) => {
                    if add.ttl > 0 {
                        self.spawn_ttl_expiry(id, Duration::from_millis(add.ttl), effect_cancel);
                    }
                }
                Err(err) => tracing::warn!(error = ?err, "effect add_subscriptions failed, skipping"),
            }
        }
        for remove in &effect.remove_subscriptions {
            if let Err(err) = self.event_map.unsubscribe(&remove.event_type, &remove.condition).await {
                tracing::warn!(error = ?err, "effect remove_subscriptions failed, skipping");
            }
        }
        for hash in &effect.remove_hashes {
            self.dedup.expire_dispatch(*hash);
        }
    }

    /// One-shot timer: removes the auto-subscription on TTL expiry, or does
    /// nothing if the session closes first (`effect_cancel` wins the race).
    fn spawn_ttl_expiry(&self, id: u32, ttl: Duration, effect_cancel: &CancellationToken) {
        let event_map = Arc::clone(&self.event_map);
        let cancel = effect_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(ttl) => {
                    let _ = event_map.unsubscribe_by_ids(&[id]).await;
                }
                () = cancel.cancelled() => {}
            }
        });
    }

    /// Recovers a prior session's resume buffer, re-subscribes, and replays
    /// buffered dispatches (§4.8 `OnResume`).
    pub async fn on_resume<T: Transport>(
        &mut self,
        conn: &Connection<T>,
        payload: ResumePayload,
        effect_cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let rconn = self
            .redis_client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(crate::resume::ResumeError::from)?;
        let mut buffer = ResumeBuffer::new(rconn, payload.session_id.clone());

        let (events, subs) = match buffer.recover().await {
            Ok(pair) => pair,
            Err(_) => {
                conn.send_ack(
                    "Resume",
                    serde_json::json!({"success": false, "dispatches_replayed": 0, "subscriptions_restored": 0}),
                )
                .await?;
                return Ok(());
            }
        };

        for sub in &subs {
            let _ = self.event_map.subscribe(&sub.event_type, sub.condition.clone(), false, None).await;
        }

        let mut replayed = 0u32;
        for event in events {
            self.on_dispatch(conn, event, effect_cancel).await?;
            replayed += 1;
        }

        let _ = buffer.cleanup().await;

        conn.send_ack(
            "Resume",
            serde_json::json!({
                "success": true,
                "dispatches_replayed": replayed,
                "subscriptions_restored": subs.len(),
            }),
        )
        .await
    }

    /// Forwards a `Bridge` subcommand to the configured URL, stamped with
    /// the session id. Failures are logged only — they never close the
    /// session (§4.8 `OnBridge`, §7).
    pub async fn on_bridge(&self, session_id: &str, mut payload: serde_json::Value) {
        let Some(url) = self.bridge_url.as_ref() else {
            tracing::warn!("bridge command received but no bridge url configured");
            return;
        };
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("session_id".to_owned(), serde_json::Value::String(session_id.to_owned()));
        }
        if let Err(err) = self.bridge_client.post(url).json(&payload).send().await {
            tracing::warn!(error = %err, "bridge forward failed");
        }
    }
}
