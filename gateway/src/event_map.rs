//! Per-connection table of subscriptions (§4.2).
//!
//! Guarded by a session-local async mutex; mutation never spans an
//! `.await` for I/O, only the map access itself.

use crate::resume::PersistedSubscription;
use proto::Condition;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventMapError {
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("not subscribed")]
    NotSubscribed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: u32,
    pub condition: Condition,
    pub auto: bool,
    pub ttl: Option<Instant>,
}

fn object_name(event_type: &str) -> &str {
    event_type.split('.').next().unwrap_or(event_type)
}

fn wildcard_type(event_type: &str) -> String {
    format!("{}.*", object_name(event_type))
}

/// Returns the ids of `subs` that are satisfied by at least one entry in
/// `dispatch_conditions`, per the subset-match rule in §4.2: a subscription's
/// condition set matches a dispatch condition set iff every key/value pair
/// in the subscription's set is present in the dispatch's set.
///
/// A subscription with an empty condition set matches unconditionally.
#[must_use]
pub fn matching_ids(subs: &[Subscription], dispatch_conditions: &[Condition]) -> Vec<u32> {
    let mut matched = Vec::new();
    for sub in subs {
        if sub.condition.is_empty() {
            matched.push(sub.id);
            continue;
        }
        let satisfied = dispatch_conditions.iter().any(|d| condition_subset(&sub.condition, d));
        if satisfied {
            matched.push(sub.id);
        }
    }
    matched
}

/// `sub` matches `dispatch` iff every key/value pair in `sub` is present in `dispatch`.
fn condition_subset(sub: &Condition, dispatch: &Condition) -> bool {
    sub.iter().all(|(k, v)| dispatch.get(k) == Some(v))
}

#[derive(Debug, Default)]
pub struct EventMap {
    inner: Mutex<HashMap<String, Vec<Subscription>>>,
}

impl EventMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription. `auto` marks effect-originated (dispatch-driven)
    /// subscriptions, which are allowed to be idempotent against an
    /// equal-condition entry instead of erroring.
    pub async fn subscribe(
        &self,
        event_type: &str,
        condition: Condition,
        auto: bool,
        ttl: Option<Instant>,
    ) -> Result<u32, EventMapError> {
        let mut map = self.inner.lock().await;
        let entries = map.entry(event_type.to_owned()).or_default();

        if let Some(existing) = entries.iter().find(|s| s.condition == condition) {
            if existing.auto {
                return Ok(existing.id);
            }
            return Err(EventMapError::AlreadySubscribed);
        }

        let id = rand::random::<u32>();
        entries.push(Subscription { id, condition, auto, ttl });
        Ok(id)
    }

    /// Removes the whole type entry when `condition` is empty, else the
    /// first entry with an equal condition set. Returns the removed id.
    pub async fn unsubscribe(
        &self,
        event_type: &str,
        condition: &Condition,
    ) -> Result<u32, EventMapError> {
        let mut map = self.inner.lock().await;

        if condition.is_empty() {
            let Some(entries) = map.remove(event_type) else {
                return Err(EventMapError::NotSubscribed);
            };
            return Ok(entries.first().map(|s| s.id).unwrap_or(0));
        }

        let Some(entries) = map.get_mut(event_type) else {
            return Err(EventMapError::NotSubscribed);
        };
        let Some(pos) = entries.iter().position(|s| &s.condition == condition) else {
            return Err(EventMapError::NotSubscribed);
        };
        let removed = entries.remove(pos);
        if entries.is_empty() {
            map.remove(event_type);
        }
        Ok(removed.id)
    }

    /// Linear scan across all types to remove by subscription id.
    pub async fn unsubscribe_by_ids(&self, ids: &[u32]) -> Result<(), EventMapError> {
        let mut map = self.inner.lock().await;
        let mut removed_any = false;
        map.retain(|_, entries| {
            entries.retain(|s| {
                let drop = ids.contains(&s.id);
                if drop {
                    removed_any = true;
                }
                !drop
            });
            !entries.is_empty()
        });
        if removed_any {
            Ok(())
        } else {
            Err(EventMapError::NotSubscribed)
        }
    }

    /// Returns the merged view for `event_type`: its own entries concatenated
    /// with the entries under the wildcard type (`<object>.*`).
    pub async fn get(&self, event_type: &str) -> Option<Vec<Subscription>> {
        let map = self.inner.lock().await;
        let direct = map.get(event_type);
        let wildcard = map.get(&wildcard_type(event_type));

        if direct.is_none() && wildcard.is_none() {
            return None;
        }

        let mut merged = Vec::new();
        if let Some(d) = direct {
            merged.extend(d.iter().cloned());
        }
        if let Some(w) = wildcard {
            merged.extend(w.iter().cloned());
        }
        Some(merged)
    }

    pub async fn count(&self) -> i32 {
        let map = self.inner.lock().await;
        map.values().map(|v| v.len() as i32).sum()
    }

    /// Subscriptions eligible for the resume buffer: `auto`+TTL entries are
    /// ephemeral and excluded (§9 open question resolution).
    pub async fn snapshot_persistable(&self) -> Vec<PersistedSubscription> {
        let map = self.inner.lock().await;
        map.iter()
            .flat_map(|(event_type, subs)| {
                subs.iter().filter(|s| s.ttl.is_none()).map(move |s| PersistedSubscription {
                    event_type: event_type.clone(),
                    condition: s.condition.clone(),
                })
            })
            .collect()
    }

    /// Idempotent release of all entries.
    pub async fn destroy(&self) {
        let mut map = self.inner.lock().await;
        map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(pairs: &[(&str, &str)]) -> Condition {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_is_identity_on_count() {
        let map = EventMap::new();
        assert_eq!(map.count().await, 0);
        map.subscribe("emote.create", cond(&[("channel", "abc")]), false, None)
            .await
            .unwrap();
        assert_eq!(map.count().await, 1);
        map.unsubscribe("emote.create", &cond(&[("channel", "abc")])).await.unwrap();
        assert_eq!(map.count().await, 0);
    }

    #[tokio::test]
    async fn equal_condition_sets_are_already_subscribed_unless_auto() {
        let map = EventMap::new();
        map.subscribe("emote.create", cond(&[("channel", "abc")]), false, None)
            .await
            .unwrap();
        let err = map
            .subscribe("emote.create", cond(&[("channel", "abc")]), false, None)
            .await
            .unwrap_err();
        assert_eq!(err, EventMapError::AlreadySubscribed);
    }

    #[tokio::test]
    async fn auto_subscription_with_equal_condition_is_idempotent() {
        let map = EventMap::new();
        let id = map
            .subscribe("user.ban", cond(&[("user", "u1")]), true, None)
            .await
            .unwrap();
        let id2 = map
            .subscribe("user.ban", cond(&[("user", "u1")]), true, None)
            .await
            .unwrap();
        assert_eq!(id, id2);
        assert_eq!(map.count().await, 1);
    }

    #[tokio::test]
    async fn empty_plus_nonempty_condition_is_additive_empty_plus_empty_is_already_subscribed() {
        let map = EventMap::new();
        map.subscribe("emote.create", Condition::new(), false, None).await.unwrap();
        map.subscribe("emote.create", cond(&[("channel", "abc")]), false, None)
            .await
            .unwrap();
        assert_eq!(map.count().await, 2);

        let err = map.subscribe("emote.create", Condition::new(), false, None).await.unwrap_err();
        assert_eq!(err, EventMapError::AlreadySubscribed);
    }

    #[tokio::test]
    async fn unsubscribe_without_condition_drops_whole_type() {
        let map = EventMap::new();
        map.subscribe("emote.create", cond(&[("channel", "a")]), false, None).await.unwrap();
        map.subscribe("emote.create", cond(&[("channel", "b")]), false, None).await.unwrap();
        map.unsubscribe("emote.create", &Condition::new()).await.unwrap();
        assert!(map.get("emote.create").await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_not_subscribed_when_absent() {
        let map = EventMap::new();
        let err = map.unsubscribe("emote.create", &Condition::new()).await.unwrap_err();
        assert_eq!(err, EventMapError::NotSubscribed);
    }

    #[tokio::test]
    async fn wildcard_merge_unions_object_and_object_star() {
        let map = EventMap::new();
        let direct_id = map
            .subscribe("emote.create", cond(&[("channel", "abc")]), false, None)
            .await
            .unwrap();
        let wildcard_id = map.subscribe("emote.*", Condition::new(), false, None).await.unwrap();

        let merged = map.get("emote.create").await.unwrap();
        let ids: Vec<u32> = merged.iter().map(|s| s.id).collect();
        assert!(ids.contains(&direct_id));
        assert!(ids.contains(&wildcard_id));
    }

    #[test]
    fn matching_soundness_subset_rule() {
        let subs = vec![Subscription {
            id: 1,
            condition: cond(&[("k1", "v1")]),
            auto: false,
            ttl: None,
        }];
        assert_eq!(
            matching_ids(&subs, &[cond(&[("k1", "v1"), ("k2", "v2")])]),
            vec![1]
        );
        assert!(matching_ids(&subs, &[cond(&[("k1", "v2")])]).is_empty());
        assert!(matching_ids(&subs, &[Condition::new()]).is_empty());
        assert!(matching_ids(&subs, &[]).is_empty());
    }

    #[test]
    fn empty_condition_subscription_matches_everything() {
        let subs = vec![Subscription {
            id: 9,
            condition: Condition::new(),
            auto: false,
            ttl: None,
        }];
        assert_eq!(matching_ids(&subs, &[]), vec![9]);
        assert_eq!(matching_ids(&subs, &[cond(&[("a", "b")])]), vec![9]);
    }

    #[tokio::test]
    async fn unsubscribe_by_ids_removes_across_types() {
        let map = EventMap::new();
        let id1 = map.subscribe("a.b", cond(&[("k", "1")]), true, None).await.unwrap();
        let id2 = map.subscribe("c.d", cond(&[("k", "2")]), true, None).await.unwrap();
        map.unsubscribe_by_ids(&[id1]).await.unwrap();
        assert!(map.get("a.b").await.is_none());
        assert!(map.get("c.d").await.is_some());
        let err = map.unsubscribe_by_ids(&[id2 + 1]).await.unwrap_err();
        assert_eq!(err, EventMapError::NotSubscribed);
    }
}
