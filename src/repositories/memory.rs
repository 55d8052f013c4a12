//! In-process presence store and bus for single-instance deployments.
//!
//! Sharing one [`InMemoryBackend`] between several hubs behaves like several
//! broker instances attached to the same bus and presence store.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{members_key, typing_key, typing_prefix, MessageBus, PresenceStore};
use crate::error::{AppError, AppResult};

const BUS_CAPACITY: usize = 256;

#[derive(Default)]
struct MemberSet {
    entries: HashMap<String, String>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    members: HashMap<String, MemberSet>,
    flags: HashMap<String, Instant>,
    topics: HashMap<String, broadcast::Sender<String>>,
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("in-memory backend lock poisoned")))
    }
}

fn live(expires_at: Option<Instant>) -> bool {
    expires_at.map_or(true, |at| at > Instant::now())
}

#[async_trait]
impl PresenceStore for InMemoryBackend {
    async fn upsert_member(
        &self,
        session: &str,
        user_id: &str,
        entry: &str,
        ttl: Option<Duration>,
    ) -> AppResult<()> {
        let mut state = self.lock()?;
        let set = state.members.entry(members_key(session)).or_default();
        if !live(set.expires_at) {
            *set = MemberSet::default();
        }
        set.entries.insert(user_id.to_string(), entry.to_string());
        if let Some(ttl) = ttl {
            set.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn remove_member(&self, session: &str, user_id: &str) -> AppResult<()> {
        let mut state = self.lock()?;
        let key = members_key(session);
        let now_empty = match state.members.get_mut(&key) {
            Some(set) => {
                set.entries.remove(user_id);
                set.entries.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.members.remove(&key);
        }
        Ok(())
    }

    async fn members(&self, session: &str) -> AppResult<Vec<(String, String)>> {
        let state = self.lock()?;
        Ok(state
            .members
            .get(&members_key(session))
            .filter(|set| live(set.expires_at))
            .map(|set| {
                set.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn refresh_members(&self, session: &str, ttl: Duration) -> AppResult<()> {
        let mut state = self.lock()?;
        if let Some(set) = state.members.get_mut(&members_key(session)) {
            if live(set.expires_at) {
                set.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn set_typing(&self, session: &str, user_id: &str, ttl: Duration) -> AppResult<()> {
        let mut state = self.lock()?;
        state
            .flags
            .insert(typing_key(session, user_id), Instant::now() + ttl);
        Ok(())
    }

    async fn clear_typing(&self, session: &str, user_id: &str) -> AppResult<()> {
        let mut state = self.lock()?;
        state.flags.remove(&typing_key(session, user_id));
        Ok(())
    }

    async fn typing_users(&self, session: &str) -> AppResult<Vec<String>> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.flags.retain(|_, expires_at| *expires_at > now);
        let prefix = typing_prefix(session);
        let mut users: Vec<String> = state
            .flags
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
            .collect();
        users.sort();
        Ok(users)
    }
}

#[async_trait]
impl MessageBus for InMemoryBackend {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let state = self.lock()?;
        if let Some(tx) = state.topics.get(channel) {
            // No receivers is not an error on a pub/sub bus.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<BoxStream<'static, String>> {
        let rx = {
            let mut state = self.lock()?;
            state
                .topics
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
                .subscribe()
        };
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "in-memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_same_user() {
        let store = InMemoryBackend::new();
        store.upsert_member("s1", "u1", "a", None).await.unwrap();
        store.upsert_member("s1", "u1", "b", None).await.unwrap();
        assert_eq!(
            store.members("s1").await.unwrap(),
            vec![("u1".to_string(), "b".to_string())]
        );
    }

    #[tokio::test]
    async fn remove_missing_member_is_noop() {
        let store = InMemoryBackend::new();
        store.remove_member("s1", "ghost").await.unwrap();
        assert!(store.members("s1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn member_set_expires_and_refresh_extends_it() {
        let store = InMemoryBackend::new();
        let ttl = Duration::from_secs(60);
        store.upsert_member("s1", "u1", "a", Some(ttl)).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        store.refresh_members("s1", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(store.members("s1").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.members("s1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_flag_expires() {
        let store = InMemoryBackend::new();
        store
            .set_typing("s1", "u1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.typing_users("s1").await.unwrap(), vec!["u1".to_string()]);
        assert!(store.typing_users("s2").await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.typing_users("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bus_delivers_to_every_subscriber_of_a_channel() {
        let bus = InMemoryBackend::new();
        let mut a = bus.subscribe("typing-indicators").await.unwrap();
        let mut b = bus.subscribe("typing-indicators").await.unwrap();
        let mut other = bus.subscribe("chat-messages").await.unwrap();

        bus.publish("typing-indicators", "x").await.unwrap();
        assert_eq!(a.next().await.as_deref(), Some("x"));
        assert_eq!(b.next().await.as_deref(), Some("x"));

        bus.publish("chat-messages", "y").await.unwrap();
        assert_eq!(other.next().await.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = InMemoryBackend::new();
        tokio_test::assert_ok!(bus.publish("connection-status", "{}").await);
    }
}
