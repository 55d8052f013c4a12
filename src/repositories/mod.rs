//! Storage and bus backends: presence collections, typing flags, pub/sub channels.

pub mod memory;
pub mod redis_repo;

pub use memory::InMemoryBackend;
pub use redis_repo::RedisRepository;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::AppResult;

/// Distributed presence storage shared by every broker instance.
///
/// Values are opaque JSON strings; the presence service owns their shape.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert `user_id` in the session collection, refreshing its expiry when `ttl` is set.
    async fn upsert_member(
        &self,
        session: &str,
        user_id: &str,
        entry: &str,
        ttl: Option<Duration>,
    ) -> AppResult<()>;

    async fn remove_member(&self, session: &str, user_id: &str) -> AppResult<()>;

    /// All `(user_id, entry)` pairs of the session.
    async fn members(&self, session: &str) -> AppResult<Vec<(String, String)>>;

    /// Push back the expiry of the session collection.
    async fn refresh_members(&self, session: &str, ttl: Duration) -> AppResult<()>;

    async fn set_typing(&self, session: &str, user_id: &str, ttl: Duration) -> AppResult<()>;

    async fn clear_typing(&self, session: &str, user_id: &str) -> AppResult<()>;

    async fn typing_users(&self, session: &str) -> AppResult<Vec<String>>;
}

/// Publish/subscribe transport connecting broker instances.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()>;

    /// Stream of payloads published on `channel` from now on. Ends when the subscription drops.
    async fn subscribe(&self, channel: &str) -> AppResult<BoxStream<'static, String>>;
}

pub(crate) fn members_key(session: &str) -> String {
    format!("session:{}:users", session)
}

pub(crate) fn typing_prefix(session: &str) -> String {
    format!("session:{}:typing:", session)
}

pub(crate) fn typing_key(session: &str, user_id: &str) -> String {
    format!("{}{}", typing_prefix(session), user_id)
}
