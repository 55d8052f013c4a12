//! Redis connection and pub/sub for bus relay and presence storage.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{members_key, typing_key, typing_prefix, MessageBus, PresenceStore};
use crate::error::AppError;

/// Redis-backed repository: pub/sub for bus events, hashes and expiring keys for presence.
#[derive(Clone)]
pub struct RedisRepository {
    client: Arc<redis::Client>,
}

impl RedisRepository {
    /// Create repository from Redis URL.
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Get a multiplexed connection for commands (publish, hset, etc.).
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisRepository {
    async fn upsert_member(
        &self,
        session: &str,
        user_id: &str,
        entry: &str,
        ttl: Option<Duration>,
    ) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let key = members_key(session);
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(&key).arg(user_id).arg(entry).ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE").arg(&key).arg(ttl.as_secs().max(1)).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn remove_member(&self, session: &str, user_id: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(members_key(session), user_id).await?;
        Ok(())
    }

    async fn members(&self, session: &str) -> Result<Vec<(String, String)>, AppError> {
        let mut conn = self.connection().await?;
        let map: std::collections::HashMap<String, String> =
            conn.hgetall(members_key(session)).await?;
        Ok(map.into_iter().collect())
    }

    async fn refresh_members(&self, session: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        redis::cmd("EXPIRE")
            .arg(members_key(session))
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_typing(
        &self,
        session: &str,
        user_id: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(typing_key(session, user_id))
            .arg("true")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_typing(&self, session: &str, user_id: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(typing_key(session, user_id)).await?;
        Ok(())
    }

    async fn typing_users(&self, session: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.connection().await?;
        let prefix = typing_prefix(session);
        let keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
            .filter(|user| !user.is_empty())
            .collect())
    }
}

#[async_trait]
impl MessageBus for RedisRepository {
    /// Publish a message to a channel (Redis PUBLISH).
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let receivers: u64 = conn.publish(channel, payload).await?;
        debug!(channel = %channel, receivers, "published");
        Ok(())
    }

    /// Subscribe on a dedicated Redis connection; the stream ends if that connection drops.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, AppError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        info!(channel = %channel, "subscribed to redis channel");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}
