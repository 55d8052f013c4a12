//! Session presence: who is in a session across all broker instances, and who is typing.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{PresenceEntry, Role, SessionStatus};
use crate::repositories::PresenceStore;

/// Presence operations. Reads always go to the store; nothing is cached locally.
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    typing_ttl: Duration,
    presence_ttl: Option<Duration>,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        typing_ttl: Duration,
        presence_ttl: Option<Duration>,
    ) -> Self {
        Self {
            store,
            typing_ttl,
            presence_ttl,
        }
    }

    /// Upsert the member with the current time as join time.
    #[instrument(skip(self))]
    pub async fn join(&self, session_id: Uuid, user_id: &str, role: &Role) -> AppResult<()> {
        let entry = PresenceEntry::new(user_id, role.clone());
        let data = serde_json::to_string(&entry).map_err(AppError::from)?;
        self.store
            .upsert_member(&session_id.to_string(), user_id, &data, self.presence_ttl)
            .await?;
        info!(session_id = %session_id, user_id = %user_id, user_type = %role, "member added");
        Ok(())
    }

    /// Remove the member; absent members are not an error.
    #[instrument(skip(self))]
    pub async fn leave(&self, session_id: Uuid, user_id: &str, role: &Role) -> AppResult<()> {
        self.store
            .remove_member(&session_id.to_string(), user_id)
            .await?;
        info!(session_id = %session_id, user_id = %user_id, user_type = %role, "member removed");
        Ok(())
    }

    /// Current membership of the session, zeroed when nobody is present.
    pub async fn snapshot(&self, session_id: Uuid) -> AppResult<SessionStatus> {
        let raw = self.store.members(&session_id.to_string()).await?;
        let entries = raw.into_iter().filter_map(|(user_id, data)| {
            match serde_json::from_str::<PresenceEntry>(&data) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        user_id = %user_id,
                        error = %e,
                        "skipping unreadable presence entry"
                    );
                    None
                }
            }
        });
        Ok(SessionStatus::from_entries(entries))
    }

    /// Keep the session's presence alive (keepalive heartbeat).
    pub async fn touch(&self, session_id: Uuid) -> AppResult<()> {
        if let Some(ttl) = self.presence_ttl {
            self.store
                .refresh_members(&session_id.to_string(), ttl)
                .await?;
        }
        Ok(())
    }

    /// Set the typing flag with a TTL, or delete it when `is_typing` is false.
    #[instrument(skip(self))]
    pub async fn set_typing(
        &self,
        session_id: Uuid,
        user_id: &str,
        is_typing: bool,
    ) -> AppResult<()> {
        let session = session_id.to_string();
        if is_typing {
            self.store.set_typing(&session, user_id, self.typing_ttl).await?;
        } else {
            self.store.clear_typing(&session, user_id).await?;
        }
        debug!(session_id = %session_id, user_id = %user_id, is_typing, "typing flag updated");
        Ok(())
    }

    pub async fn typing_users(&self, session_id: Uuid) -> AppResult<Vec<String>> {
        self.store.typing_users(&session_id.to_string()).await
    }
}
