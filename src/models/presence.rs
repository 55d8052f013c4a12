//! Presence records and the derived per-session status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::session::Role;

/// One member of a session as stored in the presence collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    #[serde(rename = "user_type")]
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            joined_at: Utc::now(),
        }
    }
}

/// Membership snapshot of a session, always rebuilt from the stored entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub users: BTreeMap<String, PresenceEntry>,
    pub customer_connected: bool,
    pub agent_connected: bool,
    pub total_customer: usize,
    pub total_agent: usize,
}

impl SessionStatus {
    /// Fold presence entries into counts and per-role flags.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = PresenceEntry>,
    {
        let mut status = SessionStatus::default();
        for entry in entries {
            status.users.insert(entry.user_id.clone(), entry);
        }
        for entry in status.users.values() {
            match entry.role {
                Role::Customer => status.total_customer += 1,
                Role::Agent => status.total_agent += 1,
                Role::Other(_) => {}
            }
        }
        status.customer_connected = status.total_customer > 0;
        status.agent_connected = status.total_agent > 0;
        status
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }
}
