use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A counterparty came online or went offline.
///
/// Keyed by conversation because each conversation has exactly one
/// counterparty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceUpdate {
    pub conversation_id: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}
