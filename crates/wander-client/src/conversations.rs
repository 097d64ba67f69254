use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use wander_db::Database;
use wander_db::models::{ConversationRow, MessageRow, NewMessage};
use wander_types::events::PresenceUpdate;
use wander_types::models::{
    Conversation, ConversationStatus, Message, MessageKind, Participant, Sender,
};

use crate::error::StoreError;

/// List-view filter for [`ConversationStore::get_filtered`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversationFilter {
    #[default]
    All,
    Unread,
    Active,
    Completed,
}

impl ConversationFilter {
    fn matches(self, conversation: &Conversation) -> bool {
        match self {
            Self::All => true,
            Self::Unread => conversation.unread_count > 0,
            Self::Active => conversation.status == ConversationStatus::Active,
            Self::Completed => conversation.status == ConversationStatus::Completed,
        }
    }
}

impl FromStr for ConversationFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "unread" => Ok(Self::Unread),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown filter: {other}")),
        }
    }
}

/// Conversations with their message logs, read state and soft-delete flags.
///
/// Reads are served from memory. Every mutation is written to the database
/// first and applied in memory only once the write succeeded.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Arc<Database>,
    conversations: Mutex<Vec<Conversation>>,
}

impl ConversationStore {
    pub fn load(db: Arc<Database>) -> Result<Self, StoreError> {
        let mut messages: HashMap<String, Vec<Message>> = HashMap::new();
        for row in db.get_messages()? {
            let conversation_id = row.conversation_id.clone();
            if let Some(message) = message_from_row(row) {
                messages.entry(conversation_id).or_default().push(message);
            }
        }

        let conversations: Vec<Conversation> = db
            .get_conversations()?
            .into_iter()
            .map(|row| {
                let log = messages.remove(&row.id).unwrap_or_default();
                conversation_from_row(row, log)
            })
            .collect();

        info!(count = conversations.len(), "Loaded conversations");
        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                conversations: Mutex::new(conversations),
            }),
        })
    }

    /// Insert conversations from a fixture or remote listing. Ids already
    /// present are left untouched. Returns how many were added.
    ///
    /// Every conversation's message ids must be strictly increasing; the
    /// whole batch is rejected before anything is written otherwise.
    pub fn seed(&self, conversations: Vec<Conversation>) -> Result<usize, StoreError> {
        for conversation in &conversations {
            validate_history(conversation)?;
        }

        let mut state = self.state();
        let mut added = 0;

        for conversation in conversations {
            if state.iter().any(|c| c.id == conversation.id) {
                continue;
            }

            let row = conversation_to_row(&conversation);
            let history: Vec<MessageRow> = conversation
                .messages
                .iter()
                .map(|message| MessageRow {
                    conversation_id: conversation.id.clone(),
                    id: message.id,
                    sender: message.sender.as_str().to_string(),
                    text: message.text.clone(),
                    kind: message.kind.as_str().to_string(),
                    created_at: timestamp(message.timestamp),
                })
                .collect();

            if !self.inner.db.insert_conversation_with_messages(&row, &history)? {
                warn!(conversation_id = %conversation.id, "Conversation already stored, not seeding");
                continue;
            }

            state.push(conversation);
            added += 1;
        }

        debug!(added, "Seeded conversations");
        Ok(added)
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.state().iter().find(|c| c.id == id).cloned()
    }

    pub fn mark_as_read(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |db, c| {
            db.set_unread_count(&c.id, 0)?;
            c.unread_count = 0;
            Ok(())
        })
    }

    pub fn mark_as_unread(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |db, c| {
            let unread = c.unread_count.max(1);
            db.set_unread_count(&c.id, unread)?;
            c.unread_count = unread;
            Ok(())
        })
    }

    /// Soft delete: hidden from listings, messages kept.
    pub fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        self.set_deleted(id, true)
    }

    pub fn restore(&self, id: &str) -> Result<(), StoreError> {
        self.set_deleted(id, false)
    }

    /// Remove the conversation and its messages for good.
    pub fn permanently_delete(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let pos = state
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        self.inner.db.delete_conversation(id)?;
        state.remove(pos);
        info!(conversation_id = id, "Conversation permanently deleted");
        Ok(())
    }

    /// Append a message. Only counterparty messages count as unread.
    pub fn add_message(
        &self,
        id: &str,
        text: &str,
        sender: Sender,
        kind: MessageKind,
    ) -> Result<Message, StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::Validation("message text is empty".into()));
        }

        let now = Utc::now();
        let unread_increment = u32::from(sender == Sender::Counterparty);

        self.update(id, |db, c| {
            let message_id = db.append_message(&NewMessage {
                conversation_id: &c.id,
                sender: sender.as_str(),
                text,
                kind: kind.as_str(),
                created_at: &timestamp(now),
                unread_increment,
            })?;

            let message = Message {
                id: message_id,
                sender,
                text: text.to_string(),
                kind,
                timestamp: now,
            };
            c.messages.push(message.clone());
            c.last_message = Some(message.text.clone());
            c.updated_at = now;
            c.unread_count += unread_increment;
            Ok(message)
        })
    }

    /// Conversations for a list view, most recently updated first.
    /// Soft-deleted conversations are never included.
    pub fn get_filtered(&self, filter: ConversationFilter, query: &str) -> Vec<Conversation> {
        let query = query.trim().to_lowercase();
        let mut matches: Vec<Conversation> = self
            .state()
            .iter()
            .filter(|c| !c.deleted && filter.matches(c))
            .filter(|c| {
                query.is_empty()
                    || c.participant.name.to_lowercase().contains(&query)
                    || c.subject.to_lowercase().contains(&query)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matches
    }

    /// Soft-deleted conversations, for a trash view.
    pub fn deleted_conversations(&self) -> Vec<Conversation> {
        self.state().iter().filter(|c| c.deleted).cloned().collect()
    }

    /// Unread count across all visible conversations.
    pub fn total_unread(&self) -> u32 {
        self.state()
            .iter()
            .filter(|c| !c.deleted)
            .map(|c| c.unread_count)
            .sum()
    }

    /// Apply a presence change. Presence is live state and is not persisted.
    /// Returns false for unknown conversations.
    pub fn apply_presence(&self, update: &PresenceUpdate) -> bool {
        let mut state = self.state();
        let Some(conversation) = state.iter_mut().find(|c| c.id == update.conversation_id) else {
            return false;
        };
        conversation.participant.online = update.online;
        if update.last_seen.is_some() {
            conversation.participant.last_seen = update.last_seen;
        }
        true
    }

    fn set_deleted(&self, id: &str, deleted: bool) -> Result<(), StoreError> {
        self.update(id, |db, c| {
            db.set_deleted(&c.id, deleted)?;
            c.deleted = deleted;
            Ok(())
        })
    }

    fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&Database, &mut Conversation) -> anyhow::Result<T>,
    ) -> Result<T, StoreError> {
        let mut state = self.state();
        let conversation = state
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(f(&self.inner.db, conversation)?)
    }

    fn state(&self) -> MutexGuard<'_, Vec<Conversation>> {
        self.inner
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str, field: &str, owner: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on '{}': {}", field, raw, owner, e);
        DateTime::default()
    })
}

fn validate_history(c: &Conversation) -> Result<(), StoreError> {
    for pair in c.messages.windows(2) {
        if pair[1].id <= pair[0].id {
            return Err(StoreError::Validation(format!(
                "conversation {}: message id {} follows {}",
                c.id, pair[1].id, pair[0].id
            )));
        }
    }
    Ok(())
}

fn conversation_to_row(c: &Conversation) -> ConversationRow {
    ConversationRow {
        id: c.id.clone(),
        participant_name: c.participant.name.clone(),
        participant_avatar: c.participant.avatar.clone(),
        participant_timezone: c.participant.timezone.clone(),
        last_seen: c.participant.last_seen.map(timestamp),
        subject: c.subject.clone(),
        status: c.status.as_str().to_string(),
        last_message: c.last_message.clone(),
        unread_count: c.unread_count,
        deleted: c.deleted,
        last_message_id: c.messages.iter().map(|m| m.id).max().unwrap_or(0),
        created_at: timestamp(c.created_at),
        updated_at: timestamp(c.updated_at),
    }
}

fn conversation_from_row(row: ConversationRow, messages: Vec<Message>) -> Conversation {
    let status = row.status.parse::<ConversationStatus>().unwrap_or_else(|e| {
        warn!("{} on conversation '{}'", e, row.id);
        ConversationStatus::default()
    });

    Conversation {
        participant: Participant {
            name: row.participant_name,
            avatar: row.participant_avatar,
            online: false,
            last_seen: row
                .last_seen
                .as_deref()
                .map(|raw| parse_timestamp(raw, "last_seen", &row.id)),
            timezone: row.participant_timezone,
        },
        subject: row.subject,
        status,
        messages,
        last_message: row.last_message,
        unread_count: row.unread_count,
        deleted: row.deleted,
        created_at: parse_timestamp(&row.created_at, "created_at", &row.id),
        updated_at: parse_timestamp(&row.updated_at, "updated_at", &row.id),
        id: row.id,
    }
}

fn message_from_row(row: MessageRow) -> Option<Message> {
    let sender = match row.sender.parse::<Sender>() {
        Ok(sender) => sender,
        Err(e) => {
            warn!("Skipping message {} in '{}': {}", row.id, row.conversation_id, e);
            return None;
        }
    };
    let kind = row.kind.parse::<MessageKind>().unwrap_or_else(|e| {
        warn!("{} on message {} in '{}'", e, row.id, row.conversation_id);
        MessageKind::default()
    });

    Some(Message {
        id: row.id,
        sender,
        kind,
        timestamp: parse_timestamp(&row.created_at, "created_at", &row.conversation_id),
        text: row.text,
    })
}
