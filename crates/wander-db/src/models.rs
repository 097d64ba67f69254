/// Row types as stored in SQLite.
/// Distinct from wander-types models to keep the DB layer independent.

pub struct ConversationRow {
    pub id: String,
    pub participant_name: String,
    pub participant_avatar: Option<String>,
    pub participant_timezone: Option<String>,
    pub last_seen: Option<String>,
    pub subject: String,
    pub status: String,
    pub last_message: Option<String>,
    pub unread_count: u32,
    pub deleted: bool,
    pub last_message_id: u64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub conversation_id: String,
    pub id: u64,
    pub sender: String,
    pub text: String,
    pub kind: String,
    pub created_at: String,
}

/// A message about to be appended; the id is assigned by the database.
pub struct NewMessage<'a> {
    pub conversation_id: &'a str,
    pub sender: &'a str,
    pub text: &'a str,
    pub kind: &'a str,
    pub created_at: &'a str,
    /// Added to the conversation's unread counter in the same transaction.
    pub unread_increment: u32,
}
