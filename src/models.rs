//! Ticket, message and user types
//!
//! `*Record` types mirror the REST payloads exactly and reject unknown or
//! missing fields. The plain types (`Ticket`, `Message`) are what the rest of
//! the crate works with.

use serde::{Deserialize, Serialize};

pub type TicketId = i64;
pub type UserId = i64;

/// Ticket lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket as returned by `/api/tickets/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketRecord {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub status: TicketStatus,
    pub creator_id: UserId,
    pub assignee_id: Option<UserId>,
}

/// Locally held ticket. `is_active` never comes from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub status: TicketStatus,
    pub creator_id: UserId,
    pub assignee_id: Option<UserId>,
    #[serde(default)]
    pub is_active: bool,
}

impl Ticket {
    pub fn is_open(&self) -> bool {
        self.status == TicketStatus::Open
    }

    /// Whether `user_id` is the creator or the assignee.
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.creator_id == user_id || self.assignee_id == Some(user_id)
    }

    /// The other side of the conversation from `user_id`'s point of view.
    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        if self.creator_id == user_id {
            self.assignee_id
        } else {
            Some(self.creator_id)
        }
    }
}

impl From<TicketRecord> for Ticket {
    fn from(record: TicketRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            description: record.description,
            priority: record.priority,
            status: record.status,
            creator_id: record.creator_id,
            assignee_id: record.assignee_id,
            is_active: false,
        }
    }
}

/// Body of `POST /api/tickets/`
#[derive(Debug, Clone, Serialize)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub priority: String,
    pub assignee_id: Option<UserId>,
}

impl NewTicket {
    pub const DEFAULT_PRIORITY: &'static str = "NORMAL";

    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: Self::DEFAULT_PRIORITY.to_string(),
            assignee_id: None,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_assignee(mut self, assignee_id: UserId) -> Self {
        // Non-positive ids mean "unassigned"
        self.assignee_id = (assignee_id > 0).then_some(assignee_id);
        self
    }
}

/// Body of `PUT /api/tickets/{id}`
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub status: TicketStatus,
}

/// Message as returned by `/api/messages/ticket/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageRecord {
    pub id: i64,
    pub ticket_id: TicketId,
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
}

/// Body of `POST /api/messages/`
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub ticket_id: TicketId,
    pub content: String,
    pub receiver_id: UserId,
}

/// A message in the conversation log. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: String,
    pub is_user: bool,
    pub sender_name: String,
}

impl Message {
    /// Build from a REST history record, as seen by `local_user`.
    pub fn from_record(record: MessageRecord, local_user: UserId) -> Self {
        Self {
            id: record.id.to_string(),
            content: record.content,
            sender_id: record.sender_id,
            timestamp: record.timestamp.unwrap_or_default(),
            is_user: record.sender_id == local_user,
            sender_name: record.sender_name.unwrap_or_default(),
        }
    }

    /// Same sender and content. Used to spot a live message that also shows
    /// up in fetched history; the timestamp is left out because the channel
    /// sends a display time while REST returns the stored datetime.
    pub fn same_payload(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id && self.content == other.content
    }
}

/// User as returned by `/api/users/{id}` and `/api/auth/register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Body of `POST /api/auth/register`
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: String,
}

/// Body of `POST /api/auth/login`
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Response of `POST /api/auth/login`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}
