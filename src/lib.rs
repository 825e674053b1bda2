//! Supportchat - support ticket chat client
//!
//! Client core for a two-party support chat:
//! - Keeps one real-time channel open for the active ticket
//! - Reconciles REST history and live frames into an ordered message log
//! - Projects the log into a date-segmented, cluster-aware view
//! - Polls the ticket list and enforces the single-open-ticket rule

pub mod api;
pub mod auth;
pub mod channel;
pub mod client;
pub mod conversation;
pub mod models;
pub mod protocol;
pub mod storage;
pub mod tickets;

pub use api::{ApiClient, SupportBackend};
pub use channel::{ChannelState, ChatChannel};
pub use client::SupportClient;
pub use conversation::{ChatSession, MessageLog, ProjectedItem};
pub use models::{Message, Ticket, TicketId, TicketStatus, UserId};
pub use tickets::{PollerHandle, TicketCache, TicketPoller};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CONFIG_FILE: &str = "config.toml";

/// Configuration for Supportchat
#[derive(Debug, Clone)]
pub struct SupportChatConfig {
    /// Base URL of the REST API
    pub api_url: String,

    /// Base URL of the real-time channel (ws:// or wss://)
    pub ws_url: String,

    /// Directory for the cached ticket list and credentials
    pub data_dir: PathBuf,

    /// How often the ticket list is refreshed
    pub poll_interval: Duration,

    /// Whether to log at debug level
    pub verbose: bool,
}

/// On-disk shape of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    api_url: Option<String>,
    ws_url: Option<String>,
    poll_interval_secs: Option<u64>,
}

impl SupportChatConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: ws_base_from_http(DEFAULT_API_URL).unwrap_or_default(),
            data_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: false,
        }
    }

    /// Load `config.toml` from `data_dir` (if present), then apply the
    /// `SUPPORTCHAT_API_URL` / `SUPPORTCHAT_WS_URL` environment overrides.
    pub async fn load(data_dir: PathBuf) -> Result<Self> {
        let mut config = Self::new(data_dir);
        let path = config.data_dir.join(CONFIG_FILE);

        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let file: ConfigToml = toml::from_str(&content)
                .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
            if let Some(api_url) = file.api_url {
                config = config.with_api_url(api_url);
            }
            if let Some(ws_url) = file.ws_url {
                config.ws_url = ws_url;
            }
            if let Some(secs) = file.poll_interval_secs {
                config.poll_interval = Duration::from_secs(secs.max(1));
            }
        }

        if let Ok(api_url) = std::env::var("SUPPORTCHAT_API_URL") {
            config = config.with_api_url(api_url);
        }
        if let Ok(ws_url) = std::env::var("SUPPORTCHAT_WS_URL") {
            config.ws_url = ws_url;
        }

        Ok(config)
    }

    /// Set the REST base URL. The channel URL follows it (http → ws).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        if let Some(ws) = ws_base_from_http(&api_url) {
            self.ws_url = ws;
        }
        self.api_url = api_url;
        self
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Map an http(s) base URL onto the matching ws(s) one.
fn ws_base_from_http(base: &str) -> Option<String> {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        Some(format!("wss://{rest}"))
    } else {
        base.strip_prefix("http://").map(|rest| format!("ws://{rest}"))
    }
}

/// Result type for Supportchat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors that can occur in Supportchat
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Channel transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    Frame(#[from] protocol::FrameError),

    #[error("User {user_id} is not a participant in ticket {ticket_id}")]
    NotParticipant { ticket_id: TicketId, user_id: UserId },

    #[error("Channel is not open")]
    ChannelNotOpen,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Ticket {0} is still open. Close it before creating a new one")]
    OpenTicketExists(TicketId),

    #[error("Unknown ticket {0}")]
    UnknownTicket(TicketId),

    #[error("No active open ticket")]
    NoActiveTicket,

    #[error("Ticket {0} has no assignee to send to yet")]
    NoRecipient(TicketId),

    #[error("Ticket {0} was deactivated before the operation finished")]
    Superseded(TicketId),

    #[error("API error {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Text to show the user: the server-provided detail when there is one,
    /// `fallback` for other remote failures, the error itself for local ones.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            ChatError::Api { detail, .. } if !detail.is_empty() => detail.clone(),
            ChatError::Api { .. } | ChatError::Http(_) | ChatError::Transport(_) => {
                fallback.to_string()
            }
            other => other.to_string(),
        }
    }
}
