//! REST client for the support desk API
//!
//! Every request carries `Authorization: Bearer <token>` when a token is
//! set. A missing token is not an error here; the server decides.
//! Failed responses become `ChatError::Api` with the server's `detail`
//! message when it sent one.

use crate::models::{
    LoginRequest, LoginResponse, MessageRecord, NewMessage, NewTicket, Registration,
    StatusUpdate, TicketId, TicketRecord, TicketStatus, UserId, UserRecord,
};
use crate::{ChatError, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DETAIL_CHARS: usize = 500;

/// The ticket, message and user calls the chat core depends on.
#[async_trait]
pub trait SupportBackend: Send + Sync {
    async fn list_tickets(&self) -> Result<Vec<TicketRecord>>;

    async fn get_ticket(&self, ticket_id: TicketId) -> Result<TicketRecord>;

    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketRecord>;

    async fn update_ticket_status(
        &self,
        ticket_id: TicketId,
        status: TicketStatus,
    ) -> Result<TicketRecord>;

    async fn list_messages(&self, ticket_id: TicketId) -> Result<Vec<MessageRecord>>;

    /// Store a message over REST. The live path uses the channel instead.
    async fn create_message(&self, message: &NewMessage) -> Result<MessageRecord>;

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord>;
}

/// HTTP implementation of [`SupportBackend`] plus the auth endpoints.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("supportchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set or clear the bearer token used for subsequent requests.
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    pub async fn register(&self, registration: &Registration) -> Result<UserRecord> {
        self.send_json(self.client.post(self.url("/api/auth/register")).json(registration))
            .await
    }

    /// Exchange email and password for an access token.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        self.send_json(self.client.post(self.url("/api/auth/login")).json(&body))
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let mut builder = builder.header("Content-Type", "application/json");
        if let Some(token) = self.token.read().await.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        debug!("{} {}", response.status(), response.url().path());
        let response = check_response_status(response).await?;

        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl SupportBackend for ApiClient {
    async fn list_tickets(&self) -> Result<Vec<TicketRecord>> {
        self.send_json(self.client.get(self.url("/api/tickets/")))
            .await
    }

    async fn get_ticket(&self, ticket_id: TicketId) -> Result<TicketRecord> {
        self.send_json(self.client.get(self.url(&format!("/api/tickets/{ticket_id}"))))
            .await
    }

    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketRecord> {
        self.send_json(self.client.post(self.url("/api/tickets/")).json(ticket))
            .await
    }

    async fn update_ticket_status(
        &self,
        ticket_id: TicketId,
        status: TicketStatus,
    ) -> Result<TicketRecord> {
        let body = StatusUpdate { status };
        self.send_json(
            self.client
                .put(self.url(&format!("/api/tickets/{ticket_id}")))
                .json(&body),
        )
        .await
    }

    async fn list_messages(&self, ticket_id: TicketId) -> Result<Vec<MessageRecord>> {
        self.send_json(
            self.client
                .get(self.url(&format!("/api/messages/ticket/{ticket_id}"))),
        )
        .await
    }

    async fn create_message(&self, message: &NewMessage) -> Result<MessageRecord> {
        self.send_json(self.client.post(self.url("/api/messages/")).json(message))
            .await
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord> {
        self.send_json(self.client.get(self.url(&format!("/api/users/{user_id}"))))
            .await
    }
}

async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = truncate_error_detail(&extract_error_detail(&body), MAX_DETAIL_CHARS);
    Err(ChatError::Api {
        status: status.as_u16(),
        detail,
    })
}

/// Pull a human-readable message out of an error body.
///
/// FastAPI uses `{"detail": "..."}`; validation errors put a list there.
pub fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        match value.get("detail") {
            Some(serde_json::Value::String(msg)) => return msg.clone(),
            Some(serde_json::Value::Array(items)) => {
                let msgs: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .collect();
                if !msgs.is_empty() {
                    return msgs.join("; ");
                }
            }
            _ => {}
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        // JSON, but nothing we recognise
        return String::new();
    }

    trimmed.to_string()
}

fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }

    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}

fn map_reqwest_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Http(format!("timeout: {e}"))
    } else if e.is_connect() {
        ChatError::Http(format!("network: {e}"))
    } else {
        ChatError::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fastapi_detail() {
        assert_eq!(
            extract_error_detail(r#"{"detail":"Not authenticated"}"#),
            "Not authenticated"
        );
        assert_eq!(
            extract_error_detail(
                r#"{"detail":[{"loc":["body","title"],"msg":"field required"}]}"#
            ),
            "field required"
        );
    }

    #[test]
    fn test_extract_other_shapes() {
        assert_eq!(extract_error_detail(r#"{"message":"nope"}"#), "nope");
        assert_eq!(extract_error_detail(r#"{"error":{"message":"bad"}}"#), "bad");
        assert_eq!(extract_error_detail(r#"{"status":"x"}"#), "");
        assert_eq!(extract_error_detail("Internal Server Error"), "Internal Server Error");
        assert_eq!(extract_error_detail("   "), "");
    }

    #[test]
    fn test_truncate_error_detail() {
        let long = "x".repeat(600);
        let truncated = truncate_error_detail(&long, MAX_DETAIL_CHARS);
        assert!(truncated.ends_with("... [truncated]"));
        assert_eq!(truncate_error_detail("short", 10), "short");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ApiClient::new("http://localhost:8000/");
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert_eq!(client.url("/api/tickets/"), "http://localhost:8000/api/tickets/");
    }
}
