//! Application facade.
//!
//! `SupportClient` ties the REST client, the persisted state, the ticket
//! cache and the chat session together behind the operations a front end
//! needs: sign in and out, list/create/close tickets, open a ticket's chat.

use crate::api::{ApiClient, SupportBackend};
use crate::auth::Credentials;
use crate::conversation::ChatSession;
use crate::models::{NewTicket, Registration, Ticket, TicketId, TicketStatus, UserId, UserRecord};
use crate::storage::LocalStore;
use crate::tickets::{self, PollerHandle, TicketCache, TicketPoller};
use crate::{ChatError, Result, SupportChatConfig};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct SupportClient {
    config: SupportChatConfig,
    api: ApiClient,
    backend: Arc<dyn SupportBackend>,
    store: LocalStore,
    cache: Arc<RwLock<TicketCache>>,
    credentials: Option<Credentials>,
    session: Option<ChatSession>,
}

impl SupportClient {
    /// Client talking to `config.api_url`. Restores stored credentials and
    /// the cached ticket list.
    pub async fn new(config: SupportChatConfig) -> Result<Self> {
        let api = ApiClient::new(config.api_url.clone());
        let backend: Arc<dyn SupportBackend> = Arc::new(api.clone());
        Self::with_backend(config, api, backend).await
    }

    /// Like [`new`](Self::new) with ticket, message and user calls routed to
    /// `backend`. `api` still serves the auth endpoints.
    pub async fn with_backend(
        config: SupportChatConfig,
        api: ApiClient,
        backend: Arc<dyn SupportBackend>,
    ) -> Result<Self> {
        let store = LocalStore::new(config.data_dir()).await?;
        let cache = TicketCache::load(store.clone()).await?;
        let credentials = store.load_credentials().await?;

        if let Some(creds) = &credentials {
            info!("Restored session for user {}", creds.user_id);
            api.set_token(Some(creds.token.clone())).await;
        }

        Ok(Self {
            config,
            api,
            backend,
            store,
            cache: Arc::new(RwLock::new(cache)),
            credentials,
            session: None,
        })
    }

    pub fn config(&self) -> &SupportChatConfig {
        &self.config
    }

    pub fn is_signed_in(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.credentials.as_ref().map(|c| c.user_id)
    }

    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        role: &str,
    ) -> Result<UserRecord> {
        let registration = Registration {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            role: role.to_string(),
        };
        self.api.register(&registration).await
    }

    /// Sign in and remember the token and user id.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<UserId> {
        let response = self.api.login(email, password).await?;
        let credentials = Credentials::from_token(response.access_token)?;
        self.store.save_credentials(&credentials).await?;
        self.api.set_token(Some(credentials.token.clone())).await;

        let user_id = credentials.user_id;
        self.session = None;
        self.credentials = Some(credentials);
        info!("Signed in as user {}", user_id);
        Ok(user_id)
    }

    /// Close the chat and forget credentials and tickets.
    pub async fn logout(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.deactivate();
        }
        self.cache.write().await.clear().await;
        self.store.clear().await?;
        self.api.set_token(None).await;
        self.credentials = None;
        info!("Signed out");
        Ok(())
    }

    /// Tickets as currently cached.
    pub async fn tickets(&self) -> Vec<Ticket> {
        self.cache.read().await.tickets().to_vec()
    }

    pub fn ticket_cache(&self) -> Arc<RwLock<TicketCache>> {
        Arc::clone(&self.cache)
    }

    /// Fetch the ticket list now.
    pub async fn refresh_tickets(&self) -> Result<Vec<Ticket>> {
        self.require_credentials()?;
        tickets::refresh(self.backend.as_ref(), &self.cache).await?;
        Ok(self.tickets().await)
    }

    /// Keep the ticket list fresh in the background.
    pub fn start_poller(&self) -> Result<PollerHandle> {
        self.require_credentials()?;
        Ok(
            TicketPoller::new(Arc::clone(&self.backend), Arc::clone(&self.cache))
                .with_interval(self.config.poll_interval)
                .spawn(),
        )
    }

    /// Create a ticket and make it the active one. Refused locally, without
    /// a request, while another ticket is open.
    pub async fn create_ticket(&self, ticket: NewTicket) -> Result<Ticket> {
        self.require_credentials()?;
        self.cache.read().await.ensure_can_create()?;

        let created: Ticket = self.backend.create_ticket(&ticket).await?.into();
        info!("Created ticket {} ({})", created.id, created.title);
        self.cache.write().await.insert_created(created.clone()).await;
        Ok(created)
    }

    /// Close the active open ticket.
    pub async fn close_active_ticket(&mut self) -> Result<Ticket> {
        self.require_credentials()?;
        let ticket_id = self
            .cache
            .read()
            .await
            .active()
            .filter(|t| t.is_open())
            .map(|t| t.id)
            .ok_or(ChatError::NoActiveTicket)?;

        self.backend
            .update_ticket_status(ticket_id, TicketStatus::Closed)
            .await?;
        let mut cache = self.cache.write().await;
        cache.mark_closed(ticket_id).await?;
        let closed = cache
            .get(ticket_id)
            .cloned()
            .ok_or(ChatError::UnknownTicket(ticket_id))?;
        drop(cache);

        if let Some(session) = self.session.as_mut() {
            if session.ticket().map(|t| t.id) == Some(ticket_id) {
                session.deactivate();
            }
        }
        info!("Closed ticket {}", ticket_id);
        Ok(closed)
    }

    /// Mark `ticket_id` active and open its conversation.
    pub async fn activate_ticket(&mut self, ticket_id: TicketId) -> Result<&mut ChatSession> {
        let credentials = self.require_credentials()?.clone();
        if self.cache.read().await.get(ticket_id).is_none() {
            tickets::refresh(self.backend.as_ref(), &self.cache).await?;
        }
        self.cache.write().await.activate(ticket_id).await?;

        let backend = Arc::clone(&self.backend);
        let ws_url = self.config.ws_url.clone();
        let session = self
            .session
            .get_or_insert_with(|| ChatSession::new(backend, ws_url, credentials));
        session.activate(ticket_id).await?;
        Ok(session)
    }

    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    fn require_credentials(&self) -> Result<&Credentials> {
        self.credentials.as_ref().ok_or(ChatError::NotAuthenticated)
    }
}
