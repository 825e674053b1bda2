//! Locally held ticket list.
//!
//! Holds the user's tickets plus the local "active" marker, and enforces
//! the single-open-ticket rule before anything is sent to the server.
//! Every change is written through to [`LocalStore`] so the list can be
//! shown at the next start before the first refresh lands.

use crate::models::{Ticket, TicketId, TicketStatus};
use crate::storage::LocalStore;
use crate::{ChatError, Result};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct TicketCache {
    tickets: Vec<Ticket>,
    store: Option<LocalStore>,
    /// Bumped on every change, local or from a refresh
    revision: u64,
}

impl TicketCache {
    /// In-memory cache, nothing persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache backed by `store`, seeded with what it holds.
    pub async fn load(store: LocalStore) -> Result<Self> {
        let mut tickets = store.load_tickets().await?;
        // Never trust more than one marker from disk
        let mut seen_active = false;
        for ticket in &mut tickets {
            if ticket.is_active && !seen_active {
                seen_active = true;
            } else {
                ticket.is_active = false;
            }
        }
        debug!("Seeded ticket cache with {} tickets", tickets.len());
        Ok(Self {
            tickets,
            store: Some(store),
            revision: 0,
        })
    }

    pub fn tickets(&self) -> &[Ticket] {
        &self.tickets
    }

    pub fn get(&self, ticket_id: TicketId) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == ticket_id)
    }

    pub fn active(&self) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.is_active)
    }

    /// Changes whenever the list or the active marker changes. A refresh
    /// reads it before fetching so it can tell whether its result is stale.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The first open ticket, if any.
    pub fn open_ticket(&self) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.is_open())
    }

    /// Replace the whole list with a fresh server copy. The active marker
    /// follows its ticket when that ticket is still in the list.
    pub async fn replace(&mut self, tickets: Vec<Ticket>) {
        let active_id = self.active().map(|t| t.id);
        self.tickets = tickets
            .into_iter()
            .map(|mut ticket| {
                ticket.is_active = Some(ticket.id) == active_id;
                ticket
            })
            .collect();
        self.commit().await;
    }

    /// [`replace`](Self::replace), unless the cache changed since
    /// `revision` was read. A list fetched before a local create or close
    /// would otherwise undo it. Returns whether the list was replaced.
    pub async fn replace_if_unchanged(&mut self, revision: u64, tickets: Vec<Ticket>) -> bool {
        if self.revision != revision {
            debug!(
                "Dropping ticket list fetched at revision {} (now {})",
                revision, self.revision
            );
            return false;
        }
        self.replace(tickets).await;
        true
    }

    /// Make `ticket_id` the only active ticket.
    pub async fn activate(&mut self, ticket_id: TicketId) -> Result<Vec<Ticket>> {
        if self.get(ticket_id).is_none() {
            return Err(ChatError::UnknownTicket(ticket_id));
        }
        for ticket in &mut self.tickets {
            ticket.is_active = ticket.id == ticket_id;
        }
        self.commit().await;
        Ok(self.tickets.clone())
    }

    /// Fails while any ticket is still open.
    pub fn ensure_can_create(&self) -> Result<()> {
        match self.open_ticket() {
            Some(ticket) => Err(ChatError::OpenTicketExists(ticket.id)),
            None => Ok(()),
        }
    }

    /// Put a newly created ticket at the front and make it active.
    pub async fn insert_created(&mut self, mut ticket: Ticket) {
        self.tickets.retain(|t| t.id != ticket.id);
        for existing in &mut self.tickets {
            existing.is_active = false;
        }
        ticket.is_active = true;
        self.tickets.insert(0, ticket);
        self.commit().await;
    }

    /// Record that `ticket_id` was closed. A closed ticket is never active.
    pub async fn mark_closed(&mut self, ticket_id: TicketId) -> Result<()> {
        let ticket = self
            .tickets
            .iter_mut()
            .find(|t| t.id == ticket_id)
            .ok_or(ChatError::UnknownTicket(ticket_id))?;
        ticket.status = TicketStatus::Closed;
        ticket.is_active = false;
        self.commit().await;
        Ok(())
    }

    /// Drop every ticket, in memory and on disk.
    pub async fn clear(&mut self) {
        self.tickets.clear();
        self.commit().await;
    }

    /// Record a change and write the list through to the store.
    async fn commit(&mut self) {
        self.revision += 1;
        if let Some(store) = &self.store {
            if let Err(e) = store.save_tickets(&self.tickets).await {
                warn!("Failed to persist ticket list: {}", e);
            }
        }
    }
}
