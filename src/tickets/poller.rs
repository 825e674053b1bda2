//! Background refresh of the ticket list

use super::cache::TicketCache;
use crate::api::SupportBackend;
use crate::models::Ticket;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Refreshes a shared [`TicketCache`] from the backend.
pub struct TicketPoller {
    backend: Arc<dyn SupportBackend>,
    cache: Arc<RwLock<TicketCache>>,
    interval: Duration,
}

impl TicketPoller {
    pub fn new(backend: Arc<dyn SupportBackend>, cache: Arc<RwLock<TicketCache>>) -> Self {
        Self {
            backend,
            cache,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fetch the list once and replace the cache with it. On failure, or
    /// when the cache changed while the list was in flight, the cache keeps
    /// what it has.
    pub async fn refresh_once(&self) -> Result<usize> {
        refresh(self.backend.as_ref(), &self.cache).await
    }

    /// Start polling. The first refresh runs immediately.
    pub fn spawn(self) -> PollerHandle {
        let wake = Arc::new(Notify::new());
        let (updates_tx, updates_rx) = watch::channel(0u64);
        let task_wake = Arc::clone(&wake);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_wake.notified() => {
                        debug!("Ticket refresh requested");
                        ticker.reset();
                    }
                }

                match self.refresh_once().await {
                    Ok(_) => updates_tx.send_modify(|n| *n = n.wrapping_add(1)),
                    Err(e) => warn!("Ticket refresh failed, keeping cached list: {}", e),
                }
            }
        });

        PollerHandle {
            wake,
            updates: updates_rx,
            task: Some(task),
        }
    }
}

/// Owns the polling task; dropping it stops polling.
pub struct PollerHandle {
    wake: Arc<Notify>,
    updates: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Refresh now instead of waiting for the next tick.
    pub fn refresh_now(&self) {
        self.wake.notify_one();
    }

    /// Counter bumped after every successful refresh.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.clone()
    }

    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Stopping ticket poller");
            task.abort();
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

pub(crate) async fn refresh(
    backend: &dyn SupportBackend,
    cache: &RwLock<TicketCache>,
) -> Result<usize> {
    let revision = cache.read().await.revision();
    let records = backend.list_tickets().await?;
    let tickets: Vec<Ticket> = records.into_iter().map(Ticket::from).collect();
    let count = tickets.len();
    if cache.write().await.replace_if_unchanged(revision, tickets).await {
        debug!("Refreshed {} tickets", count);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MessageRecord, NewMessage, NewTicket, TicketId, TicketRecord, TicketStatus, UserId,
        UserRecord,
    };
    use crate::ChatError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl SupportBackend for CountingBackend {
        async fn list_tickets(&self) -> Result<Vec<TicketRecord>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(ChatError::Http("network: unreachable".to_string()));
            }
            Ok((1..=n)
                .map(|id| TicketRecord {
                    id,
                    title: format!("Ticket {id}"),
                    description: String::new(),
                    priority: "NORMAL".to_string(),
                    status: TicketStatus::Closed,
                    creator_id: 1,
                    assignee_id: None,
                })
                .collect())
        }

        async fn get_ticket(&self, ticket_id: TicketId) -> Result<TicketRecord> {
            Err(ChatError::UnknownTicket(ticket_id))
        }

        async fn create_ticket(&self, _ticket: &NewTicket) -> Result<TicketRecord> {
            unreachable!()
        }

        async fn update_ticket_status(
            &self,
            ticket_id: TicketId,
            _status: TicketStatus,
        ) -> Result<TicketRecord> {
            Err(ChatError::UnknownTicket(ticket_id))
        }

        async fn list_messages(&self, _ticket_id: TicketId) -> Result<Vec<MessageRecord>> {
            Ok(Vec::new())
        }

        async fn create_message(&self, _message: &NewMessage) -> Result<MessageRecord> {
            unreachable!()
        }

        async fn get_user(&self, user_id: UserId) -> Result<UserRecord> {
            Err(ChatError::Api {
                status: 404,
                detail: format!("user {user_id}"),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_cache() {
        let backend = Arc::new(CountingBackend::default());
        let cache = Arc::new(RwLock::new(TicketCache::new()));
        let poller = TicketPoller::new(backend.clone(), cache.clone());

        assert_eq!(poller.refresh_once().await.unwrap(), 1);
        backend.failing.store(true, Ordering::SeqCst);
        assert!(poller.refresh_once().await.is_err());
        assert_eq!(cache.read().await.tickets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_and_on_demand() {
        let backend = Arc::new(CountingBackend::default());
        let cache = Arc::new(RwLock::new(TicketCache::new()));
        let handle = TicketPoller::new(backend.clone(), cache.clone())
            .with_interval(Duration::from_secs(5))
            .spawn();
        let mut updates = handle.subscribe();

        // Immediate first tick
        updates.changed().await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        updates.changed().await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        handle.refresh_now();
        updates.changed().await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.read().await.tickets().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let backend = Arc::new(CountingBackend::default());
        let cache = Arc::new(RwLock::new(TicketCache::new()));
        let handle = TicketPoller::new(backend.clone(), cache)
            .with_interval(Duration::from_secs(5))
            .spawn();
        let mut updates = handle.subscribe();
        updates.changed().await.unwrap();

        drop(handle);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
