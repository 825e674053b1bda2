//! The conversation for the active ticket.
//!
//! A [`ChatSession`] owns the channel, the message log and the participant
//! directory. Activating a ticket starts a new log epoch, so anything still
//! in flight for the previous ticket (history, live frames) is dropped
//! when it lands.

use super::log::{Epoch, MessageLog};
use super::participants::{ParticipantDirectory, ParticipantInfo};
use super::projector::{self, ProjectedItem};
use crate::api::SupportBackend;
use crate::auth::Credentials;
use crate::channel::{ChannelState, ChatChannel};
use crate::models::{Message, MessageRecord, NewMessage, Ticket, TicketId, UserId};
use crate::protocol::InboundMessage;
use crate::{ChatError, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ChatSession {
    backend: Arc<dyn SupportBackend>,
    ws_url: String,
    /// Replaced on every activation
    channel: ChatChannel,
    credentials: Credentials,
    log: Arc<Mutex<MessageLog>>,
    participants: Arc<Mutex<ParticipantDirectory>>,
    /// Bumped on every visible change to the log or the directory
    changes: Arc<watch::Sender<u64>>,
    ticket: Option<Ticket>,
    epoch: Option<Epoch>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn SupportBackend>,
        ws_url: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        let ws_url: String = ws_url.into();
        Self {
            backend,
            channel: ChatChannel::new(ws_url.clone()),
            ws_url,
            credentials,
            log: Arc::new(Mutex::new(MessageLog::new())),
            participants: Arc::new(Mutex::new(ParticipantDirectory::new())),
            changes: Arc::new(changes),
            ticket: None,
            epoch: None,
        }
    }

    /// Open `ticket_id`: load its detail, participants and history, and
    /// connect the live channel when the ticket is still open.
    ///
    /// History and channel failures leave the session usable (the log keeps
    /// whatever arrived); the first failure is returned.
    pub async fn activate(&mut self, ticket_id: TicketId) -> Result<()> {
        self.deactivate();
        self.channel = ChatChannel::new(self.ws_url.clone());

        let epoch = {
            let mut log = lock(&self.log);
            let epoch = log.begin(ticket_id);
            log.set_loading(true);
            epoch
        };
        self.epoch = Some(epoch);
        notify(&self.changes);

        let user_id = self.credentials.user_id;
        let ticket: Ticket = match self.backend.get_ticket(ticket_id).await {
            Ok(record) => record.into(),
            Err(e) => {
                warn!("Failed to load ticket {}: {}", ticket_id, e);
                self.finish_loading(epoch);
                return Err(e);
            }
        };
        if !ticket.is_participant(user_id) {
            self.finish_loading(epoch);
            return Err(ChatError::NotParticipant { ticket_id, user_id });
        }

        info!("Activating ticket {} ({})", ticket.id, ticket.title);
        self.channel.on_message(live_handler(
            Arc::clone(&self.log),
            Arc::clone(&self.changes),
            epoch,
            ticket.clone(),
            user_id,
        ));

        // Frames can only arrive once the connect below starts
        let mark = lock(&self.log).begin_fetch(epoch);
        let this = &*self;
        let (_, history, connected) = tokio::join!(
            this.load_participants(&ticket),
            this.backend.list_messages(ticket_id),
            async {
                if ticket.is_open() {
                    this.channel
                        .connect(&ticket, user_id, &this.credentials.token)
                        .await
                } else {
                    debug!("Ticket {} is closed, history only", ticket_id);
                    Ok(())
                }
            },
        );
        self.ticket = Some(ticket);

        let history = match history {
            Ok(records) => Ok(self.accept_history(records)),
            Err(e) => {
                warn!("Failed to load history for ticket {}: {}", ticket_id, e);
                Err(e)
            }
        };

        {
            let mut log = lock(&self.log);
            match (mark, &history) {
                (Some(mark), Ok(messages)) => {
                    if log.install(mark, messages.clone()) {
                        debug!("Installed {} messages for ticket {}", messages.len(), ticket_id);
                    }
                }
                (Some(mark), Err(_)) => log.abandon_fetch(mark),
                (None, _) => {}
            }
            if log.is_current(epoch) {
                log.set_loading(false);
            }
        }
        notify(&self.changes);

        history?;
        connected
    }

    /// Re-fetch history for the active ticket and install it over the log.
    pub async fn refresh_history(&self) -> Result<()> {
        let (epoch, ticket_id) = match (self.epoch, &self.ticket) {
            (Some(epoch), Some(ticket)) => (epoch, ticket.id),
            _ => return Err(ChatError::NoActiveTicket),
        };

        let mark = lock(&self.log)
            .begin_fetch(epoch)
            .ok_or(ChatError::Superseded(ticket_id))?;
        let records = match self.backend.list_messages(ticket_id).await {
            Ok(records) => records,
            Err(e) => {
                lock(&self.log).abandon_fetch(mark);
                return Err(e);
            }
        };
        let messages = self.accept_history(records);
        if lock(&self.log).install(mark, messages) {
            notify(&self.changes);
        }
        Ok(())
    }

    /// Close the channel and empty the log.
    pub fn deactivate(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            info!("Deactivating ticket {}", ticket.id);
        }
        self.channel.close();
        lock(&self.log).clear();
        self.epoch = None;
        notify(&self.changes);
    }

    /// Send chat text over the live channel.
    pub fn send(&self, text: &str) -> Result<()> {
        if self.ticket.is_none() {
            return Err(ChatError::NoActiveTicket);
        }
        self.channel.send(text)
    }

    /// Store chat text over REST, for when the live channel is down or the
    /// ticket is closed. The stored message is appended to the log.
    pub async fn send_via_rest(&self, text: &str) -> Result<Message> {
        let (epoch, ticket) = match (self.epoch, &self.ticket) {
            (Some(epoch), Some(ticket)) => (epoch, ticket),
            _ => return Err(ChatError::NoActiveTicket),
        };
        let content = text.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let user_id = self.credentials.user_id;
        let receiver_id = ticket
            .counterpart(user_id)
            .ok_or(ChatError::NoRecipient(ticket.id))?;

        let body = NewMessage {
            ticket_id: ticket.id,
            content: content.to_string(),
            receiver_id,
        };
        let record = self.backend.create_message(&body).await?;
        debug!("Stored message {} for ticket {} over REST", record.id, ticket.id);

        let message = Message::from_record(record, user_id);
        if lock(&self.log).append(epoch, message.clone()) {
            notify(&self.changes);
        }
        Ok(message)
    }

    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    pub fn user_id(&self) -> UserId {
        self.credentials.user_id
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn subscribe_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.subscribe()
    }

    /// Change counter; wakes whenever [`view`](Self::view) would differ.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.log).is_loading()
    }

    pub fn messages(&self) -> Arc<Vec<Message>> {
        lock(&self.log).snapshot()
    }

    /// Display name and avatar colour of a participant, when loaded.
    pub fn participant(&self, user_id: UserId) -> Option<ParticipantInfo> {
        lock(&self.participants).get(user_id).cloned()
    }

    /// The log projected for display.
    pub fn view(&self) -> Vec<ProjectedItem> {
        self.view_versioned().1
    }

    /// [`view`](Self::view) together with the log's replacement count.
    /// When the count moves the items are not an extension of the previous
    /// view and must be rendered from the start.
    pub fn view_versioned(&self) -> (u64, Vec<ProjectedItem>) {
        let (replacements, messages) = {
            let log = lock(&self.log);
            (log.replacements(), log.snapshot())
        };
        let participants = lock(&self.participants);
        (replacements, projector::project(&messages, &participants))
    }

    async fn load_participants(&self, ticket: &Ticket) {
        let ids = std::iter::once(ticket.creator_id).chain(ticket.assignee_id);
        for user_id in ids {
            if lock(&self.participants).name_of(user_id).is_some() {
                continue;
            }
            match self.backend.get_user(user_id).await {
                Ok(user) => {
                    let changed = {
                        let mut participants = lock(&self.participants);
                        let before = participants.revision();
                        participants.insert(user_id, user.name);
                        participants.revision() != before
                    };
                    if changed {
                        notify(&self.changes);
                    }
                }
                Err(e) => warn!("Failed to load user {}: {}", user_id, e),
            }
        }
    }

    fn accept_history(&self, records: Vec<MessageRecord>) -> Vec<Message> {
        let Some(ticket) = self.ticket.as_ref() else {
            return Vec::new();
        };
        records
            .into_iter()
            .filter(|record| {
                let ok = ticket.is_participant(record.sender_id);
                if !ok {
                    warn!(
                        "Dropping message {} from non-participant {} in ticket {}",
                        record.id, record.sender_id, ticket.id
                    );
                }
                ok
            })
            .map(|record| Message::from_record(record, self.credentials.user_id))
            .collect()
    }

    fn finish_loading(&self, epoch: Epoch) {
        let mut log = lock(&self.log);
        if log.is_current(epoch) {
            log.set_loading(false);
        }
        drop(log);
        notify(&self.changes);
    }
}

/// Handler for frames of one activation. Frames from anyone but the
/// ticket's creator or assignee are dropped.
fn live_handler(
    log: Arc<Mutex<MessageLog>>,
    changes: Arc<watch::Sender<u64>>,
    epoch: Epoch,
    ticket: Ticket,
    user_id: UserId,
) -> impl FnMut(InboundMessage) + Send + 'static {
    move |inbound: InboundMessage| {
        if !ticket.is_participant(inbound.sender_id) {
            warn!(
                "Dropping live message from non-participant {} in ticket {}",
                inbound.sender_id, ticket.id
            );
            return;
        }

        let mut log = lock(&log);
        let id = log.next_live_id(epoch);
        let message = Message {
            id,
            content: inbound.content,
            sender_id: inbound.sender_id,
            timestamp: inbound.timestamp,
            is_user: inbound.sender_id == user_id,
            sender_name: inbound.sender_name,
        };
        if log.append(epoch, message) {
            drop(log);
            notify(&changes);
        }
    }
}

fn notify(changes: &watch::Sender<u64>) {
    changes.send_modify(|n| *n = n.wrapping_add(1));
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::participants::color_for;
    use crate::models::{NewTicket, TicketRecord, TicketStatus, UserRecord};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FakeBackend {
        ticket: TicketRecord,
        history: Mutex<Vec<MessageRecord>>,
        /// Bodies posted to `create_message`
        posted: Mutex<Vec<NewMessage>>,
    }

    #[async_trait]
    impl SupportBackend for FakeBackend {
        async fn list_tickets(&self) -> Result<Vec<TicketRecord>> {
            Ok(vec![self.ticket.clone()])
        }

        async fn get_ticket(&self, ticket_id: TicketId) -> Result<TicketRecord> {
            if ticket_id == self.ticket.id {
                Ok(self.ticket.clone())
            } else {
                Err(ChatError::Api {
                    status: 404,
                    detail: "Ticket not found".to_string(),
                })
            }
        }

        async fn create_ticket(&self, _ticket: &NewTicket) -> Result<TicketRecord> {
            unreachable!("not used by the session")
        }

        async fn update_ticket_status(
            &self,
            _ticket_id: TicketId,
            _status: TicketStatus,
        ) -> Result<TicketRecord> {
            unreachable!("not used by the session")
        }

        async fn list_messages(&self, _ticket_id: TicketId) -> Result<Vec<MessageRecord>> {
            Ok(lock(&self.history).clone())
        }

        async fn create_message(&self, message: &NewMessage) -> Result<MessageRecord> {
            let mut posted = lock(&self.posted);
            posted.push(message.clone());
            Ok(MessageRecord {
                id: 100 + posted.len() as i64,
                ticket_id: message.ticket_id,
                sender_id: 1,
                receiver_id: Some(message.receiver_id),
                content: message.content.clone(),
                timestamp: Some("2024-03-06T10:20:00".to_string()),
                sender_name: None,
            })
        }

        async fn get_user(&self, user_id: UserId) -> Result<UserRecord> {
            Ok(UserRecord {
                id: user_id,
                name: format!("User {user_id}"),
                email: format!("u{user_id}@example.com"),
                role: "user".to_string(),
                avatar: None,
                created_at: None,
            })
        }
    }

    fn fake(status: TicketStatus, history: Vec<MessageRecord>) -> FakeBackend {
        FakeBackend {
            ticket: ticket_record(status),
            history: Mutex::new(history),
            posted: Mutex::new(Vec::new()),
        }
    }

    fn ticket_record(status: TicketStatus) -> TicketRecord {
        TicketRecord {
            id: 7,
            title: "Laptop".to_string(),
            description: "Won't boot".to_string(),
            priority: "NORMAL".to_string(),
            status,
            creator_id: 1,
            assignee_id: Some(2),
        }
    }

    fn record(id: i64, sender_id: UserId, content: &str) -> MessageRecord {
        MessageRecord {
            id,
            ticket_id: 7,
            sender_id,
            receiver_id: None,
            content: content.to_string(),
            timestamp: Some("09:00".to_string()),
            sender_name: None,
        }
    }

    fn session(backend: impl Into<Arc<FakeBackend>>, user_id: UserId) -> ChatSession {
        let backend: Arc<FakeBackend> = backend.into();
        ChatSession::new(
            backend,
            "ws://127.0.0.1:9",
            Credentials {
                token: "token".to_string(),
                user_id,
            },
        )
    }

    fn inbound(sender_id: UserId, content: &str) -> InboundMessage {
        InboundMessage {
            sender_id,
            content: content.to_string(),
            timestamp: "09:05".to_string(),
            sender_name: String::new(),
        }
    }

    #[tokio::test]
    async fn test_activate_closed_ticket_loads_history_only() {
        let backend = fake(
            TicketStatus::Closed,
            vec![record(1, 1, "hi"), record(2, 9, "spam"), record(3, 2, "hello")],
        );
        let mut session = session(backend, 1);
        session.activate(7).await.unwrap();

        let contents: Vec<String> = session.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["hi", "hello"]);
        assert!(session.messages()[0].is_user);
        assert!(!session.is_loading());
        assert!(!session.channel_state().is_live());
        let agent = session.participant(2).unwrap();
        assert_eq!(agent.name, "User 2");
        assert_eq!(agent.color.as_deref(), Some(color_for(2)));
        assert!(matches!(session.send("hi"), Err(ChatError::ChannelNotOpen)));
    }

    #[tokio::test]
    async fn test_view_fills_names_and_clusters() {
        let backend = fake(
            TicketStatus::Closed,
            vec![record(1, 2, "a"), record(2, 2, "b"), record(3, 1, "c")],
        );
        let mut session = session(backend, 1);
        session.activate(7).await.unwrap();

        let view = session.view();
        assert_eq!(view.len(), 4);
        assert!(view[0].is_date());
        match &view[1] {
            ProjectedItem::Message {
                message,
                is_last_in_cluster,
            } => {
                assert_eq!(message.sender_name, "User 2");
                assert!(!is_last_in_cluster);
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_participant_cannot_activate() {
        let backend = fake(TicketStatus::Open, vec![record(1, 1, "hi")]);
        let mut session = session(backend, 42);
        let err = session.activate(7).await.unwrap_err();
        assert!(matches!(err, ChatError::NotParticipant { ticket_id: 7, user_id: 42 }));
        assert!(session.messages().is_empty());
        assert!(!session.is_loading());
        assert!(session.ticket().is_none());
    }

    #[tokio::test]
    async fn test_unknown_ticket_reports_api_error() {
        let backend = fake(TicketStatus::Open, Vec::new());
        let mut session = session(backend, 1);
        let err = session.activate(8).await.unwrap_err();
        assert_eq!(err.user_message("Failed to load ticket"), "Ticket not found");
    }

    #[test]
    fn test_live_handler_respects_epoch_and_participants() {
        let log = Arc::new(Mutex::new(MessageLog::new()));
        let (changes, rx) = watch::channel(0);
        let changes = Arc::new(changes);
        let old = lock(&log).begin(7);
        let current = lock(&log).begin(7);
        let ticket: Ticket = ticket_record(TicketStatus::Open).into();

        let mut stale = live_handler(log.clone(), changes.clone(), old, ticket.clone(), 1);
        let mut live = live_handler(log.clone(), changes.clone(), current, ticket, 1);

        stale(inbound(2, "late"));
        live(inbound(9, "intruder"));
        live(inbound(2, "first"));
        live(inbound(1, "second"));

        let messages = lock(&log).snapshot();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert!(!messages[0].is_user);
        assert!(messages[1].is_user);
        assert_ne!(messages[0].id, messages[1].id);
        assert_eq!(*rx.borrow(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_clears_everything() {
        let backend = fake(TicketStatus::Closed, vec![record(1, 1, "hi")]);
        let mut session = session(backend, 1);
        session.activate(7).await.unwrap();
        let mut updates = session.updates();
        let _ = updates.borrow_and_update();

        session.deactivate();
        assert!(session.messages().is_empty());
        assert!(session.ticket().is_none());
        assert!(updates.has_changed().unwrap());
        assert!(matches!(session.send("x"), Err(ChatError::NoActiveTicket)));
        assert!(matches!(
            session.refresh_history().await,
            Err(ChatError::NoActiveTicket)
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_one_copy_of_live_message() {
        let backend = Arc::new(fake(TicketStatus::Closed, vec![record(1, 1, "hello")]));
        let mut session = session(backend.clone(), 1);
        session.activate(7).await.unwrap();

        let epoch = session.epoch.unwrap();
        let mut live = live_handler(
            session.log.clone(),
            session.changes.clone(),
            epoch,
            session.ticket().cloned().unwrap(),
            1,
        );
        live(InboundMessage {
            sender_id: 2,
            content: "on my way".to_string(),
            timestamp: "10:15 AM".to_string(),
            sender_name: String::new(),
        });
        let (before, _) = session.view_versioned();

        let mut stored = record(2, 2, "on my way");
        stored.timestamp = Some("2024-03-06T10:15:00".to_string());
        lock(&backend.history).push(stored);
        session.refresh_history().await.unwrap();

        let contents: Vec<String> = session.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["hello", "on my way"]);
        let (after, _) = session.view_versioned();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_send_via_rest_posts_to_counterpart() {
        let backend = Arc::new(fake(TicketStatus::Closed, vec![record(1, 2, "anything else?")]));
        let mut session = session(backend.clone(), 1);
        session.activate(7).await.unwrap();

        let stored = session.send_via_rest("  all good, thanks  ").await.unwrap();
        assert!(stored.is_user);
        assert_eq!(stored.id, "101");

        let posted = lock(&backend.posted).clone();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].ticket_id, 7);
        assert_eq!(posted[0].receiver_id, 2);
        assert_eq!(posted[0].content, "all good, thanks");

        let contents: Vec<String> = session.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["anything else?", "all good, thanks"]);
        assert!(matches!(
            session.send_via_rest("   ").await,
            Err(ChatError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn test_send_via_rest_needs_an_assignee() {
        let mut backend = fake(TicketStatus::Open, Vec::new());
        backend.ticket.assignee_id = None;
        backend.ticket.status = TicketStatus::Closed;
        let backend = Arc::new(backend);
        let mut session = session(backend.clone(), 1);
        session.activate(7).await.unwrap();

        let err = session.send_via_rest("hello?").await.unwrap_err();
        assert!(matches!(err, ChatError::NoRecipient(7)));
        assert!(lock(&backend.posted).is_empty());
    }
}
