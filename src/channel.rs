//! Real-time channel for the active ticket
//!
//! One [`ChatChannel`] owns at most one WebSocket connection, bound to a
//! ticket id and bearer token. State moves `Idle → Connecting → Open →
//! Closed`; `Closed` can be reached from anywhere and goes back to `Idle`
//! before the next connect. There is no reconnect: a dropped connection
//! shows up as `Closed` with a fault and stays there.

use crate::models::{Ticket, TicketId, UserId};
use crate::protocol::{self, InboundMessage};
use crate::{ChatError, Result};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

/// Connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    /// `fault` is set when the transport failed or the server hung up,
    /// and left empty for a local `close()`.
    Closed { fault: Option<String> },
}

impl ChannelState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Idle, Connecting) | (Connecting, Open) | (_, Closed { .. }) | (Closed { .. }, Idle)
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    /// Connecting or open.
    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }

    pub fn fault(&self) -> Option<&str> {
        match self {
            ChannelState::Closed { fault } => fault.as_deref(),
            _ => None,
        }
    }
}

/// Callback for decoded inbound messages
pub type MessageHandler = Box<dyn FnMut(InboundMessage) + Send>;

/// State shared between the channel and its I/O task
struct Shared {
    state: watch::Sender<ChannelState>,
    handler: Mutex<Option<MessageHandler>>,
    /// Bumped on every connect and close; an I/O task only acts while its
    /// generation is current.
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, next: ChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                debug!("Channel state {:?} -> {:?}", current, next);
                *current = next;
                true
            } else {
                warn!("Ignoring channel transition {:?} -> {:?}", current, next);
                false
            }
        })
    }

    /// Apply a transition requested by the I/O task of `generation`.
    fn transition(&self, generation: u64, next: ChannelState) -> bool {
        self.is_current(generation) && self.set_state(next)
    }

    fn dispatch(&self, message: InboundMessage) {
        if let Some(handler) = lock(&self.handler).as_mut() {
            handler(message);
        } else {
            debug!("No handler registered, dropping message from {}", message.sender_id);
        }
    }
}

/// A live (or pending) connection
struct Link {
    ticket_id: TicketId,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Connection manager for the active ticket's channel.
pub struct ChatChannel {
    base_url: String,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
}

impl ChatChannel {
    /// `base_url` is the ws:// or wss:// root of the chat server.
    pub fn new(base_url: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            base_url: base_url.into(),
            shared: Arc::new(Shared {
                state,
                handler: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            link: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.borrow().clone()
    }

    /// Watch state transitions (open, remote close, transport faults).
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Ticket of the current connection, if any.
    pub fn ticket_id(&self) -> Option<TicketId> {
        lock(&self.link).as_ref().map(|link| link.ticket_id)
    }

    /// Open the channel for `ticket` and wait for the handshake.
    ///
    /// Refused before any network I/O when `user_id` is neither the creator
    /// nor the assignee. A no-op when the same ticket is already connecting
    /// or open; any other connection is closed first. The registered
    /// handler is kept across a superseding connect.
    pub async fn connect(&self, ticket: &Ticket, user_id: UserId, token: &str) -> Result<()> {
        if !ticket.is_participant(user_id) {
            warn!("User {} is not a participant in ticket {}", user_id, ticket.id);
            return Err(ChatError::NotParticipant {
                ticket_id: ticket.id,
                user_id,
            });
        }

        if self.ticket_id() == Some(ticket.id) && self.state().is_live() {
            debug!("Channel for ticket {} already live", ticket.id);
            return Ok(());
        }

        let url = channel_url(&self.base_url, ticket.id, token)?;
        self.release();

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(self.state(), ChannelState::Closed { .. }) {
            self.shared.set_state(ChannelState::Idle);
        }
        self.shared.set_state(ChannelState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        info!("Connecting channel for ticket {}", ticket.id);
        let task = tokio::spawn(run_link(
            self.shared.clone(),
            generation,
            url,
            outbound_rx,
            ready_tx,
        ));
        *lock(&self.link) = Some(Link {
            ticket_id: ticket.id,
            outbound: outbound_tx,
            task,
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fault)) => Err(ChatError::Transport(fault)),
            // The task went away without answering: closed or superseded meanwhile
            Err(_) => Err(ChatError::Superseded(ticket.id)),
        }
    }

    /// Send chat text. Only valid while `Open`; nothing is queued.
    pub fn send(&self, text: &str) -> Result<()> {
        let payload = protocol::encode_outbound(text).ok_or(ChatError::EmptyMessage)?;
        if !self.state().is_open() {
            return Err(ChatError::ChannelNotOpen);
        }

        let link = lock(&self.link);
        let link = link.as_ref().ok_or(ChatError::ChannelNotOpen)?;
        link.outbound
            .send(payload)
            .map_err(|_| ChatError::ChannelNotOpen)
    }

    /// Register the message handler, replacing any previous one.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        *lock(&self.shared.handler) = Some(Box::new(handler));
    }

    /// Close the channel and drop the handler. Idempotent.
    pub fn close(&self) {
        self.release();
        *lock(&self.shared.handler) = None;
    }

    /// Tear down the current connection without touching the handler.
    fn release(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let state = self.state();

        if let Some(link) = lock(&self.link).take() {
            if state == ChannelState::Connecting {
                link.task.abort();
            }
            // Dropping the sender makes an open link send a close frame and exit
            info!("Closing channel for ticket {}", link.ticket_id);
        }

        if !matches!(state, ChannelState::Closed { .. }) {
            self.shared.set_state(ChannelState::Closed { fault: None });
        }
    }
}

impl Drop for ChatChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// `<base>/ws/ticket/<id>?token=<token>`
pub fn channel_url(base_url: &str, ticket_id: TicketId, token: &str) -> Result<Url> {
    let raw = format!("{}/ws/ticket/{}", base_url.trim_end_matches('/'), ticket_id);
    let mut url =
        Url::parse(&raw).map_err(|e| ChatError::Config(format!("invalid channel URL {raw}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ChatError::Config(format!(
            "channel URL must be ws:// or wss://, got {}",
            url.scheme()
        )));
    }
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

async fn run_link(
    shared: Arc<Shared>,
    generation: u64,
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<String>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let fault = e.to_string();
            warn!("Channel handshake failed: {}", fault);
            shared.transition(generation, ChannelState::Closed {
                fault: Some(fault.clone()),
            });
            let _ = ready.send(Err(fault));
            return;
        }
    };

    if !shared.transition(generation, ChannelState::Open) {
        debug!("Dropping superseded channel handshake");
        let _ = stream.close(None).await;
        return;
    }
    info!("Channel open");
    let _ = ready.send(Ok(()));

    let (mut sink, mut frames) = stream.split();

    let fault = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if !shared.is_current(generation) {
                        break None;
                    }
                    match protocol::decode_frame(&text) {
                        Ok(message) => shared.dispatch(message),
                        Err(e) => warn!("Dropping malformed frame {:?}: {}", text, e),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Channel closed by server");
                    break Some("connection closed by server".to_string());
                }
                Some(Ok(_)) => {} // Binary/Ping/Pong
                Some(Err(e)) => {
                    warn!("Channel error: {}", e);
                    break Some(e.to_string());
                }
            },
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        warn!("Channel send failed: {}", e);
                        break Some(e.to_string());
                    }
                }
                // Closed locally
                None => break None,
            },
        }
    };

    // Ended from this side (closed or superseded): tell the server
    if fault.is_none() {
        let _ = sink.send(WsMessage::Close(None)).await;
    }
    shared.transition(generation, ChannelState::Closed { fault });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TicketStatus;

    fn ticket(id: TicketId) -> Ticket {
        Ticket {
            id,
            title: "VPN".to_string(),
            description: "Drops hourly".to_string(),
            priority: "NORMAL".to_string(),
            status: TicketStatus::Open,
            creator_id: 1,
            assignee_id: Some(2),
            is_active: true,
        }
    }

    #[test]
    fn test_state_transitions() {
        use ChannelState::*;
        let closed = Closed { fault: None };
        assert!(Idle.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&Open));
        assert!(Connecting.can_transition_to(&closed));
        assert!(Open.can_transition_to(&closed));
        assert!(Idle.can_transition_to(&closed));
        assert!(closed.can_transition_to(&Idle));

        assert!(!Idle.can_transition_to(&Open));
        assert!(!Open.can_transition_to(&Connecting));
        assert!(!closed.can_transition_to(&Open));
        assert!(!closed.can_transition_to(&Connecting));
    }

    #[test]
    fn test_channel_url() {
        let url = channel_url("ws://10.0.2.2:8000/", 12, "abc.def").unwrap();
        assert_eq!(url.as_str(), "ws://10.0.2.2:8000/ws/ticket/12?token=abc.def");
        assert!(channel_url("http://host", 1, "t").is_err());
    }

    #[tokio::test]
    async fn test_non_participant_never_connects() {
        let channel = ChatChannel::new("ws://127.0.0.1:9");
        let err = channel.connect(&ticket(5), 99, "token").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::NotParticipant {
                ticket_id: 5,
                user_id: 99
            }
        ));
        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(channel.ticket_id(), None);
    }

    #[tokio::test]
    async fn test_send_requires_open_channel() {
        let channel = ChatChannel::new("ws://127.0.0.1:9");
        assert!(matches!(channel.send("hello"), Err(ChatError::ChannelNotOpen)));
        assert!(matches!(channel.send("   "), Err(ChatError::EmptyMessage)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let channel = ChatChannel::new("ws://127.0.0.1:9");
        channel.on_message(|_| {});
        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed { fault: None });
        assert!(lock(&channel.shared.handler).is_none());
    }

    #[tokio::test]
    async fn test_refused_handshake_closes_with_fault() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let channel = ChatChannel::new(format!("ws://127.0.0.1:{port}"));
        let err = channel.connect(&ticket(5), 1, "token").await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
        assert!(channel.state().fault().is_some());
    }
}
