//! Ordered message log for the active conversation.
//!
//! The log is the single source of truth for what the chat view shows.
//! Every mutation is tagged with the [`Epoch`] it was issued under; a new
//! activation starts a new epoch, so fetches and live frames that belong to
//! an earlier activation are discarded instead of leaking into the new one.

use crate::models::{Message, TicketId};
use std::sync::Arc;
use tracing::debug;

/// One activation of one ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch {
    pub ticket_id: TicketId,
    seq: u64,
}

/// Position in the live stream when a history fetch started.
///
/// Handed out by [`MessageLog::begin_fetch`] and consumed by
/// [`MessageLog::install`] or [`MessageLog::abandon_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchMark {
    pub epoch: Epoch,
    live_seen: u64,
}

/// Append-only message log with epoch-checked updates.
///
/// Reads hand out cheap shared snapshots; a write only copies the vector
/// when a snapshot is still alive.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Arc<Vec<Message>>,
    epoch: Option<Epoch>,
    next_seq: u64,
    /// Live appends in this epoch
    live_seen: u64,
    /// History fetches started and not yet installed or abandoned
    fetches: usize,
    /// Live messages appended while a fetch was running, with their ordinal
    in_flight: Vec<(u64, Message)>,
    /// Bumped whenever the contents are replaced rather than appended to
    replacements: u64,
    live_ids: u64,
    loading: bool,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh conversation for `ticket_id`. Clears the log and
    /// invalidates every earlier epoch.
    pub fn begin(&mut self, ticket_id: TicketId) -> Epoch {
        self.next_seq += 1;
        let epoch = Epoch {
            ticket_id,
            seq: self.next_seq,
        };
        self.reset();
        self.epoch = Some(epoch);
        debug!("Message log epoch {} for ticket {}", epoch.seq, ticket_id);
        epoch
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.epoch == Some(epoch)
    }

    pub fn current_ticket(&self) -> Option<TicketId> {
        self.epoch.map(|e| e.ticket_id)
    }

    /// Replace the whole log. Returns `false` (and changes nothing) when
    /// `epoch` is stale.
    pub fn set_all(&mut self, epoch: Epoch, messages: Vec<Message>) -> bool {
        if !self.is_current(epoch) {
            debug!("Discarding stale history for ticket {}", epoch.ticket_id);
            return false;
        }
        self.messages = Arc::new(messages);
        self.replacements += 1;
        true
    }

    /// Note that a history fetch is about to start. Live messages appended
    /// from now on are held until the fetch is installed or abandoned.
    pub fn begin_fetch(&mut self, epoch: Epoch) -> Option<FetchMark> {
        if !self.is_current(epoch) {
            return None;
        }
        self.fetches += 1;
        Some(FetchMark {
            epoch,
            live_seen: self.live_seen,
        })
    }

    /// Install history fetched under `mark`.
    ///
    /// The history replaces the log. Live messages appended after the mark
    /// are kept after it in arrival order, unless the history already has
    /// them (same sender and content, each history entry matching at most
    /// once). Live messages from before the mark are covered by the history
    /// and are dropped. Returns `false` when the epoch is stale.
    pub fn install(&mut self, mark: FetchMark, history: Vec<Message>) -> bool {
        if !self.is_current(mark.epoch) {
            debug!("Discarding stale history for ticket {}", mark.epoch.ticket_id);
            return false;
        }

        let mut matched = vec![false; history.len()];
        let mut kept = Vec::new();
        for (ordinal, live) in &self.in_flight {
            if *ordinal <= mark.live_seen {
                continue;
            }
            let hit = history
                .iter()
                .enumerate()
                .rev()
                .find(|(i, m)| !matched[*i] && m.same_payload(live))
                .map(|(i, _)| i);
            match hit {
                Some(i) => matched[i] = true,
                None => kept.push(live.clone()),
            }
        }

        let mut merged = history;
        merged.extend(kept);
        self.finish_fetch();
        self.set_all(mark.epoch, merged)
    }

    /// The fetch under `mark` failed; stop holding live messages for it.
    pub fn abandon_fetch(&mut self, mark: FetchMark) {
        if self.is_current(mark.epoch) {
            self.finish_fetch();
        }
    }

    /// Append a message at the end. Returns `false` when `epoch` is stale.
    pub fn append(&mut self, epoch: Epoch, message: Message) -> bool {
        if !self.is_current(epoch) {
            debug!("Discarding stale message for ticket {}", epoch.ticket_id);
            return false;
        }

        self.live_seen += 1;
        if self.fetches > 0 {
            self.in_flight.push((self.live_seen, message.clone()));
        }
        Arc::make_mut(&mut self.messages).push(message);
        true
    }

    /// Empty the log and leave no epoch current.
    pub fn clear(&mut self) {
        self.reset();
        self.epoch = None;
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Shared view of the messages as they are now.
    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    /// Number of times the contents were replaced instead of appended to.
    /// Readers that render incrementally start over when this moves.
    pub fn replacements(&self) -> u64 {
        self.replacements
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Local id for a live message that arrived without one.
    pub fn next_live_id(&mut self, epoch: Epoch) -> String {
        self.live_ids += 1;
        format!("live-{}-{}", epoch.seq, self.live_ids)
    }

    fn finish_fetch(&mut self) {
        self.fetches = self.fetches.saturating_sub(1);
        if self.fetches == 0 {
            self.in_flight.clear();
        }
    }

    fn reset(&mut self) {
        self.messages = Arc::new(Vec::new());
        self.live_seen = 0;
        self.fetches = 0;
        self.in_flight.clear();
        self.replacements += 1;
        self.loading = false;
    }
}
