//! Ticket list state and its background refresh

mod cache;
mod poller;

pub use cache::TicketCache;
pub use poller::{PollerHandle, TicketPoller};

pub(crate) use poller::refresh;
