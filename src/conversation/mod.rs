//! Conversation state for the active ticket
//!
//! - `log`: ordered, epoch-checked message log
//! - `participants`: display names and colours
//! - `projector`: date separators and cluster flags for display
//! - `session`: wires the above to the channel and the REST backend

pub mod log;
pub mod participants;
pub mod projector;
pub mod session;

pub use log::{Epoch, FetchMark, MessageLog};
pub use participants::{ParticipantDirectory, ParticipantInfo};
pub use projector::{project, project_at, ProjectedItem};
pub use session::ChatSession;
