//! Display info for the people in a conversation

use crate::models::UserId;
use std::collections::HashMap;

/// Avatar colours, picked by user id
pub const PALETTE: &[&str] = &[
    "#fe6d00", "#f54242", "#f5a142", "#f5d142", "#42f54b", "#42f5d1", "#42a1f5", "#4242f5",
    "#a142f5", "#d142f5", "#f542a1",
];

/// Stable palette colour for `user_id`.
pub fn color_for(user_id: UserId) -> &'static str {
    PALETTE[user_id.rem_euclid(PALETTE.len() as i64) as usize]
}

/// Name and avatar colour of one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub name: String,
    pub color: Option<String>,
}

/// `user_id → ParticipantInfo`, filled lazily as tickets are opened.
///
/// Only a lookup table: it never owns tickets or messages.
#[derive(Debug, Clone, Default)]
pub struct ParticipantDirectory {
    entries: HashMap<UserId, ParticipantInfo>,
    revision: u64,
}

impl ParticipantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user's display name. New entries get their palette colour.
    pub fn insert(&mut self, user_id: UserId, name: impl Into<String>) {
        let name = name.into();
        let entry = self.entries.entry(user_id).or_insert_with(|| ParticipantInfo {
            name: String::new(),
            color: Some(color_for(user_id).to_string()),
        });
        if entry.name != name {
            entry.name = name;
            self.revision += 1;
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<&ParticipantInfo> {
        self.entries.get(&user_id)
    }

    /// Known, non-empty name of `user_id`.
    pub fn name_of(&self, user_id: UserId) -> Option<&str> {
        self.entries
            .get(&user_id)
            .map(|info| info.name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Changes whenever an entry changes; lets views know when to recompute.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
