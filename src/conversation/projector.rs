//! Turns the message log into what the chat view renders: date separators
//! between days and a cluster flag on the last message of each run from one
//! sender.

use super::participants::ParticipantDirectory;
use crate::models::Message;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};

/// Timestamps this long or shorter are time-of-day only ("10:15 AM").
const SHORT_TIMESTAMP_LEN: usize = 10;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// One row of the chat view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectedItem {
    Date {
        label: String,
    },
    Message {
        message: Message,
        is_last_in_cluster: bool,
    },
}

impl ProjectedItem {
    pub fn is_date(&self) -> bool {
        matches!(self, ProjectedItem::Date { .. })
    }
}

/// Project against the local calendar day.
pub fn project(messages: &[Message], participants: &ParticipantDirectory) -> Vec<ProjectedItem> {
    project_at(messages, participants, Local::now().date_naive())
}

/// Project with an explicit `today`.
pub fn project_at(
    messages: &[Message],
    participants: &ParticipantDirectory,
    today: NaiveDate,
) -> Vec<ProjectedItem> {
    let mut items = Vec::with_capacity(messages.len() + 2);
    let mut last_label: Option<String> = None;

    for message in messages {
        let label = date_label(message_date(&message.timestamp, today), today);
        if last_label.as_deref() != Some(label.as_str()) {
            items.push(ProjectedItem::Date {
                label: label.clone(),
            });
            last_label = Some(label);
        }

        let mut message = message.clone();
        if message.sender_name.is_empty() {
            if let Some(name) = participants.name_of(message.sender_id) {
                message.sender_name = name.to_string();
            }
        }
        items.push(ProjectedItem::Message {
            message,
            is_last_in_cluster: false,
        });
    }

    for i in 0..items.len() {
        let next_sender = match items.get(i + 1) {
            Some(ProjectedItem::Message { message, .. }) => Some(message.sender_id),
            _ => None,
        };
        if let ProjectedItem::Message {
            message,
            is_last_in_cluster,
        } = &mut items[i]
        {
            *is_last_in_cluster = next_sender != Some(message.sender_id);
        }
    }

    items
}

/// Calendar day a message belongs to. Short or unparseable timestamps
/// count as `today`.
pub fn message_date(timestamp: &str, today: NaiveDate) -> NaiveDate {
    let timestamp = timestamp.trim();
    if timestamp.len() <= SHORT_TIMESTAMP_LEN {
        return today;
    }
    parse_full_date(timestamp).unwrap_or(today)
}

fn parse_full_date(timestamp: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(timestamp) {
        return Some(dt.with_timezone(&Local).date_naive());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(timestamp, format) {
            return Some(dt.date());
        }
    }
    // Leading date followed by something we don't know
    timestamp
        .get(..SHORT_TIMESTAMP_LEN)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// `Today`, `Yesterday` or e.g. `Mar 4, 2024`.
pub fn date_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "Today".to_string()
    } else if today.pred_opt() == Some(date) {
        "Yesterday".to_string()
    } else {
        date.format("%b %-d, %Y").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()
    }

    fn msg(id: &str, sender: i64, timestamp: &str) -> Message {
        Message {
            id: id.to_string(),
            content: format!("message {id}"),
            sender_id: sender,
            timestamp: timestamp.to_string(),
            is_user: sender == 1,
            sender_name: String::new(),
        }
    }

    fn shape(items: &[ProjectedItem]) -> Vec<String> {
        items
            .iter()
            .map(|item| match item {
                ProjectedItem::Date { label } => format!("[{label}]"),
                ProjectedItem::Message {
                    message,
                    is_last_in_cluster,
                } => format!("{}{}", message.id, if *is_last_in_cluster { "*" } else { "" }),
            })
            .collect()
    }

    #[test]
    fn test_date_labels() {
        let today = today();
        assert_eq!(date_label(today, today), "Today");
        assert_eq!(date_label(today.pred_opt().unwrap(), today), "Yesterday");
        assert_eq!(
            date_label(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), today),
            "Mar 4, 2024"
        );
    }

    #[test]
    fn test_message_date_parsing() {
        let today = today();
        let march_4 = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(message_date("10:15 AM", today), today);
        assert_eq!(message_date("2024-03-04", today), today);
        assert_eq!(message_date("2024-03-04T10:00:00", today), march_4);
        assert_eq!(message_date("2024-03-04T10:00:00.123456", today), march_4);
        assert_eq!(message_date("2024-03-04 10:00:00", today), march_4);
        assert_eq!(message_date("2024-03-04 at noon", today), march_4);
        assert_eq!(message_date("not a timestamp at all", today), today);
    }

    #[test]
    fn test_separator_per_day() {
        let messages = vec![
            msg("1", 1, "2024-03-04T09:00:00"),
            msg("2", 2, "2024-03-04T09:05:00"),
            msg("3", 2, "2024-03-05T08:00:00"),
        ];
        let items = project_at(&messages, &ParticipantDirectory::new(), today());
        assert_eq!(
            shape(&items),
            vec!["[Mar 4, 2024]", "1*", "2*", "[Yesterday]", "3*"]
        );
    }

    #[test]
    fn test_cluster_ends_before_separator() {
        let messages = vec![
            msg("1", 2, "2024-03-05T08:00:00"),
            msg("2", 2, "2024-03-05T08:01:00"),
            msg("3", 2, "2024-03-05T08:02:00"),
            msg("4", 2, "10:00"),
            msg("5", 1, "10:01"),
            msg("6", 1, "10:02"),
        ];
        let items = project_at(&messages, &ParticipantDirectory::new(), today());
        assert_eq!(
            shape(&items),
            vec!["[Yesterday]", "1", "2", "3*", "[Today]", "4*", "5", "6*"]
        );
    }

    #[test]
    fn test_separator_only_on_label_change() {
        let messages = vec![
            msg("1", 1, "09:00"),
            msg("2", 2, "2024-03-04T09:00:00"),
            msg("3", 2, "09:30"),
        ];
        let items = project_at(&messages, &ParticipantDirectory::new(), today());
        // Going back to Today after an older day emits a second Today separator
        assert_eq!(
            shape(&items),
            vec!["[Today]", "1*", "[Mar 4, 2024]", "2*", "[Today]", "3*"]
        );
    }

    #[test]
    fn test_sender_names_from_directory() {
        let mut directory = ParticipantDirectory::new();
        directory.insert(2, "Agent Smith");

        let mut named = msg("2", 2, "09:01");
        named.sender_name = "Server Name".to_string();
        let messages = vec![msg("1", 2, "09:00"), named, msg("3", 3, "09:02")];

        let names: Vec<String> = project_at(&messages, &directory, today())
            .into_iter()
            .filter_map(|item| match item {
                ProjectedItem::Message { message, .. } => Some(message.sender_name),
                ProjectedItem::Date { .. } => None,
            })
            .collect();
        assert_eq!(names, vec!["Agent Smith", "Server Name", ""]);
    }

    #[test]
    fn test_empty_log() {
        assert!(project_at(&[], &ParticipantDirectory::new(), today()).is_empty());
    }
}
