//! Durable local state.
//!
//! The last-known ticket list and the signed-in credentials survive a
//! restart so the first screen can be drawn before the network answers.
//! Both are removed on logout.
//!
//! Directory layout:
//!   {data_dir}/tickets.json
//!   {data_dir}/credentials.json

use crate::auth::Credentials;
use crate::models::Ticket;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const TICKETS_FILE: &str = "tickets.json";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Ticket list as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub saved_at: DateTime<Utc>,
    pub tickets: Vec<Ticket>,
}

/// Reads and writes the persisted client state.
#[derive(Debug, Clone)]
pub struct LocalStore {
    data_dir: PathBuf,
}

impl LocalStore {
    /// Create a new store. Creates the directory if needed.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).await?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Replace the persisted ticket list.
    pub async fn save_tickets(&self, tickets: &[Ticket]) -> Result<()> {
        let snapshot = TicketSnapshot {
            saved_at: Utc::now(),
            tickets: tickets.to_vec(),
        };
        self.write_json(TICKETS_FILE, &snapshot).await?;
        debug!("Saved {} tickets", tickets.len());
        Ok(())
    }

    /// Load the persisted ticket list. A missing or unreadable file yields
    /// an empty list.
    pub async fn load_tickets(&self) -> Result<Vec<Ticket>> {
        Ok(self
            .read_json::<TicketSnapshot>(TICKETS_FILE)
            .await?
            .map(|snapshot| snapshot.tickets)
            .unwrap_or_default())
    }

    pub async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        self.write_json(CREDENTIALS_FILE, credentials).await?;
        info!("Stored credentials for user {}", credentials.user_id);
        Ok(())
    }

    pub async fn load_credentials(&self) -> Result<Option<Credentials>> {
        self.read_json(CREDENTIALS_FILE).await
    }

    /// Forget everything tied to the signed-in user.
    pub async fn clear(&self) -> Result<()> {
        for name in [TICKETS_FILE, CREDENTIALS_FILE] {
            for path in [
                self.data_dir.join(name),
                self.data_dir.join(format!("{name}.tmp")),
            ] {
                if path.exists() {
                    fs::remove_file(&path).await?;
                }
            }
        }
        info!("Cleared local state in {}", self.data_dir.display());
        Ok(())
    }

    /// Write to `<name>.tmp` and rename it over `name`, so a crash mid-write
    /// leaves the previous file intact.
    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.data_dir.join(name);
        let tmp_path = self.data_dir.join(format!("{name}.tmp"));
        let content = serde_json::to_string_pretty(value)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.data_dir.join(name);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<T>(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}
