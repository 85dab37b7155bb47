//! Bounded in-memory hold for inbound file transfers
//!
//! Files wait here for the user to accept or decline. The queue is bounded
//! by count and by total bytes; admission evicts the oldest entries first
//! and rejects what still cannot fit. Entries expire after five minutes.
//! Nothing is ever persisted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use bitchat_core::config::PendingFileConfig;
use bitchat_core::types::{PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Pending-file operation failures
#[derive(Debug, thiserror::Error)]
pub enum PendingFileError {
    #[error("file of {size} bytes cannot fit the {max} byte quota")]
    QuotaExceeded { size: usize, max: usize },
    #[error("no pending file with id {id}")]
    NotFound { id: String },
    #[error("save failed: {0}")]
    SaveFailed(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Pending Transfer
// ----------------------------------------------------------------------------

/// One inbound file awaiting a decision
#[derive(Debug, Clone)]
pub struct PendingFileTransfer {
    /// Queue identifier handed to the UI
    pub id: String,
    /// Originating peer
    pub sender_peer_id: PeerId,
    /// Sender nickname at offer time
    pub sender_nickname: String,
    /// Original file name, if any
    pub file_name: Option<String>,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// The file bytes, held only in memory
    pub content: Vec<u8>,
    /// When the offer arrived
    pub timestamp: Timestamp,
    /// Offered over a private channel rather than broadcast
    pub is_private: bool,
}

impl PendingFileTransfer {
    /// Content size in bytes
    pub fn file_size(&self) -> usize {
        self.content.len()
    }

    /// File name, or one derived from the MIME type
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.file_name {
            return name.clone();
        }
        let extension = self
            .mime_type
            .as_deref()
            .and_then(|mime| mime.rsplit('/').next())
            .unwrap_or("bin");
        format!("file.{extension}")
    }
}

// ----------------------------------------------------------------------------
// Sink
// ----------------------------------------------------------------------------

/// Callbacks for queue changes, consumed by the UI layer
pub trait PendingFileSink: Send + Sync {
    /// A transfer entered the queue
    fn on_pending_file_added(&self, transfer: &PendingFileTransfer);
    /// A transfer left the queue without being accepted
    fn on_pending_file_removed(&self, id: &str);
}

/// Sink that ignores everything
pub struct NullFileSink;

impl PendingFileSink for NullFileSink {
    fn on_pending_file_added(&self, _transfer: &PendingFileTransfer) {}
    fn on_pending_file_removed(&self, _id: &str) {}
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

/// Bounded, evicting queue of pending transfers
///
/// Shared between the UI thread and the event fan-out; all state sits
/// behind one reader-preferring lock, and no callback runs under it.
pub struct PendingFileManager<T: TimeSource> {
    entries: RwLock<HashMap<String, PendingFileTransfer>>,
    config: PendingFileConfig,
    sink: Arc<dyn PendingFileSink>,
    time_source: T,
}

impl<T: TimeSource> PendingFileManager<T> {
    /// Create a manager with the given bounds
    pub fn new(config: PendingFileConfig, sink: Arc<dyn PendingFileSink>, time_source: T) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            sink,
            time_source,
        }
    }

    /// Admit a transfer, evicting the oldest entries as needed
    ///
    /// Returns `None` when the file cannot fit even an emptied queue.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        sender_peer_id: PeerId,
        sender_nickname: String,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        is_private: bool,
    ) -> Option<PendingFileTransfer> {
        if content.len() > self.config.max_total_bytes {
            debug!(
                size = content.len(),
                "rejecting file larger than the whole quota"
            );
            return None;
        }

        let transfer = PendingFileTransfer {
            id: Uuid::new_v4().to_string(),
            sender_peer_id,
            sender_nickname,
            file_name,
            mime_type,
            content,
            timestamp: self.time_source.now(),
            is_private,
        };

        let mut evicted = Vec::new();
        {
            let mut entries = self.entries.write().expect("pending lock");

            // Count bound: make room for one.
            while entries.len() >= self.config.max_pending_count {
                match Self::oldest_id(&entries) {
                    Some(id) => {
                        entries.remove(&id);
                        evicted.push(id);
                    }
                    None => break,
                }
            }

            // Byte bound: evict oldest-first until the new file fits.
            let mut total: usize = entries.values().map(|entry| entry.content.len()).sum();
            while total + transfer.content.len() > self.config.max_total_bytes {
                match Self::oldest_id(&entries) {
                    Some(id) => {
                        if let Some(removed) = entries.remove(&id) {
                            total -= removed.content.len();
                        }
                        evicted.push(id);
                    }
                    None => break,
                }
            }

            if total + transfer.content.len() > self.config.max_total_bytes {
                // Nothing left to evict and it still does not fit.
                drop(entries);
                for id in &evicted {
                    self.sink.on_pending_file_removed(id);
                }
                return None;
            }

            entries.insert(transfer.id.clone(), transfer.clone());
        }

        for id in &evicted {
            self.sink.on_pending_file_removed(id);
        }
        self.sink.on_pending_file_added(&transfer);
        info!(
            id = %transfer.id,
            size = transfer.file_size(),
            "pending file queued"
        );
        Some(transfer)
    }

    /// Look up a queued transfer
    pub fn get(&self, id: &str) -> Option<PendingFileTransfer> {
        self.entries.read().expect("pending lock").get(id).cloned()
    }

    /// All queued transfers, newest first
    pub fn all(&self) -> Vec<PendingFileTransfer> {
        let mut transfers: Vec<PendingFileTransfer> = self
            .entries
            .read()
            .expect("pending lock")
            .values()
            .cloned()
            .collect();
        transfers.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        transfers
    }

    /// Accept a transfer: remove it, then hand it to `save`
    ///
    /// The entry leaves the queue before the handler runs, so a second
    /// accept of the same id fails with `NotFound`.
    pub fn accept<F>(&self, id: &str, save: F) -> Result<PathBuf, PendingFileError>
    where
        F: FnOnce(&PendingFileTransfer) -> std::io::Result<PathBuf>,
    {
        let transfer = self
            .entries
            .write()
            .expect("pending lock")
            .remove(id)
            .ok_or_else(|| PendingFileError::NotFound { id: id.to_string() })?;
        let path = save(&transfer)?;
        info!(%id, path = %path.display(), "pending file accepted");
        Ok(path)
    }

    /// Decline a transfer, dropping its bytes
    pub fn decline(&self, id: &str) -> Result<(), PendingFileError> {
        self.entries
            .write()
            .expect("pending lock")
            .remove(id)
            .ok_or_else(|| PendingFileError::NotFound { id: id.to_string() })?;
        self.sink.on_pending_file_removed(id);
        Ok(())
    }

    /// Drop everything, including on panic-clear
    pub fn clear_all(&self) {
        let ids: Vec<String> = {
            let mut entries = self.entries.write().expect("pending lock");
            let ids = entries.keys().cloned().collect();
            entries.clear();
            ids
        };
        for id in &ids {
            self.sink.on_pending_file_removed(id);
        }
    }

    /// `(count, total bytes)` currently held
    pub fn stats(&self) -> (usize, usize) {
        let entries = self.entries.read().expect("pending lock");
        let total = entries.values().map(|entry| entry.content.len()).sum();
        (entries.len(), total)
    }

    /// Remove entries older than the expiration deadline
    ///
    /// Driven by the runtime on a 30-second tick.
    pub fn expire(&self) {
        let now = self.time_source.now();
        let deadline = self.config.expiration.as_millis() as u64;

        let expired: Vec<String> = {
            let mut entries = self.entries.write().expect("pending lock");
            let expired: Vec<String> = entries
                .values()
                .filter(|entry| now.millis_since(entry.timestamp) > deadline)
                .map(|entry| entry.id.clone())
                .collect();
            for id in &expired {
                entries.remove(id);
            }
            expired
        };

        for id in &expired {
            debug!(%id, "pending file expired");
            self.sink.on_pending_file_removed(id);
        }
    }

    fn oldest_id(entries: &HashMap<String, PendingFileTransfer>) -> Option<String> {
        entries
            .values()
            .min_by_key(|entry| (entry.timestamp, entry.id.clone()))
            .map(|entry| entry.id.clone())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
