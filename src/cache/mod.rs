//! Durable conversation snapshot cache
//!
//! Persists the last known message set across restarts so the store can
//! paint immediately on startup, before any network round trip. Pure
//! key/value read-write; all merge logic lives in the store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Persisted conversation state, written as a single JSON slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub chat_id: Option<String>,
    pub unread_count: usize,
}

/// Storage backend for the conversation snapshot.
///
/// `save` is fire-and-forget: implementations must not block the caller and
/// must swallow (log) write errors. A snapshot that cannot be read back
/// loads as `None`.
pub trait SnapshotCache: Send + Sync {
    fn load(&self) -> Option<ChatSnapshot>;
    fn save(&self, snapshot: ChatSnapshot);
}

enum Job {
    Write(ChatSnapshot),
    Sync(mpsc::Sender<()>),
}

/// File-backed snapshot cache.
///
/// Writes are handed to a dedicated writer thread so the store's synchronous
/// operations never wait on the filesystem. The worker replaces the snapshot
/// atomically (temp file + rename), so a crash mid-write leaves the previous
/// snapshot intact rather than a truncated file.
pub struct FileCache {
    path: PathBuf,
    tx: mpsc::Sender<Job>,
}

impl FileCache {
    /// Open the cache at the default platform location.
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "shopchat-cli", "shopchat-cli")
            .context("Could not determine cache directory")?;
        Ok(Self::with_path(
            proj_dirs.cache_dir().join("conversation.json"),
        ))
    }

    /// Open the cache at an explicit path.
    pub fn with_path(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel();
        let writer_path = path.clone();
        thread::spawn(move || writer_loop(&writer_path, rx));
        Self { path, tx }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for all queued writes to reach disk.
    ///
    /// Used before process exit; pending writes are otherwise abandoned when
    /// the process ends.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Job::Sync(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(5));
        }
    }
}

impl SnapshotCache for FileCache {
    fn load(&self) -> Option<ChatSnapshot> {
        if !self.path.exists() {
            return None;
        }

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Failed to read snapshot file: {:#}", e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Discarding malformed snapshot: {:#}", e);
                None
            }
        }
    }

    fn save(&self, snapshot: ChatSnapshot) {
        if self.tx.send(Job::Write(snapshot)).is_err() {
            tracing::warn!("Snapshot writer thread is gone, dropping write");
        }
    }
}

fn writer_loop(path: &Path, rx: mpsc::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Write(snapshot) => {
                if let Err(e) = write_snapshot(path, &snapshot) {
                    tracing::warn!("Snapshot write failed: {:#}", e);
                }
            }
            Job::Sync(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &ChatSnapshot) -> Result<()> {
    let dir = path.parent().context("Snapshot path has no parent")?;
    fs::create_dir_all(dir).context("Failed to create cache directory")?;

    let content = serde_json::to_vec(snapshot).context("Failed to serialize snapshot")?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).context("Failed to write snapshot temp file")?;
    fs::rename(&tmp, path).context("Failed to replace snapshot file")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageId, MessageKind, MessageStatus, SenderRole};
    use chrono::Utc;

    fn sample_message() -> Message {
        Message {
            id: MessageId::Canonical("srv-1".into()),
            chat_id: "chat-1".into(),
            sender_id: "agent-7".into(),
            sender_name: "Dana".into(),
            sender_role: SenderRole::SupportAgent,
            content: "hello".into(),
            kind: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_size: None,
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
            reply_to: None,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::with_path(dir.path().join("conversation.json"));

        let snapshot = ChatSnapshot {
            messages: vec![sample_message()],
            chat_id: Some("chat-1".into()),
            unread_count: 1,
        };
        cache.save(snapshot);
        cache.flush();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.chat_id.as_deref(), Some("chat-1"));
        assert_eq!(loaded.unread_count, 1);
        assert_eq!(loaded.messages[0].id, MessageId::Canonical("srv-1".into()));
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::with_path(dir.path().join("conversation.json"));
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_load_malformed_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.json");
        fs::write(&path, "{not json").unwrap();

        let cache = FileCache::with_path(path);
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::with_path(dir.path().join("conversation.json"));

        for unread in 0..5 {
            cache.save(ChatSnapshot {
                messages: Vec::new(),
                chat_id: Some("chat-1".into()),
                unread_count: unread,
            });
        }
        cache.flush();

        assert_eq!(cache.load().unwrap().unread_count, 4);
    }
}
