use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use snafu::{ResultExt, Snafu};

use crate::message::ChatMessage;

const CACHE_DIRECTORY_NAME: &str = "immix";
const CACHE_FILE_NAME: &str = "messages-cache.json";

/// Write-through mirror of committed messages, keyed by conversation id.
///
/// Every write goes to disk immediately when a path is configured. Disk failures
/// are logged and swallowed: the cache only backs offline display.
#[derive(Debug)]
pub struct LocalCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, Vec<ChatMessage>>>,
    /// Held from snapshot to rename so the file always ends at the newest snapshot.
    write_lock: Mutex<()>,
}

impl LocalCache {
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .map(|path| path.join(CACHE_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".immix"))
            .join(CACHE_FILE_NAME)
    }

    /// Opens the snapshot at `path`; an unreadable snapshot starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_snapshot(&path);
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
            write_lock: Mutex::new(()),
        }
    }

    pub fn open_default() -> Self {
        Self::open(Self::default_path())
    }

    /// Memory-only cache, nothing touches the filesystem.
    pub fn disabled() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Vec<ChatMessage>> {
        self.lock().get(conversation_id).cloned()
    }

    pub fn put(&self, conversation_id: &str, messages: &[ChatMessage]) {
        self.lock()
            .insert(conversation_id.to_string(), messages.to_vec());

        let Some(path) = self.path.as_deref() else {
            return;
        };
        let _writing = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = self.lock().clone();
        if let Err(error) = persist_snapshot(path, &snapshot) {
            tracing::warn!(
                conversation_id,
                error = %error,
                "failed to write local message cache"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ChatMessage>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_snapshot(path: &Path) -> HashMap<String, Vec<ChatMessage>> {
    if !path.exists() {
        return HashMap::new();
    }

    let parsed = std::fs::read(path)
        .context(ReadFileSnafu {
            stage: "read-cache-snapshot",
            path: path.to_path_buf(),
        })
        .and_then(|bytes| {
            serde_json::from_slice(&bytes).context(DecodeSnafu {
                stage: "decode-cache-snapshot",
            })
        });

    match parsed {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(error = %error, "ignoring unreadable local message cache");
            HashMap::new()
        }
    }
}

fn persist_snapshot(
    path: &Path,
    entries: &HashMap<String, Vec<ChatMessage>>,
) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-cache-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_vec(entries).context(EncodeSnafu {
        stage: "encode-cache-snapshot",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-cache-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-cache-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;

    Ok(())
}

#[derive(Debug, Snafu)]
enum CacheError {
    #[snafu(display("failed to create cache directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read cache file at {path:?} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write cache file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace cache file from {from:?} to {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode cache snapshot on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode cache snapshot on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use immix_wire::Role;

    use super::*;

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CACHE_FILE_NAME);

        let cache = LocalCache::open(&path);
        let message = ChatMessage::local(Role::User, "hi");
        cache.put("c1", std::slice::from_ref(&message));

        let reopened = LocalCache::open(&path);
        assert_eq!(reopened.get("c1"), Some(vec![message]));
        assert_eq!(reopened.get("c2"), None);
    }

    #[test]
    fn concurrent_puts_leave_the_newest_snapshot_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE_NAME);
        let cache = LocalCache::open(&path);

        std::thread::scope(|scope| {
            for conversation_id in ["c1", "c2"] {
                let cache = &cache;
                scope.spawn(move || {
                    let mut messages = Vec::new();
                    for index in 0..50 {
                        messages.push(ChatMessage::local(Role::User, format!("m{index}")));
                        cache.put(conversation_id, &messages);
                    }
                });
            }
        });

        let reopened = LocalCache::open(&path);
        for conversation_id in ["c1", "c2"] {
            let messages = reopened.get(conversation_id).unwrap();
            assert_eq!(messages.len(), 50);
            assert_eq!(messages, cache.get(conversation_id).unwrap());
        }
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CACHE_FILE_NAME);
        std::fs::write(&path, b"not json").unwrap();

        let cache = LocalCache::open(&path);
        assert_eq!(cache.get("c1"), None);
    }

    #[test]
    fn unwritable_location_keeps_memory_copy() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let cache = LocalCache::open(blocker.join(CACHE_FILE_NAME));
        let message = ChatMessage::local(Role::User, "kept");
        cache.put("c1", std::slice::from_ref(&message));

        assert_eq!(cache.get("c1"), Some(vec![message]));
    }
}
