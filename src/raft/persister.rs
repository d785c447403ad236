use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::{Log, LogEntry, NodeId, RaftError};

/// The fields that must survive a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

/// Borrowing twin of [`PersistentState`]; encodes to the same bytes.
#[derive(Serialize)]
struct PersistentStateRef<'a> {
    current_term: u64,
    voted_for: Option<NodeId>,
    log: &'a [LogEntry],
}

pub(crate) fn encode_state(
    current_term: u64,
    voted_for: Option<NodeId>,
    log: &[LogEntry],
) -> Result<Vec<u8>, RaftError> {
    let state = PersistentStateRef {
        current_term,
        voted_for,
        log,
    };
    bincode::serde::encode_to_vec(&state, bincode::config::standard())
        .map_err(|e| RaftError::Serialization(e.to_string()))
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>, RaftError> {
        encode_state(self.current_term, self.voted_for, &self.log)
    }

    /// Decodes a blob written by [`PersistentState::encode`]. An empty blob
    /// means there is no prior state; any other undecodable content is fatal.
    pub fn decode(blob: &[u8]) -> Result<Option<Self>, RaftError> {
        if blob.is_empty() {
            return Ok(None);
        }

        let (state, read): (PersistentState, usize) =
            bincode::serde::decode_from_slice(blob, bincode::config::standard())
                .map_err(|e| RaftError::CorruptState(e.to_string()))?;
        if read != blob.len() {
            return Err(RaftError::CorruptState(format!(
                "{} trailing bytes after persisted state",
                blob.len() - read
            )));
        }

        // Validate the sentinel eagerly so a bad blob never reaches the node.
        Log::from_entries(state.log.clone())?;
        Ok(Some(state))
    }
}

/// Durable storage for the opaque persisted-state blob.
///
/// `save` must be atomic: a later `load` returns either the previous blob or
/// the new one in full.
pub trait Persister: Send + Sync {
    fn save(&self, blob: &[u8]) -> Result<(), RaftError>;

    /// Returns the last saved blob, or an empty vector if nothing was saved.
    fn load(&self) -> Result<Vec<u8>, RaftError>;

    fn size(&self) -> Result<usize, RaftError> {
        Ok(self.load()?.len())
    }
}

/// Keeps the blob in memory. Sharing one instance between a killed server and
/// its replacement models a crash that preserves stable storage.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    blob: Mutex<Vec<u8>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current contents into an independent persister.
    pub fn snapshot_copy(&self) -> Self {
        let blob = self.blob.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Self {
            blob: Mutex::new(blob),
        }
    }
}

impl Persister for MemoryPersister {
    fn save(&self, blob: &[u8]) -> Result<(), RaftError> {
        let mut guard = self.blob.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clear();
        guard.extend_from_slice(blob);
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>, RaftError> {
        Ok(self
            .blob
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn size(&self) -> Result<usize, RaftError> {
        Ok(self.blob.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}

/// Stores the blob in a single file, replaced atomically on every save.
#[derive(Debug)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, RaftError> {
        let dir = data_dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            path: dir.join("raft-state.bin"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persister for FilePersister {
    fn save(&self, blob: &[u8]) -> Result<(), RaftError> {
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>, RaftError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read(&self.path)?)
    }
}

/// In-memory persister whose `save` can be switched to fail with an I/O
/// error.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingPersister {
    inner: MemoryPersister,
    failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingPersister {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Persister for FailingPersister {
    fn save(&self, blob: &[u8]) -> Result<(), RaftError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.save(blob)
    }

    fn load(&self) -> Result<Vec<u8>, RaftError> {
        self.inner.load()
    }
}
