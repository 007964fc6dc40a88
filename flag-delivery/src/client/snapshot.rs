//! Locally persisted flag state, read once at startup to render without waiting on the network.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::errors::ClientError;
use crate::flags::flag_models::{FlagSet, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub user_id: UserId,
    pub flags: FlagSet,
    pub fingerprint: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub computed_at: Option<DateTime<Utc>>,
    /// Frozen experiment values, flag name to value.
    #[serde(default)]
    pub sticky: BTreeMap<String, bool>,
}

pub trait SnapshotStore: Send + Sync + 'static {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<ClientSnapshot>, ClientError>;
    fn save(&self, snapshot: &ClientSnapshot) -> Result<(), ClientError>;
    fn clear(&self) -> Result<(), ClientError>;
}

/// JSON file on disk. Writes go to a sibling temp file that is renamed into place, so a crash
/// mid-write never leaves a truncated snapshot behind.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(base_dir: impl AsRef<Path>, filename: &str) -> Self {
        FileSnapshotStore {
            path: base_dir.as_ref().join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<ClientSnapshot>, ClientError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|e| ClientError::Snapshot(format!("corrupt snapshot: {e}")))
    }

    fn save(&self, snapshot: &ClientSnapshot) -> Result<(), ClientError> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer(&mut writer, snapshot)
                .map_err(|e| ClientError::Snapshot(e.to_string()))?;
            writer.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), ClientError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    slot: Arc<Mutex<Option<ClientSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: ClientSnapshot) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(snapshot))),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<ClientSnapshot>>, ClientError> {
        self.slot
            .lock()
            .map_err(|_| ClientError::Snapshot("snapshot lock poisoned".to_string()))
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<ClientSnapshot>, ClientError> {
        Ok(self.lock()?.clone())
    }

    fn save(&self, snapshot: &ClientSnapshot) -> Result<(), ClientError> {
        *self.lock()? = Some(snapshot.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ClientError> {
        *self.lock()? = None;
        Ok(())
    }
}
