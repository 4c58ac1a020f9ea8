//! Durable per-partition read positions.
//!
//! A [`CursorSet`] maps partition identifiers to offsets for one named
//! consumer group and is stored as `<name>.cur`: a flat run of 24-byte
//! records, a 16-byte partition identifier followed by a big-endian `u64`
//! offset. Every update rewrites the whole file; cursor sets are small.

use crate::metrics::CoreMetrics;
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CURSOR_FILE_EXTENSION: &str = "cur";
pub const CURSOR_RECORD_SIZE: usize = 24;

/// Identifies a partition across the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(Uuid);

impl PartitionId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for PartitionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug)]
struct CursorState {
    cursors: BTreeMap<PartitionId, u64>,
    closed: bool,
}

/// Offsets of one consumer group, persisted write-through
#[derive(Debug)]
pub struct CursorSet {
    name: String,
    path: PathBuf,
    state: RwLock<CursorState>,
}

impl CursorSet {
    /// Open the cursor file at `path`, creating an empty set if it is missing.
    ///
    /// # Errors
    ///
    /// `CorruptState` if the file length is not a whole number of records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let (cursors, created) = match fs::read(&path) {
            Ok(data) => (decode_cursors(&path, &data)?, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (BTreeMap::new(), true),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} cursor(s) from {}", cursors.len(), path.display());

        let set = Self {
            name,
            path,
            state: RwLock::new(CursorState {
                cursors,
                closed: false,
            }),
        };
        if created {
            // The file marks the set as existing across restarts
            set.persist(&BTreeMap::new())?;
        }
        Ok(set)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `offset` for `partition` and rewrite the cursor file
    pub fn set(&self, partition: PartitionId, offset: u64) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::Closed);
        }
        let previous = state.cursors.insert(partition, offset);
        if let Err(e) = self.persist(&state.cursors) {
            match previous {
                Some(previous) => state.cursors.insert(partition, previous),
                None => state.cursors.remove(&partition),
            };
            return Err(e);
        }
        CoreMetrics::increment_cursor_commits();
        Ok(())
    }

    /// Offset stored for `partition`, 0 when none has been set
    pub fn get(&self, partition: PartitionId) -> Result<u64> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state.cursors.get(&partition).copied().unwrap_or(0))
    }

    pub fn has_cursor(&self, partition: PartitionId) -> Result<bool> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state.cursors.contains_key(&partition))
    }

    /// Forget the cursor of `partition`, returning its last offset
    pub fn remove(&self, partition: PartitionId) -> Result<Option<u64>> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::Closed);
        }
        let Some(previous) = state.cursors.remove(&partition) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&state.cursors) {
            state.cursors.insert(partition, previous);
            return Err(e);
        }
        Ok(Some(previous))
    }

    /// Snapshot of every stored cursor
    pub fn cursors(&self) -> Result<BTreeMap<PartitionId, u64>> {
        let state = self.state.read();
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state.cursors.clone())
    }

    pub fn len(&self) -> usize {
        self.state.read().cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Every update is already on disk, so closing only rejects later calls
    pub fn close(&self) {
        let mut state = self.state.write();
        if !state.closed {
            state.closed = true;
            debug!("Closed cursor set {}", self.name);
        }
    }

    /// Replace the cursor file atomically: write a temp file, fsync, rename.
    fn persist(&self, cursors: &BTreeMap<PartitionId, u64>) -> Result<()> {
        let mut buf = BytesMut::with_capacity(cursors.len() * CURSOR_RECORD_SIZE);
        for (partition, offset) in cursors {
            buf.put_slice(partition.as_bytes());
            buf.put_u64(*offset);
        }

        let tmp = self.path.with_extension(format!("{}.tmp", CURSOR_FILE_EXTENSION));
        fs::write(&tmp, &buf)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

fn decode_cursors(path: &Path, mut data: &[u8]) -> Result<BTreeMap<PartitionId, u64>> {
    if data.len() % CURSOR_RECORD_SIZE != 0 {
        return Err(Error::CorruptState(format!(
            "cursor file {} is {} bytes, not a multiple of {}",
            path.display(),
            data.len(),
            CURSOR_RECORD_SIZE
        )));
    }

    let mut cursors = BTreeMap::new();
    while data.has_remaining() {
        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);
        let offset = data.get_u64();
        cursors.insert(PartitionId::from_bytes(id), offset);
    }
    Ok(cursors)
}

#[derive(Debug, Default)]
struct ManagerState {
    sets: HashMap<String, Arc<CursorSet>>,
    closed: bool,
}

/// The cursor sets stored in one directory, looked up case-insensitively
#[derive(Debug)]
pub struct CursorSetManager {
    base_dir: PathBuf,
    state: RwLock<ManagerState>,
}

impl CursorSetManager {
    /// Open every `*.cur` file in `base_dir`, creating the directory if needed
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let mut sets = HashMap::new();
        for entry in fs::read_dir(&base_dir)? {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(CURSOR_FILE_EXTENSION)
            {
                continue;
            }
            let set = CursorSet::open(&path)?;
            if sets.contains_key(set.name()) {
                warn!(
                    "Skipping cursor file {}: name {} is already loaded",
                    path.display(),
                    set.name()
                );
                continue;
            }
            sets.insert(set.name().to_string(), Arc::new(set));
        }

        info!(
            "Loaded {} cursor set(s) from {}",
            sets.len(),
            base_dir.display()
        );

        Ok(Self {
            base_dir,
            state: RwLock::new(ManagerState {
                sets,
                closed: false,
            }),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The cursor set called `name`, created on first use
    pub fn get_cursor_set(&self, name: &str) -> Result<Arc<CursorSet>> {
        let key = normalize_name(name)?;
        {
            let state = self.state.read();
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(set) = state.sets.get(&key) {
                return Ok(set.clone());
            }
        }

        let mut state = self.state.write();
        if state.closed {
            return Err(Error::Closed);
        }
        if let Some(set) = state.sets.get(&key) {
            return Ok(set.clone());
        }
        let path = self
            .base_dir
            .join(format!("{}.{}", key, CURSOR_FILE_EXTENSION));
        let set = Arc::new(CursorSet::open(path)?);
        state.sets.insert(key, set.clone());
        debug!("Created cursor set {}", set.name());
        Ok(set)
    }

    pub fn has_cursor_set(&self, name: &str) -> bool {
        self.state.read().sets.contains_key(&name.to_lowercase())
    }

    pub fn cursor_set_names(&self) -> BTreeSet<String> {
        self.state.read().sets.keys().cloned().collect()
    }

    /// Close and remove the cursor set called `name`, deleting its file.
    /// Returns false if there was no such set.
    pub fn delete_cursor_set(&self, name: &str) -> Result<bool> {
        let key = name.to_lowercase();
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::Closed);
        }
        let Some(set) = state.sets.remove(&key) else {
            return Ok(false);
        };
        set.close();
        if let Err(e) = fs::remove_file(set.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        info!("Deleted cursor set {}", key);
        Ok(true)
    }

    /// Close every cursor set. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        for set in state.sets.values() {
            set.close();
        }
        state.closed = true;
        info!("Closed cursor sets in {}", self.base_dir.display());
    }
}

fn normalize_name(name: &str) -> Result<String> {
    let is_path = name.contains(|c| c == '/' || c == '\\') || name == "." || name == "..";
    if name.is_empty() || is_path {
        return Err(Error::Other(format!("invalid cursor set name: {:?}", name)));
    }
    Ok(name.to_lowercase())
}
