//! Persistent dedup high-water marks using Redb
//!
//! For every (client, stream) pair the collector remembers the highest
//! sequence id it applied. Marks are loaded lazily, cached in memory and
//! written through on every apply so they survive restarts.

use dashmap::DashMap;
use logship_common::{ClientId, Error, Result, StreamKey};
use parking_lot::Mutex;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Marks: "client\x00stream\x00type\x00host\x00shard\x00version" → last applied sequence id
const LAST_APPLIED: TableDefinition<&str, u64> = TableDefinition::new("last_applied");

/// Dedup identity: the client plus the full stream key (hostname included)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub client: ClientId,
    pub stream: StreamKey,
}

impl DedupKey {
    pub const fn new(client: ClientId, stream: StreamKey) -> Self {
        Self { client, stream }
    }

    fn db_key(&self) -> String {
        format!(
            "{}\x00{}\x00{}\x00{}\x00{}\x00{}",
            self.client.as_u8(),
            self.stream.stream_name,
            self.stream.stream_type,
            self.stream.client_hostname,
            self.stream.shard,
            self.stream.version
        )
    }
}

/// Result of offering a sequence id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// The payload was new and has been applied
    Applied,
    /// The id was at or below the high-water mark; nothing was applied
    Duplicate { last_applied: u64 },
}

fn db_err(e: impl Into<redb::Error>) -> Error {
    Error::DedupStore(e.into().to_string())
}

/// High-water mark store
pub struct DedupStore {
    db: Database,
    marks: DashMap<DedupKey, Arc<Mutex<Option<u64>>>>,
}

impl DedupStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let store = Self::with_database(db)?;
        info!("Opened dedup store at {}", path.display());
        Ok(store)
    }

    /// Store that forgets everything on drop
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(db_err)?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> Result<Self> {
        // Ensure the table exists so reads never fail on a fresh file
        let wtx = db.begin_write().map_err(db_err)?;
        wtx.open_table(LAST_APPLIED).map_err(db_err)?;
        wtx.commit().map_err(db_err)?;
        Ok(Self {
            db,
            marks: DashMap::new(),
        })
    }

    fn load(&self, key: &DedupKey) -> Result<Option<u64>> {
        let rtx = self.db.begin_read().map_err(db_err)?;
        let table = rtx.open_table(LAST_APPLIED).map_err(db_err)?;
        let value = table.get(key.db_key().as_str()).map_err(db_err)?;
        Ok(value.map(|v| v.value()))
    }

    fn persist(&self, key: &DedupKey, sequence_id: u64) -> Result<()> {
        let wtx = self.db.begin_write().map_err(db_err)?;
        wtx.open_table(LAST_APPLIED)
            .map_err(db_err)?
            .insert(key.db_key().as_str(), sequence_id)
            .map_err(db_err)?;
        wtx.commit().map_err(db_err)?;
        Ok(())
    }

    fn slot(&self, key: &DedupKey) -> Result<Arc<Mutex<Option<u64>>>> {
        if let Some(slot) = self.marks.get(key) {
            return Ok(Arc::clone(&slot));
        }
        self.marks
            .entry(key.clone())
            .or_try_insert_with(|| Ok::<_, Error>(Arc::new(Mutex::new(self.load(key)?))))
            .map(|slot| Arc::clone(&slot))
    }

    /// Highest applied sequence id for `key`
    pub fn last_applied(&self, key: &DedupKey) -> Result<Option<u64>> {
        Ok(*self.slot(key)?.lock())
    }

    /// Run `apply` unless `sequence_id` was already applied for `key`
    ///
    /// Offers for the same key are serialized. When `apply` fails the mark
    /// is left untouched, so a retry with the same id is applied again.
    pub fn apply_if_new<F>(&self, key: &DedupKey, sequence_id: u64, apply: F) -> Result<DedupOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let slot = self.slot(key)?;
        let mut mark = slot.lock();
        if let Some(last_applied) = *mark {
            if sequence_id <= last_applied {
                return Ok(DedupOutcome::Duplicate { last_applied });
            }
        }

        apply()?;

        // The payload is on disk; remember it in memory even if the write
        // through fails so a retry in this process is acknowledged as a
        // duplicate.
        *mark = Some(sequence_id);
        if let Err(e) = self.persist(key, sequence_id) {
            error!(
                "Failed to persist dedup mark {} for {} {}: {}",
                sequence_id, key.client, key.stream, e
            );
            return Err(e);
        }
        Ok(DedupOutcome::Applied)
    }
}
