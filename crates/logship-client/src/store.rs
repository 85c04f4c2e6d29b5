//! Client-side buffer store
//!
//! Records are appended to a per-stream [`StreamBuffer`]. A buffer that
//! cannot take the next append is spilled into the ready queue, from which
//! the shipping client drains payloads in FIFO order. On shutdown the whole
//! state is written to a snapshot file so undelivered data survives a
//! restart.

use crate::buffer::StreamBuffer;
use crate::snapshot::Snapshot;
use bytes::Bytes;
use dashmap::DashMap;
use logship_common::{Error, Result, StreamKey};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A payload waiting to be shipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyBuffer {
    pub key: StreamKey,
    pub data: Bytes,
}

/// Per-stream buffers plus the ordered ready queue
pub struct ClientBufferStore {
    /// Capacity of every per-stream buffer
    capacity: usize,
    /// Snapshot location (None disables persistence)
    state_file: Option<PathBuf>,
    /// Live buffers; each key has its own lock
    buffers: DashMap<StreamKey, Arc<Mutex<StreamBuffer>>>,
    /// Spilled payloads, oldest first
    ready: Mutex<VecDeque<ReadyBuffer>>,
    /// Mirror of `ready.len()` readable without the lock
    ready_len: AtomicUsize,
    /// Last acknowledged sequence id per stream
    sequences: DashMap<StreamKey, u64>,
    /// Set once the state has been persisted at shutdown
    closed: AtomicBool,
}

impl ClientBufferStore {
    /// Create an in-memory store without persistence
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity,
            state_file: None,
            buffers: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            ready_len: AtomicUsize::new(0),
            sequences: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a store backed by `state_file`, restoring any previous state
    ///
    /// A missing file starts empty; a corrupt file is logged and also starts
    /// empty.
    pub fn open(capacity: usize, state_file: impl AsRef<Path>) -> Self {
        let path = state_file.as_ref().to_path_buf();
        let mut store = Self::in_memory(capacity);

        match Snapshot::read_from(&path) {
            Ok(Some(snapshot)) => {
                info!(
                    "Restored client state from {:?}: {} live buffers, {} ready buffers",
                    path,
                    snapshot.current.len(),
                    snapshot.ready.len()
                );
                store.restore(snapshot);
            }
            Ok(None) => debug!("No client state at {:?}, starting empty", path),
            Err(e) => warn!("Discarding unreadable client state {:?}: {}", path, e),
        }

        store.state_file = Some(path);
        store
    }

    fn restore(&self, snapshot: Snapshot) {
        let mut ready = self.ready.lock();
        // Live buffers were never delivered; they queue behind the older
        // ready entries so per-stream order holds.
        for (key, data) in snapshot.ready.into_iter().chain(snapshot.current) {
            if !data.is_empty() {
                ready.push_back(ReadyBuffer { key, data });
            }
        }
        self.ready_len.store(ready.len(), Ordering::SeqCst);
        drop(ready);

        for (key, sequence) in snapshot.sequences {
            self.sequences.insert(key, sequence);
        }
    }

    /// Append bytes to the buffer for `key`
    ///
    /// When the bytes do not fit, the current contents are moved to the
    /// ready queue first. Bytes larger than the capacity are rejected; the
    /// caller must split them.
    pub fn put(&self, key: &StreamKey, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::internal("buffer store is closed"));
        }
        if bytes.len() > self.capacity {
            return Err(Error::PayloadTooLarge {
                size: bytes.len(),
                capacity: self.capacity,
            });
        }

        let slot = self.slot(key);
        let mut buffer = slot.lock();
        if !buffer.fits(bytes.len()) {
            let data = buffer.take();
            self.push_ready(key.clone(), data);
        }
        if !buffer.try_put(bytes) {
            return Err(Error::internal(format!(
                "buffer for {key} rejected {} bytes after spill",
                bytes.len()
            )));
        }
        Ok(())
    }

    fn slot(&self, key: &StreamKey) -> Arc<Mutex<StreamBuffer>> {
        if let Some(slot) = self.buffers.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(
            &self
                .buffers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(StreamBuffer::new(self.capacity)))),
        )
    }

    fn push_ready(&self, key: StreamKey, data: Bytes) {
        let mut ready = self.ready.lock();
        ready.push_back(ReadyBuffer { key, data });
        self.ready_len.store(ready.len(), Ordering::SeqCst);
    }

    /// Move every non-empty live buffer into the ready queue
    pub fn flush_current(&self) -> usize {
        let slots: Vec<(StreamKey, Arc<Mutex<StreamBuffer>>)> = self
            .buffers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut flushed = 0;
        for (key, slot) in slots {
            let mut buffer = slot.lock();
            if !buffer.is_empty() {
                let data = buffer.take();
                self.push_ready(key, data);
                flushed += 1;
            }
        }
        flushed
    }

    /// Drain ready payloads through `deliver`
    ///
    /// Live buffers are flushed first. Entries are offered oldest first and
    /// removed only when `deliver` returns true; the first false stops the
    /// pass so the entry is retried before anything queued behind it.
    pub fn for_each_ready<F>(&self, mut deliver: F) -> usize
    where
        F: FnMut(&ReadyBuffer) -> bool,
    {
        self.flush_current();
        let mut delivered = 0;
        while let Some(entry) = self.front() {
            if !deliver(&entry) {
                break;
            }
            self.pop_front();
            delivered += 1;
        }
        delivered
    }

    /// Oldest ready payload, left in place
    pub fn front(&self) -> Option<ReadyBuffer> {
        self.ready.lock().front().cloned()
    }

    /// Remove the oldest ready payload
    pub fn pop_front(&self) -> Option<ReadyBuffer> {
        let mut ready = self.ready.lock();
        let entry = ready.pop_front();
        self.ready_len.store(ready.len(), Ordering::SeqCst);
        entry
    }

    /// Number of payloads waiting to be shipped
    pub fn ready_len(&self) -> usize {
        self.ready_len.load(Ordering::SeqCst)
    }

    /// Bytes currently held in live buffers
    pub fn buffered_bytes(&self) -> usize {
        self.buffers.iter().map(|entry| entry.value().lock().len()).sum()
    }

    /// Sequence id to use for the next payload of `key`
    ///
    /// Streams without a recorded id start from the wall clock in
    /// microseconds, which keeps ids increasing across a lost snapshot.
    pub fn next_sequence(&self, key: &StreamKey) -> u64 {
        let last = *self
            .sequences
            .entry(key.clone())
            .or_insert_with(sequence_seed);
        last + 1
    }

    /// Record that `sequence` was acknowledged for `key`
    pub fn commit_sequence(&self, key: &StreamKey, sequence: u64) {
        let mut entry = self.sequences.entry(key.clone()).or_insert(0);
        if sequence > *entry {
            *entry = sequence;
        }
    }

    /// Capture the full state
    pub fn snapshot(&self) -> Snapshot {
        let current = self
            .buffers
            .iter()
            .filter_map(|entry| {
                let buffer = entry.value().lock();
                (!buffer.is_empty())
                    .then(|| (entry.key().clone(), Bytes::copy_from_slice(buffer.as_slice())))
            })
            .collect();
        let ready = self
            .ready
            .lock()
            .iter()
            .map(|entry| (entry.key.clone(), entry.data.clone()))
            .collect();
        let sequences = self
            .sequences
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        Snapshot {
            current,
            ready,
            sequences,
        }
    }

    /// Write the state to the snapshot file (no-op without one)
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        snapshot.write_to(path)?;
        info!(
            "Persisted client state to {:?}: {} live buffers, {} ready buffers",
            path,
            snapshot.current.len(),
            snapshot.ready.len()
        );
        Ok(())
    }

    /// Persist the state and refuse further writes
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.persist()
    }
}

fn sequence_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX / 2))
        .unwrap_or_default()
}
