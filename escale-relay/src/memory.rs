//! In-memory relay for tests and demos.
//!
//! Behaves like a perfectly consistent blob store, with hooks for
//! injecting faults and observing traffic: per-name put counters, a
//! one-shot error queue, and a read-back override used to simulate a
//! lost lock settling race.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::naming::RelayName;
use crate::store::{RelayEntry, RelayError, RelayStore};

#[derive(Debug, Clone)]
struct Blob {
    data: Vec<u8>,
    mtime: SystemTime,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: BTreeMap<String, Blob>,
    put_counts: HashMap<String, usize>,
    injected: VecDeque<RelayError>,
    settle_overrides: HashMap<String, Vec<u8>>,
}

/// A shared in-memory relay. Clones share state, so two simulated
/// clients can contend for the same blobs.
#[derive(Debug, Default, Clone)]
pub struct MemoryRelay {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next store operation.
    pub fn inject_error(&self, error: RelayError) {
        self.inner.lock().unwrap().injected.push_back(error);
    }

    /// How many times `name` has been put.
    pub fn put_count(&self, name: &RelayName) -> usize {
        self.inner
            .lock()
            .unwrap()
            .put_counts
            .get(name.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// All blob names currently stored, in lexical order.
    pub fn blob_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().blobs.keys().cloned().collect()
    }

    /// Overwrite a blob's mtime (stale-lock tests).
    pub fn set_mtime(&self, name: &RelayName, mtime: SystemTime) {
        if let Some(blob) = self.inner.lock().unwrap().blobs.get_mut(name.as_str()) {
            blob.mtime = mtime;
        }
    }

    /// Arrange for the next `get` of `name` to observe `data` instead of
    /// the stored content, simulating a competing put that becomes
    /// visible during the lock settling interval.
    pub fn overwrite_during_settle(&self, name: RelayName, data: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .settle_overrides
            .insert(name.as_str().to_string(), data);
    }

    /// Corrupt a stored blob by flipping one byte (integrity tests).
    pub fn flip_byte(&self, name: &RelayName, offset: usize) {
        if let Some(blob) = self.inner.lock().unwrap().blobs.get_mut(name.as_str()) {
            if let Some(byte) = blob.data.get_mut(offset) {
                *byte ^= 0xFF;
            }
        }
    }

    fn take_injected(&self) -> Option<RelayError> {
        self.inner.lock().unwrap().injected.pop_front()
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn list(&self, prefix: &str) -> Result<Vec<RelayEntry>, RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, blob)| RelayEntry {
                name: RelayName::from_raw(name.clone()),
                size: blob.data.len() as u64,
                mtime: Some(blob.mtime),
            })
            .collect())
    }

    async fn get(&self, name: &RelayName) -> Result<Vec<u8>, RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(data) = inner.settle_overrides.remove(name.as_str()) {
            return Ok(data);
        }
        inner
            .blobs
            .get(name.as_str())
            .map(|blob| blob.data.clone())
            .ok_or_else(|| RelayError::NotFound(name.as_str().to_string()))
    }

    async fn put(&self, name: &RelayName, bytes: &[u8]) -> Result<(), RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.blobs.insert(
            name.as_str().to_string(),
            Blob {
                data: bytes.to_vec(),
                mtime: SystemTime::now(),
            },
        );
        *inner.put_counts.entry(name.as_str().to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn delete(&self, name: &RelayName) -> Result<(), RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        self.inner.lock().unwrap().blobs.remove(name.as_str());
        Ok(())
    }

    async fn exists(&self, name: &RelayName) -> Result<bool, RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        Ok(self.inner.lock().unwrap().blobs.contains_key(name.as_str()))
    }

    async fn size(&self, name: &RelayName) -> Result<Option<u64>, RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blobs
            .get(name.as_str())
            .map(|blob| blob.data.len() as u64))
    }

    async fn mtime(&self, name: &RelayName) -> Result<Option<SystemTime>, RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .blobs
            .get(name.as_str())
            .map(|blob| blob.mtime))
    }

    async fn touch(&self, name: &RelayName) -> Result<(), RelayError> {
        if let Some(e) = self.take_injected() {
            return Err(e);
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.blobs.get_mut(name.as_str()) {
            Some(blob) => {
                blob.mtime = SystemTime::now();
                Ok(())
            }
            None => Err(RelayError::NotFound(name.as_str().to_string())),
        }
    }
}
