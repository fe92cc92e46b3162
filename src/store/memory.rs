use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use super::{Cursor, Engine, StoreError};

struct Shared {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
    open_cursors: AtomicUsize,
}

impl Shared {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)?
        }
        Ok(())
    }
}

/// Ordered in-memory engine. Readers and writers share one `RwLock`, held only
/// for the duration of a single operation or cursor step.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                map: RwLock::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
                open_cursors: AtomicUsize::new(0),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.map.read().is_empty()
    }

    /// Number of cursors handed out and not yet dropped.
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.shared.check_open()?;
        Ok(self.shared.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.shared.check_open()?;
        self.shared.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.shared.check_open()?;
        self.shared.map.write().remove(key);
        Ok(())
    }

    fn cursor(&self) -> Result<Box<dyn Cursor>, StoreError> {
        self.shared.check_open()?;
        self.shared.open_cursors.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryCursor {
            shared: self.shared.clone(),
            current: None,
            error: None,
        }))
    }

    fn close(&self) -> Result<(), StoreError> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Remembers the pair it sits on and re-seeks past it on every step, so
/// writers are never blocked by a slow scan.
struct MemoryCursor {
    shared: Arc<Shared>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    error: Option<StoreError>,
}

impl MemoryCursor {
    fn position(&mut self, from: Bound<&[u8]>) {
        if let Err(e) = self.shared.check_open() {
            self.current = None;
            self.error = Some(e);
            return;
        }
        let map = self.shared.map.read();
        self.current = map
            .range::<[u8], _>((from, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
    }
}

impl Cursor for MemoryCursor {
    fn seek_to(&mut self, key: &[u8]) {
        self.position(Bound::Included(key));
    }

    fn seek_first(&mut self) {
        self.position(Bound::Unbounded);
    }

    fn valid(&self) -> bool {
        self.error.is_none() && self.current.is_some()
    }

    fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Excluded(key.as_slice()));
        }
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    fn status(&self) -> Result<(), StoreError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.shared.open_cursors.fetch_sub(1, Ordering::AcqRel);
    }
}
