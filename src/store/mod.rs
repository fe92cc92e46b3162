use std::sync::Arc;

use crate::{
    config::{EngineKind, ServerConfig},
    limits::{MAX_KEY_SIZE, MAX_VALUE_SIZE},
    status::Status,
};

pub mod memory;
pub mod redb;

pub use self::memory::MemoryEngine;
pub use self::redb::RedbEngine;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("key of {0} bytes exceeds the {} byte limit", MAX_KEY_SIZE)]
    KeyTooLarge(usize),
    #[error("value of {0} bytes exceeds the {} byte limit", MAX_VALUE_SIZE)]
    ValueTooLarge(usize),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn backend(e: impl std::fmt::Display) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// A storage engine: point operations plus ordered cursors. Engines provide
/// their own concurrency control; callers use them from many threads at
/// once without extra locking.
pub trait Engine: Send + Sync + 'static {
    /// Returns `Ok(None)` when the key is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    /// Deleting an absent key succeeds.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    fn cursor(&self) -> Result<Box<dyn Cursor>, StoreError>;
    /// Releases the engine. Every operation afterwards fails with
    /// `StoreError::Closed`.
    fn close(&self) -> Result<(), StoreError>;
}

/// Ordered iterator over an engine's pairs. A fresh cursor is not positioned;
/// call `seek_to` or `seek_first` before reading.
pub trait Cursor: Send {
    /// Positions at the first key `>= key`.
    fn seek_to(&mut self, key: &[u8]);
    fn seek_first(&mut self);
    /// True while positioned on a pair. False once exhausted or failed.
    fn valid(&self) -> bool;
    fn next(&mut self);
    /// Only meaningful while `valid()`.
    fn key(&self) -> &[u8];
    /// Only meaningful while `valid()`.
    fn value(&self) -> &[u8];
    /// The error that stopped the cursor, if any.
    fn status(&self) -> Result<(), StoreError>;
}

/// The store handle shared by every Call. It enforces the size ceilings and
/// turns engine results into statuses. Nothing is retried here.
#[derive(Clone)]
pub struct Store {
    engine: Arc<dyn Engine>,
}

impl Store {
    pub fn new(engine: impl Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Opens the engine named by `config`.
    pub fn open(config: &ServerConfig) -> Result<Self, StoreError> {
        match config.engine {
            EngineKind::Memory => Ok(Self::new(MemoryEngine::new())),
            EngineKind::Redb => {
                Ok(Self::new(RedbEngine::open(&config.db_path)?))
            }
        }
    }

    /// A missing key is `(None, OK)`.
    pub fn get(&self, key: &[u8]) -> (Option<Vec<u8>>, Status) {
        let result = check_key(key).and_then(|_| self.engine.get(key));
        match result {
            Ok(value) => (value, Status::ok()),
            Err(e) => (None, Status::server_error(e.to_string())),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Status {
        wrap_status(
            check_key(key)
                .and_then(|_| check_value(value))
                .and_then(|_| self.engine.put(key, value)),
        )
    }

    pub fn delete(&self, key: &[u8]) -> Status {
        wrap_status(check_key(key).and_then(|_| self.engine.delete(key)))
    }

    pub fn open_cursor(&self) -> Result<Box<dyn Cursor>, Status> {
        self.engine
            .cursor()
            .map_err(|e| Status::server_error(e.to_string()))
    }

    pub(crate) fn close(&self) -> Status {
        wrap_status(self.engine.close())
    }
}

fn check_key(key: &[u8]) -> Result<(), StoreError> {
    if key.len() > MAX_KEY_SIZE {
        Err(StoreError::KeyTooLarge(key.len()))?
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<(), StoreError> {
    if value.len() > MAX_VALUE_SIZE {
        Err(StoreError::ValueTooLarge(value.len()))?
    }
    Ok(())
}

fn wrap_status(result: Result<(), StoreError>) -> Status {
    match result {
        Ok(()) => Status::ok(),
        Err(e) => Status::server_error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn missing_key_is_ok_and_absent() {
        let store = Store::new(MemoryEngine::new());
        assert_eq!(store.get(b"nope"), (None, Status::ok()));
    }

    #[test]
    fn put_get_delete() {
        let store = Store::new(MemoryEngine::new());
        assert!(store.put(b"k", b"v").is_ok());
        assert_eq!(store.get(b"k"), (Some(b"v".to_vec()), Status::ok()));
        assert!(store.delete(b"k").is_ok());
        assert_eq!(store.get(b"k"), (None, Status::ok()));
    }

    #[test]
    fn oversized_requests_never_reach_the_engine() {
        let engine = MemoryEngine::new();
        let store = Store::new(engine.clone());
        let big_key = vec![0u8; MAX_KEY_SIZE + 1];
        let big_value = vec![0u8; MAX_VALUE_SIZE + 1];

        let status = store.put(&big_key, b"v");
        assert_eq!(status.code, Code::ServerError);
        assert!(status.message.contains("key of"));

        let status = store.put(b"k", &big_value);
        assert_eq!(status.code, Code::ServerError);
        assert!(status.message.contains("value of"));

        assert_eq!(store.get(&big_key).1.code, Code::ServerError);
        assert_eq!(store.delete(&big_key).code, Code::ServerError);
        assert!(engine.is_empty());
    }

    #[test]
    fn opens_the_configured_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::builder()
            .engine(EngineKind::Redb)
            .db_path(dir.path().join("kv.redb"))
            .build();
        let store = Store::open(&config).unwrap();
        assert!(store.put(b"k", b"v").is_ok());
        assert!(store.close().is_ok());

        let config = ServerConfig::builder().engine(EngineKind::Memory).build();
        let store = Store::open(&config).unwrap();
        assert_eq!(store.get(b"k"), (None, Status::ok()));
    }

    #[test]
    fn backend_failures_surface_verbatim() {
        let store = Store::new(MemoryEngine::new());
        assert!(store.close().is_ok());
        assert_eq!(
            store.put(b"k", b"v"),
            Status::server_error("store is closed")
        );
        assert!(store.open_cursor().is_err());
    }
}
