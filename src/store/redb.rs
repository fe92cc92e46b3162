use std::{ops::Bound, path::Path, sync::Arc};

use parking_lot::RwLock;
use ::redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

use super::{Cursor, Engine, StoreError};

const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

type Handle = Arc<RwLock<Option<Database>>>;

/// Persistent engine on a single redb file. Every write is its own committed
/// transaction; reads and cursor steps each open a read transaction.
pub struct RedbEngine {
    db: Handle,
}

impl RedbEngine {
    /// Opens the database at `path`, creating the file and the table when
    /// they don't exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(StoreError::backend)?;
        let tx = db.begin_write().map_err(StoreError::backend)?;
        tx.open_table(KV_TABLE).map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)?;
        info!(path = %path.display(), "opened redb store");
        Ok(Self {
            db: Arc::new(RwLock::new(Some(db))),
        })
    }
}

impl Engine for RedbEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let tx = db.begin_read().map_err(StoreError::backend)?;
        let table = tx.open_table(KV_TABLE).map_err(StoreError::backend)?;
        let value = table
            .get(key)
            .map_err(StoreError::backend)?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let tx = db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table =
                tx.open_table(KV_TABLE).map_err(StoreError::backend)?;
            table.insert(key, value).map_err(StoreError::backend)?;
        }
        tx.commit().map_err(StoreError::backend)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let tx = db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table =
                tx.open_table(KV_TABLE).map_err(StoreError::backend)?;
            table.remove(key).map_err(StoreError::backend)?;
        }
        tx.commit().map_err(StoreError::backend)
    }

    fn cursor(&self) -> Result<Box<dyn Cursor>, StoreError> {
        if self.db.read().is_none() {
            Err(StoreError::Closed)?
        }
        Ok(Box::new(RedbCursor {
            db: self.db.clone(),
            current: None,
            error: None,
        }))
    }

    fn close(&self) -> Result<(), StoreError> {
        // Waits for in-flight operations; the file lock goes with the handle.
        if self.db.write().take().is_some() {
            info!("closed redb store");
        }
        Ok(())
    }
}

struct RedbCursor {
    db: Handle,
    current: Option<(Vec<u8>, Vec<u8>)>,
    error: Option<StoreError>,
}

impl RedbCursor {
    fn position(&mut self, from: Bound<&[u8]>) {
        match self.first_from(from) {
            Ok(pair) => self.current = pair,
            Err(e) => {
                self.current = None;
                self.error = Some(e);
            }
        }
    }

    fn first_from(
        &self,
        from: Bound<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StoreError::Closed)?;
        let tx = db.begin_read().map_err(StoreError::backend)?;
        let table = tx.open_table(KV_TABLE).map_err(StoreError::backend)?;
        let mut range = table
            .range::<&[u8]>((from, Bound::Unbounded))
            .map_err(StoreError::backend)?;
        let pair = match range.next() {
            Some(entry) => {
                let (k, v) = entry.map_err(StoreError::backend)?;
                Some((k.value().to_vec(), v.value().to_vec()))
            }
            None => None,
        };
        Ok(pair)
    }
}

impl Cursor for RedbCursor {
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
