use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::StoreError;
use crate::store::{DocumentAccess, Storage, Streamable, Writable};

use super::store::MemoryStore;

/// Maps database names to in-memory stores, creating them on first use.
#[derive(Default)]
pub struct MemoryAccess {
    databases: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self, db: &str) -> Arc<MemoryStore> {
        if let Some(store) = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(db)
        {
            return Arc::clone(store);
        }
        let mut dbs = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(dbs.entry(db.to_string()).or_default())
    }
}

impl DocumentAccess for MemoryAccess {
    fn storage(&self, db: &str) -> Result<Arc<dyn Storage>, StoreError> {
        Ok(self.database(db))
    }

    fn streamable(&self, db: &str) -> Result<Arc<dyn Streamable>, StoreError> {
        Ok(self.database(db))
    }

    fn writable(&self, db: &str) -> Result<Arc<dyn Writable>, StoreError> {
        Ok(self.database(db))
    }
}
