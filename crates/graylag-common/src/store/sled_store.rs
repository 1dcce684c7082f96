//! Embedded on-disk backend.
//!
//! sled serializes its own writes, so no extra locking is layered on top;
//! `save` maps to an explicit flush for the shutdown and sweeper barriers.

use super::{ScanPredicate, Store, StoreError};
use async_trait::async_trait;
use std::path::Path;

/// A file-backed map at a configured path.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Opens or creates the database directory at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::Config::new().path(path).open()?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Store for SledStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .get(key)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.insert(key, value.as_bytes())?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    async fn save(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn scan(&self, predicate: ScanPredicate<'_>) -> Result<Vec<String>, StoreError> {
        let mut matched = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            let value = String::from_utf8_lossy(&value);
            if predicate(&key, &value) {
                matched.push(key.into_owned());
            }
        }
        Ok(matched)
    }
}
