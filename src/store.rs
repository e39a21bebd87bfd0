use std::path::Path;

use serde_json::json;
use sled::Db;
use tracing::info;

use crate::error::Result;

/// Byte-keyed store the validator reads from and the committer writes to.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// [`KvStore`] backed by an embedded sled database.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A store that lives only as long as the handle.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Writes `SIM1..=SIM<count>`, each at version 1.0, so simulated payloads
/// have something to validate against.
pub fn seed_simulation_keys(store: &dyn KvStore, count: u64) -> Result<()> {
    for i in 1..=count {
        let key = format!("SIM{i}");
        let value = serde_json::to_vec(&json!({ "val": i, "ver": 1.0 }))?;
        store.put(key.as_bytes(), &value)?;
    }
    store.flush()?;
    info!(count, "seeded simulation keys");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn get_returns_none_for_missing_keys() {
        let store = SledStore::temporary().unwrap();
        assert_eq!(store.get(b"SIM1").unwrap(), None);

        store.put(b"SIM1", b"{}").unwrap();
        assert_eq!(store.get(b"SIM1").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn seeding_writes_version_one_records() {
        let store = SledStore::temporary().unwrap();
        seed_simulation_keys(&store, 5).unwrap();

        let raw = store.get(b"SIM5").unwrap().unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["ver"].as_f64(), Some(1.0));
        assert_eq!(value["val"].as_u64(), Some(5));
        assert_eq!(store.get(b"SIM6").unwrap(), None);
    }
}
