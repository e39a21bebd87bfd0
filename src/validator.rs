//! Version checks of incoming sub-transactions against the store.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::KvStore;
use crate::tx::{Payload, Rejection, SubPayload, Transaction};

/// Builds the transaction for one payload entry and decides its validity.
pub fn validate_entry(store: &dyn KvStore, key: &str, tx_data: SubPayload) -> Result<Transaction> {
    let mut tx = Transaction::new(key, tx_data)?;
    check_version(store, &mut tx);
    Ok(tx)
}

/// Compares the declared version of `tx` with the stored one and marks it.
///
/// Lookup problems never surface as errors: they mark the transaction invalid
/// and are logged. The store is only read.
pub fn check_version(store: &dyn KvStore, tx: &mut Transaction) {
    let key = tx.key.clone();
    let key = key.as_str();
    match store.get(key.as_bytes()) {
        Ok(Some(raw)) => match stored_version(&raw) {
            Some(stored) if stored == tx.version => tx.accept(),
            Some(stored) => {
                debug!(key, stored, declared = tx.version, "version mismatch");
                let declared = tx.version;
                tx.reject(Rejection::VersionMismatch { stored, declared });
            }
            None => {
                warn!(key, "stored record has no numeric version");
                tx.reject(Rejection::StoredVersionMissing);
            }
        },
        Ok(None) => {
            warn!(key, "key not found in store");
            tx.reject(Rejection::KeyNotFound);
        }
        Err(err) => {
            warn!(key, %err, "error fetching key");
            tx.reject(Rejection::StoreUnavailable);
        }
    }
}

/// Validates every entry of a payload, in key order.
pub fn validate_payload(store: &dyn KvStore, payload: Payload) -> Result<Vec<Transaction>> {
    payload
        .into_iter()
        .map(|(key, tx_data)| validate_entry(store, &key, tx_data))
        .collect()
}

fn stored_version(raw: &[u8]) -> Option<f64> {
    let record: Value = serde_json::from_slice(raw).ok()?;
    record.get("ver")?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::store::{seed_simulation_keys, SledStore};

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
            Err(LedgerError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
        }

        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn seeded() -> SledStore {
        let store = SledStore::temporary().unwrap();
        seed_simulation_keys(&store, 3).unwrap();
        store
    }

    #[test]
    fn matching_version_is_valid() {
        let store = seeded();
        let tx = validate_entry(&store, "SIM1", SubPayload::new(1.0)).unwrap();
        assert!(tx.valid);
        assert_eq!(tx.rejection, None);
    }

    #[test]
    fn integer_and_float_versions_compare_equal() {
        let store = seeded();
        store.put(b"INT", br#"{"ver": 4}"#).unwrap();
        assert!(validate_entry(&store, "INT", SubPayload::new(4.0)).unwrap().valid);
    }

    #[test]
    fn mismatched_version_is_invalid() {
        let store = seeded();
        let tx = validate_entry(&store, "SIM2", SubPayload::new(2.0)).unwrap();
        assert!(!tx.valid);
        assert_eq!(
            tx.rejection,
            Some(Rejection::VersionMismatch {
                stored: 1.0,
                declared: 2.0
            })
        );
    }

    #[test]
    fn missing_key_is_invalid() {
        let store = seeded();
        let tx = validate_entry(&store, "txn", SubPayload::new(1.0)).unwrap();
        assert!(!tx.valid);
        assert_eq!(tx.rejection, Some(Rejection::KeyNotFound));
    }

    #[test]
    fn record_without_version_is_distinguished() {
        let store = seeded();
        store.put(b"NOVER", br#"{"val": 1}"#).unwrap();
        store.put(b"GARBAGE", b"not json").unwrap();

        for key in ["NOVER", "GARBAGE"] {
            let tx = validate_entry(&store, key, SubPayload::new(1.0)).unwrap();
            assert_eq!(tx.rejection, Some(Rejection::StoredVersionMissing));
        }
    }

    #[test]
    fn store_failure_marks_invalid_without_erroring() {
        let tx = validate_entry(&BrokenStore, "SIM1", SubPayload::new(1.0)).unwrap();
        assert!(!tx.valid);
        assert_eq!(tx.rejection, Some(Rejection::StoreUnavailable));
    }

    #[test]
    fn verdicts_are_repeatable_and_read_only() {
        let store = seeded();
        let before = store.get(b"SIM3").unwrap();
        let first = validate_entry(&store, "SIM3", SubPayload::new(1.0)).unwrap();
        let second = validate_entry(&store, "SIM3", SubPayload::new(1.0)).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get(b"SIM3").unwrap(), before);
        assert_eq!(store.get(first.id.as_bytes()).unwrap(), None);
    }

    #[test]
    fn payload_entries_get_their_own_ids() {
        let store = seeded();
        let mut payload = Payload::new();
        payload.insert("SIM2".to_string(), SubPayload::new(1.0).with_field("val", 7));
        payload.insert("SIM1".to_string(), SubPayload::new(1.0).with_field("val", 7));

        let txs = validate_payload(&store, payload).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].key, "SIM1");
        assert_eq!(txs[1].key, "SIM2");
        assert_ne!(txs[0].id, txs[1].id);
    }
}
