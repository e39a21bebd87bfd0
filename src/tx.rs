use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

/// An incoming payload: logical key to the sub-transaction addressing it.
/// Entries are processed in key order.
pub type Payload = BTreeMap<String, SubPayload>;

/// The body of one sub-transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubPayload {
    /// The version the sender believes is currently stored for the key.
    pub ver: f64,
    /// Every other field, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubPayload {
    pub fn new(ver: f64) -> Self {
        Self {
            ver,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(name.to_string(), value.into());
        self
    }
}

/// Why a transaction was marked invalid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Rejection {
    /// The key has no record in the store.
    KeyNotFound,
    /// The store failed to answer the lookup.
    StoreUnavailable,
    /// The stored record has no numeric `ver` field.
    StoredVersionMissing,
    VersionMismatch { stored: f64, declared: f64 },
}

/// A validated sub-transaction as recorded in a block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Content-addressed identifier of this entry.
    pub id: String,
    /// The key whose version was checked.
    pub key: String,
    pub tx_data: SubPayload,
    /// The declared version.
    pub version: f64,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl Transaction {
    /// Builds an unvalidated transaction for one payload entry.
    ///
    /// NaN and infinite versions are refused: JSON has no encoding for them,
    /// so a block holding one could never be read back from the log.
    pub fn new(key: &str, tx_data: SubPayload) -> Result<Self> {
        if !tx_data.ver.is_finite() {
            return Err(LedgerError::InvalidVersion {
                key: key.to_string(),
            });
        }
        let id = transaction_id(key, &tx_data)?;
        Ok(Self {
            id,
            key: key.to_string(),
            version: tx_data.ver,
            tx_data,
            valid: false,
            rejection: None,
        })
    }

    pub fn accept(&mut self) {
        self.valid = true;
        self.rejection = None;
    }

    pub fn reject(&mut self, reason: Rejection) {
        self.valid = false;
        self.rejection = Some(reason);
    }

    /// The bytes written back to the store when the transaction commits.
    pub fn store_value(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.tx_data)?)
    }
}

/// Hex SHA-256 over the JSON encoding of the single entry `{key: tx_data}`.
pub fn transaction_id(key: &str, tx_data: &SubPayload) -> Result<String> {
    let mut entry = BTreeMap::new();
    entry.insert(key, tx_data);
    let serialized = serde_json::to_vec(&entry)?;
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    Ok(hex::encode(hasher.finalize()))
}
