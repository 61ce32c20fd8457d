//! Stable identifier assignment.
//!
//! Identifiers are derived from content: the record is encoded as JSON with
//! object keys sorted (the value is first converted to a
//! `serde_json::Value`, whose maps are ordered), hashed with SHA-256, and the
//! lowercase hex digest is truncated to [`ID_LEN`] characters. The same
//! record therefore yields the same id in every process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a derived identifier in hex characters.
pub const ID_LEN: usize = 36;

/// Encode `value` with sorted object keys and no insignificant whitespace.
pub fn stable_encoding<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| Error::encoding(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| Error::encoding(e.to_string()))
}

/// Derive the identifier for `value`.
pub fn derive_id<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let encoded = stable_encoding(value)?;
    let digest = Sha256::digest(&encoded);
    let mut hex = format!("{:x}", digest);
    hex.truncate(ID_LEN);
    Ok(hex)
}

/// A process-wide `key -> id` map for one entity class.
///
/// Lookups take the read lock. On a miss the id is derived without holding
/// any lock, and the first writer for a key wins.
#[derive(Debug, Default)]
pub struct IdMap {
    ids: RwLock<HashMap<String, String>>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id recorded for `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Record `id` for `key` unless one is already present, returning the
    /// id now associated with the key.
    pub fn insert(&self, key: &str, id: String) -> String {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert(id)
            .clone()
    }

    /// The id for `key`, deriving it from `value` on first use.
    pub fn id_for<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<String> {
        if let Some(id) = self.get(key) {
            return Ok(id);
        }
        let id = derive_id(value)?;
        Ok(self.insert(key, id))
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The identifier maps shared by the inventory projection.
#[derive(Debug, Default)]
pub struct IdMaps {
    pub vms: IdMap,
    pub disks: IdMap,
    pub networks: IdMap,
}

impl IdMaps {
    pub fn new() -> Self {
        Self::default()
    }
}
