//! JSON codec between typed values and cached payloads
//!
//! The only place where a value's shape is erased. Any `Serialize` type can
//! be stored and read back as any `DeserializeOwned` type whose shape fits.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Serialize `value` into a payload
pub fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(CacheError::Encode)
}

/// Deserialize the payload stored under `key`
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(bytes).map_err(|source| CacheError::Decode {
        key: key.to_string(),
        source,
    })
}
