//! Stable hashing of serializable values.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::CalibError;
use crate::serde::to_canonical_json_bytes;

/// Computes a stable SHA256 hash for the provided serializable value.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, CalibError> {
    let bytes = to_canonical_json_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{:x}", digest))
}

/// Short identifier derived from a stable hash.
pub fn short_id<T: Serialize>(prefix: &str, value: &T) -> Result<String, CalibError> {
    let hash = stable_hash_string(value)?;
    Ok(format!("{prefix}-{}", &hash[..12]))
}
