//! Authoritative full-state snapshots used when delta replication is
//! infeasible (cursor lost, large divergence).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Full authoritative state for one entity type within a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub tenant_id: String,
    pub entity_type: String,
    pub version: i64,
    /// JSON array of complete records for the entity type.
    pub payload: Value,
    pub created_at: i64,
    /// SHA-256 hex digest of the canonical payload bytes.
    pub checksum: String,
}

impl Snapshot {
    /// Verify the checksum before the snapshot is allowed to replace
    /// local records.
    pub fn verify(&self) -> Result<()> {
        if checksum(&self.payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch(self.snapshot_id.clone()))
        }
    }
}

/// SHA-256 hex digest over the payload's canonical JSON bytes.
///
/// serde_json serializes object keys in sorted order, so equal values
/// always produce equal digests.
pub fn checksum(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
