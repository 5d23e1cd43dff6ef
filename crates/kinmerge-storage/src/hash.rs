//! Content hashing of final trees and stored snapshots using blake3.
//!
//! Final trees have a fixed member and edge order and use no hash maps, so
//! `serde_json::to_vec` is a canonical encoding and equal trees hash equal.
//! Snapshot hashes fingerprint a stored tree for merge execution's
//! compare-and-swap.

use kinmerge_core::TreeSnapshot;
use kinmerge_engine::FinalTree;

use crate::error::StorageError;

/// Hex digest of a final tree.
pub fn hash_final_tree(tree: &FinalTree) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(tree)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Hex digest of a stored tree snapshot.
pub fn hash_snapshot(snapshot: &TreeSnapshot) -> Result<String, StorageError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(&snapshot.people)?);
    hasher.update(&serde_json::to_vec(&snapshot.edges)?);
    Ok(hasher.finalize().to_hex().to_string())
}
