// src/key_pool/lease.rs

use super::{KeyAssignment, KeyPool};
use secrecy::SecretString;
use tracing::trace;

/// Exclusive hold on one key. The key is released when the lease is dropped,
/// whether the call it guarded succeeded, failed or panicked.
#[must_use = "dropping a lease releases the key immediately"]
pub struct KeyLease<'a> {
    pool: &'a KeyPool,
    assignment: KeyAssignment,
}

impl<'a> KeyLease<'a> {
    pub(super) fn new(pool: &'a KeyPool, assignment: KeyAssignment) -> Self {
        trace!(key.index = assignment.index, "API key leased");
        Self { pool, assignment }
    }

    pub fn index(&self) -> usize {
        self.assignment.index
    }

    pub fn key(&self) -> &SecretString {
        &self.assignment.key
    }

    /// Releases the key now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        // The index came from this pool, so the lookup cannot fail.
        let _ = self.pool.release_key(self.assignment.index);
        trace!(key.index = self.assignment.index, "API key released");
    }
}

impl std::fmt::Debug for KeyLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("index", &self.assignment.index)
            .finish_non_exhaustive()
    }
}
