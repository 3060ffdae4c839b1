/// A broken internal invariant of a [`HashStore`](crate::HashStore).
///
/// These are never the result of ordinary use: a missing key is reported as `None`, and races
/// between threads are retried internally. Seeing one of these means the store's chains are no
/// longer trustworthy, so the operation that found it stops right there. The message includes a
/// dump of the bucket array where that helps diagnose the fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    /// `delete_last` was told which key is last, but the last live entry holds another key.
    #[error("the last key was expected to hash to {expected_hash:#x} but the last entry hashes to {found_hash:#x}")]
    LastKeyMismatch {
        /// Hash of the key the caller expected to be last.
        expected_hash: u64,
        /// Hash of the last live entry.
        found_hash: u64,
    },

    /// An entry known to be linked could not be found in the lookup chain of its bucket.
    #[error("could not find the previous entry of {hash:#x} in bucket {index}\n{dump}")]
    PredecessorNotFound {
        /// Bucket the entry hashes to.
        index: usize,
        /// Stored hash of the entry.
        hash: u64,
        /// The searched bucket followed by the whole bucket array.
        dump: String,
    },

    /// [`HashStore::verify`](crate::HashStore::verify) found a violated invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),
}
