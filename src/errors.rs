//! Typed error surface for the dedupe core.
//!
//! The core returns `DedupeError` so callers can match on `OptimisticConflict`
//! and retry; everything above the core (CLI, driver) deals in `anyhow::Result`.

use thiserror::Error;

pub type CardId = u32;

#[derive(Error, Debug)]
pub enum DedupeError {
    /// A watched key changed between the first read and the commit attempt.
    /// Recovered by the `Processor`, which restarts the whole unit of work.
    #[error("optimistic lock conflict on key `{key}`")]
    OptimisticConflict { key: String },

    /// The evidence store has no fulltext for this card.
    #[error("no fulltext for card {0}")]
    MissingCard(CardId),

    /// A sentence shard's byte length is not a multiple of the 11-byte record size.
    #[error("corrupt sentence shard `{key}`: {len} bytes is not a multiple of 11")]
    CorruptShard { key: String, len: usize },

    /// A `SB:<key>` hash contained a field prefix other than `bs`, `c`, or `m`.
    #[error("invalid field `{field}` in SubBucket hash `{key}`")]
    InvalidHashKey { key: String, field: String },

    /// The backing store rejected the request for reasons unrelated to optimistic
    /// locking (connection loss, corruption at the transport layer, etc).
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DedupeError {
    pub fn is_optimistic_conflict(&self) -> bool {
        matches!(self, DedupeError::OptimisticConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, DedupeError>;
