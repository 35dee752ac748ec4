//! The crate's error taxonomy.

use thiserror::Error;

/// Everything that can go wrong calling into this crate.
#[derive(Debug, Error)]
pub enum CustomLabelsError {
    /// A heap allocation failed. Whatever operation was in progress has been rolled back; the
    /// affected label set or map is left in its pre-call state.
    #[error("allocation failed")]
    AllocFailed,

    /// `propagate` was called with a `child_id` that already had an entry. The stale entry has
    /// been released and replaced with the new one; this is reported for visibility, not
    /// because anything is broken.
    #[error("child id already had an entry, which was replaced")]
    ChildAlreadyExisted,

    /// The caller violated a boundary contract: too many labels, an oversized key or value, or
    /// a malformed argument. No state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// This crate's result alias.
pub type Result<T> = std::result::Result<T, CustomLabelsError>;
