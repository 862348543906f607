//! Error types for the storage engine.
//!
//! A single closed enum covers every failure kind named in the engine's
//! contract: construction-time validation, capacity/resource mismatches,
//! the recency allocator's invariants, and background I/O failures.

use crate::RefId;

/// Errors produced by the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A capacity/availability query named a resource the device does not own.
    #[error("resource {resource} does not belong to device {device}")]
    InvalidResourceForDevice {
        device: &'static str,
        resource: &'static str,
    },

    /// A constructor argument violated a stated precondition.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A write to the recency allocator whose size exceeds both tier limits.
    #[error(
        "ref {ref_id} (size {size}) exceeds both tier limits (mem_limit={mem_limit}, device_limit={device_limit})"
    )]
    RefTooLarge {
        ref_id: RefId,
        size: u64,
        mem_limit: u64,
        device_limit: u64,
    },

    /// The recency allocator could not free enough space; accounting has drifted.
    #[error("migration invariant violated for ref {ref_id}: {detail}")]
    MigrationInvariantViolated { ref_id: RefId, detail: String },

    /// A read/delete/retain addressed a leaf that does not exist for the ref.
    #[error("ref {ref_id} has no leaf on device {device}")]
    MissingLeaf { ref_id: RefId, device: &'static str },

    /// A background write or read task failed.
    #[error("background I/O failed for ref {ref_id}: {source}")]
    BackgroundIoFailure {
        ref_id: RefId,
        #[source]
        source: std::io::Error,
    },

    /// The ref id is not known to the datastore (never created, or already dropped).
    #[error("unknown ref {0}")]
    UnknownRef(RefId),

    /// A read addressed a ref that the allocator has no record of in either tier.
    #[error("ref {0} is not present in any tier")]
    Missing(RefId),

    /// A background task panicked or was cancelled before completing.
    #[error("background task for ref {ref_id} did not complete: {detail}")]
    TaskFailure { ref_id: RefId, detail: String },

    /// The value codec could not decode a stored byte stream.
    #[error("value codec failed to decode: {0}")]
    Decode(String),
}
