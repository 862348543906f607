//! `refvault`: a per-process reference-counted storage engine.
//!
//! A [`Datastore`] owns a table of [`RefId`] to [`state::RefState`]. Each
//! reference's physical placement -- resident in memory, spilled to a leaf
//! device, or managed by a two-tier [`devices::recency::SimpleRecencyAllocator`]
//! -- is an RCU-swapped [`state::StorageState`] snapshot, so readers never
//! observe a torn transition.
//!
//! Values are opaque: callers implement [`value::ValueHandle`] for their
//! payload type and supply a [`value::ValueCodec`] to decode bytes back.
//! [`value::JsonValue`]/[`value::JsonCodec`] are provided as a default.

pub mod datastore;
pub mod device;
pub mod devices;
pub mod error;
pub mod ready;
pub mod resource;
pub mod state;
pub mod value;

pub use datastore::Datastore;
pub use device::StorageDevice;
pub use error::Error;
pub use value::{Value, ValueCodec, ValueHandle};

/// Unique, process-local identifier for a managed reference.
pub type RefId = u64;
