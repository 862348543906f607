//! The device contract: every storage medium, leaf or composite, implements
//! this trait -- small, object-safe, used as `Arc<dyn StorageDevice>`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::resource::StorageResource;
use crate::state::RefState;
use crate::value::Value;
use crate::RefId;

/// A storage medium: either a leaf that performs real I/O, or a composite
/// that delegates to other devices (e.g. the recency allocator).
#[async_trait]
pub trait StorageDevice: Send + Sync + std::fmt::Debug {
    /// A short, stable name for error messages and logging.
    fn name(&self) -> &'static str;

    /// The resources this device draws capacity from.
    fn storage_resources(&self) -> Vec<Arc<dyn StorageResource>>;

    /// Capacity of `resource` as seen by this device, in bytes.
    ///
    /// Composite devices may override the raw resource capacity (e.g. the
    /// recency allocator reports `mem_limit` for `CpuRam`, not the host's
    /// total RAM).
    fn capacity(&self, resource: &dyn StorageResource) -> Result<u64, Error>;

    /// Available bytes of `resource` as seen by this device.
    fn available(&self, resource: &dyn StorageResource) -> Result<u64, Error>;

    /// `capacity(resource) - available(resource)`, saturating at zero.
    fn utilized(&self, resource: &dyn StorageResource) -> Result<u64, Error> {
        Ok(self
            .capacity(resource)?
            .saturating_sub(self.available(resource)?))
    }

    /// Whether this device's availability can change without the engine's
    /// involvement. Leaf devices default to `true`; the recency allocator
    /// (whose limits are fixed at construction) returns `false`.
    fn externally_varying(&self) -> bool {
        true
    }

    /// Ensures the value is physically present on this device.
    ///
    /// `handle` is an `Arc` to this same device, as held by the caller
    /// (typically `state.root` or a `StorageLeaf::device`). Implementations
    /// that need to check device identity -- "is this leaf mine?", "am I
    /// the root?" -- compare against `handle` rather than trying to
    /// recover an `Arc` to themselves from `&self`.
    async fn write_to_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error>;

    /// Returns the value if `ret`, otherwise performs accounting only
    /// (e.g. an LRU touch) without materializing it.
    async fn read_from_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
        ret: bool,
    ) -> Result<Option<Value>, Error>;

    /// Removes this device's leaf for the reference. Idempotent: a missing
    /// leaf is not an error.
    async fn delete_from_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error>;

    /// Sets the `retain` flag on this device's leaf for the reference (or,
    /// if `all` and this device is the root, on every leaf).
    async fn retain_on_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
        retain: bool,
        all: bool,
    ) -> Result<(), Error>;
}

/// Checks that `resource` belongs to `device`'s resource set, returning
/// [`Error::InvalidResourceForDevice`] otherwise.
pub fn require_owned_resource(
    device: &dyn StorageDevice,
    resource: &dyn StorageResource,
) -> Result<(), Error> {
    let owned = device
        .storage_resources()
        .iter()
        .any(|r| r.id() == resource.id());
    if owned {
        Ok(())
    } else {
        Err(Error::InvalidResourceForDevice {
            device: device.name(),
            resource: "unrecognized",
        })
    }
}
