//! In-memory leaf device.
//!
//! [`CpuRamDevice`] is the simplest leaf: its handle *is* the value. Unlike
//! [`SerializationFileDevice`](super::file::SerializationFileDevice) it
//! holds no per-reference bookkeeping of its own -- residency is expressed
//! directly by `StorageState::data`, so the device itself is effectively
//! stateless and safe to share as a single process-wide instance.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::device::StorageDevice;
use crate::error::Error;
use crate::resource::{CpuRamResource, StorageResource};
use crate::state::RefState;
use crate::value::Value;
use crate::RefId;

/// The in-memory leaf device. Draws capacity from a single [`CpuRamResource`].
pub struct CpuRamDevice {
    resource: Arc<CpuRamResource>,
}

impl std::fmt::Debug for CpuRamDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuRamDevice").finish()
    }
}

impl CpuRamDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            resource: Arc::new(CpuRamResource::new()),
        }
    }
}

impl Default for CpuRamDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDevice for CpuRamDevice {
    fn name(&self) -> &'static str {
        "CpuRamDevice"
    }

    fn storage_resources(&self) -> Vec<Arc<dyn StorageResource>> {
        vec![self.resource.clone()]
    }

    fn capacity(&self, resource: &dyn StorageResource) -> Result<u64, Error> {
        crate::device::require_owned_resource(self, resource)?;
        Ok(resource.capacity())
    }

    fn available(&self, resource: &dyn StorageResource) -> Result<u64, Error> {
        crate::device::require_owned_resource(self, resource)?;
        Ok(resource.available())
    }

    async fn write_to_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error> {
        let current = state.storage_read().await;
        if current.has_data() {
            return Ok(());
        }
        // Pull bytes back from whichever leaf currently holds them.
        let leaf = current
            .leaves
            .first()
            .ok_or(Error::MissingLeaf { ref_id, device: self.name() })?;
        let value = leaf
            .device
            .clone()
            .read_from_device(&leaf.device.clone(), state, ref_id, true)
            .await?
            .ok_or(Error::MissingLeaf { ref_id, device: self.name() })?;

        let new_state = state.storage_rcu(|cur| cur.with_data(Some(value.clone())));
        new_state.ready.fire();
        trace!(ref_id, "installed in-memory data");
        Ok(())
    }

    async fn read_from_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
        ret: bool,
    ) -> Result<Option<Value>, Error> {
        let current = state.storage_read().await;
        if let Some(value) = current.data() {
            return Ok(ret.then_some(value));
        }
        let leaf = current
            .leaves
            .first()
            .ok_or(Error::MissingLeaf { ref_id, device: self.name() })?;
        leaf.device
            .clone()
            .read_from_device(&leaf.device.clone(), state, ref_id, ret)
            .await
    }

    async fn delete_from_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error> {
        let new_state = state.storage_rcu(|cur| cur.with_data(None));
        new_state.ready.fire();
        trace!(ref_id, "evicted in-memory data");
        Ok(())
    }

    async fn retain_on_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        _state: &Arc<RefState>,
        _ref_id: RefId,
        _retain: bool,
        _all: bool,
    ) -> Result<(), Error> {
        // Retention in memory is not expressible: there is no leaf entry to
        // flag, so memory-only residency simply releases on delete
        // regardless of `retain`.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StorageState;
    use crate::value::JsonValue;

    fn device() -> Arc<dyn StorageDevice> {
        Arc::new(CpuRamDevice::new())
    }

    #[tokio::test]
    async fn write_is_noop_when_data_already_present() {
        let dev = device();
        let value: Value = Arc::new(JsonValue::new(serde_json::json!("hi")));
        let state = StorageState::new_ready(Some(value), Vec::new(), dev.clone());
        let ref_state = Arc::new(RefState::new(10, state));

        dev.write_to_device(&dev, &ref_state, 1).await.unwrap();
        let snap = ref_state.storage_read().await;
        assert!(snap.data().is_some());
    }

    #[tokio::test]
    async fn delete_clears_data() {
        let dev = device();
        let value: Value = Arc::new(JsonValue::new(serde_json::json!(1)));
        let state = StorageState::new_ready(Some(value), Vec::new(), dev.clone());
        let ref_state = Arc::new(RefState::new(10, state));

        dev.delete_from_device(&dev, &ref_state, 1).await.unwrap();
        let snap = ref_state.storage_read().await;
        assert!(snap.data().is_none());
    }
}
