//! The process-wide reference table: `RefId -> RefState`, plus the global
//! default device used when a reference is first created.
//!
//! A lock-protected map guarding short critical sections, with the actual
//! I/O happening outside the lock, backed by `parking_lot::Mutex`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::device::StorageDevice;
use crate::error::Error;
use crate::state::{RefState, StorageState};
use crate::value::Value;
use crate::RefId;

/// The process-wide `RefId -> RefState` table and the global default device.
///
/// `put`/`get`/`drop`/`set_device` resolve a `RefId` to a `RefState` under
/// the table lock, release it, then invoke the device contract -- so the
/// lock is held only long enough to resolve an id, never across I/O.
pub struct Datastore {
    next_ref_id: AtomicU64,
    refs: Mutex<HashMap<RefId, Arc<RefState>>>,
    default_device: ArcSwap<Arc<dyn StorageDevice>>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("len", &self.refs.lock().len())
            .finish()
    }
}

impl Datastore {
    /// Creates an empty datastore whose initial default device is `device`.
    #[must_use]
    pub fn new(device: Arc<dyn StorageDevice>) -> Self {
        Self {
            next_ref_id: AtomicU64::new(1),
            refs: Mutex::new(HashMap::new()),
            default_device: ArcSwap::new(Arc::new(device)),
        }
    }

    /// Overwrites the global default device used by future `put` calls.
    /// Does not affect references already created.
    pub fn set_default_device(&self, device: Arc<dyn StorageDevice>) {
        self.default_device.store(Arc::new(device));
    }

    fn lookup(&self, ref_id: RefId) -> Result<Arc<RefState>, Error> {
        self.refs
            .lock()
            .get(&ref_id)
            .cloned()
            .ok_or(Error::UnknownRef(ref_id))
    }

    /// Creates a new reference holding `value` (estimated size `size` bytes),
    /// writes it to the current default device, and inserts it into the map.
    pub async fn put(&self, value: Value, size: u64) -> Result<RefId, Error> {
        let ref_id = self.next_ref_id.fetch_add(1, Ordering::Relaxed);
        let root = (*self.default_device.load_full()).clone();
        let state = StorageState::new_ready(Some(value), Vec::new(), root.clone());
        let ref_state = Arc::new(RefState::new(size, state));

        root.write_to_device(&root, &ref_state, ref_id).await?;
        self.refs.lock().insert(ref_id, ref_state);
        trace!(ref_id, "put ref into datastore");
        Ok(ref_id)
    }

    /// Materializes and returns the value for `ref_id`.
    pub async fn get(&self, ref_id: RefId) -> Result<Value, Error> {
        let ref_state = self.lookup(ref_id)?;
        let root = ref_state.storage_read().await.root.clone();
        root.read_from_device(&root, &ref_state, ref_id, true)
            .await?
            .ok_or(Error::Missing(ref_id))
    }

    /// Removes `ref_id` from its root device and from the map.
    pub async fn drop(&self, ref_id: RefId) -> Result<(), Error> {
        let ref_state = self.lookup(ref_id)?;
        let root = ref_state.storage_read().await.root.clone();
        root.delete_from_device(&root, &ref_state, ref_id).await?;
        self.refs.lock().remove(&ref_id);
        debug!(ref_id, "dropped ref from datastore");
        Ok(())
    }

    /// Re-parents `ref_id` onto `device`. A no-op if `device` is already the
    /// ref's root (idempotent re-application, per the engine's contract).
    pub async fn set_device(&self, ref_id: RefId, device: Arc<dyn StorageDevice>) -> Result<(), Error> {
        let ref_state = self.lookup(ref_id)?;
        let current = ref_state.storage_read().await;
        if Arc::ptr_eq(&current.root, &device) {
            return Ok(());
        }

        device.write_to_device(&device, &ref_state, ref_id).await?;
        let new_state = ref_state.storage_rcu(|cur| cur.with_root(device.clone()));
        new_state.ready.fire();
        debug!(ref_id, device = device.name(), "re-parented ref to new root device");
        Ok(())
    }

    /// Sets or clears the retain flag for `ref_id` on its current root
    /// device (or, if `all`, on every leaf through the root's delegation).
    pub async fn retain(&self, ref_id: RefId, retain: bool, all: bool) -> Result<(), Error> {
        let ref_state = self.lookup(ref_id)?;
        let root = ref_state.storage_read().await.root.clone();
        root.retain_on_device(&root, &ref_state, ref_id, retain, all).await
    }

    /// The estimated size in bytes recorded for `ref_id` at creation.
    pub fn size_of(&self, ref_id: RefId) -> Result<u64, Error> {
        self.lookup(ref_id).map(|r| r.size)
    }

    /// Number of references currently tracked.
    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::memory::CpuRamDevice;
    use crate::value::JsonValue;

    fn ram() -> Arc<dyn StorageDevice> {
        Arc::new(CpuRamDevice::new())
    }

    fn value(n: i64) -> Value {
        Arc::new(JsonValue::new(serde_json::json!(n)))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let ds = Datastore::new(ram());
        let ref_id = ds.put(value(42), 8).await.unwrap();
        let got = ds.get(ref_id).await.unwrap();
        assert!(crate::value::values_byte_equal(&value(42), &got));
    }

    #[tokio::test]
    async fn get_unknown_ref_fails() {
        let ds = Datastore::new(ram());
        let err = ds.get(999).await;
        assert!(matches!(err, Err(Error::UnknownRef(999))));
    }

    #[tokio::test]
    async fn drop_removes_ref_from_map() {
        let ds = Datastore::new(ram());
        let ref_id = ds.put(value(1), 8).await.unwrap();
        assert_eq!(ds.len(), 1);
        ds.drop(ref_id).await.unwrap();
        assert_eq!(ds.len(), 0);
        assert!(matches!(ds.get(ref_id).await, Err(Error::UnknownRef(_))));
    }

    #[tokio::test]
    async fn set_device_to_current_root_is_noop() {
        let device = ram();
        let ds = Datastore::new(device.clone());
        let ref_id = ds.put(value(1), 8).await.unwrap();
        ds.set_device(ref_id, device).await.unwrap();
    }

    #[tokio::test]
    async fn set_device_reparents_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ds = Datastore::new(ram());
        let ref_id = ds.put(value(7), 8).await.unwrap();

        let config = crate::devices::file::FileDeviceConfig::new(dir.path().to_path_buf());
        let codec: Arc<dyn crate::value::ValueCodec> = Arc::new(crate::value::JsonCodec);
        let file_dev: Arc<dyn StorageDevice> =
            Arc::new(crate::devices::file::SerializationFileDevice::new(config, codec).unwrap());

        ds.set_device(ref_id, file_dev.clone()).await.unwrap();
        ds.set_device(ref_id, file_dev).await.unwrap();

        let got = ds.get(ref_id).await.unwrap();
        assert!(crate::value::values_byte_equal(&value(7), &got));
    }
}
