//! The RCU state cell: `StorageLeaf`, `StorageState`, and `RefState`.
//!
//! Every visible placement transition for a reference is a whole-object
//! swap of a [`StorageState`] behind an [`arc_swap::ArcSwap`], mirroring how
//! `cluster::state::ClusterState` keeps its `MembersView` lock-free and
//! always fresh for readers. There is no cyclic ownership to manage: old
//! snapshots are simply kept alive by whoever still holds an `Arc` to them.
//!
//! `data` and a leaf's `handle` are the two fields allowed to be filled in
//! after a state has already been published (background I/O completing
//! from absent to present, then firing `ready`). Both are
//! realized with [`OnceLock`] so that fill is a one-time, race-free
//! transition on the exact published instance rather than a fresh RCU swap
//! -- a second swap would orphan any reader already waiting on the first
//! instance's `ready`.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;

use crate::device::StorageDevice;
use crate::ready::Readiness;
use crate::value::Value;

/// An opaque, device-specific handle to a leaf's physical location (e.g. a
/// file path). Devices downcast this themselves; the engine never inspects it.
pub type LeafHandle = Arc<dyn Any + Send + Sync>;

/// One physical location (other than "resident in memory") holding a copy
/// of a reference's value.
///
/// The in-memory device is special-cased: it never appears in `leaves`.
/// Residency in RAM is represented directly by [`StorageState::data`].
pub struct StorageLeaf {
    /// The device that owns this physical location.
    pub device: Arc<dyn StorageDevice>,
    /// Device-specific handle. Empty while the leaf's backing I/O is still
    /// in flight; readers block on the owning state's `ready` before ever
    /// observing it, so an empty cell is never visible post-`ready`.
    handle: OnceLock<LeafHandle>,
    /// Suppresses medium-level deletion when this leaf is removed from the
    /// `leaves` list.
    pub retain: bool,
}

impl Clone for StorageLeaf {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            handle: self.handle.clone(),
            retain: self.retain,
        }
    }
}

impl fmt::Debug for StorageLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLeaf")
            .field("device", &self.device)
            .field("has_handle", &self.handle.get().is_some())
            .field("retain", &self.retain)
            .finish()
    }
}

impl StorageLeaf {
    /// A leaf with no handle yet (I/O in flight).
    #[must_use]
    pub fn new(device: Arc<dyn StorageDevice>) -> Self {
        Self {
            device,
            handle: OnceLock::new(),
            retain: false,
        }
    }

    /// A leaf whose handle is already known.
    #[must_use]
    pub fn with_handle(device: Arc<dyn StorageDevice>, handle: LeafHandle) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(handle);
        Self {
            device,
            handle: cell,
            retain: false,
        }
    }

    /// Returns `true` if `device` is the device that owns this leaf (identity,
    /// not structural, comparison).
    #[must_use]
    pub fn is_device(&self, device: &Arc<dyn StorageDevice>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }

    /// The leaf's handle, if it has been assigned.
    #[must_use]
    pub fn handle(&self) -> Option<LeafHandle> {
        self.handle.get().cloned()
    }

    #[must_use]
    pub fn has_handle(&self) -> bool {
        self.handle.get().is_some()
    }

    /// Fills a previously-empty handle. No-op if already filled.
    ///
    /// Only sound to call on a `StorageLeaf` belonging to a `StorageState`
    /// that has not yet fired `ready` -- see the module-level note.
    pub(crate) fn fill_handle(&self, handle: LeafHandle) {
        let _ = self.handle.set(handle);
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// An immutable-by-convention snapshot of where a reference's value lives.
///
/// Build new snapshots with the `with_*` copy-constructors so fields you
/// don't intend to change are inherited verbatim, per the RCU contract.
pub struct StorageState {
    /// The value, if currently resident in memory. Empty while a
    /// materializing read is in flight.
    data: OnceLock<Value>,
    /// Every non-memory physical location currently holding a copy, in
    /// insertion order. A device identity appears at most once.
    pub leaves: Vec<StorageLeaf>,
    /// The device that public entrypoints (`put`/`get`/`drop`) invoke.
    pub root: Arc<dyn StorageDevice>,
    /// Fires once every field above is safe to observe.
    pub ready: Arc<Readiness>,
}

impl fmt::Debug for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageState")
            .field("has_data", &self.data.get().is_some())
            .field("leaves", &self.leaves.len())
            .field("root", &self.root)
            .field("ready", &self.ready.is_fired())
            .finish()
    }
}

impl StorageState {
    fn data_cell(data: Option<Value>) -> OnceLock<Value> {
        let cell = OnceLock::new();
        if let Some(v) = data {
            let _ = cell.set(v);
        }
        cell
    }

    /// Builds a brand-new state (fresh, unfired readiness).
    #[must_use]
    pub fn new(data: Option<Value>, leaves: Vec<StorageLeaf>, root: Arc<dyn StorageDevice>) -> Self {
        Self {
            data: Self::data_cell(data),
            leaves,
            root,
            ready: Arc::new(Readiness::new()),
        }
    }

    /// Builds a brand-new, already-ready state.
    ///
    /// Used by transitions that complete synchronously (no background task
    /// will ever fire `ready` for them).
    #[must_use]
    pub fn new_ready(data: Option<Value>, leaves: Vec<StorageLeaf>, root: Arc<dyn StorageDevice>) -> Self {
        Self {
            data: Self::data_cell(data),
            leaves,
            root,
            ready: Arc::new(Readiness::fired()),
        }
    }

    /// The value, if resident in memory.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        self.data.get().cloned()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.get().is_some()
    }

    /// Fills a previously-empty `data` slot. No-op if already filled.
    ///
    /// Only sound on a state that has not yet fired `ready` -- see the
    /// module-level note.
    pub(crate) fn fill_data(&self, value: Value) {
        let _ = self.data.set(value);
    }

    /// Copy-constructor: same leaves/root, replaced `data`, fresh readiness.
    #[must_use]
    pub fn with_data(&self, data: Option<Value>) -> Self {
        Self::new(data, self.leaves.clone(), self.root.clone())
    }

    /// Copy-constructor: same data/root, replaced `leaves`, fresh readiness.
    #[must_use]
    pub fn with_leaves(&self, leaves: Vec<StorageLeaf>) -> Self {
        Self::new(self.data(), leaves, self.root.clone())
    }

    /// Copy-constructor: same data/leaves, replaced `root`, fresh readiness.
    #[must_use]
    pub fn with_root(&self, root: Arc<dyn StorageDevice>) -> Self {
        Self::new(self.data(), self.leaves.clone(), root)
    }

    /// Finds the leaf owned by `device`, if any.
    #[must_use]
    pub fn leaf_for(&self, device: &Arc<dyn StorageDevice>) -> Option<&StorageLeaf> {
        self.leaves.iter().find(|l| l.is_device(device))
    }

    /// Invariant 1: after `ready` fires, either `data` is present or at least
    /// one leaf has a non-absent handle.
    #[must_use]
    pub fn has_durable_copy(&self) -> bool {
        self.has_data() || self.leaves.iter().any(StorageLeaf::has_handle)
    }
}

/// Per-reference record: a fixed size estimate plus an RCU-swappable
/// [`StorageState`] pointer. Direct field access is intentionally
/// impossible from outside this module -- `storage_read`/`storage_rcu`
/// are the only way in or out.
pub struct RefState {
    /// Estimated size in bytes, fixed at creation.
    pub size: u64,
    storage: ArcSwap<StorageState>,
}

impl fmt::Debug for RefState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefState").field("size", &self.size).finish()
    }
}

impl RefState {
    #[must_use]
    pub fn new(size: u64, initial: StorageState) -> Self {
        Self {
            size,
            storage: ArcSwap::new(Arc::new(initial)),
        }
    }

    /// Atomically loads the current snapshot and waits for it to become ready.
    ///
    /// The result is a point-in-time snapshot; do not cache it across
    /// entrypoints, since a concurrent writer may have already replaced it.
    pub async fn storage_read(&self) -> Arc<StorageState> {
        let snapshot = self.storage.load_full();
        snapshot.ready.wait().await;
        snapshot
    }

    /// Atomically installs a new state built by `f` from the current one.
    ///
    /// `f` must be pure: it may be invoked more than once if a concurrent
    /// `storage_rcu` wins the race, and must always rebuild via one of
    /// `StorageState`'s copy-constructors. The returned state has NOT fired
    /// `ready` -- the caller owns firing it once the transition is complete.
    pub fn storage_rcu<F>(&self, mut f: F) -> Arc<StorageState>
    where
        F: FnMut(&StorageState) -> StorageState,
    {
        loop {
            let current = self.storage.load();
            let candidate = Arc::new(f(&current));
            let observed = self.storage.compare_and_swap(&current, candidate.clone());
            if Arc::ptr_eq(&observed, &current) {
                return candidate;
            }
            // Someone else installed a different state first; rebuild from
            // whatever is current now.
        }
    }

    /// Loads the current snapshot without waiting on `ready`.
    ///
    /// Only for internal bookkeeping (e.g. reading `root` to compare device
    /// identity before deciding whether a migration is even needed); never
    /// exposed to device implementations, which must go through
    /// `storage_read`.
    pub(crate) fn peek(&self) -> Arc<StorageState> {
        self.storage.load_full()
    }
}
