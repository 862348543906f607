//! The two-tier recency allocator.
//!
//! [`SimpleRecencyAllocator`] composes an upper (memory) and a lower
//! (secondary) device, moving references between them as writes and reads
//! push either tier over its configured byte limit. It is the one device
//! in this crate with real internal state (two ordered `RefId` lists, a
//! size cache, and hit/miss/evict counters), grounded on the orchestration
//! shape of `storage::impls::default_record_store::DefaultRecordStore`
//! (coordinating two backing layers under one lock) and the counters-style
//! bookkeeping of `storage::mutation_observer`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::device::StorageDevice;
use crate::error::Error;
use crate::resource::StorageResource;
use crate::state::RefState;
use crate::value::Value;
use crate::RefId;

/// Eviction policy for both tiers of a [`SimpleRecencyAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least-recently-used entry first.
    Lru,
    /// Evict the most-recently-used entry first.
    Mru,
}

/// Point-in-time snapshot of the allocator's hit/miss/evict counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecencyStats {
    pub hits: u64,
    pub misses: u64,
    pub evicts: u64,
}

/// Validated configuration for [`SimpleRecencyAllocator`].
#[derive(Clone)]
pub struct RecencyConfig {
    pub mem_limit: u64,
    pub device_limit: u64,
    pub upper: Arc<dyn StorageDevice>,
    pub lower: Arc<dyn StorageDevice>,
    pub policy: EvictionPolicy,
    pub retain: bool,
}

impl RecencyConfig {
    #[must_use]
    pub fn new(
        mem_limit: u64,
        device_limit: u64,
        upper: Arc<dyn StorageDevice>,
        lower: Arc<dyn StorageDevice>,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            mem_limit,
            device_limit,
            upper,
            lower,
            policy,
            retain: false,
        }
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

struct Inner {
    /// Most recent at the head.
    mem_refs: Vec<RefId>,
    device_refs: Vec<RefId>,
    ref_cache: HashMap<RefId, Arc<RefState>>,
    retain: bool,
}

impl Inner {
    fn size_of(&self, id: RefId) -> u64 {
        self.ref_cache.get(&id).map_or(0, |s| s.size)
    }

    fn tier(&self, to_mem: bool) -> &[RefId] {
        if to_mem {
            &self.mem_refs
        } else {
            &self.device_refs
        }
    }

    fn tier_mut(&mut self, to_mem: bool) -> &mut Vec<RefId> {
        if to_mem {
            &mut self.mem_refs
        } else {
            &mut self.device_refs
        }
    }
}

/// Two-tier swap-to-disk allocator: fixed byte limits per tier, LRU or MRU
/// eviction, hit/miss/evict counters.
pub struct SimpleRecencyAllocator {
    mem_limit: u64,
    device_limit: u64,
    upper: Arc<dyn StorageDevice>,
    lower: Arc<dyn StorageDevice>,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evicts: AtomicU64,
    mem_used: AtomicU64,
    device_used: AtomicU64,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SimpleRecencyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleRecencyAllocator")
            .field("mem_limit", &self.mem_limit)
            .field("device_limit", &self.device_limit)
            .field("policy", &self.policy)
            .finish()
    }
}

impl SimpleRecencyAllocator {
    /// Validates `config` and constructs the allocator.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if either limit is zero.
    pub fn new(config: RecencyConfig) -> Result<Self, Error> {
        if config.mem_limit == 0 {
            return Err(Error::InvalidConfig("mem_limit must be > 0".into()));
        }
        if config.device_limit == 0 {
            return Err(Error::InvalidConfig("device_limit must be > 0".into()));
        }
        Ok(Self {
            mem_limit: config.mem_limit,
            device_limit: config.device_limit,
            upper: config.upper,
            lower: config.lower,
            policy: config.policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicts: AtomicU64::new(0),
            mem_used: AtomicU64::new(0),
            device_used: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                mem_refs: Vec::new(),
                device_refs: Vec::new(),
                ref_cache: HashMap::new(),
                retain: config.retain,
            }),
        })
    }

    /// A snapshot of the allocator's counters.
    pub async fn stats(&self) -> RecencyStats {
        RecencyStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicts: self.evicts.load(Ordering::Relaxed),
        }
    }

    /// Current contents of the memory tier, most recent first.
    pub async fn mem_refs(&self) -> Vec<RefId> {
        self.inner.lock().await.mem_refs.clone()
    }

    /// Current contents of the device tier, most recent first.
    pub async fn device_refs(&self) -> Vec<RefId> {
        self.inner.lock().await.device_refs.clone()
    }

    fn device_for(&self, to_mem: bool) -> &Arc<dyn StorageDevice> {
        if to_mem {
            &self.upper
        } else {
            &self.lower
        }
    }

    fn limit_for(&self, to_mem: bool) -> u64 {
        if to_mem {
            self.mem_limit
        } else {
            self.device_limit
        }
    }

    fn track_move(&self, to_mem_destination: bool, delta: i64) {
        let counter = if to_mem_destination {
            &self.mem_used
        } else {
            &self.device_used
        };
        if delta >= 0 {
            counter.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            counter.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    /// Runs one migration planning-and-execution pass: frees space in the
    /// destination tier (`to_mem`), places `ref_id` there, and evicts the
    /// stale copy from the spillover tier if one exists.
    async fn sra_migrate(
        &self,
        guard: &mut Inner,
        state: &Arc<RefState>,
        ref_id: RefId,
        to_mem: bool,
        read: bool,
    ) -> Result<Option<Value>, Error> {
        let from_device = self.device_for(to_mem).clone();
        let to_device = self.device_for(!to_mem).clone();
        let from_limit = self.limit_for(to_mem);
        let to_limit = self.limit_for(!to_mem);

        let ref_size = state.size;
        let mru = self.policy == EvictionPolicy::Mru;

        let from_refs = guard.tier(to_mem).to_vec();
        let mut from_size: u64 = from_refs.iter().map(|&id| guard.size_of(id)).sum();
        let mut to_size: u64 = guard.tier(!to_mem).iter().map(|&id| guard.size_of(id)).sum();

        // Entries are kept most-recent-at-head regardless of tier. LRU
        // evicts the tail (oldest) first; MRU evicts the head (newest) first.
        let scan_order: Vec<RefId> = if mru {
            from_refs.clone()
        } else {
            from_refs.iter().rev().copied().collect()
        };

        let mut write_list: Vec<RefId> = Vec::new();
        for victim_id in scan_order {
            if ref_size + from_size <= from_limit {
                break;
            }
            let victim_size = guard.size_of(victim_id);
            if victim_size + to_size <= to_limit {
                write_list.push(victim_id);
                from_size = from_size.saturating_sub(victim_size);
                to_size += victim_size;
            }
        }

        if ref_size + from_size > from_limit {
            return Err(Error::MigrationInvariantViolated {
                ref_id,
                detail: format!(
                    "could not free {from_limit} bytes in destination tier for ref of size {ref_size}"
                ),
            });
        }

        for victim_id in &write_list {
            let victim_state = guard
                .ref_cache
                .get(victim_id)
                .cloned()
                .ok_or(Error::Missing(*victim_id))?;
            to_device
                .write_to_device(&to_device, &victim_state, *victim_id)
                .await?;
            from_device
                .delete_from_device(&from_device, &victim_state, *victim_id)
                .await?;
            let size = victim_state.size;
            self.track_move(to_mem, -(i64::try_from(size).unwrap_or(i64::MAX)));
            self.track_move(!to_mem, i64::try_from(size).unwrap_or(i64::MAX));
            debug!(ref_id = victim_id, to_mem, "evicted ref to spillover tier");
        }
        if !write_list.is_empty() {
            self.evicts.fetch_add(write_list.len() as u64, Ordering::Relaxed);
            let from_list = guard.tier_mut(to_mem);
            from_list.retain(|id| !write_list.contains(id));
            let to_list = guard.tier_mut(!to_mem);
            for id in &write_list {
                to_list.push(*id);
            }
        }

        from_device.write_to_device(&from_device, state, ref_id).await?;
        let already_in_tier = guard.tier(to_mem).contains(&ref_id);
        guard.tier_mut(to_mem).retain(|&id| id != ref_id);
        guard.tier_mut(to_mem).insert(0, ref_id);
        if !already_in_tier {
            self.track_move(to_mem, i64::try_from(ref_size).unwrap_or(i64::MAX));
        }

        let to_list = guard.tier_mut(!to_mem);
        if let Some(pos) = to_list.iter().position(|&id| id == ref_id) {
            to_list.remove(pos);
            to_device.delete_from_device(&to_device, state, ref_id).await?;
            self.track_move(!to_mem, -(i64::try_from(ref_size).unwrap_or(i64::MAX)));
        }

        if read {
            from_device.read_from_device(&from_device, state, ref_id, true).await
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl StorageDevice for SimpleRecencyAllocator {
    fn name(&self) -> &'static str {
        "SimpleRecencyAllocator"
    }

    fn storage_resources(&self) -> Vec<Arc<dyn StorageResource>> {
        let mut resources = self.upper.storage_resources();
        resources.extend(self.lower.storage_resources());
        resources
    }

    fn capacity(&self, resource: &dyn StorageResource) -> Result<u64, Error> {
        if self.upper.storage_resources().iter().any(|r| r.id() == resource.id()) {
            Ok(self.mem_limit)
        } else if self.lower.storage_resources().iter().any(|r| r.id() == resource.id()) {
            Ok(self.device_limit)
        } else {
            Err(Error::InvalidResourceForDevice {
                device: self.name(),
                resource: "unrecognized",
            })
        }
    }

    fn available(&self, resource: &dyn StorageResource) -> Result<u64, Error> {
        if self.upper.storage_resources().iter().any(|r| r.id() == resource.id()) {
            Ok(self
                .mem_limit
                .saturating_sub(self.mem_used.load(Ordering::Relaxed)))
        } else if self.lower.storage_resources().iter().any(|r| r.id() == resource.id()) {
            Ok(self
                .device_limit
                .saturating_sub(self.device_used.load(Ordering::Relaxed)))
        } else {
            Err(Error::InvalidResourceForDevice {
                device: self.name(),
                resource: "unrecognized",
            })
        }
    }

    fn externally_varying(&self) -> bool {
        false
    }

    async fn write_to_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let already_present = guard.ref_cache.contains_key(&ref_id);
        guard.ref_cache.insert(ref_id, state.clone());

        if !already_present && state.size > self.mem_limit && state.size > self.device_limit {
            guard.ref_cache.remove(&ref_id);
            return Err(Error::RefTooLarge {
                ref_id,
                size: state.size,
                mem_limit: self.mem_limit,
                device_limit: self.device_limit,
            });
        }

        self.sra_migrate(&mut guard, state, ref_id, true, false).await?;
        trace!(ref_id, "wrote ref through recency allocator");
        Ok(())
    }

    async fn read_from_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
        ret: bool,
    ) -> Result<Option<Value>, Error> {
        let mut guard = self.inner.lock().await;
        if let Some(pos) = guard.mem_refs.iter().position(|&id| id == ref_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            let id = guard.mem_refs.remove(pos);
            guard.mem_refs.insert(0, id);
            self.upper.read_from_device(&self.upper, state, ref_id, ret).await
        } else if guard.device_refs.contains(&ref_id) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.sra_migrate(&mut guard, state, ref_id, true, true).await
        } else {
            Err(Error::Missing(ref_id))
        }
    }

    async fn delete_from_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        let retain = guard.retain;

        if let Some(pos) = guard.mem_refs.iter().position(|&id| id == ref_id) {
            if retain {
                // Memory has no leaf to retain a handle on; the only way to
                // honor `retain` for a memory-resident ref is to push it to
                // the lower tier first, then delete it there the same way
                // device-resident refs are retained (leaf-level retain, not
                // a surviving `ref_cache` entry).
                self.sra_migrate(&mut guard, state, ref_id, false, false).await?;
                self.lower
                    .retain_on_device(&self.lower, state, ref_id, true, false)
                    .await?;
                self.lower.delete_from_device(&self.lower, state, ref_id).await?;
                if let Some(p) = guard.device_refs.iter().position(|&id| id == ref_id) {
                    guard.device_refs.remove(p);
                }
            } else {
                self.upper.delete_from_device(&self.upper, state, ref_id).await?;
                guard.mem_refs.remove(pos);
                self.track_move(true, -(i64::try_from(state.size).unwrap_or(i64::MAX)));
            }
            guard.ref_cache.remove(&ref_id);
            debug!(ref_id, "deleted ref from recency allocator (was in memory)");
            return Ok(());
        }

        if let Some(pos) = guard.device_refs.iter().position(|&id| id == ref_id) {
            if retain {
                self.lower
                    .retain_on_device(&self.lower, state, ref_id, true, false)
                    .await?;
            }
            self.lower.delete_from_device(&self.lower, state, ref_id).await?;
            guard.device_refs.remove(pos);
            guard.ref_cache.remove(&ref_id);
            self.track_move(false, -(i64::try_from(state.size).unwrap_or(i64::MAX)));
            debug!(ref_id, "deleted ref from recency allocator (was on device)");
            return Ok(());
        }

        Err(Error::Missing(ref_id))
    }

    async fn retain_on_device(
        &self,
        _handle: &Arc<dyn StorageDevice>,
        _state: &Arc<RefState>,
        _ref_id: RefId,
        retain: bool,
        _all: bool,
    ) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        guard.retain = retain;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::memory::CpuRamDevice;
    use crate::state::StorageState;
    use crate::value::JsonValue;

    fn value(n: usize) -> Value {
        Arc::new(JsonValue::new(serde_json::json!("x".repeat(n))))
    }

    fn new_ref(dev: &Arc<dyn StorageDevice>, size: u64, v: Value) -> Arc<RefState> {
        let state = StorageState::new_ready(Some(v), Vec::new(), dev.clone());
        Arc::new(RefState::new(size, state))
    }

    async fn lru_allocator(dir: &std::path::Path, mem_limit: u64, device_limit: u64) -> Arc<dyn StorageDevice> {
        let upper: Arc<dyn StorageDevice> = Arc::new(CpuRamDevice::new());
        let config = crate::devices::file::FileDeviceConfig::new(dir.to_path_buf());
        let codec: Arc<dyn crate::value::ValueCodec> = Arc::new(crate::value::JsonCodec);
        let lower: Arc<dyn StorageDevice> =
            Arc::new(crate::devices::file::SerializationFileDevice::new(config, codec).unwrap());
        let cfg = RecencyConfig::new(mem_limit, device_limit, upper, lower, EvictionPolicy::Lru);
        Arc::new(SimpleRecencyAllocator::new(cfg).unwrap())
    }

    #[test]
    fn zero_limit_is_invalid_config() {
        let upper: Arc<dyn StorageDevice> = Arc::new(CpuRamDevice::new());
        let lower: Arc<dyn StorageDevice> = Arc::new(CpuRamDevice::new());
        let cfg = RecencyConfig::new(0, 100, upper, lower, EvictionPolicy::Lru);
        assert!(matches!(
            SimpleRecencyAllocator::new(cfg),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn write_too_large_rolls_back_ref_cache() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = lru_allocator(dir.path(), 100, 100).await;
        let state = new_ref(&allocator, 500, value(1));

        let err = allocator.write_to_device(&allocator, &state, 1).await;
        assert!(matches!(err, Err(Error::RefTooLarge { .. })));

        // retrying with a too-large ref must still fail (ref_cache untouched).
        let err2 = allocator.write_to_device(&allocator, &state, 1).await;
        assert!(matches!(err2, Err(Error::RefTooLarge { .. })));
    }

    #[tokio::test]
    async fn lru_policy_evicts_oldest_on_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let allocator: Arc<SimpleRecencyAllocator> = {
            let upper: Arc<dyn StorageDevice> = Arc::new(CpuRamDevice::new());
            let config = crate::devices::file::FileDeviceConfig::new(dir.path().to_path_buf());
            let codec: Arc<dyn crate::value::ValueCodec> = Arc::new(crate::value::JsonCodec);
            let lower: Arc<dyn StorageDevice> =
                Arc::new(crate::devices::file::SerializationFileDevice::new(config, codec).unwrap());
            let cfg = RecencyConfig::new(100, 1000, upper, lower, EvictionPolicy::Lru);
            Arc::new(SimpleRecencyAllocator::new(cfg).unwrap())
        };
        let device: Arc<dyn StorageDevice> = allocator.clone();

        let a = new_ref(&device, 60, value(10));
        device.write_to_device(&device, &a, 1).await.unwrap();
        let b = new_ref(&device, 60, value(10));
        device.write_to_device(&device, &b, 2).await.unwrap();

        // A was written first, so it is the least-recently-used entry and
        // should have been evicted to the device tier when B arrived.
        assert_eq!(allocator.mem_refs().await, vec![2]);
        assert_eq!(allocator.device_refs().await, vec![1]);
        assert_eq!(allocator.stats().await.evicts, 1);
    }

    #[tokio::test]
    async fn read_miss_promotes_ref_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let allocator: Arc<SimpleRecencyAllocator> = {
            let upper: Arc<dyn StorageDevice> = Arc::new(CpuRamDevice::new());
            let config = crate::devices::file::FileDeviceConfig::new(dir.path().to_path_buf());
            let codec: Arc<dyn crate::value::ValueCodec> = Arc::new(crate::value::JsonCodec);
            let lower: Arc<dyn StorageDevice> =
                Arc::new(crate::devices::file::SerializationFileDevice::new(config, codec).unwrap());
            let cfg = RecencyConfig::new(100, 1000, upper, lower, EvictionPolicy::Lru);
            Arc::new(SimpleRecencyAllocator::new(cfg).unwrap())
        };
        let device: Arc<dyn StorageDevice> = allocator.clone();

        let a = new_ref(&device, 60, value(10));
        device.write_to_device(&device, &a, 1).await.unwrap();
        let b = new_ref(&device, 60, value(10));
        device.write_to_device(&device, &b, 2).await.unwrap();
        assert_eq!(allocator.device_refs().await, vec![1]);

        let got = device.read_from_device(&device, &a, 1, true).await.unwrap();
        assert!(got.is_some());

        // reading A promotes it back to memory, which in turn evicts B.
        assert_eq!(allocator.mem_refs().await, vec![1]);
        assert_eq!(allocator.device_refs().await, vec![2]);
        assert_eq!(allocator.stats().await.misses, 1);
        assert_eq!(allocator.stats().await.evicts, 2);
    }

    #[tokio::test]
    async fn delete_without_retain_removes_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = lru_allocator(dir.path(), 100, 1000).await;

        let a = new_ref(&allocator, 10, value(1));
        allocator.write_to_device(&allocator, &a, 1).await.unwrap();
        allocator.delete_from_device(&allocator, &a, 1).await.unwrap();

        let err = allocator.read_from_device(&allocator, &a, 1, true).await;
        assert!(matches!(err, Err(Error::Missing(1))));
    }
}
