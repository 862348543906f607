//! Storage resources: identities of physical media with best-effort
//! capacity/availability accounting.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sysinfo::{Disks, System};

/// Identity of a [`StorageResource`], used by devices to validate that a
/// queried resource actually belongs to them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    CpuRam,
    Filesystem(PathBuf),
    Custom(String),
}

/// A physical (or logical) storage medium. All queries are best-effort: the
/// engine does not enforce capacity strictly because size estimates are
/// inexact (see the crate's non-goals).
pub trait StorageResource: Send + Sync + std::fmt::Debug {
    /// Stable identity used for membership checks against a device.
    fn id(&self) -> ResourceId;

    /// Total capacity of the medium, in bytes.
    fn capacity(&self) -> u64;

    /// Currently available (free) space, in bytes.
    fn available(&self) -> u64;

    /// `capacity() - available()`, saturating at zero.
    fn utilized(&self) -> u64 {
        self.capacity().saturating_sub(self.available())
    }
}

/// The process's RAM, as a single, process-wide resource.
///
/// `available()` prefers the kernel's "available memory" accounting over
/// naive "free memory", since on most systems free memory is deflated by
/// reclaimable page cache.
pub struct CpuRamResource {
    sys: Mutex<System>,
}

impl std::fmt::Debug for CpuRamResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuRamResource").finish()
    }
}

impl CpuRamResource {
    #[must_use]
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self { sys: Mutex::new(sys) }
    }
}

impl Default for CpuRamResource {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageResource for CpuRamResource {
    fn id(&self) -> ResourceId {
        ResourceId::CpuRam
    }

    fn capacity(&self) -> u64 {
        let mut sys = self.sys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        sys.refresh_memory();
        sys.total_memory()
    }

    fn available(&self) -> u64 {
        let mut sys = self.sys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        sys.refresh_memory();
        sys.available_memory()
    }
}

/// A filesystem mounted (or rooted) at `mountpoint`.
pub struct FilesystemResource {
    mountpoint: PathBuf,
    disks: Mutex<Disks>,
}

impl std::fmt::Debug for FilesystemResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemResource")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

impl FilesystemResource {
    #[must_use]
    pub fn new(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Finds the disk whose mount point is the longest prefix of `mountpoint`.
    ///
    /// Falls back to `None` when no disk list entry matches (e.g. in
    /// sandboxed test environments); callers treat that as "unknown", not
    /// an error, per the best-effort accounting contract.
    fn matching_disk<'a>(&self, disks: &'a Disks) -> Option<&'a sysinfo::Disk> {
        disks
            .list()
            .iter()
            .filter(|d| self.mountpoint.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
    }
}

impl StorageResource for FilesystemResource {
    fn id(&self) -> ResourceId {
        ResourceId::Filesystem(self.mountpoint.clone())
    }

    fn capacity(&self) -> u64 {
        let mut disks = self.disks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        disks.refresh(true);
        self.matching_disk(&disks).map_or(0, sysinfo::Disk::total_space)
    }

    fn available(&self) -> u64 {
        let mut disks = self.disks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        disks.refresh(true);
        self.matching_disk(&disks).map_or(0, sysinfo::Disk::available_space)
    }
}
