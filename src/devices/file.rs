//! Serialization file leaf device.
//!
//! [`SerializationFileDevice`] spills a value to a unique file under a
//! configured directory, optionally wrapped by a stack of [`ByteFilter`]s
//! (compression, encryption, ...). Each write/read dispatches its I/O to a
//! background task and rendezvous through the state's `ready` event, per
//! the engine's RCU contract.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::device::StorageDevice;
use crate::error::Error;
use crate::ready::Readiness;
use crate::resource::{FilesystemResource, StorageResource};
use crate::state::{RefState, StorageLeaf};
use crate::value::{Value, ValueCodec};
use crate::RefId;

/// Spawns `fut` as a background task and supervises it with a second task
/// that joins the handle.
///
/// If `fut` panics before it fires `ready` itself (every success/failure
/// path inside `fut` is expected to fire it), the monitor fires `ready` on
/// its behalf and logs [`Error::TaskFailure`] -- otherwise a panicked task
/// would leave every current and future `ready.wait()` caller hanging
/// forever.
fn spawn_supervised<F>(ref_id: RefId, ready: Arc<Readiness>, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(join_err) = handle.await {
            let err = Error::TaskFailure {
                ref_id,
                detail: join_err.to_string(),
            };
            error!(ref_id, error = %err, "file device background task did not complete");
            ready.fire();
        }
    });
}

/// A stackable byte-stream transform applied around the serialized value.
///
/// Filters compose like middleware: the first filter in the device's
/// configured list is outermost on disk (applied last on write, peeled
/// first on read).
pub trait ByteFilter: Send + Sync + std::fmt::Debug {
    fn encode(&self, input: Vec<u8>) -> Result<Vec<u8>, Error>;
    fn decode(&self, input: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// Gzip compression filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipFilter;

impl ByteFilter for GzipFilter {
    fn encode(&self, input: Vec<u8>) -> Result<Vec<u8>, Error> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&input)
            .map_err(|e| Error::Decode(format!("gzip encode: {e}")))?;
        encoder
            .finish()
            .map_err(|e| Error::Decode(format!("gzip encode: {e}")))
    }

    fn decode(&self, input: Vec<u8>) -> Result<Vec<u8>, Error> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let mut decoder = GzDecoder::new(input.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Decode(format!("gzip decode: {e}")))?;
        Ok(out)
    }
}

/// Demonstrative XOR "encryption" filter, useful mainly for exercising the
/// filter-chain machinery in tests.
#[derive(Debug, Clone)]
pub struct XorFilter {
    key: Vec<u8>,
}

impl XorFilter {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn apply(&self, mut input: Vec<u8>) -> Vec<u8> {
        if self.key.is_empty() {
            return input;
        }
        for (i, byte) in input.iter_mut().enumerate() {
            *byte ^= self.key[i % self.key.len()];
        }
        input
    }
}

impl ByteFilter for XorFilter {
    fn encode(&self, input: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(self.apply(input))
    }

    fn decode(&self, input: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(self.apply(input))
    }
}

/// Runs the write-side filter chain: outermost filter (index 0) wraps last.
fn encode_chain(filters: &[Arc<dyn ByteFilter>], bytes: Vec<u8>) -> Result<Vec<u8>, Error> {
    filters.iter().rev().try_fold(bytes, |acc, f| f.encode(acc))
}

/// Runs the read-side filter chain: outermost filter (index 0) peels first.
fn decode_chain(filters: &[Arc<dyn ByteFilter>], bytes: Vec<u8>) -> Result<Vec<u8>, Error> {
    filters.iter().try_fold(bytes, |acc, f| f.decode(acc))
}

/// Device-specific handle for a value spilled to a file.
///
/// Carries only a local path and size -- cross-host addressing is an
/// explicit non-goal of the engine-local contract this device implements.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub path: PathBuf,
    pub size: u64,
}

/// Validated configuration for [`SerializationFileDevice`].
#[derive(Clone)]
pub struct FileDeviceConfig {
    pub filesystem_resource: Arc<FilesystemResource>,
    pub directory: PathBuf,
    pub filters: Vec<Arc<dyn ByteFilter>>,
}

impl std::fmt::Debug for FileDeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDeviceConfig")
            .field("directory", &self.directory)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl FileDeviceConfig {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            filesystem_resource: Arc::new(FilesystemResource::new(directory.clone())),
            directory,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Vec<Arc<dyn ByteFilter>>) -> Self {
        self.filters = filters;
        self
    }
}

/// Serializes values to unique files under a configured directory.
pub struct SerializationFileDevice {
    resource: Arc<FilesystemResource>,
    directory: PathBuf,
    filters: Vec<Arc<dyn ByteFilter>>,
    codec: Arc<dyn ValueCodec>,
}

impl std::fmt::Debug for SerializationFileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationFileDevice")
            .field("directory", &self.directory)
            .finish()
    }
}

impl SerializationFileDevice {
    /// Validates `config` and constructs the device.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `directory` does not exist or is
    /// not a directory.
    pub fn new(config: FileDeviceConfig, codec: Arc<dyn ValueCodec>) -> Result<Self, Error> {
        if !config.directory.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "directory {:?} does not exist",
                config.directory
            )));
        }
        Ok(Self {
            resource: config.filesystem_resource,
            directory: config.directory,
            filters: config.filters,
            codec,
        })
    }

    fn unique_path(&self) -> PathBuf {
        self.directory.join(format!("{}.refvault", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl StorageDevice for SerializationFileDevice {
    fn name(&self) -> &'static str {
        "SerializationFileDevice"
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
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error> {
        let current = state.storage_read().await;
        if current.leaf_for(handle).is_some() {
            return Ok(());
        }

        let value = match current.data() {
            Some(v) => v,
            None => self
                .read_from_device(handle, state, ref_id, true)
                .await?
                .ok_or(Error::MissingLeaf { ref_id, device: self.name() })?,
        };

        let path = self.unique_path();
        let mut leaves = current.leaves.clone();
        leaves.push(StorageLeaf::new(handle.clone()));
        let new_state = state.storage_rcu(|cur| cur.with_leaves(leaves.clone()));

        let bytes = value.encode();
        let size = bytes.len() as u64;
        let filters = self.filters.clone();
        let task_state = new_state.clone();
        let task_handle = handle.clone();
        let task_path = path.clone();

        spawn_supervised(ref_id, new_state.ready.clone(), async move {
            let encoded = match encode_chain(&filters, bytes) {
                Ok(b) => b,
                Err(e) => {
                    error!(ref_id, error = %e, "file device encode failed");
                    task_state.ready.fire();
                    return;
                }
            };
            let result = write_bytes(&task_path, encoded).await;
            match result {
                Ok(()) => {
                    if let Some(leaf) = task_state.leaf_for(&task_handle) {
                        let file_ref: Arc<dyn std::any::Any + Send + Sync> =
                            Arc::new(FileRef { path: task_path.clone(), size });
                        leaf.fill_handle(file_ref);
                    }
                    debug!(ref_id, path = %task_path.display(), "wrote value to file device");
                }
                Err(e) => {
                    error!(ref_id, error = %e, "file device write failed");
                }
            }
            task_state.ready.fire();
        });

        Ok(())
    }

    async fn read_from_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
        ret: bool,
    ) -> Result<Option<Value>, Error> {
        let current = state.storage_read().await;
        if let Some(value) = current.data() {
            return Ok(ret.then_some(value));
        }

        let leaf = current
            .leaf_for(handle)
            .ok_or(Error::MissingLeaf { ref_id, device: self.name() })?;
        let file_ref = leaf
            .handle()
            .ok_or(Error::MissingLeaf { ref_id, device: self.name() })?;
        let file_ref = file_ref
            .downcast::<FileRef>()
            .map_err(|_| Error::Decode("leaf handle is not a FileRef".into()))?;

        let new_state = state.storage_rcu(|cur| cur.with_data(None));
        let filters = self.filters.clone();
        let codec = self.codec.clone();
        let task_state = new_state.clone();
        let task_path = file_ref.path.clone();

        spawn_supervised(ref_id, new_state.ready.clone(), async move {
            let result = read_bytes(&task_path).await.and_then(|raw| {
                decode_chain(&filters, raw).map_err(|e| std::io::Error::other(e.to_string()))
            });
            match result {
                Ok(bytes) => match codec.decode(&bytes) {
                    Ok(value) => {
                        task_state.fill_data(value);
                        debug!(ref_id, path = %task_path.display(), "read value from file device");
                    }
                    Err(e) => error!(ref_id, error = %e, "file device decode failed"),
                },
                Err(e) => error!(ref_id, error = %e, "file device read failed"),
            }
            task_state.ready.fire();
        });

        if ret {
            new_state.ready.wait().await;
            Ok(new_state.data())
        } else {
            Ok(None)
        }
    }

    async fn delete_from_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        ref_id: RefId,
    ) -> Result<(), Error> {
        let current = state.storage_read().await;
        let Some(leaf) = current.leaf_for(handle) else {
            return Ok(());
        };
        let retain = leaf.retain;
        let file_ref = leaf.handle().and_then(|h| h.downcast::<FileRef>().ok());

        let remaining: Vec<StorageLeaf> = current
            .leaves
            .iter()
            .filter(|l| !l.is_device(handle))
            .cloned()
            .collect();
        let new_state = state.storage_rcu(|cur| cur.with_leaves(remaining.clone()));

        let Some(file_ref) = (!retain).then_some(file_ref).flatten() else {
            new_state.ready.fire();
            return Ok(());
        };

        let task_state = new_state.clone();
        spawn_supervised(ref_id, new_state.ready.clone(), async move {
            match tokio::fs::remove_file(&file_ref.path).await {
                Ok(()) => debug!(ref_id, path = %file_ref.path.display(), "unlinked file device leaf"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(ref_id, error = %e, "failed to unlink file device leaf"),
            }
            task_state.ready.fire();
        });

        Ok(())
    }

    async fn retain_on_device(
        &self,
        handle: &Arc<dyn StorageDevice>,
        state: &Arc<RefState>,
        _ref_id: RefId,
        retain: bool,
        all: bool,
    ) -> Result<(), Error> {
        let current = state.storage_read().await;
        let leaves: Vec<StorageLeaf> = current
            .leaves
            .iter()
            .map(|l| {
                let mut l = l.clone();
                if all || l.is_device(handle) {
                    l.retain = retain;
                }
                l
            })
            .collect();
        let new_state = state.storage_rcu(|cur| cur.with_leaves(leaves.clone()));
        new_state.ready.fire();
        Ok(())
    }
}

/// Writes `bytes` to `path`, creating or truncating it.
async fn write_bytes(path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(&bytes).await?;
    file.flush().await
}

/// Reads the full contents of `path`.
async fn read_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw).await?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_filter_is_involutive() {
        let filter = XorFilter::new(vec![0xAB, 0x13]);
        let original = b"hello world".to_vec();
        let encoded = filter.encode(original.clone()).unwrap();
        let decoded = filter.decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn gzip_filter_round_trips() {
        let filter = GzipFilter;
        let original = b"some repeated repeated repeated bytes".to_vec();
        let encoded = filter.encode(original.clone()).unwrap();
        let decoded = filter.decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn chain_applies_outermost_filter_last_on_write() {
        let filters: Vec<Arc<dyn ByteFilter>> =
            vec![Arc::new(GzipFilter), Arc::new(XorFilter::new(vec![7]))];
        let original = b"payload".to_vec();
        let on_disk = encode_chain(&filters, original.clone()).unwrap();
        let back = decode_chain(&filters, on_disk).unwrap();
        assert_eq!(back, original);
    }

    fn device(dir: &Path) -> (Arc<dyn StorageDevice>, Arc<dyn ValueCodec>) {
        let config = FileDeviceConfig::new(dir.to_path_buf());
        let codec: Arc<dyn ValueCodec> = Arc::new(crate::value::JsonCodec);
        let dev = SerializationFileDevice::new(config, codec.clone()).unwrap();
        (Arc::new(dev), codec)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (dev, _codec) = device(dir.path());
        let value: Value = Arc::new(crate::value::JsonValue::new(serde_json::json!({"k": "v"})));
        let state = crate::state::StorageState::new_ready(Some(value.clone()), Vec::new(), dev.clone());
        let ref_state = Arc::new(RefState::new(10, state));

        dev.write_to_device(&dev, &ref_state, 1).await.unwrap();
        let snap = ref_state.storage_read().await;
        assert!(snap.leaf_for(&dev).unwrap().has_handle());

        // Evict the in-memory copy so the read actually materializes from disk.
        let evicted = ref_state.storage_rcu(|cur| cur.with_data(None));
        evicted.ready.fire();

        let read = dev
            .read_from_device(&dev, &ref_state, 1, true)
            .await
            .unwrap()
            .unwrap();
        assert!(crate::value::values_byte_equal(&value, &read));
    }

    #[tokio::test]
    async fn delete_unlinks_file_unless_retained() {
        let dir = tempfile::tempdir().unwrap();
        let (dev, _codec) = device(dir.path());
        let value: Value = Arc::new(crate::value::JsonValue::new(serde_json::json!(1)));
        let state = crate::state::StorageState::new_ready(Some(value), Vec::new(), dev.clone());
        let ref_state = Arc::new(RefState::new(10, state));

        dev.write_to_device(&dev, &ref_state, 1).await.unwrap();
        let snap = ref_state.storage_read().await;
        let path = snap
            .leaf_for(&dev)
            .unwrap()
            .handle()
            .unwrap()
            .downcast::<FileRef>()
            .unwrap()
            .path
            .clone();
        assert!(path.exists());

        dev.delete_from_device(&dev, &ref_state, 1).await.unwrap();
        // The unlink runs in a spawned task; wait for its `ready` rendezvous
        // before checking the filesystem.
        ref_state.storage_read().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn retain_survives_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (dev, _codec) = device(dir.path());
        let value: Value = Arc::new(crate::value::JsonValue::new(serde_json::json!("keep")));
        let state = crate::state::StorageState::new_ready(Some(value), Vec::new(), dev.clone());
        let ref_state = Arc::new(RefState::new(10, state));

        dev.write_to_device(&dev, &ref_state, 1).await.unwrap();
        dev.retain_on_device(&dev, &ref_state, 1, true, false)
            .await
            .unwrap();
        let snap = ref_state.storage_read().await;
        let path = snap
            .leaf_for(&dev)
            .unwrap()
            .handle()
            .unwrap()
            .downcast::<FileRef>()
            .unwrap()
            .path
            .clone();

        dev.delete_from_device(&dev, &ref_state, 1).await.unwrap();
        assert!(path.exists());
    }
}
