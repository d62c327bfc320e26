//! Block manager for the paged KV cache.
//!
//! The BlockManager handles allocation and deallocation of KV cache blocks on
//! every device, similar to how an operating system manages physical memory
//! pages, plus a host pool per device used as swap space.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) per block, all-or-nothing per call
//! - **Reference counting**: blocks shared through the prefix cache
//! - **Prefix caching**: chained-hash lookup of full prompt blocks
//! - **Swapping**: device ⇄ host moves with copies issued on the device's
//!   h2d/d2h streams
//!
//! ## Layout
//!
//! ```text
//!   BlockManager
//!     └─ device 0 ─┬─ device pool (Mutex) ── device storage (candle tensors)
//!     │            ├─ host pool   (Mutex) ── host storage   (CPU tensors)
//!     │            └─ streams: compute / h2d / d2h / d2d
//!     └─ device 1 ─ ...
//! ```
//!
//! Each device is locked independently, so calls for different devices never
//! contend. No call holds two pool locks at once.
//!
//! ## Example
//!
//! ```
//! use nano_serve::config::CacheConfig;
//! use nano_serve::core::block_manager::BlockManager;
//!
//! let cache = CacheConfig { num_device_blocks: 8, num_host_blocks: 8, ..CacheConfig::default() };
//! let manager = BlockManager::new(&cache, 1).unwrap();
//!
//! let ids = manager.allocate_blocks(3, 0).unwrap();
//! assert_eq!(manager.num_free_blocks(0).unwrap(), 5);
//!
//! let host_ids = manager.swap_out(&ids, 0).unwrap();
//! assert_eq!(manager.num_free_blocks(0).unwrap(), 8);
//!
//! manager.swap_drop(&host_ids, 0).unwrap();
//! assert_eq!(manager.num_free_host_blocks(0).unwrap(), 8);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{CacheConfig, EngineConfig};
use crate::core::block::{Block, BlockId, BlockKey, BlockLocation, DeviceId};
use crate::core::kv_cache::BlockStorage;
use crate::core::stream::{Stream, StreamGroup, StreamKind};
use crate::error::{Error, Result};

/// Free list, ownership and prefix cache of one pool.
#[derive(Debug)]
struct BlockPool {
    location: BlockLocation,
    /// Allocated blocks indexed by block_id.
    blocks: HashMap<BlockId, Block>,
    /// Free block ids, allocated from the front.
    free_list: VecDeque<BlockId>,
    /// Prefix hash -> block_id.
    prefix_cache: HashMap<u64, BlockId>,
    num_blocks: usize,
}

impl BlockPool {
    fn new(location: BlockLocation, num_blocks: usize) -> Self {
        Self {
            location,
            blocks: HashMap::with_capacity(num_blocks),
            free_list: (0..num_blocks).collect(),
            prefix_cache: HashMap::new(),
            num_blocks,
        }
    }

    fn num_free(&self) -> usize {
        self.free_list.len()
    }

    fn exhausted(&self, requested: usize) -> Error {
        Error::ResourceExhausted {
            location: self.location,
            requested,
            available: self.free_list.len(),
        }
    }

    fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>> {
        if self.free_list.len() < count {
            return Err(self.exhausted(count));
        }
        let ids: Vec<BlockId> = self.free_list.drain(..count).collect();
        for &id in &ids {
            self.blocks.insert(id, Block::new(id));
        }
        Ok(ids)
    }

    fn check_allocated(&self, ids: &[BlockId]) -> Result<()> {
        match ids.iter().find(|id| !self.blocks.contains_key(id)) {
            Some(id) => Err(Error::InvalidArgument(format!(
                "block {id} is not allocated on {}",
                self.location
            ))),
            None => Ok(()),
        }
    }

    /// Drop one reference from each id; returns the ids that became free.
    fn free(&mut self, ids: &[BlockId]) -> Result<Vec<BlockId>> {
        self.check_allocated(ids)?;
        let mut released = Vec::new();
        for &id in ids {
            let Some(block) = self.blocks.get_mut(&id) else {
                continue;
            };
            if block.decrement_ref() > 0 {
                continue;
            }
            if let Some(hash) = block.prefix_hash() {
                if self.prefix_cache.get(&hash) == Some(&id) {
                    self.prefix_cache.remove(&hash);
                }
            }
            self.blocks.remove(&id);
            self.free_list.push_back(id);
            released.push(id);
        }
        Ok(released)
    }

    fn lookup_prefix(&mut self, hash: u64) -> Option<BlockId> {
        let id = *self.prefix_cache.get(&hash)?;
        match self.blocks.get_mut(&id) {
            Some(block) => {
                block.increment_ref();
                Some(id)
            }
            None => {
                self.prefix_cache.remove(&hash);
                None
            }
        }
    }

    fn register_prefix(&mut self, id: BlockId, hash: u64) -> Result<()> {
        self.check_allocated(&[id])?;
        if self.prefix_cache.contains_key(&hash) {
            return Ok(());
        }
        if let Some(block) = self.blocks.get_mut(&id) {
            block.set_prefix_hash(hash);
        }
        self.prefix_cache.insert(hash, id);
        Ok(())
    }
}

/// Everything owned by one device.
#[derive(Debug)]
struct DeviceContext {
    device_pool: Mutex<BlockPool>,
    host_pool: Mutex<BlockPool>,
    device_storage: Arc<Mutex<BlockStorage>>,
    host_storage: Arc<Mutex<BlockStorage>>,
    streams: StreamGroup,
}

impl DeviceContext {
    /// Wait for every stream that may still write device blocks.
    fn settle_device_writes(&self) -> Result<()> {
        for kind in [
            StreamKind::Compute,
            StreamKind::DeviceToDevice,
            StreamKind::HostToDevice,
        ] {
            self.streams.get(kind).synchronize()?;
        }
        Ok(())
    }
}

/// Allocator and storage of KV cache blocks across all devices.
///
/// Shared between the scheduler, requests and the runtime through an `Arc`.
#[derive(Debug)]
pub struct BlockManager {
    devices: Vec<DeviceContext>,
    block_size: usize,
}

/// Candle device backing device pool `device`.
pub fn candle_device(device: DeviceId) -> Result<Device> {
    #[cfg(feature = "cuda")]
    {
        Ok(Device::new_cuda(device)?)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = device;
        Ok(Device::Cpu)
    }
}

impl BlockManager {
    /// Create pools, storage and streams for `num_devices` devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero block size or device count, and
    /// [`Error::DeviceFailure`] if a device or stream cannot be created.
    pub fn new(cache: &CacheConfig, num_devices: usize) -> Result<Self> {
        if cache.block_size == 0 {
            return Err(Error::Config("block size must be positive".into()));
        }
        if num_devices == 0 {
            return Err(Error::Config("at least one device is required".into()));
        }

        let devices = (0..num_devices)
            .map(|d| {
                let device = candle_device(d)?;
                Ok(DeviceContext {
                    device_pool: Mutex::new(BlockPool::new(
                        BlockLocation::Device(d),
                        cache.num_device_blocks,
                    )),
                    host_pool: Mutex::new(BlockPool::new(
                        BlockLocation::Host(d),
                        cache.num_host_blocks,
                    )),
                    device_storage: Arc::new(Mutex::new(BlockStorage::new(
                        BlockLocation::Device(d),
                        cache.num_device_blocks,
                        cache,
                        device,
                    ))),
                    host_storage: Arc::new(Mutex::new(BlockStorage::new(
                        BlockLocation::Host(d),
                        cache.num_host_blocks,
                        cache,
                        Device::Cpu,
                    ))),
                    streams: StreamGroup::new(d)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            num_devices,
            device_blocks = cache.num_device_blocks,
            host_blocks = cache.num_host_blocks,
            block_size = cache.block_size,
            "block manager ready"
        );

        Ok(Self {
            devices,
            block_size: cache.block_size,
        })
    }

    /// Create the block manager described by an engine config.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(&config.cache, config.num_devices())
    }

    fn context(&self, device: DeviceId) -> Result<&DeviceContext> {
        self.devices.get(device).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unknown device {device} ({} devices)",
                self.devices.len()
            ))
        })
    }

    /// Storage arena of the pool at `location`.
    fn storage(&self, location: BlockLocation) -> Result<&Arc<Mutex<BlockStorage>>> {
        let ctx = self.context(location.device())?;
        Ok(match location {
            BlockLocation::Device(_) => &ctx.device_storage,
            BlockLocation::Host(_) => &ctx.host_storage,
        })
    }

    // ========== Getters ==========

    /// Tokens per block, fixed for the manager's lifetime.
    pub fn block_token_capacity(&self) -> usize {
        self.block_size
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn num_free_blocks(&self, device: DeviceId) -> Result<usize> {
        Ok(self.context(device)?.device_pool.lock().num_free())
    }

    pub fn num_used_blocks(&self, device: DeviceId) -> Result<usize> {
        Ok(self.context(device)?.device_pool.lock().blocks.len())
    }

    pub fn num_total_blocks(&self, device: DeviceId) -> Result<usize> {
        Ok(self.context(device)?.device_pool.lock().num_blocks)
    }

    pub fn num_free_host_blocks(&self, device: DeviceId) -> Result<usize> {
        Ok(self.context(device)?.host_pool.lock().num_free())
    }

    pub fn num_total_host_blocks(&self, device: DeviceId) -> Result<usize> {
        Ok(self.context(device)?.host_pool.lock().num_blocks)
    }

    /// Smallest free-block count across devices.
    pub fn min_free_blocks(&self) -> usize {
        self.devices
            .iter()
            .map(|ctx| ctx.device_pool.lock().num_free())
            .min()
            .unwrap_or(0)
    }

    /// Smallest free host-block count across devices.
    pub fn min_free_host_blocks(&self) -> usize {
        self.devices
            .iter()
            .map(|ctx| ctx.host_pool.lock().num_free())
            .min()
            .unwrap_or(0)
    }

    /// Reference count of a device block, `None` if it is free.
    pub fn ref_count(&self, block_id: BlockId, device: DeviceId) -> Result<Option<usize>> {
        Ok(self
            .context(device)?
            .device_pool
            .lock()
            .blocks
            .get(&block_id)
            .map(Block::ref_count))
    }

    // ========== Allocation ==========

    /// Allocate `count` device blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when fewer than `count` blocks are
    /// free; nothing is allocated in that case.
    pub fn allocate_blocks(&self, count: usize, device: DeviceId) -> Result<Vec<BlockId>> {
        let ids = self.context(device)?.device_pool.lock().allocate(count)?;
        trace!(device, count, "allocated blocks");
        Ok(ids)
    }

    /// Release one reference to each device block.
    ///
    /// Blocks whose count reaches zero return to the free list immediately,
    /// after queued device writes have landed. Freeing an empty list is a
    /// no-op.
    pub fn free_blocks(&self, block_ids: &[BlockId], device: DeviceId) -> Result<()> {
        if block_ids.is_empty() {
            return Ok(());
        }
        let ctx = self.context(device)?;
        ctx.settle_device_writes()?;
        let released = ctx.device_pool.lock().free(block_ids)?;
        let mut storage = self.storage(BlockLocation::Device(device))?.lock();
        for id in released {
            storage.clear(id)?;
        }
        trace!(device, count = block_ids.len(), "freed blocks");
        Ok(())
    }

    // ========== Swapping ==========

    /// Move device blocks to the host pool.
    ///
    /// Returns the host ids in the same order. Work already queued on the
    /// compute, device→device and host→device streams is part of the copy.
    /// The device ids are released before this returns; their contents reach the host asynchronously on
    /// the device→host stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when the host pool is short, in
    /// which case the device ids are left untouched.
    pub fn swap_out(&self, block_ids: &[BlockId], device: DeviceId) -> Result<Vec<BlockId>> {
        if block_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.context(device)?;
        // Kernels and pending swap-ins may still be filling these blocks.
        ctx.settle_device_writes()?;
        ctx.device_pool.lock().check_allocated(block_ids)?;

        let host_ids = ctx.host_pool.lock().allocate(block_ids.len())?;
        let snapshots = {
            let storage = self.storage(BlockLocation::Device(device))?.lock();
            block_ids
                .iter()
                .map(|&id| storage.snapshot(id))
                .collect::<Result<Vec<_>>>()?
        };
        self.free_blocks(block_ids, device)?;

        let host_storage = Arc::clone(self.storage(BlockLocation::Host(device))?);
        let targets = host_ids.clone();
        ctx.streams
            .get(StreamKind::DeviceToHost)
            .enqueue(move || copy_into(&host_storage, &targets, snapshots))?;

        debug!(device, count = block_ids.len(), "swapped out");
        Ok(host_ids)
    }

    /// Move host blocks back to the device pool.
    ///
    /// Returns fresh device ids in the same order. The host ids are released;
    /// contents arrive asynchronously on the host→device stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when the device pool is short, in
    /// which case the host ids are left untouched.
    pub fn swap_in(&self, host_ids: &[BlockId], device: DeviceId) -> Result<Vec<BlockId>> {
        if host_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.context(device)?;
        // The swap-out that produced these blocks must have landed.
        ctx.streams.get(StreamKind::DeviceToHost).synchronize()?;
        ctx.host_pool.lock().check_allocated(host_ids)?;

        let device_ids = ctx.device_pool.lock().allocate(host_ids.len())?;
        let snapshots = {
            let storage = self.storage(BlockLocation::Host(device))?.lock();
            host_ids
                .iter()
                .map(|&id| storage.snapshot(id))
                .collect::<Result<Vec<_>>>()?
        };
        self.swap_drop(host_ids, device)?;

        let device_storage = Arc::clone(self.storage(BlockLocation::Device(device))?);
        let targets = device_ids.clone();
        ctx.streams
            .get(StreamKind::HostToDevice)
            .enqueue(move || copy_into(&device_storage, &targets, snapshots))?;

        debug!(device, count = host_ids.len(), "swapped in");
        Ok(device_ids)
    }

    /// Discard host blocks without restoring them.
    pub fn swap_drop(&self, host_ids: &[BlockId], device: DeviceId) -> Result<()> {
        if host_ids.is_empty() {
            return Ok(());
        }
        let ctx = self.context(device)?;
        let released = ctx.host_pool.lock().free(host_ids)?;
        let mut storage = self.storage(BlockLocation::Host(device))?.lock();
        for id in released {
            storage.clear(id)?;
        }
        Ok(())
    }

    // ========== Prefix Caching ==========

    /// Find a published block by its chained prefix hash.
    ///
    /// A hit takes a new reference on the block; release it with
    /// [`free_blocks`](Self::free_blocks).
    pub fn lookup_prefix(&self, hash: u64, device: DeviceId) -> Result<Option<BlockId>> {
        Ok(self.context(device)?.device_pool.lock().lookup_prefix(hash))
    }

    /// Publish a full block under its chained prefix hash.
    ///
    /// A hash already published by another block keeps its first block.
    pub fn register_prefix(&self, block_id: BlockId, hash: u64, device: DeviceId) -> Result<()> {
        self.context(device)?
            .device_pool
            .lock()
            .register_prefix(block_id, hash)
    }

    pub fn is_prefix_cached(&self, hash: u64, device: DeviceId) -> Result<bool> {
        Ok(self
            .context(device)?
            .device_pool
            .lock()
            .prefix_cache
            .contains_key(&hash))
    }

    pub fn num_cached_prefixes(&self, device: DeviceId) -> Result<usize> {
        Ok(self.context(device)?.device_pool.lock().prefix_cache.len())
    }

    // ========== Storage ==========

    /// Storage of a device pool, for kernels that read or write KV.
    pub fn device_storage(&self, device: DeviceId) -> Result<Arc<Mutex<BlockStorage>>> {
        Ok(Arc::clone(self.storage(BlockLocation::Device(device))?))
    }

    /// Contents of the block named by `key`, device or host.
    ///
    /// Copies still in flight on the key's streams are not waited for.
    pub fn read(&self, key: BlockKey) -> Result<Tensor> {
        self.storage(key.location)?.lock().read(key.block_id)
    }

    /// Overwrite the block named by `key`.
    pub fn write(&self, key: BlockKey, data: &Tensor) -> Result<()> {
        self.storage(key.location)?.lock().write(key.block_id, data)
    }

    /// Overwrite a device block's contents.
    pub fn write_block(&self, device: DeviceId, block_id: BlockId, data: &Tensor) -> Result<()> {
        self.write(BlockKey::new(BlockLocation::Device(device), block_id), data)
    }

    /// Read a device block's contents.
    pub fn read_block(&self, device: DeviceId, block_id: BlockId) -> Result<Tensor> {
        self.read(BlockKey::new(BlockLocation::Device(device), block_id))
    }

    // ========== Streams ==========

    pub fn stream(&self, device: DeviceId, kind: StreamKind) -> Result<&Stream> {
        Ok(self.context(device)?.streams.get(kind))
    }

    /// Wait for all work issued on one stream of one device.
    pub fn synchronize(&self, device: DeviceId, kind: StreamKind) -> Result<()> {
        self.context(device)?.streams.get(kind).synchronize()
    }

    /// Wait for all work issued on one stream kind of every device.
    pub fn synchronize_all(&self, kind: StreamKind) -> Result<()> {
        for ctx in &self.devices {
            ctx.streams.get(kind).synchronize()?;
        }
        Ok(())
    }
}

fn copy_into(
    storage: &Mutex<BlockStorage>,
    targets: &[BlockId],
    snapshots: Vec<Option<Tensor>>,
) -> Result<()> {
    let mut storage = storage.lock();
    let device = storage.device().clone();
    for (&id, snapshot) in targets.iter().zip(snapshots) {
        let moved = snapshot.map(|t| t.to_device(&device)).transpose()?;
        storage.put(id, moved)?;
    }
    Ok(())
}
