//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A block is named by an opaque
//! integer id; its storage is found through a [`BlockKey`], the pair of the
//! pool it lives in and that id, so ids never stand in for raw addresses.
//!
//! ```text
//!   BlockKey { Device(0), 7 } ──► device 0 pool, slot 7
//!   BlockKey { Host(0),   7 } ──► device 0's host pool, slot 7 (unrelated block)
//! ```

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque block identifier, unique within one pool.
pub type BlockId = usize;

/// Index of a device driven by this process.
pub type DeviceId = usize;

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Pool a block belongs to.
///
/// Every device has a device pool and a host pool used as its swap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockLocation {
    Device(DeviceId),
    Host(DeviceId),
}

impl BlockLocation {
    /// The device this pool belongs to.
    pub fn device(self) -> DeviceId {
        match self {
            Self::Device(d) | Self::Host(d) => d,
        }
    }

    pub fn is_host(self) -> bool {
        matches!(self, Self::Host(_))
    }
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(d) => write!(f, "device {d}"),
            Self::Host(d) => write!(f, "host {d}"),
        }
    }
}

/// Composite key of a block's physical storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub location: BlockLocation,
    pub block_id: BlockId,
}

impl BlockKey {
    pub fn new(location: BlockLocation, block_id: BlockId) -> Self {
        Self { location, block_id }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.location, self.block_id)
    }
}

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// Used for prefix caching to identify shared prefixes. The hash includes the
/// parent block's hash to create a chain, so blocks at the same position with
/// different prefixes have different hashes.
///
/// # Arguments
///
/// * `token_ids` - Token ids stored in this block
/// * `parent_hash` - Hash of the previous block in the chain (None for the first block)
///
/// # Example
///
/// ```
/// use nano_serve::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }
    for &token in token_ids {
        token.hash(&mut hasher);
    }
    hasher.finish()
}

/// Chained hashes of every full block of `token_ids`.
pub fn hash_full_blocks(token_ids: &[u32], block_size: usize) -> Vec<u64> {
    let mut parent = None;
    token_ids
        .chunks_exact(block_size)
        .map(|chunk| {
            let hash = hash_token_block(chunk, parent);
            parent = Some(hash);
            hash
        })
        .collect()
}

/// Bookkeeping for one allocated block.
#[derive(Debug, Clone)]
pub struct Block {
    block_id: BlockId,
    /// Owners sharing this block through the prefix cache.
    ref_count: usize,
    /// Chained hash of the tokens this block holds, once published.
    prefix_hash: Option<u64>,
}

impl Block {
    /// A freshly allocated block with a single owner.
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_count: 1,
            prefix_hash: None,
        }
    }

    // ========== Getters ==========

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn prefix_hash(&self) -> Option<u64> {
        self.prefix_hash
    }

    // ========== Mutation ==========

    pub fn set_prefix_hash(&mut self, hash: u64) {
        self.prefix_hash = Some(hash);
    }

    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count, returning the new count.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Ordered block ids owned by one request on one device.
///
/// Token at position `p` lives in block `ids[p / block_size]` at offset
/// `p % block_size`.
///
/// ```
/// use nano_serve::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.extend([5, 12, 3]);
///
/// assert_eq!(table.slot_for_position(20), Some((12, 4)));
/// assert_eq!(table.slot_for_position(48), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    block_ids: Vec<BlockId>,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn push(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    pub fn extend(&mut self, block_ids: impl IntoIterator<Item = BlockId>) {
        self.block_ids.extend(block_ids);
    }

    pub fn ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    pub fn len(&self) -> usize {
        self.block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Number of token slots the table covers.
    pub fn token_capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Block id and in-block offset of a token position.
    pub fn slot_for_position(&self, position: usize) -> Option<(BlockId, usize)> {
        if self.block_size == 0 {
            return None;
        }
        self.block_ids
            .get(position / self.block_size)
            .map(|&id| (id, position % self.block_size))
    }

    /// Replace every id in place, keeping order.
    pub fn replace(&mut self, block_ids: Vec<BlockId>) {
        self.block_ids = block_ids;
    }

    /// Remove and return the last `count` ids.
    pub fn truncate_tail(&mut self, count: usize) -> Vec<BlockId> {
        let keep = self.block_ids.len().saturating_sub(count);
        self.block_ids.split_off(keep)
    }

    /// Remove and return all ids.
    pub fn take(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// ```
/// use nano_serve::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
