//! Physical KV storage for one block pool.
//!
//! ## Memory Layout
//!
//! Every block is one tensor of shape
//! `[num_layers, 2, block_size, num_kv_heads, head_dim]`, where index 0 of the
//! second axis holds keys and index 1 values. Slots are materialized on first
//! write; reading an unwritten block yields zeros.
//!
//! Device pools live on the accelerator (CPU without the `cuda` feature),
//! host pools always on the CPU.

use candle_core::{DType, Device, Tensor};

use crate::config::CacheConfig;
use crate::core::block::{BlockId, BlockLocation};
use crate::error::{Error, Result};

/// Tensor arena indexed by block id.
#[derive(Debug)]
pub struct BlockStorage {
    location: BlockLocation,
    device: Device,
    shape: Vec<usize>,
    dtype: DType,
    slots: Vec<Option<Tensor>>,
}

impl BlockStorage {
    /// Create storage for `num_blocks` blocks shaped after `config`.
    pub fn new(location: BlockLocation, num_blocks: usize, config: &CacheConfig, device: Device) -> Self {
        Self {
            location,
            device,
            shape: config.block_shape(),
            dtype: config.data_type.to_dtype(),
            slots: vec![None; num_blocks],
        }
    }

    // ========== Getters ==========

    pub fn location(&self) -> BlockLocation {
        self.location
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn block_shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_blocks(&self) -> usize {
        self.slots.len()
    }

    /// Number of blocks with materialized content.
    pub fn num_materialized(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // ========== Access ==========

    /// Contents of a block, zeros if it was never written.
    pub fn read(&self, block_id: BlockId) -> Result<Tensor> {
        match self.slot(block_id)? {
            Some(tensor) => Ok(tensor.clone()),
            None => Ok(Tensor::zeros(self.shape.as_slice(), self.dtype, &self.device)?),
        }
    }

    /// Contents of a block if it was ever written.
    pub fn snapshot(&self, block_id: BlockId) -> Result<Option<Tensor>> {
        Ok(self.slot(block_id)?.clone())
    }

    /// Overwrite a whole block.
    ///
    /// The tensor is moved to this pool's device and cast to its dtype.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown block or a tensor
    /// whose shape is not the block shape.
    pub fn write(&mut self, block_id: BlockId, data: &Tensor) -> Result<()> {
        if data.dims() != self.shape.as_slice() {
            return Err(Error::InvalidArgument(format!(
                "block shape mismatch on {}: expected {:?}, got {:?}",
                self.location,
                self.shape,
                data.dims()
            )));
        }
        let tensor = data.to_device(&self.device)?.to_dtype(self.dtype)?;
        self.put(block_id, Some(tensor))
    }

    /// Store the key and value of one token.
    ///
    /// `key` and `value` have shape `[num_kv_heads, head_dim]`.
    pub fn write_token(
        &mut self,
        block_id: BlockId,
        layer: usize,
        offset: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<()> {
        let (num_layers, block_size, heads, dim) =
            (self.shape[0], self.shape[2], self.shape[3], self.shape[4]);
        if layer >= num_layers || offset >= block_size {
            return Err(Error::InvalidArgument(format!(
                "token slot (layer {layer}, offset {offset}) outside block of {num_layers} layers x {block_size} tokens"
            )));
        }
        let kv = Tensor::stack(&[key, value], 0)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?
            .reshape((1, 2, 1, heads, dim))?;
        let block = self.read(block_id)?;
        let updated = block.slice_assign(
            &[
                layer..layer + 1,
                0..2,
                offset..offset + 1,
                0..heads,
                0..dim,
            ],
            &kv,
        )?;
        self.put(block_id, Some(updated))
    }

    /// Replace a slot's content; `None` marks it unwritten.
    pub fn put(&mut self, block_id: BlockId, data: Option<Tensor>) -> Result<()> {
        let location = self.location;
        let num_blocks = self.slots.len();
        let slot = self
            .slots
            .get_mut(block_id)
            .ok_or_else(|| out_of_range(location, block_id, num_blocks))?;
        *slot = data;
        Ok(())
    }

    /// Drop a block's content.
    pub fn clear(&mut self, block_id: BlockId) -> Result<()> {
        self.put(block_id, None)
    }

    fn slot(&self, block_id: BlockId) -> Result<&Option<Tensor>> {
        self.slots
            .get(block_id)
            .ok_or_else(|| out_of_range(self.location, block_id, self.slots.len()))
    }
}

fn out_of_range(location: BlockLocation, block_id: BlockId, num_blocks: usize) -> Error {
    Error::InvalidArgument(format!(
        "block {block_id} out of range on {location} ({num_blocks} blocks)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataType;

    fn small_config() -> CacheConfig {
        CacheConfig {
            block_size: 4,
            num_device_blocks: 8,
            num_host_blocks: 8,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 3,
            data_type: DataType::Float32,
            enable_prefix_caching: false,
        }
    }

    #[test]
    fn test_unwritten_block_reads_zeros() {
        let config = small_config();
        let storage = BlockStorage::new(BlockLocation::Device(0), 8, &config, Device::Cpu);
        let block = storage.read(3).unwrap();
        assert_eq!(block.dims(), &[2, 2, 4, 2, 3]);
        let sum: f32 = block.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
        assert!(storage.snapshot(3).unwrap().is_none());
    }

    #[test]
    fn test_write_and_read_back() {
        let config = small_config();
        let mut storage = BlockStorage::new(BlockLocation::Host(0), 8, &config, Device::Cpu);
        let data = Tensor::ones(config.block_shape(), DType::F32, &Device::Cpu).unwrap();
        storage.write(5, &data).unwrap();
        let back: Vec<f32> = storage.read(5).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(back.iter().all(|&v| v == 1.0));
        assert_eq!(storage.num_materialized(), 1);

        storage.clear(5).unwrap();
        assert_eq!(storage.num_materialized(), 0);
    }

    #[test]
    fn test_write_rejects_bad_shape_and_range() {
        let config = small_config();
        let mut storage = BlockStorage::new(BlockLocation::Device(1), 8, &config, Device::Cpu);
        let wrong = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(storage.write(0, &wrong).is_err());
        assert!(storage.read(8).is_err());
    }

    #[test]
    fn test_write_token() {
        let config = small_config();
        let mut storage = BlockStorage::new(BlockLocation::Device(0), 8, &config, Device::Cpu);
        let key = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let value = (Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        storage.write_token(1, 1, 2, &key, &value).unwrap();

        let block = storage.read(1).unwrap();
        let k: Vec<f32> = block
            .narrow(0, 1, 1).unwrap()
            .narrow(1, 0, 1).unwrap()
            .narrow(2, 2, 1).unwrap()
            .flatten_all().unwrap()
            .to_vec1().unwrap();
        assert_eq!(k, vec![1.0; 6]);
        let total: f32 = block.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 6.0 + 12.0);

        assert!(storage.write_token(1, 2, 0, &key, &value).is_err());
    }
}
