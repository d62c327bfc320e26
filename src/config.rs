//! Configuration types for nano-serve.
//!
//! Every struct deserializes from JSON with defaults for missing fields, so a
//! config file only needs to name what it changes:
//!
//! ```
//! use nano_serve::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "cache": { "block_size": 32 } }"#).unwrap();
//! assert_eq!(config.cache.block_size, 32);
//! assert_eq!(config.scheduler.max_batch_size, 256);
//! ```

use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of KV cache and weights.
///
/// This tag is the only place where the numeric type is chosen; storage and
/// algorithms are generic over candle's [`DType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    #[serde(alias = "fp16")]
    Float16,
    #[serde(alias = "bf16")]
    BFloat16,
    #[serde(alias = "fp32")]
    Float32,
}

impl DataType {
    /// The candle dtype used for tensors of this type.
    pub fn to_dtype(self) -> DType {
        match self {
            Self::Float16 => DType::F16,
            Self::BFloat16 => DType::BF16,
            Self::Float32 => DType::F32,
        }
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        self.to_dtype().size_in_bytes()
    }
}

impl TryFrom<DType> for DataType {
    type Error = Error;

    fn try_from(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Self::Float16),
            DType::BF16 => Ok(Self::BFloat16),
            DType::F32 => Ok(Self::Float32),
            other => Err(Error::InvalidArgument(format!(
                "unsupported cache data type {other:?}"
            ))),
        }
    }
}

/// KV cache pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block. Fixed for the lifetime of the pool.
    pub block_size: usize,
    /// Blocks in each device pool.
    pub num_device_blocks: usize,
    /// Blocks in each device's host (swap) pool.
    pub num_host_blocks: usize,
    /// Transformer layers held by this process.
    pub num_layers: usize,
    /// Number of key-value heads per device.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Element type of cached keys and values.
    pub data_type: DataType,
    /// Reuse blocks across requests that share a prompt prefix.
    pub enable_prefix_caching: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_device_blocks: 1024,
            num_host_blocks: 1024,
            num_layers: 32,
            num_kv_heads: 8,
            head_dim: 128,
            data_type: DataType::Float16,
            enable_prefix_caching: false,
        }
    }
}

impl CacheConfig {
    /// Shape of one block's storage: `[num_layers, 2, block_size, num_kv_heads, head_dim]`.
    ///
    /// Index 0 of the second axis holds keys, index 1 values.
    pub fn block_shape(&self) -> Vec<usize> {
        vec![
            self.num_layers,
            2,
            self.block_size,
            self.num_kv_heads,
            self.head_dim,
        ]
    }

    /// Bytes of KV storage one block occupies.
    pub fn block_size_bytes(&self) -> usize {
        self.block_shape().iter().product::<usize>() * self.data_type.size_in_bytes()
    }

    /// Bytes of a full device pool.
    pub fn device_pool_bytes(&self) -> usize {
        self.block_size_bytes() * self.num_device_blocks
    }
}

/// Tensor/pipeline parallel layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Devices this process drives; each holds its own block pool.
    pub tensor_parallel_size: usize,
    /// Number of pipeline stages across processes.
    pub pipeline_parallel_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
        }
    }
}

/// Order in which waiting requests are considered for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOrder {
    /// Arrival order.
    #[default]
    FirstComeFirstServed,
    /// Higher priority first, arrival order within a priority.
    Priority,
}

/// Which running request is swapped out under memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    /// The request admitted last.
    #[default]
    MostRecentlyAdmitted,
    /// The lowest-priority request, most recently admitted among equals.
    LowestPriority,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of requests in one iteration.
    pub max_batch_size: usize,
    /// Maximum tokens forwarded in one iteration.
    pub max_step_tokens: usize,
    /// Admission ordering of the waiting queue.
    pub admission_order: AdmissionOrder,
    /// Victim selection when running requests cannot grow.
    pub preemption_policy: PreemptionPolicy,
    /// Allow swapping running requests out to host memory.
    pub enable_preemption: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            max_step_tokens: 4096,
            admission_order: AdmissionOrder::FirstComeFirstServed,
            preemption_policy: PreemptionPolicy::MostRecentlyAdmitted,
            enable_preemption: true,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub parallel: ParallelConfig,
    pub scheduler: SchedulerConfig,
    /// Decode batch sizes with a statically captured execution graph.
    pub cudagraph_batch_sizes: Vec<usize>,
    /// How long the scheduling thread sleeps when there is nothing to run.
    pub idle_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            parallel: ParallelConfig::default(),
            scheduler: SchedulerConfig::default(),
            cudagraph_batch_sizes: vec![1, 2, 3],
            idle_wait_ms: 5,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Number of devices with a block pool.
    pub fn num_devices(&self) -> usize {
        self.parallel.tensor_parallel_size
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.block_size == 0 {
            return Err(Error::Config("cache.block_size must be positive".into()));
        }
        if cache.num_device_blocks == 0 {
            return Err(Error::Config(
                "cache.num_device_blocks must be positive".into(),
            ));
        }
        if cache.num_layers == 0 || cache.num_kv_heads == 0 || cache.head_dim == 0 {
            return Err(Error::Config(
                "cache.num_layers, cache.num_kv_heads and cache.head_dim must be positive".into(),
            ));
        }
        if self.parallel.tensor_parallel_size == 0 || self.parallel.pipeline_parallel_size == 0 {
            return Err(Error::Config("parallel sizes must be positive".into()));
        }
        if self.scheduler.max_batch_size == 0 || self.scheduler.max_step_tokens == 0 {
            return Err(Error::Config(
                "scheduler.max_batch_size and scheduler.max_step_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Tokens that end generation.
    pub stop_token_ids: Vec<u32>,
    /// RNG seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_new_tokens: 256,
            stop_token_ids: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Reject values the sampler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0) {
            return Err(Error::InvalidArgument(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(Error::InvalidArgument(
                "max_new_tokens must be positive".into(),
            ));
        }
        Ok(())
    }
}
