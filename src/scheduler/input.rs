//! Batch input construction.
//!
//! Turns one iteration's context-decode and decode sub-batches into the flat
//! arrays a forward pass consumes. Context requests come first, then decode
//! requests; row `i` of every per-request table refers to the same request.
//!
//! ```text
//!   requests     A (ctx, 5 tok)   B (ctx, 3 tok)   C (dec)   D (dec)
//!   input_ids    a0 a1 a2 a3 a4   b0 b1 b2         c_last    d_last
//!   offsets      0                5                8         9        10
//!   block table  [A blocks..]     [B blocks..]     [C ..]    [D ..]   (CSR per device)
//! ```
//!
//! Slot mappings give, for every layer of this process, the `(block, offset)`
//! each forwarded token writes its key and value to.

use std::ops::Range;

use candle_core::{Device, Tensor};

use crate::core::block::BlockId;
use crate::core::request::Request;
use crate::error::{Error, Result};

/// Position of one token inside the paged cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub block_id: BlockId,
    pub offset: usize,
}

impl SlotRef {
    /// Flat slot index `block_id * block_size + offset`.
    pub fn flat(&self, block_size: usize) -> usize {
        self.block_id * block_size + self.offset
    }
}

/// Slot of every row for every layer in `layers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerSlotMapping {
    layers: Range<usize>,
    slots: Vec<Vec<SlotRef>>,
}

impl LayerSlotMapping {
    fn new(layers: Range<usize>, rows: Vec<SlotRef>) -> Self {
        let slots = layers.clone().map(|_| rows.clone()).collect();
        Self { layers, slots }
    }

    /// Model layers covered, in absolute layer numbers.
    pub fn layers(&self) -> Range<usize> {
        self.layers.clone()
    }

    pub fn num_rows(&self) -> usize {
        self.slots.first().map_or(0, Vec::len)
    }

    /// Slots of one absolute layer.
    pub fn layer(&self, layer: usize) -> Option<&[SlotRef]> {
        if !self.layers.contains(&layer) {
            return None;
        }
        self.slots.get(layer - self.layers.start).map(Vec::as_slice)
    }

    pub fn get(&self, layer: usize, row: usize) -> Option<SlotRef> {
        self.layer(layer)?.get(row).copied()
    }
}

/// Block ids and slots of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBlockTable {
    /// CSR row offsets into `block_ids`, `batch_size + 1` entries.
    pub block_offsets: Vec<usize>,
    /// Every request's block ids, concatenated in batch order.
    pub block_ids: Vec<BlockId>,
    /// One row per prompt token of the context sub-batch.
    pub context_slots: LayerSlotMapping,
    /// One row per decode request.
    pub decode_slots: LayerSlotMapping,
}

impl DeviceBlockTable {
    /// Block ids of batch row `row`.
    pub fn row(&self, row: usize) -> Option<&[BlockId]> {
        let start = *self.block_offsets.get(row)?;
        let end = *self.block_offsets.get(row + 1)?;
        self.block_ids.get(start..end)
    }
}

/// Everything a forward pass needs about one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchInput {
    /// Context prompts, then one token per decode request.
    pub input_ids: Vec<u32>,
    /// Row offsets into `input_ids`, `batch_size + 1` entries.
    pub input_offsets: Vec<usize>,
    /// Cumulative prefix-cached tokens of the context requests.
    pub prefix_offsets: Vec<usize>,
    /// Position of each entry of `input_ids` in its sequence.
    pub rotary_positions: Vec<i64>,
    /// 0 for positions whose KV came from the prefix cache, 1 otherwise.
    pub rotary_mask: Vec<i64>,
    /// One table per device.
    pub block_tables: Vec<DeviceBlockTable>,
    pub num_context_requests: usize,
    pub num_decode_requests: usize,
    /// Longest prompt in the context sub-batch.
    pub max_context_tokens: usize,
    pub num_context_tokens: usize,
    /// Blocks held by context requests on each device.
    pub total_context_blocks: usize,
    /// Blocks held by decode requests on each device.
    pub total_decode_blocks: usize,
    /// Captured graph size for a decode-only batch, if one exists.
    pub graph_batch_size: Option<usize>,
    /// Whether the prefix cache was consulted.
    pub use_cache: bool,
    pub block_size: usize,
}

impl BatchInput {
    pub fn batch_size(&self) -> usize {
        self.num_context_requests + self.num_decode_requests
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0
    }

    /// Tokens of batch row `row`.
    pub fn row_tokens(&self, row: usize) -> Option<&[u32]> {
        let start = *self.input_offsets.get(row)?;
        let end = *self.input_offsets.get(row + 1)?;
        self.input_ids.get(start..end)
    }

    /// Tensor form of this batch for `device_id`, placed on `device`.
    pub fn to_tensors(&self, device_id: usize, device: &Device) -> Result<BatchTensors> {
        let table = self.block_tables.get(device_id).ok_or_else(|| {
            Error::InvalidArgument(format!("no block table for device {device_id}"))
        })?;
        Ok(BatchTensors {
            input_ids: Tensor::new(self.input_ids.as_slice(), device)?,
            input_offsets: u32_tensor(&self.input_offsets, device)?,
            prefix_offsets: u32_tensor(&self.prefix_offsets, device)?,
            rotary_positions: Tensor::new(self.rotary_positions.as_slice(), device)?,
            rotary_mask: Tensor::new(self.rotary_mask.as_slice(), device)?,
            block_offsets: u32_tensor(&table.block_offsets, device)?,
            block_ids: u32_tensor(&table.block_ids, device)?,
            context_slots: slot_tensor(&table.context_slots, self.block_size, device)?,
            decode_slots: slot_tensor(&table.decode_slots, self.block_size, device)?,
        })
    }
}

/// Device tensors of one batch.
///
/// Slot tensors hold flat slot indices with shape `[num_layers, rows]`.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    pub input_ids: Tensor,
    pub input_offsets: Tensor,
    pub prefix_offsets: Tensor,
    pub rotary_positions: Tensor,
    pub rotary_mask: Tensor,
    pub block_offsets: Tensor,
    pub block_ids: Tensor,
    pub context_slots: Tensor,
    pub decode_slots: Tensor,
}

fn u32_tensor(values: &[usize], device: &Device) -> Result<Tensor> {
    let values = values
        .iter()
        .map(|&v| {
            u32::try_from(v)
                .map_err(|_| Error::InvalidArgument(format!("{v} does not fit a u32 tensor")))
        })
        .collect::<Result<Vec<u32>>>()?;
    Ok(Tensor::new(values.as_slice(), device)?)
}

fn slot_tensor(mapping: &LayerSlotMapping, block_size: usize, device: &Device) -> Result<Tensor> {
    let num_layers = mapping.layers().len();
    let rows = mapping.num_rows();
    let flat: Vec<i64> = mapping
        .layers()
        .filter_map(|layer| mapping.layer(layer))
        .flat_map(|slots| slots.iter().map(|s| s.flat(block_size)))
        .map(|slot| {
            i64::try_from(slot)
                .map_err(|_| Error::InvalidArgument(format!("slot {slot} does not fit an i64 tensor")))
        })
        .collect::<Result<_>>()?;
    Ok(Tensor::from_vec(flat, (num_layers, rows), device)?)
}

/// Builds [`BatchInput`]s for a fixed model layout.
#[derive(Debug, Clone)]
pub struct BatchInputBuilder {
    block_size: usize,
    num_devices: usize,
    layers: Range<usize>,
    graph_batch_sizes: Vec<usize>,
    use_cache: bool,
}

impl BatchInputBuilder {
    /// # Arguments
    ///
    /// * `block_size` - Tokens per KV block
    /// * `num_devices` - Devices holding a copy of every block table
    /// * `layers` - Model layers run by this process
    /// * `graph_batch_sizes` - Decode batch sizes with a captured graph
    pub fn new(
        block_size: usize,
        num_devices: usize,
        layers: Range<usize>,
        graph_batch_sizes: Vec<usize>,
    ) -> Self {
        Self {
            block_size,
            num_devices,
            layers,
            graph_batch_sizes,
            use_cache: false,
        }
    }

    pub fn with_prefix_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Build the input of one iteration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a request's block table does not
    /// cover the tokens it forwards.
    pub fn build(&self, context: &[&Request], decode: &[&Request]) -> Result<BatchInput> {
        let mut input = BatchInput {
            num_context_requests: context.len(),
            num_decode_requests: decode.len(),
            use_cache: self.use_cache,
            block_size: self.block_size,
            ..BatchInput::default()
        };
        input.input_offsets.push(0);
        input.prefix_offsets.push(0);

        for request in context {
            let prompt = request.input_tokens();
            let cached = request.prefix_cached_tokens();
            input.input_ids.extend_from_slice(prompt);
            input.input_offsets.push(input.input_ids.len());
            input
                .prefix_offsets
                .push(input.prefix_offsets.last().copied().unwrap_or(0) + cached);
            for position in 0..prompt.len() {
                input.rotary_positions.push(position as i64);
                input.rotary_mask.push(i64::from(position >= cached));
            }
            input.max_context_tokens = input.max_context_tokens.max(prompt.len());
            input.total_context_blocks += request.current_block_count();
        }
        input.num_context_tokens = input.input_ids.len();

        for request in decode {
            let position = request.output_tokens().len().saturating_sub(1);
            let token = request.last_token().ok_or_else(|| {
                Error::InvalidArgument(format!("request {} has no tokens", request.id()))
            })?;
            input.input_ids.push(token);
            input.input_offsets.push(input.input_ids.len());
            input.rotary_positions.push(position as i64);
            input.rotary_mask.push(1);
            input.total_decode_blocks += request.current_block_count();
        }

        input.block_tables = (0..self.num_devices)
            .map(|device| self.device_table(device, context, decode))
            .collect::<Result<Vec<_>>>()?;

        if context.is_empty() && self.graph_batch_sizes.contains(&decode.len()) {
            input.graph_batch_size = Some(decode.len());
        }
        Ok(input)
    }

    fn device_table(
        &self,
        device: usize,
        context: &[&Request],
        decode: &[&Request],
    ) -> Result<DeviceBlockTable> {
        let mut table = DeviceBlockTable::default();
        table.block_offsets.push(0);
        let mut context_rows = Vec::new();
        let mut decode_rows = Vec::new();

        for request in context.iter().chain(decode) {
            let blocks = request.block_table(device).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "request {} has no blocks on device {device}",
                    request.id()
                ))
            })?;
            table.block_ids.extend_from_slice(blocks.ids());
            table.block_offsets.push(table.block_ids.len());
        }

        for request in context {
            for position in 0..request.input_tokens().len() {
                context_rows.push(self.slot(request, device, position)?);
            }
        }
        for request in decode {
            let position = request.output_tokens().len().saturating_sub(1);
            decode_rows.push(self.slot(request, device, position)?);
        }

        table.context_slots = LayerSlotMapping::new(self.layers.clone(), context_rows);
        table.decode_slots = LayerSlotMapping::new(self.layers.clone(), decode_rows);
        Ok(table)
    }

    fn slot(&self, request: &Request, device: usize, position: usize) -> Result<SlotRef> {
        request
            .block_table(device)
            .and_then(|t| t.slot_for_position(position))
            .map(|(block_id, offset)| SlotRef { block_id, offset })
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "request {} blocks on device {device} do not cover position {position}",
                    request.id()
                ))
            })
    }
}
