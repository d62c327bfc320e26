//! Forward-pass interface.
//!
//! Numerical kernels live behind [`Runtime`]. The orchestration loop calls it
//! once per sub-batch with the stage being run, so context-decode and decode
//! can take different code paths.
//!
//! [`SyntheticRuntime`] is a deterministic stand-in: it writes a recognizable
//! key and value for every forwarded token into the paged cache and always
//! predicts `last_token + 1`.

use candle_core::{Device, Tensor};

use crate::core::block_manager::BlockManager;
use crate::core::request::Stage;
use crate::core::stream::StreamKind;
use crate::error::{Error, Result};
use crate::scheduler::input::{BatchInput, LayerSlotMapping};

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[rows, vocab_size]`, one row per request of the forwarded stage in
    /// batch order.
    pub logits: Tensor,
}

/// Executes forward passes over the paged KV cache.
pub trait Runtime: Send {
    /// Run the requests of `stage` in `input`.
    ///
    /// `blocks` gives access to every device's block storage and streams.
    fn forward(&mut self, stage: Stage, input: &BatchInput, blocks: &BlockManager) -> Result<ForwardOutput>;
}

/// Deterministic runtime for smoke tests and the demo binary.
#[derive(Debug, Clone)]
pub struct SyntheticRuntime {
    vocab_size: usize,
    write_kv: bool,
    /// Fail with a device failure on this forward call.
    fail_at: Option<usize>,
    calls: usize,
}

impl SyntheticRuntime {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            write_kv: true,
            fail_at: None,
            calls: 0,
        }
    }

    /// Skip writing KV into the cache.
    pub fn without_kv_writes(mut self) -> Self {
        self.write_kv = false;
        self
    }

    /// Report a device failure on the `call`-th forward pass (0-based).
    pub fn with_failure_at(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Token the runtime predicts after `token`.
    pub fn next_token(&self, token: u32) -> u32 {
        ((token as usize + 1) % self.vocab_size) as u32
    }

    /// Write `token`-derived KV for every slot row on every device.
    fn write_kv(
        &self,
        blocks: &BlockManager,
        input: &BatchInput,
        stage: Stage,
        tokens: &[u32],
    ) -> Result<()> {
        for (device, table) in input.block_tables.iter().enumerate() {
            let mapping: &LayerSlotMapping = match stage {
                Stage::ContextDecode => &table.context_slots,
                _ => &table.decode_slots,
            };
            let mut writes = Vec::with_capacity(mapping.num_rows() * mapping.layers().len());
            for layer in mapping.layers() {
                let Some(slots) = mapping.layer(layer) else {
                    continue;
                };
                let local_layer = layer - mapping.layers().start;
                for (slot, &token) in slots.iter().zip(tokens) {
                    writes.push((local_layer, *slot, token));
                }
            }

            let storage = blocks.device_storage(device)?;
            blocks.stream(device, StreamKind::Compute)?.enqueue(move || {
                let mut storage = storage.lock();
                let shape = storage.block_shape().to_vec();
                let (heads, dim) = (shape[3], shape[4]);
                let device = storage.device().clone();
                for (layer, slot, token) in writes {
                    let key = Tensor::full(token as f32, (heads, dim), &device)?;
                    let value = Tensor::full(-(token as f32), (heads, dim), &device)?;
                    storage.write_token(slot.block_id, layer, slot.offset, &key, &value)?;
                }
                Ok(())
            })?;
        }
        blocks.synchronize_all(StreamKind::Compute)
    }
}

impl Runtime for SyntheticRuntime {
    fn forward(&mut self, stage: Stage, input: &BatchInput, blocks: &BlockManager) -> Result<ForwardOutput> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_at == Some(call) {
            return Err(Error::device_failure(0, "synthetic kernel fault"));
        }

        let rows = match stage {
            Stage::ContextDecode => 0..input.num_context_requests,
            Stage::Decode => input.num_context_requests..input.batch_size(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot forward stage {}",
                    other.as_str()
                )))
            }
        };

        if self.write_kv {
            let tokens: Vec<u32> = match stage {
                Stage::ContextDecode => input.input_ids[..input.num_context_tokens].to_vec(),
                _ => input.input_ids[input.num_context_tokens..].to_vec(),
            };
            self.write_kv(blocks, input, stage, &tokens)?;
        }

        let num_rows = rows.len();
        let mut logits = vec![0f32; num_rows * self.vocab_size];
        for (i, row) in rows.enumerate() {
            let last = input
                .row_tokens(row)
                .and_then(|t| t.last().copied())
                .ok_or_else(|| Error::InvalidArgument(format!("batch row {row} is empty")))?;
            logits[i * self.vocab_size + self.next_token(last) as usize] = 20.0;
        }
        let logits = Tensor::from_vec(logits, (num_rows, self.vocab_size), &Device::Cpu)?;
        Ok(ForwardOutput { logits })
    }
}
