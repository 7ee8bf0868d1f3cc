use crate::error::{EngineError, Result};
use crate::kv_cache::KvCache;
use crate::model::QwenModel;
use crate::sequence::SeqId;

/// Per-sequence model input for one step.
#[derive(Debug)]
pub struct SequenceInput {
    pub seq_id: SeqId,
    /// Prompt suffix past the cached prefix for prefill; the last token
    /// for decode.
    pub input_ids: Vec<u32>,
    /// Absolute positions of `input_ids`.
    pub positions: Vec<usize>,
    pub block_table: Vec<usize>,
}

/// Executes model forwards for a scheduled batch.
///
/// Sequences run serially, one forward per sequence per step; each forward
/// reads and extends only the cache blocks named by that sequence's table,
/// so per-sequence state stays isolated inside the shared pool.
pub struct ModelRunner {
    model: QwenModel,
    kv_cache: KvCache,
    vocab_size: usize,
}

impl ModelRunner {
    pub fn new(model: QwenModel, kv_cache: KvCache, vocab_size: usize) -> Self {
        Self {
            model,
            kv_cache,
            vocab_size,
        }
    }

    /// Runs the batch and returns each sequence's last-token logits.
    pub fn run(&mut self, inputs: &[SequenceInput]) -> Result<Vec<Vec<f32>>> {
        let mut last_logits = Vec::with_capacity(inputs.len());

        for input in inputs {
            let logits = self
                .model
                .forward(&input.input_ids, &input.positions, &mut self.kv_cache, &input.block_table)
                .map_err(|e| EngineError::for_sequence(input.seq_id, e))?;

            if logits.len() < self.vocab_size {
                return Err(EngineError::for_sequence(
                    input.seq_id,
                    EngineError::Shape {
                        op: "runner",
                        expected: format!("at least {} logits", self.vocab_size),
                        actual: logits.len().to_string(),
                    },
                ));
            }

            // Only the last row feeds the sampler.
            let tail = logits.len() - self.vocab_size;
            let mut row = logits;
            row.drain(..tail);
            last_logits.push(row);
        }

        Ok(last_logits)
    }
}

impl std::fmt::Debug for ModelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunner")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
