use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};

use crate::config::{EngineOptions, ModelConfig};
use crate::error::{EngineError, Result};
use crate::kv_cache::KvCache;
use crate::model::QwenModel;
use crate::runner::{ModelRunner, SequenceInput};
use crate::sampler::{Sampler, SamplingParams};
use crate::scheduler::Scheduler;
use crate::sequence::{SeqId, Sequence};
use crate::tokenizer::Tokenizer;

/// One sequence's result from a single `step`.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub seq_id: SeqId,
    /// The token sampled this step.
    pub token_id: u32,
    pub finished: bool,
}

/// A finished generation.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub seq_id: SeqId,
    pub text: String,
    pub token_ids: Vec<u32>,
}

/// The engine façade: tokenize, schedule, run, sample, append, detokenize.
///
/// Everything runs on the caller's thread; each `step` is synchronous and
/// runs to completion. Streaming callers consume the per-step outputs
/// directly, nothing is buffered internally.
pub struct LlmEngine {
    options: EngineOptions,
    tokenizer: Tokenizer,
    scheduler: Scheduler,
    runner: ModelRunner,
    sampler: Sampler,
    next_seq_id: SeqId,
}

impl LlmEngine {
    /// Loads a checkpoint directory (`config.json`, `tokenizer.json`, one
    /// or more safetensors shards) and builds a ready engine.
    pub fn new(model_dir: &Path, options: EngineOptions) -> Result<Self> {
        let config = ModelConfig::from_dir(model_dir)?;
        let tokenizer = Tokenizer::from_dir(model_dir)?;

        let eos_token_id = config
            .eos_id()
            .or_else(|| tokenizer.eos_id())
            .ok_or_else(|| EngineError::Config("no eos_token_id in config.json or tokenizer.json".to_string()))?;

        let model = QwenModel::from_checkpoint(model_dir, &config)?;
        let kv_cache = KvCache::new(
            options.num_blocks(),
            config.num_hidden_layers,
            config.num_kv_heads(),
            options.kvcache_block_size,
            config.head_dim(),
        );

        info!(
            "Engine ready: {} KV block(s) of {} token(s), seed {}",
            options.num_blocks(),
            options.kvcache_block_size,
            options.seed,
        );

        Ok(Self {
            scheduler: Scheduler::new(&options, eos_token_id),
            runner: ModelRunner::new(model, kv_cache, config.vocab_size),
            sampler: Sampler::new(options.seed),
            tokenizer,
            options,
            next_seq_id: 0,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Admits a prompt. Tokenizer failures and oversized prompts reject
    /// this request without disturbing in-flight sequences.
    pub fn add_request(&mut self, prompt: &str, params: SamplingParams) -> Result<SeqId> {
        params.validate()?;

        let token_ids = self.tokenizer.encode(prompt)?;
        if token_ids.is_empty() {
            return Err(EngineError::Resource("prompt encodes to zero tokens".to_string()));
        }
        if token_ids.len() > self.options.max_model_len {
            return Err(EngineError::Resource(format!(
                "prompt of {} token(s) exceeds max_model_len {}",
                token_ids.len(),
                self.options.max_model_len
            )));
        }
        // Admission must hold at the sequence's maximum length, not just the
        // prompt: a resumed sequence prefills its whole token history, and a
        // lone sequence the pool cannot hold would deadlock the scheduler.
        let peak_len = (token_ids.len() + params.max_tokens).min(self.options.max_model_len);
        if peak_len > self.options.max_num_batched_tokens {
            return Err(EngineError::Resource(format!(
                "request of up to {peak_len} token(s) exceeds max_num_batched_tokens {}",
                self.options.max_num_batched_tokens
            )));
        }
        let peak_blocks = peak_len.div_ceil(self.options.kvcache_block_size);
        if peak_blocks > self.scheduler.block_manager().num_blocks() {
            return Err(EngineError::Resource(format!(
                "request needs up to {peak_blocks} KV block(s) but the pool has {}",
                self.scheduler.block_manager().num_blocks()
            )));
        }

        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        debug!("admitting sequence {seq_id} with {} prompt token(s)", token_ids.len());
        self.scheduler.add(Sequence::new(seq_id, token_ids, params));
        Ok(seq_id)
    }

    /// Runs one scheduling step: at most one forward pass per scheduled
    /// sequence and one sampled token each. Returns the step's outputs;
    /// empty when nothing was schedulable.
    pub fn step(&mut self) -> Result<Vec<StepOutput>> {
        let Some(batch) = self.scheduler.schedule() else {
            return Ok(Vec::new());
        };

        let inputs: Vec<SequenceInput> = batch
            .seq_ids
            .iter()
            .map(|&id| {
                let seq = self.scheduler.get(id).expect("scheduled id is live");
                if batch.is_prefill {
                    // A fully cached prompt still recomputes its last token:
                    // the step needs that position's logits to sample from.
                    let start = seq.num_cached_tokens.min(seq.num_tokens() - 1);
                    SequenceInput {
                        seq_id: id,
                        input_ids: seq.token_ids[start..].to_vec(),
                        positions: (start..seq.num_tokens()).collect(),
                        block_table: seq.block_table.clone(),
                    }
                } else {
                    SequenceInput {
                        seq_id: id,
                        input_ids: vec![seq.last_token()],
                        positions: vec![seq.num_tokens() - 1],
                        block_table: seq.block_table.clone(),
                    }
                }
            })
            .collect();

        let last_logits = self.runner.run(&inputs)?;

        let sampled: Vec<u32> = batch
            .seq_ids
            .iter()
            .zip(last_logits)
            .map(|(&id, mut logits)| {
                let seq = self.scheduler.get(id).expect("scheduled id is live");
                self.sampler.sample(&mut logits, &seq.token_ids, &seq.params)
            })
            .collect();

        let finished = self.scheduler.post_process(&batch, &sampled);

        let outputs = batch
            .seq_ids
            .iter()
            .zip(sampled.iter().zip(finished))
            .map(|(&seq_id, (&token_id, finished))| StepOutput {
                seq_id,
                token_id,
                finished,
            })
            .collect();
        Ok(outputs)
    }

    /// True when no admitted sequence is waiting or running.
    pub fn is_finished(&self) -> bool {
        self.scheduler.is_finished()
    }

    /// Detokenizes and drops a finished sequence.
    fn surface(&mut self, seq_id: SeqId) -> GenerationOutput {
        let seq = self.scheduler.remove(seq_id).expect("finished id is live");
        let token_ids = seq.completion_token_ids().to_vec();
        GenerationOutput {
            seq_id,
            text: self.tokenizer.decode(&token_ids),
            token_ids,
        }
    }

    /// Convenience driver: admits every prompt, steps until done, and
    /// returns the outputs in prompt order.
    pub fn generate(&mut self, prompts: &[String], params: &[SamplingParams]) -> Result<Vec<GenerationOutput>> {
        if prompts.len() != params.len() {
            return Err(EngineError::Config(format!(
                "{} prompt(s) but {} sampling parameter set(s)",
                prompts.len(),
                params.len()
            )));
        }

        let mut order = Vec::with_capacity(prompts.len());
        for (prompt, params) in prompts.iter().zip(params) {
            order.push(self.add_request(prompt, params.clone())?);
        }

        let mut finished: HashMap<SeqId, GenerationOutput> = HashMap::new();
        while !self.is_finished() {
            for output in self.step()? {
                if output.finished {
                    finished.insert(output.seq_id, self.surface(output.seq_id));
                }
            }
        }

        order
            .into_iter()
            .map(|id| {
                finished
                    .remove(&id)
                    .ok_or_else(|| EngineError::for_sequence(id, EngineError::Resource("no output produced".to_string())))
            })
            .collect()
    }

    /// Streaming variant of [`LlmEngine::step`] that also surfaces and
    /// removes finished sequences, handing back their full outputs.
    pub fn step_streaming(&mut self) -> Result<(Vec<StepOutput>, Vec<GenerationOutput>)> {
        let steps = self.step()?;
        let done = steps
            .iter()
            .filter(|s| s.finished)
            .map(|s| self.surface(s.seq_id))
            .collect();
        Ok((steps, done))
    }
}

impl std::fmt::Debug for LlmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmEngine")
            .field("options", &self.options)
            .field("next_seq_id", &self.next_seq_id)
            .finish_non_exhaustive()
    }
}
