use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Default engine limits for single-host serving.
const DEFAULT_MAX_NUM_BATCHED_TOKENS: usize = 16384;
const DEFAULT_MAX_NUM_SEQS: usize = 512;
const DEFAULT_MAX_MODEL_LEN: usize = 4096;
const DEFAULT_KVCACHE_BLOCK_SIZE: usize = 256;

/// Rotary scaling description from `config.json`.
///
/// Only the `linear` type is supported; `yarn` and friends are rejected
/// during validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type", alias = "rope_type")]
    pub kind: String,
    pub factor: f32,
}

/// `eos_token_id` ships either as a single id or as a list of ids
/// depending on the checkpoint generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    /// The primary eos id used for stop checks.
    pub fn primary(&self) -> Option<u32> {
        match self {
            EosTokenId::Single(id) => Some(*id),
            EosTokenId::Multiple(ids) => ids.first().copied(),
        }
    }
}

/// Model hyperparameters sourced from the checkpoint's `config.json`.
///
/// Loaded once at engine startup and immutable thereafter.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f32,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rope_theta() -> f32 {
    10000.0
}

impl ModelConfig {
    /// Reads and validates `config.json` from a model directory.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let config_path = model_dir.join("config.json");
        let contents = fs::read_to_string(&config_path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {e}", config_path.display()))
        })?;

        let config: ModelConfig = serde_json::from_str(&contents).map_err(|e| {
            EngineError::Config(format!("failed to parse {}: {e}", config_path.display()))
        })?;

        config.validate()?;

        info!(
            "Model configuration: hidden={} layers={} heads={}/{} head_dim={} vocab={}",
            config.hidden_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.num_kv_heads(),
            config.head_dim(),
            config.vocab_size,
        );

        Ok(config)
    }

    /// Number of key/value heads. Defaults to the query head count
    /// (plain multi-head attention).
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads
            .unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension. Qwen3 checkpoints ship it explicitly; older
    /// ones derive it from the hidden size.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// The primary eos token id, if the config declares one.
    pub fn eos_id(&self) -> Option<u32> {
        self.eos_token_id.as_ref().and_then(EosTokenId::primary)
    }

    fn validate(&self) -> Result<()> {
        if self.hidden_act != "silu" {
            return Err(EngineError::Config(format!(
                "unsupported activation '{}', only 'silu' is supported",
                self.hidden_act
            )));
        }

        let dimensions = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("intermediate_size", self.intermediate_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("head_dim", self.head_dim()),
        ];
        for (name, value) in dimensions {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be positive")));
            }
        }

        let num_kv_heads = self.num_kv_heads();
        if num_kv_heads == 0 || self.num_attention_heads % num_kv_heads != 0 {
            return Err(EngineError::Config(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({num_kv_heads})",
                self.num_attention_heads
            )));
        }

        if let Some(scaling) = &self.rope_scaling {
            if scaling.kind != "linear" {
                return Err(EngineError::Config(format!(
                    "unsupported rope_scaling type '{}', only 'linear' is supported",
                    scaling.kind
                )));
            }
            if scaling.factor <= 0.0 {
                return Err(EngineError::Config(
                    "rope_scaling factor must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Engine-level limits and knobs, all optional with serving defaults.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Cap on the sum of prefill work per batch.
    pub max_num_batched_tokens: usize,
    /// Cap on concurrent in-flight sequences.
    pub max_num_seqs: usize,
    /// Hard cap on a sequence's total tokens.
    pub max_model_len: usize,
    /// KV cache block capacity in tokens.
    pub kvcache_block_size: usize,
    /// KV cache pool size. Derived from `max_model_len` when not set.
    pub num_kvcache_blocks: Option<usize>,
    /// Disable speculative graph compilation (reserved).
    pub enforce_eager: bool,
    /// PRNG seed for sampling. Fix it for reproducible runs.
    pub seed: u64,
}

impl EngineOptions {
    pub fn builder() -> EngineOptionsBuilder {
        EngineOptionsBuilder::default()
    }

    /// Pool size, falling back to two full sequences worth of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_kvcache_blocks
            .unwrap_or_else(|| 2 * self.max_model_len.div_ceil(self.kvcache_block_size).max(1))
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: DEFAULT_MAX_NUM_BATCHED_TOKENS,
            max_num_seqs: DEFAULT_MAX_NUM_SEQS,
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            kvcache_block_size: DEFAULT_KVCACHE_BLOCK_SIZE,
            num_kvcache_blocks: None,
            enforce_eager: false,
            seed: default_seed(),
        }
    }
}

fn default_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub struct EngineOptionsBuilder {
    max_num_batched_tokens: Option<usize>,
    max_num_seqs: Option<usize>,
    max_model_len: Option<usize>,
    kvcache_block_size: Option<usize>,
    num_kvcache_blocks: Option<usize>,
    enforce_eager: Option<bool>,
    seed: Option<u64>,
}

impl EngineOptionsBuilder {
    pub fn max_num_batched_tokens(mut self, value: Option<usize>) -> Self {
        self.max_num_batched_tokens = value;
        self
    }
    pub fn max_num_seqs(mut self, value: Option<usize>) -> Self {
        self.max_num_seqs = value;
        self
    }
    pub fn max_model_len(mut self, value: Option<usize>) -> Self {
        self.max_model_len = value;
        self
    }
    pub fn kvcache_block_size(mut self, value: Option<usize>) -> Self {
        self.kvcache_block_size = value;
        self
    }
    pub fn num_kvcache_blocks(mut self, value: Option<usize>) -> Self {
        self.num_kvcache_blocks = value;
        self
    }
    pub fn enforce_eager(mut self, value: Option<bool>) -> Self {
        self.enforce_eager = value;
        self
    }
    pub fn seed(mut self, value: Option<u64>) -> Self {
        self.seed = value;
        self
    }

    pub fn build(self) -> Result<EngineOptions> {
        let defaults = EngineOptions::default();
        let options = EngineOptions {
            max_num_batched_tokens: self
                .max_num_batched_tokens
                .unwrap_or(defaults.max_num_batched_tokens),
            max_num_seqs: self.max_num_seqs.unwrap_or(defaults.max_num_seqs),
            max_model_len: self.max_model_len.unwrap_or(defaults.max_model_len),
            kvcache_block_size: self
                .kvcache_block_size
                .unwrap_or(defaults.kvcache_block_size),
            num_kvcache_blocks: self.num_kvcache_blocks,
            enforce_eager: self.enforce_eager.unwrap_or(false),
            seed: self.seed.unwrap_or(defaults.seed),
        };

        if options.max_model_len == 0 || options.max_num_seqs == 0 {
            return Err(EngineError::Config(
                "max_model_len and max_num_seqs must be positive".to_string(),
            ));
        }
        if options.kvcache_block_size == 0 {
            return Err(EngineError::Config(
                "kvcache_block_size must be positive".to_string(),
            ));
        }

        Ok(options)
    }
}
