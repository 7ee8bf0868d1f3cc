use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::kv_cache::KvCache;
use crate::layers::{Attention, Embedding, Linear, Mlp, RmsNorm, RotaryEmbedding};

/// One decoder layer: pre-norm attention and MLP with residuals.
struct DecoderBlock {
    input_norm: RmsNorm,
    attention: Attention,
    post_attention_norm: RmsNorm,
    mlp: Mlp,
}

/// Qwen-family decoder-only transformer.
///
/// Weights are bound from Hugging-Face-style tensor names at load time and
/// immutable afterwards. The KV cache is external: each forward call names
/// its cache slots through a block table, so the same model instance serves
/// every in-flight sequence.
pub struct QwenModel {
    embedding: Embedding,
    blocks: Vec<DecoderBlock>,
    final_norm: RmsNorm,
    lm_head: Linear,
    hidden_size: usize,
    vocab_size: usize,
}

impl QwenModel {
    /// Binds every declared parameter from the checkpoint directory.
    /// A missing tensor or a shape mismatch against the configuration is
    /// fatal.
    pub fn from_checkpoint(model_dir: &Path, config: &ModelConfig) -> Result<Self> {
        let checkpoint = Checkpoint::open(model_dir)?;

        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let n_heads = config.num_attention_heads;
        let n_kv_heads = config.num_kv_heads();
        let q_dim = n_heads * head_dim;
        let kv_dim = n_kv_heads * head_dim;
        let intermediate = config.intermediate_size;
        let eps = config.rms_norm_eps;

        let embed_table = Arc::new(load_matrix(
            &checkpoint,
            "model.embed_tokens.weight",
            config.vocab_size,
            hidden,
        )?);

        let rope = Arc::new(RotaryEmbedding::new(
            head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            config.rope_scaling.as_ref(),
        ));

        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for layer in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{layer}");

            let wq = Linear::new(
                load_matrix(&checkpoint, &format!("{prefix}.self_attn.q_proj.weight"), q_dim, hidden)?,
                hidden,
                q_dim,
            );
            let wk = Linear::new(
                load_matrix(&checkpoint, &format!("{prefix}.self_attn.k_proj.weight"), kv_dim, hidden)?,
                hidden,
                kv_dim,
            );
            let wv = Linear::new(
                load_matrix(&checkpoint, &format!("{prefix}.self_attn.v_proj.weight"), kv_dim, hidden)?,
                hidden,
                kv_dim,
            );
            let wo = Linear::new(
                load_matrix(&checkpoint, &format!("{prefix}.self_attn.o_proj.weight"), hidden, q_dim)?,
                q_dim,
                hidden,
            );

            // Qwen3 checkpoints carry per-head QK norms; Qwen2 does not.
            let q_norm = load_optional_vector(&checkpoint, &format!("{prefix}.self_attn.q_norm.weight"), head_dim)?
                .map(|w| RmsNorm::new(w, eps));
            let k_norm = load_optional_vector(&checkpoint, &format!("{prefix}.self_attn.k_norm.weight"), head_dim)?
                .map(|w| RmsNorm::new(w, eps));

            let attention = Attention::new(
                wq,
                wk,
                wv,
                wo,
                q_norm,
                k_norm,
                Arc::clone(&rope),
                n_heads,
                n_kv_heads,
                head_dim,
            );

            // Fuse gate and up row-wise into a single [2I, H] projection.
            let gate = load_matrix(&checkpoint, &format!("{prefix}.mlp.gate_proj.weight"), intermediate, hidden)?;
            let up = load_matrix(&checkpoint, &format!("{prefix}.mlp.up_proj.weight"), intermediate, hidden)?;
            let mut gate_up = gate;
            gate_up.extend_from_slice(&up);
            let mlp = Mlp::new(
                Linear::new(gate_up, hidden, 2 * intermediate),
                Linear::new(
                    load_matrix(&checkpoint, &format!("{prefix}.mlp.down_proj.weight"), hidden, intermediate)?,
                    intermediate,
                    hidden,
                ),
                intermediate,
            );

            let input_norm = RmsNorm::new(
                load_vector(&checkpoint, &format!("{prefix}.input_layernorm.weight"), hidden)?,
                eps,
            );
            let post_attention_norm = RmsNorm::new(
                load_vector(&checkpoint, &format!("{prefix}.post_attention_layernorm.weight"), hidden)?,
                eps,
            );

            blocks.push(DecoderBlock {
                input_norm,
                attention,
                post_attention_norm,
                mlp,
            });
            debug!("bound layer {layer}");
        }

        let final_norm = RmsNorm::new(load_vector(&checkpoint, "model.norm.weight", hidden)?, eps);

        // Tied embeddings share the table, they never copy it.
        let lm_head = match checkpoint.tensor("lm_head.weight")? {
            Some(tensor) if !config.tie_word_embeddings => {
                validate_shape(&tensor.shape, &[config.vocab_size, hidden], "lm_head.weight")?;
                Linear::new(tensor.data, hidden, config.vocab_size)
            }
            _ => {
                info!("lm_head.weight absent or tied, sharing the embedding table");
                Linear::shared(Arc::clone(&embed_table), hidden, config.vocab_size)
            }
        };

        let embedding = Embedding::new(embed_table, hidden);
        info!("Bound {} decoder layer(s)", blocks.len());

        Ok(Self {
            embedding,
            blocks,
            final_norm,
            lm_head,
            hidden_size: hidden,
            vocab_size: config.vocab_size,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Runs the decoder over `input_ids` at absolute `positions`, extending
    /// the KV cache rows addressed by `block_table`. Returns `[t, vocab]`
    /// logits; an empty input yields an empty buffer and leaves the cache
    /// untouched.
    pub fn forward(
        &self,
        input_ids: &[u32],
        positions: &[usize],
        cache: &mut KvCache,
        block_table: &[usize],
    ) -> Result<Vec<f32>> {
        let t = input_ids.len();
        if t == 0 {
            return Ok(Vec::new());
        }
        if positions.len() != t {
            return Err(EngineError::Shape {
                op: "forward",
                expected: format!("{t} positions"),
                actual: positions.len().to_string(),
            });
        }

        let mut hidden = vec![0.0f32; t * self.hidden_size];
        self.embedding.forward(input_ids, &mut hidden)?;

        let mut normed = vec![0.0f32; t * self.hidden_size];
        let mut residual = vec![0.0f32; t * self.hidden_size];

        for (layer, block) in self.blocks.iter().enumerate() {
            block.input_norm.forward(&mut normed, &hidden);
            block
                .attention
                .forward(&normed, positions, cache, layer, block_table, &mut residual)?;
            hidden.iter_mut().zip(residual.iter()).for_each(|(h, &r)| *h += r);

            block.post_attention_norm.forward(&mut normed, &hidden);
            block.mlp.forward(&normed, t, &mut residual)?;
            hidden.iter_mut().zip(residual.iter()).for_each(|(h, &r)| *h += r);
        }

        self.final_norm.forward_inplace(&mut hidden);

        let mut logits = vec![0.0f32; t * self.vocab_size];
        self.lm_head.forward(&mut logits, &hidden, t)?;
        Ok(logits)
    }
}

impl std::fmt::Debug for QwenModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenModel")
            .field("hidden_size", &self.hidden_size)
            .field("vocab_size", &self.vocab_size)
            .field("num_layers", &self.blocks.len())
            .finish()
    }
}

fn validate_shape(actual: &[usize], expected: &[usize], name: &str) -> Result<()> {
    if actual != expected {
        return Err(EngineError::Load(format!(
            "tensor '{name}' has shape {actual:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

fn load_matrix(checkpoint: &Checkpoint, name: &str, rows: usize, cols: usize) -> Result<Vec<f32>> {
    let tensor = checkpoint.load(name)?;
    validate_shape(&tensor.shape, &[rows, cols], name)?;
    Ok(tensor.data)
}

fn load_vector(checkpoint: &Checkpoint, name: &str, len: usize) -> Result<Vec<f32>> {
    let tensor = checkpoint.load(name)?;
    validate_shape(&tensor.shape, &[len], name)?;
    Ok(tensor.data)
}

fn load_optional_vector(checkpoint: &Checkpoint, name: &str, len: usize) -> Result<Option<Vec<f32>>> {
    match checkpoint.tensor(name)? {
        Some(tensor) => {
            validate_shape(&tensor.shape, &[len], name)?;
            Ok(Some(tensor.data))
        }
        None => Ok(None),
    }
}
