use std::sync::Arc;

use rayon::prelude::*;

use crate::config::RopeScaling;
use crate::error::{EngineError, Result};
use crate::kv_cache::KvCache;
use crate::tensor::{gemm_nn, gemm_nt, silu, softmax};

/// Token embedding layer - converts token IDs to dense vectors.
///
/// The table is shared with the LM head when the checkpoint ties
/// embeddings, hence the `Arc`.
pub struct Embedding {
    table: Arc<Vec<f32>>,
    dim: usize,
}

impl Embedding {
    pub fn new(table: Arc<Vec<f32>>, dim: usize) -> Self {
        Self { table, dim }
    }

    pub fn table(&self) -> Arc<Vec<f32>> {
        Arc::clone(&self.table)
    }

    /// Looks up the rows for `token_ids` into a `[T, dim]` buffer.
    pub fn forward(&self, token_ids: &[u32], output: &mut [f32]) -> Result<()> {
        debug_assert_eq!(output.len(), token_ids.len() * self.dim);
        let vocab_size = self.table.len() / self.dim;

        for (token, row) in token_ids.iter().zip(output.chunks_exact_mut(self.dim)) {
            let token = *token as usize;
            if token >= vocab_size {
                return Err(EngineError::Shape {
                    op: "embedding",
                    expected: format!("token id < {vocab_size}"),
                    actual: token.to_string(),
                });
            }
            row.copy_from_slice(&self.table[token * self.dim..(token + 1) * self.dim]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Embedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedding")
            .field("dim", &self.dim)
            .field("vocab_size", &(self.table.len() / self.dim))
            .finish()
    }
}

/// RMS normalization: y = x / sqrt(mean(x^2) + eps) * weight, reduced
/// along the hidden axis. Accepts slabs whose length is a multiple of the
/// weight length and normalizes each row independently.
pub struct RmsNorm {
    weight: Vec<f32>,
    eps: f32,
}

impl RmsNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len() % self.weight.len(), 0);

        for (out_row, in_row) in output
            .chunks_exact_mut(self.weight.len())
            .zip(input.chunks_exact(self.weight.len()))
        {
            let sum_of_squares = in_row.iter().map(|&x| x * x).sum::<f32>();
            let factor = 1.0f32 / ((sum_of_squares / in_row.len() as f32) + self.eps).sqrt();

            out_row
                .iter_mut()
                .zip(in_row.iter())
                .zip(self.weight.iter())
                .for_each(|((out, &inp), &w)| *out = w * (factor * inp));
        }
    }

    pub fn forward_inplace(&self, x: &mut [f32]) {
        debug_assert_eq!(x.len() % self.weight.len(), 0);

        for row in x.chunks_exact_mut(self.weight.len()) {
            let sum_of_squares = row.iter().map(|&val| val * val).sum::<f32>();
            let factor = 1.0f32 / ((sum_of_squares / row.len() as f32) + self.eps).sqrt();

            row.iter_mut()
                .zip(self.weight.iter())
                .for_each(|(val, &w)| *val = w * (factor * *val));
        }
    }
}

impl std::fmt::Debug for RmsNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmsNorm").field("dim", &self.weight.len()).finish()
    }
}

/// Rotary position embedding with precomputed cos/sin tables of shape
/// `[max_position, head_dim / 2]`.
///
/// Pairs rotate in the paired-adjacent convention: `(x[2i], x[2i+1])`.
/// Positions past the table clamp to the last entry.
pub struct RotaryEmbedding {
    head_dim: usize,
    max_position: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_position: usize, theta: f32, scaling: Option<&RopeScaling>) -> Self {
        let half = head_dim / 2;
        // Linear scaling stretches the context by dividing positions.
        let position_scale = scaling.map_or(1.0, |s| 1.0 / s.factor);

        let mut cos = Vec::with_capacity(max_position * half);
        let mut sin = Vec::with_capacity(max_position * half);
        for pos in 0..max_position {
            for i in 0..half {
                let freq = theta.powf(-2.0 * i as f32 / head_dim as f32);
                let angle = pos as f32 * position_scale * freq;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }

        Self {
            head_dim,
            max_position,
            cos,
            sin,
        }
    }

    /// Rotates one head vector in place for the given absolute position.
    pub fn apply(&self, vec: &mut [f32], pos: usize) {
        debug_assert_eq!(vec.len(), self.head_dim);

        let pos = pos.min(self.max_position - 1);
        let half = self.head_dim / 2;
        let table_row = pos * half;

        for i in 0..half {
            let c = self.cos[table_row + i];
            let s = self.sin[table_row + i];
            let x0 = vec[2 * i];
            let x1 = vec[2 * i + 1];
            vec[2 * i] = x0 * c - x1 * s;
            vec[2 * i + 1] = x1 * c + x0 * s;
        }
    }
}

impl std::fmt::Debug for RotaryEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryEmbedding")
            .field("head_dim", &self.head_dim)
            .field("max_position", &self.max_position)
            .finish()
    }
}

/// Linear projection y = x * W^T with a `[out_features, in_features]`
/// row-major weight. No bias; the Qwen decoder family carries none.
pub struct Linear {
    weight: Arc<Vec<f32>>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(weight: Vec<f32>, in_features: usize, out_features: usize) -> Self {
        Self::shared(Arc::new(weight), in_features, out_features)
    }

    /// Builds a projection over a shared buffer (tied embeddings).
    pub fn shared(weight: Arc<Vec<f32>>, in_features: usize, out_features: usize) -> Self {
        debug_assert_eq!(weight.len(), in_features * out_features);
        Self {
            weight,
            in_features,
            out_features,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Projects a `[t, in_features]` slab into a `[t, out_features]` buffer.
    pub fn forward(&self, output: &mut [f32], input: &[f32], t: usize) -> Result<()> {
        if input.len() != t * self.in_features || output.len() != t * self.out_features {
            return Err(EngineError::Shape {
                op: "linear",
                expected: format!("input [{t}, {}], output [{t}, {}]", self.in_features, self.out_features),
                actual: format!("input len {}, output len {}", input.len(), output.len()),
            });
        }

        gemm_nt(1.0, input, t, self.in_features, &self.weight, self.out_features, 0.0, output);
        Ok(())
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .finish()
    }
}

/// Grouped multi-head attention over the block-pooled KV cache.
///
/// Query head `h` reads KV head `h % n_kv_heads`. New K/V rows are written
/// into the cache slots named by the sequence's block table, so a prefix
/// shared with another sequence is read, not recomputed.
pub struct Attention {
    pub wq: Linear,
    pub wk: Linear,
    pub wv: Linear,
    pub wo: Linear,
    /// Per-head query/key norms, present on Qwen3-family checkpoints.
    pub q_norm: Option<RmsNorm>,
    pub k_norm: Option<RmsNorm>,
    rope: Arc<RotaryEmbedding>,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wq: Linear,
        wk: Linear,
        wv: Linear,
        wo: Linear,
        q_norm: Option<RmsNorm>,
        k_norm: Option<RmsNorm>,
        rope: Arc<RotaryEmbedding>,
        n_heads: usize,
        n_kv_heads: usize,
        head_dim: usize,
    ) -> Self {
        Self {
            wq,
            wk,
            wv,
            wo,
            q_norm,
            k_norm,
            rope,
            n_heads,
            n_kv_heads,
            head_dim,
        }
    }

    /// Runs attention for a `[t, hidden]` slab at absolute `positions`,
    /// reading and extending the cache rows of `layer` through
    /// `block_table`. `positions` must be contiguous; its first entry is
    /// the number of already-cached tokens.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input: &[f32],
        positions: &[usize],
        cache: &mut KvCache,
        layer: usize,
        block_table: &[usize],
        output: &mut [f32],
    ) -> Result<()> {
        let t = positions.len();
        if t == 0 {
            return Ok(());
        }
        debug_assert!(positions.windows(2).all(|w| w[1] == w[0] + 1));

        let d = self.head_dim;
        let q_dim = self.n_heads * d;
        let kv_dim = self.n_kv_heads * d;
        let prev_len = positions[0];
        let cache_len = prev_len + t;

        if block_table.len() * cache.block_size() < cache_len {
            return Err(EngineError::Shape {
                op: "attention",
                expected: format!("block table covering {cache_len} slots"),
                actual: format!("{} blocks of {}", block_table.len(), cache.block_size()),
            });
        }

        // Q/K/V projections.
        let mut q = vec![0.0f32; t * q_dim];
        let mut k = vec![0.0f32; t * kv_dim];
        let mut v = vec![0.0f32; t * kv_dim];
        self.wq.forward(&mut q, input, t)?;
        self.wk.forward(&mut k, input, t)?;
        self.wv.forward(&mut v, input, t)?;

        // Optional per-head QK norm, then rotary embedding.
        if let Some(q_norm) = &self.q_norm {
            q_norm.forward_inplace(&mut q);
        }
        if let Some(k_norm) = &self.k_norm {
            k_norm.forward_inplace(&mut k);
        }
        for (row, &pos) in q.chunks_exact_mut(q_dim).zip(positions) {
            for head in row.chunks_exact_mut(d) {
                self.rope.apply(head, pos);
            }
        }
        for (row, &pos) in k.chunks_exact_mut(kv_dim).zip(positions) {
            for head in row.chunks_exact_mut(d) {
                self.rope.apply(head, pos);
            }
        }

        // Append the new K/V rows to the cache slots of this sequence.
        for (step, &pos) in positions.iter().enumerate() {
            let block = block_table[pos / cache.block_size()];
            let slot = pos % cache.block_size();
            for kv_head in 0..self.n_kv_heads {
                let offset = step * kv_dim + kv_head * d;
                cache.write(block, layer, kv_head, slot, &k[offset..offset + d], &v[offset..offset + d]);
            }
        }

        // Per-head causal attention, heads in parallel. The temporary is
        // heads-major `[n_heads, t, d]` so each head owns a disjoint chunk.
        let cache = &*cache;
        let scale = (d as f32).sqrt().recip();
        let mut heads_out = vec![0.0f32; self.n_heads * t * d];

        heads_out
            .par_chunks_exact_mut(t * d)
            .enumerate()
            .for_each(|(h, out_h)| {
                let kv_head = h % self.n_kv_heads;

                // Contiguous Q_h [t, d] for this head.
                let mut q_h = vec![0.0f32; t * d];
                for step in 0..t {
                    let offset = step * q_dim + h * d;
                    q_h[step * d..(step + 1) * d].copy_from_slice(&q[offset..offset + d]);
                }

                // K_h and V_h [cache_len, d] gathered from the block pool.
                let (mut k_h, mut v_h) = (Vec::new(), Vec::new());
                cache.gather(block_table, layer, kv_head, cache_len, &mut k_h, &mut v_h);

                // scores = scale * Q_h * K_h^T, strictly causal.
                let mut scores = vec![0.0f32; t * cache_len];
                gemm_nt(scale, &q_h, t, d, &k_h, cache_len, 0.0, &mut scores);
                for (step, row) in scores.chunks_exact_mut(cache_len).enumerate() {
                    let visible = prev_len + step + 1;
                    row[visible..].fill(f32::NEG_INFINITY);
                    softmax(row);
                }

                gemm_nn(1.0, &scores, t, cache_len, &v_h, d, 0.0, out_h);
            });

        // Re-interleave heads into [t, n_heads * d] and project out.
        let mut concat = vec![0.0f32; t * q_dim];
        for h in 0..self.n_heads {
            for step in 0..t {
                let src = (h * t + step) * d;
                let dst = step * q_dim + h * d;
                concat[dst..dst + d].copy_from_slice(&heads_out[src..src + d]);
            }
        }
        self.wo.forward(output, &concat, t)
    }
}

impl std::fmt::Debug for Attention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attention")
            .field("n_heads", &self.n_heads)
            .field("n_kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .field("qk_norm", &self.q_norm.is_some())
            .finish()
    }
}

/// SiLU-gated MLP with the gate and up projections fused into one
/// `[2 * intermediate, hidden]` matrix: one GEMM, then
/// `silu(gate) * up`, then the down projection.
pub struct Mlp {
    pub gate_up: Linear,
    pub down: Linear,
    intermediate: usize,
}

impl Mlp {
    pub fn new(gate_up: Linear, down: Linear, intermediate: usize) -> Self {
        Self {
            gate_up,
            down,
            intermediate,
        }
    }

    pub fn forward(&self, input: &[f32], t: usize, output: &mut [f32]) -> Result<()> {
        let mut fused = vec![0.0f32; t * 2 * self.intermediate];
        self.gate_up.forward(&mut fused, input, t)?;

        let mut activated = vec![0.0f32; t * self.intermediate];
        for (act_row, fused_row) in activated
            .chunks_exact_mut(self.intermediate)
            .zip(fused.chunks_exact(2 * self.intermediate))
        {
            let (gate, up) = fused_row.split_at(self.intermediate);
            act_row
                .iter_mut()
                .zip(gate.iter().zip(up.iter()))
                .for_each(|(out, (&g, &u))| *out = silu(g) * u);
        }

        self.down.forward(output, &activated, t)
    }
}

impl std::fmt::Debug for Mlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mlp").field("intermediate", &self.intermediate).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_unit_weight() {
        let norm = RmsNorm::new(vec![1.0; 4], 0.0);
        let input = [2.0f32, 2.0, 2.0, 2.0];
        let mut output = [0.0f32; 4];
        norm.forward(&mut output, &input);
        // mean(x^2) = 4, so every element maps to 1.
        for v in output {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rms_norm_slab_rows_independent() {
        let norm = RmsNorm::new(vec![1.0; 2], 1e-6);
        let mut slab = [3.0f32, 3.0, 0.5, 0.5];
        norm.forward_inplace(&mut slab);
        assert!((slab[0] - slab[2]).abs() < 1e-5);
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, 8, 10000.0, None);
        let mut vec = [1.0f32, 2.0, 3.0, 4.0];
        rope.apply(&mut vec, 0);
        assert_eq!(vec, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rope_rotates_adjacent_pairs() {
        let rope = RotaryEmbedding::new(4, 8, 10000.0, None);
        let mut vec = [1.0f32, 0.0, 1.0, 0.0];
        rope.apply(&mut vec, 1);
        // Pair (0, 1) rotates by 1 rad; pair (2, 3) by theta^(-1/2) rad.
        assert!((vec[0] - 1.0f32.cos()).abs() < 1e-6);
        assert!((vec[1] - 1.0f32.sin()).abs() < 1e-6);
        let slow = 1.0 / 10000.0f32.powf(0.5);
        assert!((vec[2] - slow.cos()).abs() < 1e-6);
        assert!((vec[3] - slow.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_rope_preserves_norm() {
        let rope = RotaryEmbedding::new(8, 16, 10000.0, None);
        let mut vec = [0.3f32, -1.2, 0.7, 2.0, -0.5, 0.1, 1.1, -0.9];
        let norm_before: f32 = vec.iter().map(|v| v * v).sum();
        rope.apply(&mut vec, 13);
        let norm_after: f32 = vec.iter().map(|v| v * v).sum();
        assert!((norm_before - norm_after).abs() < 1e-4);
    }

    #[test]
    fn test_rope_clamps_out_of_range_position() {
        let rope = RotaryEmbedding::new(4, 8, 10000.0, None);
        let mut clamped = [1.0f32, 0.0, 1.0, 0.0];
        let mut last = clamped;
        rope.apply(&mut clamped, 100);
        rope.apply(&mut last, 7);
        assert_eq!(clamped, last);
    }

    #[test]
    fn test_rope_linear_scaling_halves_angle() {
        let scaling = RopeScaling {
            kind: "linear".to_string(),
            factor: 2.0,
        };
        let scaled = RotaryEmbedding::new(4, 8, 10000.0, Some(&scaling));
        let plain = RotaryEmbedding::new(4, 8, 10000.0, None);

        let mut a = [1.0f32, 0.0, 1.0, 0.0];
        let mut b = a;
        scaled.apply(&mut a, 2);
        plain.apply(&mut b, 1);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_linear_identity() {
        let mut weight = vec![0.0f32; 9];
        for i in 0..3 {
            weight[i * 3 + i] = 1.0;
        }
        let linear = Linear::new(weight, 3, 3);
        let input = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut output = [0.0f32; 6];
        linear.forward(&mut output, &input, 2).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_linear_shape_error() {
        let linear = Linear::new(vec![0.0; 6], 3, 2);
        let mut output = [0.0f32; 2];
        let result = linear.forward(&mut output, &[1.0, 2.0], 1);
        assert!(matches!(result, Err(EngineError::Shape { .. })));
    }

    #[test]
    fn test_embedding_lookup() {
        let table = Arc::new(vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        let embedding = Embedding::new(table, 2);
        let mut output = [0.0f32; 4];
        embedding.forward(&[2, 0], &mut output).unwrap();
        assert_eq!(output, [2.0, 2.0, 0.0, 0.0]);

        assert!(embedding.forward(&[3], &mut output[..2]).is_err());
    }

    #[test]
    fn test_mlp_zero_gate_blocks_everything() {
        // gate half zero -> silu(0) = 0 -> output zero regardless of up.
        let intermediate = 2;
        let hidden = 2;
        let mut gate_up = vec![0.0f32; 2 * intermediate * hidden];
        // Up rows pass the input through.
        gate_up[(intermediate) * hidden] = 1.0;
        gate_up[(intermediate + 1) * hidden + 1] = 1.0;
        let down = {
            let mut w = vec![0.0f32; hidden * intermediate];
            w[0] = 1.0;
            w[intermediate + 1] = 1.0;
            Linear::new(w, intermediate, hidden)
        };
        let mlp = Mlp::new(Linear::new(gate_up, hidden, 2 * intermediate), down, intermediate);

        let mut output = [9.0f32; 2];
        mlp.forward(&[1.0, -1.0], 1, &mut output).unwrap();
        assert_eq!(output, [0.0, 0.0]);
    }
}
