/// Physical K/V activation storage for the block pool.
///
/// One pool serves every layer and sequence: a slot is addressed by
/// `(block, layer, kv_head, slot_in_block)` and holds `head_dim` floats for
/// K and for V. Sequences name their slots through block tables, so blocks
/// shared by a common prompt prefix reuse the activations computed by the
/// first sequence that filled them.
#[derive(Debug)]
pub struct KvCache {
    k: Vec<f32>,
    v: Vec<f32>,
    n_layers: usize,
    n_kv_heads: usize,
    block_size: usize,
    head_dim: usize,
}

impl KvCache {
    pub fn new(num_blocks: usize, n_layers: usize, n_kv_heads: usize, block_size: usize, head_dim: usize) -> Self {
        let total = num_blocks * n_layers * n_kv_heads * block_size * head_dim;
        Self {
            k: vec![0.0; total],
            v: vec![0.0; total],
            n_layers,
            n_kv_heads,
            block_size,
            head_dim,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    fn index(&self, block: usize, layer: usize, kv_head: usize, slot: usize) -> usize {
        debug_assert!(layer < self.n_layers);
        debug_assert!(kv_head < self.n_kv_heads);
        debug_assert!(slot < self.block_size);
        (((block * self.n_layers + layer) * self.n_kv_heads + kv_head) * self.block_size + slot) * self.head_dim
    }

    /// Stores one token's K and V rows for a single kv head.
    pub fn write(&mut self, block: usize, layer: usize, kv_head: usize, slot: usize, k_row: &[f32], v_row: &[f32]) {
        debug_assert_eq!(k_row.len(), self.head_dim);
        debug_assert_eq!(v_row.len(), self.head_dim);

        let offset = self.index(block, layer, kv_head, slot);
        self.k[offset..offset + self.head_dim].copy_from_slice(k_row);
        self.v[offset..offset + self.head_dim].copy_from_slice(v_row);
    }

    /// Gathers the first `len` cached K and V rows of one kv head into
    /// contiguous `[len, head_dim]` buffers, following the block table.
    pub fn gather(
        &self,
        block_table: &[usize],
        layer: usize,
        kv_head: usize,
        len: usize,
        k_out: &mut Vec<f32>,
        v_out: &mut Vec<f32>,
    ) {
        k_out.clear();
        v_out.clear();
        k_out.reserve(len * self.head_dim);
        v_out.reserve(len * self.head_dim);

        for pos in 0..len {
            let block = block_table[pos / self.block_size];
            let offset = self.index(block, layer, kv_head, pos % self.block_size);
            k_out.extend_from_slice(&self.k[offset..offset + self.head_dim]);
            v_out.extend_from_slice(&self.v[offset..offset + self.head_dim]);
        }
    }
}
