use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use log::debug;

use crate::sequence::Sequence;

/// A fixed-capacity KV cache block: the token-id chunk it stores, a
/// refcount, and (for full blocks only) a content hash.
///
/// The hash chains in the previous block's hash, so equal hashes imply the
/// entire prefix up to and including this block matches. A full token
/// compare still guards the chunk itself before a hit is declared.
#[derive(Debug, Default)]
struct Block {
    ref_count: usize,
    hash: Option<u64>,
    tokens: Vec<u32>,
}

/// Allocator for the fixed pool of KV cache blocks, with prefix-hash reuse.
///
/// Only full blocks are published to the `hash -> block` map; the final,
/// partially filled block of a sequence is always uniquely owned.
#[derive(Debug)]
pub struct BlockManager {
    block_size: usize,
    blocks: Vec<Block>,
    free_blocks: Vec<usize>,
    hash_to_block: HashMap<u64, usize>,
}

impl BlockManager {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            block_size,
            blocks: (0..num_blocks).map(|_| Block::default()).collect(),
            free_blocks: (0..num_blocks).collect(),
            hash_to_block: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    fn chunk_hash(parent: Option<u64>, tokens: &[u32]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        parent.hash(&mut hasher);
        tokens.hash(&mut hasher);
        hasher.finish()
    }

    /// True when enough free blocks exist to cover the sequence's chunks,
    /// discounting full chunks already present in the prefix cache.
    pub fn can_allocate(&self, seq: &Sequence) -> bool {
        let mut needed = 0usize;
        let mut parent = None;
        for chunk in seq.token_ids.chunks(self.block_size) {
            if chunk.len() == self.block_size {
                let hash = Self::chunk_hash(parent, chunk);
                parent = Some(hash);
                if self.lookup(hash, chunk).is_some() {
                    continue;
                }
            }
            needed += 1;
        }
        self.free_blocks.len() >= needed
    }

    /// Binds the sequence to blocks covering all of its tokens, reusing
    /// prefix-shared full blocks and advancing `num_cached_tokens` by every
    /// reused chunk.
    ///
    /// The caller must have checked `can_allocate` first.
    pub fn allocate(&mut self, seq: &mut Sequence) {
        debug_assert!(seq.block_table.is_empty(), "sequence already has blocks");

        let chunks: Vec<&[u32]> = seq.token_ids.chunks(self.block_size).collect();
        let mut parent = None;

        for chunk in chunks {
            if chunk.len() == self.block_size {
                let hash = Self::chunk_hash(parent, chunk);
                parent = Some(hash);

                if let Some(block_id) = self.lookup(hash, chunk) {
                    self.blocks[block_id].ref_count += 1;
                    seq.block_table.push(block_id);
                    seq.num_cached_tokens += chunk.len();
                    continue;
                }

                let block_id = self.pop_free();
                let block = &mut self.blocks[block_id];
                block.ref_count = 1;
                block.tokens = chunk.to_vec();
                block.hash = Some(hash);
                seq.block_table.push(block_id);
                self.hash_to_block.entry(hash).or_insert(block_id);
            } else {
                // Partial final chunk: never a sharing candidate.
                let block_id = self.pop_free();
                let block = &mut self.blocks[block_id];
                block.ref_count = 1;
                block.tokens = chunk.to_vec();
                block.hash = None;
                seq.block_table.push(block_id);
            }
        }
    }

    /// True when the sequence's last generated token can be placed: the last
    /// block has room, or a free block exists.
    pub fn can_append(&self, seq: &Sequence) -> bool {
        match seq.block_table.last() {
            Some(&last) if self.blocks[last].tokens.len() < self.block_size => true,
            _ => !self.free_blocks.is_empty(),
        }
    }

    /// Places the sequence's last token into its block table, starting a new
    /// block when the last one is full. A block that fills up is published
    /// to the prefix cache.
    pub fn append(&mut self, seq: &mut Sequence) {
        let token = seq.last_token();

        let needs_new_block = match seq.block_table.last() {
            Some(&last) => self.blocks[last].tokens.len() == self.block_size,
            None => true,
        };

        if needs_new_block {
            let block_id = self.pop_free();
            let block = &mut self.blocks[block_id];
            block.ref_count = 1;
            block.tokens = vec![token];
            block.hash = None;
            seq.block_table.push(block_id);
        } else {
            let last = *seq.block_table.last().expect("checked above");
            debug_assert_eq!(self.blocks[last].ref_count, 1, "partial blocks are never shared");
            self.blocks[last].tokens.push(token);
        }

        let last = *seq.block_table.last().expect("just appended");
        if self.blocks[last].tokens.len() == self.block_size {
            let parent = seq
                .block_table
                .len()
                .checked_sub(2)
                .and_then(|i| self.blocks[seq.block_table[i]].hash);
            let hash = Self::chunk_hash(parent, &self.blocks[last].tokens);
            self.blocks[last].hash = Some(hash);
            // First writer wins; a concurrent identical chunk keeps its entry.
            self.hash_to_block.entry(hash).or_insert(last);
        }
    }

    /// Releases every block in the sequence's table, returning blocks whose
    /// refcount reaches zero to the free list and dropping their hash entry.
    pub fn free(&mut self, seq: &mut Sequence) {
        for &block_id in &seq.block_table {
            let block = &mut self.blocks[block_id];
            block.ref_count -= 1;

            if block.ref_count == 0 {
                if let Some(hash) = block.hash.take() {
                    if self.hash_to_block.get(&hash) == Some(&block_id) {
                        self.hash_to_block.remove(&hash);
                    }
                }
                block.tokens.clear();
                self.free_blocks.push(block_id);
            }
        }

        debug!("freed {} block(s) of sequence {}", seq.block_table.len(), seq.id);
        seq.block_table.clear();
        seq.num_cached_tokens = 0;
    }

    fn lookup(&self, hash: u64, tokens: &[u32]) -> Option<usize> {
        let &block_id = self.hash_to_block.get(&hash)?;
        let block = &self.blocks[block_id];
        // Collision guard: the chunk itself must match.
        (block.tokens == tokens).then_some(block_id)
    }

    fn pop_free(&mut self) -> usize {
        self.free_blocks.pop().expect("caller checked availability")
    }

    #[cfg(test)]
    fn ref_count(&self, block_id: usize) -> usize {
        self.blocks[block_id].ref_count
    }
}
