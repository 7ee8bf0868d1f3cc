use crate::sampler::SamplingParams;

pub type SeqId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Finished,
}

/// A single generation request and its scheduling state.
///
/// Tokens are appended only by the engine after sampling. The block table
/// holds indices into the shared block pool, never references.
#[derive(Debug)]
pub struct Sequence {
    pub id: SeqId,
    pub status: SequenceStatus,
    pub token_ids: Vec<u32>,
    pub num_prompt_tokens: usize,
    /// Prefix length whose KV rows were found in shared cache blocks.
    pub num_cached_tokens: usize,
    pub block_table: Vec<usize>,
    pub params: SamplingParams,
}

impl Sequence {
    pub fn new(id: SeqId, token_ids: Vec<u32>, params: SamplingParams) -> Self {
        let num_prompt_tokens = token_ids.len();
        Self {
            id,
            status: SequenceStatus::Waiting,
            token_ids,
            num_prompt_tokens,
            num_cached_tokens: 0,
            block_table: Vec::new(),
            params,
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    pub fn num_completion_tokens(&self) -> usize {
        self.token_ids.len() - self.num_prompt_tokens
    }

    pub fn last_token(&self) -> u32 {
        *self.token_ids.last().expect("sequence is never empty")
    }

    pub fn completion_token_ids(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    pub fn append_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
    }

    pub fn is_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }
}
