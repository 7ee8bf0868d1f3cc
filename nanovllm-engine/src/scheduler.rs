use std::collections::{HashMap, VecDeque};

use log::{debug, warn};

use crate::block_manager::BlockManager;
use crate::config::EngineOptions;
use crate::sequence::{SeqId, Sequence, SequenceStatus};

/// One scheduling decision: the sequences to run this step, and whether
/// they are prefilling (full prompts) or decoding (one token each).
/// Prefill and decode never mix in a batch.
#[derive(Debug)]
pub struct ScheduledBatch {
    pub seq_ids: Vec<SeqId>,
    pub is_prefill: bool,
}

/// Two-queue prefill/decode dispatcher with preemption.
///
/// `waiting` holds admitted-but-unscheduled sequences in FIFO order;
/// `running` holds in-flight sequences. A preempted sequence loses its
/// blocks and returns to the *front* of `waiting`, so it resumes before
/// new arrivals.
pub struct Scheduler {
    max_num_seqs: usize,
    max_num_batched_tokens: usize,
    max_model_len: usize,
    eos_token_id: u32,
    block_manager: BlockManager,
    sequences: HashMap<SeqId, Sequence>,
    waiting: VecDeque<SeqId>,
    running: VecDeque<SeqId>,
}

impl Scheduler {
    pub fn new(options: &EngineOptions, eos_token_id: u32) -> Self {
        Self {
            max_num_seqs: options.max_num_seqs,
            max_num_batched_tokens: options.max_num_batched_tokens,
            max_model_len: options.max_model_len,
            eos_token_id,
            block_manager: BlockManager::new(options.num_blocks(), options.kvcache_block_size),
            sequences: HashMap::new(),
            waiting: VecDeque::new(),
            running: VecDeque::new(),
        }
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn add(&mut self, seq: Sequence) {
        self.waiting.push_back(seq.id);
        self.sequences.insert(seq.id, seq);
    }

    pub fn get(&self, id: SeqId) -> Option<&Sequence> {
        self.sequences.get(&id)
    }

    pub fn get_mut(&mut self, id: SeqId) -> Option<&mut Sequence> {
        self.sequences.get_mut(&id)
    }

    /// Drops a finished sequence after its output has been surfaced.
    pub fn remove(&mut self, id: SeqId) -> Option<Sequence> {
        self.sequences.remove(&id)
    }

    pub fn is_finished(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    /// Picks the next batch: prefill admission from `waiting` first, else a
    /// decode pass over `running`. Returns `None` when nothing is schedulable.
    pub fn schedule(&mut self) -> Option<ScheduledBatch> {
        // Prefill: drain the front of the waiting queue while limits allow.
        let mut scheduled = Vec::new();
        let mut batched_tokens = 0usize;
        while let Some(&id) = self.waiting.front() {
            if scheduled.len() >= self.max_num_seqs {
                break;
            }
            let seq = &self.sequences[&id];
            let new_tokens = seq.num_tokens() - seq.num_cached_tokens;
            if batched_tokens + new_tokens > self.max_num_batched_tokens {
                break;
            }
            if !self.block_manager.can_allocate(seq) {
                break;
            }

            self.waiting.pop_front();
            let seq = self.sequences.get_mut(&id).expect("queued id is live");
            self.block_manager.allocate(seq);
            seq.status = SequenceStatus::Running;
            batched_tokens += new_tokens;
            self.running.push_back(id);
            scheduled.push(id);
        }
        if !scheduled.is_empty() {
            debug!("prefill batch of {} sequence(s), {batched_tokens} token(s)", scheduled.len());
            return Some(ScheduledBatch {
                seq_ids: scheduled,
                is_prefill: true,
            });
        }

        if self.running.is_empty() {
            return None;
        }

        // Decode: walk the running queue, appending one slot per sequence.
        // When a sequence cannot grow, the youngest running sequence is
        // preempted to make room, and the walk retries.
        let mut scheduled = VecDeque::new();
        while scheduled.len() < self.max_num_seqs {
            let Some(id) = self.running.pop_front() else {
                break;
            };

            let appendable = loop {
                let seq = &self.sequences[&id];
                if self.block_manager.can_append(seq) {
                    break true;
                }
                match self.running.pop_back() {
                    Some(victim) => self.preempt(victim),
                    None => {
                        self.preempt(id);
                        break false;
                    }
                }
            };

            if appendable {
                let seq = self.sequences.get_mut(&id).expect("running id is live");
                self.block_manager.append(seq);
                scheduled.push_back(id);
            }
        }

        // Scheduled sequences keep their order ahead of any unvisited ones.
        for &id in scheduled.iter().rev() {
            self.running.push_front(id);
        }

        (!scheduled.is_empty()).then(|| ScheduledBatch {
            seq_ids: scheduled.into(),
            is_prefill: false,
        })
    }

    fn preempt(&mut self, id: SeqId) {
        warn!("preempting sequence {id}");
        let seq = self.sequences.get_mut(&id).expect("preempted id is live");
        self.block_manager.free(seq);
        seq.status = SequenceStatus::Waiting;
        self.waiting.push_front(id);
    }

    /// Applies one step's sampled tokens: appends them in batch order and
    /// retires sequences that hit eos or a length cap. Returns finished
    /// flags aligned with the batch.
    pub fn post_process(&mut self, batch: &ScheduledBatch, sampled_ids: &[u32]) -> Vec<bool> {
        debug_assert_eq!(batch.seq_ids.len(), sampled_ids.len());

        let mut finished = vec![false; sampled_ids.len()];
        for (i, (&id, &token)) in batch.seq_ids.iter().zip(sampled_ids).enumerate() {
            let eos_token_id = self.eos_token_id;
            let max_model_len = self.max_model_len;
            let seq = self.sequences.get_mut(&id).expect("batched id is live");
            seq.append_token(token);

            let hit_eos = !seq.params.ignore_eos && token == eos_token_id;
            let hit_cap = seq.num_completion_tokens() >= seq.params.max_tokens
                || seq.num_tokens() >= max_model_len;
            if hit_eos || hit_cap {
                seq.status = SequenceStatus::Finished;
                self.block_manager.free(seq);
                self.running.retain(|&running_id| running_id != id);
                finished[i] = true;
            }
        }
        finished
    }
}
