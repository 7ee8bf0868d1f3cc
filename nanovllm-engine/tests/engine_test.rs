//! End-to-end engine scenarios over synthetic checkpoints.

mod common;

use std::path::Path;

use nanovllm_engine::{EngineError, EngineOptions, LlmEngine, SamplingParams};

use common::{EOS, HIDDEN, VOCAB};

fn options(num_blocks: usize, block_size: usize, seed: u64) -> EngineOptions {
    EngineOptions::builder()
        .max_model_len(Some(32))
        .kvcache_block_size(Some(block_size))
        .num_kvcache_blocks(Some(num_blocks))
        .seed(Some(seed))
        .build()
        .unwrap()
}

fn engine(dir: &Path, options: EngineOptions) -> LlmEngine {
    LlmEngine::new(dir, options).unwrap()
}

fn greedy(max_tokens: usize) -> SamplingParams {
    SamplingParams {
        temperature: 0.0,
        max_tokens,
        ..SamplingParams::default()
    }
}

#[test]
fn test_tiny_deterministic_argmax() {
    let dir = common::model_dir();
    common::write_identity_model(dir.path(), None);
    let mut engine = engine(dir.path(), options(8, 4, 0));

    // Prompt "bcd" encodes to [1, 2, 3]; the identity stack copies the
    // last token through the LM head.
    let outputs = engine
        .generate(&["bcd".to_string()], &[greedy(1)])
        .unwrap();
    assert_eq!(outputs[0].token_ids, vec![3]);
    assert_eq!(outputs[0].text, "d");
}

#[test]
fn test_length_cap() {
    let dir = common::model_dir();
    common::write_identity_model(dir.path(), None);
    let mut engine = engine(dir.path(), options(8, 4, 0));

    let outputs = engine
        .generate(&["bcd".to_string()], &[greedy(5)])
        .unwrap();
    // Self-copy repeats the last token until the cap.
    assert_eq!(outputs[0].token_ids, vec![3, 3, 3, 3, 3]);
}

#[test]
fn test_eos_stops_generation() {
    let dir = common::model_dir();
    // LM head that always puts eos at argmax.
    let mut head = vec![0.0f32; VOCAB * HIDDEN];
    for col in 0..HIDDEN {
        head[EOS as usize * HIDDEN + col] = 1.0;
    }
    common::write_identity_model(dir.path(), Some(head));
    let mut engine = engine(dir.path(), options(8, 4, 0));

    let outputs = engine
        .generate(&["bcd".to_string()], &[greedy(100)])
        .unwrap();
    // Generation returns the eos token itself and nothing after it.
    assert_eq!(outputs[0].token_ids, vec![EOS]);
}

#[test]
fn test_ignore_eos_runs_to_cap() {
    let dir = common::model_dir();
    let mut head = vec![0.0f32; VOCAB * HIDDEN];
    for col in 0..HIDDEN {
        head[EOS as usize * HIDDEN + col] = 1.0;
    }
    common::write_identity_model(dir.path(), Some(head));
    let mut engine = engine(dir.path(), options(8, 4, 0));

    let params = SamplingParams {
        ignore_eos: true,
        ..greedy(4)
    };
    let outputs = engine.generate(&["bcd".to_string()], &[params]).unwrap();
    assert_eq!(outputs[0].token_ids, vec![EOS; 4]);
}

#[test]
fn test_generate_preserves_prompt_order() {
    let dir = common::model_dir();
    common::write_identity_model(dir.path(), None);
    let mut engine = engine(dir.path(), options(8, 4, 0));

    let outputs = engine
        .generate(
            &["bcd".to_string(), "bc".to_string()],
            &[greedy(1), greedy(1)],
        )
        .unwrap();
    assert_eq!(outputs[0].token_ids, vec![3]);
    assert_eq!(outputs[1].token_ids, vec![2]);
}

#[test]
fn test_prefix_determinism() {
    let dir = common::model_dir();
    common::write_random_model(dir.path(), 3);

    let params = SamplingParams {
        temperature: 0.8,
        top_p: 0.9,
        max_tokens: 8,
        ignore_eos: true,
        ..SamplingParams::default()
    };

    let run = |seed: u64| {
        let mut engine = engine(dir.path(), options(8, 4, seed));
        engine
            .generate(&["bcdefg".to_string()], &[params.clone()])
            .unwrap()
            .remove(0)
            .token_ids
    };

    assert_eq!(run(1234), run(1234));
}

#[test]
fn test_shared_prefix_matches_solo_run() {
    let dir = common::model_dir();
    common::write_random_model(dir.path(), 5);

    // Solo baseline for the second prompt.
    let solo = {
        let mut engine = engine(dir.path(), options(8, 4, 0));
        engine
            .generate(&["bcdafg".to_string()], &[greedy(4)])
            .unwrap()
            .remove(0)
            .token_ids
    };

    // Same prompt admitted after one sharing a 4-token prefix block; the
    // shared physical KV rows must not change its output.
    let shared = {
        let mut engine = engine(dir.path(), options(8, 4, 0));
        engine
            .generate(
                &["bcdahh".to_string(), "bcdafg".to_string()],
                &[greedy(4), greedy(4)],
            )
            .unwrap()
            .remove(1)
            .token_ids
    };

    assert_eq!(solo, shared);
}

#[test]
fn test_fully_cached_prompt_still_generates() {
    let dir = common::model_dir();
    common::write_random_model(dir.path(), 13);

    // Two identical four-token prompts with block size four: the second
    // admission finds its whole prompt in the prefix cache and must still
    // recompute the last position to sample from.
    let mut engine = engine(dir.path(), options(8, 4, 0));
    let outputs = engine
        .generate(
            &["bcda".to_string(), "bcda".to_string()],
            &[greedy(3), greedy(3)],
        )
        .unwrap();

    assert_eq!(outputs[0].token_ids, outputs[1].token_ids);
}

#[test]
fn test_preemption_matches_solo_run() {
    let dir = common::model_dir();
    common::write_random_model(dir.path(), 9);

    let params = SamplingParams {
        ignore_eos: true,
        ..greedy(3)
    };

    let solo = |prompt: &str| {
        let mut engine = engine(dir.path(), options(8, 4, 0));
        engine
            .generate(&[prompt.to_string()], &[params.clone()])
            .unwrap()
            .remove(0)
            .token_ids
    };
    let solo_first = solo("bcda");
    let solo_second = solo("efgh");

    // Two blocks only: decoding the older sequence forces the younger one
    // to be preempted and later replayed.
    let mut engine = engine(dir.path(), options(2, 4, 0));
    let outputs = engine
        .generate(
            &["bcda".to_string(), "efgh".to_string()],
            &[params.clone(), params.clone()],
        )
        .unwrap();

    assert_eq!(outputs[0].token_ids, solo_first);
    assert_eq!(outputs[1].token_ids, solo_second);
}

#[test]
fn test_oversized_prompt_rejected() {
    let dir = common::model_dir();
    common::write_identity_model(dir.path(), None);
    let mut engine = engine(dir.path(), options(8, 4, 0));

    let long_prompt = "a".repeat(64);
    let err = engine.add_request(&long_prompt, greedy(1)).unwrap_err();
    assert!(matches!(err, EngineError::Resource(_)));

    let err = engine.add_request("", greedy(1)).unwrap_err();
    assert!(matches!(err, EngineError::Resource(_)));

    // The engine stays usable after rejected requests.
    let outputs = engine
        .generate(&["bcd".to_string()], &[greedy(1)])
        .unwrap();
    assert_eq!(outputs[0].token_ids, vec![3]);
}

#[test]
fn test_request_larger_than_pool_rejected() {
    let dir = common::model_dir();
    common::write_identity_model(dir.path(), None);
    // One block of four tokens: a request that could grow to five must be
    // rejected up front instead of deadlocking the scheduler.
    let mut engine = engine(dir.path(), options(1, 4, 0));

    let err = engine.add_request("bcd", greedy(4)).unwrap_err();
    assert!(matches!(err, EngineError::Resource(_)));

    assert!(engine.add_request("bc", greedy(2)).is_ok());
}

#[test]
fn test_streaming_matches_batch() {
    let dir = common::model_dir();
    common::write_random_model(dir.path(), 21);

    let params = SamplingParams {
        ignore_eos: true,
        ..greedy(5)
    };

    let batch = {
        let mut engine = engine(dir.path(), options(8, 4, 0));
        engine
            .generate(&["bcde".to_string()], &[params.clone()])
            .unwrap()
            .remove(0)
    };

    let mut engine = engine(dir.path(), options(8, 4, 0));
    engine.add_request("bcde", params).unwrap();
    let mut streamed = Vec::new();
    let mut finals = Vec::new();
    while !engine.is_finished() {
        let (steps, done) = engine.step_streaming().unwrap();
        streamed.extend(steps.into_iter().map(|s| s.token_id));
        finals.extend(done);
    }

    assert_eq!(streamed, batch.token_ids);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].token_ids, batch.token_ids);
    assert_eq!(finals[0].text, batch.text);
}
