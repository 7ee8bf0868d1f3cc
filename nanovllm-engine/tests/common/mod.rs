//! Shared fixtures: synthetic model directories with a config, a
//! byte-level tokenizer, and safetensors weights.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use serde_json::json;
use tempfile::TempDir;

/// Tiny test geometry: 8-token vocab, one decoder layer, two heads.
pub const VOCAB: usize = 8;
pub const HIDDEN: usize = 8;
pub const HEADS: usize = 2;
pub const EOS: u32 = 7;

/// Writes `config.json` for the tiny geometry.
pub fn write_config(dir: &Path, num_layers: usize, num_kv_heads: usize, intermediate: usize) {
    let config = json!({
        "vocab_size": VOCAB,
        "hidden_size": HIDDEN,
        "num_hidden_layers": num_layers,
        "num_attention_heads": HEADS,
        "num_key_value_heads": num_kv_heads,
        "intermediate_size": intermediate,
        "hidden_act": "silu",
        "max_position_embeddings": 32,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "eos_token_id": EOS,
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
}

/// Writes a tokenizer whose vocabulary is the single characters 'a'..'h'
/// with ids 0..8, so the prompt "bcd" encodes to `[1, 2, 3]`.
pub fn write_tokenizer(dir: &Path) {
    let mut vocab = serde_json::Map::new();
    for (id, ch) in ('a'..='h').enumerate() {
        vocab.insert(ch.to_string(), json!(id));
    }
    let tokenizer = json!({
        "model": {"type": "BPE", "vocab": vocab, "merges": []},
        "pre_tokenizer": {"type": "ByteLevel", "add_prefix_space": false},
    });
    std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();
}

/// Writes an F32 safetensors file with the tensors laid out in order.
pub fn write_safetensors(path: &Path, tensors: &[(String, Vec<usize>, Vec<f32>)]) {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    for (name, shape, data) in tensors {
        let len = data.len() * 4;
        entries.push(format!(
            r#""{name}":{{"dtype":"F32","shape":{shape:?},"data_offsets":[{offset},{end}]}}"#,
            end = offset + len
        ));
        offset += len;
    }
    let header = format!("{{{}}}", entries.join(","));

    let mut file = File::create(path).unwrap();
    file.write_u64::<LittleEndian>(header.len() as u64).unwrap();
    file.write_all(header.as_bytes()).unwrap();
    for (_, _, data) in tensors {
        for &value in data {
            file.write_f32::<LittleEndian>(value).unwrap();
        }
    }
}

pub fn identity(n: usize) -> Vec<f32> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

fn layer_tensors(layer: usize, weights: Vec<(&str, Vec<usize>, Vec<f32>)>) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    weights
        .into_iter()
        .map(|(name, shape, data)| (format!("model.layers.{layer}.{name}"), shape, data))
        .collect()
}

/// A one-layer model whose projections are identities, norms are ones and
/// MLP is zero. With the identity embedding and tied LM head the argmax
/// logit of the last position is the last input token itself.
///
/// `lm_head` overrides the tied head when given.
pub fn write_identity_model(dir: &Path, lm_head: Option<Vec<f32>>) {
    write_config(dir, 1, HEADS, HIDDEN);
    write_tokenizer(dir);

    let mut tensors = vec![(
        "model.embed_tokens.weight".to_string(),
        vec![VOCAB, HIDDEN],
        identity(HIDDEN),
    )];
    tensors.extend(layer_tensors(
        0,
        vec![
            ("self_attn.q_proj.weight", vec![HIDDEN, HIDDEN], identity(HIDDEN)),
            ("self_attn.k_proj.weight", vec![HIDDEN, HIDDEN], identity(HIDDEN)),
            ("self_attn.v_proj.weight", vec![HIDDEN, HIDDEN], identity(HIDDEN)),
            ("self_attn.o_proj.weight", vec![HIDDEN, HIDDEN], identity(HIDDEN)),
            ("mlp.gate_proj.weight", vec![HIDDEN, HIDDEN], vec![0.0; HIDDEN * HIDDEN]),
            ("mlp.up_proj.weight", vec![HIDDEN, HIDDEN], vec![0.0; HIDDEN * HIDDEN]),
            ("mlp.down_proj.weight", vec![HIDDEN, HIDDEN], vec![0.0; HIDDEN * HIDDEN]),
            ("input_layernorm.weight", vec![HIDDEN], vec![1.0; HIDDEN]),
            ("post_attention_layernorm.weight", vec![HIDDEN], vec![1.0; HIDDEN]),
        ],
    ));
    tensors.push(("model.norm.weight".to_string(), vec![HIDDEN], vec![1.0; HIDDEN]));
    if let Some(head) = lm_head {
        tensors.push(("lm_head.weight".to_string(), vec![VOCAB, HIDDEN], head));
    }

    write_safetensors(&dir.join("model.safetensors"), &tensors);
}

/// Deterministic pseudo-random values in [-0.1, 0.1).
fn fill(seed: &mut u64, count: usize) -> Vec<f32> {
    (0..count)
        .map(|_| {
            *seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((*seed >> 33) as f32 / (1u64 << 31) as f32 - 0.5) * 0.2
        })
        .collect()
}

/// A two-layer model with deterministic pseudo-random weights and grouped
/// KV heads (2 query heads over 1 kv head), for numerical behavior tests.
pub fn write_random_model(dir: &Path, seed: u64) {
    const LAYERS: usize = 2;
    const KV_HEADS: usize = 1;
    const INTERMEDIATE: usize = 12;
    let kv_dim = KV_HEADS * (HIDDEN / HEADS);

    write_config(dir, LAYERS, KV_HEADS, INTERMEDIATE);
    write_tokenizer(dir);

    let mut seed = seed;
    let mut tensors = vec![(
        "model.embed_tokens.weight".to_string(),
        vec![VOCAB, HIDDEN],
        fill(&mut seed, VOCAB * HIDDEN),
    )];
    for layer in 0..LAYERS {
        tensors.extend(layer_tensors(
            layer,
            vec![
                ("self_attn.q_proj.weight", vec![HIDDEN, HIDDEN], fill(&mut seed, HIDDEN * HIDDEN)),
                ("self_attn.k_proj.weight", vec![kv_dim, HIDDEN], fill(&mut seed, kv_dim * HIDDEN)),
                ("self_attn.v_proj.weight", vec![kv_dim, HIDDEN], fill(&mut seed, kv_dim * HIDDEN)),
                ("self_attn.o_proj.weight", vec![HIDDEN, HIDDEN], fill(&mut seed, HIDDEN * HIDDEN)),
                ("mlp.gate_proj.weight", vec![INTERMEDIATE, HIDDEN], fill(&mut seed, INTERMEDIATE * HIDDEN)),
                ("mlp.up_proj.weight", vec![INTERMEDIATE, HIDDEN], fill(&mut seed, INTERMEDIATE * HIDDEN)),
                ("mlp.down_proj.weight", vec![HIDDEN, INTERMEDIATE], fill(&mut seed, HIDDEN * INTERMEDIATE)),
                ("input_layernorm.weight", vec![HIDDEN], vec![1.0; HIDDEN]),
                ("post_attention_layernorm.weight", vec![HIDDEN], vec![1.0; HIDDEN]),
            ],
        ));
    }
    tensors.push(("model.norm.weight".to_string(), vec![HIDDEN], vec![1.0; HIDDEN]));
    tensors.push((
        "lm_head.weight".to_string(),
        vec![VOCAB, HIDDEN],
        fill(&mut seed, VOCAB * HIDDEN),
    ));

    write_safetensors(&dir.join("model.safetensors"), &tensors);
}

pub fn model_dir() -> TempDir {
    TempDir::new().unwrap()
}
