//! Byte-level BPE tokenizer for Hugging-Face `tokenizer.json` artifacts.
//!
//! - Remaps raw bytes through the GPT-2 byte-to-unicode table.
//! - Splits text with the Qwen2 pre-tokenizer pattern.
//! - Applies BPE merges by ascending rank.
//! - Greedily matches added (special) tokens before BPE.
//! - Decodes through the inverse byte map, lossy only at invalid UTF-8.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use fancy_regex::Regex;
use log::warn;
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Qwen2-family piece splitting pattern. The `(?!\S)` lookahead leaves the
/// space before a word to be consumed together with that word.
const TOKEN_SPLIT_PATTERN: &str = r"(?:'[sS]|'[tT]|'[rR][eE]|'[vV][eE]|'[mM]|'[lL][lL]|'[dD])|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Byte-level BPE tokenizer.
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    id_to_token: Vec<String>,
    merge_ranks: HashMap<(String, String), u32>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    /// Added tokens sorted by content length, longest first.
    added_tokens: Vec<(String, u32)>,
    added_by_id: HashMap<u32, String>,
    split_re: Regex,
    add_prefix_space: bool,
    eos_id: Option<u32>,
}

impl Tokenizer {
    /// Loads `tokenizer.json` from a model directory. Only the BPE model
    /// with a ByteLevel pre-tokenizer is supported.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("tokenizer.json");
        let contents = fs::read_to_string(&path)
            .map_err(|e| EngineError::Tokenizer(format!("failed to read {}: {e}", path.display())))?;
        let data: Value = serde_json::from_str(&contents)
            .map_err(|e| EngineError::Tokenizer(format!("failed to parse {}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &Value) -> Result<Self> {
        let model_type = data
            .pointer("/model/type")
            .and_then(Value::as_str)
            .unwrap_or("BPE");
        if !model_type.eq_ignore_ascii_case("bpe") {
            return Err(EngineError::Tokenizer(format!(
                "unsupported tokenizer model type '{model_type}', only BPE is supported"
            )));
        }

        let mut vocab: HashMap<String, u32> = data
            .pointer("/model/vocab")
            .and_then(Value::as_object)
            .ok_or_else(|| EngineError::Tokenizer("no vocabulary in tokenizer.json".to_string()))?
            .iter()
            .filter_map(|(token, id)| id.as_u64().map(|id| (token.clone(), id as u32)))
            .collect();

        let merge_ranks = extract_merge_ranks(data);
        let add_prefix_space = extract_add_prefix_space(data)?;

        // Added (special) tokens take part in the vocabulary and are
        // matched greedily before BPE.
        let mut added_tokens: Vec<(String, u32)> = data
            .pointer("/added_tokens")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let content = entry.pointer("/content")?.as_str()?.to_string();
                        let id = entry.pointer("/id")?.as_u64()? as u32;
                        Some((content, id))
                    })
                    .collect()
            })
            .unwrap_or_default();
        for (content, id) in &added_tokens {
            vocab.entry(content.clone()).or_insert(*id);
        }
        added_tokens.sort_by_key(|(content, _)| std::cmp::Reverse(content.len()));
        let added_by_id: HashMap<u32, String> =
            added_tokens.iter().map(|(content, id)| (*id, content.clone())).collect();

        let eos_id = ["<|endoftext|>", "<|im_end|>"]
            .iter()
            .find_map(|name| vocab.get(*name).copied());

        let max_id = vocab.values().copied().max().unwrap_or(0) as usize;
        let mut id_to_token = vec![String::new(); max_id + 1];
        for (token, &id) in &vocab {
            id_to_token[id as usize] = token.clone();
        }

        let (byte_encoder, byte_decoder) = bytes_to_unicode();
        let split_re = Regex::new(TOKEN_SPLIT_PATTERN)
            .map_err(|e| EngineError::Tokenizer(format!("bad split pattern: {e}")))?;

        Ok(Self {
            vocab,
            id_to_token,
            merge_ranks,
            byte_encoder,
            byte_decoder,
            added_tokens,
            added_by_id,
            split_re,
            add_prefix_space,
            eos_id,
        })
    }

    /// The eos id declared by the artifact's added tokens, if any.
    /// `config.json` takes precedence when both exist.
    pub fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Encodes text into token ids.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let text = if self.add_prefix_space && !text.is_empty() && !text.starts_with(' ') {
            format!(" {text}")
        } else {
            text.to_string()
        };

        let mut token_ids = Vec::new();
        let mut plain_start = 0;
        let mut pos = 0;

        while pos < text.len() {
            let rest = &text[pos..];
            if let Some((content, id)) = self.match_added_token(rest) {
                if pos > plain_start {
                    self.encode_plain(&text[plain_start..pos], &mut token_ids)?;
                }
                token_ids.push(id);
                pos += content.len();
                plain_start = pos;
            } else {
                pos += rest.chars().next().map_or(1, char::len_utf8);
            }
        }
        if plain_start < text.len() {
            self.encode_plain(&text[plain_start..], &mut token_ids)?;
        }

        Ok(token_ids)
    }

    /// Decodes token ids back to text. Added tokens render literally;
    /// regular tokens pass through the inverse byte map.
    pub fn decode(&self, token_ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in token_ids {
            if let Some(content) = self.added_by_id.get(&id) {
                bytes.extend_from_slice(content.as_bytes());
                continue;
            }
            let Some(token) = self.id_to_token.get(id as usize) else {
                continue;
            };
            for ch in token.chars() {
                match self.byte_decoder.get(&ch) {
                    Some(&byte) => bytes.push(byte),
                    // Not a byte-level char; keep it verbatim.
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn match_added_token(&self, rest: &str) -> Option<(&str, u32)> {
        self.added_tokens
            .iter()
            .find(|(content, _)| rest.starts_with(content.as_str()))
            .map(|(content, id)| (content.as_str(), *id))
    }

    fn encode_plain(&self, text: &str, token_ids: &mut Vec<u32>) -> Result<()> {
        for piece in self.split_re.find_iter(text) {
            let piece = piece.map_err(|e| EngineError::Tokenizer(format!("pre-tokenizer failed: {e}")))?;
            self.bpe_encode(piece.as_str(), token_ids);
        }
        Ok(())
    }

    /// Applies BPE merges by ascending rank over the byte-mapped piece.
    fn bpe_encode(&self, piece: &str, token_ids: &mut Vec<u32>) {
        let mut parts: Vec<String> = piece
            .as_bytes()
            .iter()
            .map(|&b| self.byte_encoder[b as usize].to_string())
            .collect();

        loop {
            let mut best_rank = u32::MAX;
            let mut best_idx = None;
            for i in 0..parts.len().saturating_sub(1) {
                let pair = (parts[i].clone(), parts[i + 1].clone());
                if let Some(&rank) = self.merge_ranks.get(&pair) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_idx = Some(i);
                    }
                }
            }

            let Some(i) = best_idx else { break };
            let merged = format!("{}{}", parts[i], parts[i + 1]);
            parts.splice(i..i + 2, std::iter::once(merged));
        }

        for part in parts {
            match self.vocab.get(&part) {
                Some(&id) => token_ids.push(id),
                None => warn!("token piece '{part}' not in vocabulary, skipping"),
            }
        }
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("num_merges", &self.merge_ranks.len())
            .field("num_added_tokens", &self.added_tokens.len())
            .field("add_prefix_space", &self.add_prefix_space)
            .field("eos_id", &self.eos_id)
            .finish()
    }
}

/// Merges ship either as "left right" strings or as two-element arrays.
fn extract_merge_ranks(data: &Value) -> HashMap<(String, String), u32> {
    data.pointer("/model/merges")
        .and_then(Value::as_array)
        .map(|merges| {
            merges
                .iter()
                .enumerate()
                .filter_map(|(rank, merge)| {
                    let (left, right) = match merge {
                        Value::String(s) => {
                            let (left, right) = s.split_once(' ')?;
                            (left.to_string(), right.to_string())
                        }
                        Value::Array(pair) if pair.len() == 2 => {
                            (pair[0].as_str()?.to_string(), pair[1].as_str()?.to_string())
                        }
                        _ => return None,
                    };
                    Some(((left, right), rank as u32))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Accepts a bare ByteLevel pre-tokenizer or a Sequence containing one.
/// Anything else is unsupported.
fn extract_add_prefix_space(data: &Value) -> Result<bool> {
    let Some(pre) = data.pointer("/pre_tokenizer") else {
        return Ok(false);
    };
    if pre.is_null() {
        return Ok(false);
    }

    let find_byte_level = |node: &Value| -> Option<bool> {
        (node.pointer("/type")?.as_str()? == "ByteLevel")
            .then(|| node.pointer("/add_prefix_space").and_then(Value::as_bool).unwrap_or(false))
    };

    if let Some(flag) = find_byte_level(pre) {
        return Ok(flag);
    }
    if pre.pointer("/type").and_then(Value::as_str) == Some("Sequence") {
        if let Some(children) = pre.pointer("/pretokenizers").and_then(Value::as_array) {
            if let Some(flag) = children.iter().find_map(find_byte_level) {
                return Ok(flag);
            }
        }
    }

    Err(EngineError::Tokenizer(
        "unsupported pre_tokenizer, only ByteLevel is supported".to_string(),
    ))
}

/// GPT-2 byte-to-unicode table: printable latin bytes map to themselves,
/// everything else to code points starting at U+0100.
fn bytes_to_unicode() -> ([char; 256], HashMap<char, u8>) {
    let mut encoder = ['\0'; 256];
    let mut taken = [false; 256];

    let printable = (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF);
    for b in printable {
        encoder[b as usize] = b as char;
        taken[b as usize] = true;
    }

    let mut offset = 0u32;
    for b in 0..256usize {
        if !taken[b] {
            encoder[b] = char::from_u32(256 + offset).expect("valid code point");
            offset += 1;
        }
    }

    let decoder = encoder
        .iter()
        .enumerate()
        .map(|(b, &ch)| (ch, b as u8))
        .collect();
    (encoder, decoder)
}
