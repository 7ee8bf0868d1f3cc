//! # nanovllm-engine
//!
//! A minimal, CPU-only inference engine for Qwen-family decoder models
//! with vLLM-style continuous batching: prefix-cached KV blocks, a
//! prefill/decode scheduler with preemption, and per-request sampling.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use nanovllm_engine::{EngineOptions, LlmEngine, SamplingParams};
//!
//! # fn main() -> Result<(), nanovllm_engine::EngineError> {
//! let options = EngineOptions::builder().seed(Some(42)).build()?;
//! let mut engine = LlmEngine::new(Path::new("path/to/model"), options)?;
//!
//! let params = SamplingParams {
//!     temperature: 0.7,
//!     max_tokens: 64,
//!     ..SamplingParams::default()
//! };
//! let outputs = engine.generate(&["Hello, how are you?".to_string()], &[params])?;
//! println!("{}", outputs[0].text);
//! # Ok(())
//! # }
//! ```

pub mod block_manager;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod model;
pub mod runner;
pub mod sampler;
pub mod scheduler;
pub mod sequence;
pub mod tensor;
pub mod tokenizer;

pub use config::{EngineOptions, EngineOptionsBuilder, ModelConfig};
pub use engine::{GenerationOutput, LlmEngine, StepOutput};
pub use error::EngineError;
pub use sampler::SamplingParams;
pub use sequence::{SeqId, SequenceStatus};
pub use tokenizer::Tokenizer;
