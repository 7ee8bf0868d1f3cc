use thiserror::Error;

/// Error type for engine operations.
///
/// Load-time errors (`Config`, `Tokenizer`, `Load`) abort engine construction.
/// Run-time errors surface the offending sequence via [`EngineError::Sequence`]
/// and leave the engine usable for the remaining sequences.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed `config.json`, unsupported activation,
    /// incoherent head/hidden dimensions.
    #[error("config error: {0}")]
    Config(String),

    /// Missing or unsupported `tokenizer.json` (only BPE + ByteLevel is supported).
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed safetensors data, out-of-range offsets, unsupported dtype,
    /// missing required tensor, or shape mismatch against the configuration.
    #[error("checkpoint load error: {0}")]
    Load(String),

    /// Internal kernel contract violation. Programmer bug, fatal.
    #[error("shape mismatch in {op}: expected {expected}, got {actual}")]
    Shape {
        op: &'static str,
        expected: String,
        actual: String,
    },

    /// A request that can never be admitted: the prompt alone exceeds
    /// `max_model_len` or the KV cache pool.
    #[error("cannot admit request: {0}")]
    Resource(String),

    /// Every logit was masked out during sampling.
    #[error("sampling produced an empty distribution")]
    Sampling,

    /// A run-time error attributed to a single sequence.
    #[error("sequence {seq_id}: {source}")]
    Sequence {
        seq_id: u64,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Attaches a sequence id to a run-time error.
    pub fn for_sequence(seq_id: u64, source: EngineError) -> Self {
        EngineError::Sequence {
            seq_id,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
