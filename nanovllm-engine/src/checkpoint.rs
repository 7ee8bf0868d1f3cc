use std::fs::File;
use std::path::{Path, PathBuf};

use log::info;
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::error::{EngineError, Result};

/// A tensor decoded to f32, together with its declared shape.
#[derive(Debug, Clone)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Reader over the safetensors shards of a model directory.
///
/// Shards are discovered in lexicographic order; tensor lookup scans them
/// in that order and returns the first match.
#[derive(Debug)]
pub struct Checkpoint {
    shards: Vec<Shard>,
}

#[derive(Debug)]
struct Shard {
    path: PathBuf,
    mmap: Mmap,
}

impl Checkpoint {
    pub fn open(model_dir: &Path) -> Result<Self> {
        let mut paths = std::fs::read_dir(model_dir)
            .map_err(|e| EngineError::Load(format!("failed to read {}: {e}", model_dir.display())))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();

        if paths.is_empty() {
            return Err(EngineError::Load(format!(
                "no .safetensors files found in {}",
                model_dir.display()
            )));
        }
        paths.sort();

        let shards = paths
            .into_iter()
            .map(|path| {
                let file = File::open(&path)
                    .map_err(|e| EngineError::Load(format!("failed to open {}: {e}", path.display())))?;
                // SAFETY: the mapping is only read while the checkpoint is
                // alive; the file is not expected to change underneath us.
                let mmap = unsafe { Mmap::map(&file) }
                    .map_err(|e| EngineError::Load(format!("failed to mmap {}: {e}", path.display())))?;
                Ok(Shard { path, mmap })
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Found {} safetensors shard(s)", shards.len());

        Ok(Self { shards })
    }

    /// Looks up a tensor by name across shards, decoding it to f32.
    /// Returns `None` when no shard declares the tensor.
    pub fn tensor(&self, name: &str) -> Result<Option<TensorData>> {
        for shard in &self.shards {
            let tensors = SafeTensors::deserialize(&shard.mmap).map_err(|e| {
                EngineError::Load(format!("malformed shard {}: {e}", shard.path.display()))
            })?;

            if let Ok(view) = tensors.tensor(name) {
                return decode_tensor(&view, name).map(Some);
            }
        }
        Ok(None)
    }

    /// Looks up a required tensor; a miss is fatal.
    pub fn load(&self, name: &str) -> Result<TensorData> {
        self.tensor(name)?
            .ok_or_else(|| EngineError::Load(format!("missing required tensor '{name}'")))
    }
}

fn decode_tensor(view: &TensorView<'_>, name: &str) -> Result<TensorData> {
    let shape = view.shape().to_vec();
    let raw = view.data();
    let expected = shape.iter().product::<usize>();

    let data = match view.dtype() {
        Dtype::F32 => {
            validate_payload(raw.len(), expected * 4, name, "F32")?;
            decode_f32(raw)
        }
        Dtype::F16 => {
            validate_payload(raw.len(), expected * 2, name, "F16")?;
            decode_f16(raw)
        }
        Dtype::BF16 => {
            validate_payload(raw.len(), expected * 2, name, "BF16")?;
            decode_bf16(raw)
        }
        other => {
            return Err(EngineError::Load(format!(
                "unsupported dtype {other:?} for tensor '{name}'"
            )));
        }
    };

    Ok(TensorData { shape, data })
}

fn validate_payload(actual: usize, expected: usize, name: &str, dtype: &str) -> Result<()> {
    if actual != expected {
        return Err(EngineError::Load(format!(
            "{dtype} tensor '{name}' payload size mismatch: expected {expected} bytes, got {actual}"
        )));
    }
    Ok(())
}

fn decode_f32(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn decode_f16(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(2)
        .map(|chunk| half::f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
        .collect()
}

fn decode_bf16(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(2)
        .map(|chunk| {
            // BF16 is the upper 16 bits of an f32
            let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
            f32::from_bits((bits as u32) << 16)
        })
        .collect()
}
