//! Checkpoint container.
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "LOFICKPT"
//! 0x08     4       u32 LE      H: header length in bytes
//! 0x0C     H       JSON        CheckpointHeader
//! 0x0C+H   N*4     [f32] LE    Tensor data, addressed by element offset
//! ```
//!
//! Tensor names are the trainer's parameter paths
//! (`encoder.layers.0.conv.weight`, `param_predictor.network.3.bias`, ...)
//! so exported weights can be repacked without renaming.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use super::ModelArchitecture;
use crate::{LofiError, Result};

/// Magic bytes identifying a checkpoint file.
pub const MAGIC: [u8; 8] = *b"LOFICKPT";
const FORMAT_VERSION: u32 = 1;
const PREAMBLE_SIZE: usize = 12;

/// Bookkeeping tensors the trainer writes that inference never reads.
const IGNORED_SUFFIXES: [&str; 1] = ["num_batches_tracked"];

#[derive(Debug, Clone, PartialEq)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Named tensors keyed by parameter path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorStore {
    tensors: BTreeMap<String, StoredTensor>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, shape: Vec<usize>, data: Vec<f32>) {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        self.tensors.insert(name, StoredTensor { shape, data });
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Removes `name` and returns its data, failing if it is absent or its
    /// shape differs from `expected`.
    pub fn take(&mut self, name: &str, expected: &[usize]) -> Result<Vec<f32>> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| LofiError::mismatch(name, "tensor missing from checkpoint"))?;
        if tensor.shape != expected {
            return Err(LofiError::mismatch(
                name,
                format!("expected shape {expected:?}, checkpoint has {:?}", tensor.shape),
            ));
        }
        Ok(tensor.data)
    }

    /// Fails if anything other than ignorable bookkeeping is left over,
    /// which means the checkpoint was built for a different architecture.
    pub fn finish(self) -> Result<()> {
        let leftover: Vec<String> = self
            .tensors
            .into_keys()
            .filter(|name| !IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
            .collect();
        match leftover.first() {
            None => Ok(()),
            Some(first) => Err(LofiError::mismatch(
                first.clone(),
                format!("{} unexpected tensor(s) in checkpoint", leftover.len()),
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointHeader {
    format_version: u32,
    #[serde(default)]
    architecture: Option<ModelArchitecture>,
    #[serde(default)]
    epoch: Option<u32>,
    #[serde(default)]
    val_loss: Option<f32>,
    #[serde(default)]
    optimizer: Option<serde_json::Value>,
    tensors: Vec<TensorEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorEntry {
    name: String,
    shape: Vec<usize>,
    /// Offset into the data section, in elements.
    offset: usize,
}

/// Weights plus the training metadata saved alongside them.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub architecture: Option<ModelArchitecture>,
    pub epoch: Option<u32>,
    pub val_loss: Option<f32>,
    /// Opaque optimizer state, carried through untouched.
    pub optimizer: Option<serde_json::Value>,
    pub tensors: TensorStore,
}

impl CheckpointRecord {
    pub fn new(architecture: Option<ModelArchitecture>, tensors: TensorStore) -> Self {
        Self {
            architecture,
            epoch: None,
            val_loss: None,
            optimizer: None,
            tensors,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        tracing::debug!(path = %path.display(), tensors = self.tensors.len(), "checkpoint saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let record = Self::from_bytes(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            tensors = record.tensors.len(),
            epoch = ?record.epoch,
            "checkpoint loaded"
        );
        Ok(record)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::with_capacity(self.tensors.len());
        let mut data: Vec<u8> = Vec::new();
        let mut offset = 0;
        for (name, tensor) in &self.tensors.tensors {
            entries.push(TensorEntry {
                name: name.clone(),
                shape: tensor.shape.clone(),
                offset,
            });
            offset += tensor.data.len();
            data.extend(tensor.data.iter().flat_map(|v| v.to_le_bytes()));
        }

        let header = CheckpointHeader {
            format_version: FORMAT_VERSION,
            architecture: self.architecture.clone(),
            epoch: self.epoch,
            val_loss: self.val_loss,
            optimizer: self.optimizer.clone(),
            tensors: entries,
        };
        let header = serde_json::to_vec(&header)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| LofiError::msg("checkpoint header exceeds 4 GiB"))?;

        let mut bytes = Vec::with_capacity(PREAMBLE_SIZE + header.len() + data.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&data);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE_SIZE {
            return Err(LofiError::input("checkpoint", "file too small for preamble"));
        }
        if bytes[0..8] != MAGIC {
            return Err(LofiError::input("checkpoint", "invalid magic bytes"));
        }
        let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let data_start = PREAMBLE_SIZE
            .checked_add(header_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| LofiError::input("checkpoint", "header runs past end of file"))?;

        let header: CheckpointHeader = serde_json::from_slice(&bytes[PREAMBLE_SIZE..data_start])?;
        if header.format_version != FORMAT_VERSION {
            return Err(LofiError::input(
                "checkpoint",
                format!("unsupported format version {}", header.format_version),
            ));
        }

        let raw = &bytes[data_start..];
        if raw.len() % 4 != 0 {
            return Err(LofiError::input("checkpoint", "data section is not f32 aligned"));
        }
        let values: Vec<f32> = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut tensors = TensorStore::new();
        for entry in header.tensors {
            let len: usize = entry.shape.iter().product();
            let end = entry
                .offset
                .checked_add(len)
                .filter(|&end| end <= values.len())
                .ok_or_else(|| {
                    LofiError::input("checkpoint", format!("tensor {} runs past data section", entry.name))
                })?;
            if tensors.contains(&entry.name) {
                return Err(LofiError::input(
                    "checkpoint",
                    format!("tensor {} listed twice", entry.name),
                ));
            }
            tensors.insert(entry.name, entry.shape, values[entry.offset..end].to_vec());
        }

        Ok(Self {
            architecture: header.architecture,
            epoch: header.epoch,
            val_loss: header.val_loss,
            optimizer: header.optimizer,
            tensors,
        })
    }
}
