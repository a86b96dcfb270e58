//! Source tensors and the identity tokens used to detect shared storage.
//!
//! A [`SourceId`] is issued once, when bytes are first read into the system.
//! Every clone of a [`SourceTensor`] shares that token, so tied embeddings or
//! repeated blocks built from the same tensor resolve to one identity, while
//! two independently loaded tensors with equal contents never do.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{BlockWeights, DType, Result, StowageError};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token naming one block of source storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Issue a fresh, process-unique token.
    pub fn fresh() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw token value (for logging and reports only).
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

/// Key identifying a block of source data independent of parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorIdentity {
    pub source: SourceId,
    pub byte_length: usize,
    pub dtype: DType,
}

impl fmt::Display for TensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} bytes, {}]", self.source, self.byte_length, self.dtype)
    }
}

/// Source weight data as read from a checkpoint, before placement.
///
/// Cloning is cheap and preserves identity: the bytes are shared through an
/// `Arc` and the [`SourceId`] is copied, not reissued.
#[derive(Clone)]
pub struct SourceTensor {
    id: SourceId,
    dtype: DType,
    shape: Vec<usize>,
    data: Arc<[u8]>,
}

impl fmt::Debug for SourceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTensor")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl SourceTensor {
    /// Wrap raw bytes, issuing a new identity token.
    ///
    /// Fails if `bytes.len()` does not match `shape` and `dtype`.
    pub fn from_bytes(dtype: DType, shape: &[usize], bytes: Vec<u8>) -> Result<Self> {
        let expected = shape_bytes(dtype, shape)?;
        if bytes.len() != expected {
            return Err(StowageError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            id: SourceId::fresh(),
            dtype,
            shape: shape.to_vec(),
            data: Arc::from(bytes),
        })
    }

    /// Wrap f32 values (native byte order), issuing a new identity token.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Result<Self> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(DType::F32, shape, bytes)
    }

    /// Zero-filled source data with a new identity token.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Self> {
        let nbytes = shape_bytes(dtype, shape)?;
        Ok(Self {
            id: SourceId::fresh(),
            dtype,
            shape: shape.to_vec(),
            data: Arc::from(vec![0u8; nbytes]),
        })
    }

    /// Identity key of this tensor.
    pub fn identity(&self) -> TensorIdentity {
        TensorIdentity {
            source: self.id,
            byte_length: self.data.len(),
            dtype: self.dtype,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Byte length of a `dtype` tensor of `shape`.
fn shape_bytes(dtype: DType, shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .and_then(|numel| dtype.storage_bytes(numel))
        .ok_or_else(|| StowageError::Config(format!("{dtype} tensor of shape {shape:?} overflows usize")))
}

/// Named parameter table for one model, built as checkpoint data is read.
///
/// Identity tokens are assigned here, at table construction. Tied parameters
/// are registered with [`SourceRegistry::tie`] so they share the token of
/// the tensor they alias.
#[derive(Debug, Default, Clone)]
pub struct SourceRegistry {
    params: BTreeMap<String, SourceTensor>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register freshly read bytes under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        dtype: DType,
        shape: &[usize],
        bytes: Vec<u8>,
    ) -> Result<SourceTensor> {
        let tensor = SourceTensor::from_bytes(dtype, shape, bytes)?;
        self.insert(name, tensor.clone())?;
        Ok(tensor)
    }

    /// Insert an existing tensor under `name`. Inserting a clone of an
    /// already-registered tensor records a shared reference.
    pub fn insert(&mut self, name: impl Into<String>, tensor: SourceTensor) -> Result<()> {
        let name = name.into();
        if self.params.contains_key(&name) {
            return Err(StowageError::DuplicateParameter(name));
        }
        self.params.insert(name, tensor);
        Ok(())
    }

    /// Register `alias` as sharing the storage of `target`.
    pub fn tie(&mut self, alias: impl Into<String>, target: &str) -> Result<()> {
        let tensor = self
            .params
            .get(target)
            .cloned()
            .ok_or_else(|| StowageError::Config(format!("cannot tie to unknown parameter '{target}'")))?;
        self.insert(alias, tensor)
    }

    pub fn get(&self, name: &str) -> Option<&SourceTensor> {
        self.params.get(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Number of distinct source identities in the table.
    pub fn unique_sources(&self) -> usize {
        let mut ids: Vec<SourceId> = self.params.values().map(|t| t.source_id()).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// Collect the parameters under `prefix.` into a block, with names
    /// relative to the prefix (e.g. `layers.3.attn.q` → `attn.q`).
    pub fn block(&self, prefix: &str) -> Result<BlockWeights> {
        let dotted = format!("{prefix}.");
        let mut block = BlockWeights::new();
        for (name, tensor) in self.params.range(dotted.clone()..) {
            let Some(rest) = name.strip_prefix(&dotted) else {
                break;
            };
            block.push(rest, tensor.clone())?;
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflowing_shape_rejected() {
        let huge = [usize::MAX / 2, 3];
        assert!(matches!(SourceTensor::zeros(DType::U8, &huge), Err(StowageError::Config(_))));
        assert!(matches!(
            SourceTensor::from_bytes(DType::F64, &[usize::MAX / 4], Vec::new()),
            Err(StowageError::Config(_))
        ));
    }

    #[test]
    fn test_clone_preserves_identity() {
        let a = SourceTensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        let b = a.clone();
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_equal_contents_distinct_identity() {
        let a = SourceTensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        let b = SourceTensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_size_checked() {
        let err = SourceTensor::from_bytes(DType::F32, &[3], vec![0u8; 8]).unwrap_err();
        assert!(matches!(err, StowageError::SizeMismatch { expected: 12, actual: 8 }));
    }

    #[test]
    fn test_registry_tie_and_block() {
        let mut reg = SourceRegistry::new();
        reg.register("embed.weight", DType::F32, &[4], vec![0u8; 16]).unwrap();
        reg.tie("lm_head.weight", "embed.weight").unwrap();
        reg.register("layers.0.w", DType::F16, &[2], vec![0u8; 4]).unwrap();
        reg.register("layers.0.b", DType::F16, &[2], vec![0u8; 4]).unwrap();
        reg.register("layers.1.w", DType::F16, &[2], vec![0u8; 4]).unwrap();

        assert_eq!(reg.len(), 5);
        assert_eq!(reg.unique_sources(), 4);
        assert_eq!(
            reg.get("embed.weight").unwrap().identity(),
            reg.get("lm_head.weight").unwrap().identity()
        );

        let block = reg.block("layers.0").unwrap();
        assert_eq!(block.names(), vec!["b", "w"]);
        assert!(reg.tie("x", "missing").is_err());
        assert!(reg.insert("layers.0.w", SourceTensor::zeros(DType::U8, &[1]).unwrap()).is_err());
    }
}
