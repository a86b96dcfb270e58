use crate::{Result, SourceTensor, StowageError};

/// Ordered source parameters of one structural block (e.g. one transformer
/// layer).
///
/// Order matters: placement brackets are computed over the cumulative sizes
/// in this order, so the same block must always be presented the same way.
#[derive(Debug, Clone, Default)]
pub struct BlockWeights {
    params: Vec<(String, SourceTensor)>,
}

impl BlockWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a block from `(name, tensor)` pairs, rejecting duplicate names.
    pub fn from_params<I, S>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, SourceTensor)>,
        S: Into<String>,
    {
        let mut block = Self::new();
        for (name, tensor) in params {
            block.push(name, tensor)?;
        }
        Ok(block)
    }

    /// Append a parameter.
    pub fn push(&mut self, name: impl Into<String>, tensor: SourceTensor) -> Result<()> {
        let name = name.into();
        if self.params.iter().any(|(n, _)| *n == name) {
            return Err(StowageError::DuplicateParameter(name));
        }
        self.params.push((name, tensor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SourceTensor> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceTensor)> {
        self.params.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Parameter names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.params.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// `(name, byte size)` pairs in block order, as consumed by placement.
    pub fn param_sizes(&self) -> Vec<(String, usize)> {
        self.params
            .iter()
            .map(|(n, t)| (n.clone(), t.byte_len()))
            .collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.params.iter().map(|(_, t)| t.byte_len()).sum()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn test_order_and_sizes() {
        let w = SourceTensor::zeros(DType::F32, &[4, 4]).unwrap();
        let b = SourceTensor::zeros(DType::F32, &[4]).unwrap();
        let block = BlockWeights::from_params([("weight", w), ("bias", b)]).unwrap();

        assert_eq!(block.len(), 2);
        assert_eq!(block.total_bytes(), 80);
        assert_eq!(
            block.param_sizes(),
            vec![("weight".to_string(), 64), ("bias".to_string(), 16)]
        );
        assert_eq!(block.names(), vec!["bias", "weight"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let t = SourceTensor::zeros(DType::U8, &[1]).unwrap();
        let err = BlockWeights::from_params([("a", t.clone()), ("a", t)]).unwrap_err();
        assert!(matches!(err, StowageError::DuplicateParameter(ref n) if n == "a"));
    }
}
