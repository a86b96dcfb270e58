//! # stowage-core
//!
//! Core types shared by the stowage weight loading cache.
//!
//! Provides:
//! - [`DType`] element types for parameter tensors
//! - [`DeviceTier`] storage destinations (disk, host, accelerator)
//! - [`TensorIdentity`] tokens that detect shared source storage
//! - [`BlockWeights`] ordered per-block parameter tables
//! - [`StowageError`] and the crate-wide [`Result`] alias

pub mod dtype;
pub mod device;
pub mod identity;
pub mod block;
pub mod error;

pub use dtype::DType;
pub use device::DeviceTier;
pub use identity::{SourceId, SourceRegistry, SourceTensor, TensorIdentity};
pub use block::BlockWeights;
pub use error::StowageError;

pub type Result<T> = std::result::Result<T, StowageError>;
