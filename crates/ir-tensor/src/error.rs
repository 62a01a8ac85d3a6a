use thiserror::Error;

use crate::dtype::DType;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("index {index} out of range for dimension {dim} of size {size}")]
    IndexOutOfRange { index: usize, dim: usize, size: usize },
    #[error("invalid axis {axis} for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },
    #[error("tensor is not contiguous: {0}")]
    NotContiguous(String),
    #[error("offset {offset} is not aligned to block size {block_size}")]
    BlockMisaligned { offset: usize, block_size: usize },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),
    #[error("{op}: unsupported combination {a} x {b}")]
    UnsupportedCombination { op: &'static str, a: DType, b: DType },
    #[error("write to read-only tensor: {0}")]
    ReadOnly(String),
    #[error("native kernel library: {0}")]
    NativeLibrary(String),
    #[error("execution pool already started")]
    PoolAlreadyStarted,
    #[error("failed to build execution pool: {0}")]
    PoolBuild(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TensorError {
    /// True for encoding-support gaps, which callers handle by retrying with
    /// a supported pairing rather than failing.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            TensorError::UnsupportedCombination { .. } | TensorError::UnsupportedDType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;
