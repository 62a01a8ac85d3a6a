//! `ir-tensor` - Multi-precision tensor compute engine for inference-runtime.
//!
//! This crate provides:
//! - A `Tensor` type over owned, shared or memory-mapped storage in five
//!   encodings (F32, F16, BF16 and the block-quantized Q8 and Q4)
//! - Bit-exact conversions between encodings
//! - A `ComputeBackend` trait with reference, portable-SIMD and native
//!   kernel-library implementations, selected once from a capability probe
//! - A bounded execution pool and a reusable tensor cache

pub mod backend;
pub mod cache;
pub mod capability;
pub mod codec;
pub mod config;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod native;
pub mod pool;
pub mod select;
pub mod shape;
pub mod simd;
pub mod storage;
pub mod tensor;
pub mod view;

// Re-export primary types at the crate root for convenience.
pub use backend::{
    batch_dot_product_with_fallback, dot_product_with_fallback, BackendDescriptor, BatchWindow,
    ComputeBackend, RowSpan,
};
pub use cache::{CachedTensor, TensorCache};
pub use capability::MachineSpec;
pub use config::{BackendPreference, EngineConfig};
pub use cpu::CpuBackend;
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use native::NativeBackend;
pub use pool::ExecutionPool;
pub use select::{global_backend, select_backend, Backend};
pub use shape::Shape;
pub use simd::SimdBackend;
pub use storage::CpuStorage;
pub use tensor::Tensor;
pub use view::{TensorView, TensorViewMut, Transposed};
