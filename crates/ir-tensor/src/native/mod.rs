//! Backend over the optional, separately compiled kernel library.
//!
//! Only batched dot products go through native code, and only for the
//! pairings and layouts the library has GEMM kernels for. Everything else is
//! served by the portable [`SimdBackend`] it wraps.

pub mod ffi;

use std::ffi::c_int;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{check_batch, BackendDescriptor, BatchWindow, ComputeBackend, RequiredCapability};
use crate::capability::MachineSpec;
use crate::dtype::{DType, BLOCK_SIZE};
use crate::error::{Result, TensorError};
use crate::simd::SimdBackend;
use crate::storage::{Elements, ElementsMut};
use crate::tensor::Tensor;
use crate::view::{TensorView, TensorViewMut};

pub use ffi::NativeKernels;

/// Which native GEMM a batched dot product maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmKind {
    F32,
    F32Q4,
    Q8Q4,
    F32Bf16,
    Bf16,
}

impl GemmKind {
    /// The kernel for `a x b -> result`, if the library has one and the
    /// layout satisfies its rules: the column window must be a whole number
    /// of blocks, and quantized operands need whole-block rows and a window
    /// starting on a block.
    pub fn plan(a: DType, b: DType, result: DType, row_lens: (usize, usize), w: &BatchWindow) -> Option<GemmKind> {
        if w.column_length == 0 || w.column_length % BLOCK_SIZE != 0 {
            return None;
        }
        let kind = match (a, b) {
            (DType::F32, DType::F32) => GemmKind::F32,
            (DType::F32, DType::Q4) => GemmKind::F32Q4,
            (DType::Q8, DType::Q4) => GemmKind::Q8Q4,
            (DType::F32, DType::BF16) => GemmKind::F32Bf16,
            (DType::BF16, DType::BF16) => GemmKind::Bf16,
            _ => return None,
        };
        let result_ok = match kind {
            GemmKind::F32Bf16 | GemmKind::Bf16 => matches!(result, DType::F32 | DType::BF16),
            _ => result == DType::F32,
        };
        let aligned = |dtype: DType, row_len: usize, offset: usize| {
            !dtype.is_quantized() || (row_len % BLOCK_SIZE == 0 && offset % BLOCK_SIZE == 0)
        };
        if result_ok && aligned(a, row_lens.0, w.a_column_offset) && aligned(b, row_lens.1, w.b_column_offset) {
            Some(kind)
        } else {
            None
        }
    }
}

/// Result pointers shared with kernel calls on pool threads.
#[derive(Clone, Copy)]
struct ResultPtr {
    f32: *mut f32,
    bf16: *mut u16,
}

// Safety: concurrent kernel calls write disjoint column ranges.
unsafe impl Send for ResultPtr {}
unsafe impl Sync for ResultPtr {}

#[derive(Debug, Clone)]
pub struct NativeBackend {
    descriptor: BackendDescriptor,
    kernels: Arc<NativeKernels>,
    flags: c_int,
    fallback: SimdBackend,
}

impl NativeBackend {
    /// Loads the kernel library; see [`NativeKernels::load`].
    pub fn load(path: Option<&Path>, spec: &MachineSpec, fallback: SimdBackend) -> Result<Self> {
        let kernels = NativeKernels::load(path)?;
        Ok(Self::with_kernels(Arc::new(kernels), spec, fallback))
    }

    pub fn with_kernels(kernels: Arc<NativeKernels>, spec: &MachineSpec, fallback: SimdBackend) -> Self {
        let mut descriptor = fallback.descriptor().clone();
        descriptor.name = "native";
        descriptor.requires = RequiredCapability::NativeLibrary;
        let flags = spec.native_flags();
        debug!(flags, "native kernels loaded");
        NativeBackend {
            descriptor,
            kernels,
            flags,
            fallback,
        }
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    // Runs `kind` over rows `n0..n0 + n` of `b`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn gemm(
        &self,
        kind: GemmKind,
        a: Elements<'_>,
        b: Elements<'_>,
        r: ResultPtr,
        dims: &GemmDims,
        n0: c_int,
        n: c_int,
    ) {
        let k = &self.kernels;
        let d = dims;
        match (kind, a, b) {
            (GemmKind::F32, Elements::F32(a), Elements::F32(b)) => (k.gemm_f32)(
                self.flags, a.as_ptr(), d.aoffset, b.as_ptr(), d.boffset, r.f32, d.roffset,
                d.m, n0, n, d.k, d.lda, d.ldb, d.ldc,
            ),
            (GemmKind::F32Q4, Elements::F32(a), Elements::Q4 { data, scales }) => (k.gemm_f32_q4)(
                self.flags, a.as_ptr(), d.aoffset, scales.as_ptr(), data.as_ptr(), d.boffset / 2,
                r.f32, d.roffset, d.m, n0, n, d.k, d.lda, d.ldb / 2, d.ldb / BLOCK_SIZE as c_int, d.ldc,
            ),
            (GemmKind::Q8Q4, Elements::Q8 { data: ad, scales: af }, Elements::Q4 { data: bd, scales: bf }) => {
                (k.gemm_q8_q4)(
                    self.flags, af.as_ptr(), ad.as_ptr(), d.aoffset, bf.as_ptr(), bd.as_ptr(),
                    d.boffset / 2, r.f32, d.roffset, d.m, n0, n, d.k, d.lda,
                    d.lda / BLOCK_SIZE as c_int, d.ldb / 2, d.ldb / BLOCK_SIZE as c_int, d.ldc,
                )
            }
            (GemmKind::F32Bf16, Elements::F32(a), Elements::BF16(b)) => (k.gemm_f32_bf16)(
                self.flags, a.as_ptr(), d.aoffset, b.as_ptr(), d.boffset, r.bf16, r.f32, d.roffset,
                d.m, n0, n, d.k, d.lda, d.ldb, d.ldc,
            ),
            (GemmKind::Bf16, Elements::BF16(a), Elements::BF16(b)) => (k.gemm_bf16)(
                self.flags, a.as_ptr(), d.aoffset, b.as_ptr(), d.boffset, r.bf16, r.f32, d.roffset,
                d.m, n0, n, d.k, d.lda, d.ldb, d.ldc,
            ),
            _ => unreachable!("planned kernel does not match operand encodings"),
        }
    }
}

/// Row strides and offsets of one kernel call, in elements.
struct GemmDims {
    m: c_int,
    k: c_int,
    lda: c_int,
    ldb: c_int,
    ldc: c_int,
    aoffset: c_int,
    boffset: c_int,
    roffset: c_int,
}

fn to_c(v: usize) -> Result<c_int> {
    c_int::try_from(v).map_err(|_| TensorError::InvalidShape(format!("{} exceeds native kernel index range", v)))
}

impl ComputeBackend for NativeBackend {
    fn name(&self) -> &str {
        self.descriptor.name
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn parallel_split_size(&self) -> usize {
        self.fallback.parallel_split_size()
    }

    fn dot_product(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
    ) -> Result<f32> {
        self.fallback.dot_product(a, b, a_offset, b_offset, length)
    }

    fn batch_dot_product(
        &self,
        result: &mut TensorViewMut<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        w: BatchWindow,
    ) -> Result<()> {
        let r_shape = result.shape().clone();
        check_batch(&r_shape, a, b, &w)?;
        let row_lens = (a.shape().last(), b.shape().last());
        let Some(kind) = GemmKind::plan(a.dtype(), b.dtype(), result.dtype(), row_lens, &w) else {
            trace!(a = %a.dtype(), b = %b.dtype(), "no native kernel, delegating");
            return self.fallback.batch_dot_product(result, a, b, w);
        };

        let dims = GemmDims {
            m: to_c(a.shape().first())?,
            k: to_c(w.column_length)?,
            lda: to_c(a.shape().last())?,
            ldb: to_c(b.shape().last())?,
            ldc: to_c(r_shape.last())?,
            aoffset: to_c(w.a_column_offset)?,
            boffset: to_c(w.b_column_offset)?,
            roffset: to_c(w.b_row_offset)? - to_c(w.r_row_offset)?,
        };
        to_c(w.b_row_offset + w.row_chunk)?;

        let ptr = match result.elements_mut() {
            ElementsMut::F32(s) => ResultPtr {
                f32: s.as_mut_ptr(),
                bf16: std::ptr::null_mut(),
            },
            ElementsMut::BF16(s) => ResultPtr {
                f32: std::ptr::null_mut(),
                bf16: s.as_mut_ptr(),
            },
            other => {
                return Err(TensorError::UnsupportedCombination {
                    op: "batch_dot_product",
                    a: a.dtype(),
                    b: other.dtype(),
                })
            }
        };
        let (a_elems, b_elems) = (a.elements(), b.elements());
        self.fallback.pool().parallel_chunks(w.b_row_offset, w.row_chunk, |n0, n| {
            // SAFETY: operand windows were validated by `check_batch`, the
            // result outlives the join, and each task writes only result
            // columns for its own rows of `b`.
            unsafe { self.gemm(kind, a_elems, b_elems, ptr, &dims, n0 as c_int, n as c_int) }
        });
        Ok(())
    }

    fn accumulate(&self, dst: &mut TensorViewMut<'_>, src: &TensorView<'_>, offset: usize, length: usize) -> Result<()> {
        self.fallback.accumulate(dst, src, offset, length)
    }

    fn maccumulate(&self, dst: &mut TensorViewMut<'_>, src: &TensorView<'_>, offset: usize, length: usize) -> Result<()> {
        self.fallback.maccumulate(dst, src, offset, length)
    }

    fn scale(&self, factor: f32, x: &mut TensorViewMut<'_>, offset: usize, length: usize) -> Result<()> {
        self.fallback.scale(factor, x, offset, length)
    }

    fn saxpy(
        &self,
        alpha: f32,
        x: &TensorView<'_>,
        y: &mut TensorViewMut<'_>,
        x_offset: usize,
        y_offset: usize,
        limit: usize,
    ) -> Result<()> {
        self.fallback.saxpy(alpha, x, y, x_offset, y_offset, limit)
    }

    fn sxpby(
        &self,
        beta: f32,
        x: &TensorView<'_>,
        y: &mut TensorViewMut<'_>,
        x_offset: usize,
        y_offset: usize,
        limit: usize,
    ) -> Result<()> {
        self.fallback.sxpby(beta, x, y, x_offset, y_offset, limit)
    }

    fn quantize(&self, t: &TensorView<'_>, dtype: DType, offset: usize, length: usize) -> Result<Tensor> {
        self.fallback.quantize(t, dtype, offset, length)
    }

    fn sum(&self, t: &TensorView<'_>) -> Result<f32> {
        self.fallback.sum(t)
    }
}
