//! Portable vectorized backend.
//!
//! Runs the dot-product family through [`kernels`] and fans row and column
//! ranges out over an [`ExecutionPool`]. f32 destinations take the fast
//! paths; other encodings go through the decode, compute, encode helpers
//! shared with the reference backend.

pub mod kernels;

use std::sync::Arc;

use rayon::prelude::*;

use crate::backend::{
    check_batch, check_rows, check_window, masked_rows, BackendDescriptor, BatchWindow,
    ComputeBackend, RequiredCapability,
};
use crate::codec::{self, Q4_BLOCK_BYTES};
use crate::cpu::{combine_rows, update_window};
use crate::dtype::{DType, BLOCK_SIZE};
use crate::error::{Result, TensorError};
use crate::pool::ExecutionPool;
use crate::storage::{CpuStorage, Elements, ElementsMut};
use crate::tensor::Tensor;
use crate::view::{TensorView, TensorViewMut};

/// Windows shorter than this run on the calling thread.
const PARALLEL_MIN: usize = 4096;

#[derive(Debug, Clone)]
pub struct SimdBackend {
    descriptor: BackendDescriptor,
    pool: Arc<ExecutionPool>,
}

impl SimdBackend {
    pub fn new(pool: Arc<ExecutionPool>) -> Self {
        SimdBackend {
            descriptor: BackendDescriptor {
                name: "simd",
                requires: RequiredCapability::VectorUnit,
                pairs: kernels::SUPPORTED_PAIRS.to_vec(),
            },
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ExecutionPool> {
        &self.pool
    }

    fn check_pair(&self, op: &'static str, a: DType, b: DType) -> Result<()> {
        if !kernels::supports(a, b) {
            return Err(TensorError::UnsupportedCombination { op, a, b });
        }
        Ok(())
    }

    /// Row `i` of a batched dot product into `out`, one value per row of
    /// the `b` chunk.
    fn batch_row(
        &self,
        out: &mut [f32],
        a: Elements<'_>,
        a_start: usize,
        b: Elements<'_>,
        b_cols: usize,
        w: &BatchWindow,
    ) -> Result<()> {
        let run = |start: usize, chunk: &mut [f32]| -> Result<()> {
            for (r, o) in chunk.iter_mut().enumerate() {
                let b_start = (w.b_row_offset + start + r) * b_cols + w.b_column_offset;
                *o = kernels::dot(a, a_start, b, b_start, w.column_length).ok_or(
                    TensorError::UnsupportedCombination {
                        op: "batch_dot_product",
                        a: a.dtype(),
                        b: b.dtype(),
                    },
                )?;
            }
            Ok(())
        };
        if out.len() * w.column_length >= PARALLEL_MIN {
            self.pool.try_for_each_chunk_mut(out, run)
        } else {
            run(0, out)
        }
    }

    fn map_window<F>(&self, y: &mut [f32], f: F)
    where
        F: Fn(usize, &mut [f32]) + Send + Sync,
    {
        if y.len() >= PARALLEL_MIN {
            self.pool.for_each_chunk_mut(y, f);
        } else {
            f(0, y);
        }
    }
}

impl ComputeBackend for SimdBackend {
    fn name(&self) -> &str {
        self.descriptor.name
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn parallel_split_size(&self) -> usize {
        self.pool.threads()
    }

    fn dot_product(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
    ) -> Result<f32> {
        check_window("dot_product", a.numel(), a_offset, length)?;
        check_window("dot_product", b.numel(), b_offset, length)?;
        kernels::dot(
            a.contiguous_elements()?,
            a_offset,
            b.contiguous_elements()?,
            b_offset,
            length,
        )
        .ok_or(TensorError::UnsupportedCombination {
            op: "dot_product",
            a: a.dtype(),
            b: b.dtype(),
        })
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
        self.check_pair("batch_dot_product", a.dtype(), b.dtype())?;
        let (a_elems, b_elems) = (a.elements(), b.elements());
        let (a_cols, b_cols, r_cols) = (a.shape().last(), b.shape().last(), r_shape.last());

        match result.elements_mut() {
            ElementsMut::F32(out) => {
                for i in 0..a.shape().first() {
                    let start = i * r_cols + w.r_row_offset;
                    let a_start = i * a_cols + w.a_column_offset;
                    self.batch_row(&mut out[start..start + w.row_chunk], a_elems, a_start, b_elems, b_cols, &w)?;
                }
            }
            mut other => {
                let mut row = vec![0.0f32; w.row_chunk];
                for i in 0..a.shape().first() {
                    let a_start = i * a_cols + w.a_column_offset;
                    self.batch_row(&mut row, a_elems, a_start, b_elems, b_cols, &w)?;
                    other.write_from(i * r_cols + w.r_row_offset, &row);
                }
            }
        }
        Ok(())
    }

    fn accumulate(
        &self,
        dst: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        self.rows_f32("accumulate", dst, src, offset, length, |d, s| d + s)
    }

    fn maccumulate(
        &self,
        dst: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        self.rows_f32("maccumulate", dst, src, offset, length, |d, s| d * s)
    }

    fn scale(&self, factor: f32, x: &mut TensorViewMut<'_>, offset: usize, length: usize) -> Result<()> {
        let shape = x.shape().clone();
        check_window("scale", shape.last(), offset, length)?;
        let cols = shape.last();
        match x.elements_mut() {
            ElementsMut::F32(s) if cols > 0 => {
                self.pool.install(|| {
                    s[..shape.numel()]
                        .par_chunks_mut(cols)
                        .for_each(|row| kernels::scale_f32(factor, &mut row[offset..offset + length]))
                });
            }
            ElementsMut::F32(_) => {}
            mut other => {
                for row in 0..shape.rows() {
                    update_window(&mut other, row * cols + offset, length, |_, v| v * factor);
                }
            }
        }
        Ok(())
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
        check_window("saxpy", x.numel(), x_offset, limit)?;
        check_window("saxpy", y.numel(), y_offset, limit)?;
        let xs = x.contiguous_elements()?;
        match y.elements_mut() {
            ElementsMut::F32(ys) => {
                let xv = f32_window(xs, x_offset, limit);
                self.map_window(&mut ys[y_offset..y_offset + limit], |start, chunk| {
                    kernels::axpy_f32(alpha, &xv[start..start + chunk.len()], chunk)
                });
            }
            mut other => update_window(&mut other, y_offset, limit, |i, v| {
                alpha * xs.get(x_offset + i) + v
            }),
        }
        Ok(())
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
        check_window("sxpby", x.numel(), x_offset, limit)?;
        check_window("sxpby", y.numel(), y_offset, limit)?;
        let xs = x.contiguous_elements()?;
        match y.elements_mut() {
            ElementsMut::F32(ys) => {
                let xv = f32_window(xs, x_offset, limit);
                self.map_window(&mut ys[y_offset..y_offset + limit], |start, chunk| {
                    kernels::xpby_f32(beta, &xv[start..start + chunk.len()], chunk)
                });
            }
            mut other => update_window(&mut other, y_offset, limit, |i, v| {
                xs.get(x_offset + i) + beta * v
            }),
        }
        Ok(())
    }

    fn quantize(&self, t: &TensorView<'_>, dtype: DType, offset: usize, length: usize) -> Result<Tensor> {
        let values = masked_rows(t, offset, length)?;
        let mut storage = CpuStorage::zeros(dtype, values.len());
        match storage.elements_mut() {
            ElementsMut::Q8 { data, scales } => self.pool.install(|| {
                data.par_chunks_mut(BLOCK_SIZE)
                    .zip(scales.par_chunks_mut(1))
                    .zip(values.par_chunks(BLOCK_SIZE))
                    .for_each(|((d, s), v)| codec::quantize_q8(v, d, s))
            }),
            ElementsMut::Q4 { data, scales } => self.pool.install(|| {
                data.par_chunks_mut(Q4_BLOCK_BYTES)
                    .zip(scales.par_chunks_mut(1))
                    .zip(values.par_chunks(BLOCK_SIZE))
                    .for_each(|((d, s), v)| codec::quantize_q4(v, d, s))
            }),
            mut other => other.write_from(0, &values),
        }
        Tensor::from_storage(storage, t.shape().clone())
    }

    fn sum(&self, t: &TensorView<'_>) -> Result<f32> {
        match t.elements() {
            Elements::F32(s) if t.is_contiguous() => Ok(self.pool.install(|| {
                s[..t.numel()]
                    .par_chunks(PARALLEL_MIN)
                    .map(|c| c.iter().sum::<f32>())
                    .sum()
            })),
            _ => Ok(t.to_f32_vec().iter().sum()),
        }
    }
}

impl SimdBackend {
    fn rows_f32<F>(
        &self,
        op: &'static str,
        dst: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
        f: F,
    ) -> Result<()>
    where
        F: Fn(f32, f32) -> f32 + Send + Sync,
    {
        if dst.dtype() != DType::F32 {
            return combine_rows(op, dst, src, offset, length, f);
        }
        let shape = dst.shape().clone();
        let broadcast = check_rows(op, &shape, src, offset, length)?;
        let cols = shape.last();
        if cols == 0 {
            return Ok(());
        }
        let src_elems = src.elements();
        if let ElementsMut::F32(d) = dst.elements_mut() {
            self.pool.install(|| {
                d[..shape.numel()]
                    .par_chunks_mut(cols)
                    .enumerate()
                    .for_each(|(row, dst_row)| {
                        let base = if broadcast { 0 } else { row * cols } + offset;
                        let window = &mut dst_row[offset..offset + length];
                        match src_elems {
                            Elements::F32(s) => kernels::zip_apply(window, &s[base..base + length], &f),
                            other => {
                                let decoded = other.to_f32_vec(base, length);
                                kernels::zip_apply(window, &decoded, &f)
                            }
                        }
                    })
            });
        }
        Ok(())
    }
}

/// `len` values of `e` at `start` as f32, copying only when decoding.
fn f32_window<'x>(e: Elements<'x>, start: usize, len: usize) -> std::borrow::Cow<'x, [f32]> {
    match e {
        Elements::F32(s) => std::borrow::Cow::Borrowed(&s[start..start + len]),
        other => std::borrow::Cow::Owned(other.to_f32_vec(start, len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::shape::Shape;
    use approx::assert_relative_eq;

    fn backend() -> SimdBackend {
        SimdBackend::new(Arc::new(ExecutionPool::new(4).unwrap()))
    }

    fn values(n: usize, seed: usize) -> Vec<f32> {
        (0..n)
            .map(|i| 0.1 + ((i * 31 + seed * 17) % 97) as f32 / 97.0)
            .collect()
    }

    #[test]
    fn test_descriptor() {
        let b = backend();
        assert_eq!(b.name(), "simd");
        assert_eq!(b.parallel_split_size(), 4);
        assert!(b.descriptor().supports(DType::Q4, DType::F32));
        assert!(!b.descriptor().supports(DType::Q4, DType::Q4));
    }

    #[test]
    fn test_dot_product_exact_f32() {
        let b = backend();
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![4]));
        let ones = Tensor::ones(Shape::new(vec![4]));
        assert_eq!(b.dot_product(&x.view(), &ones.view(), 0, 0, 4).unwrap(), 10.0);
    }

    #[test]
    fn test_unsupported_pair_is_distinct_error() {
        let b = backend();
        let q = Tensor::from_values(DType::Q4, Shape::new(vec![32]), &[1.0; 32]).unwrap();
        let err = b.dot_product(&q.view(), &q.view(), 0, 0, 32).unwrap_err();
        assert!(err.is_unsupported());
        let shape_err = b.dot_product(&q.view(), &q.view(), 16, 0, 32).unwrap_err();
        assert!(!shape_err.is_unsupported());
    }

    #[test]
    fn test_batch_matches_reference() {
        let simd = backend();
        let reference = CpuBackend::new();
        let a = Tensor::new(values(3 * 64, 1), Shape::new(vec![3, 64]));
        let w = Tensor::from_values(DType::Q8, Shape::new(vec![70, 64]), &values(70 * 64, 2)).unwrap();
        let window = BatchWindow::chunk(0, 64, 5, 60);

        let mut r1 = Tensor::zeros(DType::F32, Shape::new(vec![3, 70]));
        let mut r2 = Tensor::zeros(DType::F32, Shape::new(vec![3, 70]));
        simd.batch_dot_product(&mut r1.view_mut().unwrap(), &a.view(), &w.view(), window)
            .unwrap();
        reference
            .batch_dot_product(&mut r2.view_mut().unwrap(), &a.view(), &w.view(), window)
            .unwrap();
        for (x, y) in r1.to_f32_vec().iter().zip(r2.to_f32_vec()) {
            assert_relative_eq!(*x, y, max_relative = 1e-4);
        }
        assert_eq!(r1.get(&[0, 0]).unwrap(), 0.0);
        assert!(r1.get(&[0, 5]).unwrap() > 0.0);
    }

    #[test]
    fn test_batch_row_reports_unsupported_pair() {
        let simd = backend();
        let q = Tensor::from_values(DType::Q4, Shape::new(vec![256, 64]), &values(256 * 64, 4)).unwrap();
        let elems = q.view().elements();
        for rows in [2, 256] {
            let mut out = vec![1.0f32; rows];
            let err = simd
                .batch_row(&mut out, elems, 0, elems, 64, &BatchWindow::full(64, rows))
                .unwrap_err();
            assert!(err.is_unsupported());
        }
    }

    #[test]
    fn test_batch_into_bf16_result() {
        let simd = backend();
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2]));
        let w = Tensor::new(vec![5.0, 7.0, 6.0, 8.0], Shape::new(vec![2, 2]));
        let mut r = Tensor::zeros(DType::BF16, Shape::new(vec![2, 2]));
        simd.batch_dot_product(&mut r.view_mut().unwrap(), &a.view(), &w.view(), BatchWindow::full(2, 2))
            .unwrap();
        assert_eq!(r.to_f32_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_elementwise_match_reference() {
        let simd = backend();
        let reference = CpuBackend::new();
        let src = Tensor::new(values(8 * 48, 3), Shape::new(vec![8, 48]));
        let row = Tensor::from_values(DType::F16, Shape::new(vec![1, 48]), &values(48, 4)).unwrap();

        let mut x1 = Tensor::new(values(8 * 48, 5), Shape::new(vec![8, 48]));
        let mut x2 = x1.clone();
        for be in [&simd as &dyn ComputeBackend, &reference] {
            let x = if be.name() == "simd" { &mut x1 } else { &mut x2 };
            let mut v = x.view_mut().unwrap();
            be.accumulate(&mut v, &src.view(), 3, 40).unwrap();
            be.maccumulate(&mut v, &row.view(), 0, 48).unwrap();
            be.scale(0.5, &mut v, 10, 20).unwrap();
        }
        for (p, q) in x1.to_f32_vec().iter().zip(x2.to_f32_vec()) {
            assert_relative_eq!(*p, q, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_saxpy_large_window_parallel() {
        let simd = backend();
        let n = 3 * PARALLEL_MIN;
        let x = Tensor::new(values(n, 6), Shape::new(vec![n]));
        let mut y = Tensor::new(vec![1.0; n], Shape::new(vec![n]));
        simd.saxpy(2.0, &x.view(), &mut y.view_mut().unwrap(), 0, 0, n).unwrap();
        let xs = x.to_f32_vec();
        for (i, v) in y.to_f32_vec().iter().enumerate() {
            assert_relative_eq!(*v, 1.0 + 2.0 * xs[i], max_relative = 1e-6);
        }
        simd.sxpby(0.0, &x.view(), &mut y.view_mut().unwrap(), 0, 0, n).unwrap();
        assert_eq!(y.to_f32_vec(), xs);
    }

    #[test]
    fn test_quantize_window_parallel() {
        let simd = backend();
        let t = Tensor::new(vec![5.0; 4 * 64], Shape::new(vec![4, 64]));
        let q = simd.quantize(&t.view(), DType::Q8, 32, 32).unwrap();
        assert_eq!(q.dtype(), DType::Q8);
        assert_eq!(q.get(&[1, 0]).unwrap(), 0.0);
        assert!((q.get(&[1, 40]).unwrap() - 5.0).abs() < 1e-5);
        let q4 = simd.quantize(&t.view(), DType::Q4, 0, 64).unwrap();
        assert_eq!(q4.get(&[3, 63]).unwrap(), 5.0);
    }

    #[test]
    fn test_sum_parallel() {
        let simd = backend();
        let t = Tensor::ones(Shape::new(vec![10_000]));
        assert_eq!(simd.sum(&t.view()).unwrap(), 10_000.0);
    }
}
