use crate::backend::{
    check_batch, check_rows, check_window, BackendDescriptor, BatchWindow, ComputeBackend,
    RequiredCapability,
};
use crate::error::Result;
use crate::storage::{Elements, ElementsMut};
use crate::view::{TensorView, TensorViewMut};

/// Pure-Rust scalar compute backend.
///
/// Implements every operation for every encoding pair with straightforward
/// element loops, decoding operands on the fly. This is the ground truth
/// other backends are tested against, and the tier of last resort.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    descriptor: BackendDescriptor,
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend {
            descriptor: BackendDescriptor {
                name: "reference",
                requires: RequiredCapability::None,
                pairs: BackendDescriptor::all_pairs(),
            },
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum of products over two windows of decoded elements.
pub(crate) fn dot_elements(a: Elements<'_>, a_offset: usize, b: Elements<'_>, b_offset: usize, length: usize) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..length {
        sum += a.get(a_offset + i) * b.get(b_offset + i);
    }
    sum
}

/// Decodes `dst[start..start + len]`, applies `f` to each value with its
/// window index, and encodes the result back.
pub(crate) fn update_window<F>(dst: &mut ElementsMut<'_>, start: usize, len: usize, f: F)
where
    F: Fn(usize, f32) -> f32,
{
    let mut values = dst.as_elements().to_f32_vec(start, len);
    for (i, v) in values.iter_mut().enumerate() {
        *v = f(i, *v);
    }
    dst.write_from(start, &values);
}

/// Row-wise binary update shared by `accumulate` and `maccumulate`.
pub(crate) fn combine_rows<F>(
    op: &'static str,
    dst: &mut TensorViewMut<'_>,
    src: &TensorView<'_>,
    offset: usize,
    length: usize,
    f: F,
) -> Result<()>
where
    F: Fn(f32, f32) -> f32,
{
    let shape = dst.shape().clone();
    let broadcast = check_rows(op, &shape, src, offset, length)?;
    let cols = shape.last();
    let src_elems = src.elements();
    let mut elems = dst.elements_mut();
    for row in 0..shape.rows() {
        let src_base = if broadcast { 0 } else { row * cols } + offset;
        update_window(&mut elems, row * cols + offset, length, |i, v| {
            f(v, src_elems.get(src_base + i))
        });
    }
    Ok(())
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        self.descriptor.name
    }

    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
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
        Ok(dot_elements(
            a.contiguous_elements()?,
            a_offset,
            b.contiguous_elements()?,
            b_offset,
            length,
        ))
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
        let (a_elems, b_elems) = (a.elements(), b.elements());
        let (a_cols, b_cols, r_cols) = (a.shape().last(), b.shape().last(), r_shape.last());
        let mut out = result.elements_mut();

        for i in 0..a.shape().first() {
            for (r, j) in (w.b_row_offset..w.b_row_offset + w.row_chunk).enumerate() {
                let d = dot_elements(
                    a_elems,
                    i * a_cols + w.a_column_offset,
                    b_elems,
                    j * b_cols + w.b_column_offset,
                    w.column_length,
                );
                out.set(i * r_cols + w.r_row_offset + r, d);
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
        combine_rows("accumulate", dst, src, offset, length, |d, s| d + s)
    }

    fn maccumulate(
        &self,
        dst: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()> {
        combine_rows("maccumulate", dst, src, offset, length, |d, s| d * s)
    }

    fn scale(&self, factor: f32, x: &mut TensorViewMut<'_>, offset: usize, length: usize) -> Result<()> {
        let shape = x.shape().clone();
        check_window("scale", shape.last(), offset, length)?;
        let mut elems = x.elements_mut();
        for row in 0..shape.rows() {
            update_window(&mut elems, row * shape.last() + offset, length, |_, v| v * factor);
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
        update_window(&mut y.elements_mut(), y_offset, limit, |i, v| {
            alpha * xs.get(x_offset + i) + v
        });
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
        update_window(&mut y.elements_mut(), y_offset, limit, |i, v| {
            xs.get(x_offset + i) + beta * v
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RowSpan;
    use crate::dtype::DType;
    use crate::shape::Shape;
    use crate::tensor::Tensor;
    use crate::TensorError;
    use approx::assert_relative_eq;

    fn backend() -> CpuBackend {
        CpuBackend::new()
    }

    fn tensor(values: &[f32], dims: &[usize]) -> Tensor {
        Tensor::new(values.to_vec(), Shape::from_slice(dims))
    }

    #[test]
    fn test_dot_product_exact() {
        let b = backend();
        let x = tensor(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let ones = tensor(&[1.0; 4], &[4]);
        assert_eq!(b.dot_product(&x.view(), &ones.view(), 0, 0, 4).unwrap(), 10.0);
        assert_eq!(b.dot_product(&x.view(), &ones.view(), 2, 1, 2).unwrap(), 7.0);
    }

    #[test]
    fn test_dot_product_window_checked() {
        let b = backend();
        let x = tensor(&[1.0; 4], &[4]);
        assert!(matches!(
            b.dot_product(&x.view(), &x.view(), 2, 0, 4),
            Err(TensorError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_dot_product_mixed_encodings() {
        let b = backend();
        let values: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).cos()).collect();
        let x = tensor(&values, &[64]);
        let expected = b.dot_product(&x.view(), &x.view(), 0, 0, 64).unwrap();
        for dtype in DType::ALL {
            let q = x.quantize(dtype).unwrap();
            let got = b.dot_product(&x.view(), &q.view(), 0, 0, 64).unwrap();
            assert_relative_eq!(got, expected, max_relative = 0.05);
        }
    }

    #[test]
    fn test_batch_dot_product_basic() {
        let b = backend();
        // [1,2;3,4] . rows of [5,7;6,8] = [19,22;43,50]
        let a = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let w = tensor(&[5.0, 7.0, 6.0, 8.0], &[2, 2]);
        let mut r = Tensor::zeros(DType::F32, Shape::new(vec![2, 2]));
        b.batch_dot_product(&mut r.view_mut().unwrap(), &a.view(), &w.view(), BatchWindow::full(2, 2))
            .unwrap();
        assert_eq!(r.to_f32_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_dot_product_chunk_writes_own_columns() {
        let b = backend();
        let a = tensor(&[1.0, 1.0], &[1, 2]);
        let w = tensor(&[1.0, 0.0, 2.0, 0.0, 3.0, 0.0, 4.0, 0.0], &[4, 2]);
        let mut r = Tensor::zeros(DType::F32, Shape::new(vec![1, 4]));
        {
            let mut rv = r.view_mut().unwrap();
            b.dot_product_chunk(&mut rv, &a.view(), &w.view(), 0, 2, 2, 2).unwrap();
            b.dot_product_chunk(&mut rv, &a.view(), &w.view(), 0, 2, 0, 2).unwrap();
        }
        assert_eq!(r.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_batch_dot_product_rejects_bad_rank() {
        let b = backend();
        let a = tensor(&[1.0, 2.0], &[2]);
        let mut r = Tensor::zeros(DType::F32, Shape::new(vec![1, 1]));
        assert!(b
            .batch_dot_product(&mut r.view_mut().unwrap(), &a.view(), &a.view(), BatchWindow::full(2, 1))
            .is_err());
    }

    #[test]
    fn test_accumulate_broadcast_row() {
        let b = backend();
        let mut x = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let row = tensor(&[10.0, 20.0], &[1, 2]);
        b.accumulate(&mut x.view_mut().unwrap(), &row.view(), 0, 2).unwrap();
        assert_eq!(x.to_f32_vec(), vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_maccumulate_window() {
        let b = backend();
        let mut x = tensor(&[1.0, 2.0, 3.0], &[3]);
        let y = tensor(&[2.0, 2.0, 2.0], &[3]);
        b.maccumulate(&mut x.view_mut().unwrap(), &y.view(), 1, 2).unwrap();
        assert_eq!(x.to_f32_vec(), vec![1.0, 4.0, 6.0]);
    }

    #[test]
    fn test_scale_every_row() {
        let b = backend();
        let mut x = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        b.scale(2.0, &mut x.view_mut().unwrap(), 1, 1).unwrap();
        assert_eq!(x.to_f32_vec(), vec![1.0, 4.0, 3.0, 8.0]);
    }

    #[test]
    fn test_saxpy_and_sxpby() {
        let b = backend();
        let x = tensor(&[1.0, 2.0, 3.0], &[3]);
        let mut y = tensor(&[1.0, 1.0, 1.0], &[3]);
        b.saxpy(2.0, &x.view(), &mut y.view_mut().unwrap(), 0, 0, 3).unwrap();
        assert_eq!(y.to_f32_vec(), vec![3.0, 5.0, 7.0]);
        b.sxpby(0.5, &x.view(), &mut y.view_mut().unwrap(), 0, 0, 3).unwrap();
        assert_eq!(y.to_f32_vec(), vec![2.5, 4.5, 6.5]);
    }

    #[test]
    fn test_saxpy_rows() {
        let b = backend();
        let alpha = tensor(&[0.0, 1.0, 2.0], &[1, 3]);
        let x = tensor(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0], &[3, 2]);
        let mut y = tensor(&[0.0, 0.0], &[1, 2]);
        let rows = RowSpan {
            alpha_offset: 1,
            x_row_offset: 1,
            rows: 2,
        };
        b.saxpy_rows(&alpha.view(), &x.view(), &mut y.view_mut().unwrap(), 0, 0, 2, rows)
            .unwrap();
        // 1 * [2, 2] + 2 * [3, 3]
        assert_eq!(y.to_f32_vec(), vec![8.0, 8.0]);
    }

    #[test]
    fn test_quantized_destination() {
        let b = backend();
        let mut y = Tensor::from_values(DType::Q8, Shape::new(vec![32]), &[1.0; 32]).unwrap();
        let x = tensor(&[1.0; 32], &[32]);
        b.saxpy(1.0, &x.view(), &mut y.view_mut().unwrap(), 0, 0, 32).unwrap();
        for v in y.to_f32_vec() {
            assert!((v - 2.0).abs() <= 2.0 / 127.0);
        }
    }

    #[test]
    fn test_sum() {
        let b = backend();
        let x = tensor(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(b.sum(&x.view()).unwrap(), 10.0);
        let t = x.transpose(&[1, 0]).unwrap();
        assert_eq!(b.sum(&t.view()).unwrap(), 10.0);
    }
}
