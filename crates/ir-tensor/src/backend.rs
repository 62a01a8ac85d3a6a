use std::fmt::{self, Debug};

use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::view::{TensorView, TensorViewMut};

/// Relative error within which every backend must agree with the reference
/// backend on mixed low-precision dot products.
pub const CROSS_BACKEND_TOLERANCE: f32 = 0.01;

/// Hardware a backend needs before it can be instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredCapability {
    /// Runs anywhere.
    None,
    /// Needs a vector unit of at least 128 bits.
    VectorUnit,
    /// Needs the compiled kernel library to load.
    NativeLibrary,
}

/// Static description of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: &'static str,
    pub requires: RequiredCapability,
    /// `(a, b)` encoding pairs the dot-product family accepts. Every pair
    /// is accepted in either order.
    pub pairs: Vec<(DType, DType)>,
}

impl BackendDescriptor {
    pub fn supports(&self, a: DType, b: DType) -> bool {
        self.pairs
            .iter()
            .any(|&(x, y)| (x, y) == (a, b) || (y, x) == (a, b))
    }

    /// Every pair of encodings.
    pub fn all_pairs() -> Vec<(DType, DType)> {
        let mut pairs = Vec::new();
        for (i, &a) in DType::ALL.iter().enumerate() {
            for &b in &DType::ALL[i..] {
                pairs.push((a, b));
            }
        }
        pairs
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (requires {:?})", self.name, self.requires)
    }
}

/// Column and row window of a batched dot product.
///
/// For each row `i` of `a` and each `j` in `b_row_offset..b_row_offset +
/// row_chunk`, the dot product of `a[i, a_column_offset..][..column_length]`
/// and `b[j, b_column_offset..][..column_length]` is written to
/// `result[i, r_row_offset + (j - b_row_offset)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub a_column_offset: usize,
    pub b_column_offset: usize,
    pub column_length: usize,
    pub r_row_offset: usize,
    pub b_row_offset: usize,
    pub row_chunk: usize,
}

impl BatchWindow {
    /// All `columns` of every one of `rows` rows of `b`.
    pub fn full(columns: usize, rows: usize) -> Self {
        BatchWindow {
            a_column_offset: 0,
            b_column_offset: 0,
            column_length: columns,
            r_row_offset: 0,
            b_row_offset: 0,
            row_chunk: rows,
        }
    }

    /// Rows `row_offset..row_offset + row_chunk` of `b`, written to the same
    /// result columns, with one shared column window.
    pub fn chunk(column_offset: usize, column_length: usize, row_offset: usize, row_chunk: usize) -> Self {
        BatchWindow {
            a_column_offset: column_offset,
            b_column_offset: column_offset,
            column_length,
            r_row_offset: row_offset,
            b_row_offset: row_offset,
            row_chunk,
        }
    }
}

/// Rows of `x` combined by a batched saxpy, with their weights in `alpha`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub alpha_offset: usize,
    pub x_row_offset: usize,
    pub rows: usize,
}

/// The primitive operation set of the compute engine.
///
/// Offsets of `dot_product`, `saxpy` and `sxpby` index the flattened
/// operands. `accumulate`, `maccumulate` and `scale` apply a column window
/// to every row. Implementations that lack a kernel for an encoding pair
/// return [`TensorError::UnsupportedCombination`]; see
/// [`dot_product_with_fallback`] and [`batch_dot_product_with_fallback`].
pub trait ComputeBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "reference", "simd").
    fn name(&self) -> &str;

    fn descriptor(&self) -> &BackendDescriptor;

    /// Number of chunks callers should split row ranges into when fanning
    /// work out.
    fn parallel_split_size(&self) -> usize {
        1
    }

    /// Sum of `a[a_offset + i] * b[b_offset + i]` for `i < length`.
    fn dot_product(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        a_offset: usize,
        b_offset: usize,
        length: usize,
    ) -> Result<f32>;

    /// Row-by-row dot products of rank-2 `a` and `b` into rank-2 `result`.
    fn batch_dot_product(
        &self,
        result: &mut TensorViewMut<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        window: BatchWindow,
    ) -> Result<()>;

    /// `dst += src` over columns `offset..offset + length` of every row.
    /// A single-row `src` is broadcast across the rows of `dst`.
    fn accumulate(
        &self,
        dst: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()>;

    /// `dst *= src`, with the row handling of [`ComputeBackend::accumulate`].
    fn maccumulate(
        &self,
        dst: &mut TensorViewMut<'_>,
        src: &TensorView<'_>,
        offset: usize,
        length: usize,
    ) -> Result<()>;

    /// `x *= factor` over columns `offset..offset + length` of every row.
    fn scale(&self, factor: f32, x: &mut TensorViewMut<'_>, offset: usize, length: usize) -> Result<()>;

    /// `y = alpha * x + y`.
    fn saxpy(
        &self,
        alpha: f32,
        x: &TensorView<'_>,
        y: &mut TensorViewMut<'_>,
        x_offset: usize,
        y_offset: usize,
        limit: usize,
    ) -> Result<()>;

    /// `y = x + beta * y`.
    fn sxpby(
        &self,
        beta: f32,
        x: &TensorView<'_>,
        y: &mut TensorViewMut<'_>,
        x_offset: usize,
        y_offset: usize,
        limit: usize,
    ) -> Result<()>;

    /// Batched dot products over a row chunk of `b`, written to the
    /// matching result columns.
    fn dot_product_chunk(
        &self,
        result: &mut TensorViewMut<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        column_offset: usize,
        column_length: usize,
        row_offset: usize,
        row_chunk: usize,
    ) -> Result<()> {
        self.batch_dot_product(
            result,
            a,
            b,
            BatchWindow::chunk(column_offset, column_length, row_offset, row_chunk),
        )
    }

    /// [`ComputeBackend::dot_product_chunk`] for several `(result, b)`
    /// pairs sharing one `a`.
    fn dot_product_batch_chunk(
        &self,
        results: &mut [TensorViewMut<'_>],
        a: &TensorView<'_>,
        bs: &[TensorView<'_>],
        column_offset: usize,
        column_length: usize,
        row_offset: usize,
        row_chunk: usize,
    ) -> Result<()> {
        if results.len() != bs.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![bs.len()],
                got: vec![results.len()],
            });
        }
        for (result, b) in results.iter_mut().zip(bs) {
            self.dot_product_chunk(result, a, b, column_offset, column_length, row_offset, row_chunk)?;
        }
        Ok(())
    }

    /// `y += alpha[alpha_offset + r] * x[x_row_offset + r]` for each row
    /// `r < rows.rows`, over the given column windows.
    #[allow(clippy::too_many_arguments)]
    fn saxpy_rows(
        &self,
        alpha: &TensorView<'_>,
        x: &TensorView<'_>,
        y: &mut TensorViewMut<'_>,
        x_offset: usize,
        y_offset: usize,
        limit: usize,
        rows: RowSpan,
    ) -> Result<()> {
        check_window("saxpy_rows", alpha.numel(), rows.alpha_offset, rows.rows)?;
        check_window("saxpy_rows", x.shape().first(), rows.x_row_offset, rows.rows)?;
        let alphas = alpha.contiguous_elements()?;
        for r in 0..rows.rows {
            let row = x.slice(rows.x_row_offset + r)?;
            self.saxpy(alphas.get(rows.alpha_offset + r), &row, y, x_offset, y_offset, limit)?;
        }
        Ok(())
    }

    /// New tensor of `t`'s shape in `dtype`, holding `t`'s columns
    /// `offset..offset + length` of every row and zeros elsewhere.
    fn quantize(&self, t: &TensorView<'_>, dtype: DType, offset: usize, length: usize) -> Result<Tensor> {
        let values = masked_rows(t, offset, length)?;
        Tensor::from_values(dtype, t.shape().clone(), &values)
    }

    /// Sum of every element.
    fn sum(&self, t: &TensorView<'_>) -> Result<f32> {
        Ok(t.to_f32_vec().iter().sum())
    }
}

/// [`ComputeBackend::dot_product`], dequantizing one operand window to f32
/// when the backend has no kernel for the pair.
pub fn dot_product_with_fallback(
    backend: &dyn ComputeBackend,
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    a_offset: usize,
    b_offset: usize,
    length: usize,
) -> Result<f32> {
    match backend.dot_product(a, b, a_offset, b_offset, length) {
        Err(e) if e.is_unsupported() => {
            tracing::trace!(backend = backend.name(), a = %a.dtype(), b = %b.dtype(), "dot product fallback to f32");
            check_window("dot_product", b.numel(), b_offset, length)?;
            let b32 = Tensor::new(
                b.contiguous_elements()?.to_f32_vec(b_offset, length),
                Shape::new(vec![length]),
            );
            backend.dot_product(a, &b32.view(), a_offset, 0, length)
        }
        other => other,
    }
}

/// [`ComputeBackend::batch_dot_product`], dequantizing `b` to f32 when the
/// backend has no kernel for the pair.
pub fn batch_dot_product_with_fallback(
    backend: &dyn ComputeBackend,
    result: &mut TensorViewMut<'_>,
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    window: BatchWindow,
) -> Result<()> {
    match backend.batch_dot_product(result, a, b, window) {
        Err(e) if e.is_unsupported() => {
            tracing::trace!(backend = backend.name(), a = %a.dtype(), b = %b.dtype(), "batch dot product fallback to f32");
            let b32 = Tensor::new(b.to_f32_vec(), b.shape().clone());
            backend.batch_dot_product(result, a, &b32.view(), window)
        }
        other => other,
    }
}

pub(crate) fn check_window(op: &'static str, size: usize, offset: usize, length: usize) -> Result<()> {
    if offset + length > size {
        return Err(TensorError::InvalidShape(format!(
            "{}: window [{}, {}) exceeds {} elements",
            op,
            offset,
            offset + length,
            size
        )));
    }
    Ok(())
}

/// Validates the operands of a batched dot product.
pub(crate) fn check_batch(
    result: &Shape,
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    w: &BatchWindow,
) -> Result<()> {
    for (name, shape) in [("result", result), ("a", a.shape()), ("b", b.shape())] {
        if shape.ndim() != 2 {
            return Err(TensorError::InvalidShape(format!(
                "batch_dot_product: {} must be rank 2, got {}",
                name, shape
            )));
        }
    }
    if a.shape().first() != result.first() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![a.shape().first(), result.last()],
            got: result.dims().to_vec(),
        });
    }
    a.contiguous_elements()?;
    b.contiguous_elements()?;
    check_window("batch_dot_product", a.shape().last(), w.a_column_offset, w.column_length)?;
    check_window("batch_dot_product", b.shape().last(), w.b_column_offset, w.column_length)?;
    check_window("batch_dot_product", b.shape().first(), w.b_row_offset, w.row_chunk)?;
    check_window("batch_dot_product", result.last(), w.r_row_offset, w.row_chunk)?;
    Ok(())
}

/// Validates row-wise operands and reports whether `src` broadcasts a
/// single row.
pub(crate) fn check_rows(
    op: &'static str,
    dst: &Shape,
    src: &TensorView<'_>,
    offset: usize,
    length: usize,
) -> Result<bool> {
    src.contiguous_elements()?;
    let src_shape = src.shape();
    let same_rows = src_shape.rows() == dst.rows();
    if src_shape.last() != dst.last() || !(same_rows || src_shape.rows() == 1) {
        return Err(TensorError::ShapeMismatch {
            expected: dst.dims().to_vec(),
            got: src_shape.dims().to_vec(),
        });
    }
    check_window(op, dst.last(), offset, length)?;
    Ok(!same_rows)
}

/// Flattened values of `t` with every column outside the window zeroed.
pub(crate) fn masked_rows(t: &TensorView<'_>, offset: usize, length: usize) -> Result<Vec<f32>> {
    let cols = t.shape().last();
    check_window("quantize", cols, offset, length)?;
    let mut values = t.to_f32_vec();
    for row in values.chunks_mut(cols) {
        row[..offset].fill(0.0);
        row[offset + length..].fill(0.0);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    #[test]
    fn test_descriptor_pairs_are_symmetric() {
        let d = BackendDescriptor {
            name: "test",
            requires: RequiredCapability::None,
            pairs: vec![(DType::F32, DType::Q4)],
        };
        assert!(d.supports(DType::F32, DType::Q4));
        assert!(d.supports(DType::Q4, DType::F32));
        assert!(!d.supports(DType::Q4, DType::Q4));
        assert_eq!(BackendDescriptor::all_pairs().len(), 15);
    }

    #[test]
    fn test_chunk_window_maps_rows_to_columns() {
        let w = BatchWindow::chunk(4, 8, 3, 2);
        assert_eq!(w.r_row_offset, 3);
        assert_eq!(w.b_row_offset, 3);
        assert_eq!(w.a_column_offset, w.b_column_offset);
    }

    #[test]
    fn test_masked_rows() {
        let t = Tensor::new((1..=6).map(|i| i as f32).collect(), Shape::new(vec![2, 3]));
        let v = masked_rows(&t.view(), 1, 1).unwrap();
        assert_eq!(v, vec![0.0, 2.0, 0.0, 0.0, 5.0, 0.0]);
        assert!(masked_rows(&t.view(), 2, 2).is_err());
    }

    #[test]
    fn test_default_quantize_and_sum() {
        let backend = CpuBackend::new();
        let t = Tensor::new(vec![5.0; 64], Shape::new(vec![2, 32]));
        let q = backend.quantize(&t.view(), DType::Q8, 0, 32).unwrap();
        assert_eq!(q.dtype(), DType::Q8);
        let total = backend.sum(&q.view()).unwrap();
        assert!((total - 320.0).abs() <= 320.0 / 127.0);
    }

    #[test]
    fn test_check_rows_broadcast() {
        let dst = Shape::new(vec![3, 4]);
        let row = Tensor::zeros(DType::F32, Shape::new(vec![1, 4]));
        let full = Tensor::zeros(DType::F32, Shape::new(vec![3, 4]));
        let bad = Tensor::zeros(DType::F32, Shape::new(vec![2, 4]));
        assert!(check_rows("t", &dst, &row.view(), 0, 4).unwrap());
        assert!(!check_rows("t", &dst, &full.view(), 0, 4).unwrap());
        assert!(check_rows("t", &dst, &bad.view(), 0, 4).is_err());
        assert!(check_rows("t", &dst, &full.view(), 2, 4).is_err());
    }
}
