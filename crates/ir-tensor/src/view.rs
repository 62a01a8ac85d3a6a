use tracing::debug;

use crate::dtype::{DType, BLOCK_SIZE};
use crate::error::{Result, TensorError};
use crate::shape::{offset_with_strides, Shape};
use crate::storage::{CpuStorage, Elements, ElementsMut};
use crate::tensor::Tensor;

/// Read-only view over a tensor's storage.
///
/// Slicing a view along its leading dimension never copies. Transposed
/// float views share storage with their owner and carry permuted strides.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    shape: Shape,
    strides: Vec<usize>,
    elems: Elements<'a>,
}

impl<'a> TensorView<'a> {
    /// Contiguous view of `shape` over `elems`.
    ///
    /// # Panics
    /// Panics if `elems` holds fewer than `shape.numel()` elements.
    pub fn new(shape: Shape, elems: Elements<'a>) -> Self {
        assert!(
            elems.len() >= shape.numel(),
            "view of shape {} needs {} elements, storage holds {}",
            shape,
            shape.numel(),
            elems.len()
        );
        let strides = shape.strides().to_vec();
        TensorView {
            shape,
            strides,
            elems,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.elems.dtype()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn is_contiguous(&self) -> bool {
        self.shape.is_contiguous(&self.strides)
    }

    /// Underlying elements, starting at this view's first element.
    pub fn elements(&self) -> Elements<'a> {
        self.elems
    }

    /// Underlying elements, rejecting strided views.
    pub fn contiguous_elements(&self) -> Result<Elements<'a>> {
        if !self.is_contiguous() {
            return Err(TensorError::NotContiguous(format!(
                "view {} with strides {:?}",
                self.shape, self.strides
            )));
        }
        Ok(self.elems)
    }

    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        let offset = offset_with_strides(self.shape.dims(), &self.strides, indices)?;
        Ok(self.elems.get(offset))
    }

    /// Sub-view at index `i` of the leading dimension.
    pub fn slice(&self, i: usize) -> Result<TensorView<'a>> {
        self.slice_at(&[i])
    }

    /// Sub-view addressed by fixing the leading `indices.len()` dimensions.
    pub fn slice_at(&self, indices: &[usize]) -> Result<TensorView<'a>> {
        let elems = self.contiguous_elements()?;
        let sub = self.shape.slice(indices.len())?;
        let mut start = 0;
        for (dim, &index) in indices.iter().enumerate() {
            let size = self.shape.dim(dim);
            if index >= size {
                return Err(TensorError::IndexOutOfRange { index, dim, size });
            }
            start += index * self.strides[dim];
        }
        let elems = elems.slice(start, sub.numel())?;
        Ok(TensorView::new(sub, elems))
    }

    /// Rows `[start, start + count)` of the leading dimension.
    pub fn narrow(&self, start: usize, count: usize) -> Result<TensorView<'a>> {
        let elems = self.contiguous_elements()?;
        let first = self.shape.first();
        if count == 0 || start + count > first {
            return Err(TensorError::IndexOutOfRange {
                index: start + count,
                dim: 0,
                size: first,
            });
        }
        let shape = self.shape.with_dim(0, count)?;
        let elems = elems.slice(start * self.strides[0], shape.numel())?;
        Ok(TensorView::new(shape, elems))
    }

    /// Reinterprets a contiguous view with a new shape of equal size.
    pub fn reshape(&self, shape: Shape) -> Result<TensorView<'a>> {
        if shape.numel() != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: shape.dims().to_vec(),
            });
        }
        Ok(TensorView::new(shape, self.contiguous_elements()?))
    }

    /// Permutes the axes of a float view without copying.
    ///
    /// Quantized views cannot be strided; use [`Tensor::transpose`], which
    /// materializes them.
    pub fn transpose(&self, perm: &[usize]) -> Result<TensorView<'a>> {
        if self.dtype().is_quantized() {
            return Err(TensorError::UnsupportedDType(format!(
                "strided {} view; transpose the owning tensor instead",
                self.dtype()
            )));
        }
        let (shape, _) = self.shape.permute(perm)?;
        let strides = perm.iter().map(|&a| self.strides[a]).collect();
        Ok(TensorView {
            shape,
            strides,
            elems: self.elems,
        })
    }

    /// Decodes every element in logical row-major order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        if self.is_contiguous() {
            return self.elems.to_f32_vec(0, self.numel());
        }
        let mut out = Vec::with_capacity(self.numel());
        let mut cursor = vec![0; self.shape.ndim()];
        loop {
            let offset: usize = cursor
                .iter()
                .zip(&self.strides)
                .map(|(i, s)| i * s)
                .sum();
            out.push(self.elems.get(offset));
            if !self.shape.advance(&mut cursor) {
                break;
            }
        }
        out
    }

    /// Copies the view into a new owned, contiguous tensor of the same
    /// encoding.
    pub fn to_tensor(&self) -> Tensor {
        let storage = if self.is_contiguous() {
            CpuStorage::from_elements(self.elems, self.numel())
        } else {
            // Strided views are always float encodings, which round-trip
            // through f32 exactly.
            CpuStorage::encode(self.dtype(), &self.to_f32_vec())
        };
        Tensor::from_parts(storage, self.shape.clone())
    }
}

/// Mutable, always contiguous view over an owned tensor.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    shape: Shape,
    elems: ElementsMut<'a>,
}

impl<'a> TensorViewMut<'a> {
    /// # Panics
    /// Panics if `elems` holds fewer than `shape.numel()` elements.
    pub fn new(shape: Shape, elems: ElementsMut<'a>) -> Self {
        assert!(
            elems.len() >= shape.numel(),
            "view of shape {} needs {} elements, storage holds {}",
            shape,
            shape.numel(),
            elems.len()
        );
        TensorViewMut { shape, elems }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.elems.dtype()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn elements(&self) -> Elements<'_> {
        self.elems.as_elements()
    }

    pub fn elements_mut(&mut self) -> ElementsMut<'_> {
        self.elems.reborrow()
    }

    /// Read-only view of the same elements.
    pub fn as_view(&self) -> TensorView<'_> {
        TensorView::new(self.shape.clone(), self.elems.as_elements())
    }

    /// Shorter-lived mutable view of the same elements.
    pub fn reborrow(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            shape: self.shape.clone(),
            elems: self.elems.reborrow(),
        }
    }

    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        let offset = self.shape.offset_of(indices)?;
        Ok(self.elems.get(offset))
    }

    pub fn set(&mut self, value: f32, indices: &[usize]) -> Result<()> {
        let offset = self.shape.offset_of(indices)?;
        self.elems.set(offset, value);
        Ok(())
    }

    /// Mutable sub-view at index `i` of the leading dimension.
    pub fn slice_mut(&mut self, i: usize) -> Result<TensorViewMut<'_>> {
        self.reborrow().into_slice(i)
    }

    /// Like [`TensorViewMut::slice_mut`], consuming this view.
    pub fn into_slice(self, i: usize) -> Result<TensorViewMut<'a>> {
        let first = self.shape.first();
        if i >= first {
            return Err(TensorError::IndexOutOfRange {
                index: i,
                dim: 0,
                size: first,
            });
        }
        let sub = self.shape.slice(1)?;
        let len = sub.numel();
        let elems = self.elems.into_slice(i * len, len)?;
        Ok(TensorViewMut::new(sub, elems))
    }

    /// Splits into disjoint views of each index of the leading dimension.
    pub fn into_rows(self) -> Result<Vec<TensorViewMut<'a>>> {
        let sub = self.shape.slice(1)?;
        let len = sub.numel();
        let mut rows = Vec::with_capacity(self.shape.first());
        let mut rest = self.elems;
        for i in 0..self.shape.first() {
            if i + 1 == self.shape.first() {
                rows.push(TensorViewMut::new(sub.clone(), rest));
                break;
            }
            let (row, tail) = rest.split_at(len)?;
            rows.push(TensorViewMut::new(sub.clone(), row));
            rest = tail;
        }
        Ok(rows)
    }

    /// Copies `length` raw elements of `src` starting at `src_offset` into
    /// this view at `dst_offset`. Both must share an encoding.
    ///
    /// Quantized copies move whole blocks: offsets must be block aligned,
    /// and `length` must be a whole number of blocks unless both windows end
    /// at the last element of their tensors.
    pub fn copy_from(
        &mut self,
        src: &TensorView<'_>,
        src_offset: usize,
        dst_offset: usize,
        length: usize,
    ) -> Result<()> {
        check_window(self.numel(), dst_offset, length)?;
        check_window(src.numel(), src_offset, length)?;
        let mut raw_len = length;
        if self.dtype().is_quantized()
            && dst_offset + length == self.numel()
            && src_offset + length == src.numel()
        {
            // Only padding follows the last element of a final block.
            raw_len = length.next_multiple_of(BLOCK_SIZE);
        }
        self.elems
            .copy_raw_from(dst_offset, src.contiguous_elements()?, src_offset, raw_len)
    }

    pub fn fill_zero(&mut self) {
        self.elems.fill_zero();
    }
}

fn check_window(numel: usize, offset: usize, length: usize) -> Result<()> {
    if offset + length > numel {
        return Err(TensorError::IndexOutOfRange {
            index: offset + length,
            dim: 0,
            size: numel,
        });
    }
    Ok(())
}

/// Result of transposing a tensor: a strided view for float encodings, a
/// freshly encoded tensor for quantized ones.
#[derive(Debug)]
pub enum Transposed<'a> {
    View(TensorView<'a>),
    Owned(Tensor),
}

impl Transposed<'_> {
    pub fn view(&self) -> TensorView<'_> {
        match self {
            Transposed::View(v) => v.clone(),
            Transposed::Owned(t) => t.view(),
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, Transposed::Owned(_))
    }

    /// Converts into an owned contiguous tensor, copying if still a view.
    pub fn into_tensor(self) -> Tensor {
        match self {
            Transposed::View(v) => v.to_tensor(),
            Transposed::Owned(t) => t,
        }
    }
}

/// Dequantizes, transposes and re-encodes a block-quantized tensor.
pub(crate) fn transpose_quantized(tensor: &Tensor, perm: &[usize]) -> Result<Tensor> {
    let view = tensor.view();
    let values = view.to_f32_vec();
    let as_f32 = Tensor::new(values, tensor.shape().clone());
    let transposed = as_f32.view().transpose(perm)?;
    debug!(
        dtype = %tensor.dtype(),
        shape = %tensor.shape(),
        "materializing quantized transpose"
    );
    Ok(Tensor::from_parts(
        CpuStorage::encode(tensor.dtype(), &transposed.to_f32_vec()),
        transposed.shape().clone(),
    ))
}
