use std::sync::Arc;

use memmap2::Mmap;

use crate::backend::{BatchWindow, ComputeBackend};
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::{CpuStorage, Elements, MappedStorage, Storage};
use crate::view::{transpose_quantized, TensorView, TensorViewMut, Transposed};

/// An n-dimensional tensor owning (or sharing) its storage.
///
/// Storage is contiguous and row-major in one of the [`DType`] encodings.
/// Shared and memory-mapped tensors are read-only; every mutating method
/// returns [`TensorError::ReadOnly`] for them. Compute operations are
/// dispatched to a [`ComputeBackend`] over [`TensorView`]s.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    /// Create a new F32 tensor from data and a shape.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`.
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {:?} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        Tensor::from_parts(CpuStorage::from_f32_vec(data), shape)
    }

    /// Create a zero-filled tensor of `dtype`.
    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        Tensor::from_parts(CpuStorage::zeros(dtype, shape.numel()), shape)
    }

    /// Create an F32 tensor filled with ones.
    pub fn ones(shape: Shape) -> Self {
        let n = shape.numel();
        Tensor::new(vec![1.0; n], shape)
    }

    /// Encode full-precision `values` into a tensor of `dtype`.
    pub fn from_values(dtype: DType, shape: Shape, values: &[f32]) -> Result<Self> {
        if values.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![values.len()],
            });
        }
        Ok(Tensor::from_parts(CpuStorage::encode(dtype, values), shape))
    }

    /// Wrap existing storage, checking that it holds exactly `shape`.
    pub fn from_storage(storage: CpuStorage, shape: Shape) -> Result<Self> {
        let dtype = storage.dtype();
        let expected = dtype.blocks_for(shape.numel()) * dtype.block_size();
        if storage.len() != expected {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![storage.len()],
            });
        }
        Ok(Tensor::from_parts(storage, shape))
    }

    /// Read-only tensor over a region of a memory-mapped weight file.
    ///
    /// See [`MappedStorage`] for the expected layout.
    pub fn from_mapped(
        map: Arc<Mmap>,
        dtype: DType,
        shape: Shape,
        data_offset: usize,
        scales_offset: Option<usize>,
    ) -> Result<Self> {
        let mapped = MappedStorage::new(map, dtype, shape.numel(), data_offset, scales_offset)?;
        Ok(Tensor {
            storage: Storage::Mapped(mapped),
            shape,
        })
    }

    pub(crate) fn from_parts(storage: CpuStorage, shape: Shape) -> Self {
        Tensor {
            storage: Storage::Owned(storage),
            shape,
        }
    }

    /// Converts owned storage into reference-counted read-only storage, so
    /// that clones share one buffer across threads.
    pub fn into_shared(self) -> Tensor {
        let storage = match self.storage {
            Storage::Owned(s) => Storage::Shared(Arc::new(s)),
            other => other,
        };
        Tensor {
            storage,
            shape: self.shape,
        }
    }

    /// Takes the owned storage back out, if there is any.
    pub fn into_owned_storage(self) -> Option<CpuStorage> {
        match self.storage {
            Storage::Owned(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's element encoding.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Bytes of backing storage, including quantization scales.
    pub fn nbytes(&self) -> usize {
        self.storage.nbytes()
    }

    pub fn is_read_only(&self) -> bool {
        self.storage.is_read_only()
    }

    /// Returns the underlying storage reference.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns the data as an f32 slice.
    ///
    /// # Errors
    /// Returns an error if the tensor is not F32.
    pub fn data_f32(&self) -> Result<&[f32]> {
        match self.storage.elements() {
            Elements::F32(s) => Ok(&s[..self.numel()]),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    pub fn view(&self) -> TensorView<'_> {
        TensorView::new(self.shape.clone(), self.storage.elements())
    }

    pub fn view_mut(&mut self) -> Result<TensorViewMut<'_>> {
        let shape = self.shape.clone();
        Ok(TensorViewMut::new(shape, self.storage.elements_mut()?))
    }

    pub fn get(&self, indices: &[usize]) -> Result<f32> {
        let offset = self.shape.offset_of(indices)?;
        Ok(self.storage.elements().get(offset))
    }

    /// Stores `value` at `indices`. Quantized tensors requantize the
    /// containing block.
    pub fn set(&mut self, value: f32, indices: &[usize]) -> Result<()> {
        let offset = self.shape.offset_of(indices)?;
        self.storage.elements_mut()?.set(offset, value);
        Ok(())
    }

    /// View of index `i` along the leading dimension.
    pub fn slice(&self, i: usize) -> Result<TensorView<'_>> {
        self.view().slice(i)
    }

    /// View addressed by fixing the leading `indices.len()` dimensions.
    pub fn slice_at(&self, indices: &[usize]) -> Result<TensorView<'_>> {
        self.view().slice_at(indices)
    }

    pub fn slice_mut(&mut self, i: usize) -> Result<TensorViewMut<'_>> {
        self.view_mut()?.into_slice(i)
    }

    /// Permutes axes. Float tensors return a strided view; quantized
    /// tensors are dequantized, transposed and re-encoded.
    pub fn transpose(&self, perm: &[usize]) -> Result<Transposed<'_>> {
        if self.dtype().is_quantized() {
            return transpose_quantized(self, perm).map(Transposed::Owned);
        }
        self.view().transpose(perm).map(Transposed::View)
    }

    /// Reshape the tensor, keeping its storage.
    ///
    /// The total number of elements must remain the same.
    pub fn reshape(self, new_shape: Shape) -> Result<Tensor> {
        if self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            storage: self.storage,
            shape: new_shape,
        })
    }

    /// Splits into `num_chunks` equal owned tensors along `dim`.
    ///
    /// Quantized tensors can only be split along dimension 0, and each
    /// chunk must start on a block boundary.
    pub fn split(&self, num_chunks: usize, dim: usize) -> Result<Vec<Tensor>> {
        let chunk = self.chunk_len(num_chunks, dim)?;
        if dim == 0 {
            return Ok(self
                .split_views(num_chunks)?
                .iter()
                .map(TensorView::to_tensor)
                .collect());
        }
        if self.dtype().is_quantized() {
            return Err(TensorError::UnsupportedDType(format!(
                "split of {} along dimension {}",
                self.dtype(),
                dim
            )));
        }

        let shape = self.shape.with_dim(dim, chunk)?;
        let view = self.view();
        let mut parts = Vec::with_capacity(num_chunks);
        for c in 0..num_chunks {
            let mut values = Vec::with_capacity(shape.numel());
            let mut cursor = vec![0; shape.ndim()];
            loop {
                let mut source = cursor.clone();
                source[dim] += c * chunk;
                values.push(view.get(&source)?);
                if !shape.advance(&mut cursor) {
                    break;
                }
            }
            parts.push(Tensor::from_values(self.dtype(), shape.clone(), &values)?);
        }
        Ok(parts)
    }

    /// Splits into `num_chunks` zero-copy views along dimension 0.
    pub fn split_views(&self, num_chunks: usize) -> Result<Vec<TensorView<'_>>> {
        let chunk = self.chunk_len(num_chunks, 0)?;
        let view = self.view();
        (0..num_chunks)
            .map(|c| view.narrow(c * chunk, chunk))
            .collect()
    }

    fn chunk_len(&self, num_chunks: usize, dim: usize) -> Result<usize> {
        if dim >= self.shape.ndim() {
            return Err(TensorError::InvalidAxis {
                axis: dim,
                ndim: self.shape.ndim(),
            });
        }
        let size = self.shape.dim(dim);
        if num_chunks == 0 || size % num_chunks != 0 {
            return Err(TensorError::InvalidShape(format!(
                "dimension {} of size {} does not split into {} chunks",
                dim, size, num_chunks
            )));
        }
        Ok(size / num_chunks)
    }

    /// Copies `length` raw elements of `src` into this tensor.
    pub fn copy_from(
        &mut self,
        src: &TensorView<'_>,
        src_offset: usize,
        dst_offset: usize,
        length: usize,
    ) -> Result<()> {
        self.view_mut()?
            .copy_from(src, src_offset, dst_offset, length)
    }

    /// Zeroes every element.
    pub fn clear(&mut self) -> Result<()> {
        self.storage.elements_mut()?.fill_zero();
        Ok(())
    }

    /// Converts the whole tensor to `dtype`, returning a new owned tensor.
    pub fn quantize(&self, dtype: DType) -> Result<Tensor> {
        if dtype == self.dtype() {
            return Ok(self.view().to_tensor());
        }
        Tensor::from_values(dtype, self.shape.clone(), &self.to_f32_vec())
    }

    /// Decodes every element to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.view().to_f32_vec()
    }

    /// Matrix multiplication of two 2D tensors using the given backend.
    ///
    /// self is [m, k], other is [k, n], result is an F32 [m, n].
    pub fn matmul(&self, other: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        if self.shape.ndim() != 2 || other.shape.ndim() != 2 {
            return Err(TensorError::InvalidShape(
                "matmul requires 2D tensors".to_string(),
            ));
        }

        let (m, k) = (self.shape.dim(0), self.shape.dim(1));
        let (k2, n) = (other.shape.dim(0), other.shape.dim(1));
        if k != k2 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![k, n],
                got: vec![k2, n],
            });
        }

        // Rows of `b` are the columns of `other`.
        let b = other.transpose(&[1, 0])?.into_tensor();
        let mut out = Tensor::zeros(DType::F32, Shape::new(vec![m, n]));
        backend.batch_dot_product(
            &mut out.view_mut()?,
            &self.view(),
            &b.view(),
            BatchWindow::full(k, n),
        )?;
        Ok(out)
    }
}
