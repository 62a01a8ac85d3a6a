use std::sync::Arc;

use memmap2::Mmap;

use crate::codec::{self, Q4_BLOCK_BYTES};
use crate::dtype::{DType, BLOCK_SIZE};
use crate::error::{Result, TensorError};

/// Owned CPU-side tensor storage, one typed buffer per encoding.
///
/// Quantized variants keep their packed values and per-block scales in
/// separate buffers; capacity is always a whole number of blocks.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    /// 32-bit floating point storage.
    F32(Vec<f32>),
    /// IEEE half-precision bit patterns.
    F16(Vec<u16>),
    /// Brain-float bit patterns.
    BF16(Vec<u16>),
    /// 8-bit block-quantized values and their scales.
    Q8 { data: Vec<i8>, scales: Vec<f32> },
    /// 4-bit packed block-quantized values and their scales.
    Q4 { data: Vec<u8>, scales: Vec<f32> },
}

impl CpuStorage {
    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        let blocks = dtype.blocks_for(n);
        match dtype {
            DType::F32 => CpuStorage::F32(vec![0.0; n]),
            DType::F16 => CpuStorage::F16(vec![0; n]),
            DType::BF16 => CpuStorage::BF16(vec![0; n]),
            DType::Q8 => CpuStorage::Q8 {
                data: vec![0; blocks * BLOCK_SIZE],
                scales: vec![0.0; blocks],
            },
            DType::Q4 => CpuStorage::Q4 {
                data: vec![0x88; blocks * Q4_BLOCK_BYTES],
                scales: vec![0.0; blocks],
            },
        }
    }

    /// Create storage from an f32 vector.
    pub fn from_f32_vec(data: Vec<f32>) -> Self {
        CpuStorage::F32(data)
    }

    /// Encode full-precision values into `dtype`.
    pub fn encode(dtype: DType, values: &[f32]) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(values.to_vec()),
            DType::F16 => CpuStorage::F16(values.iter().map(|&v| codec::f32_to_f16(v)).collect()),
            DType::BF16 => {
                CpuStorage::BF16(values.iter().map(|&v| codec::f32_to_bf16(v)).collect())
            }
            DType::Q8 | DType::Q4 => {
                let mut storage = CpuStorage::zeros(dtype, values.len());
                storage.elements_mut().write_from(0, values);
                storage
            }
        }
    }

    /// Copies `numel` elements out of a borrowed element range.
    ///
    /// # Panics
    /// Panics if `numel` exceeds the range.
    pub fn from_elements(elems: Elements<'_>, numel: usize) -> Self {
        let blocks = elems.dtype().blocks_for(numel);
        match elems {
            Elements::F32(s) => CpuStorage::F32(s[..numel].to_vec()),
            Elements::F16(s) => CpuStorage::F16(s[..numel].to_vec()),
            Elements::BF16(s) => CpuStorage::BF16(s[..numel].to_vec()),
            Elements::Q8 { data, scales } => CpuStorage::Q8 {
                data: data[..blocks * BLOCK_SIZE].to_vec(),
                scales: scales[..blocks].to_vec(),
            },
            Elements::Q4 { data, scales } => CpuStorage::Q4 {
                data: data[..blocks * Q4_BLOCK_BYTES].to_vec(),
                scales: scales[..blocks].to_vec(),
            },
        }
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::Q8 { .. } => DType::Q8,
            CpuStorage::Q4 { .. } => DType::Q4,
        }
    }

    /// Element capacity. Quantized storage reports whole blocks.
    pub fn len(&self) -> usize {
        self.elements().len()
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by this storage, scales included.
    pub fn nbytes(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len() * 4,
            CpuStorage::F16(v) | CpuStorage::BF16(v) => v.len() * 2,
            CpuStorage::Q8 { data, scales } => data.len() + scales.len() * 4,
            CpuStorage::Q4 { data, scales } => data.len() + scales.len() * 4,
        }
    }

    /// Returns the data as an f32 slice.
    ///
    /// # Errors
    /// Returns an error if the storage is not F32.
    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v.as_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    /// Returns the data as a mutable f32 slice.
    ///
    /// # Errors
    /// Returns an error if the storage is not F32.
    pub fn as_f32_slice_mut(&mut self) -> Result<&mut [f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v.as_mut_slice()),
            other => Err(TensorError::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    pub fn elements(&self) -> Elements<'_> {
        match self {
            CpuStorage::F32(v) => Elements::F32(v),
            CpuStorage::F16(v) => Elements::F16(v),
            CpuStorage::BF16(v) => Elements::BF16(v),
            CpuStorage::Q8 { data, scales } => Elements::Q8 { data, scales },
            CpuStorage::Q4 { data, scales } => Elements::Q4 { data, scales },
        }
    }

    pub fn elements_mut(&mut self) -> ElementsMut<'_> {
        match self {
            CpuStorage::F32(v) => ElementsMut::F32(v),
            CpuStorage::F16(v) => ElementsMut::F16(v),
            CpuStorage::BF16(v) => ElementsMut::BF16(v),
            CpuStorage::Q8 { data, scales } => ElementsMut::Q8 { data, scales },
            CpuStorage::Q4 { data, scales } => ElementsMut::Q4 { data, scales },
        }
    }
}

/// Read-only tensor bytes inside a memory-mapped weight file.
///
/// Float encodings read `numel` values at `data_offset`. Quantized
/// encodings read packed blocks at `data_offset` and one little-endian f32
/// scale per block at `scales_offset`.
#[derive(Debug, Clone)]
pub struct MappedStorage {
    map: Arc<Mmap>,
    dtype: DType,
    numel: usize,
    data_offset: usize,
    scales_offset: Option<usize>,
}

impl MappedStorage {
    pub fn new(
        map: Arc<Mmap>,
        dtype: DType,
        numel: usize,
        data_offset: usize,
        scales_offset: Option<usize>,
    ) -> Result<Self> {
        if dtype.is_quantized() != scales_offset.is_some() {
            return Err(TensorError::InvalidShape(format!(
                "{} mapping {} a scales region",
                dtype,
                if dtype.is_quantized() { "requires" } else { "does not take" }
            )));
        }
        let storage = MappedStorage {
            map,
            dtype,
            numel,
            data_offset,
            scales_offset,
        };
        // Validate ranges and alignment once so that `elements` cannot fail.
        let (data, scales) = storage.regions()?;
        match dtype {
            DType::F32 => typed::<f32>(data).map(|_| ())?,
            DType::F16 | DType::BF16 => typed::<u16>(data).map(|_| ())?,
            DType::Q8 | DType::Q4 => {}
        }
        if let Some(scales) = scales {
            typed::<f32>(scales)?;
        }
        Ok(storage)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel)
    }

    fn regions(&self) -> Result<(&[u8], Option<&[u8]>)> {
        let blocks = self.dtype.blocks_for(self.numel);
        let data_len = match self.dtype {
            DType::F32 | DType::F16 | DType::BF16 => self.numel * self.dtype.size_in_bytes(),
            DType::Q8 | DType::Q4 => blocks * self.dtype.size_in_bytes(),
        };
        let data = region(&self.map, self.data_offset, data_len)?;
        let scales = match self.scales_offset {
            Some(offset) => Some(region(&self.map, offset, blocks * 4)?),
            None => None,
        };
        Ok((data, scales))
    }

    pub fn elements(&self) -> Elements<'_> {
        let blocks = self.dtype.blocks_for(self.numel);
        let data_len = match self.dtype {
            DType::F32 | DType::F16 | DType::BF16 => self.numel * self.dtype.size_in_bytes(),
            DType::Q8 | DType::Q4 => blocks * self.dtype.size_in_bytes(),
        };
        let data = &self.map[self.data_offset..self.data_offset + data_len];
        let scales = self
            .scales_offset
            .map(|offset| bytemuck::cast_slice::<u8, f32>(&self.map[offset..offset + blocks * 4]))
            .unwrap_or(&[]);
        match self.dtype {
            DType::F32 => Elements::F32(bytemuck::cast_slice(data)),
            DType::F16 => Elements::F16(bytemuck::cast_slice(data)),
            DType::BF16 => Elements::BF16(bytemuck::cast_slice(data)),
            DType::Q8 => Elements::Q8 {
                data: bytemuck::cast_slice(data),
                scales,
            },
            DType::Q4 => Elements::Q4 { data, scales },
        }
    }
}

fn region(map: &Mmap, offset: usize, len: usize) -> Result<&[u8]> {
    map.get(offset..offset + len).ok_or_else(|| {
        TensorError::InvalidShape(format!(
            "mapped region [{}, {}) exceeds file of {} bytes",
            offset,
            offset + len,
            map.len()
        ))
    })
}

fn typed<T: bytemuck::Pod>(bytes: &[u8]) -> Result<&[T]> {
    bytemuck::try_cast_slice(bytes)
        .map_err(|e| TensorError::InvalidShape(format!("mapped region: {}", e)))
}

/// Backing storage of a [`crate::Tensor`].
#[derive(Debug, Clone)]
pub enum Storage {
    /// Exclusively owned, mutable.
    Owned(CpuStorage),
    /// Decoded weights shared read-only between tensors and threads.
    Shared(Arc<CpuStorage>),
    /// Read-only region of a memory-mapped file.
    Mapped(MappedStorage),
}

impl Storage {
    pub fn dtype(&self) -> DType {
        match self {
            Storage::Owned(s) => s.dtype(),
            Storage::Shared(s) => s.dtype(),
            Storage::Mapped(m) => m.dtype(),
        }
    }

    pub fn nbytes(&self) -> usize {
        match self {
            Storage::Owned(s) => s.nbytes(),
            Storage::Shared(s) => s.nbytes(),
            Storage::Mapped(m) => m.nbytes(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        !matches!(self, Storage::Owned(_))
    }

    pub fn elements(&self) -> Elements<'_> {
        match self {
            Storage::Owned(s) => s.elements(),
            Storage::Shared(s) => s.elements(),
            Storage::Mapped(m) => m.elements(),
        }
    }

    /// Mutable access, rejected for shared and mapped storage.
    pub fn elements_mut(&mut self) -> Result<ElementsMut<'_>> {
        match self {
            Storage::Owned(s) => Ok(s.elements_mut()),
            Storage::Shared(_) => Err(TensorError::ReadOnly("shared weight storage".to_string())),
            Storage::Mapped(_) => Err(TensorError::ReadOnly("memory-mapped storage".to_string())),
        }
    }
}

/// Borrowed, read-only elements of one encoding.
#[derive(Debug, Clone, Copy)]
pub enum Elements<'a> {
    F32(&'a [f32]),
    F16(&'a [u16]),
    BF16(&'a [u16]),
    Q8 { data: &'a [i8], scales: &'a [f32] },
    Q4 { data: &'a [u8], scales: &'a [f32] },
}

impl<'a> Elements<'a> {
    pub fn dtype(&self) -> DType {
        match self {
            Elements::F32(_) => DType::F32,
            Elements::F16(_) => DType::F16,
            Elements::BF16(_) => DType::BF16,
            Elements::Q8 { .. } => DType::Q8,
            Elements::Q4 { .. } => DType::Q4,
        }
    }

    /// Element capacity of the range.
    pub fn len(&self) -> usize {
        match self {
            Elements::F32(s) => s.len(),
            Elements::F16(s) | Elements::BF16(s) => s.len(),
            Elements::Q8 { data, .. } => data.len(),
            Elements::Q4 { data, .. } => data.len() * 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full-precision value of element `i`.
    #[inline]
    pub fn get(&self, i: usize) -> f32 {
        match self {
            Elements::F32(s) => s[i],
            Elements::F16(s) => codec::f16_to_f32(s[i]),
            Elements::BF16(s) => codec::bf16_to_f32(s[i]),
            Elements::Q8 { data, scales } => data[i] as f32 * scales[i / BLOCK_SIZE],
            Elements::Q4 { data, scales } => codec::q4_get(data, i) as f32 * scales[i / BLOCK_SIZE],
        }
    }

    /// Sub-range `[start, start + len)`. Quantized ranges must start on a
    /// block boundary.
    ///
    /// # Panics
    /// Panics if the range escapes this one.
    pub fn slice(&self, start: usize, len: usize) -> Result<Elements<'a>> {
        check_range(start, len, self.len());
        let block_end = |start: usize| (start + len).div_ceil(BLOCK_SIZE);
        Ok(match *self {
            Elements::F32(s) => Elements::F32(&s[start..start + len]),
            Elements::F16(s) => Elements::F16(&s[start..start + len]),
            Elements::BF16(s) => Elements::BF16(&s[start..start + len]),
            Elements::Q8 { data, scales } => {
                check_block_aligned(start)?;
                let (b0, b1) = (start / BLOCK_SIZE, block_end(start));
                Elements::Q8 {
                    data: &data[b0 * BLOCK_SIZE..b1 * BLOCK_SIZE],
                    scales: &scales[b0..b1],
                }
            }
            Elements::Q4 { data, scales } => {
                check_block_aligned(start)?;
                let (b0, b1) = (start / BLOCK_SIZE, block_end(start));
                Elements::Q4 {
                    data: &data[b0 * Q4_BLOCK_BYTES..b1 * Q4_BLOCK_BYTES],
                    scales: &scales[b0..b1],
                }
            }
        })
    }

    /// Decodes `out.len()` elements starting at `start` into `out`.
    pub fn read_into(&self, start: usize, out: &mut [f32]) {
        let end = start + out.len();
        match self {
            Elements::F32(s) => out.copy_from_slice(&s[start..end]),
            Elements::F16(s) => {
                for (o, &b) in out.iter_mut().zip(&s[start..end]) {
                    *o = codec::f16_to_f32(b);
                }
            }
            Elements::BF16(s) => {
                for (o, &b) in out.iter_mut().zip(&s[start..end]) {
                    *o = codec::bf16_to_f32(b);
                }
            }
            Elements::Q8 { .. } | Elements::Q4 { .. } => {
                for (i, o) in out.iter_mut().enumerate() {
                    *o = self.get(start + i);
                }
            }
        }
    }

    pub fn to_f32_vec(&self, start: usize, len: usize) -> Vec<f32> {
        let mut out = vec![0.0; len];
        self.read_into(start, &mut out);
        out
    }
}

/// Borrowed, mutable elements of one encoding.
#[derive(Debug)]
pub enum ElementsMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [u16]),
    BF16(&'a mut [u16]),
    Q8 { data: &'a mut [i8], scales: &'a mut [f32] },
    Q4 { data: &'a mut [u8], scales: &'a mut [f32] },
}

impl<'a> ElementsMut<'a> {
    pub fn dtype(&self) -> DType {
        self.as_elements().dtype()
    }

    pub fn len(&self) -> usize {
        self.as_elements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_elements(&self) -> Elements<'_> {
        match self {
            ElementsMut::F32(s) => Elements::F32(s),
            ElementsMut::F16(s) => Elements::F16(s),
            ElementsMut::BF16(s) => Elements::BF16(s),
            ElementsMut::Q8 { data, scales } => Elements::Q8 { data, scales },
            ElementsMut::Q4 { data, scales } => Elements::Q4 { data, scales },
        }
    }

    pub fn reborrow(&mut self) -> ElementsMut<'_> {
        match self {
            ElementsMut::F32(s) => ElementsMut::F32(s),
            ElementsMut::F16(s) => ElementsMut::F16(s),
            ElementsMut::BF16(s) => ElementsMut::BF16(s),
            ElementsMut::Q8 { data, scales } => ElementsMut::Q8 { data, scales },
            ElementsMut::Q4 { data, scales } => ElementsMut::Q4 { data, scales },
        }
    }

    #[inline]
    pub fn get(&self, i: usize) -> f32 {
        self.as_elements().get(i)
    }

    /// Stores `value` at element `i`. Quantized encodings requantize the
    /// containing block, which may shift its other values by up to one step.
    pub fn set(&mut self, i: usize, value: f32) {
        self.write_from(i, &[value]);
    }

    /// Encodes `src` into elements `[start, start + src.len())`.
    pub fn write_from(&mut self, start: usize, src: &[f32]) {
        let end = start + src.len();
        check_range(start, src.len(), self.len());
        if self.dtype().is_quantized() {
            self.write_blocks(start, src);
            return;
        }
        match self {
            ElementsMut::F32(s) => s[start..end].copy_from_slice(src),
            ElementsMut::F16(s) => {
                for (d, &v) in s[start..end].iter_mut().zip(src) {
                    *d = codec::f32_to_f16(v);
                }
            }
            ElementsMut::BF16(s) => {
                for (d, &v) in s[start..end].iter_mut().zip(src) {
                    *d = codec::f32_to_bf16(v);
                }
            }
            ElementsMut::Q8 { .. } | ElementsMut::Q4 { .. } => {}
        }
    }

    // Read-modify-write of every block the range touches.
    fn write_blocks(&mut self, start: usize, src: &[f32]) {
        if src.is_empty() {
            return;
        }
        let end = start + src.len();
        let mut block = [0.0f32; BLOCK_SIZE];
        for b in start / BLOCK_SIZE..end.div_ceil(BLOCK_SIZE) {
            let base = b * BLOCK_SIZE;
            self.as_elements().read_into(base, &mut block);
            for (j, v) in block.iter_mut().enumerate() {
                let i = base + j;
                if i >= start && i < end {
                    *v = src[i - start];
                }
            }
            self.encode_block(b, &block);
        }
    }

    fn encode_block(&mut self, b: usize, values: &[f32; BLOCK_SIZE]) {
        match self {
            ElementsMut::Q8 { data, scales } => codec::quantize_q8(
                values,
                &mut data[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE],
                &mut scales[b..b + 1],
            ),
            ElementsMut::Q4 { data, scales } => codec::quantize_q4(
                values,
                &mut data[b * Q4_BLOCK_BYTES..(b + 1) * Q4_BLOCK_BYTES],
                &mut scales[b..b + 1],
            ),
            _ => unreachable!("encode_block on a float encoding"),
        }
    }

    /// Copies raw encoded elements from `src` without decoding. Both sides
    /// must share an encoding. Quantized copies move whole blocks, so both
    /// offsets and `len` must be multiples of the block size.
    pub fn copy_raw_from(
        &mut self,
        dst_offset: usize,
        src: Elements<'_>,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        if src.dtype() != self.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype(),
                got: src.dtype(),
            });
        }
        check_range(dst_offset, len, self.len());
        check_range(src_offset, len, src.len());
        match (self, src) {
            (ElementsMut::F32(d), Elements::F32(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (ElementsMut::F16(d), Elements::F16(s)) | (ElementsMut::BF16(d), Elements::BF16(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (ElementsMut::Q8 { data, scales }, Elements::Q8 { data: sd, scales: ss }) => {
                let (d0, s0, blocks) = block_span(dst_offset, src_offset, len)?;
                data[d0 * BLOCK_SIZE..(d0 + blocks) * BLOCK_SIZE]
                    .copy_from_slice(&sd[s0 * BLOCK_SIZE..(s0 + blocks) * BLOCK_SIZE]);
                scales[d0..d0 + blocks].copy_from_slice(&ss[s0..s0 + blocks]);
            }
            (ElementsMut::Q4 { data, scales }, Elements::Q4 { data: sd, scales: ss }) => {
                let (d0, s0, blocks) = block_span(dst_offset, src_offset, len)?;
                data[d0 * Q4_BLOCK_BYTES..(d0 + blocks) * Q4_BLOCK_BYTES]
                    .copy_from_slice(&sd[s0 * Q4_BLOCK_BYTES..(s0 + blocks) * Q4_BLOCK_BYTES]);
                scales[d0..d0 + blocks].copy_from_slice(&ss[s0..s0 + blocks]);
            }
            _ => unreachable!("dtypes checked above"),
        }
        Ok(())
    }

    /// Narrows to `[start, start + len)`, consuming the borrow.
    ///
    /// A quantized range must start on a block and own its final block: it
    /// ends on a block boundary or at the end of this range.
    pub fn into_slice(self, start: usize, len: usize) -> Result<ElementsMut<'a>> {
        check_range(start, len, self.len());
        let block_end = (start + len).div_ceil(BLOCK_SIZE);
        if self.dtype().is_quantized() && block_end * BLOCK_SIZE != self.len() {
            check_block_aligned(start + len)?;
        }
        Ok(match self {
            ElementsMut::F32(s) => ElementsMut::F32(&mut s[start..start + len]),
            ElementsMut::F16(s) => ElementsMut::F16(&mut s[start..start + len]),
            ElementsMut::BF16(s) => ElementsMut::BF16(&mut s[start..start + len]),
            ElementsMut::Q8 { data, scales } => {
                check_block_aligned(start)?;
                let b0 = start / BLOCK_SIZE;
                ElementsMut::Q8 {
                    data: &mut data[b0 * BLOCK_SIZE..block_end * BLOCK_SIZE],
                    scales: &mut scales[b0..block_end],
                }
            }
            ElementsMut::Q4 { data, scales } => {
                check_block_aligned(start)?;
                let b0 = start / BLOCK_SIZE;
                ElementsMut::Q4 {
                    data: &mut data[b0 * Q4_BLOCK_BYTES..block_end * Q4_BLOCK_BYTES],
                    scales: &mut scales[b0..block_end],
                }
            }
        })
    }

    /// Splits into `[0, mid)` and `[mid, len)`.
    pub fn split_at(self, mid: usize) -> Result<(ElementsMut<'a>, ElementsMut<'a>)> {
        check_range(0, mid, self.len());
        Ok(match self {
            ElementsMut::F32(s) => {
                let (a, b) = s.split_at_mut(mid);
                (ElementsMut::F32(a), ElementsMut::F32(b))
            }
            ElementsMut::F16(s) => {
                let (a, b) = s.split_at_mut(mid);
                (ElementsMut::F16(a), ElementsMut::F16(b))
            }
            ElementsMut::BF16(s) => {
                let (a, b) = s.split_at_mut(mid);
                (ElementsMut::BF16(a), ElementsMut::BF16(b))
            }
            ElementsMut::Q8 { data, scales } => {
                check_block_aligned(mid)?;
                let (da, db) = data.split_at_mut(mid);
                let (sa, sb) = scales.split_at_mut(mid / BLOCK_SIZE);
                (
                    ElementsMut::Q8 { data: da, scales: sa },
                    ElementsMut::Q8 { data: db, scales: sb },
                )
            }
            ElementsMut::Q4 { data, scales } => {
                check_block_aligned(mid)?;
                let (da, db) = data.split_at_mut(mid / 2);
                let (sa, sb) = scales.split_at_mut(mid / BLOCK_SIZE);
                (
                    ElementsMut::Q4 { data: da, scales: sa },
                    ElementsMut::Q4 { data: db, scales: sb },
                )
            }
        })
    }

    pub fn fill_zero(&mut self) {
        match self {
            ElementsMut::F32(s) => s.fill(0.0),
            ElementsMut::F16(s) | ElementsMut::BF16(s) => s.fill(0),
            ElementsMut::Q8 { data, scales } => {
                data.fill(0);
                scales.fill(0.0);
            }
            ElementsMut::Q4 { data, scales } => {
                data.fill(0x88);
                scales.fill(0.0);
            }
        }
    }
}

/// Views must stay inside the storage they borrow from.
fn check_range(start: usize, len: usize, capacity: usize) {
    assert!(
        start + len <= capacity,
        "range [{}, {}) escapes storage of {} elements",
        start,
        start + len,
        capacity
    );
}

fn check_block_aligned(offset: usize) -> Result<()> {
    if offset % BLOCK_SIZE != 0 {
        return Err(TensorError::BlockMisaligned {
            offset,
            block_size: BLOCK_SIZE,
        });
    }
    Ok(())
}

fn block_span(dst_offset: usize, src_offset: usize, len: usize) -> Result<(usize, usize, usize)> {
    check_block_aligned(dst_offset)?;
    check_block_aligned(src_offset)?;
    check_block_aligned(dst_offset + len)?;
    Ok((dst_offset / BLOCK_SIZE, src_offset / BLOCK_SIZE, len / BLOCK_SIZE))
}
