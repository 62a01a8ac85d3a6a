use std::fmt;
use std::str::FromStr;

use crate::error::TensorError;

/// Number of elements sharing one scale in the block-quantized encodings.
pub const BLOCK_SIZE: usize = 32;

/// Supported element encodings for tensor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit IEEE 754 half-precision float, stored as raw bits.
    F16,
    /// 16-bit brain float (f32 with a truncated mantissa), stored as raw bits.
    BF16,
    /// 8-bit block-quantized: one f32 scale per 32 signed bytes.
    Q8,
    /// 4-bit block-quantized: one f32 scale per 32 values packed into 16 bytes.
    Q4,
}

impl DType {
    pub const ALL: [DType; 5] = [DType::F32, DType::F16, DType::BF16, DType::Q8, DType::Q4];

    /// Returns the size in bytes of a single element for float types, or the
    /// number of packed data bytes per block for quantized types (scales not
    /// included).
    ///
    /// - F32: 4 bytes per element
    /// - F16 / BF16: 2 bytes per element
    /// - Q8: 32 bytes per block of 32 elements
    /// - Q4: 16 bytes per block of 32 elements
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::Q8 => BLOCK_SIZE,
            DType::Q4 => BLOCK_SIZE / 2,
        }
    }

    /// Returns the number of elements per quantization block, or 1 for
    /// float types.
    pub fn block_size(&self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::BF16 => 1,
            DType::Q8 | DType::Q4 => BLOCK_SIZE,
        }
    }

    /// Returns true if this dtype is a block-quantized format.
    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::Q8 | DType::Q4)
    }

    /// Number of blocks needed to hold `numel` elements. The final block is
    /// zero-padded when `numel` is not a multiple of the block size.
    pub fn blocks_for(&self, numel: usize) -> usize {
        numel.div_ceil(self.block_size())
    }

    /// Total bytes backing `numel` elements, including per-block scales.
    pub fn storage_bytes(&self, numel: usize) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::BF16 => numel * self.size_in_bytes(),
            DType::Q8 | DType::Q4 => {
                let blocks = self.blocks_for(numel);
                blocks * self.size_in_bytes() + blocks * std::mem::size_of::<f32>()
            }
        }
    }

    /// Returns the encoding tag used by weight files for this dtype.
    pub fn tag(&self) -> &'static str {
        match self {
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::Q8 => "I8",
            DType::Q4 => "Q4",
        }
    }
}

impl FromStr for DType {
    type Err = TensorError;

    /// Parses a weight-file encoding tag. `Q8` is accepted as an alias of
    /// `I8`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "F32" => Ok(DType::F32),
            "F16" => Ok(DType::F16),
            "BF16" => Ok(DType::BF16),
            "I8" | "Q8" => Ok(DType::Q8),
            "Q4" => Ok(DType::Q4),
            other => Err(TensorError::UnsupportedDType(other.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::Q8 => write!(f, "q8"),
            DType::Q4 => write!(f, "q4"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::Q8.size_in_bytes(), 32);
        assert_eq!(DType::Q4.size_in_bytes(), 16);
    }

    #[test]
    fn test_storage_bytes_pads_final_block() {
        assert_eq!(DType::F32.storage_bytes(10), 40);
        // 40 elements -> 2 blocks of 32 bytes + 2 f32 scales
        assert_eq!(DType::Q8.storage_bytes(40), 2 * 32 + 2 * 4);
        assert_eq!(DType::Q4.storage_bytes(64), 2 * 16 + 2 * 4);
    }

    #[test]
    fn test_tag_roundtrip() {
        for dtype in DType::ALL {
            let back: DType = dtype.tag().parse().unwrap();
            assert_eq!(dtype, back);
        }
        assert_eq!("q8".parse::<DType>().unwrap(), DType::Q8);
    }

    #[test]
    fn test_tag_unknown() {
        let err = "F64".parse::<DType>().unwrap_err();
        assert!(err.is_unsupported());
    }
}
