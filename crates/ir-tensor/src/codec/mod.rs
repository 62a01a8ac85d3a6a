//! Pure conversion routines between full-precision values and the compact
//! encodings.

pub mod block;
pub mod float;

pub use block::{
    dequantize_q4, dequantize_q8, q4_get, q4_set, quantize_q4, quantize_q8, Q4_BLOCK_BYTES,
};
pub use float::{bf16_to_f32, f16_to_f32, f32_to_bf16, f32_to_f16, BF16_NAN};
