//! Block quantization: every 32 consecutive values share one f32 scale.
//!
//! Q8 stores one signed byte per value with `scale = max|x| / 127`.
//!
//! Q4 stores two values per byte. Within a block of 32, value `j < 16` sits
//! in the low nibble of byte `j` and value `j + 16` in the high nibble of the
//! same byte. Nibbles hold `q + 8` for `q` in `[-8, 7]`, and the scale is the
//! block's largest-magnitude value divided by -8, so that value encodes
//! exactly as -8.

use crate::dtype::BLOCK_SIZE;

/// Packed data bytes per Q4 block.
pub const Q4_BLOCK_BYTES: usize = BLOCK_SIZE / 2;

const HALF_BLOCK: usize = BLOCK_SIZE / 2;

/// Quantizes `src` into Q8 `data` and per-block `scales`.
///
/// `data` must hold `scales.len() * 32` bytes and `scales` enough blocks
/// for `src`; a trailing partial block is zero-padded.
pub fn quantize_q8(src: &[f32], data: &mut [i8], scales: &mut [f32]) {
    debug_assert!(scales.len() * BLOCK_SIZE >= src.len());
    debug_assert!(data.len() >= scales.len() * BLOCK_SIZE);

    for (block, scale) in scales.iter_mut().enumerate() {
        let start = block * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(src.len());
        let values = if start < end { &src[start..end] } else { &[][..] };
        let out = &mut data[start..start + BLOCK_SIZE];

        let amax = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let iscale = if amax > 0.0 { 127.0 / amax } else { 0.0 };
        *scale = if amax > 0.0 { amax / 127.0 } else { 0.0 };

        for (i, q) in out.iter_mut().enumerate() {
            *q = match values.get(i) {
                Some(v) => (v * iscale).round().clamp(-127.0, 127.0) as i8,
                None => 0,
            };
        }
    }
}

/// Dequantizes Q8 values into `out`, one output per element of `out`.
pub fn dequantize_q8(data: &[i8], scales: &[f32], out: &mut [f32]) {
    for (i, v) in out.iter_mut().enumerate() {
        *v = data[i] as f32 * scales[i / BLOCK_SIZE];
    }
}

/// Quantizes `src` into Q4 `data` (16 bytes per block) and `scales`.
pub fn quantize_q4(src: &[f32], data: &mut [u8], scales: &mut [f32]) {
    debug_assert!(scales.len() * BLOCK_SIZE >= src.len());
    debug_assert!(data.len() >= scales.len() * Q4_BLOCK_BYTES);

    for (block, scale) in scales.iter_mut().enumerate() {
        let start = block * BLOCK_SIZE;
        let value = |j: usize| src.get(start + j).copied().unwrap_or(0.0);

        let mut max = 0.0f32;
        for j in 0..BLOCK_SIZE {
            let v = value(j);
            if v.abs() > max.abs() {
                max = v;
            }
        }

        *scale = max / -8.0;
        let iscale = if *scale != 0.0 { 1.0 / *scale } else { 0.0 };

        let out = &mut data[block * Q4_BLOCK_BYTES..(block + 1) * Q4_BLOCK_BYTES];
        for (j, byte) in out.iter_mut().enumerate() {
            let lo = encode_nibble(value(j) * iscale);
            let hi = encode_nibble(value(j + HALF_BLOCK) * iscale);
            *byte = lo | (hi << 4);
        }
    }
}

#[inline]
fn encode_nibble(x: f32) -> u8 {
    ((x + 8.5).floor() as i32).clamp(0, 15) as u8
}

/// Signed quantized value of element `i` of a Q4 buffer.
#[inline]
pub fn q4_get(data: &[u8], i: usize) -> i8 {
    let block = i / BLOCK_SIZE;
    let j = i % BLOCK_SIZE;
    let byte = data[block * Q4_BLOCK_BYTES + j % HALF_BLOCK];
    let nibble = if j < HALF_BLOCK { byte & 0x0f } else { byte >> 4 };
    nibble as i8 - 8
}

/// Overwrites element `i` of a Q4 buffer with the signed value `q`.
#[inline]
pub fn q4_set(data: &mut [u8], i: usize, q: i8) {
    let block = i / BLOCK_SIZE;
    let j = i % BLOCK_SIZE;
    let byte = &mut data[block * Q4_BLOCK_BYTES + j % HALF_BLOCK];
    let nibble = (q.clamp(-8, 7) + 8) as u8;
    if j < HALF_BLOCK {
        *byte = (*byte & 0xf0) | nibble;
    } else {
        *byte = (*byte & 0x0f) | (nibble << 4);
    }
}

/// Dequantizes Q4 values into `out`.
pub fn dequantize_q4(data: &[u8], scales: &[f32], out: &mut [f32]) {
    for (i, v) in out.iter_mut().enumerate() {
        *v = q4_get(data, i) as f32 * scales[i / BLOCK_SIZE];
    }
}
