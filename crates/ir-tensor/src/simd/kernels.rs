//! Vectorized inner loops.
//!
//! Each kernel has a portable version written over fixed-width accumulator
//! arrays, which the compiler lowers to whatever vector unit the target
//! has, and an AVX2 + FMA version selected at runtime on x86_64.

use crate::codec::{self, Q4_BLOCK_BYTES};
use crate::dtype::{DType, BLOCK_SIZE};
use crate::storage::Elements;

/// f32 lanes of the portable accumulators.
pub(crate) const LANES: usize = 8;

const HALF_BLOCK: usize = BLOCK_SIZE / 2;

/// Encoding pairs with a dedicated kernel. Each is accepted in either order.
pub(crate) const SUPPORTED_PAIRS: [(DType, DType); 9] = [
    (DType::F32, DType::F32),
    (DType::F32, DType::F16),
    (DType::F32, DType::BF16),
    (DType::F16, DType::F16),
    (DType::BF16, DType::BF16),
    (DType::F32, DType::Q8),
    (DType::F32, DType::Q4),
    (DType::Q8, DType::Q8),
    (DType::Q8, DType::Q4),
];

pub(crate) fn supports(a: DType, b: DType) -> bool {
    SUPPORTED_PAIRS
        .iter()
        .any(|&(x, y)| (x, y) == (a, b) || (y, x) == (a, b))
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn use_avx2() -> bool {
    crate::capability::MachineSpec::detect().has_avx2_fma()
}

// ---------------------------------------------------------------------------
// f32 dot / axpy
// ---------------------------------------------------------------------------

/// Dot product of two equal-length f32 slices.
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    if use_avx2() {
        // SAFETY: AVX2 and FMA were detected at runtime.
        return unsafe { dot_f32_avx2(a, b) };
    }
    dot_f32_portable(a, b)
}

fn dot_f32_portable(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let mut ca = a.chunks_exact(LANES);
    let mut cb = b.chunks_exact(LANES);
    for (x, y) in (&mut ca).zip(&mut cb) {
        for l in 0..LANES {
            acc[l] += x[l] * y[l];
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for (x, y) in ca.remainder().iter().zip(cb.remainder()) {
        sum += x * y;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut acc0 = _mm256_setzero_ps();
    let mut acc1 = _mm256_setzero_ps();
    let mut i = 0;
    while i + 16 <= n {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
        acc1 = _mm256_fmadd_ps(
            _mm256_loadu_ps(pa.add(i + 8)),
            _mm256_loadu_ps(pb.add(i + 8)),
            acc1,
        );
        i += 16;
    }
    if i + 8 <= n {
        acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
        i += 8;
    }
    let mut sum = hsum256(_mm256_add_ps(acc0, acc1));
    while i < n {
        sum += *pa.add(i) * *pb.add(i);
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn hsum256(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let lo = _mm256_castps256_ps128(v);
    let hi = _mm256_extractf128_ps(v, 1);
    let s = _mm_add_ps(lo, hi);
    let s = _mm_add_ps(s, _mm_movehl_ps(s, s));
    let s = _mm_add_ss(s, _mm_shuffle_ps(s, s, 0x55));
    _mm_cvtss_f32(s)
}

/// `y = alpha * x + y`.
pub fn axpy_f32(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    #[cfg(target_arch = "x86_64")]
    if use_avx2() {
        // SAFETY: AVX2 and FMA were detected at runtime.
        unsafe { axpy_f32_avx2(alpha, x, y) };
        return;
    }
    let mut cy = y.chunks_exact_mut(LANES);
    let mut cx = x.chunks_exact(LANES);
    for (yc, xc) in (&mut cy).zip(&mut cx) {
        for l in 0..LANES {
            yc[l] += alpha * xc[l];
        }
    }
    for (yv, xv) in cy.into_remainder().iter_mut().zip(cx.remainder()) {
        *yv += alpha * xv;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn axpy_f32_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let n = x.len().min(y.len());
    let (px, py) = (x.as_ptr(), y.as_mut_ptr());
    let va = _mm256_set1_ps(alpha);
    let mut i = 0;
    while i + 8 <= n {
        let r = _mm256_fmadd_ps(va, _mm256_loadu_ps(px.add(i)), _mm256_loadu_ps(py.add(i)));
        _mm256_storeu_ps(py.add(i), r);
        i += 8;
    }
    while i < n {
        *py.add(i) += alpha * *px.add(i);
        i += 1;
    }
}

/// `y = x + beta * y`.
pub fn xpby_f32(beta: f32, x: &[f32], y: &mut [f32]) {
    let mut cy = y.chunks_exact_mut(LANES);
    let mut cx = x.chunks_exact(LANES);
    for (yc, xc) in (&mut cy).zip(&mut cx) {
        for l in 0..LANES {
            yc[l] = xc[l] + beta * yc[l];
        }
    }
    for (yv, xv) in cy.into_remainder().iter_mut().zip(cx.remainder()) {
        *yv = xv + beta * *yv;
    }
}

/// Elementwise `dst = f(dst, src)` over equal-length slices.
#[inline]
pub fn zip_apply(dst: &mut [f32], src: &[f32], f: impl Fn(f32, f32) -> f32) {
    let mut cd = dst.chunks_exact_mut(LANES);
    let mut cs = src.chunks_exact(LANES);
    for (dc, sc) in (&mut cd).zip(&mut cs) {
        for l in 0..LANES {
            dc[l] = f(dc[l], sc[l]);
        }
    }
    for (d, s) in cd.into_remainder().iter_mut().zip(cs.remainder()) {
        *d = f(*d, *s);
    }
}

pub fn scale_f32(factor: f32, x: &mut [f32]) {
    let mut cx = x.chunks_exact_mut(LANES);
    for c in &mut cx {
        for v in c.iter_mut() {
            *v *= factor;
        }
    }
    for v in cx.into_remainder() {
        *v *= factor;
    }
}

// ---------------------------------------------------------------------------
// Quantized block dots
// ---------------------------------------------------------------------------

#[inline]
fn q4_unpack(bytes: &[u8], out: &mut [i8; BLOCK_SIZE]) {
    for (j, &byte) in bytes[..Q4_BLOCK_BYTES].iter().enumerate() {
        out[j] = (byte & 0x0f) as i8 - 8;
        out[j + HALF_BLOCK] = (byte >> 4) as i8 - 8;
    }
}

#[inline]
fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    let mut acc = [0i32; LANES];
    for (x, y) in a.chunks_exact(LANES).zip(b.chunks_exact(LANES)) {
        for l in 0..LANES {
            acc[l] += x[l] as i32 * y[l] as i32;
        }
    }
    acc.iter().sum()
}

/// `a . b` for a Q8 window against a Q8 or Q4 window, both starting on a
/// block boundary. `len` may end mid-block.
fn dot_q8_quantized(
    a_data: &[i8],
    a_scales: &[f32],
    b: Elements<'_>,
    a_off: usize,
    b_off: usize,
    len: usize,
) -> f32 {
    let mut sum = 0.0f32;
    let mut qb = [0i8; BLOCK_SIZE];
    let full = len / BLOCK_SIZE;
    for k in 0..full {
        let (ab, bb) = (a_off / BLOCK_SIZE + k, b_off / BLOCK_SIZE + k);
        let qa = &a_data[ab * BLOCK_SIZE..(ab + 1) * BLOCK_SIZE];
        let scale_b = match b {
            Elements::Q8 { data, scales } => {
                qb.copy_from_slice(&data[bb * BLOCK_SIZE..(bb + 1) * BLOCK_SIZE]);
                scales[bb]
            }
            Elements::Q4 { data, scales } => {
                q4_unpack(&data[bb * Q4_BLOCK_BYTES..], &mut qb);
                scales[bb]
            }
            _ => unreachable!("quantized operand expected"),
        };
        sum += dot_i8(qa, &qb) as f32 * a_scales[ab] * scale_b;
    }
    let done = full * BLOCK_SIZE;
    for i in done..len {
        sum += a_data[a_off + i] as f32 * a_scales[(a_off + i) / BLOCK_SIZE] * b.get(b_off + i);
    }
    sum
}

/// `x . q` for an f32 window against a quantized window starting on a
/// block boundary.
fn dot_f32_quantized(x: &[f32], q: Elements<'_>, q_off: usize) -> f32 {
    let mut sum = 0.0f32;
    let mut block = [0.0f32; BLOCK_SIZE];
    let first = q_off / BLOCK_SIZE;
    for (k, xs) in x.chunks(BLOCK_SIZE).enumerate() {
        let b = first + k;
        let out = &mut block[..xs.len()];
        match q {
            Elements::Q8 { data, scales } => {
                codec::dequantize_q8(&data[b * BLOCK_SIZE..], &scales[b..], out)
            }
            Elements::Q4 { data, scales } => {
                codec::dequantize_q4(&data[b * Q4_BLOCK_BYTES..], &scales[b..], out)
            }
            _ => unreachable!("quantized operand expected"),
        }
        sum += dot_f32(xs, out);
    }
    sum
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

const CHUNK: usize = 4 * BLOCK_SIZE;

/// Decodes `buf.len()` values of `e` at `start`, borrowing directly when
/// already f32.
#[inline]
fn decoded<'x>(e: Elements<'x>, start: usize, buf: &'x mut [f32]) -> &'x [f32] {
    match e {
        Elements::F32(s) => &s[start..start + buf.len()],
        other => {
            other.read_into(start, buf);
            buf
        }
    }
}

/// Dot product of `a[a_off..][..len]` and `b[b_off..][..len]`, or `None`
/// when the pair has no kernel.
pub(crate) fn dot(a: Elements<'_>, a_off: usize, b: Elements<'_>, b_off: usize, len: usize) -> Option<f32> {
    if !supports(a.dtype(), b.dtype()) {
        return None;
    }
    let aligned = a_off % BLOCK_SIZE == 0 && b_off % BLOCK_SIZE == 0;
    let sum = match (a, b) {
        (Elements::F32(x), Elements::F32(y)) => dot_f32(&x[a_off..a_off + len], &y[b_off..b_off + len]),
        (Elements::Q8 { data, scales }, q @ (Elements::Q8 { .. } | Elements::Q4 { .. })) if aligned => {
            dot_q8_quantized(data, scales, q, a_off, b_off, len)
        }
        (q @ Elements::Q4 { .. }, Elements::Q8 { data, scales }) if aligned => {
            dot_q8_quantized(data, scales, q, b_off, a_off, len)
        }
        (Elements::F32(x), q @ (Elements::Q8 { .. } | Elements::Q4 { .. })) if b_off % BLOCK_SIZE == 0 => {
            dot_f32_quantized(&x[a_off..a_off + len], q, b_off)
        }
        (q @ (Elements::Q8 { .. } | Elements::Q4 { .. }), Elements::F32(x)) if a_off % BLOCK_SIZE == 0 => {
            dot_f32_quantized(&x[b_off..b_off + len], q, a_off)
        }
        _ => dot_decoded(a, a_off, b, b_off, len),
    };
    Some(sum)
}

/// Chunked decode-then-dot for half-precision pairs and unaligned windows.
fn dot_decoded(a: Elements<'_>, a_off: usize, b: Elements<'_>, b_off: usize, len: usize) -> f32 {
    let mut abuf = [0.0f32; CHUNK];
    let mut bbuf = [0.0f32; CHUNK];
    let mut sum = 0.0f32;
    let mut i = 0;
    while i < len {
        let n = (len - i).min(CHUNK);
        let x = decoded(a, a_off + i, &mut abuf[..n]);
        let y = decoded(b, b_off + i, &mut bbuf[..n]);
        sum += dot_f32(x, y);
        i += n;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CpuStorage;
    use approx::assert_relative_eq;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.25).collect()
    }

    fn scalar_dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_dot_f32_matches_scalar_with_tail() {
        for n in [0, 1, 7, 8, 15, 16, 17, 100] {
            let a = ramp(n);
            let b: Vec<f32> = a.iter().rev().copied().collect();
            assert_relative_eq!(dot_f32(&a, &b), scalar_dot(&a, &b), epsilon = 1e-3);
            assert_relative_eq!(dot_f32_portable(&a, &b), scalar_dot(&a, &b), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_axpy_and_xpby() {
        let x = ramp(19);
        let mut y = vec![1.0; 19];
        axpy_f32(2.0, &x, &mut y);
        for (i, v) in y.iter().enumerate() {
            assert_relative_eq!(*v, 1.0 + 2.0 * x[i]);
        }
        let mut z = vec![2.0; 19];
        xpby_f32(0.5, &x, &mut z);
        for (i, v) in z.iter().enumerate() {
            assert_relative_eq!(*v, x[i] + 1.0);
        }
    }

    #[test]
    fn test_q4_unpack_layout() {
        let mut bytes = [0x88u8; Q4_BLOCK_BYTES];
        bytes[0] = 0xf0;
        let mut out = [0i8; BLOCK_SIZE];
        q4_unpack(&bytes, &mut out);
        assert_eq!(out[0], -8);
        assert_eq!(out[16], 7);
        assert_eq!(out[1], 0);
    }

    #[test]
    fn test_quantized_dots_match_decoded() {
        let values = ramp(96);
        let other: Vec<f32> = values.iter().map(|v| v * 0.5 + 0.1).collect();
        let f = CpuStorage::encode(DType::F32, &other);
        for (da, db) in [(DType::Q8, DType::Q8), (DType::Q8, DType::Q4), (DType::Q4, DType::Q8)] {
            let a = CpuStorage::encode(da, &values);
            let b = CpuStorage::encode(db, &other);
            let expected = scalar_dot(&a.elements().to_f32_vec(0, 80), &b.elements().to_f32_vec(0, 80));
            let got = dot(a.elements(), 0, b.elements(), 0, 80).unwrap();
            assert_relative_eq!(got, expected, epsilon = 1e-3);
        }
        for dq in [DType::Q8, DType::Q4] {
            let q = CpuStorage::encode(dq, &values);
            let expected = scalar_dot(&other[3..67], &q.elements().to_f32_vec(32, 64));
            let got = dot(f.elements(), 3, q.elements(), 32, 64).unwrap();
            assert_relative_eq!(got, expected, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_unaligned_quantized_window() {
        let values = ramp(64);
        let q = CpuStorage::encode(DType::Q8, &values);
        let f = CpuStorage::encode(DType::F32, &values);
        let expected = scalar_dot(&q.elements().to_f32_vec(5, 40), &values[5..45]);
        let got = dot(q.elements(), 5, f.elements(), 5, 40).unwrap();
        assert_relative_eq!(got, expected, epsilon = 1e-3);
    }

    #[test]
    fn test_unsupported_pairs() {
        let a = CpuStorage::encode(DType::Q4, &[1.0; 32]);
        let b = CpuStorage::encode(DType::F16, &[1.0; 32]);
        assert!(dot(a.elements(), 0, a.elements(), 0, 32).is_none());
        assert!(dot(a.elements(), 0, b.elements(), 0, 32).is_none());
        assert!(supports(DType::Q4, DType::F32));
    }
}
