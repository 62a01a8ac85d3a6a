//! Bit-level 16-bit float conversions.

use half::f16;

/// Canonical brain-float NaN, before the sign bit is applied.
pub const BF16_NAN: u16 = 0x7f81;

const F32_EXP_MASK: u32 = 0x7f80_0000;
const F32_MANTISSA_MASK: u32 = 0x007f_ffff;

/// Widens IEEE half-precision bits to f32.
///
/// Normal values are rebased by shifting the exponent/mantissa field into
/// place and rescaling by 2^-112; subnormals are recovered with a magic-bias
/// subtraction. Infinities and NaNs fall out of the normal path unchanged.
#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    let w = (bits as u32) << 16;
    let sign = w & 0x8000_0000;
    let two_w = w.wrapping_add(w);

    let exp_offset: u32 = 0xe0 << 23;
    let exp_scale = f32::from_bits(0x0780_0000); // 2^-112
    let normalized = f32::from_bits((two_w >> 4) + exp_offset) * exp_scale;

    let magic_mask: u32 = 126 << 23;
    let denormalized = f32::from_bits((two_w >> 17) | magic_mask) - 0.5;

    let denormalized_cutoff: u32 = 1 << 27;
    let magnitude = if two_w < denormalized_cutoff {
        denormalized.to_bits()
    } else {
        normalized.to_bits()
    };
    f32::from_bits(sign | magnitude)
}

/// Narrows f32 to IEEE half-precision bits (round to nearest even).
#[inline]
pub fn f32_to_f16(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

/// Widens brain-float bits to f32. Brain floats share the f32 exponent, so
/// this only appends zero mantissa bits.
#[inline]
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}

/// Narrows f32 to brain-float bits, keeping 8 mantissa bits with
/// round-half-to-even.
///
/// NaN inputs, and finite inputs whose rounding carries into the exponent
/// sentinel, become a signed [`BF16_NAN`]. Infinite inputs stay infinite.
#[inline]
pub fn f32_to_bf16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let sentinel = bits & F32_EXP_MASK == F32_EXP_MASK;

    // Adding 0x7fff plus the kept lsb rounds ties toward the even result.
    let kept_lsb = (bits >> 16) & 1;
    let magnitude = (((bits & 0x7fff_ffff) + 0x7fff + kept_lsb) >> 16) as u16;

    let is_nan = sentinel && bits & F32_MANTISSA_MASK != 0;
    let overflowed = !sentinel && magnitude & 0x7f80 == 0x7f80;

    match (sentinel, is_nan || overflowed) {
        (_, true) => sign | BF16_NAN,
        (true, false) => (bits >> 16) as u16,
        (false, false) => sign | magnitude,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_f16_matches_half_crate() {
        for bits in (0u16..=u16::MAX).step_by(7) {
            let ours = f16_to_f32(bits);
            let theirs = f16::from_bits(bits).to_f32();
            if theirs.is_nan() {
                assert!(ours.is_nan(), "bits {:#06x}", bits);
            } else {
                assert_eq!(ours.to_bits(), theirs.to_bits(), "bits {:#06x}", bits);
            }
        }
    }

    #[test]
    fn test_f16_special_values() {
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert_eq!(f16_to_f32(0x8000).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x7c00), f32::INFINITY);
        assert_eq!(f16_to_f32(0xfc00), f32::NEG_INFINITY);
        assert!(f16_to_f32(0x7e00).is_nan());
        // smallest subnormal
        assert_eq!(f16_to_f32(0x0001), 2.0f32.powi(-24));
    }

    #[test]
    fn test_f16_roundtrip_exact_for_representable() {
        for v in [0.5f32, -1.25, 65504.0, 6.1035156e-5, 3.140625] {
            assert_eq!(f16_to_f32(f32_to_f16(v)), v);
        }
    }

    #[test]
    fn test_bf16_roundtrip_exact_for_representable() {
        for v in [1.0f32, -2.5, 0.0, 3.140625, f32::INFINITY, f32::NEG_INFINITY] {
            assert_eq!(bf16_to_f32(f32_to_bf16(v)), v);
        }
    }

    #[test]
    fn test_bf16_ties_round_to_even() {
        // Identical discarded bits (exactly half an ulp), kept lsb even vs odd.
        let even = f32::from_bits(0x3f80_8000);
        let odd = f32::from_bits(0x3f81_8000);
        let re = f32_to_bf16(even);
        let ro = f32_to_bf16(odd);
        assert_eq!(re, 0x3f80);
        assert_eq!(ro, 0x3f82);
        assert_eq!(re & 1, 0);
        assert_eq!(ro & 1, 0);
    }

    #[test]
    fn test_bf16_rounds_to_nearest() {
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f80_8001)), 0x3f81);
        assert_eq!(f32_to_bf16(f32::from_bits(0x3f80_7fff)), 0x3f80);
        assert_eq!(f32_to_bf16(f32::from_bits(0xbf80_8001)), 0xbf81);
    }

    #[test]
    fn test_bf16_nan_and_overflow_canonicalize() {
        assert_eq!(f32_to_bf16(f32::NAN), BF16_NAN);
        assert_eq!(f32_to_bf16(-f32::NAN), 0x8000 | BF16_NAN);
        // f32::MAX rounds up into the exponent sentinel
        assert_eq!(f32_to_bf16(f32::MAX), BF16_NAN);
        assert_eq!(f32_to_bf16(f32::MIN), 0x8000 | BF16_NAN);
        assert!(bf16_to_f32(f32_to_bf16(f32::MAX)).is_nan());
        assert_eq!(f32_to_bf16(f32::INFINITY), 0x7f80);
        assert_eq!(f32_to_bf16(f32::NEG_INFINITY), 0xff80);
    }

    // Random finite f32 with the given unbiased exponent range whose low
    // `dropped` mantissa bits are not all zero.
    fn unrepresentable(rng: &mut StdRng, exponents: std::ops::RangeInclusive<i32>, dropped: u32) -> f32 {
        let exp = (rng.gen_range(exponents) + 127) as u32;
        let mut mantissa = rng.gen::<u32>() & F32_MANTISSA_MASK;
        if mantissa & ((1 << dropped) - 1) == 0 {
            mantissa |= 1;
        }
        let sign = if rng.gen::<bool>() { 0x8000_0000 } else { 0 };
        f32::from_bits(sign | exp << 23 | mantissa)
    }

    // Half the spacing between neighbours of `x` with `mantissa_bits` kept.
    fn half_ulp(x: f32, mantissa_bits: i32) -> f64 {
        let exp = ((x.to_bits() & F32_EXP_MASK) >> 23) as i32 - 127;
        2f64.powi(exp - mantissa_bits - 1)
    }

    #[test]
    fn test_f16_rounding_error_within_half_ulp() {
        let mut rng = StdRng::seed_from_u64(0x5eed_f16);
        for _ in 0..20_000 {
            let x = unrepresentable(&mut rng, -14..=14, 13);
            let back = f16_to_f32(f32_to_f16(x));
            let err = (x as f64 - back as f64).abs();
            assert!(err <= half_ulp(x, 10), "{:e} -> {:e}", x, back);
        }
    }

    #[test]
    fn test_bf16_rounding_error_within_half_ulp() {
        let mut rng = StdRng::seed_from_u64(0x5eed_bf16);
        for _ in 0..20_000 {
            let x = unrepresentable(&mut rng, -126..=126, 16);
            let back = bf16_to_f32(f32_to_bf16(x));
            let err = (x as f64 - back as f64).abs();
            assert!(err <= half_ulp(x, 7), "{:e} -> {:e}", x, back);
            assert_ne!(back.to_bits(), x.to_bits());
        }
    }

    #[test]
    fn test_bf16_carry_into_exponent() {
        // 1.9999999 rounds up to 2.0
        assert_eq!(bf16_to_f32(f32_to_bf16(f32::from_bits(0x3fff_ffff))), 2.0);
    }
}
