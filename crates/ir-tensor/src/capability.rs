//! Runtime hardware capability probe.
//!
//! Detected once per process and memoized; backend selection reads it to
//! decide which tier to instantiate.

use std::fmt;
use std::sync::OnceLock;

/// Widest usable vector register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VectorWidth {
    None,
    W128,
    W256,
    W512,
}

impl VectorWidth {
    pub fn bits(&self) -> usize {
        match self {
            VectorWidth::None => 0,
            VectorWidth::W128 => 128,
            VectorWidth::W256 => 256,
            VectorWidth::W512 => 512,
        }
    }

    /// f32 lanes per register.
    pub fn f32_lanes(&self) -> usize {
        (self.bits() / 32).max(1)
    }
}

impl fmt::Display for VectorWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorWidth::None => write!(f, "none"),
            other => write!(f, "{}-bit", other.bits()),
        }
    }
}

/// Hardware features of the current machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSpec {
    pub vector_width: VectorWidth,
    pub arch: &'static str,
    pub os: &'static str,
    pub avx2: bool,
    pub avx512f: bool,
    pub fma: bool,
    pub f16c: bool,
    pub neon: bool,
}

/// Native kernel flag: hardware f16 <-> f32 conversion.
pub const HAS_F16C: i32 = 2;
/// Native kernel flag: select 512-bit wide dot products.
pub const HAS_WIDE_VECTORS: i32 = 4;
/// Native kernel flag: Apple silicon.
pub const IS_APPLE_SILICON: i32 = 8;

static DETECTED: OnceLock<MachineSpec> = OnceLock::new();

impl MachineSpec {
    /// Probe the current CPU. Runs once; later calls return the same record.
    pub fn detect() -> &'static MachineSpec {
        DETECTED.get_or_init(Self::probe)
    }

    fn probe() -> MachineSpec {
        #[cfg(target_arch = "x86_64")]
        let spec = {
            let avx2 = is_x86_feature_detected!("avx2");
            let avx512f = is_x86_feature_detected!("avx512f");
            let sse2 = is_x86_feature_detected!("sse2");
            MachineSpec {
                vector_width: if avx512f {
                    VectorWidth::W512
                } else if avx2 {
                    VectorWidth::W256
                } else if sse2 {
                    VectorWidth::W128
                } else {
                    VectorWidth::None
                },
                avx2,
                avx512f,
                fma: is_x86_feature_detected!("fma"),
                f16c: is_x86_feature_detected!("f16c"),
                ..MachineSpec::scalar()
            }
        };

        // NEON is mandatory on AArch64.
        #[cfg(target_arch = "aarch64")]
        let spec = MachineSpec {
            vector_width: VectorWidth::W128,
            neon: true,
            ..MachineSpec::scalar()
        };

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        let spec = MachineSpec::scalar();

        spec
    }

    /// A machine with no vector support, for the current arch and OS.
    pub fn scalar() -> MachineSpec {
        MachineSpec {
            vector_width: VectorWidth::None,
            arch: std::env::consts::ARCH,
            os: std::env::consts::OS,
            avx2: false,
            avx512f: false,
            fma: false,
            f16c: false,
            neon: false,
        }
    }

    /// Widest registers the portable kernels use here. The widest of
    /// them are AVX2, so 512-bit machines run the 256-bit paths; only the
    /// native library sees the wider tier, through [`HAS_WIDE_VECTORS`].
    pub fn kernel_width(&self) -> VectorWidth {
        self.vector_width.min(VectorWidth::W256)
    }

    /// Best SIMD tier of the portable kernels, as a human-readable string.
    pub fn best_tier(&self) -> &'static str {
        if self.avx2 {
            "AVX2"
        } else if self.neon {
            "NEON"
        } else if self.vector_width != VectorWidth::None {
            "SSE2"
        } else {
            "scalar"
        }
    }

    pub fn has_simd(&self) -> bool {
        self.vector_width != VectorWidth::None
    }

    /// Whether the AVX2 + FMA kernels can run.
    pub fn has_avx2_fma(&self) -> bool {
        self.avx2 && self.fma
    }

    /// Flag word passed to every native kernel call.
    pub fn native_flags(&self) -> i32 {
        let mut flags = 0;
        if self.f16c {
            flags |= HAS_F16C;
        }
        if self.vector_width == VectorWidth::W512 {
            flags |= HAS_WIDE_VECTORS;
        }
        if self.os == "macos" && self.arch == "aarch64" {
            flags |= IS_APPLE_SILICON;
        }
        flags
    }
}

impl fmt::Display for MachineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{}, vector width {}, kernels {})",
            self.best_tier(),
            self.os,
            self.arch,
            self.vector_width,
            self.kernel_width()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_memoized() {
        let a = MachineSpec::detect();
        let b = MachineSpec::detect();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.arch, std::env::consts::ARCH);
    }

    #[test]
    fn test_scalar_tier() {
        let spec = MachineSpec::scalar();
        assert_eq!(spec.best_tier(), "scalar");
        assert!(!spec.has_simd());
        assert_eq!(spec.native_flags() & (HAS_F16C | HAS_WIDE_VECTORS), 0);
    }

    #[test]
    fn test_native_flags() {
        let spec = MachineSpec {
            vector_width: VectorWidth::W512,
            avx2: true,
            avx512f: true,
            fma: true,
            f16c: true,
            ..MachineSpec::scalar()
        };
        assert_eq!(spec.native_flags() & HAS_F16C, HAS_F16C);
        assert_eq!(spec.native_flags() & HAS_WIDE_VECTORS, HAS_WIDE_VECTORS);
    }

    #[test]
    fn test_wide_machine_runs_avx2_kernels() {
        let spec = MachineSpec {
            vector_width: VectorWidth::W512,
            avx2: true,
            avx512f: true,
            fma: true,
            ..MachineSpec::scalar()
        };
        assert_eq!(spec.best_tier(), "AVX2");
        assert_eq!(spec.kernel_width(), VectorWidth::W256);
        assert!(spec.to_string().contains("vector width 512-bit, kernels 256-bit"));

        let narrow = MachineSpec {
            vector_width: VectorWidth::W128,
            ..MachineSpec::scalar()
        };
        assert_eq!(narrow.kernel_width(), VectorWidth::W128);
        assert_eq!(narrow.best_tier(), "SSE2");
    }

    #[test]
    fn test_vector_width_lanes() {
        assert_eq!(VectorWidth::None.f32_lanes(), 1);
        assert_eq!(VectorWidth::W256.f32_lanes(), 8);
        assert_eq!(VectorWidth::W512.to_string(), "512-bit");
    }
}
