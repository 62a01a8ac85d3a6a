//! Runtime-loaded GEMM entry points of the native kernel library.
//!
//! Every kernel computes, for `i < m` and `j` in `n0..n0 + n`,
//! `r[ldc * i + j - roffset] = dot(a[lda * i + aoffset..][..k], b[ldb * j + boffset..][..k])`.
//! Quantized operands pass their scale array alongside the packed values,
//! with `ld*f` giving scales per row. Q4 offsets and strides are in bytes.

use std::ffi::c_int;
use std::path::Path;

use libloading::Library;

use crate::error::{Result, TensorError};

/// Base name of the kernel library, without platform prefix or suffix.
pub const LIBRARY_NAME: &str = "irkernels";

pub type FnGemmF32 = unsafe extern "C" fn(
    c_int,                  // flags
    *const f32, c_int,      // a, aoffset
    *const f32, c_int,      // b, boffset
    *mut f32, c_int,        // r, roffset
    c_int, c_int, c_int, c_int, // m, n0, n, k
    c_int, c_int, c_int,    // lda, ldb, ldc
);

pub type FnGemmF32Q4 = unsafe extern "C" fn(
    c_int,
    *const f32, c_int,      // a, aoffset
    *const f32, *const u8, c_int, // bf, b, boffset
    *mut f32, c_int,
    c_int, c_int, c_int, c_int,
    c_int, c_int, c_int, c_int, // lda, ldb, ldbf, ldc
);

pub type FnGemmQ8Q4 = unsafe extern "C" fn(
    c_int,
    *const f32, *const i8, c_int, // af, a, aoffset
    *const f32, *const u8, c_int, // bf, b, boffset
    *mut f32, c_int,
    c_int, c_int, c_int, c_int,
    c_int, c_int, c_int, c_int, c_int, // lda, ldaf, ldb, ldbf, ldc
);

pub type FnGemmF32Bf16 = unsafe extern "C" fn(
    c_int,
    *const f32, c_int,
    *const u16, c_int,
    *mut u16, *mut f32, c_int, // bf16 result, f32 result, roffset
    c_int, c_int, c_int, c_int,
    c_int, c_int, c_int,
);

pub type FnGemmBf16 = unsafe extern "C" fn(
    c_int,
    *const u16, c_int,
    *const u16, c_int,
    *mut u16, *mut f32, c_int,
    c_int, c_int, c_int, c_int,
    c_int, c_int, c_int,
);

/// Native GEMM entry points. A loaded library stays open for the lifetime
/// of its function pointers.
pub struct NativeKernels {
    lib: Option<Library>,
    pub gemm_f32: FnGemmF32,
    pub gemm_f32_q4: FnGemmF32Q4,
    pub gemm_q8_q4: FnGemmQ8Q4,
    pub gemm_f32_bf16: FnGemmF32Bf16,
    pub gemm_bf16: FnGemmBf16,
}

// Safety: the kernels keep no global state; concurrent calls that write
// disjoint result ranges are sound.
unsafe impl Send for NativeKernels {}
unsafe impl Sync for NativeKernels {}

impl std::fmt::Debug for NativeKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeKernels")
            .field("loaded", &self.lib.is_some())
            .finish_non_exhaustive()
    }
}

impl NativeKernels {
    /// Opens `path`, or the platform-named library on the loader search path
    /// when `path` is `None`, and resolves every kernel symbol.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let default_name = libloading::library_filename(LIBRARY_NAME);
        let target = path.map(|p| p.as_os_str()).unwrap_or(&default_name);
        let lib = unsafe { Library::new(target) }
            .map_err(|e| TensorError::NativeLibrary(format!("{}: {}", target.to_string_lossy(), e)))?;

        unsafe {
            Ok(NativeKernels {
                gemm_f32: *symbol::<FnGemmF32>(&lib, b"gemm_f32\0")?,
                gemm_f32_q4: *symbol::<FnGemmF32Q4>(&lib, b"gemm_f32_q4\0")?,
                gemm_q8_q4: *symbol::<FnGemmQ8Q4>(&lib, b"gemm_q8_q4\0")?,
                gemm_f32_bf16: *symbol::<FnGemmF32Bf16>(&lib, b"gemm_f32_bf16\0")?,
                gemm_bf16: *symbol::<FnGemmBf16>(&lib, b"gemm_bf16\0")?,
                lib: Some(lib),
            })
        }
    }

    /// Kernels from in-process functions that follow the same contract as
    /// the library's exports.
    pub fn from_functions(
        gemm_f32: FnGemmF32,
        gemm_f32_q4: FnGemmF32Q4,
        gemm_q8_q4: FnGemmQ8Q4,
        gemm_f32_bf16: FnGemmF32Bf16,
        gemm_bf16: FnGemmBf16,
    ) -> Self {
        NativeKernels {
            lib: None,
            gemm_f32,
            gemm_f32_q4,
            gemm_q8_q4,
            gemm_f32_bf16,
            gemm_bf16,
        }
    }
}

unsafe fn symbol<'l, T>(lib: &'l Library, name: &[u8]) -> Result<libloading::Symbol<'l, T>> {
    lib.get::<T>(name).map_err(|e| {
        TensorError::NativeLibrary(format!(
            "missing symbol {}: {}",
            String::from_utf8_lossy(&name[..name.len() - 1]),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_reported() {
        let err = NativeKernels::load(Some(Path::new("/nonexistent/libirkernels.so"))).unwrap_err();
        assert!(matches!(err, TensorError::NativeLibrary(_)));
        assert!(err.to_string().contains("/nonexistent/libirkernels.so"));
    }
}
