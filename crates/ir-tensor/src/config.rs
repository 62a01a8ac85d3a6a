use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::cache::{TensorCache, DEFAULT_CACHE_BYTES};
use crate::error::{Result, TensorError};
use crate::pool;

/// Which backend tier selection should aim for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Best tier the machine supports.
    #[default]
    Auto,
    /// Native kernel library, degrading like `Auto` when it is missing.
    Native,
    /// Portable vectorized kernels, skipping the native library.
    Simd,
    /// Scalar reference kernels only.
    Reference,
}

impl FromStr for BackendPreference {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "native" => Ok(BackendPreference::Native),
            "simd" | "vector" => Ok(BackendPreference::Simd),
            "reference" | "naive" | "scalar" | "cpu" => Ok(BackendPreference::Reference),
            other => Err(TensorError::InvalidConfig(format!(
                "unknown backend preference '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Native => "native",
            BackendPreference::Simd => "simd",
            BackendPreference::Reference => "reference",
        };
        write!(f, "{}", name)
    }
}

/// Engine-wide settings.
///
/// Thread count must be applied (via `apply()`) before the execution pool
/// is first used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads. 0 means auto-detect.
    pub num_threads: usize,
    /// Idle-byte budget of the tensor cache.
    pub cache_bytes: usize,
    pub backend: BackendPreference,
    /// Explicit path of the native kernel library. When unset the platform
    /// library search path is tried.
    pub native_library: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            cache_bytes: DEFAULT_CACHE_BYTES,
            backend: BackendPreference::Auto,
            native_library: None,
        }
    }
}

pub const ENV_THREADS: &str = "IR_THREADS";
pub const ENV_CACHE_BYTES: &str = "IR_CACHE_BYTES";
pub const ENV_BACKEND: &str = "IR_BACKEND";
pub const ENV_NATIVE_LIB: &str = "IR_NATIVE_LIB";

impl EngineConfig {
    /// Defaults overlaid with `IR_THREADS`, `IR_CACHE_BYTES`, `IR_BACKEND`
    /// and `IR_NATIVE_LIB` from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();
        if let Some(v) = lookup(ENV_THREADS) {
            config.num_threads = parse_number(ENV_THREADS, &v)?;
        }
        if let Some(v) = lookup(ENV_CACHE_BYTES) {
            config.cache_bytes = parse_number(ENV_CACHE_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_BACKEND) {
            config.backend = v.parse()?;
        }
        if let Some(v) = lookup(ENV_NATIVE_LIB) {
            if !v.is_empty() {
                config.native_library = Some(PathBuf::from(v));
            }
        }
        Ok(config)
    }

    /// Configure the process-wide execution pool with `num_threads`.
    ///
    /// Fails with [`TensorError::PoolAlreadyStarted`] once the pool is in
    /// use.
    pub fn apply(&self) -> Result<()> {
        pool::configure_global(self.num_threads)
    }

    /// A tensor cache sized by `cache_bytes`.
    pub fn tensor_cache(&self) -> TensorCache {
        TensorCache::new(self.cache_bytes)
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| TensorError::InvalidConfig(format!("{}={:?}: {}", key, value, e)))
}
