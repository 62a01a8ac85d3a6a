//! One-time backend selection.
//!
//! [`select_backend`] turns a config and a capability record into an
//! immutable [`Backend`] handle that call sites receive explicitly.
//! [`global_backend`] memoizes one such handle for the whole process.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::ComputeBackend;
use crate::capability::MachineSpec;
use crate::config::{BackendPreference, EngineConfig};
use crate::cpu::CpuBackend;
use crate::error::Result;
use crate::native::NativeBackend;
use crate::pool::{self, ExecutionPool};
use crate::simd::SimdBackend;

/// Shared handle to the selected backend.
pub type Backend = Arc<dyn ComputeBackend>;

/// Picks the best backend `spec` allows, honouring `config.backend`.
///
/// Tiers are tried from native to vectorized to reference. A tier that is
/// unavailable is logged and skipped; selection itself never fails.
pub fn select_backend(config: &EngineConfig, spec: &MachineSpec, pool: Arc<ExecutionPool>) -> Backend {
    let backend: Backend = match config.backend {
        BackendPreference::Reference => Arc::new(CpuBackend::new()),
        BackendPreference::Simd => vector_tier(spec, pool),
        BackendPreference::Auto | BackendPreference::Native => {
            let fallback = SimdBackend::new(Arc::clone(&pool));
            match NativeBackend::load(config.native_library.as_deref(), spec, fallback) {
                Ok(native) => Arc::new(native),
                Err(e) => {
                    if config.backend == BackendPreference::Native {
                        warn!(error = %e, "native kernels requested but unavailable, degrading");
                    } else {
                        debug!(error = %e, "native kernels unavailable");
                    }
                    vector_tier(spec, pool)
                }
            }
        }
    };
    info!(
        backend = backend.name(),
        preference = %config.backend,
        machine = %spec,
        flags = spec.native_flags(),
        "compute backend selected"
    );
    backend
}

fn vector_tier(spec: &MachineSpec, pool: Arc<ExecutionPool>) -> Backend {
    if spec.has_simd() {
        Arc::new(SimdBackend::new(pool))
    } else {
        warn!(machine = %spec, "no vector unit, using reference backend");
        Arc::new(CpuBackend::new())
    }
}

static GLOBAL: OnceLock<Backend> = OnceLock::new();
static SELECTING: Mutex<()> = parking_lot::const_mutex(());

/// The process-wide backend, selected on first call from
/// [`EngineConfig::from_env`] and the detected machine. Later calls return
/// the same handle. A failed selection is retried by the next call.
pub fn global_backend() -> Result<Backend> {
    get_or_select(&GLOBAL, &SELECTING, || {
        let config = EngineConfig::from_env()?;
        if let Err(e) = config.apply() {
            debug!(error = %e, "keeping existing execution pool configuration");
        }
        Ok(select_backend(&config, MachineSpec::detect(), pool::global_pool()?))
    })
}

// Runs `select` at most once per successful initialization of `cell`.
fn get_or_select<F>(cell: &OnceLock<Backend>, lock: &Mutex<()>, select: F) -> Result<Backend>
where
    F: FnOnce() -> Result<Backend>,
{
    if let Some(backend) = cell.get() {
        return Ok(Arc::clone(backend));
    }
    let _guard = lock.lock();
    if let Some(backend) = cell.get() {
        return Ok(Arc::clone(backend));
    }
    let backend = select()?;
    Ok(Arc::clone(cell.get_or_init(|| backend)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::VectorWidth;
    use crate::error::TensorError;
    use std::path::PathBuf;

    fn pool() -> Arc<ExecutionPool> {
        Arc::new(ExecutionPool::new(2).unwrap())
    }

    fn config(backend: BackendPreference) -> EngineConfig {
        EngineConfig {
            backend,
            native_library: Some(PathBuf::from("/nonexistent/libirkernels.so")),
            ..EngineConfig::default()
        }
    }

    fn vector_machine() -> MachineSpec {
        MachineSpec {
            vector_width: VectorWidth::W256,
            ..MachineSpec::scalar()
        }
    }

    #[test]
    fn test_reference_preference() {
        let b = select_backend(&config(BackendPreference::Reference), &vector_machine(), pool());
        assert_eq!(b.name(), "reference");
    }

    #[test]
    fn test_missing_native_degrades_to_simd() {
        for pref in [BackendPreference::Auto, BackendPreference::Native] {
            let b = select_backend(&config(pref), &vector_machine(), pool());
            assert_eq!(b.name(), "simd");
        }
    }

    #[test]
    fn test_scalar_machine_degrades_to_reference() {
        let b = select_backend(&config(BackendPreference::Auto), &MachineSpec::scalar(), pool());
        assert_eq!(b.name(), "reference");
        let b = select_backend(&config(BackendPreference::Simd), &MachineSpec::scalar(), pool());
        assert_eq!(b.name(), "reference");
    }

    #[test]
    fn test_concurrent_first_use_selects_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cell = OnceLock::new();
        let lock = Mutex::new(());
        let selections = AtomicUsize::new(0);
        let handles: Vec<Backend> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        get_or_select(&cell, &lock, || {
                            selections.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(Arc::new(CpuBackend::new()) as Backend)
                        })
                        .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(selections.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[test]
    fn test_failed_selection_is_retried() {
        let cell = OnceLock::new();
        let lock = Mutex::new(());
        let err = get_or_select(&cell, &lock, || Err(TensorError::InvalidConfig("bad".into())));
        assert!(err.is_err());
        assert!(cell.get().is_none());
        let b = get_or_select(&cell, &lock, || Ok(Arc::new(CpuBackend::new()) as Backend)).unwrap();
        assert_eq!(b.name(), "reference");
    }

    #[test]
    fn test_global_backend_is_memoized() {
        let a = global_backend().unwrap();
        let b = global_backend().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
