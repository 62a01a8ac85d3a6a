//! Bounded pool of reusable tensor buffers.
//!
//! Token-by-token generation asks for the same (dtype, shape) scratch
//! tensors on every step. Released tensors are parked here and handed back
//! out on the next matching `get` instead of being reallocated. The cache
//! is purely an optimization: a fresh allocation is always a valid result.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dtype::DType;
use crate::shape::Shape;
use crate::storage::CpuStorage;
use crate::tensor::Tensor;

/// Default idle-byte budget: 100 MiB.
pub const DEFAULT_CACHE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    dtype: DType,
    shape: Shape,
}

/// Counters describing cache behaviour so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub idle_bytes: usize,
}

/// Thread-safe tensor cache. Clones share the same pool.
#[derive(Clone)]
pub struct TensorCache {
    shared: Arc<Shared>,
}

struct Shared {
    capacity_bytes: usize,
    /// Bytes held by idle buffers.
    idle_bytes: AtomicUsize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    /// Idle buffers per key, each tagged with its release stamp.
    idle: HashMap<CacheKey, Vec<(u64, CpuStorage)>>,
    /// Release stamp -> key, oldest first.
    order: BTreeMap<u64, CacheKey>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl std::fmt::Debug for TensorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("TensorCache")
            .field("keys", &inner.idle.len())
            .field("idle_buffers", &inner.order.len())
            .field("idle_bytes", &self.idle_bytes())
            .field("capacity_bytes", &self.shared.capacity_bytes)
            .finish()
    }
}

impl Default for TensorCache {
    fn default() -> Self {
        TensorCache::new(DEFAULT_CACHE_BYTES)
    }
}

impl TensorCache {
    /// Create a cache holding at most `capacity_bytes` of idle buffers.
    pub fn new(capacity_bytes: usize) -> Self {
        TensorCache {
            shared: Arc::new(Shared {
                capacity_bytes,
                idle_bytes: AtomicUsize::new(0),
                inner: Mutex::new(CacheInner {
                    idle: HashMap::new(),
                    order: BTreeMap::new(),
                    clock: 0,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                }),
            }),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.shared.capacity_bytes
    }

    pub fn idle_bytes(&self) -> usize {
        self.shared.idle_bytes.load(Ordering::Acquire)
    }

    /// Returns a tensor of `dtype` and `shape`, reusing an idle buffer when
    /// one matches. Contents of a reused buffer are unspecified.
    ///
    /// The tensor goes back to the cache when the guard is dropped.
    pub fn get(&self, dtype: DType, shape: Shape) -> CachedTensor {
        let key = CacheKey { dtype, shape };
        let reused = {
            let mut inner = self.shared.inner.lock();
            let popped = inner.idle.get_mut(&key).and_then(Vec::pop);
            match popped {
                Some((stamp, storage)) => {
                    inner.order.remove(&stamp);
                    if inner.idle.get(&key).is_some_and(Vec::is_empty) {
                        inner.idle.remove(&key);
                    }
                    inner.hits += 1;
                    self.shared
                        .idle_bytes
                        .fetch_sub(storage.nbytes(), Ordering::AcqRel);
                    Some(storage)
                }
                None => {
                    inner.misses += 1;
                    None
                }
            }
        };

        let tensor = match reused {
            Some(storage) => Tensor::from_parts(storage, key.shape),
            None => Tensor::zeros(key.dtype, key.shape),
        };
        CachedTensor {
            tensor: Some(tensor),
            cache: self.clone(),
        }
    }

    /// Parks `tensor` for reuse, evicting the least recently released idle
    /// buffers to stay within budget. Tensors larger than the whole budget,
    /// and tensors that do not own their storage, are dropped.
    pub fn release(&self, tensor: Tensor) {
        let key = CacheKey {
            dtype: tensor.dtype(),
            shape: tensor.shape().clone(),
        };
        let Some(storage) = tensor.into_owned_storage() else {
            return;
        };
        let size = storage.nbytes();
        if size > self.shared.capacity_bytes {
            tracing::debug!(
                bytes = size,
                capacity = self.shared.capacity_bytes,
                "tensor exceeds cache budget, freeing"
            );
            return;
        }

        let mut inner = self.shared.inner.lock();
        while self.idle_bytes() + size > self.shared.capacity_bytes {
            let Some((stamp, victim_key)) = inner.order.pop_first() else {
                break;
            };
            let freed = inner.idle.get_mut(&victim_key).and_then(|bucket| {
                let pos = bucket.iter().position(|(s, _)| *s == stamp)?;
                Some(bucket.remove(pos).1.nbytes())
            });
            if inner.idle.get(&victim_key).is_some_and(Vec::is_empty) {
                inner.idle.remove(&victim_key);
            }
            if let Some(freed) = freed {
                self.shared.idle_bytes.fetch_sub(freed, Ordering::AcqRel);
                inner.evictions += 1;
                tracing::debug!(
                    dtype = %victim_key.dtype,
                    shape = %victim_key.shape,
                    bytes = freed,
                    "evicted idle tensor"
                );
            }
        }

        let stamp = inner.clock;
        inner.clock += 1;
        inner.order.insert(stamp, key.clone());
        inner.idle.entry(key).or_default().push((stamp, storage));
        self.shared.idle_bytes.fetch_add(size, Ordering::AcqRel);
    }

    /// Frees every idle buffer.
    pub fn clear(&self) {
        let mut inner = self.shared.inner.lock();
        inner.idle.clear();
        inner.order.clear();
        self.shared.idle_bytes.store(0, Ordering::Release);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            idle_bytes: self.idle_bytes(),
        }
    }
}

/// A tensor on loan from a [`TensorCache`], returned when dropped.
pub struct CachedTensor {
    tensor: Option<Tensor>,
    cache: TensorCache,
}

impl CachedTensor {
    /// Detaches the tensor from the cache; it will not be returned.
    pub fn into_inner(mut self) -> Tensor {
        match self.tensor.take() {
            Some(t) => t,
            None => unreachable!("tensor taken before drop"),
        }
    }
}

impl Deref for CachedTensor {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        match &self.tensor {
            Some(t) => t,
            None => unreachable!("tensor taken before drop"),
        }
    }
}

impl DerefMut for CachedTensor {
    fn deref_mut(&mut self) -> &mut Tensor {
        match &mut self.tensor {
            Some(t) => t,
            None => unreachable!("tensor taken before drop"),
        }
    }
}

impl Drop for CachedTensor {
    fn drop(&mut self) {
        if let Some(t) = self.tensor.take() {
            self.cache.release(t);
        }
    }
}

impl std::fmt::Debug for CachedTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CachedTensor").field(&self.tensor).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(n: usize) -> Shape {
        Shape::new(vec![n])
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = TensorCache::new(1024);
        {
            let t = cache.get(DType::F32, shape(16));
            assert_eq!(t.shape().dims(), &[16]);
        }
        assert_eq!(cache.idle_bytes(), 64);
        let _t = cache.get(DType::F32, shape(16));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.idle_bytes, 0);
    }

    #[test]
    fn test_key_includes_dtype() {
        let cache = TensorCache::new(1024);
        drop(cache.get(DType::F32, shape(32)));
        let q = cache.get(DType::Q8, shape(32));
        assert_eq!(q.dtype(), DType::Q8);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_evicts_least_recently_released() {
        // Room for two 64-byte buffers.
        let cache = TensorCache::new(128);
        let a = cache.get(DType::F32, shape(16));
        let b = cache.get(DType::F32, Shape::new(vec![4, 4]));
        let c = cache.get(DType::F32, Shape::new(vec![2, 8]));
        drop(a);
        drop(b);
        drop(c);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.idle_bytes, 128);

        // `a` was released first and is gone; `b` is still idle.
        drop(cache.get(DType::F32, Shape::new(vec![4, 4])));
        assert_eq!(cache.stats().hits, 1);
        drop(cache.get(DType::F32, shape(16)));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_oversized_tensor_is_freed() {
        let cache = TensorCache::new(16);
        drop(cache.get(DType::F32, shape(64)));
        assert_eq!(cache.idle_bytes(), 0);
    }

    #[test]
    fn test_shared_tensors_are_not_cached() {
        let cache = TensorCache::new(1024);
        cache.release(Tensor::zeros(DType::F32, shape(4)).into_shared());
        assert_eq!(cache.idle_bytes(), 0);
    }

    #[test]
    fn test_into_inner_detaches() {
        let cache = TensorCache::new(1024);
        let t = cache.get(DType::F32, shape(8)).into_inner();
        drop(t);
        assert_eq!(cache.idle_bytes(), 0);
    }

    #[test]
    fn test_concurrent_get_release() {
        let cache = TensorCache::new(4096);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let cache = cache.clone();
                s.spawn(move || {
                    for i in 0..100 {
                        let mut t = cache.get(DType::F32, shape(8));
                        t.set(i as f32, &[0]).unwrap();
                    }
                });
            }
        });
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 400);
        assert!(stats.idle_bytes <= 4096);
        assert_eq!(stats.idle_bytes % 32, 0);
    }
}
