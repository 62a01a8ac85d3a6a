//! Bounded worker pool for fanning row-wise and element-wise work out
//! across cores with a blocking join.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, TensorError};

/// How an index range is cut into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Number of tasks.
    pub tasks: usize,
    /// Elements per task. Every task has the same length.
    pub chunk: usize,
}

/// Cuts `length` indices into evenly sized tasks.
///
/// Picks the largest task count `s` with `2 <= s <= min(parallelism,
/// length)` that divides `length`. When no such count exists the range runs
/// as one task per element.
pub fn partition(length: usize, parallelism: usize) -> Partition {
    if length == 0 {
        return Partition { tasks: 0, chunk: 1 };
    }
    let max = parallelism.min(length);
    match (2..=max).rev().find(|s| length % s == 0) {
        Some(tasks) => Partition {
            tasks,
            chunk: length / tasks,
        },
        None => Partition {
            tasks: length,
            chunk: 1,
        },
    }
}

/// Fixed-size pool of worker threads.
///
/// All entry points block until every task has finished. A panicking task
/// propagates to the caller once the join completes.
#[derive(Debug)]
pub struct ExecutionPool {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl ExecutionPool {
    /// Build a pool of `threads` workers; 0 picks [`default_threads`].
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            default_threads()
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ir-tensor-{}", i))
            .build()
            .map_err(|e| TensorError::PoolBuild(e.to_string()))?;
        debug!(threads, "execution pool started");
        Ok(ExecutionPool { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `op` inside the pool, so nested rayon iterators use its workers.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Calls `f(i)` for every `i` in `start..end`. Each task of the
    /// partition of the range visits its indices in order on one worker.
    pub fn parallel_for<F>(&self, start: usize, end: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.parallel_chunks(start, end.saturating_sub(start), |first, len| {
            (first..first + len).for_each(&f)
        });
    }

    /// Like [`ExecutionPool::parallel_for`], failing the whole call on the
    /// first task error.
    pub fn try_parallel_for<E, F>(&self, start: usize, end: usize, f: F) -> std::result::Result<(), E>
    where
        E: Send,
        F: Fn(usize) -> std::result::Result<(), E> + Send + Sync,
    {
        let plan = partition(end.saturating_sub(start), self.threads);
        self.pool.install(|| {
            (0..plan.tasks).into_par_iter().try_for_each(|t| {
                let first = start + t * plan.chunk;
                (first..first + plan.chunk).try_for_each(&f)
            })
        })
    }

    /// Calls `f(chunk_start, chunk_len)` for each task of the partition of
    /// `offset..offset + length`.
    pub fn parallel_chunks<F>(&self, offset: usize, length: usize, f: F)
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let plan = partition(length, self.threads);
        self.pool.install(|| {
            (0..plan.tasks)
                .into_par_iter()
                .for_each(|t| f(offset + t * plan.chunk, plan.chunk))
        });
    }

    /// Hands each task of the partition of `data` a disjoint mutable chunk,
    /// along with the chunk's starting index.
    pub fn for_each_chunk_mut<T, F>(&self, data: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        let plan = partition(data.len(), self.threads);
        self.pool.install(|| {
            data.par_chunks_mut(plan.chunk)
                .enumerate()
                .for_each(|(t, chunk)| f(t * plan.chunk, chunk))
        });
    }

    /// Like [`ExecutionPool::for_each_chunk_mut`], failing the whole call on
    /// the first task error.
    pub fn try_for_each_chunk_mut<T, E, F>(&self, data: &mut [T], f: F) -> std::result::Result<(), E>
    where
        T: Send,
        E: Send,
        F: Fn(usize, &mut [T]) -> std::result::Result<(), E> + Send + Sync,
    {
        let plan = partition(data.len(), self.threads);
        self.pool.install(|| {
            data.par_chunks_mut(plan.chunk)
                .enumerate()
                .try_for_each(|(t, chunk)| f(t * plan.chunk, chunk))
        })
    }
}

/// Worker count used when none is configured: half the logical cores (a
/// stand-in for the physical core count), at least 2, never more than the
/// logical count.
pub fn default_threads() -> usize {
    let logical = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (logical / 2).max(2).min(logical)
}

enum GlobalState {
    Pending(Option<usize>),
    Started(Arc<ExecutionPool>),
}

static GLOBAL: Mutex<GlobalState> = parking_lot::const_mutex(GlobalState::Pending(None));

/// Sets the process-wide pool size. Allowed once, before first use.
pub fn configure_global(threads: usize) -> Result<()> {
    let mut state = GLOBAL.lock();
    match &*state {
        GlobalState::Started(_) => Err(TensorError::PoolAlreadyStarted),
        GlobalState::Pending(Some(n)) => Err(TensorError::InvalidConfig(format!(
            "execution pool already configured with {} threads",
            n
        ))),
        GlobalState::Pending(None) => {
            *state = GlobalState::Pending(Some(threads));
            Ok(())
        }
    }
}

/// The process-wide pool, started on first call.
pub fn global_pool() -> Result<Arc<ExecutionPool>> {
    let mut state = GLOBAL.lock();
    match &*state {
        GlobalState::Started(pool) => Ok(Arc::clone(pool)),
        GlobalState::Pending(threads) => {
            let pool = Arc::new(ExecutionPool::new(threads.unwrap_or(0))?);
            *state = GlobalState::Started(Arc::clone(&pool));
            Ok(pool)
        }
    }
}
