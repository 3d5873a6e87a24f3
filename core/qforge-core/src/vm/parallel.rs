//! Parallel pipeline execution
//!
//! Rayon-backed worker pool used by `ParallelScanTable`. A pipeline's
//! worker function runs once per partition; the dispatching instruction
//! returns only after every worker has finished, which is the hard barrier
//! the pipeline ordering guarantee relies on.

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::error::{ForgeError, ForgeResult};

/// Parallelization policy for pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelizationPolicy {
    /// Thread count from available CPUs (capped to avoid oversubscription)
    #[default]
    Auto,
    /// Fixed number of threads
    Fixed(usize),
    /// Run parallel-eligible pipelines serially (deterministic row order)
    Disabled,
}

/// Worker pool shared by all parallel pipelines of one execution context.
pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    policy: ParallelizationPolicy,
}

impl WorkerPool {
    pub fn new(policy: ParallelizationPolicy) -> ForgeResult<Self> {
        let pool = match policy {
            ParallelizationPolicy::Disabled => None,
            ParallelizationPolicy::Auto | ParallelizationPolicy::Fixed(_) => {
                let threads = Self::thread_count_for(policy);
                Some(
                    ThreadPoolBuilder::new()
                        .num_threads(threads)
                        .thread_name(|i| format!("qforge-worker-{i}"))
                        .build()
                        .map_err(|e| {
                            ForgeError::Storage(format!("failed to create thread pool: {e}"))
                        })?,
                )
            }
        };
        Ok(Self { pool, policy })
    }

    pub fn policy(&self) -> ParallelizationPolicy {
        self.policy
    }

    /// Number of partitions a parallel scan should split into.
    pub fn partition_count(&self) -> usize {
        match &self.pool {
            None => 1,
            Some(pool) => pool.current_num_threads().max(1),
        }
    }

    fn thread_count_for(policy: ParallelizationPolicy) -> usize {
        match policy {
            ParallelizationPolicy::Fixed(n) => n.max(1),
            // Cap at 16 to avoid oversubscription on large hosts
            _ => num_cpus::get().min(16),
        }
    }

    /// Run `f` once per partition index and wait for all of them. The
    /// first error wins; the call does not return until every worker has
    /// stopped.
    pub fn run_partitions(
        &self,
        parts: usize,
        f: &(dyn Fn(usize) -> ForgeResult<()> + Sync),
    ) -> ForgeResult<()> {
        match &self.pool {
            None => {
                for part in 0..parts {
                    f(part)?;
                }
                Ok(())
            }
            Some(pool) => pool.install(|| (0..parts).into_par_iter().try_for_each(f)),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        // Auto can only fail if the OS refuses thread creation; fall back
        // to serial execution in that case.
        WorkerPool::new(ParallelizationPolicy::Auto).unwrap_or(WorkerPool {
            pool: None,
            policy: ParallelizationPolicy::Disabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn disabled_policy_runs_serially() {
        let pool = WorkerPool::new(ParallelizationPolicy::Disabled).unwrap();
        assert_eq!(pool.partition_count(), 1);
        let hits = AtomicUsize::new(0);
        pool.run_partitions(4, &|_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fixed_policy_runs_all_partitions() {
        let pool = WorkerPool::new(ParallelizationPolicy::Fixed(2)).unwrap();
        assert_eq!(pool.partition_count(), 2);
        let hits = AtomicUsize::new(0);
        pool.run_partitions(8, &|_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn first_error_propagates() {
        let pool = WorkerPool::new(ParallelizationPolicy::Fixed(2)).unwrap();
        let result = pool.run_partitions(4, &|part| {
            if part == 2 {
                Err(ForgeError::Storage("boom".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
    }
}
