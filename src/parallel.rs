//! Runtime and thread pool configuration
//!
//! Downloads run on a tokio multi-thread runtime with at most `workers` tasks
//! in flight. Resampling reductions run on rayon's global pool, sized by
//! `compute_threads` (all cores when unset).

use crate::config::PipelineConfig;
use crate::errors::{FetchError, Result};
use rayon::ThreadPoolBuilder;
use tracing::{debug, info};

/// Concurrency settings for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    pub workers: usize,
    pub compute_threads: Option<usize>,
}

impl ParallelConfig {
    pub fn new(workers: usize, compute_threads: Option<usize>) -> Self {
        Self {
            workers: workers.max(1),
            compute_threads,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.workers, config.compute_threads)
    }

    /// Use every available core for reductions
    pub fn all_cores(workers: usize) -> Self {
        Self::new(workers, Some(num_cpus::get()))
    }

    pub fn compute_threads(&self) -> usize {
        self.compute_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Build the global rayon pool. Fails if one was already built.
    pub fn setup_global_pool(&self) -> Result<()> {
        let threads = self.compute_threads();
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("reduce-{i}"))
            .build_global()
            .map_err(|e| {
                FetchError::ThreadPoolError(format!(
                    "failed to initialize compute pool with {threads} threads: {e}"
                ))
            })?;
        debug!(threads, "compute pool ready");
        Ok(())
    }

    /// Multi-thread tokio runtime for network and file I/O.
    pub fn build_runtime(&self) -> Result<tokio::runtime::Runtime> {
        let io_threads = self.workers.clamp(2, num_cpus::get().max(2));
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads)
            .thread_name("fetch-io")
            .enable_all()
            .build()
            .map_err(|e| FetchError::ThreadPoolError(format!("failed to start runtime: {e}")))
    }

    pub fn info(&self) -> ParallelInfo {
        ParallelInfo {
            workers: self.workers,
            compute_threads: rayon::current_num_threads(),
            available_cores: num_cpus::get(),
        }
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self::new(4, None)
    }
}

/// What the process ended up running with
#[derive(Debug, Clone)]
pub struct ParallelInfo {
    pub workers: usize,
    pub compute_threads: usize,
    pub available_cores: usize,
}

impl ParallelInfo {
    pub fn log(&self) {
        info!(
            workers = self.workers,
            compute_threads = self.compute_threads,
            cores = self.available_cores,
            "parallelism"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_never_drop_below_one() {
        assert_eq!(ParallelConfig::new(0, None).workers, 1);
        assert_eq!(ParallelConfig::default().workers, 4);
        assert_eq!(ParallelConfig::new(2, Some(3)).compute_threads(), 3);
        assert!(ParallelConfig::new(2, None).compute_threads() >= 1);
    }

    #[test]
    fn follows_the_pipeline_config() {
        let config = PipelineConfig {
            workers: 6,
            compute_threads: Some(2),
            ..PipelineConfig::default()
        };
        assert_eq!(ParallelConfig::from_config(&config), ParallelConfig::new(6, Some(2)));
    }

    #[test]
    fn runtime_runs_futures() {
        let runtime = ParallelConfig::new(2, Some(1)).build_runtime().unwrap();
        assert_eq!(runtime.block_on(async { 40 + 2 }), 42);
    }
}
