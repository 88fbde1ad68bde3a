//! CPU-bound fan-out. Workers get read-only tasks and hand back plain values;
//! only the caller touches the database.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use super::record::{analyze_record, AnalysisTask, AnalyzedRecord};
use super::tokenizer::TokenCounter;
use crate::error::RecordError;

pub type TaskOutcome = Result<AnalyzedRecord, RecordError>;

pub struct WorkerPool {
    pool: Option<ThreadPool>,
    chunk_size: usize,
    threshold: usize,
}

impl WorkerPool {
    /// `workers == 0` or a pool that cannot be built leaves the pool
    /// disabled; every batch then runs sequentially.
    pub fn new(workers: usize, chunk_size: usize, threshold: usize) -> Self {
        let pool = if workers == 0 {
            None
        } else {
            match ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|idx| format!("analyze-{idx}"))
                .build()
            {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("Worker pool unavailable, analysis runs sequentially: {}", e);
                    None
                }
            }
        };
        Self {
            pool,
            chunk_size: chunk_size.max(1),
            threshold,
        }
    }

    pub fn disabled() -> Self {
        Self {
            pool: None,
            chunk_size: 1,
            threshold: usize::MAX,
        }
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.current_num_threads())
    }

    pub fn is_parallel_for(&self, batch_len: usize) -> bool {
        self.pool.is_some() && batch_len > self.threshold
    }

    /// Analyze every task, in input order.
    pub fn run(&self, tasks: &[AnalysisTask], counter: &TokenCounter) -> Vec<TaskOutcome> {
        if self.is_parallel_for(tasks.len()) {
            if let Some(results) = self.run_parallel(tasks, counter) {
                return results;
            }
            warn!("Worker pool failed, reprocessing {} records sequentially", tasks.len());
        }
        run_sequential(tasks, counter)
    }

    fn run_parallel(&self, tasks: &[AnalysisTask], counter: &TokenCounter) -> Option<Vec<TaskOutcome>> {
        let pool = self.pool.as_ref()?;
        debug!(
            "Dispatching {} records to {} workers (chunk {})",
            tasks.len(),
            pool.current_num_threads(),
            self.chunk_size
        );
        catch_unwind(AssertUnwindSafe(|| {
            pool.install(|| {
                tasks
                    .par_chunks(self.chunk_size)
                    .flat_map_iter(|chunk| {
                        chunk
                            .iter()
                            .map(|t| analyze_record(t, counter))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
        }))
        .ok()
    }
}

pub fn run_sequential(tasks: &[AnalysisTask], counter: &TokenCounter) -> Vec<TaskOutcome> {
    tasks.iter().map(|t| analyze_record(t, counter)).collect()
}
