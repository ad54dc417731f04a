//! Worker pool diffing many already exported file pairs. The matching engine
//! for one pair stays single threaded; parallelism lives only here.

use log::warn;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::config::DiffConfig;
use crate::error::{DiffError, Result};
use crate::instruction::InstructionCache;
use crate::load;
use crate::matching::CancelToken;
use crate::program::Program;
use crate::DiffResult;

/// One pair of export files to diff.
#[derive(Debug, Clone)]
pub struct DiffJob {
    pub primary: PathBuf,
    pub secondary: PathBuf,
}

/// Outcome for one job. A failed load or diff is reported here and never
/// takes the whole batch down.
#[derive(Debug)]
pub struct JobReport {
    pub job: DiffJob,
    pub result: Result<DiffResult>,
}

/// Runs jobs across a fixed number of workers popping from a shared queue.
/// Each worker owns an instruction cache that is kept when consecutive jobs
/// share a primary or secondary file and cleared otherwise.
pub struct BatchRunner {
    config: DiffConfig,
    cancel: CancelToken,
}

type LoadedProgram = Option<(PathBuf, Program)>;

impl BatchRunner {
    pub fn new(config: DiffConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    /// Diff every job. Reports come back sorted by input paths; cancellation
    /// stops workers after their current pair.
    pub fn run(&self, jobs: Vec<DiffJob>) -> Vec<JobReport> {
        let workers = self.config.threads.min(jobs.len()).max(1);
        let queue: Mutex<VecDeque<DiffJob>> = Mutex::new(jobs.into());
        let reports: Mutex<Vec<JobReport>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker(&queue, &reports));
            }
        });

        let mut reports = reports.into_inner();
        reports.sort_by(|a, b| {
            (&a.job.primary, &a.job.secondary).cmp(&(&b.job.primary, &b.job.secondary))
        });
        reports
    }

    fn worker(&self, queue: &Mutex<VecDeque<DiffJob>>, reports: &Mutex<Vec<JobReport>>) {
        let mut cache = InstructionCache::new();
        let mut last_primary: LoadedProgram = None;
        let mut last_secondary: LoadedProgram = None;

        while !self.cancel.is_cancelled() {
            let Some(job) = queue.lock().pop_front() else {
                break;
            };

            let keep_primary = last_primary
                .as_ref()
                .is_some_and(|(path, _)| *path == job.primary);
            let keep_secondary = last_secondary
                .as_ref()
                .is_some_and(|(path, _)| *path == job.secondary);
            if !keep_primary && !keep_secondary {
                // Nothing carries over, so the interned instructions are dead
                // weight.
                last_primary = None;
                last_secondary = None;
                cache.clear();
            }

            let result = self.run_job(&job, &mut cache, &mut last_primary, &mut last_secondary);
            if let Err(error) = &result {
                warn!(
                    "{} vs {}: {}",
                    job.primary.display(),
                    job.secondary.display(),
                    error
                );
                last_primary = None;
                last_secondary = None;
                cache.clear();
            }
            reports.lock().push(JobReport { job, result });
        }
    }

    fn run_job(
        &self,
        job: &DiffJob,
        cache: &mut InstructionCache,
        last_primary: &mut LoadedProgram,
        last_secondary: &mut LoadedProgram,
    ) -> Result<DiffResult> {
        if !last_primary
            .as_ref()
            .is_some_and(|(path, _)| *path == job.primary)
        {
            let program = load::load_program(&job.primary, cache)?;
            *last_primary = Some((job.primary.clone(), program));
        }
        if !last_secondary
            .as_ref()
            .is_some_and(|(path, _)| *path == job.secondary)
        {
            let program = load::load_program(&job.secondary, cache)?;
            *last_secondary = Some((job.secondary.clone(), program));
        }

        let (Some((_, primary)), Some((_, secondary))) =
            (last_primary.as_ref(), last_secondary.as_ref())
        else {
            return Err(DiffError::Resource(
                "worker lost its loaded programs".to_string(),
            ));
        };
        crate::diff(primary, secondary, &self.config, &self.cancel)
    }
}
