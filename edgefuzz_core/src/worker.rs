use crate::corpus::{Corpus, EntryId};
use crate::coverage::{CoverageCollector, CoverageError, ExecutionResult};
use crate::edge_map::SharedEdgeMap;
use crate::executor::{ExecutionDriver, ExecutionStatus};
use crate::input::Input;
use crate::mutator::Mutator;
use crate::scheduler::{CorpusScheduler, SchedulerError, Submission};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub executions: u64,
    pub retained: u64,
    pub solutions: u64,
    pub aborted_runs: u64,
    pub evicted: u64,
}

impl WorkerStats {
    pub fn absorb(&mut self, other: &WorkerStats) {
        self.executions += other.executions;
        self.retained += other.retained;
        self.solutions += other.solutions;
        self.aborted_runs += other.aborted_runs;
        self.evicted += other.evicted;
    }
}

/// Outcome of one [`Worker::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// The entry the executed input was mutated from.
    pub parent: EntryId,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Edges the run added to the global map.
    pub new_edges: usize,
    pub submission: Submission,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One fuzzing thread: a private collector and edge map replica, a driver for the
/// target and a mutator.
///
/// The scheduler and global map are only locked between executions, never while the
/// target runs.
pub struct Worker<D, M> {
    id: usize,
    collector: CoverageCollector,
    driver: D,
    mutator: M,
    rng: ChaCha8Rng,
    stats: WorkerStats,
}

impl<D, M> Worker<D, M> {
    /// `collector` must have the target's sites registered in the same order as every
    /// other worker's, so edge indices agree with the global map.
    pub fn new(
        id: usize,
        collector: CoverageCollector,
        driver: D,
        mutator: M,
        rng_seed: u64,
    ) -> Self {
        Self {
            id,
            collector,
            driver,
            mutator,
            rng: ChaCha8Rng::seed_from_u64(rng_seed),
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn collector(&self) -> &CoverageCollector {
        &self.collector
    }

    fn execute<I>(
        &mut self,
        input: &I,
        global: &SharedEdgeMap,
    ) -> Result<(ExecutionResult, Option<i32>, usize), WorkerError>
    where
        I: Input,
        D: ExecutionDriver<I>,
    {
        let (mut result, exit_code) = self.driver.run_once(input, &mut self.collector)?;
        self.stats.executions += 1;
        if result.is_aborted() {
            self.stats.aborted_runs += 1;
            return Ok((result, exit_code, 0));
        }

        let globally_new = global.merge_run(&result)?;
        tracing::debug!(
            worker = self.id,
            run = result.run_id,
            status = ?result.status,
            local_new = result.delta.len(),
            global_new = globally_new.len(),
            "run finished"
        );
        // Another worker may already have reported some of the local delta. Entries
        // only claim the edges they added to the global map.
        let new_edges = globally_new.len();
        result.found_new_edge = new_edges > 0;
        result.delta = globally_new;
        Ok((result, exit_code, new_edges))
    }

    fn count(&mut self, submission: &Submission) {
        if submission.retained.is_some() {
            self.stats.retained += 1;
        }
        if submission.solution {
            self.stats.solutions += 1;
        }
        self.stats.evicted += submission.evicted.len() as u64;
    }

    /// Runs a seed and retains it regardless of novelty.
    pub fn run_seed<I, C>(
        &mut self,
        input: I,
        origin: &str,
        scheduler: &Mutex<CorpusScheduler<I, C>>,
        global: &SharedEdgeMap,
    ) -> Result<Option<EntryId>, WorkerError>
    where
        I: Input,
        C: Corpus<I>,
        D: ExecutionDriver<I>,
    {
        let (result, _exit_code, _new_edges) = self.execute(&input, global)?;
        let retained = lock(scheduler).add_seed(input, &result, origin)?;
        if retained.is_some() {
            self.stats.retained += 1;
        }
        Ok(retained)
    }

    /// Selects and mutates an entry, runs the mutant and submits it.
    ///
    /// The mutant is only submitted when its run found globally new edges or produced a
    /// solution.
    pub fn step<I, C>(
        &mut self,
        scheduler: &Mutex<CorpusScheduler<I, C>>,
        global: &SharedEdgeMap,
    ) -> Result<StepReport, WorkerError>
    where
        I: Input,
        C: Corpus<I>,
        D: ExecutionDriver<I>,
        M: Mutator<I>,
    {
        let (parent, mutant) = lock(scheduler).mutate_next(&mut self.mutator, &mut self.rng)?;
        let (result, exit_code, new_edges) = self.execute(&mutant, global)?;

        let mut report = StepReport {
            parent,
            status: result.status.clone(),
            exit_code,
            new_edges,
            submission: Submission::default(),
        };
        if result.is_aborted() {
            tracing::warn!(
                worker = self.id,
                run = result.run_id,
                failure = ?result.failure,
                "run aborted by a coverage error"
            );
            report.submission.aborted = true;
            return Ok(report);
        }

        if result.found_new_edge || result.is_solution() {
            let mut guard = lock(scheduler);
            guard.report_feedback(parent, &result);
            report.submission = guard.submit(mutant, &result)?;
            drop(guard);
            self.count(&report.submission);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{InMemoryCorpus, OnDiskCorpus};
    use crate::executor::InProcessDriver;
    use crate::guard::{EdgeIndex, Guard};
    use crate::mutator::FlipSingleByteMutator;
    use crate::oracle::CrashOracle;

    type TestScheduler = CorpusScheduler<Vec<u8>, InMemoryCorpus<Vec<u8>>>;

    fn scheduler() -> Mutex<TestScheduler> {
        Mutex::new(CorpusScheduler::new(
            InMemoryCorpus::new(),
            Box::new(CrashOracle::new()),
            64,
        ))
    }

    fn one_byte_target_worker(
        rng_seed: u64,
    ) -> Worker<
        InProcessDriver<impl FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError>>,
        FlipSingleByteMutator,
    > {
        let mut collector = CoverageCollector::new();
        let guards = collector.on_site_table_init(3).unwrap();
        let driver = InProcessDriver::new(move |data: &[u8], cov: &mut CoverageCollector| {
            cov.on_edge(guards[0])?;
            match data.first() {
                Some(b'!') => panic!("bang"),
                Some(&byte) if byte > 0x80 => cov.on_edge(guards[1])?,
                Some(_) => cov.on_edge(guards[2])?,
                None => {}
            }
            Ok(0)
        });
        Worker::new(0, collector, driver, FlipSingleByteMutator::new(), rng_seed)
    }

    #[test]
    fn run_seed_retains_seed_and_marks_global_map() {
        let mut worker = one_byte_target_worker(1);
        let scheduler = scheduler();
        let global = SharedEdgeMap::default();

        let id = worker
            .run_seed(vec![0x10u8], "seed", &scheduler, &global)
            .unwrap();
        assert_eq!(id, Some(0));
        assert_eq!(global.seen_count(), 2);
        assert_eq!(worker.stats().executions, 1);
        assert_eq!(worker.stats().retained, 1);
    }

    #[test]
    fn step_without_seeds_reports_empty_corpus() {
        let mut worker = one_byte_target_worker(2);
        let scheduler = scheduler();
        let global = SharedEdgeMap::default();
        assert!(matches!(
            worker.step(&scheduler, &global),
            Err(WorkerError::Scheduler(SchedulerError::CorpusEmpty))
        ));
    }

    #[test]
    fn steps_only_retain_globally_new_coverage() {
        let mut worker = one_byte_target_worker(3);
        let scheduler = scheduler();
        let global = SharedEdgeMap::default();
        worker
            .run_seed(vec![0x10u8], "seed", &scheduler, &global)
            .unwrap();

        for _ in 0..200 {
            let report = worker.step(&scheduler, &global).unwrap();
            if report.submission.retained.is_some() {
                assert!(report.new_edges > 0);
            }
        }
        let stats = *worker.stats();
        assert_eq!(stats.executions, 201);
        assert_eq!(global.seen_count(), 3, "All three edges are reachable by mutation");
        let corpus_len = lock(&scheduler).corpus().len() as u64;
        assert_eq!(corpus_len, 1 + stats.retained - stats.evicted);
    }

    #[test]
    fn step_skips_submission_of_known_coverage() {
        let mut worker = one_byte_target_worker(4);
        let scheduler = scheduler();
        let global = SharedEdgeMap::default();
        worker
            .run_seed(vec![0x10u8], "seed", &scheduler, &global)
            .unwrap();
        // Another worker already found the remaining edge.
        let mut other = one_byte_target_worker(5);
        other
            .run_seed(vec![0x90u8], "other", &scheduler, &global)
            .unwrap();

        for _ in 0..50 {
            let report = worker.step(&scheduler, &global).unwrap();
            assert_eq!(report.new_edges, 0);
            assert!(report.submission.retained.is_none());
        }
    }

    /// `0xFF` hits edge 0 and then a guard nobody registered; `0x02` also hits edge 1.
    fn stray_guard_worker(
        id: usize,
    ) -> Worker<
        InProcessDriver<impl FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError>>,
        FlipSingleByteMutator,
    > {
        let mut collector = CoverageCollector::new();
        let guards = collector.on_site_table_init(2).unwrap();
        let driver = InProcessDriver::new(move |data: &[u8], cov: &mut CoverageCollector| {
            cov.on_edge(guards[0])?;
            match data.first() {
                Some(0xFF) => cov.on_edge(Guard::from_raw(99))?,
                Some(0x02) => cov.on_edge(guards[1])?,
                _ => {}
            }
            Ok(0)
        });
        Worker::new(id, collector, driver, FlipSingleByteMutator::new(), id as u64)
    }

    fn deltas(scheduler: &Mutex<TestScheduler>) -> Vec<(EntryId, Vec<usize>)> {
        let scheduler = lock(scheduler);
        scheduler
            .corpus()
            .ids()
            .into_iter()
            .filter_map(|id| scheduler.corpus().get(id).map(|entry| (id, entry)))
            .map(|(id, entry)| (id, entry.delta().iter().map(|edge| edge.get()).collect()))
            .collect()
    }

    #[test]
    fn aborted_run_does_not_hide_edges_from_later_inputs() {
        let mut worker = stray_guard_worker(0);
        let scheduler = Mutex::new(CorpusScheduler::new(
            InMemoryCorpus::new(),
            Box::new(CrashOracle::new()),
            1,
        ));
        let global = SharedEdgeMap::default();

        assert_eq!(
            worker.run_seed(vec![0xFFu8], "stray", &scheduler, &global).unwrap(),
            None
        );
        assert_eq!(worker.stats().aborted_runs, 1);
        assert!(!worker.collector().edge_map().is_seen(EdgeIndex::new(0)));

        let first = worker.run_seed(vec![0x01u8], "a", &scheduler, &global).unwrap();
        let second = worker.run_seed(vec![0x02u8], "b", &scheduler, &global).unwrap();
        assert_eq!(first, Some(0));
        assert_eq!(second, Some(1));
        // Both entries uniquely cover an edge, so neither is evicted.
        assert_eq!(deltas(&scheduler), vec![(0, vec![0]), (1, vec![1])]);
    }

    #[test]
    fn entries_claim_only_globally_new_edges() {
        let scheduler = scheduler();
        let global = SharedEdgeMap::default();
        let mut first = stray_guard_worker(0);
        let mut second = stray_guard_worker(1);

        first.run_seed(vec![0x01u8], "a", &scheduler, &global).unwrap();
        // Edge 0 is new to the second worker's replica but not to the global map.
        second.run_seed(vec![0x02u8], "b", &scheduler, &global).unwrap();
        assert_eq!(deltas(&scheduler), vec![(0, vec![0]), (1, vec![1])]);
    }

    #[test]
    fn unstorable_seed_does_not_end_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = OnDiskCorpus::<Vec<u8>>::new(dir.path().to_path_buf()).unwrap();
        let scheduler = Mutex::new(CorpusScheduler::new(
            corpus,
            Box::new(CrashOracle::new()),
            64,
        ));
        let global = SharedEdgeMap::default();
        let seed = vec![0x10u8];
        std::fs::create_dir(dir.path().join(format!("{}.fuzzinput", seed.content_hash())))
            .unwrap();

        let mut worker = one_byte_target_worker(6);
        assert_eq!(worker.run_seed(seed, "seed", &scheduler, &global).unwrap(), None);
        assert!(lock(&scheduler).corpus().is_empty());
        assert_eq!(
            worker.run_seed(vec![0x20u8], "seed", &scheduler, &global).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn stats_absorb_sums_counters() {
        let mut total = WorkerStats::default();
        let one = WorkerStats {
            executions: 3,
            retained: 1,
            solutions: 1,
            aborted_runs: 0,
            evicted: 2,
        };
        total.absorb(&one);
        total.absorb(&one);
        assert_eq!(total.executions, 6);
        assert_eq!(total.evicted, 4);
    }
}
