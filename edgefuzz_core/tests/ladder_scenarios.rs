use edgefuzz_core::coverage::{CoverageCollector, CoverageError, ExecutionResult};
use edgefuzz_core::edge_map::SharedEdgeMap;
use edgefuzz_core::executor::{ExecutionDriver, ExecutionStatus, InProcessDriver};
use edgefuzz_core::guard::{EdgeIndex, Guard};
use edgefuzz_core::ladder::{GOAL_EXIT_CODE, LadderTarget};
use edgefuzz_core::{
    Corpus, CorpusScheduler, CrashOracle, FlipSingleByteMutator, InMemoryCorpus, OnDiskCorpus,
    Worker,
};
use proptest::prelude::*;
use std::sync::Mutex;
use tempfile::tempdir;

fn ladder_collector() -> (CoverageCollector, LadderTarget) {
    let mut collector = CoverageCollector::new();
    let target = LadderTarget::register(&mut collector).unwrap();
    (collector, target)
}

fn run(
    collector: &mut CoverageCollector,
    target: &LadderTarget,
    input: &[u8],
) -> (ExecutionResult, Option<i32>) {
    let mut driver =
        InProcessDriver::new(|data: &[u8], cov: &mut CoverageCollector| target.run(data, cov));
    driver.run_once(&input.to_vec(), collector).unwrap()
}

fn edges(range: std::ops::RangeInclusive<usize>) -> Vec<EdgeIndex> {
    range.map(EdgeIndex::new).collect()
}

#[test]
fn partial_match_then_full_match_then_rerun() {
    let (mut collector, target) = ladder_collector();
    assert_eq!(collector.edge_map().size(), 16);
    let mut scheduler = CorpusScheduler::new(
        InMemoryCorpus::<Vec<u8>>::new(),
        Box::new(CrashOracle::new()),
        64,
    );

    let (partial, exit_code) = run(&mut collector, &target, b"ABCx");
    assert_eq!(exit_code, Some(3));
    assert!(partial.found_new_edge);
    assert_eq!(partial.delta, edges(0..=2));
    let submission = scheduler.submit(b"ABCx".to_vec(), &partial).unwrap();
    let id = submission.retained.expect("New coverage is retained");
    let entry = scheduler.corpus().get(id).unwrap();
    assert_eq!(
        entry.delta().iter().copied().collect::<Vec<_>>(),
        edges(0..=2)
    );

    let winning = LadderTarget::winning_input();
    let (full, exit_code) = run(&mut collector, &target, &winning);
    assert_eq!(exit_code, Some(GOAL_EXIT_CODE));
    assert_eq!(full.touched, edges(0..=15));
    assert_eq!(full.delta, edges(3..=15));
    scheduler.submit(winning.clone(), &full).unwrap();
    assert_eq!(scheduler.corpus().len(), 2);

    let (rerun, _) = run(&mut collector, &target, &winning);
    assert!(!rerun.found_new_edge);
    assert!(rerun.delta.is_empty());
    let dropped = scheduler.submit(winning, &rerun).unwrap();
    assert!(dropped.retained.is_none());
    assert_eq!(scheduler.corpus().len(), 2);
}

#[test]
fn target_reading_unregistered_guard_is_discarded() {
    let (mut collector, _target) = ladder_collector();
    let (mut other, foreign) = {
        let mut other = CoverageCollector::new();
        other.on_site_table_init(40).unwrap();
        let foreign = LadderTarget::register(&mut other).unwrap();
        (other, foreign)
    };
    // Guards assigned by an unrelated table are unknown here.
    let (result, exit_code) = run(&mut collector, &foreign, b"A");
    assert_eq!(exit_code, None);
    assert!(matches!(
        result.failure,
        Some(CoverageError::UnknownGuard { .. })
    ));
    assert_eq!(collector.edge_map().seen_count(), 0);

    let mut scheduler = CorpusScheduler::new(
        InMemoryCorpus::<Vec<u8>>::new(),
        Box::new(CrashOracle::new()),
        64,
    );
    assert!(scheduler.submit(b"A".to_vec(), &result).unwrap().aborted);
    assert!(scheduler.corpus().is_empty());

    let (own, _) = run(&mut other, &foreign, b"A");
    assert!(own.found_new_edge);
}

#[test]
fn aborted_run_leaves_its_edges_for_the_next_clean_input() {
    let mut collector = CoverageCollector::new();
    let guards = collector.on_site_table_init(2).unwrap();
    let mut driver = InProcessDriver::new(move |data: &[u8], cov: &mut CoverageCollector| {
        cov.on_edge(guards[0])?;
        if data.first() == Some(&0xFF) {
            cov.on_edge(Guard::from_raw(1000))?;
        }
        Ok(0)
    });
    let mut scheduler = CorpusScheduler::new(
        InMemoryCorpus::<Vec<u8>>::new(),
        Box::new(CrashOracle::new()),
        64,
    );

    let (aborted, _) = driver.run_once(&vec![0xFFu8], &mut collector).unwrap();
    assert!(scheduler.submit(vec![0xFF], &aborted).unwrap().aborted);
    assert!(!collector.edge_map().is_seen(EdgeIndex::new(0)));

    let (clean, exit_code) = driver.run_once(&vec![0x01u8], &mut collector).unwrap();
    assert_eq!(exit_code, Some(0));
    assert!(clean.found_new_edge);
    assert_eq!(clean.delta, vec![EdgeIndex::new(0)]);
    let id = scheduler
        .submit(vec![0x01], &clean)
        .unwrap()
        .retained
        .expect("The first clean run reaching edge 0 is retained");
    let entry = scheduler.corpus().get(id).unwrap();
    assert!(entry.delta().contains(&EdgeIndex::new(0)));
}

#[test]
fn parallel_workers_share_one_global_map() {
    let global = SharedEdgeMap::default();
    let scheduler = Mutex::new(CorpusScheduler::new(
        InMemoryCorpus::<Vec<u8>>::new(),
        Box::new(CrashOracle::new()),
        256,
    ));

    let mut workers = Vec::new();
    for id in 0..4 {
        let mut collector = CoverageCollector::with_edge_map(global.snapshot().to_edge_map());
        let target = LadderTarget::register(&mut collector).unwrap();
        let driver = InProcessDriver::new(target.into_harness());
        workers.push(Worker::new(
            id,
            collector,
            driver,
            FlipSingleByteMutator::new(),
            id as u64,
        ));
    }
    workers[0]
        .run_seed(b"A".to_vec(), "seed", &scheduler, &global)
        .unwrap();
    assert_eq!(global.seen_count(), 1);

    let stats: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut worker| {
                let scheduler = &scheduler;
                let global = &global;
                scope.spawn(move || {
                    for _ in 0..500 {
                        worker.step(scheduler, global).unwrap();
                    }
                    *worker.stats()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let executions: u64 = stats.iter().map(|s| s.executions).sum();
    assert_eq!(executions, 4 * 500 + 1);

    let scheduler = scheduler.into_inner().unwrap();
    let snapshot = global.snapshot();
    for id in scheduler.corpus().ids() {
        let entry = scheduler.corpus().get(id).unwrap();
        assert!(entry.delta().iter().all(|&edge| snapshot.is_seen(edge)));
    }
    // Rungs are climbed in order, so the seen edges form a prefix of the ladder.
    let seen: Vec<usize> = snapshot.seen_edges().map(|edge| edge.get()).collect();
    assert_eq!(seen, (0..seen.len()).collect::<Vec<_>>());
    assert!(!seen.is_empty());
}

#[test]
fn on_disk_session_resumes_with_known_coverage() {
    let dir = tempdir().unwrap();
    let winning = LadderTarget::winning_input();
    {
        let corpus = OnDiskCorpus::<Vec<u8>>::new(dir.path().to_path_buf()).unwrap();
        let mut scheduler = CorpusScheduler::new(corpus, Box::new(CrashOracle::new()), 64);
        let (mut collector, target) = ladder_collector();
        let (result, _) = run(&mut collector, &target, &winning);
        scheduler.submit(winning.clone(), &result).unwrap();
        scheduler.next().unwrap();
        scheduler.corpus_mut().flush().unwrap();
        scheduler
            .corpus()
            .save_edge_map(collector.edge_map())
            .unwrap();
    }

    let corpus = OnDiskCorpus::<Vec<u8>>::new(dir.path().to_path_buf()).unwrap();
    assert_eq!(corpus.len(), 1);
    assert_eq!(corpus.skipped_entries(), 0);
    let entry = corpus.get(corpus.ids()[0]).unwrap();
    assert_eq!(entry.input(), &winning);
    assert_eq!(entry.exec_count(), 1);

    let restored = corpus.load_edge_map().unwrap().expect("checkpoint was saved");
    let mut collector = CoverageCollector::with_edge_map(restored);
    let target = LadderTarget::register(&mut collector).unwrap();
    let (rerun, _) = run(&mut collector, &target, &winning);
    assert!(!rerun.found_new_edge, "Coverage survives the restart");
}

#[test]
fn crashing_harness_becomes_a_solution() {
    let mut collector = CoverageCollector::new();
    let guards = collector.on_site_table_init(1).unwrap();
    let mut driver = InProcessDriver::new(move |data: &[u8], cov: &mut CoverageCollector| {
        cov.on_edge(guards[0])?;
        if data == b"BAD" {
            panic!("BAD input detected by harness!");
        }
        Ok(0)
    });
    let mut scheduler = CorpusScheduler::new(
        InMemoryCorpus::<Vec<u8>>::new(),
        Box::new(CrashOracle::new()),
        64,
    );

    let (result, _) = driver.run_once(&b"BAD".to_vec(), &mut collector).unwrap();
    assert!(matches!(result.status, ExecutionStatus::Crash(_)));
    assert!(!collector.is_run_open());
    assert!(scheduler.submit(b"BAD".to_vec(), &result).unwrap().solution);
    let solutions = scheduler.corpus().solutions();
    assert_eq!(solutions.len(), 1);
    assert!(solutions[0].description.contains("BAD input detected"));
}

proptest! {
    #[test]
    fn rerunning_any_input_finds_nothing_new(input in proptest::collection::vec(any::<u8>(), 0..24)) {
        let (mut collector, target) = ladder_collector();
        let (first, _) = run(&mut collector, &target, &input);
        let (second, _) = run(&mut collector, &target, &input);
        prop_assert!(!second.found_new_edge);
        prop_assert!(second.delta.is_empty());
        prop_assert_eq!(first.touched, second.touched);
    }

    #[test]
    fn edge_map_never_shrinks_across_runs(inputs in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..20), 1..8)) {
        let (mut collector, target) = ladder_collector();
        let mut seen = collector.edge_map().seen_count();
        for input in &inputs {
            run(&mut collector, &target, input);
            prop_assert_eq!(collector.edge_map().size(), 16);
            let now = collector.edge_map().seen_count();
            prop_assert!(now >= seen);
            seen = now;
        }
    }
}
