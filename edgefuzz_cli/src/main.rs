use edgefuzz_core::config::{CorpusType, EdgefuzzConfig};
use edgefuzz_core::corpus::{Corpus, InMemoryCorpus, OnDiskCorpus, load_seed_inputs};
use edgefuzz_core::coverage::{CoverageCollector, CoverageError};
use edgefuzz_core::edge_map::SharedEdgeMap;
use edgefuzz_core::executor::InProcessDriver;
use edgefuzz_core::ladder::{GOAL_EXIT_CODE, LadderTarget};
use edgefuzz_core::mutator::FlipSingleByteMutator;
use edgefuzz_core::oracle::CrashOracle;
use edgefuzz_core::scheduler::CorpusScheduler;
use edgefuzz_core::worker::{Worker, WorkerStats};

use clap::Parser;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(short, long)]
    threads: Option<usize>,
    /// Persist the corpus in this directory (switches to the on-disk corpus).
    #[clap(long, value_parser)]
    corpus_dir: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `edgefuzz_core=trace`. Overrides `RUST_LOG`.
    #[clap(long)]
    log_level: Option<String>,
}

struct CampaignSummary {
    stats: WorkerStats,
    elapsed: Duration,
    goal_reached: bool,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<EdgefuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            tracing::info!(path = ?config_path, "loading configuration");
            EdgefuzzConfig::load_from_file(config_path)?
        }
        None => {
            // No config file specified via CLI, load default
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                tracing::info!(path = ?default_config_path, "loading default configuration");
                EdgefuzzConfig::load_from_file(&default_config_path)?
            } else {
                tracing::info!("no configuration file found, using built-in defaults");
                EdgefuzzConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(threads) = cli.threads {
        config.fuzzer.threads = threads;
    }
    if let Some(corpus_dir) = &cli.corpus_dir {
        config.corpus.corpus_type = CorpusType::OnDisk;
        config.corpus.on_disk_path = corpus_dir.clone();
    }
    if config.fuzzer.threads == 0 {
        anyhow::bail!("threads must be at least 1");
    }
    Ok(config)
}

/// Every worker registers the ladder against a replica of the global map, in the same
/// order, so edge indices agree.
fn ladder_worker(
    id: usize,
    config: &EdgefuzzConfig,
    global: &SharedEdgeMap,
) -> Result<
    Worker<
        InProcessDriver<impl FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError>>,
        FlipSingleByteMutator,
    >,
    anyhow::Error,
> {
    let mut collector = CoverageCollector::with_edge_map(global.snapshot().to_edge_map());
    let target = LadderTarget::register(&mut collector)?;
    let driver =
        InProcessDriver::new(target.into_harness()).with_timeout(config.executor.timeout());
    Ok(Worker::new(
        id,
        collector,
        driver,
        FlipSingleByteMutator::new(),
        config.fuzzer.rng_seed.wrapping_add(id as u64),
    ))
}

fn fuzz<C: Corpus<Vec<u8>>>(
    config: &EdgefuzzConfig,
    scheduler: &Mutex<CorpusScheduler<Vec<u8>, C>>,
    global: &SharedEdgeMap,
) -> Result<CampaignSummary, anyhow::Error> {
    let mut seeding_worker = ladder_worker(0, config, global)?;
    let seed_paths = config.corpus.initial_seed_paths.clone().unwrap_or_default();
    let seeds: Vec<(PathBuf, Vec<u8>)> = load_seed_inputs(&seed_paths)?;
    for (path, input) in seeds {
        let origin = format!("Seed: {}", path.display());
        seeding_worker.run_seed(input, &origin, scheduler, global)?;
    }
    let corpus_is_empty = scheduler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .corpus()
        .is_empty();
    if corpus_is_empty {
        seeding_worker.run_seed(b"INIT".to_vec(), "Default Initial Seed", scheduler, global)?;
    }

    let mut workers = vec![seeding_worker];
    for id in 1..config.fuzzer.threads {
        workers.push(ladder_worker(id, config, global)?);
    }

    let max_iterations = config.fuzzer.max_iterations;
    let issued = AtomicU64::new(0);
    let goal_reached = AtomicBool::new(false);
    tracing::info!(
        max_iterations,
        threads = workers.len(),
        known_edges = global.seen_count(),
        "starting fuzz loop"
    );

    let start_time = Instant::now();
    let per_worker: Vec<Result<WorkerStats, anyhow::Error>> = std::thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut worker| {
                let issued = &issued;
                let goal_reached = &goal_reached;
                scope.spawn(move || -> Result<WorkerStats, anyhow::Error> {
                    while issued.fetch_add(1, Ordering::Relaxed) < max_iterations {
                        let report = worker.step(scheduler, global)?;
                        if report.exit_code == Some(GOAL_EXIT_CODE)
                            && !goal_reached.swap(true, Ordering::Relaxed)
                        {
                            tracing::info!(worker = worker.id(), "ladder goal reached");
                        }
                    }
                    Ok(*worker.stats())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("worker thread panicked")))
            })
            .collect()
    });

    let mut stats = WorkerStats::default();
    for worker_stats in per_worker {
        stats.absorb(&worker_stats?);
    }
    Ok(CampaignSummary {
        stats,
        elapsed: start_time.elapsed(),
        goal_reached: goal_reached.load(Ordering::Relaxed),
    })
}

fn print_summary<C: Corpus<Vec<u8>>>(
    summary: &CampaignSummary,
    scheduler: &CorpusScheduler<Vec<u8>, C>,
    global: &SharedEdgeMap,
) {
    let elapsed = summary.elapsed.as_secs_f64();
    let exec_per_sec = if elapsed > 0.0 {
        summary.stats.executions as f64 / elapsed
    } else {
        0.0
    };
    println!("Fuzz loop finished in {:.2?}.", summary.elapsed);
    println!(
        "Total Executions: {}, Execs/sec: {:.2}, Corpus Size: {}, Edges: {}, Solutions: {}",
        summary.stats.executions,
        exec_per_sec,
        scheduler.corpus().len(),
        global.seen_count(),
        scheduler.corpus().solutions().len(),
    );
    println!(
        "Retained: {}, Evicted: {}, Aborted runs: {}, Goal reached: {}",
        summary.stats.retained,
        summary.stats.evicted,
        summary.stats.aborted_runs,
        summary.goal_reached
    );
    for report in scheduler.corpus().solutions() {
        println!("  Solution {}: {}", report.input_hash, report.description);
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let config = load_config(&cli)?;
    tracing::debug!(?config, "effective configuration");

    let max_corpus_size = config.corpus.max_corpus_size;
    match config.corpus.corpus_type {
        CorpusType::InMemory => {
            let scheduler = Mutex::new(CorpusScheduler::new(
                InMemoryCorpus::<Vec<u8>>::new(),
                Box::new(CrashOracle::new()),
                max_corpus_size,
            ));
            let global = SharedEdgeMap::default();
            let summary = fuzz(&config, &scheduler, &global)?;
            let scheduler = scheduler.into_inner().unwrap_or_else(PoisonError::into_inner);
            print_summary(&summary, &scheduler, &global);
        }
        CorpusType::OnDisk => {
            let path = config.corpus.on_disk_path.clone();
            let corpus = OnDiskCorpus::<Vec<u8>>::new(path.clone())?;
            if corpus.skipped_entries() > 0 {
                tracing::warn!(
                    skipped = corpus.skipped_entries(),
                    "some corpus entries could not be loaded"
                );
            }
            let global = SharedEdgeMap::new(corpus.load_edge_map()?.unwrap_or_default());
            tracing::info!(
                path = ?path,
                entries = corpus.len(),
                known_edges = global.seen_count(),
                "opened on-disk corpus"
            );

            let scheduler = Mutex::new(CorpusScheduler::new(
                corpus,
                Box::new(CrashOracle::new()),
                max_corpus_size,
            ));
            let outcome = fuzz(&config, &scheduler, &global);
            let mut scheduler = scheduler.into_inner().unwrap_or_else(PoisonError::into_inner);
            // Persist whatever was found, even if a worker failed.
            scheduler.corpus_mut().flush()?;
            scheduler
                .corpus()
                .save_edge_map(&global.snapshot().to_edge_map())?;
            print_summary(&outcome?, &scheduler, &global);
        }
    }
    Ok(())
}
