pub mod config;
pub mod corpus;
pub mod coverage;
pub mod edge_map;
pub mod executor;
pub mod guard;
pub mod input;
pub mod ladder;
pub mod mutator;
pub mod oracle;
#[cfg(feature = "sancov-hooks")]
pub mod sancov;
pub mod scheduler;
pub mod worker;

pub use config::EdgefuzzConfig;
pub use corpus::{Corpus, CorpusEntry, CorpusError, EntryId, InMemoryCorpus, OnDiskCorpus};
pub use coverage::{CoverageCollector, CoverageError, ExecutionResult, RunHandle};
pub use edge_map::{EdgeMap, EdgeMapSnapshot, SharedEdgeMap};
pub use executor::{ExecutionDriver, ExecutionStatus, InProcessDriver};
pub use guard::{EdgeIndex, Guard, GuardTable, SiteLocation};
pub use input::Input;
pub use ladder::LadderTarget;
pub use mutator::{FlipSingleByteMutator, Mutator};
pub use oracle::{BugReport, CrashOracle, Oracle};
pub use scheduler::{CorpusScheduler, Priority, SchedulerError, Submission};
pub use worker::{StepReport, Worker, WorkerError, WorkerStats};
