use crate::edge_map::{EdgeMap, EdgeMapSnapshot};
use crate::executor::ExecutionStatus;
use crate::guard::{EdgeIndex, Guard, GuardTable, SiteLocation};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while recording coverage.
///
/// All of them indicate a mismatch between the instrumented target and the harness.
/// They are fatal to the current run, never to the process: coverage recorded by
/// earlier runs is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoverageError {
    /// The same site was registered twice without a reset in between.
    #[error("Site {site:#x} is already registered as {guard}")]
    DuplicateGuard { site: SiteLocation, guard: Guard },

    /// Every 32-bit guard value is in use.
    #[error("Guard space exhausted, cannot register more instrumentation sites")]
    GuardSpaceExhausted,

    /// An edge index beyond the edge map; the guard table and map disagree.
    #[error("{index} is out of range for an edge map of size {size}")]
    IndexOutOfRange { index: EdgeIndex, size: usize },

    /// The target reported a guard that was never registered.
    #[error("Unknown {guard} reported by the target")]
    UnknownGuard { guard: Guard },

    #[error("Run {open} is still open, cannot begin another one")]
    RunAlreadyOpen { open: u64 },

    #[error("No run is open")]
    NoOpenRun,

    #[error("Run {given} does not match the open run {open}")]
    RunMismatch { given: u64, open: u64 },

    /// A previous callback error already aborted this run.
    #[error("Run {run} was aborted by an earlier coverage error")]
    RunAborted { run: u64 },

    #[error("Edge map checkpoint error: {0}")]
    Checkpoint(String),
}

/// Proof that a run is open. Consumed by [`CoverageCollector::end_run`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open run must be closed with end_run"]
pub struct RunHandle {
    id: u64,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ephemeral state of the run currently executing.
///
/// Hits are buffered here and only written to the edge map when the run closes
/// without a failure.
#[derive(Debug)]
struct RunRecord {
    id: u64,
    /// Saturating hit count per touched edge.
    hits: HashMap<EdgeIndex, u8>,
    /// Newly seen edges, in the order they were first hit.
    delta: Vec<EdgeIndex>,
    found_new_edge: bool,
    failure: Option<CoverageError>,
}

impl RunRecord {
    fn new(id: u64) -> Self {
        Self {
            id,
            hits: HashMap::new(),
            delta: Vec::new(),
            found_new_edge: false,
            failure: None,
        }
    }
}

/// The closed, immutable outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub run_id: u64,
    /// Edges first seen during this run, ascending. Empty for aborted runs.
    pub delta: Vec<EdgeIndex>,
    /// Every edge hit during this run, ascending.
    pub touched: Vec<EdgeIndex>,
    pub found_new_edge: bool,
    pub status: ExecutionStatus,
    /// Set when a coverage error aborted the run.
    pub failure: Option<CoverageError>,
}

impl ExecutionResult {
    pub fn is_aborted(&self) -> bool {
        self.failure.is_some()
    }

    /// `true` when the target crashed or timed out.
    pub fn is_solution(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Crash(_) | ExecutionStatus::Timeout
        )
    }
}

/// Receives edge notifications from an instrumented target and keeps the edge map.
///
/// Exactly one run may be open at a time. Every operation called from inside the
/// target ([`on_edge`](Self::on_edge)) is synchronous and never blocks.
#[derive(Debug, Default)]
pub struct CoverageCollector {
    guards: GuardTable,
    edges: EdgeMap,
    open: Option<RunRecord>,
    next_run_id: u64,
    /// Callback errors that no open run could record.
    stray_errors: u64,
    last_stray_error: Option<CoverageError>,
}

impl CoverageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing map, e.g. one restored from a checkpoint or a snapshot
    /// of the global map.
    pub fn with_edge_map(edges: EdgeMap) -> Self {
        Self {
            edges,
            ..Self::default()
        }
    }

    pub fn register_site(&mut self, site: SiteLocation) -> Result<Guard, CoverageError> {
        self.guards.register(site, &mut self.edges)
    }

    /// Load-time entry point: registers `site_count` sites in one go.
    pub fn on_site_table_init(&mut self, site_count: u32) -> Result<Vec<Guard>, CoverageError> {
        self.guards.register_sites(site_count, &mut self.edges)
    }

    /// Forgets the guard table for a target reload. Refused while a run is open.
    pub fn reset_target(&mut self) -> Result<(), CoverageError> {
        if let Some(record) = &self.open {
            return Err(CoverageError::RunAlreadyOpen { open: record.id });
        }
        self.guards.reset();
        Ok(())
    }

    pub fn begin_run(&mut self) -> Result<RunHandle, CoverageError> {
        if let Some(record) = &self.open {
            return Err(CoverageError::RunAlreadyOpen { open: record.id });
        }
        let id = self.next_run_id;
        self.next_run_id += 1;
        self.open = Some(RunRecord::new(id));
        Ok(RunHandle { id })
    }

    /// Runtime callback, invoked by the target on every instrumented edge.
    ///
    /// An unknown guard aborts the run; later calls for the same run fail with
    /// [`CoverageError::RunAborted`]. Nothing an aborted run hit reaches the edge map.
    pub fn on_edge(&mut self, guard: Guard) -> Result<(), CoverageError> {
        let record = self.open.as_mut().ok_or(CoverageError::NoOpenRun)?;
        if record.failure.is_some() {
            return Err(CoverageError::RunAborted { run: record.id });
        }
        let Some(index) = self.guards.lookup(guard) else {
            let error = CoverageError::UnknownGuard { guard };
            record.failure = Some(error.clone());
            return Err(error);
        };
        let Some(counter) = self.edges.counter(index) else {
            let error = CoverageError::IndexOutOfRange {
                index,
                size: self.edges.size(),
            };
            record.failure = Some(error.clone());
            return Err(error);
        };
        let hits = record.hits.entry(index).or_insert(0);
        if *hits == 0 && counter == 0 {
            record.delta.push(index);
            record.found_new_edge = true;
        }
        *hits = hits.saturating_add(1);
        Ok(())
    }

    /// Aborts the open run with an error raised outside [`on_edge`](Self::on_edge),
    /// e.g. one returned by the harness itself. The first failure of a run wins.
    pub fn fail_run(&mut self, error: CoverageError) -> Result<(), CoverageError> {
        let record = self.open.as_mut().ok_or(CoverageError::NoOpenRun)?;
        if record.failure.is_none() {
            record.failure = Some(error);
        }
        Ok(())
    }

    /// Closes the open run. Must be called for every run, including crashed and
    /// timed-out ones.
    pub fn end_run(
        &mut self,
        handle: RunHandle,
        status: ExecutionStatus,
    ) -> Result<ExecutionResult, CoverageError> {
        let open_id = self
            .open
            .as_ref()
            .map(|record| record.id)
            .ok_or(CoverageError::NoOpenRun)?;
        if handle.id != open_id {
            return Err(CoverageError::RunMismatch {
                given: handle.id,
                open: open_id,
            });
        }
        let record = self.open.take().ok_or(CoverageError::NoOpenRun)?;

        let mut touched: Vec<EdgeIndex> = record.hits.keys().copied().collect();
        touched.sort_unstable();

        if record.failure.is_some() {
            return Ok(ExecutionResult {
                run_id: record.id,
                delta: Vec::new(),
                touched,
                found_new_edge: false,
                status,
                failure: record.failure,
            });
        }

        for (&index, &count) in &record.hits {
            for _ in 0..count {
                self.edges.mark(index)?;
            }
        }
        let mut delta = record.delta;
        delta.sort_unstable();

        Ok(ExecutionResult {
            run_id: record.id,
            delta,
            touched,
            found_new_edge: record.found_new_edge,
            status,
            failure: None,
        })
    }

    /// Counts an error raised where it cannot be returned, e.g. inside a sanitizer hook.
    pub fn note_stray_error(&mut self, error: CoverageError) {
        self.stray_errors += 1;
        self.last_stray_error = Some(error);
    }

    pub fn stray_errors(&self) -> u64 {
        self.stray_errors
    }

    pub fn last_stray_error(&self) -> Option<&CoverageError> {
        self.last_stray_error.as_ref()
    }

    pub fn is_run_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn guard_table(&self) -> &GuardTable {
        &self.guards
    }

    pub fn edge_map(&self) -> &EdgeMap {
        &self.edges
    }

    pub fn snapshot(&self) -> EdgeMapSnapshot {
        self.edges.snapshot()
    }
}
