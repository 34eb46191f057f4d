use crate::corpus::{Corpus, CorpusEntry, CorpusError, EntryId};
use crate::coverage::ExecutionResult;
use crate::guard::EdgeIndex;
use crate::input::Input;
use crate::mutator::Mutator;
use crate::oracle::Oracle;
use rand_core::RngCore;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no input can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
    /// Wraps an error originating from the corpus backend (e.g., I/O error)
    /// encountered during a scheduler operation.
    #[error("Corpus interaction failed within scheduler: {0}")]
    Corpus(#[from] CorpusError),
    /// The mutation collaborator could not produce an input.
    #[error("Mutation failed: {0}")]
    Mutation(String),
}

/// Scheduling priority of an entry: `(score + yield credits + 1) / (executions + 1)`.
///
/// Kept as an exact fraction; comparisons cross-multiply instead of dividing.
#[derive(Debug, Clone, Copy)]
pub struct Priority {
    numerator: u64,
    denominator: u64,
}

impl Priority {
    pub fn new(score: u32, yield_credits: u64, exec_count: u64) -> Self {
        Self {
            numerator: u64::from(score)
                .saturating_add(yield_credits)
                .saturating_add(1),
            denominator: exec_count.saturating_add(1),
        }
    }

    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    pub fn denominator(&self) -> u64 {
        self.denominator
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = u128::from(self.numerator) * u128::from(other.denominator);
        let rhs = u128::from(other.numerator) * u128::from(self.denominator);
        lhs.cmp(&rhs)
    }
}

/// What [`CorpusScheduler::submit`] did with an input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    /// The new entry, if the input was retained for coverage.
    pub retained: Option<EntryId>,
    /// `true` if the input was kept as a new solution.
    pub solution: bool,
    /// Entries evicted to make room.
    pub evicted: Vec<EntryId>,
    /// `true` if the run was aborted by a coverage error and discarded.
    pub aborted: bool,
    /// `true` if the corpus failed to store the input and it was skipped.
    pub skipped: bool,
}

/// Turns a corpus I/O failure into a skipped entry; other corpus errors still propagate.
fn skip_on_io<T>(
    outcome: Result<T, CorpusError>,
    run_id: u64,
) -> Result<Option<T>, SchedulerError> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(CorpusError::Io(message)) => {
            tracing::warn!(run = run_id, error = %message, "corpus I/O failed, skipping entry");
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

/// Owns the corpus, decides what is retained and picks what runs next.
///
/// Entries with fewer executions and a higher historical yield are preferred. Among
/// entries of equal priority, selection rotates starting after the previously chosen
/// entry, so no entry is starved.
pub struct CorpusScheduler<I: Input, C: Corpus<I>> {
    corpus: C,
    oracle: Box<dyn Oracle<I>>,
    max_corpus_size: usize,
    last_selected: Option<EntryId>,
    yield_credits: HashMap<EntryId, u64>,
}

impl<I: Input, C: Corpus<I>> CorpusScheduler<I, C> {
    pub fn new(corpus: C, oracle: Box<dyn Oracle<I>>, max_corpus_size: usize) -> Self {
        Self {
            corpus,
            oracle,
            max_corpus_size,
            last_selected: None,
            yield_credits: HashMap::new(),
        }
    }

    pub fn corpus(&self) -> &C {
        &self.corpus
    }

    pub fn corpus_mut(&mut self) -> &mut C {
        &mut self.corpus
    }

    pub fn max_corpus_size(&self) -> usize {
        self.max_corpus_size
    }

    /// Retains `input` if its run found new edges, keeps it as a solution if the run
    /// crashed or timed out, and discards it otherwise.
    ///
    /// Solutions are stored apart from the coverage corpus, so a crashing input is never
    /// scheduled for mutation.
    pub fn submit(
        &mut self,
        input: I,
        result: &ExecutionResult,
    ) -> Result<Submission, SchedulerError> {
        let mut submission = Submission::default();
        if let Some(failure) = &result.failure {
            tracing::warn!(run = result.run_id, %failure, "discarding aborted run");
            submission.aborted = true;
            return Ok(submission);
        }

        if let Some(report) = self.oracle.examine(&input, &result.status) {
            let description = report.description.clone();
            match skip_on_io(self.corpus.add_solution(report), result.run_id)? {
                Some(true) => {
                    tracing::info!(run = result.run_id, %description, "new solution");
                    submission.solution = true;
                }
                Some(false) => {}
                None => submission.skipped = true,
            }
            return Ok(submission);
        }

        if !result.found_new_edge {
            tracing::debug!(run = result.run_id, "no new coverage, discarding input");
            return Ok(submission);
        }
        if self.corpus.contains_hash(&input.content_hash()) {
            tracing::debug!(run = result.run_id, "input already in corpus");
            return Ok(submission);
        }

        let new_edges = result.delta.len();
        let added = self.corpus.add(CorpusEntry::new(
            input,
            result.delta.iter().copied(),
            "coverage",
        ));
        let Some(id) = skip_on_io(added, result.run_id)? else {
            submission.skipped = true;
            return Ok(submission);
        };
        tracing::info!(
            run = result.run_id,
            entry = id,
            new_edges,
            corpus_size = self.corpus.len(),
            "new coverage"
        );
        submission.retained = Some(id);
        submission.evicted = self.evict_redundant()?;
        Ok(submission)
    }

    /// Retains a seed whatever its coverage. Returns `None` for aborted runs,
    /// solutions, inputs already in the corpus or failing to store, and seeds evicted
    /// straight away.
    pub fn add_seed(
        &mut self,
        input: I,
        result: &ExecutionResult,
        origin: &str,
    ) -> Result<Option<EntryId>, SchedulerError> {
        if result.is_aborted() {
            tracing::warn!(%origin, "seed run was aborted, skipping seed");
            return Ok(None);
        }
        if let Some(report) = self.oracle.examine(&input, &result.status) {
            tracing::warn!(%origin, description = %report.description, "seed is a solution");
            skip_on_io(self.corpus.add_solution(report), result.run_id)?;
            return Ok(None);
        }
        if self.corpus.contains_hash(&input.content_hash()) {
            return Ok(None);
        }
        let added = self
            .corpus
            .add(CorpusEntry::new(input, result.delta.iter().copied(), origin));
        let Some(id) = skip_on_io(added, result.run_id)? else {
            return Ok(None);
        };
        self.evict_redundant()?;
        Ok(self.corpus.get(id).map(|_| id))
    }

    /// Current scheduling priority of `id`.
    pub fn priority(&self, id: EntryId) -> Option<Priority> {
        let entry = self.corpus.get(id)?;
        let credits = self.yield_credits.get(&id).copied().unwrap_or(0);
        Some(Priority::new(entry.priority(), credits, entry.exec_count()))
    }

    pub fn yield_credits(&self, id: EntryId) -> u64 {
        self.yield_credits.get(&id).copied().unwrap_or(0)
    }

    /// Selects the entry to run next and counts the execution against it.
    pub fn next(&mut self) -> Result<EntryId, SchedulerError> {
        let ids = self.corpus.ids();
        if ids.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }

        // Rotate so the scan starts right after the previous pick; the first maximum
        // found wins, which makes ties round-robin.
        let split = match self.last_selected {
            Some(last) => ids.partition_point(|&id| id <= last),
            None => 0,
        };
        let mut best: Option<(EntryId, Priority)> = None;
        for &id in ids[split..].iter().chain(ids[..split].iter()) {
            let Some(priority) = self.priority(id) else {
                continue;
            };
            if best.is_none_or(|(_, best_priority)| priority > best_priority) {
                best = Some((id, priority));
            }
        }
        let (id, _) = best.ok_or(SchedulerError::CorpusEmpty)?;

        self.corpus.record_execution(id)?;
        self.last_selected = Some(id);
        Ok(id)
    }

    /// Selects the next entry and hands it to `mutator`.
    pub fn mutate_next<M>(
        &mut self,
        mutator: &mut M,
        rng: &mut dyn RngCore,
    ) -> Result<(EntryId, I), SchedulerError>
    where
        M: Mutator<I> + ?Sized,
    {
        let id = self.next()?;
        let entry = self
            .corpus
            .get(id)
            .ok_or(CorpusError::EntryNotFound(id))?;
        let mutant = mutator
            .mutate(entry, rng)
            .map_err(|e| SchedulerError::Mutation(e.to_string()))?;
        Ok((id, mutant))
    }

    /// Credits `parent` with the new edges found by one of its mutants.
    ///
    /// Feedback for entries that have since been evicted is ignored.
    pub fn report_feedback(&mut self, parent: EntryId, result: &ExecutionResult) {
        if result.is_aborted() || !result.found_new_edge {
            return;
        }
        if self.corpus.get(parent).is_none() {
            return;
        }
        let credits = self.yield_credits.entry(parent).or_insert(0);
        *credits = credits.saturating_add(result.delta.len() as u64);
    }

    /// Evicts redundant entries while the corpus is over its maximum size.
    ///
    /// An entry is redundant when every edge in its delta is also in another entry's
    /// delta. The lowest-priority redundant entry goes first. An entry that alone covers
    /// some edge is never evicted, so the corpus may stay above the maximum.
    pub fn evict_redundant(&mut self) -> Result<Vec<EntryId>, SchedulerError> {
        let mut evicted = Vec::new();
        while self.corpus.len() > self.max_corpus_size {
            let Some(victim) = self.lowest_priority_redundant_entry() else {
                tracing::warn!(
                    corpus_size = self.corpus.len(),
                    max_corpus_size = self.max_corpus_size,
                    "no redundant entry left to evict, corpus stays above its maximum"
                );
                break;
            };
            self.corpus.remove(victim)?;
            self.yield_credits.remove(&victim);
            tracing::debug!(entry = victim, "evicted redundant entry");
            evicted.push(victim);
        }
        Ok(evicted)
    }

    fn lowest_priority_redundant_entry(&self) -> Option<EntryId> {
        let ids = self.corpus.ids();
        let mut holders: HashMap<EdgeIndex, usize> = HashMap::new();
        for entry in ids.iter().filter_map(|&id| self.corpus.get(id)) {
            for &edge in entry.delta() {
                *holders.entry(edge).or_insert(0) += 1;
            }
        }

        let mut victim: Option<(EntryId, Priority)> = None;
        for &id in &ids {
            let Some(entry) = self.corpus.get(id) else {
                continue;
            };
            let redundant = entry
                .delta()
                .iter()
                .all(|edge| holders.get(edge).copied().unwrap_or(0) > 1);
            if !redundant {
                continue;
            }
            let Some(priority) = self.priority(id) else {
                continue;
            };
            if victim.is_none_or(|(_, lowest)| priority < lowest) {
                victim = Some((id, priority));
            }
        }
        victim.map(|(id, _)| id)
    }
}
