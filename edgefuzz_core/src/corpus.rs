use crate::edge_map::EdgeMap;
use crate::guard::EdgeIndex;
use crate::input::Input;
use crate::oracle::BugReport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested entry ID was not found within the corpus.
    #[error("Entry ID {0} not found in corpus")]
    EntryNotFound(usize),

    /// An entry with the same content hash is already stored.
    #[error("Input with content hash {0} is already in the corpus")]
    DuplicateInput(String),

    /// An I/O error occurred while reading or writing corpus files.
    /// Contains a string describing the underlying I/O error.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// Encoding the index or a checkpoint failed.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// Decoding the index or a checkpoint failed.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {}", err))
    }
}

/// Identifier of an entry. IDs are never reused within one corpus instance.
pub type EntryId = usize;

/// An input that contributed previously unseen edges.
///
/// Everything except the execution count is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry<I: Input> {
    input: I,
    delta: BTreeSet<EdgeIndex>,
    priority: u32,
    exec_count: u64,
    content_hash: String,
    origin: String,
}

impl<I: Input> CorpusEntry<I> {
    /// Creates an entry whose priority score is the number of edges it contributed.
    pub fn new(
        input: I,
        delta: impl IntoIterator<Item = EdgeIndex>,
        origin: impl Into<String>,
    ) -> Self {
        let delta: BTreeSet<EdgeIndex> = delta.into_iter().collect();
        let priority = u32::try_from(delta.len()).unwrap_or(u32::MAX);
        let content_hash = input.content_hash();
        Self {
            input,
            delta,
            priority,
            exec_count: 0,
            content_hash,
            origin: origin.into(),
        }
    }

    fn restored(persisted: &PersistedEntry, input: I, content_hash: String) -> Self {
        Self {
            input,
            delta: persisted.delta.iter().copied().collect(),
            priority: persisted.priority,
            exec_count: persisted.exec_count,
            content_hash,
            origin: persisted.source_description.clone(),
        }
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn delta(&self) -> &BTreeSet<EdgeIndex> {
        &self.delta
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn record_execution(&mut self) -> u64 {
        self.exec_count = self.exec_count.saturating_add(1);
        self.exec_count
    }
}

/// Storage for corpus entries and retained solutions.
///
/// Implementations must be `Send` so a scheduler owning them can be shared between
/// worker threads behind a mutex.
pub trait Corpus<I: Input>: Send {
    /// Adds an entry. Fails with [`CorpusError::DuplicateInput`] if an entry with the
    /// same content hash is already stored.
    fn add(&mut self, entry: CorpusEntry<I>) -> Result<EntryId, CorpusError>;

    fn get(&self, id: EntryId) -> Option<&CorpusEntry<I>>;

    /// Increments the execution count of `id`, returning the new count.
    fn record_execution(&mut self, id: EntryId) -> Result<u64, CorpusError>;

    fn remove(&mut self, id: EntryId) -> Result<CorpusEntry<I>, CorpusError>;

    /// All entry IDs in ascending order.
    fn ids(&self) -> Vec<EntryId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains_hash(&self, content_hash: &str) -> bool;

    /// Keeps a solution for triage. Returns `false` if the same input was already kept.
    fn add_solution(&mut self, report: BugReport<I>) -> Result<bool, CorpusError>;

    /// Solutions kept by this corpus instance.
    fn solutions(&self) -> &[BugReport<I>];

    /// Persists any buffered state. A no-op for purely in-memory corpora.
    fn flush(&mut self) -> Result<(), CorpusError> {
        Ok(())
    }
}

/// An in-memory implementation of the `Corpus` trait.
///
/// Fast, but nothing survives the process.
#[derive(Debug)]
pub struct InMemoryCorpus<I: Input> {
    entries: BTreeMap<EntryId, CorpusEntry<I>>,
    id_by_hash: HashMap<String, EntryId>,
    next_id: EntryId,
    solutions: Vec<BugReport<I>>,
    solution_hashes: HashSet<String>,
}

impl<I: Input> InMemoryCorpus<I> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            id_by_hash: HashMap::new(),
            next_id: 0,
            solutions: Vec::new(),
            solution_hashes: HashSet::new(),
        }
    }
}

impl<I: Input> Default for InMemoryCorpus<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Input> Corpus<I> for InMemoryCorpus<I> {
    fn add(&mut self, entry: CorpusEntry<I>) -> Result<EntryId, CorpusError> {
        if self.id_by_hash.contains_key(entry.content_hash()) {
            return Err(CorpusError::DuplicateInput(entry.content_hash.clone()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.id_by_hash.insert(entry.content_hash.clone(), id);
        self.entries.insert(id, entry);
        Ok(id)
    }

    fn get(&self, id: EntryId) -> Option<&CorpusEntry<I>> {
        self.entries.get(&id)
    }

    fn record_execution(&mut self, id: EntryId) -> Result<u64, CorpusError> {
        self.entries
            .get_mut(&id)
            .map(CorpusEntry::record_execution)
            .ok_or(CorpusError::EntryNotFound(id))
    }

    fn remove(&mut self, id: EntryId) -> Result<CorpusEntry<I>, CorpusError> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or(CorpusError::EntryNotFound(id))?;
        self.id_by_hash.remove(entry.content_hash());
        Ok(entry)
    }

    fn ids(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains_hash(&self, content_hash: &str) -> bool {
        self.id_by_hash.contains_key(content_hash)
    }

    fn add_solution(&mut self, report: BugReport<I>) -> Result<bool, CorpusError> {
        if !self.solution_hashes.insert(report.input_hash.clone()) {
            return Ok(false);
        }
        self.solutions.push(report);
        Ok(true)
    }

    fn solutions(&self) -> &[BugReport<I>] {
        &self.solutions
    }
}

/// Index record of one on-disk entry, keyed by content hash in `corpus_index.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct PersistedEntry {
    delta: Vec<EdgeIndex>,
    priority: u32,
    exec_count: u64,
    source_description: String,
}

impl<I: Input> From<&CorpusEntry<I>> for PersistedEntry {
    fn from(entry: &CorpusEntry<I>) -> Self {
        Self {
            delta: entry.delta.iter().copied().collect(),
            priority: entry.priority,
            exec_count: entry.exec_count,
            source_description: entry.origin.clone(),
        }
    }
}

/// A persistent corpus that allows a fuzzing session to be resumed.
///
/// Layout of the corpus directory:
/// * `corpus_index.json`: content hash -> delta, priority, execution count, origin.
/// * `<hash>.fuzzinput`: raw bytes of each entry, so a file can be fed straight to the target.
/// * `solutions/<hash>.fuzzinput` and `solutions/<hash>.txt`: crashing or hanging inputs
///   and their descriptions.
/// * `edge_map.bin`: checkpoint of the global edge map.
///
/// Entries are held in memory and written through on `add` and `remove`. Execution
/// counts are written on [`flush`](Corpus::flush).
pub struct OnDiskCorpus<I: Input + From<Vec<u8>>> {
    corpus_dir_path: PathBuf,
    index_file_path: PathBuf,
    solutions_dir_path: PathBuf,
    memory: InMemoryCorpus<I>,
    index: BTreeMap<String, PersistedEntry>,
    index_dirty: bool,
    skipped_entries: usize,
}

impl<I: Input + From<Vec<u8>>> OnDiskCorpus<I> {
    /// Default filename for the corpus index JSON file.
    const INDEX_FILENAME: &'static str = "corpus_index.json";
    /// Default file extension for stored inputs.
    const INPUT_FILE_EXTENSION: &'static str = "fuzzinput";
    const SOLUTIONS_DIRNAME: &'static str = "solutions";
    const EDGE_MAP_FILENAME: &'static str = "edge_map.bin";

    /// Opens the corpus at `corpus_dir_path`, creating the directory if needed and
    /// loading every entry listed in its index.
    ///
    /// Entries whose input file is missing, unreadable or does not match its hash are
    /// skipped with a warning and dropped from the index; see
    /// [`skipped_entries`](Self::skipped_entries). An unparsable index is rebuilt from
    /// the input files in the directory, without their deltas or execution counts.
    pub fn new(corpus_dir_path: PathBuf) -> Result<Self, CorpusError> {
        if !corpus_dir_path.exists() {
            fs::create_dir_all(&corpus_dir_path).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create corpus directory at {:?}: {}",
                    corpus_dir_path, e
                ))
            })?;
        } else if !corpus_dir_path.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {:?} exists but is not a directory",
                corpus_dir_path
            )));
        }

        let solutions_dir_path = corpus_dir_path.join(Self::SOLUTIONS_DIRNAME);
        fs::create_dir_all(&solutions_dir_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create solutions directory at {:?}: {}",
                solutions_dir_path, e
            ))
        })?;

        let index_file_path = corpus_dir_path.join(Self::INDEX_FILENAME);
        let mut corpus_instance = Self {
            corpus_dir_path,
            index_file_path,
            solutions_dir_path,
            memory: InMemoryCorpus::new(),
            index: BTreeMap::new(),
            index_dirty: false,
            skipped_entries: 0,
        };

        corpus_instance.load_index_from_disk()?;
        corpus_instance.load_entries();

        // Ensure an index file exists, even if it's for an empty corpus.
        if corpus_instance.index_dirty || !corpus_instance.index_file_path.exists() {
            corpus_instance.save_index_to_disk()?;
        }
        Ok(corpus_instance)
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir_path
    }

    /// Number of indexed entries that could not be loaded.
    pub fn skipped_entries(&self) -> usize {
        self.skipped_entries
    }

    fn input_file_path(&self, content_hash: &str) -> PathBuf {
        self.corpus_dir_path
            .join(content_hash)
            .with_extension(Self::INPUT_FILE_EXTENSION)
    }

    fn save_index_to_disk(&mut self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.index).map_err(|e| {
            CorpusError::Serialization(format!(
                "Failed to serialize corpus index to JSON for {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        self.index_dirty = false;
        Ok(())
    }

    fn load_index_from_disk(&mut self) -> Result<(), CorpusError> {
        if !self.index_file_path.is_file() {
            return Ok(());
        }
        let file = File::open(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to open index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(index) => self.index = index,
            Err(e) => {
                tracing::warn!(
                    path = ?self.index_file_path,
                    error = %e,
                    "corpus index is corrupted, rebuilding it from the stored inputs"
                );
                self.skipped_entries += 1;
                self.index = self.scan_input_files()?;
                self.index_dirty = true;
            }
        }
        Ok(())
    }

    /// Index entries for every `<hash>.fuzzinput` file in the corpus directory.
    fn scan_input_files(&self) -> Result<BTreeMap<String, PersistedEntry>, CorpusError> {
        let mut index = BTreeMap::new();
        for dir_entry in fs::read_dir(&self.corpus_dir_path)? {
            let path = dir_entry?.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str())
                    != Some(Self::INPUT_FILE_EXTENSION)
            {
                continue;
            }
            let Some(content_hash) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            index.insert(
                content_hash.to_string(),
                PersistedEntry {
                    delta: Vec::new(),
                    priority: 0,
                    exec_count: 0,
                    source_description: format!("Recovered: {}", path.display()),
                },
            );
        }
        Ok(index)
    }

    fn load_entries(&mut self) {
        let mut dead = Vec::new();
        for (content_hash, persisted) in &self.index {
            let file_path = self.input_file_path(content_hash);
            let bytes = match fs::read(&file_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = ?file_path, error = %e, "skipping unreadable corpus entry");
                    dead.push(content_hash.clone());
                    continue;
                }
            };
            let input = I::from(bytes);
            if input.content_hash() != *content_hash {
                tracing::warn!(path = ?file_path, "skipping corpus entry whose content does not match its hash");
                dead.push(content_hash.clone());
                continue;
            }
            let entry = CorpusEntry::restored(persisted, input, content_hash.clone());
            if let Err(e) = self.memory.add(entry) {
                tracing::warn!(path = ?file_path, error = %e, "skipping corpus entry");
                dead.push(content_hash.clone());
            }
        }
        self.skipped_entries += dead.len();
        if !dead.is_empty() {
            for content_hash in &dead {
                self.index.remove(content_hash);
            }
            self.index_dirty = true;
        }
    }

    /// Writes a checkpoint of `map` next to the corpus.
    pub fn save_edge_map(&self, map: &EdgeMap) -> Result<(), CorpusError> {
        let bytes = map
            .to_checkpoint()
            .map_err(|e| CorpusError::Serialization(e.to_string()))?;
        let path = self.corpus_dir_path.join(Self::EDGE_MAP_FILENAME);
        fs::write(&path, bytes).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to write edge map checkpoint {:?}: {}",
                path, e
            ))
        })
    }

    /// Loads the edge map checkpoint, if one was saved.
    pub fn load_edge_map(&self) -> Result<Option<EdgeMap>, CorpusError> {
        let path = self.corpus_dir_path.join(Self::EDGE_MAP_FILENAME);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to read edge map checkpoint {:?}: {}",
                path, e
            ))
        })?;
        EdgeMap::from_checkpoint(&bytes)
            .map(Some)
            .map_err(|e| CorpusError::Deserialization(e.to_string()))
    }
}

impl<I: Input + From<Vec<u8>>> Corpus<I> for OnDiskCorpus<I> {
    fn add(&mut self, entry: CorpusEntry<I>) -> Result<EntryId, CorpusError> {
        if self.memory.contains_hash(entry.content_hash()) {
            return Err(CorpusError::DuplicateInput(entry.content_hash.clone()));
        }
        let file_path = self.input_file_path(entry.content_hash());
        fs::write(&file_path, entry.input.as_bytes()).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to write input file {:?}: {}",
                file_path, e
            ))
        })?;

        let content_hash = entry.content_hash.clone();
        self.index
            .insert(content_hash.clone(), PersistedEntry::from(&entry));
        let id = self.memory.add(entry)?;
        if let Err(e) = self.save_index_to_disk() {
            // Undo the add so memory, index and directory stay in agreement.
            self.index.remove(&content_hash);
            let _ = self.memory.remove(id);
            let _ = fs::remove_file(&file_path);
            return Err(e);
        }
        Ok(id)
    }

    fn get(&self, id: EntryId) -> Option<&CorpusEntry<I>> {
        self.memory.get(id)
    }

    fn record_execution(&mut self, id: EntryId) -> Result<u64, CorpusError> {
        let count = self.memory.record_execution(id)?;
        if let Some(entry) = self.memory.get(id) {
            if let Some(persisted) = self.index.get_mut(entry.content_hash()) {
                persisted.exec_count = count;
                self.index_dirty = true;
            }
        }
        Ok(count)
    }

    fn remove(&mut self, id: EntryId) -> Result<CorpusEntry<I>, CorpusError> {
        let entry = self.memory.remove(id)?;
        self.index.remove(entry.content_hash());
        let file_path = self.input_file_path(entry.content_hash());
        if let Err(e) = fs::remove_file(&file_path) {
            tracing::warn!(path = ?file_path, error = %e, "failed to delete evicted corpus file");
        }
        if let Err(e) = self.save_index_to_disk() {
            // The entry is gone from memory; the index is retried on flush.
            tracing::warn!(error = %e, "failed to write corpus index after removal");
            self.index_dirty = true;
        }
        Ok(entry)
    }

    fn ids(&self) -> Vec<EntryId> {
        self.memory.ids()
    }

    fn len(&self) -> usize {
        self.memory.len()
    }

    fn contains_hash(&self, content_hash: &str) -> bool {
        self.memory.contains_hash(content_hash)
    }

    /// Also skips inputs that an earlier session already stored in `solutions/`.
    fn add_solution(&mut self, report: BugReport<I>) -> Result<bool, CorpusError> {
        let input_path = self
            .solutions_dir_path
            .join(&report.input_hash)
            .with_extension(Self::INPUT_FILE_EXTENSION);
        if input_path.exists() {
            return Ok(false);
        }
        fs::write(&input_path, report.input.as_bytes()).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to write solution file {:?}: {}",
                input_path, e
            ))
        })?;
        let description_path = input_path.with_extension("txt");
        if let Err(e) = fs::write(&description_path, &report.description) {
            let _ = fs::remove_file(&input_path);
            return Err(CorpusError::Io(format!(
                "Failed to write solution description {:?}: {}",
                description_path, e
            )));
        }
        self.memory.add_solution(report)
    }

    fn solutions(&self) -> &[BugReport<I>] {
        self.memory.solutions()
    }

    fn flush(&mut self) -> Result<(), CorpusError> {
        if self.index_dirty {
            self.save_index_to_disk()?;
        }
        Ok(())
    }
}

fn is_hidden_or_index(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') || name == "corpus_index.json")
}

/// Reads raw seed inputs from files and directories.
///
/// Directories are not traversed recursively. Hidden files and corpus index files are
/// skipped.
pub fn load_seed_inputs<I: From<Vec<u8>>>(
    seed_paths: &[PathBuf],
) -> Result<Vec<(PathBuf, I)>, CorpusError> {
    let mut seeds = Vec::new();
    for path_buf in seed_paths {
        let path_ref = path_buf.as_path();
        if path_ref.is_file() {
            let data_bytes = fs::read(path_ref).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed file {:?}: {}", path_ref, e))
            })?;
            seeds.push((path_buf.clone(), I::from(data_bytes)));
        } else if path_ref.is_dir() {
            let mut dir_paths = Vec::new();
            for entry_result in fs::read_dir(path_ref).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to read seed directory {:?}: {}",
                    path_ref, e
                ))
            })? {
                let entry = entry_result.map_err(|e| {
                    CorpusError::Io(format!("Error reading entry in {:?}: {}", path_ref, e))
                })?;
                let file_path_in_dir = entry.path();
                if file_path_in_dir.is_file() && !is_hidden_or_index(&file_path_in_dir) {
                    dir_paths.push(file_path_in_dir);
                }
            }
            dir_paths.sort();
            for file_path_in_dir in dir_paths {
                let data_bytes = fs::read(&file_path_in_dir).map_err(|e| {
                    CorpusError::Io(format!(
                        "Failed to read seed file {:?}: {}",
                        file_path_in_dir, e
                    ))
                })?;
                seeds.push((file_path_in_dir, I::from(data_bytes)));
            }
        } else {
            tracing::warn!(path = ?path_ref, "seed path does not exist, ignoring");
        }
    }
    Ok(seeds)
}
