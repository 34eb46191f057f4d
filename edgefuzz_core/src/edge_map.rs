use crate::coverage::{CoverageError, ExecutionResult};
use crate::guard::EdgeIndex;
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
};
use std::sync::{Arc, Mutex, PoisonError};

/// Fixed-width little-endian encoding, shared by every checkpoint written by this crate.
fn checkpoint_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// On-disk form of an [`EdgeMap`].
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
struct EdgeMapCheckpoint {
    version: u16,
    counters: Vec<u8>,
}

const CHECKPOINT_VERSION: u16 = 1;

/// A table of saturating hit counters, one per known edge.
///
/// An edge is "seen" once its counter is non-zero. That transition is one-way: nothing
/// in this type ever lowers a counter, and the table only grows.
///
/// Counters live behind an `Arc` so [`snapshot`](Self::snapshot) is O(1); the first
/// write after a snapshot copies the table.
#[derive(Debug, Clone, Default)]
pub struct EdgeMap {
    counters: Arc<Vec<u8>>,
}

impl EdgeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            counters: Arc::new(vec![0; size]),
        }
    }

    pub fn size(&self) -> usize {
        self.counters.len()
    }

    /// Grows the table to `size` counters. Smaller sizes are ignored.
    pub fn grow_to(&mut self, size: usize) {
        if size > self.counters.len() {
            Arc::make_mut(&mut self.counters).resize(size, 0);
        }
    }

    /// Records one hit on `index`, returning `true` if this was the edge's first hit.
    pub fn mark(&mut self, index: EdgeIndex) -> Result<bool, CoverageError> {
        let size = self.counters.len();
        if index.get() >= size {
            return Err(CoverageError::IndexOutOfRange { index, size });
        }
        let counter = &mut Arc::make_mut(&mut self.counters)[index.get()];
        let first_hit = *counter == 0;
        *counter = counter.saturating_add(1);
        Ok(first_hit)
    }

    pub fn counter(&self, index: EdgeIndex) -> Option<u8> {
        self.counters.get(index.get()).copied()
    }

    pub fn is_seen(&self, index: EdgeIndex) -> bool {
        self.counter(index).is_some_and(|count| count > 0)
    }

    pub fn seen_count(&self) -> usize {
        self.counters.iter().filter(|&&count| count > 0).count()
    }

    pub fn snapshot(&self) -> EdgeMapSnapshot {
        EdgeMapSnapshot {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Adds `other`'s counters into this map, growing it if `other` is larger.
    ///
    /// Returns the edges that were unseen here and seen in `other`, in ascending order.
    pub fn merge(&mut self, other: &EdgeMapSnapshot) -> Vec<EdgeIndex> {
        self.grow_to(other.size());
        let counters = Arc::make_mut(&mut self.counters);
        let mut newly_seen = Vec::new();
        for (index, (mine, &theirs)) in counters.iter_mut().zip(other.counters.iter()).enumerate() {
            if theirs == 0 {
                continue;
            }
            if *mine == 0 {
                newly_seen.push(EdgeIndex::new(index));
            }
            *mine = mine.saturating_add(theirs);
        }
        newly_seen
    }

    pub fn to_checkpoint(&self) -> Result<Vec<u8>, CoverageError> {
        let checkpoint = EdgeMapCheckpoint {
            version: CHECKPOINT_VERSION,
            counters: self.counters.as_ref().clone(),
        };
        bincode::encode_to_vec(&checkpoint, checkpoint_config())
            .map_err(|e| CoverageError::Checkpoint(format!("Bincode encoding error: {e}")))
    }

    pub fn from_checkpoint(bytes: &[u8]) -> Result<Self, CoverageError> {
        let (checkpoint, _length): (EdgeMapCheckpoint, usize) =
            bincode::decode_from_slice(bytes, checkpoint_config())
                .map_err(|e| CoverageError::Checkpoint(format!("Bincode decoding error: {e}")))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CoverageError::Checkpoint(format!(
                "Unsupported edge map checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok(Self {
            counters: Arc::new(checkpoint.counters),
        })
    }
}

/// A read-only view of an [`EdgeMap`] at the moment it was taken.
#[derive(Debug, Clone)]
pub struct EdgeMapSnapshot {
    counters: Arc<Vec<u8>>,
}

impl EdgeMapSnapshot {
    pub fn size(&self) -> usize {
        self.counters.len()
    }

    pub fn counter(&self, index: EdgeIndex) -> Option<u8> {
        self.counters.get(index.get()).copied()
    }

    pub fn is_seen(&self, index: EdgeIndex) -> bool {
        self.counter(index).is_some_and(|count| count > 0)
    }

    pub fn seen_edges(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.counters
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(index, _)| EdgeIndex::new(index))
    }

    /// Materializes the snapshot as an owned map, e.g. to seed a worker replica.
    pub fn to_edge_map(&self) -> EdgeMap {
        EdgeMap {
            counters: Arc::clone(&self.counters),
        }
    }
}

/// The global edge map that worker-local replicas are merged into.
///
/// Merges are serialized by a mutex and happen only between executions.
#[derive(Debug, Clone, Default)]
pub struct SharedEdgeMap {
    inner: Arc<Mutex<EdgeMap>>,
}

impl SharedEdgeMap {
    pub fn new(map: EdgeMap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    /// Marks every edge the run touched and returns those that are new globally.
    pub fn merge_run(&self, result: &ExecutionResult) -> Result<Vec<EdgeIndex>, CoverageError> {
        let mut global = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(highest) = result.touched.last() {
            global.grow_to(highest.get() + 1);
        }
        let mut globally_new = Vec::new();
        for &index in &result.touched {
            if global.mark(index)? {
                globally_new.push(index);
            }
        }
        Ok(globally_new)
    }

    pub fn merge_snapshot(&self, snapshot: &EdgeMapSnapshot) -> Vec<EdgeIndex> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(snapshot)
    }

    pub fn snapshot(&self) -> EdgeMapSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn seen_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen_count()
    }
}
