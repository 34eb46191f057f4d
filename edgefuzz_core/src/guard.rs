use crate::coverage::CoverageError;
use crate::edge_map::EdgeMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key identifying one instrumentation site.
///
/// For sancov-instrumented targets this is the address of the site's guard slot.
pub type SiteLocation = u64;

/// An opaque per-site token passed by the instrumented target to the coverage callback.
///
/// Guard `0` is never assigned: sancov treats a zero guard as a disabled site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guard(u32);

impl Guard {
    /// Reinterprets a raw guard value written into the target's guard table.
    pub const fn from_raw(raw: u32) -> Self {
        Guard(raw)
    }

    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guard#{}", self.0)
    }
}

/// A dense index in `[0, N)` into the [`EdgeMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeIndex(usize);

impl EdgeIndex {
    pub const fn new(index: usize) -> Self {
        EdgeIndex(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for EdgeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge#{}", self.0)
    }
}

/// Maps instrumentation sites to guards, and guards to edge indices.
///
/// Sites are registered once, in the order the target encounters them, and each
/// receives the next sequential [`EdgeIndex`]. Guard `g` always maps to index `g - 1`.
#[derive(Debug, Default)]
pub struct GuardTable {
    guard_by_site: HashMap<SiteLocation, Guard>,
    /// Indexed by `EdgeIndex`.
    sites: Vec<SiteLocation>,
}

impl GuardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one instrumentation site and grows `edges` to the new site count.
    ///
    /// Fails with [`CoverageError::DuplicateGuard`] if `site` was already registered
    /// since the last [`reset`](Self::reset).
    pub fn register(
        &mut self,
        site: SiteLocation,
        edges: &mut EdgeMap,
    ) -> Result<Guard, CoverageError> {
        if let Some(existing) = self.guard_by_site.get(&site) {
            return Err(CoverageError::DuplicateGuard {
                site,
                guard: *existing,
            });
        }
        let index = self.sites.len();
        let raw = u32::try_from(index + 1).map_err(|_| CoverageError::GuardSpaceExhausted)?;
        let guard = Guard(raw);

        self.sites.push(site);
        self.guard_by_site.insert(site, guard);
        edges.grow_to(self.sites.len());
        Ok(guard)
    }

    /// Bulk registration of `count` sites with synthetic sequential locations,
    /// starting right after the highest location registered so far.
    pub fn register_sites(
        &mut self,
        count: u32,
        edges: &mut EdgeMap,
    ) -> Result<Vec<Guard>, CoverageError> {
        let base = self
            .sites
            .iter()
            .max()
            .map_or(0, |highest| highest.saturating_add(1));
        (0..u64::from(count))
            .map(|offset| self.register(base + offset, edges))
            .collect()
    }

    pub fn lookup(&self, guard: Guard) -> Option<EdgeIndex> {
        let index = (guard.0 as usize).checked_sub(1)?;
        (index < self.sites.len()).then_some(EdgeIndex(index))
    }

    pub fn site_of(&self, index: EdgeIndex) -> Option<SiteLocation> {
        self.sites.get(index.0).copied()
    }

    /// Forgets every registered site so a reloaded target can register again.
    ///
    /// The edge map is left untouched: it never shrinks and its hit state is never cleared.
    pub fn reset(&mut self) {
        self.guard_by_site.clear();
        self.sites.clear();
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
