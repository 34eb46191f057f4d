//! The magic-ladder demonstration target.
//!
//! The target walks the input one byte at a time against `"ABCDEFGHIJKLMNO"` and then
//! expects the little-endian word `0xdeadbeef`. Every rung climbed is one edge, so a
//! coverage-guided fuzzer can reach the goal one byte at a time where blind mutation
//! would not.

use crate::coverage::{CoverageCollector, CoverageError};
use crate::guard::Guard;

pub const LADDER: &[u8; 15] = b"ABCDEFGHIJKLMNO";
pub const MAGIC: u32 = 0xdead_beef;
/// One site per rung plus the goal site.
pub const SITE_COUNT: u32 = LADDER.len() as u32 + 1;
/// Exit code of a run that reached the goal.
pub const GOAL_EXIT_CODE: i32 = 99;
/// Failed rungs past this depth all report the same exit code.
const MAX_REPORTED_DEPTH: usize = 7;

/// Guards of the ladder's instrumentation sites, registered with one collector.
#[derive(Debug, Clone)]
pub struct LadderTarget {
    rungs: Vec<Guard>,
    goal: Guard,
}

impl LadderTarget {
    /// Registers the ladder's sites with `collector`. Rung `i` gets edge `i`, the goal
    /// gets edge 15 when the collector had no sites before.
    pub fn register(collector: &mut CoverageCollector) -> Result<Self, CoverageError> {
        let mut rungs = collector.on_site_table_init(SITE_COUNT)?;
        let goal = rungs.pop().ok_or(CoverageError::GuardSpaceExhausted)?;
        Ok(Self { rungs, goal })
    }

    /// Runs the target on `data`, reporting each rung climbed to `coverage`.
    ///
    /// Returns the failed rung's depth (capped at 7), 0 if the ladder was climbed but the
    /// magic word is wrong, and [`GOAL_EXIT_CODE`] on success.
    pub fn run(
        &self,
        data: &[u8],
        coverage: &mut CoverageCollector,
    ) -> Result<i32, CoverageError> {
        for (depth, (&rung, expected)) in self.rungs.iter().zip(LADDER).enumerate() {
            if data.get(depth) != Some(expected) {
                return Ok(depth.min(MAX_REPORTED_DEPTH) as i32);
            }
            coverage.on_edge(rung)?;
        }

        let magic = data
            .get(LADDER.len()..LADDER.len() + 4)
            .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
            .map(u32::from_le_bytes);
        if magic != Some(MAGIC) {
            return Ok(0);
        }
        coverage.on_edge(self.goal)?;
        Ok(GOAL_EXIT_CODE)
    }

    /// Wraps the target as a harness for [`InProcessDriver`](crate::executor::InProcessDriver).
    pub fn into_harness(
        self,
    ) -> impl FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError> {
        move |data: &[u8], coverage: &mut CoverageCollector| self.run(data, coverage)
    }

    /// An input that reaches the goal.
    pub fn winning_input() -> Vec<u8> {
        let mut input = LADDER.to_vec();
        input.extend_from_slice(&MAGIC.to_le_bytes());
        input
    }
}
