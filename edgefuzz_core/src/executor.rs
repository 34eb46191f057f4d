use crate::coverage::{CoverageCollector, CoverageError, ExecutionResult};
use crate::input::Input;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    Crash(String),
}

/// Runs the target once per input, with `coverage` receiving the target's edge callbacks.
///
/// Implementations must open a run before the target starts and close it afterwards,
/// whatever the target did. The second element of the returned pair is the target's
/// exit status, `None` if it crashed or the run was aborted.
pub trait ExecutionDriver<I: Input> {
    fn run_once(
        &mut self,
        input: &I,
        coverage: &mut CoverageCollector,
    ) -> Result<(ExecutionResult, Option<i32>), CoverageError>;
}

/// Runs an instrumented harness function inside the fuzzer process.
///
/// The harness reports edges by calling [`CoverageCollector::on_edge`]. A panic is
/// reported as [`ExecutionStatus::Crash`]. A harness that returns later than the
/// configured timeout is reported as [`ExecutionStatus::Timeout`]; this driver cannot
/// interrupt a harness that never returns.
pub struct InProcessDriver<F>
where
    F: FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError>,
{
    harness_fn: F,
    timeout: Option<Duration>,
}

impl<F> InProcessDriver<F>
where
    F: FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError>,
{
    pub fn new(harness_fn: F) -> Self {
        Self {
            harness_fn,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn panic_message(panic_payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

impl<I: Input, F> ExecutionDriver<I> for InProcessDriver<F>
where
    F: FnMut(&[u8], &mut CoverageCollector) -> Result<i32, CoverageError>,
{
    fn run_once(
        &mut self,
        input: &I,
        coverage: &mut CoverageCollector,
    ) -> Result<(ExecutionResult, Option<i32>), CoverageError> {
        let run = coverage.begin_run()?;
        let started = Instant::now();

        let harness = &mut self.harness_fn;
        let outcome = catch_unwind(AssertUnwindSafe(|| harness(input.as_bytes(), coverage)));
        let elapsed = started.elapsed();

        let (mut status, exit_code) = match outcome {
            Ok(Ok(code)) => (ExecutionStatus::Ok, Some(code)),
            Ok(Err(error)) => {
                tracing::debug!(run = run.id(), %error, "harness stopped on a coverage error");
                // Keeps the first failure when on_edge already recorded one.
                coverage.fail_run(error)?;
                (ExecutionStatus::Ok, None)
            }
            Err(panic_payload) => (
                ExecutionStatus::Crash(panic_message(panic_payload.as_ref())),
                None,
            ),
        };

        if status == ExecutionStatus::Ok && self.timeout.is_some_and(|limit| elapsed > limit) {
            status = ExecutionStatus::Timeout;
        }

        let result = coverage.end_run(run, status)?;
        Ok((result, exit_code))
    }
}
