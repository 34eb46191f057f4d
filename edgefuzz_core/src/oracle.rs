use crate::executor::ExecutionStatus;
use crate::input::Input;

/// Default severity level for crashes detected by `CrashOracle`.
/// Higher values indicate more severe issues.
const DEFAULT_CRASH_SEVERITY: u8 = 10;
const DEFAULT_TIMEOUT_SEVERITY: u8 = 5;

/// A crashing or hanging input retained for triage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport<I: Input> {
    /// The specific input that triggered this bug report.
    pub input: I,
    /// A human-readable description of the bug or finding.
    pub description: String,
    /// MD5 hex of the input, used for deduplication and as the on-disk key.
    pub input_hash: String,
    /// A numerical representation of the bug's severity.
    pub severity: u8,
    /// The status the execution ended with.
    pub status: ExecutionStatus,
}

/// An `Oracle` examines the outcome of a target's execution to determine if a bug has occurred.
pub trait Oracle<I: Input>: Send + Sync {
    /// Returns `Some(BugReport)` if `status` indicates a bug worth keeping.
    fn examine(&self, input: &I, status: &ExecutionStatus) -> Option<BugReport<I>>;
}

/// Reports crashes and timeouts. Neither is ever silently discarded.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    pub fn new() -> Self {
        CrashOracle
    }
}

impl<I: Input> Oracle<I> for CrashOracle {
    fn examine(&self, input: &I, status: &ExecutionStatus) -> Option<BugReport<I>> {
        let (description, severity) = match status {
            ExecutionStatus::Crash(description) => {
                (format!("Crash: {description}"), DEFAULT_CRASH_SEVERITY)
            }
            ExecutionStatus::Timeout => ("Timeout".to_string(), DEFAULT_TIMEOUT_SEVERITY),
            ExecutionStatus::Ok => return None,
        };
        Some(BugReport {
            input: input.clone(),
            description,
            input_hash: input.content_hash(),
            severity,
            status: status.clone(),
        })
    }
}
