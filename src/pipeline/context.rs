use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// All intake lines were processed
    IntakeDepleted,
    /// `intake_record_limit` stopped intake early
    LimitReached,
    /// `time_limit` stopped intake early
    TimedOut,
    /// `cancel()` was called
    Canceled,
    /// An initializer failed; nothing was processed
    InitializationError,
    /// A stage failed while processing
    Failed,
    /// Second execute, or execute after dispose
    InvalidAttempt,
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CompletionStatus::IntakeDepleted
                | CompletionStatus::LimitReached
                | CompletionStatus::TimedOut
        )
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one execution: status plus the counts reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub completion_status: CompletionStatus,
    pub rows_read: usize,
    pub clusters_read: usize,
    pub rows_written: usize,
    pub clusters_written: usize,
}

impl ExecutionResult {
    pub(crate) fn new(completion_status: CompletionStatus, counts: Counts) -> Self {
        ExecutionResult {
            completion_status,
            rows_read: counts.rows_read,
            clusters_read: counts.clusters_read,
            rows_written: counts.rows_written,
            clusters_written: counts.clusters_written,
        }
    }

    pub fn invalid_attempt() -> Self {
        Self::new(CompletionStatus::InvalidAttempt, Counts::default())
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub rows_read: usize,
    pub clusters_read: usize,
    pub rows_written: usize,
    pub clusters_written: usize,
}

/// Counters updated by the stage workers
#[derive(Debug, Default)]
pub struct Counters {
    rows_read: AtomicUsize,
    clusters_read: AtomicUsize,
    rows_written: AtomicUsize,
    clusters_written: AtomicUsize,
}

impl Counters {
    pub fn add_row_read(&self) -> usize {
        self.rows_read.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_cluster_read(&self) -> usize {
        self.clusters_read.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add_rows_written(&self, n: usize) -> usize {
        self.rows_written.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn add_cluster_written(&self) -> usize {
        self.clusters_written.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> Counts {
        Counts {
            rows_read: self.rows_read.load(Ordering::SeqCst),
            clusters_read: self.clusters_read.load(Ordering::SeqCst),
            rows_written: self.rows_written.load(Ordering::SeqCst),
            clusters_written: self.clusters_written.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Intake,
    Transformation,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseStatus {
    Starting,
    Finished,
}

/// Lifecycle notification delivered to `on_phase` handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub counts: Counts,
}

/// Delivered to progress handlers every `progress_interval` clusters written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub counts: Counts,
    pub elapsed: Duration,
}
