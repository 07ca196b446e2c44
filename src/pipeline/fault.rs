use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Characters of an output line quoted in a fault context
const LINE_PREFIX_CHARS: usize = 30;

/// Stage (or lifecycle step) a fault came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    InitializingIntake,
    InitializingOutput,
    Intake,
    Parsing,
    InitiatingRecord,
    Clustering,
    Transforming,
    Routing,
    Output,
    DisposingIntake,
    DisposingOutput,
}

impl FaultOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultOrigin::InitializingIntake => "initializing intake",
            FaultOrigin::InitializingOutput => "initializing output",
            FaultOrigin::Intake => "intake block",
            FaultOrigin::Parsing => "parsing block",
            FaultOrigin::InitiatingRecord => "initiating record",
            FaultOrigin::Clustering => "clustering block",
            FaultOrigin::Transforming => "transforming block",
            FaultOrigin::Routing => "routing block",
            FaultOrigin::Output => "output block",
            FaultOrigin::DisposingIntake => "disposing intake",
            FaultOrigin::DisposingOutput => "disposing output",
        }
    }
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional descriptors appended to the origin
pub mod position {
    use super::LINE_PREFIX_CHARS;

    pub fn after_line(line_no: usize) -> String {
        format!(" after line #{}", line_no)
    }

    pub fn at_line(line_no: usize) -> String {
        format!(" at line #{}", line_no)
    }

    pub fn at_record(rec_no: usize) -> String {
        format!(" at record #{}", rec_no)
    }

    pub fn at_cluster(clstr_no: usize) -> String {
        format!(" at cluster #{}", clstr_no)
    }

    pub fn at_output_line(line: &str) -> String {
        let prefix: String = line.chars().take(LINE_PREFIX_CHARS).collect();
        format!(" at line starting with '{}'", prefix)
    }
}

/// First failure of an execution
#[derive(Debug)]
pub struct FaultReport {
    pub origin: FaultOrigin,
    pub context: String,
    pub error: anyhow::Error,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error occurred in {}{}: {:#}", self.origin, self.context, self.error)
    }
}

pub type ErrorHandler = Arc<dyn Fn(&FaultReport) + Send + Sync>;

/// Captures the first fault, hands it to the error handler and asks every
/// stage to stop. Later faults are only logged.
pub struct FaultReporter {
    first: Mutex<Option<Arc<FaultReport>>>,
    handler: Option<ErrorHandler>,
    token: CancellationToken,
}

impl FaultReporter {
    pub fn new(handler: Option<ErrorHandler>, token: CancellationToken) -> Self {
        FaultReporter {
            first: Mutex::new(None),
            handler,
            token,
        }
    }

    /// Record a fault; returns true when it is the first one
    pub fn report(&self, origin: FaultOrigin, context: String, error: anyhow::Error) -> bool {
        let report = {
            let mut first = self.first.lock();
            if first.is_some() {
                warn!(origin = %origin, context = %context, error = %error, "Subsequent fault ignored");
                return false;
            }
            let report = Arc::new(FaultReport {
                origin,
                context,
                error,
            });
            *first = Some(report.clone());
            report
        };

        error!(
            origin = %report.origin,
            context = %report.context,
            error = %format!("{:#}", report.error),
            "Pipeline fault"
        );
        if let Some(handler) = &self.handler {
            handler(&report);
        }
        self.token.cancel();
        true
    }

    pub fn has_fault(&self) -> bool {
        self.first.lock().is_some()
    }

    pub fn fault(&self) -> Option<Arc<FaultReport>> {
        self.first.lock().clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Run a user callback, turning a panic into an error
pub fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "callback panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// Await a user future, turning a panic into an error
pub async fn guarded_async<T, F>(future: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match std::panic::AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "callback panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// Text of a panic payload captured from a callback
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
