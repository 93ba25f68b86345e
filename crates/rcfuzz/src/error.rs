use crate::fuzzers::FuzzerKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy of the supervisor.
///
/// Structural failures (startup, evaluator, driver, CPU hierarchy) terminate
/// the whole run through the teardown path; `Interrupted` drains and exits
/// cleanly instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("startup failed: {0}")]
    FatalStartup(String),

    #[error("evaluator is down: {0}")]
    EvaluatorDown(String),

    #[error("coverage snapshot unavailable after {waited_secs}s of backoff")]
    ProbeUnavailable { waited_secs: u64 },

    #[error("driver `{action}` failed for {fuzzer}: {message}")]
    Driver {
        fuzzer: FuzzerKind,
        action: &'static str,
        message: String,
    },

    #[error("bitmap size mismatch: expected {expected} bytes, got {actual}")]
    InvalidBitmap { expected: usize, actual: usize },

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code mandated for this failure. An interrupt is a clean
    /// shutdown; everything else reports failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Interrupted => 0,
            _ => 1,
        }
    }
}
