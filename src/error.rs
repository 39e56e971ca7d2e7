//! Error types shared by the provisioning pipelines
//!
//! Precondition and configuration errors are caller mistakes and never
//! retried. Cluster errors carry the object they were about. Timeouts are
//! structured so callers can tell which phase stalled.

use std::fmt;
use std::time::Duration;

use crate::k8s::ClusterError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Precondition(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("deployment {0:?} exceeded its progress deadline")]
    ProgressDeadline(String),

    #[error("no previous revision to roll deployment {0:?} back to")]
    NoPreviousRevision(String),

    #[error("pod {pod:?} failed: {reason}")]
    PodFailed { pod: String, reason: String },

    #[error("error attaching to {pod}/{container}: {source}")]
    Attach {
        pod: String,
        container: String,
        #[source]
        source: ClusterError,
    },

    #[error("error reading log of {pod}/{container}: {source}")]
    Logs {
        pod: String,
        container: String,
        #[source]
        source: ClusterError,
    },

    #[error("invalid image inspect response: {raw:?}: {source}")]
    InvalidInspectResponse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to pull and tag image: output: {output:?}: {source}")]
    Inspect {
        /// Sidecar log captured before the failure.
        output: String,
        #[source]
        source: Box<Error>,
    },

    #[error("error starting units: {source}{}", rollback_suffix(.rollback))]
    UnitStartup {
        #[source]
        source: Box<Error>,
        rollback: Option<Box<Error>>,
    },

    #[error(transparent)]
    Multi(#[from] MultiError),
}

fn rollback_suffix(rollback: &Option<Box<Error>>) -> String {
    match rollback {
        Some(err) => format!(" (rollback also failed: {err})"),
        None => String::new(),
    }
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    /// True when the underlying cluster error is a not-found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Cluster(e) if e.is_not_found())
    }
}

/// Phase a timeout was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TimeoutPhase {
    #[strum(serialize = "pod running")]
    PodRunning,
    #[strum(serialize = "pod ready")]
    PodReady,
    #[strum(serialize = "deployment generation")]
    Generation,
    #[strum(serialize = "healthcheck")]
    Healthcheck,
    #[strum(serialize = "full rollout")]
    FullRollout,
}

#[derive(Debug, Clone)]
pub struct TimeoutError {
    pub phase: TimeoutPhase,
    /// Object the wait was about (pod or deployment name).
    pub target: String,
    pub elapsed: Duration,
    /// Best-effort reasons scraped from not-ready pods.
    pub messages: Vec<String>,
}

impl TimeoutError {
    pub fn new(phase: TimeoutPhase, target: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            phase,
            target: target.into(),
            elapsed,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<String>) -> Self {
        self.messages = messages;
        self
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeout waiting {} for {:?} after {:?}",
            self.phase, self.target, self.elapsed
        )?;
        if !self.messages.is_empty() {
            write!(f, ": {}", self.messages.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for TimeoutError {}

/// Aggregates every failure of a multi-step operation.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl Into<Error>) {
        self.errors.push(err.into());
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// The lone error as itself, several as [`Error::Multi`].
    pub fn into_error(mut self) -> Option<Error> {
        match self.errors.len() {
            0 => None,
            1 => self.errors.pop(),
            _ => Some(Error::Multi(self)),
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.errors.as_slice() {
            return write!(f, "{single}");
        }
        write!(f, "multiple errors reported ({}):", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, " error #{i}: {err}")?;
            if i + 1 < self.errors.len() {
                write!(f, ";")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
