//! Fatal failure classes and process exit codes.
//!
//! Most failures in the pipeline are absorbed at the component boundary (a bad frame
//! becomes "no detections", an undeliverable record is spooled). The few that halt the
//! daemon are carried as a `FatalError` inside `anyhow::Error` so the binary can map
//! them to a distinct exit code.

use std::fmt;

/// Exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code for any error that is not classified below.
pub const EXIT_RUNTIME: i32 = 1;
/// Exit code for an invalid or unreadable configuration.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for a detection model that failed to load.
pub const EXIT_MODEL_LOAD: i32 = 3;
/// Exit code for a frame source that failed permanently.
pub const EXIT_FRAME_SOURCE: i32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad configuration value, unknown source variant, unparseable URL.
    Config,
    /// The detection model could not be loaded.
    ModelLoad,
    /// The frame source is gone and its own retry budget is spent.
    FrameSource,
}

impl FailureKind {
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Config => EXIT_CONFIG,
            FailureKind::ModelLoad => EXIT_MODEL_LOAD,
            FailureKind::FrameSource => EXIT_FRAME_SOURCE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Config => "configuration",
            FailureKind::ModelLoad => "model load",
            FailureKind::FrameSource => "frame source",
        }
    }
}

/// A failure that stops the pipeline.
#[derive(Debug)]
pub struct FatalError {
    pub kind: FailureKind,
    pub message: String,
}

impl FatalError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Config, message)
    }

    pub fn model_load(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ModelLoad, message)
    }

    pub fn frame_source(message: impl Into<String>) -> Self {
        Self::new(FailureKind::FrameSource, message)
    }

    /// Wrap an arbitrary error chain under a failure class, keeping its text.
    pub fn wrap(kind: FailureKind, err: anyhow::Error) -> anyhow::Error {
        if err.downcast_ref::<FatalError>().is_some() {
            return err;
        }
        anyhow::Error::new(Self::new(kind, format!("{:#}", err)))
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for FatalError {}

/// Classify an error chain for the process exit code.
pub fn failure_kind(err: &anyhow::Error) -> Option<FailureKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<FatalError>())
        .map(|fatal| fatal.kind)
}

pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    failure_kind(err)
        .map(FailureKind::exit_code)
        .unwrap_or(EXIT_RUNTIME)
}
