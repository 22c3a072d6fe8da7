use std::fmt;

use camino::Utf8PathBuf;
#[cfg(feature = "live")]
use std::sync::mpsc::RecvError;
use thiserror::Error;

/// Problems with the configuration or the shape of the task graph. Always
/// detected before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Asset class '{0}' is not declared in the source manifest")]
    UndeclaredAssetClass(String),

    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cyclic dependency detected involving task '{0}'")]
    Cycle(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't read configuration file {path}.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed configuration file {path}.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Couldn't resolve project root {path}.\n{source}")]
    Root {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// A single file failed a single pipeline step.
#[derive(Debug, Error)]
#[error("{file}: step '{step}' failed.\n{source}")]
pub struct TransformError {
    pub file: Utf8PathBuf,
    pub step: &'static str,
    #[source]
    pub source: anyhow::Error,
}

impl TransformError {
    pub fn new(
        file: impl Into<Utf8PathBuf>,
        step: &'static str,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            file: file.into(),
            step,
            source: source.into(),
        }
    }
}

/// A responsive variant would need upscaling that the configuration forbids.
#[derive(Debug, Error)]
#[error("variant '{suffix}' needs {width}px but the source is only {source_width}px wide")]
pub struct EnlargementPolicyViolation {
    pub file: Utf8PathBuf,
    pub suffix: String,
    pub width: u32,
    pub source_width: u32,
}

/// A style finding reported by a lint step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    pub file: Utf8PathBuf,
    pub line: usize,
    pub rule: &'static str,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {} ({})", self.file, self.line, self.message, self.rule)
    }
}

/// Everything a task can fail with.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("{} file(s) failed:\n{}", .0.len(), list(.0))]
    Partial(Vec<TransformError>),

    #[error("Couldn't collect source files.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Dependency '{0}' has no usable output")]
    MissingDependency(String),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn list(errors: &[TransformError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Recv(#[from] RecvError),

    #[error("Couldn't bind the reload socket on port {port}.\n{source}")]
    Bind { port: u16, source: std::io::Error },
}
