use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Recoverable problems found while loading. None of them stop the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    MalformedLine,
    CircularInclude,
    IncludeNotFound,
}

impl DiagnosticKind {
    pub fn label(self) -> &'static str {
        match self {
            DiagnosticKind::MalformedLine => "malformed line",
            DiagnosticKind::CircularInclude => "circular include",
            DiagnosticKind::IncludeNotFound => "include not found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub path: PathBuf,
    /// 1-based line number, when the problem belongs to a single line.
    pub line: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn new(
        kind: DiagnosticKind,
        path: &Path,
        line: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        let diagnostic = Self {
            kind,
            path: path.to_path_buf(),
            line,
            message: message.into(),
        };
        tracing::warn!("{}", diagnostic);
        diagnostic
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(
                f,
                "{}:{}: {}: {}",
                self.path.display(),
                line,
                self.kind.label(),
                self.message
            ),
            None => write!(
                f,
                "{}: {}: {}",
                self.path.display(),
                self.kind.label(),
                self.message
            ),
        }
    }
}

/// Loading the root file failed. Included files never produce this.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("SSH config not found at {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("Failed to read SSH config at {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LoadError {
    pub(crate) fn from_io(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            LoadError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            LoadError::Unreadable {
                path: path.to_path_buf(),
                source: err,
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("No connectable host named '{0}'")]
    HostNotFound(String),
    #[error("'{0}' already appears on a Host line")]
    DuplicateHost(String),
    #[error("Invalid host name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Invalid value for {keyword}: {reason}")]
    InvalidValue { keyword: String, reason: String },
    #[error("{0} can't be edited as a host directive")]
    UnsupportedDirective(String),
    #[error("{0} is required for a connectable host and can't be removed")]
    RequiredDirective(String),
    #[error("{} is not part of the loaded config", .0.display())]
    UnknownFile(PathBuf),
    #[error("{} changed on disk since it was loaded; reload before editing", .0.display())]
    ExternalModification(PathBuf),
    #[error("Permission denied writing {}", .path.display())]
    PermissionDenied { path: PathBuf },
    #[error("No space left writing {}", .path.display())]
    DiskFull { path: PathBuf },
    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Config was written but could not be reloaded: {0}")]
    Reload(#[source] LoadError),
}

impl WriteError {
    pub(crate) fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => WriteError::PermissionDenied {
                path: path.to_path_buf(),
            },
            io::ErrorKind::StorageFull => WriteError::DiskFull {
                path: path.to_path_buf(),
            },
            _ => WriteError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("ssh -G for '{nickname}' {}: {stderr}", exit_label(.code))]
    ResolutionFailed {
        nickname: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("SSH client '{}' is not installed or not on PATH", .program.display())]
    ClientUnavailable { program: PathBuf },
    #[error("Resolving '{nickname}' timed out after {:.1}s", .timeout.as_secs_f64())]
    ResolutionTimedOut { nickname: String, timeout: Duration },
    #[error("Resolving '{nickname}' was cancelled")]
    Cancelled { nickname: String },
    #[error("'{0}' is not a usable host nickname")]
    InvalidNickname(String),
    #[error("Failed to run SSH client: {0}")]
    Io(#[from] io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}
