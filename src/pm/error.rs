use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

/// A single pid that could not be signalled during a tree kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillFailure {
    pub pid: i32,
    pub errno: Errno,
}

impl std::fmt::Display for KillFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid={} err={}", self.pid, self.errno)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("process table unreadable at {path}: {source}")]
    ProcessTableUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal {} process(es): {}", failures.len(), render_failures(failures))]
    KillFailed { failures: Vec<KillFailure> },

    #[error("listening sockets unavailable: {0}")]
    ListenersUnavailable(String),

    #[error("application not found: {0}")]
    AppNotFound(String),

    #[error("application already exists: {0}")]
    AppExists(String),

    #[error("invalid application: {0}")]
    InvalidApp(String),

    #[error("output sink closed: {}", .0.display())]
    SinkClosed(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("app snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

fn render_failures(failures: &[KillFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_failed_lists_every_pid() {
        let e = Error::KillFailed {
            failures: vec![
                KillFailure { pid: 10, errno: Errno::EPERM },
                KillFailure { pid: 11, errno: Errno::EPERM },
            ],
        };
        let s = e.to_string();
        assert!(s.starts_with("failed to signal 2 process(es)"));
        assert!(s.contains("pid=10"));
        assert!(s.contains("pid=11"));
    }

    #[test]
    fn table_error_keeps_source() {
        let e = Error::ProcessTableUnreadable {
            path: PathBuf::from("/proc"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(std::error::Error::source(&e).is_some());
        assert!(e.to_string().contains("/proc"));
    }
}
