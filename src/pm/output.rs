use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::pm::error::{Error, Result};

/// Append-only log file shared by every process of one application.
///
/// Writes are serialized and each one is followed by an fsync, so output written right before a
/// crash is still on disk.
#[derive(Debug)]
pub struct OutputSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl OutputSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create_dir_all {}", parent.display()), e))?;
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(format!("open sink {}", path.display()), e))?;
        Ok(Self {
            path,
            file: Mutex::new(Some(f)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut g = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let Some(f) = g.as_mut() else {
            return Err(Error::SinkClosed(self.path.clone()));
        };
        f.write_all(buf)
            .map_err(|e| Error::io(format!("write {}", self.path.display()), e))?;
        f.sync_all()
            .map_err(|e| Error::io(format!("fsync {}", self.path.display()), e))?;
        Ok(buf.len())
    }

    /// [`OutputSink::write`] on the blocking pool, for callers on the async runtime.
    pub async fn write_async(self: &Arc<Self>, buf: Vec<u8>) -> Result<usize> {
        let sink = Arc::clone(self);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || sink.write(&buf))
            .await
            .map_err(|e| Error::io(format!("write {}", path.display()), std::io::Error::other(e)))?
    }

    /// Append one line of supervisor text (spawn errors, exit statuses).
    pub async fn write_line(self: &Arc<Self>, line: impl Into<String>) -> Result<usize> {
        let mut s = line.into();
        if !s.ends_with('\n') {
            s.push('\n');
        }
        self.write_async(s.into_bytes()).await
    }

    /// Release the file handle. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut g = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(f) = g.take() {
            f.sync_all()
                .map_err(|e| Error::io(format!("fsync {}", self.path.display()), e))?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn concurrent_writers_do_not_interleave_or_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(OutputSink::open(dir.path().join("logs/app-stdout.log")).unwrap());

        let writers = 8;
        let per_writer = 200;
        let mut handles = Vec::new();
        for w in 0..writers {
            let sink = Arc::clone(&sink);
            handles.push(thread::spawn(move || {
                let mut total = 0usize;
                for i in 0..per_writer {
                    let line = format!("writer={w:02} seq={i:04} {}\n", "x".repeat(64));
                    total += sink.write(line.as_bytes()).unwrap();
                }
                total
            }));
        }
        let expected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let text = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(text.len(), expected);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), writers * per_writer);
        for l in lines {
            assert!(l.starts_with("writer="), "torn line: {l:?}");
            assert!(l.ends_with(&"x".repeat(64)), "torn line: {l:?}");
        }
    }

    #[test]
    fn reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.log");
        OutputSink::open(&p).unwrap().write(b"one\n").unwrap();
        OutputSink::open(&p).unwrap().write(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(&p).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn close_is_idempotent_and_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::open(dir.path().join("a.log")).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.is_closed());
        assert!(matches!(sink.write(b"late"), Err(Error::SinkClosed(_))));
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(OutputSink::open(dir.path().join("a.log")).unwrap());
        sink.write_line("build exited: exit status: 1").await.unwrap();
        sink.write_line("already terminated\n").await.unwrap();
        let text = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(text, "build exited: exit status: 1\nalready terminated\n");
    }
}
