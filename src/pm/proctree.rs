use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::pm::error::{Error, KillFailure, Result};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// One process and all of its live descendants, as seen by a single read of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    pub pid: i32,
    pub ppid: i32,
    pub children: Vec<ProcessNode>,
}

impl ProcessNode {
    /// Every pid in the tree, parents before children.
    pub fn pids(&self) -> Vec<i32> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(n) = stack.pop() {
            out.push(n.pid);
            for c in n.children.iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.pids().contains(&pid)
    }
}

/// Reader for the procfs process table. The root is configurable so tests can point it at a fake tree.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    root: PathBuf,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_PROC_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the parent of every live process once.
    ///
    /// Processes that vanish between listing and reading are skipped; failing to list the table at
    /// all is an error.
    pub fn snapshot(&self) -> Result<ProcessSnapshot> {
        let unreadable = |source: io::Error| Error::ProcessTableUnreadable {
            path: self.root.clone(),
            source,
        };
        let rd = fs::read_dir(&self.root).map_err(unreadable)?;

        let mut parents: HashMap<i32, i32> = HashMap::new();
        for ent in rd {
            let ent = match ent {
                Ok(e) => e,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(unreadable(e)),
            };
            let Some(pid) = ent.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            let Ok(stat) = fs::read_to_string(ent.path().join("stat")) else {
                continue;
            };
            if let Some(ppid) = parse_stat_ppid(&stat) {
                parents.insert(pid, ppid);
            }
        }
        if parents.is_empty() {
            return Err(unreadable(io::Error::new(
                io::ErrorKind::InvalidData,
                "no processes found",
            )));
        }
        Ok(ProcessSnapshot::from_parents(parents))
    }

    /// The subtree rooted at `pid`, or `None` if that pid is not in the table.
    pub fn build_tree(&self, pid: i32) -> Result<Option<ProcessNode>> {
        Ok(self.snapshot()?.tree(pid))
    }

    /// Single-letter procfs state (`R`, `S`, `Z`, ...) of a pid, if it exists.
    pub fn state(&self, pid: i32) -> Option<char> {
        let stat = fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        let rparen = stat.rfind(')')?;
        stat.get(rparen + 1..)?.split_whitespace().next()?.chars().next()
    }

    /// True while the pid exists and is not a zombie.
    pub fn is_alive(&self, pid: i32) -> bool {
        !matches!(self.state(pid), None | Some('Z') | Some('X'))
    }
}

// /proc/<pid>/stat: "pid (comm) state ppid ...". comm may itself contain spaces and parens.
fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let rparen = stat.rfind(')')?;
    let mut fields = stat.get(rparen + 1..)?.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    parents: HashMap<i32, i32>,
    children: HashMap<i32, Vec<i32>>,
}

impl ProcessSnapshot {
    pub fn from_parents(parents: HashMap<i32, i32>) -> Self {
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for (&pid, &ppid) in &parents {
            if pid != ppid {
                children.entry(ppid).or_default().push(pid);
            }
        }
        for v in children.values_mut() {
            v.sort_unstable();
        }
        Self { parents, children }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn tree(&self, root: i32) -> Option<ProcessNode> {
        let ppid = *self.parents.get(&root)?;
        let mut seen = HashSet::new();
        Some(self.node(root, ppid, &mut seen))
    }

    fn node(&self, pid: i32, ppid: i32, seen: &mut HashSet<i32>) -> ProcessNode {
        seen.insert(pid);
        let kids: Vec<i32> = self
            .children
            .get(&pid)
            .map(|kids| kids.iter().copied().filter(|k| !seen.contains(k)).collect())
            .unwrap_or_default();
        let children = kids.into_iter().map(|k| self.node(k, pid, seen)).collect();
        ProcessNode {
            pid,
            ppid,
            children,
        }
    }
}

/// Signal every process in the tree, parents first.
///
/// A pid that is already gone is not a failure. Other failures are collected and reported together
/// after every pid has been tried.
pub fn kill_tree(node: &ProcessNode, sig: Signal) -> Result<()> {
    let mut failures = Vec::new();
    for pid in node.pids() {
        if pid <= 0 {
            continue;
        }
        match kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => failures.push(KillFailure { pid, errno }),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::KillFailed { failures })
    }
}

/// Signal a whole process group. Stage processes lead their own session, so a stage pid is also
/// its group id and the group outlives a root that was already reaped.
pub fn kill_group(pgid: i32, sig: Signal) -> Result<()> {
    if pgid <= 1 {
        return Ok(());
    }
    match killpg(Pid::from_raw(pgid), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(Error::KillFailed {
            failures: vec![KillFailure { pid: pgid, errno }],
        }),
    }
}
