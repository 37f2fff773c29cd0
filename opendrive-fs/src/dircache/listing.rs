use std::collections::VecDeque;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::DriverError;

/// Child directory as reported by one remote listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDir {
    pub name: String,
    pub id: String,
    pub modified: Option<OffsetDateTime>,
}

/// Child file as reported by one remote listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub id: String,
    pub size: i64,
    pub modified: Option<OffsetDateTime>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    pub dirs: Vec<RemoteDir>,
    pub files: Vec<RemoteFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub path: String,
    pub id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub id: String,
    pub size: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entry {
    Dir(DirEntry),
    File(FileEntry),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::Dir(dir) => &dir.path,
            Entry::File(file) => &file.path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir(_))
    }
}

/// One pending unit of a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDirJob {
    pub dir_id: String,
    /// Logical prefix for children: `dir/` or empty for the root.
    pub path: String,
    /// Levels still allowed below this directory; `None` is unbounded.
    pub depth: Option<u32>,
}

impl ListDirJob {
    pub fn new(dir_id: impl Into<String>, dir_path: &str, depth: Option<u32>) -> Self {
        let path = if dir_path.is_empty() {
            String::new()
        } else {
            format!("{dir_path}/")
        };
        Self {
            dir_id: dir_id.into(),
            path,
            depth,
        }
    }

    pub fn dir_path(&self) -> &str {
        self.path.strip_suffix('/').unwrap_or(&self.path)
    }

    pub fn entry_path(&self, name: &str) -> String {
        format!("{}{}", self.path, name)
    }

    /// Job for a child directory, or `None` once the depth budget is spent.
    pub fn child(&self, dir_id: &str, name: &str) -> Option<Self> {
        let depth = match self.depth {
            None => None,
            Some(0) => return None,
            Some(depth) => Some(depth - 1),
        };
        Some(Self {
            dir_id: dir_id.to_string(),
            path: format!("{}/", self.entry_path(name)),
            depth,
        })
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    inner: VecDeque<ListDirJob>,
}

impl JobQueue {
    pub fn enqueue(&mut self, job: ListDirJob) {
        self.inner.push_back(job);
    }

    pub fn dequeue(&mut self) -> Option<ListDirJob> {
        self.inner.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drops every pending job, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let pending = self.inner.len();
        self.inner.clear();
        pending
    }
}

/// Answer of a sink to one emitted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Keep the directory entry but do not list below it.
    SkipDescent,
    /// Accept nothing more; pending jobs are dropped.
    Stop,
}

/// Receives the entries and per-subtree errors of a listing.
pub trait ListSink: Send {
    /// Filter applied before a directory is emitted or descended into.
    fn include_directory(&mut self, _path: &str) -> bool {
        true
    }

    fn add_dir(&mut self, dir: DirEntry) -> Visit;

    fn add_file(&mut self, file: FileEntry) -> Visit;

    fn set_error(&mut self, path: &str, err: DriverError);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListSummary {
    pub dirs: usize,
    pub files: usize,
    pub failed: usize,
    pub stopped: bool,
}

/// Sink that keeps everything in memory, optionally up to `limit` entries.
#[derive(Debug, Default)]
pub struct EntryCollector {
    pub entries: Vec<Entry>,
    pub errors: Vec<(String, DriverError)>,
    limit: Option<usize>,
}

impl EntryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    fn push(&mut self, entry: Entry) -> Visit {
        let Some(limit) = self.limit else {
            self.entries.push(entry);
            return Visit::Continue;
        };
        if self.entries.len() < limit {
            self.entries.push(entry);
        }
        if self.entries.len() >= limit {
            Visit::Stop
        } else {
            Visit::Continue
        }
    }
}

impl ListSink for EntryCollector {
    fn add_dir(&mut self, dir: DirEntry) -> Visit {
        self.push(Entry::Dir(dir))
    }

    fn add_file(&mut self, file: FileEntry) -> Visit {
        self.push(Entry::File(file))
    }

    fn set_error(&mut self, path: &str, err: DriverError) {
        self.errors.push((path.to_string(), err));
    }
}
