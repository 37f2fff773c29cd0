//! Maps slash-separated logical paths to the remote store's directory ids.
//!
//! The remote API only knows "list children of id X" and "create child named
//! L under id X", so a path is resolved by walking its segments from the
//! nearest cached ancestor. Every resolved prefix is cached until it is
//! explicitly invalidated.
//!
//! Each cache slot is a single-result latch: concurrent resolutions of the
//! same missing path wait on the one lookup (and create) already in flight
//! instead of issuing their own, so a folder is never created twice.

pub mod listing;
pub mod paths;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::error::DriverError;
use listing::{
    DirEntry, FileEntry, JobQueue, ListDirJob, ListSink, ListSummary, RemoteListing, Visit,
};

/// Remote primitives the cache is built on.
#[async_trait]
pub trait DirectoryOps: Send + Sync {
    /// Id of the directory named `leaf` directly under `parent_id`, if any.
    async fn find_leaf(&self, parent_id: &str, leaf: &str)
    -> Result<Option<String>, DriverError>;

    /// Creates directory `leaf` under `parent_id` and returns its id.
    async fn create_dir(&self, parent_id: &str, leaf: &str) -> Result<String, DriverError>;

    async fn list_children(&self, dir_id: &str) -> Result<RemoteListing, DriverError>;
}

type Slot = Arc<OnceCell<String>>;

/// A resolved prefix the walk continues from. `slot` is `None` for the root.
struct Anchor {
    path: String,
    id: String,
    slot: Option<Slot>,
}

pub struct DirCache<B> {
    ops: Arc<B>,
    root_id: String,
    slots: Mutex<HashMap<String, Slot>>,
    /// Bumped under the `slots` lock by every invalidation.
    generation: AtomicU64,
}

impl<B: DirectoryOps> DirCache<B> {
    pub fn new(ops: Arc<B>, root_id: impl Into<String>) -> Self {
        let root_id = root_id.into();
        let mut slots = HashMap::new();
        slots.insert(String::new(), ready_slot(&root_id));
        Self {
            ops,
            root_id,
            slots: Mutex::new(slots),
            generation: AtomicU64::new(0),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn ops(&self) -> &Arc<B> {
        &self.ops
    }

    /// Cached id for `path`, without any remote call.
    pub async fn get(&self, path: &str) -> Result<Option<String>, DriverError> {
        let path = paths::normalize(path)?;
        Ok(self.cached(&path).await)
    }

    /// Records an id learnt elsewhere, replacing any previous entry. A
    /// lookup already in flight for `path` keeps its slot and wins.
    pub async fn put(&self, path: &str, id: &str) -> Result<(), DriverError> {
        let path = paths::normalize(path)?;
        if path.is_empty() {
            return Ok(());
        }
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(path).or_default();
        if slot.initialized() || Arc::strong_count(slot) == 1 {
            *slot = ready_slot(id);
        }
        Ok(())
    }

    /// Number of resolved paths, the root included.
    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Forgets everything but the root.
    pub async fn flush(&self) {
        let mut slots = self.slots.lock().await;
        slots.retain(|path, _| path.is_empty());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops `path` and every cached path below it. Returns the number of
    /// resolved entries removed.
    pub async fn invalidate(&self, path: &str) -> Result<usize, DriverError> {
        let path = paths::normalize(path)?;
        let mut slots = self.slots.lock().await;
        let before = slots.values().filter(|slot| slot.initialized()).count();
        slots.retain(|key, _| key.is_empty() || !paths::is_within(key, &path));
        self.generation.fetch_add(1, Ordering::SeqCst);
        let removed = before - slots.values().filter(|slot| slot.initialized()).count();
        debug!(path, removed, "dircache invalidated");
        Ok(removed)
    }

    /// Resolves `path` to a directory id, creating missing directories when
    /// `create` is set.
    pub async fn resolve(&self, path: &str, create: bool) -> Result<String, DriverError> {
        let path = paths::normalize(path)?;
        if path.is_empty() {
            return Ok(self.root_id.clone());
        }
        if let Some(id) = self.cached(&path).await {
            return Ok(id);
        }

        let segments: Vec<&str> = path.split('/').collect();
        'walk: loop {
            let (mut resolved, mut anchor) = self.nearest_cached_ancestor(&segments).await;
            debug!(path, from = resolved, create, "dircache miss, walking");
            while resolved < segments.len() {
                let prefix = segments[..=resolved].join("/");
                match self
                    .resolve_segment(&prefix, &anchor, segments[resolved], create)
                    .await?
                {
                    Some(next) => anchor = next,
                    None => {
                        debug!(path, stale = %anchor.path, "ancestor invalidated, restarting walk");
                        continue 'walk;
                    }
                }
                resolved += 1;
            }
            return Ok(anchor.id);
        }
    }

    /// Breadth-first listing below `start`, `max_depth` levels deep (`None`
    /// is unbounded). A failing subtree is reported to the sink and skipped.
    pub async fn enumerate_recursive<S>(
        &self,
        start: &str,
        max_depth: Option<u32>,
        sink: &mut S,
    ) -> Result<ListSummary, DriverError>
    where
        S: ListSink + ?Sized,
    {
        let start = paths::normalize(start)?;
        let start_id = self.resolve(&start, false).await?;
        let mut queue = JobQueue::default();
        queue.enqueue(ListDirJob::new(start_id, &start, max_depth));
        let mut summary = ListSummary::default();

        while let Some(job) = queue.dequeue() {
            let generation = self.generation.load(Ordering::SeqCst);
            let listing = match self.ops.list_children(&job.dir_id).await {
                Ok(listing) => listing,
                Err(err) => {
                    warn!(path = job.dir_path(), error = %err, "listing failed, skipping subtree");
                    summary.failed += 1;
                    sink.set_error(job.dir_path(), err);
                    continue;
                }
            };

            for dir in listing.dirs {
                let path = job.entry_path(&dir.name);
                if !sink.include_directory(&path) {
                    continue;
                }
                self.remember(&path, &dir.id, generation).await;
                let child = job.child(&dir.id, &dir.name);
                summary.dirs += 1;
                let visit = sink.add_dir(DirEntry {
                    path,
                    id: dir.id,
                    modified: dir.modified,
                });
                match (visit, child) {
                    (Visit::Stop, _) => return Ok(stop(summary, &mut queue)),
                    (Visit::Continue, Some(child)) => queue.enqueue(child),
                    _ => {}
                }
            }

            for file in listing.files {
                summary.files += 1;
                let visit = sink.add_file(FileEntry {
                    path: job.entry_path(&file.name),
                    id: file.id,
                    size: file.size,
                    modified: file.modified,
                    hash: file.hash,
                });
                if visit == Visit::Stop {
                    return Ok(stop(summary, &mut queue));
                }
            }
        }

        Ok(summary)
    }

    async fn cached(&self, path: &str) -> Option<String> {
        self.slots
            .lock()
            .await
            .get(path)
            .and_then(|slot| slot.get().cloned())
    }

    async fn nearest_cached_ancestor(&self, segments: &[&str]) -> (usize, Anchor) {
        let slots = self.slots.lock().await;
        for len in (1..segments.len()).rev() {
            let prefix = segments[..len].join("/");
            if let Some(slot) = slots.get(&prefix)
                && let Some(id) = slot.get()
            {
                let anchor = Anchor {
                    id: id.clone(),
                    slot: Some(Arc::clone(slot)),
                    path: prefix,
                };
                return (len, anchor);
            }
        }
        let root = Anchor {
            path: String::new(),
            id: self.root_id.clone(),
            slot: None,
        };
        (0, root)
    }

    /// Resolves one segment below `parent`. `Ok(None)` means `parent` was
    /// invalidated meanwhile and the walk must start over.
    async fn resolve_segment(
        &self,
        prefix: &str,
        parent: &Anchor,
        leaf: &str,
        create: bool,
    ) -> Result<Option<Anchor>, DriverError> {
        let parent_id = parent.id.as_str();
        let slot = {
            let mut slots = self.slots.lock().await;
            if !is_current(&slots, parent) {
                return Ok(None);
            }
            Arc::clone(slots.entry(prefix.to_string()).or_default())
        };

        let result = slot
            .get_or_try_init(|| async {
                match self.ops.find_leaf(parent_id, leaf).await {
                    Ok(Some(id)) => Ok(id),
                    Ok(None) if create => {
                        debug!(path = prefix, parent_id, "creating missing directory");
                        self.ops.create_dir(parent_id, leaf).await
                    }
                    Ok(None) => Err(DriverError::DirectoryNotFound {
                        path: prefix.to_string(),
                    }),
                    Err(err) => Err(err),
                }
            })
            .await;

        match result {
            Ok(id) => Ok(Some(Anchor {
                path: prefix.to_string(),
                id: id.clone(),
                slot: Some(Arc::clone(&slot)),
            })),
            Err(err) => {
                self.discard_unresolved(prefix, &slot).await;
                Err(err.while_resolving(prefix))
            }
        }
    }

    /// Removes a slot whose lookup failed, unless another resolver is still waiting on it.
    async fn discard_unresolved(&self, prefix: &str, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        if let Some(current) = slots.get(prefix)
            && Arc::ptr_eq(current, slot)
            && !current.initialized()
            && Arc::strong_count(current) <= 2
        {
            slots.remove(prefix);
        }
    }

    /// Caches a directory seen in a listing, unless the cache was
    /// invalidated since that listing started.
    async fn remember(&self, path: &str, id: &str, generation: u64) {
        let mut slots = self.slots.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let slot = slots.entry(path.to_string()).or_default();
        if !slot.initialized() && Arc::strong_count(slot) == 1 {
            *slot = ready_slot(id);
        }
    }
}

fn is_current(slots: &HashMap<String, Slot>, anchor: &Anchor) -> bool {
    match &anchor.slot {
        None => true,
        Some(slot) => slots
            .get(&anchor.path)
            .is_some_and(|current| Arc::ptr_eq(current, slot)),
    }
}

fn ready_slot(id: &str) -> Slot {
    Arc::new(OnceCell::new_with(Some(id.to_string())))
}

fn stop(mut summary: ListSummary, queue: &mut JobQueue) -> ListSummary {
    let dropped = queue.clear();
    debug!(dropped, "listing stopped by sink");
    summary.stopped = true;
    summary
}

#[cfg(test)]
#[path = "dircache_tests.rs"]
mod tests;
