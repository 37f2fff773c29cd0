use std::sync::Arc;

use opendrive_core::OpenDriveClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::OpenDriveBackend;
use crate::config::DriverConfig;
use crate::dircache::listing::{DirEntry, Entry, EntryCollector, FileEntry, ListSink, ListSummary};
use crate::dircache::{DirCache, DirectoryOps, paths};
use crate::error::DriverError;
use crate::pacer::Pacer;

/// Id of the account's top-level folder.
pub const ROOT_ID: &str = "0";

/// Directory-level operations on an OpenDRIVE account, relative to a
/// configured root folder.
pub struct OpenDriveFs {
    backend: Arc<OpenDriveBackend>,
    cache: DirCache<OpenDriveBackend>,
    max_depth: Option<u32>,
}

impl OpenDriveFs {
    pub async fn connect(config: &DriverConfig, password: &str) -> Result<Self, DriverError> {
        Self::connect_with_cancellation(config, password, CancellationToken::new()).await
    }

    /// Like [`connect`](Self::connect), with every retry loop bounded by `cancel`.
    pub async fn connect_with_cancellation(
        config: &DriverConfig,
        password: &str,
        cancel: CancellationToken,
    ) -> Result<Self, DriverError> {
        let client = match config.endpoint.as_deref() {
            Some(url) => OpenDriveClient::with_base_url(url),
            None => OpenDriveClient::new(),
        }
        .map_err(DriverError::Remote)?;
        let pacer = Arc::new(Pacer::new(config.pacer).with_cancellation(cancel));
        let backend = OpenDriveBackend::login(
            client,
            &config.username,
            password,
            pacer,
            config.retry_policy.clone(),
        )
        .await?;
        info!(user = %config.username, root = %config.root, "connected to OpenDRIVE");
        Self::with_backend(Arc::new(backend), &config.root, config.create_root, config.max_depth)
            .await
    }

    /// Builds the facade over an already logged-in backend, resolving `root`
    /// from the account's top-level folder.
    pub async fn with_backend(
        backend: Arc<OpenDriveBackend>,
        root: &str,
        create_root: bool,
        max_depth: Option<u32>,
    ) -> Result<Self, DriverError> {
        let bootstrap = DirCache::new(Arc::clone(&backend), ROOT_ID);
        let root_id = bootstrap.resolve(root, create_root).await?;
        debug!(root, root_id = %root_id, "remote root resolved");
        Ok(Self {
            cache: DirCache::new(Arc::clone(&backend), root_id),
            backend,
            max_depth,
        })
    }

    pub fn cache(&self) -> &DirCache<OpenDriveBackend> {
        &self.cache
    }

    /// Depth used by [`list_recursive`](Self::list_recursive) callers that do not pick one.
    pub fn max_depth(&self) -> Option<u32> {
        self.max_depth
    }

    /// Immediate children of `dir`.
    pub async fn list(&self, dir: &str) -> Result<Vec<Entry>, DriverError> {
        let mut collector = EntryCollector::new();
        self.cache
            .enumerate_recursive(dir, Some(0), &mut collector)
            .await?;
        if let Some((_, err)) = collector.errors.into_iter().next() {
            return Err(err);
        }
        Ok(collector.entries)
    }

    pub async fn list_recursive<S>(
        &self,
        dir: &str,
        max_depth: Option<u32>,
        sink: &mut S,
    ) -> Result<ListSummary, DriverError>
    where
        S: ListSink + ?Sized,
    {
        self.cache.enumerate_recursive(dir, max_depth, sink).await
    }

    /// Creates `dir` and any missing parents, returning its id.
    pub async fn mkdir(&self, dir: &str) -> Result<String, DriverError> {
        self.cache.resolve(dir, true).await
    }

    /// Removes the empty directory `dir`.
    pub async fn rmdir(&self, dir: &str) -> Result<(), DriverError> {
        let dir = paths::normalize(dir)?;
        if dir.is_empty() {
            return Err(DriverError::RemoveRoot);
        }
        let id = self.cache.resolve(&dir, false).await?;
        let listing = self.backend.list_children(&id).await?;
        if !listing.dirs.is_empty() || !listing.files.is_empty() {
            return Err(DriverError::DirectoryNotEmpty { path: dir });
        }
        self.backend.remove_dir(&id).await?;
        self.cache.invalidate(&dir).await?;
        info!(path = %dir, "directory removed");
        Ok(())
    }

    /// Looks up a single file or directory by path.
    pub async fn stat(&self, path: &str) -> Result<Entry, DriverError> {
        let path = paths::normalize(path)?;
        let Some((parent, leaf)) = paths::split_leaf(&path) else {
            return Ok(Entry::Dir(DirEntry {
                path,
                id: self.cache.root_id().to_string(),
                modified: None,
            }));
        };
        let parent_id = self.cache.resolve(parent, false).await?;
        let listing = self.backend.list_children(&parent_id).await?;

        if let Some(dir) = listing.dirs.into_iter().find(|dir| dir.name == leaf) {
            self.cache.put(&path, &dir.id).await?;
            return Ok(Entry::Dir(DirEntry {
                path,
                id: dir.id,
                modified: dir.modified,
            }));
        }
        match listing.files.into_iter().find(|file| file.name == leaf) {
            Some(file) => Ok(Entry::File(FileEntry {
                path,
                id: file.id,
                size: file.size,
                modified: file.modified,
                hash: file.hash,
            })),
            None => Err(DriverError::ObjectNotFound { path }),
        }
    }
}
