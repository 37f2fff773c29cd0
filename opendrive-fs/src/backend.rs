use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use opendrive_core::{File, Folder, FolderList, OpenDriveClient, OpenDriveError, SessionInfo};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::dircache::DirectoryOps;
use crate::dircache::listing::{RemoteDir, RemoteFile, RemoteListing};
use crate::error::DriverError;
use crate::pacer::{Attempt, Pacer, PacerError};

pub const DEFAULT_RETRY_STATUSES: [u16; 8] = [400, 401, 408, 429, 500, 502, 503, 504];

/// Whether a failed call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Maps client errors onto the pacer's retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_statuses(DEFAULT_RETRY_STATUSES)
    }
}

impl RetryPolicy {
    pub fn with_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }

    /// Policy for the login call: rejected credentials are final.
    pub fn login(&self) -> Self {
        let mut statuses = self.statuses.clone();
        for status in [400, 401, 403] {
            statuses.remove(&status);
        }
        Self { statuses }
    }

    pub fn statuses(&self) -> impl Iterator<Item = u16> + '_ {
        self.statuses.iter().copied()
    }

    pub fn classify(&self, err: &OpenDriveError) -> Classification {
        if err.is_transport() {
            return Classification::Retryable;
        }
        match err.status() {
            Some(status) if self.statuses.contains(&status.as_u16()) => Classification::Retryable,
            _ => Classification::Fatal,
        }
    }

    pub fn is_retryable(&self, err: &OpenDriveError) -> bool {
        self.classify(err) == Classification::Retryable
    }
}

/// [`DirectoryOps`] over the OpenDRIVE REST API, every call paced.
pub struct OpenDriveBackend {
    client: OpenDriveClient,
    session: SessionInfo,
    pacer: Arc<Pacer>,
    policy: RetryPolicy,
}

impl OpenDriveBackend {
    pub fn new(
        client: OpenDriveClient,
        session: SessionInfo,
        pacer: Arc<Pacer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            session,
            pacer,
            policy,
        }
    }

    /// Logs in through `pacer` and returns a backend bound to the new session.
    #[instrument(skip(client, password, pacer, policy))]
    pub async fn login(
        client: OpenDriveClient,
        username: &str,
        password: &str,
        pacer: Arc<Pacer>,
        policy: RetryPolicy,
    ) -> Result<Self, DriverError> {
        let login_policy = policy.login();
        let (http, login_policy) = (&client, &login_policy);
        let session = pacer
            .call(|| async move {
                let result = http.login(username, password).await;
                Attempt::from_result(result, |err| login_policy.is_retryable(err))
            })
            .await
            .map_err(|err| match err {
                PacerError::Fatal(err) if is_rejected_login(&err) => {
                    DriverError::PermissionDenied(err)
                }
                other => other.into(),
            })?;
        debug!(user = session.user_name.as_deref(), "logged in");
        Ok(Self::new(client, session, pacer, policy))
    }

    async fn folder_list(&self, dir_id: &str) -> Result<FolderList, DriverError> {
        let session_id = &self.session.session_id;
        let list = self
            .pacer
            .call(|| async move {
                let result = self.client.list_folder(session_id, dir_id).await;
                Attempt::from_result(result, |err| self.policy.is_retryable(err))
            })
            .await?;
        Ok(list)
    }

    /// Deletes the folder `dir_id` with everything below it.
    #[instrument(skip(self))]
    pub async fn remove_dir(&self, dir_id: &str) -> Result<(), DriverError> {
        let session_id = &self.session.session_id;
        self.pacer
            .call(|| async move {
                let result = self.client.remove_folder(session_id, dir_id).await;
                Attempt::from_result(result, |err| self.policy.is_retryable(err))
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryOps for OpenDriveBackend {
    #[instrument(skip(self))]
    async fn find_leaf(
        &self,
        parent_id: &str,
        leaf: &str,
    ) -> Result<Option<String>, DriverError> {
        let list = self.folder_list(parent_id).await?;
        let found = list
            .folders
            .into_iter()
            .find(|folder| folder.name == leaf)
            .map(|folder| folder.folder_id);
        debug!(found = found.as_deref(), "find_leaf");
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn create_dir(&self, parent_id: &str, leaf: &str) -> Result<String, DriverError> {
        let session_id = &self.session.session_id;
        let info = self
            .pacer
            .call(|| async move {
                let result = self.client.create_folder(session_id, parent_id, leaf).await;
                Attempt::from_result(result, |err| self.policy.is_retryable(err))
            })
            .await?;
        debug!(id = %info.folder_id, "created folder");
        Ok(info.folder_id)
    }

    #[instrument(skip(self))]
    async fn list_children(&self, dir_id: &str) -> Result<RemoteListing, DriverError> {
        let list = self.folder_list(dir_id).await?;
        Ok(RemoteListing {
            dirs: list.folders.into_iter().map(remote_dir).collect(),
            files: list.files.into_iter().map(remote_file).collect(),
        })
    }
}

fn is_rejected_login(err: &OpenDriveError) -> bool {
    matches!(err.status().map(|status| status.as_u16()), Some(400 | 401 | 403))
}

fn remote_dir(folder: Folder) -> RemoteDir {
    RemoteDir {
        modified: unix_time(folder.date_modified),
        name: folder.name,
        id: folder.folder_id,
    }
}

fn remote_file(file: File) -> RemoteFile {
    RemoteFile {
        modified: unix_time(file.date_modified),
        hash: file.file_hash.filter(|hash| !hash.is_empty()),
        name: file.name,
        id: file.file_id,
        size: file.size,
    }
}

fn unix_time(seconds: i64) -> Option<OffsetDateTime> {
    if seconds <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendrive_core::StatusCode;

    fn api_error(status: u16) -> OpenDriveError {
        OpenDriveError::Api {
            status: StatusCode::from_u16(status).unwrap(),
            body: String::new(),
        }
    }

    #[test]
    fn default_policy_retries_the_canonical_statuses() {
        let policy = RetryPolicy::default();
        for status in DEFAULT_RETRY_STATUSES {
            assert_eq!(policy.classify(&api_error(status)), Classification::Retryable);
        }
        for status in [403, 404, 409, 501] {
            assert_eq!(policy.classify(&api_error(status)), Classification::Fatal);
        }
    }

    #[test]
    fn login_policy_treats_rejected_credentials_as_fatal() {
        let policy = RetryPolicy::default().login();
        assert!(!policy.is_retryable(&api_error(400)));
        assert!(!policy.is_retryable(&api_error(401)));
        assert!(policy.is_retryable(&api_error(429)));
        assert!(policy.is_retryable(&api_error(503)));
    }

    #[test]
    fn custom_statuses_replace_the_defaults() {
        let policy = RetryPolicy::with_statuses([418]);
        assert!(policy.is_retryable(&api_error(418)));
        assert!(!policy.is_retryable(&api_error(503)));
        assert_eq!(policy.statuses().collect::<Vec<_>>(), [418]);
    }

    #[test]
    fn decode_errors_are_fatal() {
        let err = OpenDriveError::InvalidBaseUrl("mailto:x".into());
        assert_eq!(RetryPolicy::default().classify(&err), Classification::Fatal);
    }

    #[test]
    fn listing_models_convert_timestamps_and_blank_hashes() {
        let file = remote_file(File {
            file_id: "f1".into(),
            name: "a.txt".into(),
            size: 12,
            date_modified: 1_700_000_000,
            file_hash: Some(String::new()),
        });
        assert_eq!(file.modified.unwrap().unix_timestamp(), 1_700_000_000);
        assert_eq!(file.hash, None);

        let dir = remote_dir(Folder {
            folder_id: "d1".into(),
            name: "docs".into(),
            date_modified: 0,
        });
        assert_eq!(dir.modified, None);
        assert_eq!(dir.id, "d1");
    }
}
