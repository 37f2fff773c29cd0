use opendrive_core::{ApiErrorClass, OpenDriveError};
use thiserror::Error;

use crate::dircache::paths::PathError;
use crate::pacer::PacerError;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("directory not found: {path}")]
    DirectoryNotFound { path: String },
    #[error("object not found: {path}")]
    ObjectNotFound { path: String },
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },
    #[error("refusing to remove the root directory")]
    RemoveRoot,
    #[error("access denied: {0}")]
    PermissionDenied(#[source] OpenDriveError),
    #[error("service unavailable after {retries} retries")]
    Unavailable {
        retries: u32,
        #[source]
        last_error: Option<OpenDriveError>,
    },
    #[error("remote call failed: {0}")]
    Remote(#[source] OpenDriveError),
    #[error("failed to resolve {path}: {source}")]
    Resolve {
        path: String,
        #[source]
        source: Box<DriverError>,
    },
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
}

/// Coarse error kinds callers branch on: treat as absent, re-authenticate, or retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Unavailable,
    Other,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::DirectoryNotFound { .. } | DriverError::ObjectNotFound { .. } => {
                ErrorKind::NotFound
            }
            DriverError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            DriverError::Unavailable { .. } => ErrorKind::Unavailable,
            DriverError::Remote(err) => match err.classification() {
                Some(ApiErrorClass::NotFound) => ErrorKind::NotFound,
                Some(ApiErrorClass::Auth) => ErrorKind::PermissionDenied,
                _ => ErrorKind::Other,
            },
            DriverError::Resolve { source, .. } => source.kind(),
            DriverError::DirectoryNotEmpty { .. }
            | DriverError::RemoveRoot
            | DriverError::Path(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Annotates a failure with the path being resolved; not-found errors already carry one.
    pub(crate) fn while_resolving(self, path: &str) -> Self {
        match self {
            DriverError::DirectoryNotFound { .. }
            | DriverError::ObjectNotFound { .. }
            | DriverError::Resolve { .. } => self,
            other => DriverError::Resolve {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<PacerError<OpenDriveError>> for DriverError {
    fn from(err: PacerError<OpenDriveError>) -> Self {
        match err {
            PacerError::Fatal(err) if err.classification() == Some(ApiErrorClass::Auth) => {
                DriverError::PermissionDenied(err)
            }
            PacerError::Fatal(err) => DriverError::Remote(err),
            PacerError::NotRetried(err) => DriverError::Unavailable {
                retries: 0,
                last_error: Some(err),
            },
            PacerError::Cancelled {
                retries,
                last_error,
            } => DriverError::Unavailable {
                retries,
                last_error,
            },
        }
    }
}
