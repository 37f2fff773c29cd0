use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

use crate::session::{Credentials, SessionInfo};

const DEFAULT_BASE_URL: &str = "https://dev.opendrive.com/api/v1";

#[derive(Debug, Error)]
pub enum OpenDriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct OpenDriveClient {
    http: Client,
    base_url: Url,
}

impl OpenDriveClient {
    pub fn new() -> Result<Self, OpenDriveError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, OpenDriveError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(OpenDriveError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SessionInfo, OpenDriveError> {
        let url = self.endpoint(&["session", "login.json"])?;
        let body = Credentials {
            username,
            passwd: password,
        };
        let response = self.http.post(url).json(&body).send().await?;
        Self::handle_response(response).await
    }

    pub async fn list_folder(
        &self,
        session_id: &str,
        folder_id: &str,
    ) -> Result<FolderList, OpenDriveError> {
        let url = self.endpoint(&["folder", "list.json", session_id, folder_id])?;
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(
        &self,
        session_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<FolderInfo, OpenDriveError> {
        let url = self.endpoint(&["folder.json"])?;
        let body = CreateFolderRequest {
            session_id,
            folder_name: name,
            folder_sub_parent: parent_id,
            folder_is_public: 0,
            folder_public_upl: 0,
            folder_public_display: 0,
            folder_public_dnl: 0,
        };
        let response = self.http.post(url).json(&body).send().await?;
        Self::handle_response(response).await
    }

    pub async fn remove_folder(
        &self,
        session_id: &str,
        folder_id: &str,
    ) -> Result<(), OpenDriveError> {
        let url = self.endpoint(&["folder", "remove.json"])?;
        let body = RemoveFolderRequest {
            session_id,
            folder_id,
        };
        let response = self.http.post(url).json(&body).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, OpenDriveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| OpenDriveError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, OpenDriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> OpenDriveError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        OpenDriveError::Api { status, body }
    }
}

impl OpenDriveError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            OpenDriveError::Api { status, .. } => Some(*status),
            OpenDriveError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            OpenDriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// True when the request never produced an HTTP response (connect, timeout, broken body).
    pub fn is_transport(&self) -> bool {
        match self {
            OpenDriveError::Request(err) => {
                err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
            }
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Serialize)]
struct CreateFolderRequest<'a> {
    session_id: &'a str,
    folder_name: &'a str,
    folder_sub_parent: &'a str,
    folder_is_public: u8,
    folder_public_upl: u8,
    folder_public_display: u8,
    folder_public_dnl: u8,
}

#[derive(Debug, Serialize)]
struct RemoveFolderRequest<'a> {
    session_id: &'a str,
    folder_id: &'a str,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FolderList {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "ParentFolderID", default)]
    pub parent_folder_id: Option<String>,
    #[serde(rename = "Folders", default)]
    pub folders: Vec<Folder>,
    #[serde(rename = "Files", default)]
    pub files: Vec<File>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Folder {
    #[serde(rename = "FolderID")]
    pub folder_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DateModified", default, deserialize_with = "lenient_i64")]
    pub date_modified: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    #[serde(rename = "FileId")]
    pub file_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size", default, deserialize_with = "lenient_i64")]
    pub size: i64,
    #[serde(rename = "DateModified", default, deserialize_with = "lenient_i64")]
    pub date_modified: i64,
    #[serde(rename = "FileHash", default)]
    pub file_hash: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FolderInfo {
    #[serde(rename = "FolderID")]
    pub folder_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DateModified", default, deserialize_with = "lenient_i64")]
    pub date_modified: i64,
}

// The API reports sizes and timestamps as numbers on some endpoints and as strings on others.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(value) => Ok(value),
        NumberOrText::Text(text) if text.trim().is_empty() => Ok(0),
        NumberOrText::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
