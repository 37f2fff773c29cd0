mod client;
mod session;

pub use client::{
    ApiErrorClass, File, Folder, FolderInfo, FolderList, OpenDriveClient, OpenDriveError,
};
pub use reqwest::StatusCode;
pub use session::SessionInfo;
