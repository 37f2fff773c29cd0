use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "com.opendrive.fs";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("no saved password for {0}")]
    PasswordNotFound(String),
}

/// Account password kept in the system keyring, one entry per username.
pub struct PasswordStorage {
    username: String,
    entry: Entry,
}

impl PasswordStorage {
    pub fn new(username: &str) -> Result<Self, StorageError> {
        Ok(Self {
            username: username.to_string(),
            entry: Entry::new(SERVICE_NAME, username)?,
        })
    }

    pub fn save_password(&self, password: &str) -> Result<(), StorageError> {
        self.entry.set_password(password)?;
        Ok(())
    }

    pub fn get_password(&self) -> Result<String, StorageError> {
        match self.entry.get_password() {
            Ok(password) => Ok(password),
            Err(keyring::Error::NoEntry) => {
                Err(StorageError::PasswordNotFound(self.username.clone()))
            }
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }

    /// Removes the saved password; a missing entry is not an error.
    pub fn delete_password(&self) -> Result<(), StorageError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }
}
