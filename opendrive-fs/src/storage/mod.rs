mod password_storage;

pub use password_storage::{PasswordStorage, StorageError};
