pub mod backend;
pub mod config;
pub mod dircache;
pub mod error;
pub mod fs;
pub mod logging;
pub mod pacer;
pub mod storage;

pub use backend::{Classification, OpenDriveBackend, RetryPolicy};
pub use config::DriverConfig;
pub use dircache::DirCache;
pub use error::{DriverError, ErrorKind};
pub use fs::OpenDriveFs;
pub use pacer::{Pacer, PacerConfig};
