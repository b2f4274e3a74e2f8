//! Engine for mounting an S3-compatible object store as a POSIX filesystem
//! through FUSE: request executor, worker-pool dispatcher, object metadata
//! cache, open-file table, and the filesystem facade that ties them
//! together.

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod handles;
pub mod hook;
pub mod hooks;
pub mod inode;
pub mod pool;
pub mod stats;

pub use cache::{Hint, ObjectCache, ObjectDescriptor, ObjectKind};
pub use config::Config;
pub use error::{FsError, FsResult};
pub use filesystem::S3Fs;
pub use handles::OpenFileTable;
pub use hook::Hook;
pub use inode::{InodeTable, ROOT_INODE};
pub use pool::Dispatcher;
