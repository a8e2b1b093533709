// rust/trainer-core/src/storage/traits.rs

//! Storage traits shared by every backend.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time, if the backend tracks one.
    pub modified: Option<std::time::SystemTime>,
    /// Whether this object is a directory.
    pub is_dir: bool,
}

/// A handle for reading a stored object from start to end.
pub trait StorageReader: Read + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes and persists everything written so far.
    ///
    /// Must be called to complete the write; the handle is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be flushed or synced.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The operations checkpointing needs from a local or remote store.
///
/// Paths are relative to the backend root unless absolute. The trait is
/// object-safe and is normally held as `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object or directory exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieves metadata for an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or metadata cannot be read.
    fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    /// Opens an object for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any existing content.
    ///
    /// Parent directories are created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Deletes an object or directory tree.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists the entry names directly under `dir`, sorted.
    ///
    /// A missing directory lists as empty.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    /// Renames an object. On the local filesystem this is atomic when both
    /// paths live on the same volume.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Creates a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}
