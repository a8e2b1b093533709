// rust/trainer-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Checkpoints are read with buffered I/O, or memory-mapped once they exceed
//! the configured threshold so that multi-gigabyte model states are not
//! copied through an intermediate buffer.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{Result, TrainerError};

/// Local filesystem storage backend.
pub struct LocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
    use_mmap: bool,
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` rooted at `config.base_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                TrainerError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    TrainerError::storage_with_source(parent, "failed to create parent directories", e)
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).map_err(|e| {
            TrainerError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        Ok(ObjectMeta {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| TrainerError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                TrainerError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the map lives as long
            // as the reader that owns it.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                TrainerError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;
            Ok(Box::new(MmapReader { mmap, position: 0 }))
        } else {
            Ok(Box::new(LocalReader {
                reader: BufReader::with_capacity(self.buffer_size, file),
                size,
            }))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                TrainerError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter {
            writer: BufWriter::with_capacity(self.buffer_size, file),
            path: full_path,
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        let outcome = if full_path.is_dir() {
            fs::remove_dir_all(&full_path)
        } else {
            fs::remove_file(&full_path)
        };
        outcome.map_err(|e| TrainerError::storage_with_source(&full_path, "failed to delete", e))
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(dir);

        if !full_path.exists() {
            return Ok(Vec::new());
        }
        if !full_path.is_dir() {
            return Err(TrainerError::storage(&full_path, "path is not a directory"));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&full_path).map_err(|e| {
            TrainerError::storage_with_source(&full_path, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                TrainerError::storage_with_source(&full_path, "failed to read directory entry", e)
            })?;
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            TrainerError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).map_err(|e| {
            TrainerError::storage_with_source(&full_path, "failed to create directories", e)
        })
    }
}

struct LocalReader {
    reader: BufReader<File>,
    size: u64,
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }
}

struct MmapReader {
    mmap: Mmap,
    position: usize,
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.mmap[self.position.min(self.mmap.len())..];
        let to_read = buf.len().min(remaining.len());
        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.position += to_read;
        Ok(to_read)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| TrainerError::storage_with_source(&self.path, "failed to flush writer", e))?;

        self.writer.get_ref().sync_all().map_err(|e| {
            TrainerError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024,
        };
        let storage = LocalStorage::new(&config).unwrap();
        (storage, temp_dir)
    }

    fn write_file(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    fn read_file(storage: &LocalStorage, path: &str) -> Vec<u8> {
        let mut reader = storage.open_read(Path::new(path)).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("weights");

        let config = StorageConfig {
            base_path: new_base.clone(),
            ..Default::default()
        };

        let storage = LocalStorage::new(&config).unwrap();
        assert!(new_base.exists());
        storage.create_dir_all(Path::new("hpc")).unwrap();
        assert!(new_base.join("hpc").is_dir());
    }

    #[test]
    fn test_exists_after_create_dir_all() {
        let (storage, _temp) = create_test_storage();

        assert!(!storage.exists(Path::new("hpc/run")).unwrap());
        storage.create_dir_all(Path::new("hpc/run")).unwrap();
        storage.create_dir_all(Path::new("hpc/run")).unwrap();

        assert!(storage.exists(Path::new("hpc/run")).unwrap());
        assert!(storage.metadata(Path::new("hpc/run")).unwrap().is_dir);
    }

    #[test]
    fn test_buffered_roundtrip() {
        let (storage, _temp) = create_test_storage();

        write_file(&storage, "ckpt/small.ckpt", b"optimizer state");

        assert_eq!(read_file(&storage, "ckpt/small.ckpt"), b"optimizer state");
        let meta = storage.metadata(Path::new("ckpt/small.ckpt")).unwrap();
        assert_eq!(meta.size, 15);
        assert!(!meta.is_dir);
    }

    #[test]
    fn test_mmap_roundtrip() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

        write_file(&storage, "large.ckpt", &data);

        let reader = storage.open_read(Path::new("large.ckpt")).unwrap();
        assert_eq!(reader.size(), 4096);
        assert_eq!(read_file(&storage, "large.ckpt"), data);
    }

    #[test]
    fn test_mmap_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: false,
            mmap_threshold: 1024,
        };
        let storage = LocalStorage::new(&config).unwrap();
        let data = vec![7u8; 2048];

        write_file(&storage, "large.ckpt", &data);

        assert_eq!(read_file(&storage, "large.ckpt"), data);
    }

    #[test]
    fn test_open_read_missing_file() {
        let (storage, _temp) = create_test_storage();

        assert!(storage.open_read(Path::new("missing.ckpt")).is_err());
        assert!(storage.metadata(Path::new("missing.ckpt")).is_err());
    }

    #[test]
    fn test_list_sorted_and_missing_dir() {
        let (storage, _temp) = create_test_storage();

        for name in ["hpc_ckpt_10.ckpt", "hpc_ckpt_3.ckpt", "notes.txt"] {
            write_file(&storage, &format!("hpc/{name}"), b"x");
        }

        let entries = storage.list(Path::new("hpc")).unwrap();
        assert_eq!(entries, vec!["hpc_ckpt_10.ckpt", "hpc_ckpt_3.ckpt", "notes.txt"]);
        assert!(storage.list(Path::new("nowhere")).unwrap().is_empty());
    }

    #[test]
    fn test_list_file_not_dir() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "file.ckpt", b"data");

        assert!(storage.list(Path::new("file.ckpt")).is_err());
    }

    #[test]
    fn test_rename_replaces_destination() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "final.ckpt", b"old");
        write_file(&storage, ".final.ckpt.tmp", b"new");

        storage
            .rename(Path::new(".final.ckpt.tmp"), Path::new("final.ckpt"))
            .unwrap();

        assert!(!storage.exists(Path::new(".final.ckpt.tmp")).unwrap());
        assert_eq!(read_file(&storage, "final.ckpt"), b"new");
    }

    #[test]
    fn test_rename_not_found() {
        let (storage, _temp) = create_test_storage();

        let result = storage.rename(Path::new("missing.tmp"), Path::new("final.ckpt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_delete_file_and_directory() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "dir/a.ckpt", b"a");
        write_file(&storage, "b.ckpt", b"b");

        storage.delete(Path::new("b.ckpt")).unwrap();
        storage.delete(Path::new("dir")).unwrap();

        assert!(!storage.exists(Path::new("b.ckpt")).unwrap());
        assert!(!storage.exists(Path::new("dir")).unwrap());
        assert!(storage.delete(Path::new("b.ckpt")).is_err());
    }

    #[test]
    fn test_object_safety() {
        let (storage, _temp) = create_test_storage();
        let backend: Box<dyn StorageBackend> = Box::new(storage);

        let mut writer = backend.open_write(Path::new("trait.ckpt")).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        assert!(backend.exists(Path::new("trait.ckpt")).unwrap());
    }
}
