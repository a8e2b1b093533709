// rust/trainer-core/src/storage/mod.rs

//! Storage abstraction used by the checkpoint manager.
//!
//! Checkpoints and preemption snapshots only ever touch storage through the
//! [`StorageBackend`] trait, so a job can keep its snapshots on the local
//! filesystem or on any remote store that implements the same operations
//! (existence checks, directory listing, directory creation, and the
//! write-then-rename pair used for atomic saves).
//!
//! # Example
//!
//! ```no_run
//! use trainer_core::config::StorageConfig;
//! use trainer_core::storage::{LocalStorage, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let storage = LocalStorage::new(&StorageConfig::default()).unwrap();
//! storage.create_dir_all(Path::new("hpc")).unwrap();
//!
//! let mut writer = storage.open_write(Path::new("hpc/.hpc_ckpt_1.ckpt.tmp")).unwrap();
//! writer.write_all(b"snapshot").unwrap();
//! writer.finish().unwrap();
//! storage
//!     .rename(Path::new("hpc/.hpc_ckpt_1.ckpt.tmp"), Path::new("hpc/hpc_ckpt_1.ckpt"))
//!     .unwrap();
//!
//! assert_eq!(storage.list(Path::new("hpc")).unwrap(), vec!["hpc_ckpt_1.ckpt"]);
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
