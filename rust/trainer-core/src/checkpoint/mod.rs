// rust/trainer-core/src/checkpoint/mod.rs

//! Checkpoint system for saving and restoring complete training state.
//!
//! This module provides functionality for:
//! - Capturing a [`CheckpointRecord`] from a running trainer
//! - Writing records atomically with compression (none, lz4, zstd)
//! - Integrity verification via XXHash64 checksums
//! - Restoring weights, optimizers, schedulers, scalers and callback state
//! - Preemption snapshots discovered by file name on requeue
//! - Migrating records written with the legacy callback keys
//!
//! # Example
//!
//! ```no_run
//! use trainer_core::checkpoint::CheckpointManager;
//! use trainer_core::config::TrainerConfig;
//! use std::path::Path;
//!
//! let config = TrainerConfig::from_file("trainer.toml").unwrap();
//! let manager = CheckpointManager::from_config(&config).unwrap();
//!
//! let record = manager.load(Path::new("hpc/hpc_ckpt_3.ckpt")).unwrap();
//! println!("resumes at epoch {}", record.epoch);
//! ```

pub mod format;
pub mod manager;
pub mod naming;
pub mod reader;
pub mod record;
pub mod upgrade;
pub mod writer;

pub use format::{CheckpointHeader, Compression};
pub use manager::{CheckpointManager, PersistOutcome, RestoreSource, ResumeSummary};
pub use naming::SnapshotNaming;
pub use reader::CheckpointReader;
pub use record::{
    AmpBackend, CheckpointRecord, DroppableField, HyperParams, ScalerState, StateDict, StateValue,
    Tensor, SCHEMA_VERSION,
};
pub use writer::CheckpointWriter;
