// rust/trainer-core/src/lib.rs

//! Trainer Core
//!
//! Early stopping and full-state checkpointing for training loops,
//! including snapshots taken on cluster preemption and the automatic
//! resume that follows a requeue.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{CheckpointConfig, StoppingConfig, TrainerConfig};
pub use error::{Result, TrainerError};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageReader, StorageWriter};

pub mod checkpoint;
pub use checkpoint::{
    CheckpointManager, CheckpointRecord, PersistOutcome, RestoreSource, ResumeSummary, StateDict,
    StateValue,
};

pub mod distributed;
pub use distributed::{LocalGroup, ProcessGroup, SingleProcess};

pub mod metrics;
pub use metrics::{MetricValue, Metrics};

pub mod stopping;
pub use stopping::{StopDecision, StoppingMonitor};

pub mod trainer;
pub use trainer::{
    Callback, DataModule, DevicePlacement, MetricsLogger, Model, Precision, Stateful,
    TrainerState, TrainingContext,
};
