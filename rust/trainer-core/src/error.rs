// rust/trainer-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The checkpoint was written with a layout this version no longer reads.
    #[error("Incompatible checkpoint schema: {message}")]
    Schema {
        message: String,
    },

    /// A full-state restore was attempted from a record that lacks training state.
    #[error("Incomplete training state: {message}")]
    PartialState {
        message: String,
    },

    #[error("Checkpoint holds {saved} {what} state(s) but the trainer has {live}")]
    CountMismatch {
        what: &'static str,
        saved: usize,
        live: usize,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Collective '{operation}' failed on rank {rank}: {message}")]
    Collective {
        operation: String,
        rank: usize,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, TrainerError>;

// Convenience constructors
impl TrainerError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn partial_state(message: impl Into<String>) -> Self {
        Self::PartialState {
            message: message.into(),
        }
    }

    pub fn count_mismatch(what: &'static str, saved: usize, live: usize) -> Self {
        Self::CountMismatch { what, saved, live }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn collective(operation: impl Into<String>, rank: usize, message: impl Into<String>) -> Self {
        Self::Collective {
            operation: operation.into(),
            rank,
            message: message.into(),
        }
    }
}
