// rust/trainer-core/src/checkpoint/record.rs

//! The logical content of one persisted training snapshot.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

/// Version tag written into every record.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Named state entries, as produced by `state_dict()` on optimizers,
/// schedulers, scalers, models and callbacks.
///
/// A `BTreeMap` so that encoding is deterministic.
pub type StateDict = BTreeMap<String, StateValue>;

/// A dense tensor in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// One value inside a [`StateDict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Tensor(Tensor),
    List(Vec<StateValue>),
    Map(StateDict),
    /// A live object that only exists in process memory (an open handle, a
    /// closure, a device stream). It can be captured but never encoded;
    /// encoding a record that contains one fails with a serialization error.
    #[serde(skip)]
    Opaque(String),
}

impl StateValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Floats, and integers widened to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            StateValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Mixed-precision scaler implementations. Their serialized shapes differ,
/// so the state is tagged and only restored into the same backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmpBackend {
    /// The framework's built-in gradient scaler.
    Native,
    /// An externally provided mixed-precision library.
    ThirdParty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub backend: AmpBackend,
    pub state: StateDict,
}

/// Model hyperparameters plus what is needed to rebuild their container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    /// Name of the container type the values were held in.
    pub type_tag: String,
    /// Attribute name the model stores them under, if not the default.
    pub name: Option<String>,
    pub values: StateDict,
}

/// One persisted training snapshot.
///
/// Built fresh by every capture and never modified afterwards; a restore
/// consumes it completely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Version of the crate that wrote the record.
    pub version: String,
    /// Next epoch to run.
    pub epoch: u64,
    /// Global step to resume from.
    pub global_step: u64,
    pub model_state: StateDict,
    /// One entry per optimizer, in the trainer's optimizer order.
    /// `None` for weights-only checkpoints.
    pub optimizer_states: Option<Vec<StateDict>>,
    /// One entry per scheduler, in the trainer's scheduler order.
    /// `None` for weights-only checkpoints.
    pub scheduler_states: Option<Vec<StateDict>>,
    pub scaler: Option<ScalerState>,
    /// Callback states keyed by `Callback::state_key`.
    pub callbacks: Option<BTreeMap<String, StateDict>>,
    pub hparams: Option<HyperParams>,
    /// Additional top-level entries added by model and datamodule hooks.
    pub extras: StateDict,
}

/// An optional part of a record that can be left out when it fails to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DroppableField {
    HyperParams,
    Callback(String),
    Extra(String),
}

impl fmt::Display for DroppableField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DroppableField::HyperParams => write!(f, "hparams"),
            DroppableField::Callback(key) => write!(f, "callbacks.{key}"),
            DroppableField::Extra(key) => write!(f, "extras.{key}"),
        }
    }
}

impl CheckpointRecord {
    /// A record carrying only model weights.
    pub fn weights_only(epoch: u64, global_step: u64, model_state: StateDict) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            epoch,
            global_step,
            model_state,
            optimizer_states: None,
            scheduler_states: None,
            scaler: None,
            callbacks: None,
            hparams: None,
            extras: StateDict::new(),
        }
    }

    /// True when neither optimizer nor scheduler state was captured.
    pub fn is_weights_only(&self) -> bool {
        self.optimizer_states.is_none() && self.scheduler_states.is_none()
    }

    /// Encodes the record with bincode.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if any value cannot be encoded, e.g. a
    /// [`StateValue::Opaque`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| TrainerError::serialization(format!("failed to encode checkpoint record: {e}")))
    }

    /// Decodes a record previously produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            TrainerError::checkpoint_with_source("failed to decode checkpoint record", e)
        })
    }

    /// Lists the optional fields that cannot be encoded on their own.
    pub fn unencodable_fields(&self) -> Vec<DroppableField> {
        let mut fields = Vec::new();

        if let Some(hparams) = &self.hparams {
            if bincode::serialized_size(hparams).is_err() {
                fields.push(DroppableField::HyperParams);
            }
        }
        if let Some(callbacks) = &self.callbacks {
            for (key, state) in callbacks {
                if bincode::serialized_size(state).is_err() {
                    fields.push(DroppableField::Callback(key.clone()));
                }
            }
        }
        for (key, value) in &self.extras {
            if bincode::serialized_size(value).is_err() {
                fields.push(DroppableField::Extra(key.clone()));
            }
        }

        fields
    }

    /// Returns a copy of the record without the given optional fields.
    pub fn without(&self, fields: &[DroppableField]) -> Self {
        let mut record = self.clone();
        for field in fields {
            match field {
                DroppableField::HyperParams => record.hparams = None,
                DroppableField::Callback(key) => {
                    if let Some(callbacks) = record.callbacks.as_mut() {
                        callbacks.remove(key);
                    }
                }
                DroppableField::Extra(key) => {
                    record.extras.remove(key);
                }
            }
        }
        record
    }
}
