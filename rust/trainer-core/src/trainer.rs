// rust/trainer-core/src/trainer.rs

//! The parts of a training loop that checkpointing and early stopping
//! interact with.
//!
//! The loop itself lives outside this crate. It owns a [`TrainingContext`]
//! and calls the `run_*` dispatch methods at the corresponding points of
//! each epoch; everything else is reached through the collaborator traits
//! below.

use std::fmt;
use std::sync::Arc;

use crate::checkpoint::{AmpBackend, CheckpointRecord, HyperParams, StateDict};
use crate::distributed::{ProcessGroup, SingleProcess};
use crate::error::Result;
use crate::metrics::Metrics;

/// Default upper bound on epochs when the loop doesn't set one.
pub const DEFAULT_MAX_EPOCHS: u64 = 1000;

/// Anything whose state can be exported and re-imported: optimizers,
/// learning-rate schedulers, gradient scalers.
pub trait Stateful {
    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

/// The model being trained.
///
/// Every hook has a no-op default so plain models only implement the
/// weight accessors.
pub trait Model: Stateful {
    /// Hyperparameters to persist alongside the weights.
    fn hparams(&self) -> Option<HyperParams> {
        None
    }

    /// Adds model-specific top-level entries to a checkpoint being captured.
    fn on_save_checkpoint(&self, _extras: &mut StateDict) {}

    /// Called after the weights have been loaded from `record`.
    fn on_load_checkpoint(&mut self, _record: &CheckpointRecord) -> Result<()> {
        Ok(())
    }

    /// Called with a preemption snapshot right before it is written.
    fn on_preemption_save(&self, _record: &CheckpointRecord) {}

    /// Called after a preemption snapshot has been fully restored.
    fn on_preemption_load(&mut self, _record: &CheckpointRecord) -> Result<()> {
        Ok(())
    }

    /// Moves parameters to the given device.
    fn move_to(&mut self, _placement: &DevicePlacement) -> Result<()> {
        Ok(())
    }
}

/// Data-loading component that may keep its own resumable state.
pub trait DataModule {
    fn on_save_checkpoint(&self, _extras: &mut StateDict) {}

    fn on_load_checkpoint(&mut self, _record: &CheckpointRecord) -> Result<()> {
        Ok(())
    }
}

/// An observer of the training loop.
///
/// Callbacks that carry state across restarts return it from
/// [`on_save_checkpoint`](Callback::on_save_checkpoint); the state is
/// stored under [`state_key`](Callback::state_key) and handed back to the
/// callback with the same key on restore.
pub trait Callback {
    /// Key identifying this callback's state inside a checkpoint. Must be
    /// unique among the callbacks of one trainer.
    fn state_key(&self) -> String;

    fn on_save_checkpoint(&self) -> Option<StateDict> {
        None
    }

    fn on_load_checkpoint(&mut self, _state: &StateDict) -> Result<()> {
        Ok(())
    }

    fn on_validation_epoch_end(&mut self, _trainer: &mut TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_validation_end(&mut self, _trainer: &mut TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_train_epoch_end(&mut self, _trainer: &mut TrainerState) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _trainer: &mut TrainerState) -> Result<()> {
        Ok(())
    }
}

/// Sink for logged metrics. Flushed before a preemption snapshot so that
/// nothing logged before the job was killed is lost.
pub trait MetricsLogger {
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Tpu,
}

/// Where the model's parameters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePlacement {
    pub kind: DeviceKind,
    pub index: Option<usize>,
}

impl DevicePlacement {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            index: None,
        }
    }

    pub fn gpu(index: usize) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            index: Some(index),
        }
    }

    pub fn tpu(index: usize) -> Self {
        Self {
            kind: DeviceKind::Tpu,
            index: Some(index),
        }
    }

    /// True for devices with a memory cache worth clearing.
    pub fn is_accelerated(&self) -> bool {
        self.kind != DeviceKind::Cpu
    }
}

impl Default for DevicePlacement {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for DevicePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Tpu => "tpu",
        };
        match self.index {
            Some(index) => write!(f, "{kind}:{index}"),
            None => write!(f, "{kind}"),
        }
    }
}

/// Mixed-precision setup: which scaler backend is active, if any, and a
/// handle to its state.
#[derive(Default)]
pub struct Precision {
    pub backend: Option<AmpBackend>,
    pub scaler: Option<Box<dyn Stateful>>,
}

impl Precision {
    pub fn new(backend: AmpBackend, scaler: Box<dyn Stateful>) -> Self {
        Self {
            backend: Some(backend),
            scaler: Some(scaler),
        }
    }
}

/// Loop counters and flags shared with callbacks.
pub struct TrainerState {
    /// Zero-based epoch currently running.
    pub current_epoch: u64,
    /// Optimizer steps taken so far.
    pub global_step: u64,
    pub max_epochs: u64,
    /// Batches per training epoch.
    pub num_training_batches: u64,
    pub accumulate_grad_batches: u64,
    /// Metrics logged during the most recent evaluation.
    pub metrics: Metrics,
    /// Advisory flag asking the loop to end after the current epoch.
    pub should_stop: bool,
    /// True while the pre-training validation sanity pass runs.
    pub running_sanity_check: bool,
    pub process_group: Arc<dyn ProcessGroup>,
}

impl TrainerState {
    pub fn new(process_group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            current_epoch: 0,
            global_step: 0,
            max_epochs: DEFAULT_MAX_EPOCHS,
            num_training_batches: 0,
            accumulate_grad_batches: 1,
            metrics: Metrics::new(),
            should_stop: false,
            running_sanity_check: false,
            process_group,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.process_group.is_primary()
    }
}

impl Default for TrainerState {
    fn default() -> Self {
        Self::new(Arc::new(SingleProcess))
    }
}

/// Everything one rank's training loop owns.
///
/// Callbacks are kept apart from [`TrainerState`] so that a callback can
/// be borrowed mutably together with the state it updates.
pub struct TrainingContext {
    pub state: TrainerState,
    pub model: Box<dyn Model>,
    pub datamodule: Option<Box<dyn DataModule>>,
    /// In the order the loop steps them; checkpoints pair by position.
    pub optimizers: Vec<Box<dyn Stateful>>,
    pub schedulers: Vec<Box<dyn Stateful>>,
    pub precision: Precision,
    pub callbacks: Vec<Box<dyn Callback>>,
    pub logger: Option<Box<dyn MetricsLogger>>,
    pub placement: DevicePlacement,
}

impl TrainingContext {
    pub fn new(model: Box<dyn Model>, state: TrainerState) -> Self {
        Self {
            state,
            model,
            datamodule: None,
            optimizers: Vec::new(),
            schedulers: Vec::new(),
            precision: Precision::default(),
            callbacks: Vec::new(),
            logger: None,
            placement: DevicePlacement::default(),
        }
    }

    pub fn run_validation_epoch_end(&mut self) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.on_validation_epoch_end(&mut self.state)?;
        }
        Ok(())
    }

    pub fn run_validation_end(&mut self) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.on_validation_end(&mut self.state)?;
        }
        Ok(())
    }

    pub fn run_train_epoch_end(&mut self) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.on_train_epoch_end(&mut self.state)?;
        }
        Ok(())
    }

    pub fn run_train_end(&mut self) -> Result<()> {
        for callback in self.callbacks.iter_mut() {
            callback.on_train_end(&mut self.state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StateValue;

    struct Counter {
        calls: Vec<&'static str>,
    }

    impl Callback for Counter {
        fn state_key(&self) -> String {
            "Counter".to_string()
        }

        fn on_validation_end(&mut self, trainer: &mut TrainerState) -> Result<()> {
            self.calls.push("validation_end");
            trainer.should_stop = true;
            Ok(())
        }

        fn on_train_epoch_end(&mut self, _trainer: &mut TrainerState) -> Result<()> {
            self.calls.push("train_epoch_end");
            Ok(())
        }

        fn on_save_checkpoint(&self) -> Option<StateDict> {
            Some(StateDict::from([(
                "calls".to_string(),
                StateValue::Int(self.calls.len() as i64),
            )]))
        }
    }

    struct Weights(Vec<f32>);

    impl Stateful for Weights {
        fn state_dict(&self) -> StateDict {
            StateDict::new()
        }

        fn load_state_dict(&mut self, _state: &StateDict) -> Result<()> {
            self.0.clear();
            Ok(())
        }
    }

    impl Model for Weights {}

    #[test]
    fn test_placement() {
        assert!(!DevicePlacement::cpu().is_accelerated());
        assert!(DevicePlacement::gpu(1).is_accelerated());
        assert_eq!(DevicePlacement::gpu(1).to_string(), "gpu:1");
        assert_eq!(DevicePlacement::default().to_string(), "cpu");
    }

    #[test]
    fn test_default_state() {
        let state = TrainerState::default();

        assert_eq!(state.max_epochs, DEFAULT_MAX_EPOCHS);
        assert_eq!(state.accumulate_grad_batches, 1);
        assert!(state.is_primary());
        assert!(!state.should_stop);
    }

    #[test]
    fn test_dispatch_reaches_callbacks() {
        let mut ctx = TrainingContext::new(Box::new(Weights(vec![1.0])), TrainerState::default());
        ctx.callbacks.push(Box::new(Counter { calls: Vec::new() }));

        ctx.run_validation_epoch_end().unwrap();
        ctx.run_validation_end().unwrap();
        ctx.run_train_epoch_end().unwrap();
        ctx.run_train_end().unwrap();

        assert!(ctx.state.should_stop);
        let saved = ctx.callbacks[0].on_save_checkpoint().unwrap();
        assert_eq!(saved["calls"], StateValue::Int(2));
    }
}
