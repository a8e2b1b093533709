// rust/trainer-core/src/checkpoint/manager.rs

//! Capture, persistence and restoration of complete training state.
//!
//! A [`CheckpointManager`] turns a [`TrainingContext`] into a
//! [`CheckpointRecord`] and back. It also owns the preemption protocol: when
//! a cluster scheduler is about to kill the job, the loop calls
//! [`save_preemption_snapshot`](CheckpointManager::save_preemption_snapshot);
//! the requeued job then calls
//! [`restore_weights`](CheckpointManager::restore_weights), which finds the
//! newest snapshot without any user-supplied path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{CheckpointConfig, TrainerConfig};
use crate::error::{Result, TrainerError};
use crate::storage::{LocalStorage, StorageBackend};
use crate::trainer::{DeviceKind, DevicePlacement, TrainingContext};

use super::format::{CheckpointHeader, META_EPOCH, META_GLOBAL_STEP, META_VERSION, META_WEIGHTS_ONLY};
use super::naming::SnapshotNaming;
use super::reader::CheckpointReader;
use super::record::{AmpBackend, CheckpointRecord, DroppableField, ScalerState, StateDict};
use super::upgrade::check_schema;
use super::writer::CheckpointWriter;

/// Result of a successful [`CheckpointManager::persist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The record was written in full.
    Written,
    /// Some optional fields could not be encoded and were left out.
    Degraded { dropped: Vec<DroppableField> },
}

impl PersistOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, PersistOutcome::Degraded { .. })
    }
}

/// Counters in effect after a full-state restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeSummary {
    pub epoch: u64,
    pub global_step: u64,
    /// The checkpoint was taken part way through an epoch. Resuming still
    /// works, but the remaining batches of that epoch are not replayed.
    pub mid_epoch: bool,
}

/// Where [`CheckpointManager::restore_weights`] took its state from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Preemption(PathBuf),
    UserCheckpoint(PathBuf),
    /// Nothing to restore; training starts from scratch.
    Fresh,
}

pub struct CheckpointManager {
    storage: Arc<dyn StorageBackend>,
    writer: CheckpointWriter,
    reader: CheckpointReader,
    naming: SnapshotNaming,
    weights_save_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn StorageBackend>, config: &CheckpointConfig) -> Result<Self> {
        Ok(Self {
            writer: CheckpointWriter::new(storage.clone(), config)?,
            reader: CheckpointReader::new(storage.clone()),
            naming: SnapshotNaming::from_config(config),
            weights_save_path: config.weights_save_path.clone(),
            storage,
        })
    }

    /// Creates a manager over local storage rooted at `storage.base_path`.
    pub fn from_config(config: &TrainerConfig) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        Self::new(storage, &config.checkpoint)
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn naming(&self) -> &SnapshotNaming {
        &self.naming
    }

    /// Directory preemption snapshots are written to and resumed from.
    pub fn weights_save_path(&self) -> &Path {
        &self.weights_save_path
    }

    /// Builds a record from the current training state without changing it.
    ///
    /// Epoch and global step are stored one past their current values: the
    /// snapshot is taken at the end of a unit of work, so resuming starts
    /// with the next one.
    pub fn capture_snapshot(&self, ctx: &TrainingContext, weights_only: bool) -> CheckpointRecord {
        let state = &ctx.state;
        let base = CheckpointRecord::weights_only(
            state.current_epoch + 1,
            state.global_step + 1,
            ctx.model.state_dict(),
        );

        let mut extras = StateDict::new();
        ctx.model.on_save_checkpoint(&mut extras);
        if let Some(datamodule) = &ctx.datamodule {
            datamodule.on_save_checkpoint(&mut extras);
        }

        if weights_only {
            return CheckpointRecord {
                hparams: ctx.model.hparams(),
                extras,
                ..base
            };
        }

        let mut callbacks = BTreeMap::new();
        for callback in &ctx.callbacks {
            let Some(callback_state) = callback.on_save_checkpoint() else {
                continue;
            };
            let key = callback.state_key();
            if callbacks.insert(key.clone(), callback_state).is_some() {
                warn!(key = %key, "duplicate callback state key, keeping the last one");
            }
        }

        CheckpointRecord {
            optimizer_states: Some(ctx.optimizers.iter().map(|o| o.state_dict()).collect()),
            scheduler_states: Some(ctx.schedulers.iter().map(|s| s.state_dict()).collect()),
            scaler: capture_scaler(ctx),
            callbacks: Some(callbacks),
            hparams: ctx.model.hparams(),
            extras,
            ..base
        }
    }

    /// Encodes `record` and writes it atomically to `destination`.
    ///
    /// When the record fails to encode, every optional field that fails on
    /// its own is dropped and the write is retried once.
    ///
    /// # Errors
    ///
    /// - A configuration error if `destination` exists and `allow_overwrite`
    ///   is false
    /// - A serialization error if the record still fails to encode after
    ///   dropping fields
    /// - A storage error if the write itself fails
    pub fn persist(
        &self,
        record: &CheckpointRecord,
        destination: &Path,
        allow_overwrite: bool,
    ) -> Result<PersistOutcome> {
        let metadata = header_metadata(record);

        let (payload, outcome) = match record.encode() {
            Ok(payload) => (payload, PersistOutcome::Written),
            Err(err) => {
                let dropped = record.unencodable_fields();
                if dropped.is_empty() {
                    return Err(err);
                }
                for field in &dropped {
                    warn!(
                        field = %field,
                        destination = %destination.display(),
                        "field cannot be serialized and is left out of the checkpoint"
                    );
                }
                let payload = record.without(&dropped).encode()?;
                (payload, PersistOutcome::Degraded { dropped })
            }
        };

        self.writer.write(destination, &payload, metadata, allow_overwrite)?;
        debug!(destination = %destination.display(), bytes = payload.len(), "checkpoint written");
        Ok(outcome)
    }

    /// Reads and decodes the record at `source`.
    pub fn load(&self, source: &Path) -> Result<CheckpointRecord> {
        let (_, payload) = self.reader.read(source)?;
        CheckpointRecord::decode(&payload)
    }

    /// Reads only the file header of the checkpoint at `source`.
    pub fn read_header(&self, source: &Path) -> Result<CheckpointHeader> {
        self.reader.read_header(source)
    }

    /// Restores model weights and the full training state from `source`,
    /// moving the model to `placement`.
    pub fn restore(
        &self,
        ctx: &mut TrainingContext,
        source: &Path,
        placement: &DevicePlacement,
    ) -> Result<ResumeSummary> {
        let record = self.load(source)?;
        let summary = self.apply_record(ctx, &record, placement)?;
        info!(
            source = %source.display(),
            epoch = summary.epoch,
            global_step = summary.global_step,
            "restored checkpoint"
        );
        Ok(summary)
    }

    fn apply_record(
        &self,
        ctx: &mut TrainingContext,
        record: &CheckpointRecord,
        placement: &DevicePlacement,
    ) -> Result<ResumeSummary> {
        check_schema(record)?;

        ctx.model.load_state_dict(&record.model_state)?;
        if let Some(datamodule) = ctx.datamodule.as_mut() {
            datamodule.on_load_checkpoint(record)?;
        }
        ctx.model.on_load_checkpoint(record)?;

        ctx.model.move_to(placement)?;
        ctx.placement = *placement;

        restore_scaler(ctx, record)?;
        self.restore_training_state(ctx, record)
    }

    /// Restores optimizers, schedulers, callbacks and counters from a
    /// full-state record, in that order.
    ///
    /// Every validation runs before any mutation. A component that fails
    /// to load its own state aborts the restore; components loaded before
    /// it keep the new state, and the loop counters are only updated once
    /// everything else has loaded.
    ///
    /// # Errors
    ///
    /// - A partial-state error for weights-only records
    /// - A schema error for records in the legacy layout
    /// - A configuration error if the record's epoch exceeds `max_epochs`
    /// - A count mismatch if the optimizer or scheduler counts differ
    pub fn restore_training_state(
        &self,
        ctx: &mut TrainingContext,
        record: &CheckpointRecord,
    ) -> Result<ResumeSummary> {
        let (Some(optimizer_states), Some(scheduler_states)) =
            (&record.optimizer_states, &record.scheduler_states)
        else {
            return Err(TrainerError::partial_state(
                "trying to restore training state but the checkpoint contains only the model. \
                 This is probably due to saving it with weights_only = true",
            ));
        };
        check_schema(record)?;

        if record.epoch > ctx.state.max_epochs {
            return Err(TrainerError::config(format!(
                "checkpoint resumes at epoch {} but max_epochs is {}; \
                 raise max_epochs to continue training from it",
                record.epoch, ctx.state.max_epochs
            )));
        }
        if optimizer_states.len() != ctx.optimizers.len() {
            return Err(TrainerError::count_mismatch(
                "optimizer",
                optimizer_states.len(),
                ctx.optimizers.len(),
            ));
        }
        if scheduler_states.len() != ctx.schedulers.len() {
            return Err(TrainerError::count_mismatch(
                "scheduler",
                scheduler_states.len(),
                ctx.schedulers.len(),
            ));
        }

        for (optimizer, state) in ctx.optimizers.iter_mut().zip(optimizer_states) {
            optimizer.load_state_dict(state)?;
        }
        for (scheduler, state) in ctx.schedulers.iter_mut().zip(scheduler_states) {
            scheduler.load_state_dict(state)?;
        }

        if let Some(callback_states) = &record.callbacks {
            for callback in ctx.callbacks.iter_mut() {
                let key = callback.state_key();
                match callback_states.get(&key) {
                    Some(state) => callback.on_load_checkpoint(state)?,
                    None => debug!(key = %key, "no saved state for callback"),
                }
            }
        }

        ctx.state.global_step = record.global_step;
        ctx.state.current_epoch = record.epoch;

        let mid_epoch = is_mid_epoch(
            record.global_step,
            ctx.state.num_training_batches,
            ctx.state.accumulate_grad_batches,
        );
        if mid_epoch {
            warn!(
                global_step = record.global_step,
                "you're resuming from a checkpoint that ended mid-epoch. \
                 Training will start from the beginning of the next epoch"
            );
        }

        Ok(ResumeSummary {
            epoch: record.epoch,
            global_step: record.global_step,
            mid_epoch,
        })
    }

    /// Path of the highest-numbered preemption snapshot in `directory`.
    pub fn latest_snapshot(&self, directory: &Path) -> Result<Option<PathBuf>> {
        if !self.storage.exists(directory)? {
            return Ok(None);
        }
        let entries = self.storage.list(directory)?;
        Ok(self
            .naming
            .latest(&entries)
            .map(|(_, name)| directory.join(name)))
    }

    /// Restores from the newest preemption snapshot in `directory`, if any.
    ///
    /// Returns `false` when there is none.
    pub fn resume_from_preemption(&self, ctx: &mut TrainingContext, directory: &Path) -> Result<bool> {
        Ok(self.resume_latest(ctx, directory)?.is_some())
    }

    fn resume_latest(&self, ctx: &mut TrainingContext, directory: &Path) -> Result<Option<PathBuf>> {
        let Some(path) = self.latest_snapshot(directory)? else {
            return Ok(None);
        };

        let record = self.load(&path)?;
        let placement = ctx.placement;
        self.apply_record(ctx, &record, &placement)?;
        ctx.model.on_preemption_load(&record)?;

        info!(path = %path.display(), "restored state from preemption snapshot");
        Ok(Some(path))
    }

    /// Writes a full snapshot to the next free `<prefix>_<N>.<ext>` in
    /// `directory` and returns its path.
    ///
    /// Only the primary rank writes. Other ranks return the path the
    /// primary is expected to use, computed from the directory as they see
    /// it.
    pub fn save_preemption_snapshot(&self, ctx: &mut TrainingContext, directory: &Path) -> Result<PathBuf> {
        if !ctx.state.is_primary() {
            let entries = if self.storage.exists(directory)? {
                self.storage.list(directory)?
            } else {
                Vec::new()
            };
            return Ok(directory.join(self.naming.file_name(self.naming.next_number(&entries)?)));
        }

        self.storage.create_dir_all(directory)?;
        if let Some(logger) = ctx.logger.as_mut() {
            logger.flush()?;
        }

        let entries = self.storage.list(directory)?;
        let path = directory.join(self.naming.file_name(self.naming.next_number(&entries)?));

        let record = self.capture_snapshot(ctx, false);
        ctx.model.on_preemption_save(&record);
        let outcome = self.persist(&record, &path, true)?;

        info!(
            path = %path.display(),
            epoch = record.epoch,
            degraded = outcome.is_degraded(),
            "saved preemption snapshot"
        );
        Ok(path)
    }

    /// Captures a snapshot and writes it to `path` on the primary rank.
    ///
    /// Returns `None` on other ranks.
    pub fn save_checkpoint(
        &self,
        ctx: &TrainingContext,
        path: &Path,
        weights_only: bool,
    ) -> Result<Option<PersistOutcome>> {
        let record = self.capture_snapshot(ctx, weights_only);
        if !ctx.state.is_primary() {
            return Ok(None);
        }
        self.persist(&record, path, true).map(Some)
    }

    /// Restores state at the start of a run.
    ///
    /// A preemption snapshot in the weights directory wins over
    /// `resume_from`, since it is always the more recent state of this job.
    /// All ranks meet at a barrier before returning.
    pub fn restore_weights(
        &self,
        ctx: &mut TrainingContext,
        resume_from: Option<&Path>,
    ) -> Result<RestoreSource> {
        self.empty_device_cache(ctx);

        let directory = self.weights_save_path.clone();
        let source = match self.resume_latest(ctx, &directory)? {
            Some(path) => RestoreSource::Preemption(path),
            None => {
                self.empty_device_cache(ctx);
                match resume_from {
                    Some(path) => {
                        let placement = ctx.placement;
                        self.restore(ctx, path, &placement)?;
                        RestoreSource::UserCheckpoint(path.to_path_buf())
                    }
                    None => RestoreSource::Fresh,
                }
            }
        };

        ctx.state.process_group.barrier("restore_weights")?;
        self.empty_device_cache(ctx);
        Ok(source)
    }

    fn empty_device_cache(&self, ctx: &TrainingContext) {
        if ctx.placement.is_accelerated() {
            ctx.state.process_group.empty_device_cache();
        }
    }
}

fn capture_scaler(ctx: &TrainingContext) -> Option<ScalerState> {
    let backend = ctx.precision.backend?;
    let scaler = ctx.precision.scaler.as_ref()?;
    if backend == AmpBackend::Native && ctx.placement.kind == DeviceKind::Tpu {
        return None;
    }
    Some(ScalerState {
        backend,
        state: scaler.state_dict(),
    })
}

fn restore_scaler(ctx: &mut TrainingContext, record: &CheckpointRecord) -> Result<()> {
    let Some(saved) = &record.scaler else {
        return Ok(());
    };
    match (ctx.precision.backend, ctx.precision.scaler.as_mut()) {
        (Some(active), Some(scaler)) if active == saved.backend => scaler.load_state_dict(&saved.state),
        _ => {
            debug!(saved = ?saved.backend, active = ?ctx.precision.backend, "skipping scaler state");
            Ok(())
        }
    }
}

/// Whether `global_step` falls inside an epoch rather than on its boundary.
///
/// A remainder of one step is tolerated, since the stored step is one past
/// the last completed step.
fn is_mid_epoch(global_step: u64, num_training_batches: u64, accumulate_grad_batches: u64) -> bool {
    if num_training_batches == 0 {
        return false;
    }
    let expected_steps = num_training_batches as f64 / accumulate_grad_batches.max(1) as f64;
    global_step as f64 % expected_steps > 1.0
}

fn header_metadata(record: &CheckpointRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (META_VERSION.to_string(), record.version.clone()),
        (META_EPOCH.to_string(), record.epoch.to_string()),
        (META_GLOBAL_STEP.to_string(), record.global_step.to_string()),
        (
            META_WEIGHTS_ONLY.to_string(),
            record.is_weights_only().to_string(),
        ),
    ])
}
