// rust/trainer-core/src/checkpoint/upgrade.rs

//! Migration of checkpoints written with the legacy top-level callback keys.
//!
//! Older records stored the best-model and early stopping state directly in
//! the top-level entries. Loading such a record is refused; it has to be
//! rewritten once with `trainer-ckpt upgrade <file>`.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::error::{Result, TrainerError};

use super::manager::{CheckpointManager, PersistOutcome};
use super::record::{CheckpointRecord, StateDict};

/// State key of the best-model checkpointing callback.
pub const MODEL_CHECKPOINT_KEY: &str = "ModelCheckpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    ModelCheckpoint,
    Stopping,
}

/// Legacy key, the callback it belongs to, and its key inside that
/// callback's state.
const LEGACY_KEYS: [(&str, Target, &str); 5] = [
    ("checkpoint_callback_best_model_score", Target::ModelCheckpoint, "best_model_score"),
    ("checkpoint_callback_best_model_path", Target::ModelCheckpoint, "best_model_path"),
    ("checkpoint_callback_best", Target::ModelCheckpoint, "best_model_score"),
    ("early_stop_callback_wait", Target::Stopping, "wait_count"),
    ("early_stop_callback_patience", Target::Stopping, "patience"),
];

/// Legacy keys present in `record`, in a fixed order.
pub fn deprecated_keys(record: &CheckpointRecord) -> Vec<&'static str> {
    LEGACY_KEYS
        .iter()
        .map(|(key, _, _)| *key)
        .filter(|key| record.extras.contains_key(*key))
        .collect()
}

/// Fails with a schema error if `record` uses the legacy layout.
pub fn check_schema(record: &CheckpointRecord) -> Result<()> {
    let found = deprecated_keys(record);
    if found.is_empty() {
        return Ok(());
    }
    Err(TrainerError::schema(format!(
        "the checkpoint you're attempting to load follows an outdated schema \
         (found {}). Upgrade it by running `trainer-ckpt upgrade <file>`",
        found.join(", ")
    )))
}

/// Returns `record` with every legacy key moved into the callbacks map.
///
/// Early stopping values go under `stopping_key`, the state key of the
/// monitor that will resume from the checkpoint.
pub fn upgrade_record(record: &CheckpointRecord, stopping_key: &str) -> CheckpointRecord {
    let mut upgraded = record.clone();
    let mut callbacks = upgraded.callbacks.take().unwrap_or_default();

    for (legacy, target, field) in LEGACY_KEYS {
        let Some(value) = upgraded.extras.remove(legacy) else {
            continue;
        };
        let owner = match target {
            Target::ModelCheckpoint => MODEL_CHECKPOINT_KEY,
            Target::Stopping => stopping_key,
        };
        callbacks
            .entry(owner.to_string())
            .or_insert_with(StateDict::new)
            .insert(field.to_string(), value);
    }

    upgraded.callbacks = if callbacks.is_empty() && record.callbacks.is_none() {
        None
    } else {
        Some(callbacks)
    };
    upgraded
}

/// Rewrites the checkpoint at `path` in the current layout.
///
/// Returns `false` without touching the file when it is already current.
pub fn upgrade_file(manager: &CheckpointManager, path: &Path, stopping_key: &str) -> Result<bool> {
    let record = manager.load(path)?;
    let found = deprecated_keys(&record);
    if found.is_empty() {
        return Ok(false);
    }

    let upgraded = upgrade_record(&record, stopping_key);
    if let PersistOutcome::Degraded { dropped } = manager.persist(&upgraded, path, true)? {
        // Load never yields values that fail to encode
        tracing::warn!(path = %path.display(), ?dropped, "upgrade dropped fields");
    }
    info!(path = %path.display(), migrated = ?found, "upgraded checkpoint");
    Ok(true)
}

/// Groups the migrated values by target callback, for reporting.
pub fn migration_plan(record: &CheckpointRecord, stopping_key: &str) -> BTreeMap<String, Vec<String>> {
    let mut plan: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (legacy, target, field) in LEGACY_KEYS {
        if !record.extras.contains_key(legacy) {
            continue;
        }
        let owner = match target {
            Target::ModelCheckpoint => MODEL_CHECKPOINT_KEY,
            Target::Stopping => stopping_key,
        };
        plan.entry(owner.to_string())
            .or_default()
            .push(format!("{legacy} -> {field}"));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StateValue;

    const STOPPING: &str = "StoppingMonitor[val_loss]";

    fn legacy_record() -> CheckpointRecord {
        let mut record = CheckpointRecord {
            optimizer_states: Some(Vec::new()),
            scheduler_states: Some(Vec::new()),
            ..CheckpointRecord::weights_only(2, 40, StateDict::new())
        };
        record
            .extras
            .insert("checkpoint_callback_best".to_string(), StateValue::Float(0.31));
        record
            .extras
            .insert("early_stop_callback_wait".to_string(), StateValue::Int(2));
        record
            .extras
            .insert("early_stop_callback_patience".to_string(), StateValue::Int(5));
        record
            .extras
            .insert("user_note".to_string(), StateValue::Text("keep me".to_string()));
        record
    }

    #[test]
    fn test_check_schema() {
        let record = legacy_record();

        let err = check_schema(&record).unwrap_err();

        assert!(matches!(err, TrainerError::Schema { .. }));
        assert!(err.to_string().contains("trainer-ckpt upgrade"));
        assert!(err.to_string().contains("early_stop_callback_wait"));
        assert!(check_schema(&CheckpointRecord::weights_only(0, 0, StateDict::new())).is_ok());
    }

    #[test]
    fn test_upgrade_record_moves_keys() {
        let upgraded = upgrade_record(&legacy_record(), STOPPING);

        assert!(deprecated_keys(&upgraded).is_empty());
        assert_eq!(upgraded.extras.len(), 1);
        let callbacks = upgraded.callbacks.unwrap();
        assert_eq!(
            callbacks[MODEL_CHECKPOINT_KEY]["best_model_score"],
            StateValue::Float(0.31)
        );
        assert_eq!(callbacks[STOPPING]["wait_count"], StateValue::Int(2));
        assert_eq!(callbacks[STOPPING]["patience"], StateValue::Int(5));
    }

    #[test]
    fn test_upgrade_current_record_is_identity() {
        let record = CheckpointRecord::weights_only(1, 1, StateDict::new());
        assert_eq!(upgrade_record(&record, STOPPING), record);
    }

    #[test]
    fn test_migration_plan() {
        let plan = migration_plan(&legacy_record(), STOPPING);

        assert_eq!(plan[MODEL_CHECKPOINT_KEY], vec!["checkpoint_callback_best -> best_model_score"]);
        assert_eq!(plan[STOPPING].len(), 2);
    }
}
