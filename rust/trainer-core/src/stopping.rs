// rust/trainer-core/src/stopping.rs

//! Early stopping.
//!
//! A [`StoppingMonitor`] watches one logged metric and asks the loop to stop
//! once the metric has failed to improve for `patience` consecutive checks.
//! Several monitors may run side by side; each persists its state under its
//! own [`Callback::state_key`].
//!
//! A check happens at most once per epoch: after validation when the loop
//! validates, otherwise at the end of the training epoch if the metric was
//! logged there. Validation sanity passes never count.

use std::fmt;

use tracing::{debug, info, warn};

use crate::checkpoint::{StateDict, StateValue};
use crate::config::StoppingConfig;
use crate::distributed::ProcessGroup;
use crate::error::{Result, TrainerError};
use crate::metrics::Metrics;
use crate::trainer::{Callback, TrainerState};

/// Metric keys (or key segments) that default to maximization in auto mode.
const MAXIMIZED_KEYS: [&str; 2] = ["acc", "accuracy"];

/// Requested optimization direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Infer from the metric name.
    Auto,
    Min,
    Max,
}

impl StopMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "auto" => Some(StopMode::Auto),
            "min" => Some(StopMode::Min),
            "max" => Some(StopMode::Max),
            _ => None,
        }
    }
}

/// Comparison a new value must win against the best value so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LessThan,
    GreaterThan,
}

impl Direction {
    /// Resolves a mode for `monitor`. Auto picks `GreaterThan` for
    /// accuracy-style keys like `acc` or `val_acc`.
    pub fn resolve(mode: StopMode, monitor: &str) -> Self {
        match mode {
            StopMode::Min => Direction::LessThan,
            StopMode::Max => Direction::GreaterThan,
            StopMode::Auto => {
                let maximized = monitor
                    .split(['_', '/', '.'])
                    .any(|segment| MAXIMIZED_KEYS.contains(&segment));
                if maximized {
                    Direction::GreaterThan
                } else {
                    Direction::LessThan
                }
            }
        }
    }

    pub fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            Direction::LessThan => candidate < best,
            Direction::GreaterThan => candidate > best,
        }
    }

    /// The best score before anything has been observed.
    pub fn initial_best(self) -> f64 {
        match self {
            Direction::LessThan => f64::INFINITY,
            Direction::GreaterThan => f64::NEG_INFINITY,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LessThan => write!(f, "min"),
            Direction::GreaterThan => write!(f, "max"),
        }
    }
}

/// Everything a monitor remembers between checks.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppingState {
    pub monitored_key: String,
    pub direction: Direction,
    /// Negative for `LessThan`, so `value - min_delta` always makes the
    /// candidate harder to accept.
    pub min_delta: f64,
    pub patience: u32,
    /// Consecutive checks without improvement. Never exceeds `patience`.
    pub wait_count: u32,
    pub best_score: f64,
    /// Cycle at which the stop was raised, 0 if never.
    pub stopped_at_cycle: u64,
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopDecision {
    pub should_stop: bool,
    pub cycle: u64,
}

impl StopDecision {
    pub fn proceed(cycle: u64) -> Self {
        Self {
            should_stop: false,
            cycle,
        }
    }

    pub fn stop(cycle: u64) -> Self {
        Self {
            should_stop: true,
            cycle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No value observed yet.
    Idle,
    Watching,
    /// A stop has been raised; further checks are ignored.
    Stopped,
}

/// Watches a metric and requests a stop when it plateaus.
#[derive(Debug, Clone)]
pub struct StoppingMonitor {
    state: StoppingState,
    strict: bool,
    verbose: bool,
    phase: Phase,
    /// Epoch whose check was already driven by validation.
    validated_epoch: Option<u64>,
}

impl StoppingMonitor {
    pub fn new(config: StoppingConfig) -> Self {
        let mode = StopMode::parse(&config.mode).unwrap_or_else(|| {
            warn!(
                mode = %config.mode,
                "unknown early stopping mode, falling back to auto"
            );
            StopMode::Auto
        });
        let direction = Direction::resolve(mode, &config.monitor);
        if mode == StopMode::Auto && config.verbose {
            info!(monitor = %config.monitor, direction = %direction, "resolved auto mode");
        }

        let min_delta = match direction {
            Direction::GreaterThan => config.min_delta.abs(),
            Direction::LessThan => -config.min_delta.abs(),
        };

        Self {
            state: StoppingState {
                monitored_key: config.monitor,
                direction,
                min_delta,
                patience: config.patience,
                wait_count: 0,
                best_score: direction.initial_best(),
                stopped_at_cycle: 0,
            },
            strict: config.strict,
            verbose: config.verbose,
            phase: Phase::Idle,
            validated_epoch: None,
        }
    }

    /// Key under which a monitor watching `monitor` stores its state.
    pub fn state_key_for(monitor: &str) -> String {
        format!("StoppingMonitor[{monitor}]")
    }

    pub fn state(&self) -> &StoppingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == Phase::Stopped
    }

    /// Evaluates `metrics` for `cycle`.
    ///
    /// Returns `Ok(None)` when the check was skipped: the metric is missing
    /// in non-strict mode, or a stop was already raised. Skipped checks
    /// leave the state untouched.
    ///
    /// # Errors
    ///
    /// A configuration error if the metric is missing in strict mode or is
    /// not a scalar.
    pub fn check_cycle(&mut self, metrics: &Metrics, cycle: u64) -> Result<Option<StopDecision>> {
        if self.is_stopped() {
            debug!(monitor = %self.state.monitored_key, cycle, "stop already raised, skipping check");
            return Ok(None);
        }
        let Some(value) = self.lookup(metrics)? else {
            return Ok(None);
        };

        let state = &mut self.state;
        self.phase = Phase::Watching;
        if state.direction.improves(value - state.min_delta, state.best_score) {
            state.best_score = value;
            state.wait_count = 0;
            return Ok(Some(StopDecision::proceed(cycle)));
        }

        state.wait_count = state.wait_count.saturating_add(1).min(state.patience);
        debug!(
            monitor = %state.monitored_key,
            value,
            best = state.best_score,
            wait_count = state.wait_count,
            "no improvement"
        );
        if state.wait_count >= state.patience {
            state.stopped_at_cycle = cycle;
            self.phase = Phase::Stopped;
            info!(
                monitor = %state.monitored_key,
                cycle,
                best = state.best_score,
                "metric stopped improving, requesting stop"
            );
            return Ok(Some(StopDecision::stop(cycle)));
        }
        Ok(Some(StopDecision::proceed(cycle)))
    }

    fn lookup(&self, metrics: &Metrics) -> Result<Option<f64>> {
        let key = &self.state.monitored_key;
        let Some(value) = metrics.get(key) else {
            let available = metrics.keys().map(String::as_str).collect::<Vec<_>>().join(", ");
            let message = format!(
                "early stopping conditioned on metric `{key}` which is not available. \
                 Pass in or modify your stopping monitor to use one of the available \
                 metrics: {available}"
            );
            if self.strict {
                return Err(TrainerError::config(message));
            }
            warn!("{message}");
            return Ok(None);
        };

        value.as_scalar().map(Some).ok_or_else(|| {
            TrainerError::config(format!(
                "early stopping metric `{key}` must be a scalar, got {value:?}"
            ))
        })
    }

    /// Exports the resumable part of the state.
    pub fn serialize_state(&self) -> StateDict {
        StateDict::from([
            (
                "wait_count".to_string(),
                StateValue::Int(i64::from(self.state.wait_count)),
            ),
            (
                "stopped_at_cycle".to_string(),
                StateValue::Int(self.state.stopped_at_cycle as i64),
            ),
            (
                "best_score".to_string(),
                StateValue::Float(self.state.best_score),
            ),
            (
                "patience".to_string(),
                StateValue::Int(i64::from(self.state.patience)),
            ),
        ])
    }

    /// Imports state produced by [`serialize_state`](Self::serialize_state).
    ///
    /// `wait_count` and `patience` are required; `best_score` and
    /// `stopped_at_cycle` keep their current values when absent, as in
    /// checkpoints migrated from the legacy layout. The saved patience
    /// replaces the configured one. A monitor that had stopped comes back
    /// watching, since resuming starts a new run.
    pub fn deserialize_state(&mut self, state: &StateDict) -> Result<()> {
        let wait_count = required_count(state, "wait_count")?;
        let patience = required_count(state, "patience")?;
        let best_score = match state.get("best_score") {
            Some(value) => value.as_float().ok_or_else(|| malformed("best_score"))?,
            None => self.state.best_score,
        };
        let stopped_at_cycle = match state.get("stopped_at_cycle") {
            Some(value) => value
                .as_int()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| malformed("stopped_at_cycle"))?,
            None => self.state.stopped_at_cycle,
        };

        self.state.patience = patience;
        self.state.wait_count = wait_count.min(patience);
        self.state.best_score = best_score;
        self.state.stopped_at_cycle = stopped_at_cycle;
        self.validated_epoch = None;
        // A resumed run checks again: an improvement resets the wait count,
        // a further plateau stops immediately.
        self.phase = if best_score.is_finite() {
            Phase::Watching
        } else {
            Phase::Idle
        };
        Ok(())
    }

    /// Runs a check for the current epoch and reconciles the decision
    /// across ranks.
    fn run_check(&mut self, trainer: &mut TrainerState) -> Result<()> {
        let local = if self.is_stopped() {
            // Keep taking part in the reduction so peers don't block.
            StopDecision::stop(self.state.stopped_at_cycle)
        } else {
            match self.check_cycle(&trainer.metrics, trainer.current_epoch)? {
                Some(decision) => decision,
                None => return Ok(()),
            }
        };

        let global = reconcile(local, trainer.process_group.as_ref())?;
        if global.should_stop {
            if !local.should_stop {
                debug!(
                    monitor = %self.state.monitored_key,
                    rank = trainer.process_group.rank(),
                    "stop requested by another rank"
                );
            }
            trainer.should_stop = true;
        }
        Ok(())
    }
}

/// Combines the local decision with every other rank's: if any rank wants
/// to stop, all do.
pub fn reconcile(local: StopDecision, group: &dyn ProcessGroup) -> Result<StopDecision> {
    let should_stop = group.logical_or(local.should_stop)?;
    Ok(StopDecision {
        should_stop,
        cycle: local.cycle,
    })
}

fn required_count(state: &StateDict, key: &str) -> Result<u32> {
    state
        .get(key)
        .ok_or_else(|| TrainerError::checkpoint(format!("stopping monitor state is missing `{key}`")))?
        .as_int()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| malformed(key))
}

fn malformed(key: &str) -> TrainerError {
    TrainerError::checkpoint(format!("stopping monitor state has a malformed `{key}`"))
}

impl Callback for StoppingMonitor {
    fn state_key(&self) -> String {
        Self::state_key_for(&self.state.monitored_key)
    }

    fn on_save_checkpoint(&self) -> Option<StateDict> {
        Some(self.serialize_state())
    }

    fn on_load_checkpoint(&mut self, state: &StateDict) -> Result<()> {
        self.deserialize_state(state)
    }

    fn on_validation_epoch_end(&mut self, trainer: &mut TrainerState) -> Result<()> {
        if trainer.running_sanity_check {
            return Ok(());
        }
        if trainer.metrics.contains_key(&self.state.monitored_key) {
            self.validated_epoch = Some(trainer.current_epoch);
        }
        Ok(())
    }

    fn on_validation_end(&mut self, trainer: &mut TrainerState) -> Result<()> {
        if trainer.running_sanity_check {
            return Ok(());
        }
        self.run_check(trainer)?;
        if trainer.metrics.contains_key(&self.state.monitored_key) {
            self.validated_epoch = Some(trainer.current_epoch);
        }
        Ok(())
    }

    fn on_train_epoch_end(&mut self, trainer: &mut TrainerState) -> Result<()> {
        if trainer.running_sanity_check || self.validated_epoch == Some(trainer.current_epoch) {
            return Ok(());
        }
        if !trainer.metrics.contains_key(&self.state.monitored_key) {
            return Ok(());
        }
        self.run_check(trainer)
    }

    fn on_train_end(&mut self, _trainer: &mut TrainerState) -> Result<()> {
        if self.is_stopped() {
            info!("Epoch {:05}: early stopping triggered", self.state.stopped_at_cycle + 1);
        } else if self.verbose {
            debug!(monitor = %self.state.monitored_key, "training ended without early stopping");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalGroup;
    use crate::metrics::{metrics_from, MetricValue};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn monitor(key: &str, mode: &str, patience: u32, min_delta: f64) -> StoppingMonitor {
        StoppingMonitor::new(StoppingConfig {
            monitor: key.to_string(),
            mode: mode.to_string(),
            patience,
            min_delta,
            ..Default::default()
        })
    }

    fn run(monitor: &mut StoppingMonitor, key: &str, values: &[f64]) -> Vec<Option<StopDecision>> {
        values
            .iter()
            .enumerate()
            .map(|(cycle, v)| {
                monitor
                    .check_cycle(&metrics_from([(key, *v)]), cycle as u64)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_auto_mode_resolution() {
        assert_eq!(Direction::resolve(StopMode::Auto, "val_loss"), Direction::LessThan);
        assert_eq!(Direction::resolve(StopMode::Auto, "acc"), Direction::GreaterThan);
        assert_eq!(Direction::resolve(StopMode::Auto, "val_acc"), Direction::GreaterThan);
        assert_eq!(Direction::resolve(StopMode::Auto, "val/accuracy"), Direction::GreaterThan);
        assert_eq!(Direction::resolve(StopMode::Auto, "accumulated"), Direction::LessThan);
        assert_eq!(Direction::resolve(StopMode::Max, "val_loss"), Direction::GreaterThan);
    }

    #[test]
    fn test_unknown_mode_falls_back_to_auto() {
        let m = monitor("val_loss", "sideways", 3, 0.0);
        assert_eq!(m.state().direction, Direction::LessThan);
        assert_eq!(m.state().best_score, f64::INFINITY);
    }

    #[test]
    fn test_min_delta_sign_follows_direction() {
        assert_eq!(monitor("val_loss", "min", 3, 0.5).state().min_delta, -0.5);
        assert_eq!(monitor("val_loss", "min", 3, -0.5).state().min_delta, -0.5);
        assert_eq!(monitor("val_acc", "max", 3, -0.5).state().min_delta, 0.5);
    }

    #[test]
    fn test_decreasing_values_never_wait() {
        let mut m = monitor("val_loss", "min", 2, 0.0);

        let decisions = run(&mut m, "val_loss", &[5.0, 4.0, 3.0, 2.0, 1.0]);

        assert!(decisions
            .iter()
            .all(|d| matches!(d, Some(StopDecision { should_stop: false, .. }))));
        assert_eq!(m.state().wait_count, 0);
        assert_eq!(m.state().best_score, 1.0);
    }

    #[test]
    fn test_plateau_stops_after_patience() {
        let mut m = monitor("val_loss", "min", 3, 0.0);

        let decisions = run(&mut m, "val_loss", &[3.0, 3.0, 3.0, 3.0]);

        assert_eq!(decisions[3], Some(StopDecision::stop(3)));
        assert!(decisions[..3].iter().all(|d| !d.unwrap().should_stop));
        assert_eq!(m.state().stopped_at_cycle, 3);
        assert_eq!(m.phase(), Phase::Stopped);
    }

    #[test]
    fn test_min_delta_requires_margin() {
        let mut m = monitor("val_loss", "min", 5, 0.1);

        run(&mut m, "val_loss", &[1.0, 0.95, 0.85]);

        assert_eq!(m.state().best_score, 0.85);
        assert_eq!(m.state().wait_count, 0);
        // 0.95 was not better by at least 0.1, but 0.85 was
        let mut m = monitor("val_loss", "min", 5, 0.1);
        run(&mut m, "val_loss", &[1.0, 0.95]);
        assert_eq!(m.state().wait_count, 1);
    }

    #[test]
    fn test_stop_raised_once() {
        let mut m = monitor("val_loss", "min", 1, 0.0);

        let decisions = run(&mut m, "val_loss", &[1.0, 2.0, 3.0, 0.1]);

        assert_eq!(decisions[1], Some(StopDecision::stop(1)));
        assert_eq!(decisions[2], None);
        assert_eq!(decisions[3], None);
        assert_eq!(m.state().best_score, 1.0);
    }

    #[test]
    fn test_missing_metric_strict() {
        let mut m = monitor("val_loss", "min", 3, 0.0);

        let err = m
            .check_cycle(&metrics_from([("train_loss", 1.0), ("val_acc", 0.4)]), 0)
            .unwrap_err();

        assert!(matches!(err, TrainerError::Config { .. }));
        let message = err.to_string();
        assert!(message.contains("val_loss"));
        assert!(message.contains("train_loss, val_acc"));
    }

    #[test]
    fn test_missing_metric_lenient() {
        let mut m = StoppingMonitor::new(StoppingConfig {
            strict: false,
            ..StoppingConfig::monitoring("val_loss")
        });
        let before = m.state().clone();

        let decision = m.check_cycle(&metrics_from([("train_loss", 1.0)]), 0).unwrap();

        assert_eq!(decision, None);
        assert_eq!(m.state(), &before);
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_non_scalar_metric_rejected() {
        let mut m = monitor("val_loss", "min", 3, 0.0);
        let mut metrics = Metrics::new();
        metrics.insert("val_loss".to_string(), MetricValue::Tensor(vec![1.0, 2.0]));

        assert!(matches!(m.check_cycle(&metrics, 0), Err(TrainerError::Config { .. })));
    }

    #[test]
    fn test_state_roundtrip() {
        let mut m = monitor("val_loss", "min", 4, 0.0);
        run(&mut m, "val_loss", &[2.0, 1.0, 1.5, 1.7]);

        let mut restored = monitor("val_loss", "min", 4, 0.0);
        restored.deserialize_state(&m.serialize_state()).unwrap();

        assert_eq!(restored.state(), m.state());
        assert_eq!(restored.phase(), Phase::Watching);
    }

    #[test]
    fn test_restored_stopped_monitor_evaluates_again() {
        let mut m = monitor("val_loss", "min", 2, 0.0);
        let decisions = run(&mut m, "val_loss", &[1.0, 2.0, 2.0]);
        assert_eq!(decisions[2], Some(StopDecision::stop(2)));

        let mut resumed = monitor("val_loss", "min", 2, 0.0);
        resumed.deserialize_state(&m.serialize_state()).unwrap();
        assert_eq!(resumed.phase(), Phase::Watching);

        let decision = resumed
            .check_cycle(&metrics_from([("val_loss", 0.1)]), 3)
            .unwrap();
        assert_eq!(decision, Some(StopDecision::proceed(3)));
        assert_eq!(resumed.state().wait_count, 0);
        assert_eq!(resumed.state().best_score, 0.1);

        // A plateau right after resuming stops again
        let mut plateau = monitor("val_loss", "min", 2, 0.0);
        plateau.deserialize_state(&m.serialize_state()).unwrap();
        let decision = plateau
            .check_cycle(&metrics_from([("val_loss", 1.5)]), 3)
            .unwrap();
        assert_eq!(decision, Some(StopDecision::stop(3)));
        assert_eq!(plateau.state().stopped_at_cycle, 3);
    }

    #[test]
    fn test_resumed_training_not_stopped_on_improvement() {
        let mut m = monitor("val_loss", "min", 2, 0.0);
        run(&mut m, "val_loss", &[1.0, 2.0, 2.0]);

        let mut resumed = monitor("val_loss", "min", 2, 0.0);
        resumed.deserialize_state(&m.serialize_state()).unwrap();
        let mut trainer = TrainerState::default();
        trainer.current_epoch = 3;
        trainer.metrics = metrics_from([("val_loss", 0.1)]);
        resumed.on_validation_end(&mut trainer).unwrap();

        assert!(!trainer.should_stop);
    }

    #[test]
    fn test_stop_at_first_cycle_survives_roundtrip() {
        let mut m = monitor("val_loss", "min", 1, 0.0);
        let decision = m
            .check_cycle(&metrics_from([("val_loss", f64::NAN)]), 0)
            .unwrap();
        assert_eq!(decision, Some(StopDecision::stop(0)));

        let mut resumed = monitor("val_loss", "min", 1, 0.0);
        resumed.deserialize_state(&m.serialize_state()).unwrap();

        assert_eq!(resumed.state(), m.state());
        assert_eq!(resumed.phase(), Phase::Idle);
        let decision = resumed
            .check_cycle(&metrics_from([("val_loss", 0.5)]), 1)
            .unwrap();
        assert_eq!(decision, Some(StopDecision::proceed(1)));
    }

    #[test]
    fn test_restored_patience_replaces_configured() {
        let mut m = monitor("val_loss", "min", 10, 0.0);
        let saved = StateDict::from([
            ("wait_count".to_string(), StateValue::Int(4)),
            ("patience".to_string(), StateValue::Int(5)),
        ]);

        m.deserialize_state(&saved).unwrap();
        let decision = m.check_cycle(&metrics_from([("val_loss", 1.0)]), 7).unwrap();

        // Best is still +inf, so the first value improves
        assert_eq!(decision, Some(StopDecision::proceed(7)));
        assert_eq!(m.state().patience, 5);
        assert_eq!(m.state().wait_count, 0);
    }

    #[test]
    fn test_deserialize_rejects_missing_fields() {
        let mut m = monitor("val_loss", "min", 3, 0.0);
        let saved = StateDict::from([("patience".to_string(), StateValue::Int(3))]);

        assert!(matches!(
            m.deserialize_state(&saved),
            Err(TrainerError::Checkpoint { .. })
        ));
    }

    #[test]
    fn test_validation_drives_epoch() {
        let mut m = monitor("val_loss", "min", 1, 0.0);
        let mut trainer = TrainerState::default();
        trainer.metrics = metrics_from([("val_loss", 1.0)]);

        m.on_validation_epoch_end(&mut trainer).unwrap();
        m.on_validation_end(&mut trainer).unwrap();
        trainer.metrics = metrics_from([("val_loss", 2.0)]);
        m.on_train_epoch_end(&mut trainer).unwrap();

        // The training-epoch check was suppressed, so no wait accrued
        assert_eq!(m.state().wait_count, 0);
        assert!(!trainer.should_stop);

        trainer.current_epoch = 1;
        m.on_train_epoch_end(&mut trainer).unwrap();
        assert!(trainer.should_stop);
        assert_eq!(m.state().stopped_at_cycle, 1);
    }

    #[test]
    fn test_sanity_check_ignored() {
        let mut m = monitor("val_loss", "min", 1, 0.0);
        let mut trainer = TrainerState::default();
        trainer.running_sanity_check = true;

        // Strict mode would fail on the empty metrics if the hook ran
        m.on_validation_end(&mut trainer).unwrap();
        m.on_train_epoch_end(&mut trainer).unwrap();

        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_train_epoch_end_without_metric_is_skipped() {
        let mut m = monitor("val_loss", "min", 1, 0.0);
        let mut trainer = TrainerState::default();

        m.on_train_epoch_end(&mut trainer).unwrap();

        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_state_key() {
        let m = monitor("val_loss", "min", 1, 0.0);
        assert_eq!(m.state_key(), "StoppingMonitor[val_loss]");
    }

    #[test]
    fn test_any_rank_stopping_stops_all() {
        let handles: Vec<_> = LocalGroup::create(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    let mut m = monitor("val_loss", "min", 1, 0.0);
                    let mut trainer = TrainerState::new(Arc::new(group));

                    // Only rank 1 sees a plateau in epoch 1
                    for (epoch, loss) in [1.0, if rank == 1 { 1.0 } else { 0.5 }].into_iter().enumerate() {
                        trainer.current_epoch = epoch as u64;
                        trainer.metrics = metrics_from([("val_loss", loss)]);
                        m.on_validation_end(&mut trainer).unwrap();
                    }
                    (rank, m.is_stopped(), trainer.should_stop)
                })
            })
            .collect();

        for handle in handles {
            let (rank, locally_stopped, should_stop) = handle.join().unwrap();
            assert!(should_stop, "rank {rank} did not stop");
            assert_eq!(locally_stopped, rank == 1);
        }
    }

    proptest! {
        #[test]
        fn prop_wait_count_bounded_and_single_stop(
            values in prop::collection::vec(-10.0f64..10.0, 0..40),
            patience in 1u32..6,
            min_delta in 0.0f64..1.0,
            maximize in any::<bool>(),
        ) {
            let mode = if maximize { "max" } else { "min" };
            let mut m = monitor("metric", mode, patience, min_delta);
            let mut stops = 0;

            for (cycle, value) in values.iter().enumerate() {
                let before = m.state().clone();
                let decision = m.check_cycle(&metrics_from([("metric", *value)]), cycle as u64).unwrap();
                prop_assert!(m.state().wait_count <= patience);

                match decision {
                    Some(d) if d.should_stop => {
                        stops += 1;
                        prop_assert_eq!(m.state().wait_count, patience);
                        prop_assert_eq!(m.state().stopped_at_cycle, cycle as u64);
                    }
                    Some(_) => prop_assert!(m.state().wait_count < patience),
                    None => {
                        prop_assert!(stops == 1);
                        prop_assert_eq!(m.state(), &before);
                    }
                }
            }
            prop_assert!(stops <= 1);
        }

        #[test]
        fn prop_lenient_missing_metric_does_not_mutate(
            values in prop::collection::vec(-10.0f64..10.0, 0..10),
            patience in 1u32..6,
        ) {
            let mut m = StoppingMonitor::new(StoppingConfig {
                strict: false,
                patience,
                ..StoppingConfig::monitoring("val_loss")
            });
            for (cycle, value) in values.iter().enumerate() {
                m.check_cycle(&metrics_from([("val_loss", *value)]), cycle as u64).unwrap();
            }
            let before = m.state().clone();
            let phase = m.phase();

            let decision = m.check_cycle(&metrics_from([("other", 1.0)]), 99).unwrap();

            prop_assert_eq!(decision, None);
            prop_assert_eq!(m.state(), &before);
            prop_assert_eq!(m.phase(), phase);
        }

        #[test]
        fn prop_state_roundtrip(
            values in prop::collection::vec(-10.0f64..10.0, 1..20),
            patience in 1u32..6,
            min_delta in 0.0f64..1.0,
            maximize in any::<bool>(),
        ) {
            let mode = if maximize { "max" } else { "min" };
            let mut m = monitor("val_loss", mode, patience, min_delta);
            for (cycle, value) in values.iter().enumerate() {
                m.check_cycle(&metrics_from([("val_loss", *value)]), cycle as u64).unwrap();
            }

            let mut restored = monitor("val_loss", mode, patience, min_delta);
            restored.deserialize_state(&m.serialize_state()).unwrap();

            prop_assert_eq!(restored.state(), m.state());
            // Restored monitors always evaluate again
            prop_assert!(!restored.is_stopped());
            prop_assert_eq!(restored.serialize_state(), m.serialize_state());
        }
    }
}
