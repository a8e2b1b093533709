// rust/trainer-cli/src/commands.rs

//! Subcommand implementations. Each returns the text to print.

use std::fmt::Write as _;
use std::path::Path;

use trainer_core::checkpoint::format::{META_EPOCH, META_GLOBAL_STEP, META_VERSION, META_WEIGHTS_ONLY};
use trainer_core::checkpoint::upgrade::{deprecated_keys, migration_plan, upgrade_file};
use trainer_core::{CheckpointManager, Result, StoppingMonitor};

/// Summarizes a checkpoint file.
pub fn inspect(manager: &CheckpointManager, path: &Path) -> Result<String> {
    let header = manager.read_header(path)?;
    let record = manager.load(path)?;

    let mut out = String::new();
    let _ = writeln!(out, "{}", path.display());
    let _ = writeln!(
        out,
        "  framing:      v{} ({}, {} bytes uncompressed)",
        header.version,
        header.compression.as_str(),
        header.uncompressed_size
    );
    for key in [META_VERSION, META_EPOCH, META_GLOBAL_STEP, META_WEIGHTS_ONLY] {
        if let Some(value) = header.metadata.get(key) {
            let _ = writeln!(out, "  {:<13} {}", format!("{key}:"), value);
        }
    }
    let _ = writeln!(out, "  model:        {} entries", record.model_state.len());
    if let Some(optimizers) = &record.optimizer_states {
        let _ = writeln!(out, "  optimizers:   {}", optimizers.len());
    }
    if let Some(schedulers) = &record.scheduler_states {
        let _ = writeln!(out, "  schedulers:   {}", schedulers.len());
    }
    if let Some(scaler) = &record.scaler {
        let _ = writeln!(out, "  scaler:       {:?}", scaler.backend);
    }
    if let Some(callbacks) = &record.callbacks {
        for key in callbacks.keys() {
            let _ = writeln!(out, "  callback:     {key}");
        }
    }
    if let Some(hparams) = &record.hparams {
        let _ = writeln!(
            out,
            "  hparams:      {} ({} values)",
            hparams.type_tag,
            hparams.values.len()
        );
    }
    if !record.extras.is_empty() {
        let keys: Vec<_> = record.extras.keys().map(String::as_str).collect();
        let _ = writeln!(out, "  extras:       {}", keys.join(", "));
    }
    let legacy = deprecated_keys(&record);
    if !legacy.is_empty() {
        let _ = writeln!(
            out,
            "  outdated schema ({}); run `trainer-ckpt upgrade {}`",
            legacy.join(", "),
            path.display()
        );
    }
    Ok(out)
}

/// Lists preemption snapshots in `dir`, oldest first.
pub fn snapshots(manager: &CheckpointManager, dir: &Path) -> Result<String> {
    let entries = if manager.storage().exists(dir)? {
        manager.storage().list(dir)?
    } else {
        Vec::new()
    };

    let mut numbered: Vec<(u64, &str)> = entries
        .iter()
        .filter_map(|name| manager.naming().parse(name).map(|n| (n, name.as_str())))
        .collect();
    numbered.sort_by_key(|(n, _)| *n);

    if numbered.is_empty() {
        return Ok(format!("no snapshots in {}\n", dir.display()));
    }

    let mut out = String::new();
    let latest = numbered.last().map(|(n, _)| *n);
    for (n, name) in &numbered {
        let path = dir.join(name);
        let epoch = manager
            .read_header(&path)
            .ok()
            .and_then(|h| h.metadata_u64(META_EPOCH))
            .map_or_else(|| "?".to_string(), |e| e.to_string());
        let size = manager.storage().metadata(&path)?.size;
        let marker = if Some(*n) == latest { "  (latest)" } else { "" };
        let _ = writeln!(out, "{n:>6}  {name}  epoch {epoch}  {size} bytes{marker}");
    }
    Ok(out)
}

/// Migrates a checkpoint written with the legacy callback keys.
pub fn upgrade(manager: &CheckpointManager, path: &Path, monitor: &str) -> Result<String> {
    let stopping_key = StoppingMonitor::state_key_for(monitor);
    let plan = migration_plan(&manager.load(path)?, &stopping_key);

    if !upgrade_file(manager, path, &stopping_key)? {
        return Ok(format!("{} is already up to date\n", path.display()));
    }

    let mut out = format!("upgraded {}\n", path.display());
    for (owner, moves) in plan {
        for entry in moves {
            let _ = writeln!(out, "  {owner}: {entry}");
        }
    }
    Ok(out)
}
