// rust/trainer-core/src/checkpoint/naming.rs

//! File naming for preemption snapshots: `<prefix>_<N>.<extension>`.
//!
//! A requeued job has no user-supplied checkpoint path, so the snapshot to
//! resume from is discovered purely from file names: the one with the
//! largest `N` wins. `N` is never zero-padded when written; when reading,
//! every digit between the prefix and the extension counts, so older names
//! such as `hpc_ckpt_v12.ckpt` still sort by their number.

use crate::config::CheckpointConfig;
use crate::error::{Result, TrainerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNaming {
    prefix: String,
    extension: String,
}

impl SnapshotNaming {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &CheckpointConfig) -> Self {
        Self::new(&config.preemption_prefix, &config.extension)
    }

    /// File name for snapshot number `n`.
    pub fn file_name(&self, n: u64) -> String {
        format!("{}_{}.{}", self.prefix, n, self.extension)
    }

    /// Extracts the snapshot number from a file name, or `None` if the name
    /// doesn't follow the convention.
    pub fn parse(&self, file_name: &str) -> Option<u64> {
        let rest = file_name.strip_prefix(&self.prefix)?.strip_prefix('_')?;
        let middle = rest
            .strip_suffix(&self.extension)?
            .strip_suffix('.')?;

        let digits: String = middle.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }
        if digits.len() != middle.len() {
            tracing::warn!(
                file = file_name,
                "snapshot uses a non-canonical numbering scheme; only its digits are used"
            );
        }
        digits.parse().ok()
    }

    /// The highest-numbered snapshot among `entries`.
    pub fn latest<'a>(&self, entries: &'a [String]) -> Option<(u64, &'a str)> {
        entries
            .iter()
            .filter_map(|name| self.parse(name).map(|n| (n, name.as_str())))
            .max_by_key(|(n, _)| *n)
    }

    /// Number to use for the next snapshot: one past the highest existing
    /// number, so the first snapshot in an empty directory is `1`.
    ///
    /// # Errors
    ///
    /// A configuration error if the highest existing number is `u64::MAX`.
    pub fn next_number(&self, entries: &[String]) -> Result<u64> {
        let latest = self.latest(entries);
        latest.map_or(0, |(n, _)| n).checked_add(1).ok_or_else(|| {
            TrainerError::config(format!(
                "snapshot numbering is exhausted: {} already uses the largest number",
                latest.map_or("", |(_, name)| name)
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_file_name() {
        let naming = SnapshotNaming::new("hpc_ckpt", "ckpt");
        assert_eq!(naming.file_name(12), "hpc_ckpt_12.ckpt");
    }

    #[test]
    fn test_parse() {
        let naming = SnapshotNaming::new("hpc_ckpt", "ckpt");

        assert_eq!(naming.parse("hpc_ckpt_3.ckpt"), Some(3));
        assert_eq!(naming.parse("hpc_ckpt_007.ckpt"), Some(7));
        assert_eq!(naming.parse("hpc_ckpt_v12.ckpt"), Some(12));
        assert_eq!(naming.parse("hpc_ckpt_.ckpt"), None);
        assert_eq!(naming.parse("hpc_ckpt_3.pt"), None);
        assert_eq!(naming.parse("other_3.ckpt"), None);
        assert_eq!(naming.parse(".hpc_ckpt_3.ckpt.tmp"), None);
    }

    #[test]
    fn test_latest_is_numeric_not_lexicographic() {
        let naming = SnapshotNaming::new("run", "ckpt");
        let entries = names(&["run_3.ckpt", "run_10.ckpt", "notes.txt"]);

        assert_eq!(naming.latest(&entries), Some((10, "run_10.ckpt")));
        assert_eq!(naming.next_number(&entries).unwrap(), 11);
    }

    #[test]
    fn test_empty_directory() {
        let naming = SnapshotNaming::new("hpc_ckpt", "ckpt");

        assert_eq!(naming.latest(&[]), None);
        assert_eq!(naming.next_number(&names(&["last.ckpt"])).unwrap(), 1);
    }

    #[test]
    fn test_next_number_overflow() {
        let naming = SnapshotNaming::new("hpc_ckpt", "ckpt");
        let max_name = naming.file_name(u64::MAX);
        let entries = names(&[max_name.as_str(), "hpc_ckpt_2.ckpt"]);

        let result = naming.next_number(&entries);

        assert!(matches!(result, Err(TrainerError::Config { .. })));
        assert_eq!(naming.latest(&entries), Some((u64::MAX, entries[0].as_str())));
    }

    #[test]
    fn test_from_config() {
        let naming = SnapshotNaming::from_config(&CheckpointConfig::default());
        assert_eq!(naming, SnapshotNaming::new("hpc_ckpt", "ckpt"));
    }
}
