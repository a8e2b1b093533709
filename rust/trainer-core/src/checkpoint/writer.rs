// rust/trainer-core/src/checkpoint/writer.rs

//! Atomic checkpoint file writer.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use twox_hash::XxHash64;

use crate::config::CheckpointConfig;
use crate::error::{Result, TrainerError};
use crate::storage::StorageBackend;

use super::format::{CheckpointHeader, Compression};

/// Writes framed, compressed payloads so that readers only ever observe
/// either the previous file or the complete new one.
///
/// The payload goes to a hidden temporary file next to the destination,
/// which is then renamed over it.
pub struct CheckpointWriter {
    storage: Arc<dyn StorageBackend>,
    compression: Compression,
    compression_level: i32,
}

impl CheckpointWriter {
    /// Creates a writer using the configured compression.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown compression name.
    pub fn new(storage: Arc<dyn StorageBackend>, config: &CheckpointConfig) -> Result<Self> {
        let compression = Compression::parse(&config.compression).ok_or_else(|| {
            TrainerError::config(format!(
                "unknown compression algorithm: {}",
                config.compression
            ))
        })?;

        Ok(Self {
            storage,
            compression,
            compression_level: config.compression_level,
        })
    }

    /// Writes `payload` to `destination`.
    ///
    /// With `allow_overwrite` false an existing destination is an error and
    /// is left untouched.
    pub fn write(
        &self,
        destination: &Path,
        payload: &[u8],
        metadata: BTreeMap<String, String>,
        allow_overwrite: bool,
    ) -> Result<()> {
        if !allow_overwrite && self.storage.exists(destination)? {
            return Err(TrainerError::config(format!(
                "refusing to overwrite existing checkpoint {}",
                destination.display()
            )));
        }

        let checksum = calculate_checksum(payload);
        let compressed = self.compress(payload)?;
        let header = CheckpointHeader::new(
            self.compression,
            payload.len() as u64,
            checksum,
            metadata,
        );
        let header_bytes = bincode::serialize(&header)
            .map_err(|e| TrainerError::checkpoint(format!("failed to serialize header: {e}")))?;

        let header_len = header_bytes.len() as u32;
        let mut framed = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
        framed.extend_from_slice(&header_len.to_le_bytes());
        framed.extend_from_slice(&header_bytes);
        framed.extend_from_slice(&compressed);

        let temp_path = temp_path_for(destination)?;
        if let Err(e) = self.write_to_path(&temp_path, &framed) {
            // Best effort; the destination itself was never touched.
            let _ = self.storage.delete(&temp_path);
            return Err(e);
        }
        self.storage.rename(&temp_path, destination)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd => zstd::encode_all(data, self.compression_level)
                .map_err(|e| TrainerError::checkpoint_with_source("zstd compression failed", e)),
        }
    }

    fn write_to_path(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut writer = self.storage.open_write(path)?;
        writer
            .write_all(data)
            .map_err(|e| TrainerError::storage_with_source(path, "failed to write checkpoint data", e))?;
        writer.finish()
    }
}

/// XXHash64 (seed 0) of the uncompressed payload.
pub(crate) fn calculate_checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn temp_path_for(destination: &Path) -> Result<PathBuf> {
    let file_name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            TrainerError::config(format!(
                "checkpoint destination has no file name: {}",
                destination.display()
            ))
        })?;
    Ok(destination.with_file_name(format!(".{file_name}.tmp")))
}
