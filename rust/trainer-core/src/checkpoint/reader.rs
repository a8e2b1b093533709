// rust/trainer-core/src/checkpoint/reader.rs

//! Checkpoint file reader.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, TrainerError};
use crate::storage::StorageBackend;

use super::format::{CheckpointHeader, Compression};
use super::writer::calculate_checksum;

/// Reads framed checkpoint files and verifies their integrity.
pub struct CheckpointReader {
    storage: Arc<dyn StorageBackend>,
}

impl CheckpointReader {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Reads a checkpoint file and returns its header and decompressed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The magic bytes are invalid
    /// - The framing version is not supported (schema error)
    /// - Decompression fails, or the checksum or size doesn't match
    pub fn read(&self, path: &Path) -> Result<(CheckpointHeader, Vec<u8>)> {
        let mut reader = self.storage.open_read(path)?;
        let mut data = Vec::with_capacity(reader.size() as usize);
        reader
            .read_to_end(&mut data)
            .map_err(|e| TrainerError::storage_with_source(path, "failed to read checkpoint file", e))?;

        let (header, body_offset) = parse_header(path, &data)?;
        let payload = decompress(&data[body_offset..], header.compression)?;

        let computed = calculate_checksum(&payload);
        if computed != header.checksum {
            return Err(TrainerError::checkpoint(format!(
                "checksum mismatch in {}: expected {}, got {}",
                path.display(),
                header.checksum,
                computed
            )));
        }
        if payload.len() as u64 != header.uncompressed_size {
            return Err(TrainerError::checkpoint(format!(
                "size mismatch in {}: expected {}, got {}",
                path.display(),
                header.uncompressed_size,
                payload.len()
            )));
        }

        Ok((header, payload))
    }

    /// Reads only the header, without decompressing the payload.
    pub fn read_header(&self, path: &Path) -> Result<CheckpointHeader> {
        let mut reader = self.storage.open_read(path)?;

        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|e| TrainerError::checkpoint_with_source("failed to read header length", e))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if header_len as u64 > reader.size() {
            return Err(TrainerError::checkpoint("checkpoint file truncated: header incomplete"));
        }

        let mut header_bytes = vec![0u8; header_len];
        reader
            .read_exact(&mut header_bytes)
            .map_err(|e| TrainerError::checkpoint_with_source("failed to read header", e))?;

        let header = decode_header(&header_bytes)?;
        validate_header(path, &header)?;
        Ok(header)
    }
}

fn parse_header(path: &Path, data: &[u8]) -> Result<(CheckpointHeader, usize)> {
    let len_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TrainerError::checkpoint("checkpoint file too small"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_bytes = data
        .get(4..4 + header_len)
        .ok_or_else(|| TrainerError::checkpoint("checkpoint file truncated: header incomplete"))?;
    let header = decode_header(header_bytes)?;
    validate_header(path, &header)?;

    Ok((header, 4 + header_len))
}

fn decode_header(bytes: &[u8]) -> Result<CheckpointHeader> {
    bincode::deserialize(bytes)
        .map_err(|e| TrainerError::checkpoint(format!("failed to deserialize header: {e}")))
}

fn validate_header(path: &Path, header: &CheckpointHeader) -> Result<()> {
    if !header.validate_magic() {
        return Err(TrainerError::checkpoint(format!(
            "{} is not a checkpoint file: expected magic {:?}, got {:?}",
            path.display(),
            CheckpointHeader::MAGIC,
            header.magic
        )));
    }
    if !header.validate_version() {
        return Err(TrainerError::schema(format!(
            "{} uses framing version {} but this build reads version {}; \
             re-save it with a matching release",
            path.display(),
            header.version,
            CheckpointHeader::VERSION
        )));
    }
    Ok(())
}

fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| TrainerError::checkpoint(format!("lz4 decompression failed: {e}"))),
        Compression::Zstd => zstd::decode_all(data)
            .map_err(|e| TrainerError::checkpoint(format!("zstd decompression failed: {e}"))),
    }
}
