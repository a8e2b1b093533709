// rust/trainer-core/src/checkpoint/format.rs

//! Checkpoint file framing.
//!
//! ```text
//! +--------------------------+
//! | Header Length (4 bytes)  |  <- u32 little-endian
//! +--------------------------+
//! | Header (bincode)         |  <- CheckpointHeader
//! +--------------------------+
//! | Compressed Payload       |  <- bincode CheckpointRecord
//! +--------------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header metadata key holding the record's version tag.
pub const META_VERSION: &str = "version";
/// Header metadata key holding the record's epoch.
pub const META_EPOCH: &str = "epoch";
/// Header metadata key holding the record's global step.
pub const META_GLOBAL_STEP: &str = "global_step";
/// Header metadata key set to "true" for weights-only records.
pub const META_WEIGHTS_ONLY: &str = "weights_only";

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl Compression {
    /// Parses a configured compression name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" => Some(Compression::None),
            "lz4" => Some(Compression::Lz4),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Header for a checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Magic bytes identifying this as a checkpoint file ("TRCK")
    pub magic: [u8; 4],
    /// Framing version number
    pub version: u32,
    pub compression: Compression,
    /// Size of the payload before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed payload
    pub checksum: u64,
    /// Summary of the record (version, epoch, step) readable without
    /// decoding the payload.
    pub metadata: BTreeMap<String, String>,
}

impl CheckpointHeader {
    /// Magic bytes for checkpoint files
    pub const MAGIC: [u8; 4] = *b"TRCK";

    /// Current framing version
    pub const VERSION: u32 = 1;

    pub fn new(
        compression: Compression,
        uncompressed_size: u64,
        checksum: u64,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            compression,
            uncompressed_size,
            checksum,
            metadata,
        }
    }

    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }

    /// Reads a numeric metadata entry.
    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.parse().ok())
    }
}
