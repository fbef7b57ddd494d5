// common.rs — Errors, logging setup and checksums shared by the tools and the runtime

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// Everything that can go wrong loading, building or writing a BSP.
#[derive(Debug, Error)]
pub enum BspError {
    #[error("{path}: not a BSP file (magic {magic:#010x})")]
    BadMagic { path: String, magic: i32 },

    #[error("{path}: has wrong version number ({found} should be {expected})")]
    BadVersion { path: String, found: i32, expected: i32 },

    #[error("{path}: file too short ({len} bytes)")]
    Truncated { path: String, len: usize },

    #[error("lump {lump} out of file bounds (ofs {ofs}, len {len})")]
    LumpBounds { lump: &'static str, ofs: i32, len: i32 },

    #[error("lump {lump}: funny lump size {len} (record size {record})")]
    FunnyLumpSize { lump: &'static str, len: usize, record: usize },

    #[error("{table}: more than {max} entries")]
    LimitExceeded { table: &'static str, max: usize },

    #[error("{what} index {index} out of range ({count} entries)")]
    BadIndex { what: &'static str, index: i32, count: usize },

    #[error("map has no world model")]
    NoWorldModel,

    #[error("bad headnode {0}")]
    BadHeadnode(i32),

    #[error("**** leaked ****")]
    Leaked,

    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BspError>;

// ============================================================
// Logging
// ============================================================

/// Install the process-wide logger. `verbose` raises the default filter to
/// debug; `RUST_LOG` still overrides either way. Safe to call twice.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}

// ============================================================
// Checksums
// ============================================================

const CRC_CALC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum of a whole map file, as reported on load so client and server
/// can verify they run against the same geometry.
pub fn block_checksum(data: &[u8]) -> u32 {
    CRC_CALC.checksum(data)
}
