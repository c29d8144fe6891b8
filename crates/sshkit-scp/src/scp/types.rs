// ── Types ─────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest chunk the transfer loops will use.
pub const MIN_CHUNK_SIZE: usize = 4096;
/// Largest chunk the transfer loops will use.
pub const MAX_CHUNK_SIZE: usize = 1_048_576;
/// Mode announced for uploads when local permissions are not preserved.
pub const SCP_DEFAULT_MODE: u32 = 0o644;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}
fn default_true() -> bool {
    true
}

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOptions {
    /// Requested chunk size; see [`TransferOptions::effective_chunk_size`].
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_true")]
    pub preserve_times: bool,
    #[serde(default = "default_true")]
    pub preserve_mode: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            preserve_times: true,
            preserve_mode: true,
        }
    }
}

impl TransferOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Chunk size clamped to `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE`.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    /// Local file to remote path over SCP.
    Push,
    /// Remote path to local file over SCP.
    Pull,
    /// Remote path to remote path through the SFTP subsystem.
    RemoteCopy,
}

/// Outcome of one completed transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReport {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    /// Size announced before the data moved.
    pub declared_size: u64,
    pub bytes_transferred: u64,
    /// Permission bits applied to the destination.
    pub mode: u32,
    pub mtime: u64,
    pub atime: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Bytes per second.
    pub average_speed: f64,
}
