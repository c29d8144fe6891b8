// ── sshkit-scp / scp module ──────────────────────────────────────────────────

pub mod copy;
pub mod transfer;
pub mod types;

pub use copy::copy_remote;
pub use transfer::{pull, push, write_fully, ChunkSink};
pub use types::*;
