//! # sshkit
//!
//! SSH client toolkit over libssh2: sessions and channels, the SFTP
//! subsystem with file and directory handles, the local key agent, and the
//! SCP/SFTP transfer engine.
//!
//! ```no_run
//! use sshkit::{connect, push, SessionConfig, TransferOptions};
//!
//! # fn main() -> sshkit::SshResult<()> {
//! let config = SessionConfig::from_file("session.json")?;
//! let session = connect(&config)?;
//! let report = push(&session, "build/app.tar.gz", "/srv/app.tar.gz", &TransferOptions::default())?;
//! println!("{} bytes in {} ms", report.bytes_transferred, report.duration_ms);
//! session.close(None)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod worker;

pub use config::{authenticate, connect, establish, SessionConfig};
pub use logging::init_logging;
pub use worker::SessionWorker;

pub use sshkit_scp::scp;
pub use sshkit_scp::{
    copy_remote, pull, push, write_fully, ChunkSink, TransferDirection, TransferOptions,
    TransferReport, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, SCP_DEFAULT_MODE,
};
pub use sshkit_ssh::*;
