//! Transfer engine for sshkit sessions.
//!
//! Single-file SCP upload ([`push`]) and download ([`pull`]) over a
//! [`sshkit_ssh::Session`], and chunked server-side copy through an
//! [`sshkit_ssh::Sftp`] subsystem ([`copy_remote`]).  Every loop honours
//! short writes from the engine and refuses to report success unless the
//! declared size was moved exactly.

pub mod scp;

pub use scp::*;
