//! Error taxonomy shared by every sshkit crate.
//!
//! Every public operation either returns its value or exactly one
//! [`SshError`].  Raw engine failures ([`BackendError`]) never escape: the
//! layer that issued the primitive wraps them into the category matching the
//! operation, preserving the engine code and (for SFTP) the POSIX errno.

use crate::errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Categorised sshkit error.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("[{kind}] {message}")]
pub struct SshError {
    pub kind: SshErrorKind,
    pub message: String,
    /// POSIX errno, when the failure maps onto one.
    pub errno: Option<i32>,
    /// Raw (negative) engine return code, if any.
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SshErrorKind {
    /// Transport or handshake failure.
    Connection,
    /// Credentials rejected or every configured method exhausted.
    Authentication,
    /// Invalid call ordering, e.g. method preferences after `startup`.
    Configuration,
    /// Negative return from a channel primitive.
    Channel,
    /// Remote filesystem failure carrying an errno.
    Sftp,
    /// Remote path does not resolve (errno `ENOENT`).
    NotFound,
    /// Declared size not satisfied or premature EOF.
    Transfer,
    /// Operation on a handle whose owner was closed.
    UseAfterClose,
    /// Local filesystem I/O during a transfer.
    Io,
    /// Primitive not offered by the engine in use.
    Unsupported,
}

impl SshErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SshErrorKind::Connection => "ConnectionError",
            SshErrorKind::Authentication => "AuthenticationError",
            SshErrorKind::Configuration => "ConfigurationError",
            SshErrorKind::Channel => "ChannelError",
            SshErrorKind::Sftp => "SftpError",
            SshErrorKind::NotFound => "NotFoundError",
            SshErrorKind::Transfer => "TransferError",
            SshErrorKind::UseAfterClose => "UseAfterCloseError",
            SshErrorKind::Io => "IoError",
            SshErrorKind::Unsupported => "UnsupportedError",
        }
    }
}

impl fmt::Display for SshErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SshResult<T> = Result<T, SshError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SshError {
    pub fn new(kind: SshErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            errno: None,
            code: None,
        }
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Connection, msg)
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Authentication, msg)
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Configuration, msg)
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Channel, msg)
    }

    pub fn sftp(errno: i32, msg: impl Into<String>) -> Self {
        let kind = if errno == errno::ENOENT {
            SshErrorKind::NotFound
        } else {
            SshErrorKind::Sftp
        };
        Self::new(kind, msg).with_errno(errno)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::NotFound, msg).with_errno(errno::ENOENT)
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Transfer, msg)
    }

    pub fn use_after_close(what: &str) -> Self {
        Self::new(
            SshErrorKind::UseAfterClose,
            format!("{} is no longer valid: its owner was closed", what),
        )
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Io, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Unsupported, msg)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SshErrorKind::NotFound
    }
}

impl From<std::io::Error> for SshError {
    fn from(e: std::io::Error) -> Self {
        let err = Self::io(e.to_string());
        match e.raw_os_error() {
            Some(raw) => err.with_errno(raw),
            None => err,
        }
    }
}

impl From<SshError> for String {
    fn from(e: SshError) -> String {
        e.to_string()
    }
}

// ── Engine-level error ───────────────────────────────────────────────

/// Failure reported by an engine primitive before it is categorised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// Negative engine return code.
    pub code: i32,
    pub message: String,
    /// SFTP status code (`SSH_FX_*`) when the failure came from the remote
    /// filesystem protocol.
    pub sftp_status: Option<u32>,
}

pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            sftp_status: None,
        }
    }

    pub fn sftp(status: u32, msg: impl Into<String>) -> Self {
        Self {
            code: errno::ENGINE_SFTP_PROTOCOL,
            message: msg.into(),
            sftp_status: Some(status),
        }
    }

    pub fn would_block() -> Self {
        Self::new(errno::ENGINE_EAGAIN, "operation would block")
    }

    pub fn is_would_block(&self) -> bool {
        self.code == errno::ENGINE_EAGAIN
    }

    /// POSIX errno for this failure: the SFTP status translated, else `EIO`.
    pub fn errno(&self) -> i32 {
        match self.sftp_status {
            Some(status) => errno::from_sftp_status(status),
            None => errno::EIO,
        }
    }

    /// Wrap into the category of the operation that issued the primitive.
    pub fn into_kind(self, kind: SshErrorKind, context: &str) -> SshError {
        let message = format!("{}: {}", context, self.message);
        match kind {
            SshErrorKind::Sftp | SshErrorKind::NotFound => {
                SshError::sftp(self.errno(), message).with_code(self.code)
            }
            _ => SshError::new(kind, message).with_code(self.code),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sftp_status {
            Some(s) => write!(f, "engine error {} (sftp status {}): {}", self.code, s, self.message),
            None => write!(f, "engine error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sftp_no_such_file_maps_to_not_found() {
        let err = BackendError::sftp(errno::SSH_FX_NO_SUCH_FILE, "gone")
            .into_kind(SshErrorKind::Sftp, "realpath '/x'");
        assert_eq!(err.kind, SshErrorKind::NotFound);
        assert_eq!(err.errno, Some(errno::ENOENT));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_sftp_permission_keeps_errno() {
        let err = BackendError::sftp(errno::SSH_FX_PERMISSION_DENIED, "denied")
            .into_kind(SshErrorKind::Sftp, "unlink '/etc/passwd'");
        assert_eq!(err.kind, SshErrorKind::Sftp);
        assert_eq!(err.errno, Some(errno::EACCES));
    }

    #[test]
    fn test_channel_error_keeps_code() {
        let err = BackendError::new(-22, "request denied").into_kind(SshErrorKind::Channel, "exec");
        assert_eq!(err.kind, SshErrorKind::Channel);
        assert_eq!(err.code, Some(-22));
        assert!(err.to_string().contains("ChannelError"));
        assert!(err.to_string().contains("request denied"));
    }

    #[test]
    fn test_error_serialization() {
        let err = SshError::transfer("declared size not satisfied");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"Transfer\""));
        let back: SshError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, SshErrorKind::Transfer);
    }

    #[test]
    fn test_would_block() {
        assert!(BackendError::would_block().is_would_block());
        assert!(!BackendError::new(-7, "socket send").is_would_block());
    }
}
