//! Boundary to the protocol engine.
//!
//! The handshake, authentication, channel multiplexing and SFTP wire work is
//! done by an external engine.  These traits list exactly the primitives the
//! session layer consumes; every call answers with a [`BackendResult`] whose
//! error carries the engine's raw return code.
//!
//! Implementations are driven from one thread at a time: the session layer
//! serialises every call behind the owning session's lock.

use crate::error::BackendResult;
use crate::types::*;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

/// Answers keyboard-interactive challenges.
pub trait KeyboardInteractive {
    fn prompt(
        &mut self,
        username: &str,
        instructions: &str,
        prompts: &[InteractivePrompt],
    ) -> Vec<String>;
}

/// Replies with the same secret to every prompt.
pub struct StaticResponder(pub String);

impl KeyboardInteractive for StaticResponder {
    fn prompt(&mut self, _: &str, _: &str, prompts: &[InteractivePrompt]) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

pub trait ConnectionBackend: Send {
    fn set_banner(&mut self, banner: &str) -> BackendResult<()>;
    fn method_pref(&mut self, method: MethodType, prefs: &str) -> BackendResult<()>;
    fn handshake(&mut self, stream: TcpStream) -> BackendResult<()>;
    fn set_blocking(&mut self, blocking: bool);
    fn set_trace(&mut self, bitmask: i32);

    fn userauth_password(&mut self, username: &str, password: &str) -> BackendResult<()>;
    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        pubkey: Option<&Path>,
        privkey: &Path,
        passphrase: Option<&str>,
    ) -> BackendResult<()>;
    fn userauth_hostbased_file(
        &mut self,
        username: &str,
        pubkey: &Path,
        privkey: &Path,
        passphrase: Option<&str>,
        hostname: &str,
        local_username: Option<&str>,
    ) -> BackendResult<()>;
    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> BackendResult<()>;
    /// Authenticate with one identity held by the local agent.
    fn userauth_agent_identity(
        &mut self,
        username: &str,
        identity: &AgentIdentity,
    ) -> BackendResult<()>;
    fn authenticated(&self) -> bool;
    /// Comma-separated method list advertised by the server.
    fn auth_methods(&mut self, username: &str) -> BackendResult<String>;

    fn methods(&self, method: MethodType) -> Option<String>;
    fn host_key_hash(&self, kind: HashKind) -> Option<Vec<u8>>;
    /// `(code, message)` of the most recent engine failure; `(0, "")` if none.
    fn last_error(&self) -> (i32, String);

    fn channel_session(&mut self) -> BackendResult<Box<dyn ChannelBackend>>;
    fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> BackendResult<Box<dyn ChannelBackend>>;
    /// Returns the listener and the port actually bound.
    fn channel_forward_listen(
        &mut self,
        port: u16,
        host: Option<&str>,
        queue_maxsize: Option<u32>,
    ) -> BackendResult<(Box<dyn ListenerBackend>, u16)>;
    fn scp_send(&mut self, path: &Path, header: &ScpHeader) -> BackendResult<Box<dyn ChannelBackend>>;
    fn scp_recv(&mut self, path: &Path) -> BackendResult<(Box<dyn ChannelBackend>, ScpHeader)>;
    fn sftp(&mut self) -> BackendResult<Box<dyn SftpBackend>>;

    fn disconnect(&mut self, description: &str) -> BackendResult<()>;
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub trait ChannelBackend: Send {
    fn exec(&mut self, command: &str) -> BackendResult<()>;
    fn shell(&mut self) -> BackendResult<()>;
    fn request_pty(&mut self, term: &str, size: Option<PtySize>) -> BackendResult<()>;
    fn request_pty_size(&mut self, size: PtySize) -> BackendResult<()>;
    fn setenv(&mut self, name: &str, value: &str) -> BackendResult<()>;
    fn x11_req(&mut self, request: &X11Request) -> BackendResult<()>;

    /// Read from stream 0 (`stream_id == 0`) or an extended stream.
    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> BackendResult<usize>;
    /// May accept fewer bytes than offered, or none at all.
    fn write(&mut self, buf: &[u8]) -> BackendResult<usize>;
    fn flush(&mut self) -> BackendResult<()>;

    fn send_eof(&mut self) -> BackendResult<()>;
    fn wait_eof(&mut self) -> BackendResult<()>;
    fn close(&mut self) -> BackendResult<()>;
    fn wait_close(&mut self) -> BackendResult<()>;
    fn eof(&self) -> bool;

    fn poll_readable(&mut self, extended: bool) -> BackendResult<bool>;
    fn read_window(&self) -> WindowStatus;
    fn write_window(&self) -> WindowStatus;
    fn exit_status(&self) -> BackendResult<i32>;
}

pub trait ListenerBackend: Send {
    fn accept(&mut self) -> BackendResult<Box<dyn ChannelBackend>>;
}

// ── SFTP ─────────────────────────────────────────────────────────────────────

pub trait SftpBackend: Send {
    fn open(
        &mut self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> BackendResult<Box<dyn SftpFileBackend>>;
    fn opendir(&mut self, path: &Path) -> BackendResult<Box<dyn SftpDirBackend>>;
    fn unlink(&mut self, path: &Path) -> BackendResult<()>;
    /// Plain rename; refuses when `dst` exists on most servers.
    fn rename(&mut self, src: &Path, dst: &Path) -> BackendResult<()>;
    fn mkdir(&mut self, path: &Path, mode: u32) -> BackendResult<()>;
    fn rmdir(&mut self, path: &Path) -> BackendResult<()>;
    fn realpath(&mut self, path: &Path) -> BackendResult<PathBuf>;
    fn readlink(&mut self, path: &Path) -> BackendResult<PathBuf>;
    fn symlink(&mut self, path: &Path, target: &Path) -> BackendResult<()>;
    fn stat(&mut self, path: &Path) -> BackendResult<StatRecord>;
    fn lstat(&mut self, path: &Path) -> BackendResult<StatRecord>;
    fn setstat(&mut self, path: &Path, update: &StatUpdate) -> BackendResult<()>;
    fn shutdown(&mut self) -> BackendResult<()>;
}

pub trait SftpFileBackend: Send {
    fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize>;
    fn write(&mut self, buf: &[u8]) -> BackendResult<usize>;
    fn seek(&mut self, offset: u64) -> BackendResult<()>;
    fn fstat(&mut self) -> BackendResult<StatRecord>;
    fn close(&mut self) -> BackendResult<()>;
}

pub trait SftpDirBackend: Send {
    /// `Ok(None)` once the listing is exhausted.
    fn readdir(&mut self) -> BackendResult<Option<(String, StatRecord)>>;
    fn close(&mut self) -> BackendResult<()>;
}

// ── Agent ────────────────────────────────────────────────────────────────────

pub trait AgentBackend: Send {
    fn connect(&mut self) -> BackendResult<()>;
    fn disconnect(&mut self) -> BackendResult<()>;
    fn list_identities(&mut self) -> BackendResult<Vec<AgentIdentity>>;
}
