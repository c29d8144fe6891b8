// ── libssh2 engine (ssh2 crate) ──────────────────────────────────────────────

use crate::sftp::libssh2::Libssh2Sftp;
use crate::ssh::agent::AgentClient;
use crate::ssh::session::Session;
use sshkit_core::backend::*;
use sshkit_core::errno::*;
use sshkit_core::*;
use ssh2::{DisconnectCode, ErrorCode, HashType, KeyboardInteractivePrompt, Prompt, TraceFlags};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;

// ── Error conversion ─────────────────────────────────────────────────────────

pub(crate) fn from_ssh2(e: ssh2::Error) -> BackendError {
    convert(&e)
}

fn convert(e: &ssh2::Error) -> BackendError {
    match e.code() {
        ErrorCode::Session(code) => BackendError::new(code, e.message()),
        ErrorCode::SFTP(status) => BackendError::sftp(status as u32, e.message()),
    }
}

/// Recover the engine error behind an `io::Error` produced by the ssh2
/// stream adapters.
pub(crate) fn from_io(e: io::Error, fallback: i32) -> BackendError {
    if e.kind() == io::ErrorKind::WouldBlock {
        return BackendError::would_block();
    }
    if let Some(inner) = e.get_ref().and_then(|r| r.downcast_ref::<ssh2::Error>()) {
        return convert(inner);
    }
    BackendError::new(fallback, e.to_string())
}

fn method_type(method: MethodType) -> ssh2::MethodType {
    match method {
        MethodType::Kex => ssh2::MethodType::Kex,
        MethodType::HostKey => ssh2::MethodType::HostKey,
        MethodType::CryptCs => ssh2::MethodType::CryptCs,
        MethodType::CryptSc => ssh2::MethodType::CryptSc,
        MethodType::MacCs => ssh2::MethodType::MacCs,
        MethodType::MacSc => ssh2::MethodType::MacSc,
        MethodType::CompCs => ssh2::MethodType::CompCs,
        MethodType::CompSc => ssh2::MethodType::CompSc,
        MethodType::LangCs => ssh2::MethodType::LangCs,
        MethodType::LangSc => ssh2::MethodType::LangSc,
    }
}

struct PromptAdapter<'a>(&'a mut dyn KeyboardInteractive);

impl KeyboardInteractivePrompt for PromptAdapter<'_> {
    fn prompt(&mut self, username: &str, instructions: &str, prompts: &[Prompt]) -> Vec<String> {
        let converted: Vec<InteractivePrompt> = prompts
            .iter()
            .map(|p| InteractivePrompt {
                text: p.text.to_string(),
                echo: p.echo,
            })
            .collect();
        self.0.prompt(username, instructions, &converted)
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

pub struct Libssh2Connection {
    session: ssh2::Session,
}

impl Libssh2Connection {
    pub fn new() -> SshResult<Self> {
        let session = ssh2::Session::new()
            .map_err(|e| from_ssh2(e).into_kind(SshErrorKind::Connection, "create session"))?;
        Ok(Self { session })
    }
}

impl ConnectionBackend for Libssh2Connection {
    fn set_banner(&mut self, banner: &str) -> BackendResult<()> {
        self.session.set_banner(banner).map_err(from_ssh2)
    }

    fn method_pref(&mut self, method: MethodType, prefs: &str) -> BackendResult<()> {
        self.session
            .method_pref(method_type(method), prefs)
            .map_err(from_ssh2)
    }

    fn handshake(&mut self, stream: TcpStream) -> BackendResult<()> {
        self.session.set_tcp_stream(stream);
        self.session.handshake().map_err(from_ssh2)
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    fn set_trace(&mut self, bitmask: i32) {
        self.session.trace(TraceFlags::from_bits_truncate(bitmask));
    }

    fn userauth_password(&mut self, username: &str, password: &str) -> BackendResult<()> {
        self.session
            .userauth_password(username, password)
            .map_err(from_ssh2)
    }

    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        pubkey: Option<&Path>,
        privkey: &Path,
        passphrase: Option<&str>,
    ) -> BackendResult<()> {
        self.session
            .userauth_pubkey_file(username, pubkey, privkey, passphrase)
            .map_err(from_ssh2)
    }

    fn userauth_hostbased_file(
        &mut self,
        username: &str,
        pubkey: &Path,
        privkey: &Path,
        passphrase: Option<&str>,
        hostname: &str,
        local_username: Option<&str>,
    ) -> BackendResult<()> {
        self.session
            .userauth_hostbased_file(username, pubkey, privkey, passphrase, hostname, local_username)
            .map_err(from_ssh2)
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> BackendResult<()> {
        let mut adapter = PromptAdapter(responder);
        self.session
            .userauth_keyboard_interactive(username, &mut adapter)
            .map_err(from_ssh2)
    }

    fn userauth_agent_identity(
        &mut self,
        username: &str,
        identity: &AgentIdentity,
    ) -> BackendResult<()> {
        // libssh2 binds agent state to a session, so the identity is looked
        // up again through this connection's own agent handle.
        let mut agent = self.session.agent().map_err(from_ssh2)?;
        agent.connect().map_err(from_ssh2)?;
        agent.list_identities().map_err(from_ssh2)?;
        let keys = agent.identities().map_err(from_ssh2)?;
        let result = match keys.iter().find(|k| k.blob() == identity.blob.as_slice()) {
            Some(key) => agent.userauth(username, key).map_err(from_ssh2),
            None => Err(BackendError::new(
                ENGINE_AUTHENTICATION_FAILED,
                format!("identity '{}' no longer held by the agent", identity.comment),
            )),
        };
        let _ = agent.disconnect();
        result
    }

    fn authenticated(&self) -> bool {
        self.session.authenticated()
    }

    fn auth_methods(&mut self, username: &str) -> BackendResult<String> {
        self.session
            .auth_methods(username)
            .map(str::to_string)
            .map_err(from_ssh2)
    }

    fn methods(&self, method: MethodType) -> Option<String> {
        self.session.methods(method_type(method)).map(str::to_string)
    }

    fn host_key_hash(&self, kind: HashKind) -> Option<Vec<u8>> {
        let hash = match kind {
            HashKind::Md5 => HashType::Md5,
            HashKind::Sha1 => HashType::Sha1,
            HashKind::Sha256 => HashType::Sha256,
        };
        self.session.host_key_hash(hash).map(<[u8]>::to_vec)
    }

    fn last_error(&self) -> (i32, String) {
        match ssh2::Error::last_session_error(&self.session) {
            Some(e) => {
                let code = match e.code() {
                    ErrorCode::Session(c) => c,
                    ErrorCode::SFTP(_) => ENGINE_SFTP_PROTOCOL,
                };
                (code, e.message().to_string())
            }
            None => (0, String::new()),
        }
    }

    fn channel_session(&mut self) -> BackendResult<Box<dyn ChannelBackend>> {
        let channel = self.session.channel_session().map_err(from_ssh2)?;
        Ok(Box::new(Libssh2Channel(channel)))
    }

    fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> BackendResult<Box<dyn ChannelBackend>> {
        let channel = self
            .session
            .channel_direct_tcpip(host, port, source)
            .map_err(from_ssh2)?;
        Ok(Box::new(Libssh2Channel(channel)))
    }

    fn channel_forward_listen(
        &mut self,
        port: u16,
        host: Option<&str>,
        queue_maxsize: Option<u32>,
    ) -> BackendResult<(Box<dyn ListenerBackend>, u16)> {
        let (listener, bound) = self
            .session
            .channel_forward_listen(port, host, queue_maxsize)
            .map_err(from_ssh2)?;
        Ok((Box::new(Libssh2Listener(listener)), bound))
    }

    fn scp_send(&mut self, path: &Path, header: &ScpHeader) -> BackendResult<Box<dyn ChannelBackend>> {
        let channel = self
            .session
            .scp_send(
                path,
                (header.mode & 0o7777) as i32,
                header.size,
                Some((header.mtime, header.atime)),
            )
            .map_err(from_ssh2)?;
        Ok(Box::new(Libssh2Channel(channel)))
    }

    fn scp_recv(&mut self, path: &Path) -> BackendResult<(Box<dyn ChannelBackend>, ScpHeader)> {
        let (channel, stat) = self.session.scp_recv(path).map_err(from_ssh2)?;
        // The SCP header carries no times here; a best-effort SFTP stat of
        // the same path fills them in.
        let times = self
            .session
            .sftp()
            .and_then(|sftp| sftp.stat(path))
            .ok()
            .map(|s| (s.mtime.unwrap_or(0), s.atime.or(s.mtime).unwrap_or(0)));
        let (mtime, atime) = times.unwrap_or((0, 0));
        let header = ScpHeader {
            mode: stat.mode() as u32,
            size: stat.size(),
            mtime,
            atime,
        };
        Ok((Box::new(Libssh2Channel(channel)), header))
    }

    fn sftp(&mut self) -> BackendResult<Box<dyn SftpBackend>> {
        let sftp = self.session.sftp().map_err(from_ssh2)?;
        Ok(Box::new(Libssh2Sftp::new(sftp)))
    }

    fn disconnect(&mut self, description: &str) -> BackendResult<()> {
        self.session
            .disconnect(Some(DisconnectCode::ByApplication), description, None)
            .map_err(from_ssh2)
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

struct Libssh2Channel(ssh2::Channel);

impl ChannelBackend for Libssh2Channel {
    fn exec(&mut self, command: &str) -> BackendResult<()> {
        self.0.exec(command).map_err(from_ssh2)
    }

    fn shell(&mut self) -> BackendResult<()> {
        self.0.shell().map_err(from_ssh2)
    }

    fn request_pty(&mut self, term: &str, size: Option<PtySize>) -> BackendResult<()> {
        let dim = size.map(|s| (s.width, s.height, s.pixel_width, s.pixel_height));
        self.0.request_pty(term, None, dim).map_err(from_ssh2)
    }

    fn request_pty_size(&mut self, size: PtySize) -> BackendResult<()> {
        let px = |v: u32| if v == 0 { None } else { Some(v) };
        self.0
            .request_pty_size(size.width, size.height, px(size.pixel_width), px(size.pixel_height))
            .map_err(from_ssh2)
    }

    fn setenv(&mut self, name: &str, value: &str) -> BackendResult<()> {
        self.0.setenv(name, value).map_err(from_ssh2)
    }

    fn x11_req(&mut self, _request: &X11Request) -> BackendResult<()> {
        Err(BackendError::new(
            ENGINE_METHOD_NOT_SUPPORTED,
            "x11 forwarding is not exposed by the libssh2 binding",
        ))
    }

    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> BackendResult<usize> {
        let result = if stream_id == 0 {
            self.0.read(buf)
        } else {
            self.0.stream(stream_id).read(buf)
        };
        result.map_err(|e| from_io(e, ENGINE_SOCKET_RECV))
    }

    fn write(&mut self, buf: &[u8]) -> BackendResult<usize> {
        self.0.write(buf).map_err(|e| from_io(e, ENGINE_SOCKET_SEND))
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.0.flush().map_err(|e| from_io(e, ENGINE_SOCKET_SEND))
    }

    fn send_eof(&mut self) -> BackendResult<()> {
        self.0.send_eof().map_err(from_ssh2)
    }

    fn wait_eof(&mut self) -> BackendResult<()> {
        self.0.wait_eof().map_err(from_ssh2)
    }

    fn close(&mut self) -> BackendResult<()> {
        self.0.close().map_err(from_ssh2)
    }

    fn wait_close(&mut self) -> BackendResult<()> {
        self.0.wait_close().map_err(from_ssh2)
    }

    fn eof(&self) -> bool {
        self.0.eof()
    }

    fn poll_readable(&mut self, _extended: bool) -> BackendResult<bool> {
        // The window's pending byte count covers every stream.
        Ok(self.0.read_window().available > 0)
    }

    fn read_window(&self) -> WindowStatus {
        let w = self.0.read_window();
        WindowStatus {
            available: w.available,
            initial: w.window_size_initial,
        }
    }

    fn write_window(&self) -> WindowStatus {
        let w = self.0.write_window();
        WindowStatus {
            available: w.remaining,
            initial: w.window_size_initial,
        }
    }

    fn exit_status(&self) -> BackendResult<i32> {
        self.0.exit_status().map_err(from_ssh2)
    }
}

struct Libssh2Listener(ssh2::Listener);

impl ListenerBackend for Libssh2Listener {
    fn accept(&mut self) -> BackendResult<Box<dyn ChannelBackend>> {
        let channel = self.0.accept().map_err(from_ssh2)?;
        Ok(Box::new(Libssh2Channel(channel)))
    }
}

// ── Agent ────────────────────────────────────────────────────────────────────

struct Libssh2Agent {
    agent: ssh2::Agent,
}

impl AgentBackend for Libssh2Agent {
    fn connect(&mut self) -> BackendResult<()> {
        self.agent.connect().map_err(from_ssh2)
    }

    fn disconnect(&mut self) -> BackendResult<()> {
        self.agent.disconnect().map_err(from_ssh2)
    }

    fn list_identities(&mut self) -> BackendResult<Vec<AgentIdentity>> {
        self.agent.list_identities().map_err(from_ssh2)?;
        let keys = self.agent.identities().map_err(from_ssh2)?;
        Ok(keys
            .iter()
            .map(|k| AgentIdentity {
                blob: k.blob().to_vec(),
                comment: k.comment().to_string(),
            })
            .collect())
    }
}

// ── Constructors ─────────────────────────────────────────────────────────────

impl Session {
    /// Session driven by libssh2.
    pub fn libssh2() -> SshResult<Self> {
        Ok(Session::new(Box::new(Libssh2Connection::new()?)))
    }
}

impl AgentClient {
    /// Client for the agent named by the environment (`SSH_AUTH_SOCK`, or
    /// Pageant on Windows).
    pub fn system() -> SshResult<Self> {
        let session = ssh2::Session::new()
            .map_err(|e| from_ssh2(e).into_kind(SshErrorKind::Connection, "create agent session"))?;
        let agent = session
            .agent()
            .map_err(|e| from_ssh2(e).into_kind(SshErrorKind::Connection, "create agent"))?;
        Ok(AgentClient::new(Box::new(Libssh2Agent { agent })))
    }
}
