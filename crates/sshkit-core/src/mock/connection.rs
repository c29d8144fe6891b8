// ── Mock connection and agent ────────────────────────────────────────────────

use super::channel::{scp_header, ChannelKind, MockChannel, MockListener};
use super::fs::{normalize, NodeKind};
use super::sftp::MockSftp;
use super::{lock, Shared};
use crate::backend::*;
use crate::errno::*;
use crate::error::{BackendError, BackendResult};
use crate::types::*;
use std::collections::HashMap;
use std::net::TcpStream;
use std::path::Path;

fn default_method(method: MethodType) -> Option<&'static str> {
    match method {
        MethodType::Kex => Some("curve25519-sha256"),
        MethodType::HostKey => Some("ssh-ed25519"),
        MethodType::CryptCs | MethodType::CryptSc => Some("aes128-ctr"),
        MethodType::MacCs | MethodType::MacSc => Some("hmac-sha2-256"),
        MethodType::CompCs | MethodType::CompSc => Some("none"),
        MethodType::LangCs | MethodType::LangSc => None,
    }
}

/// One client connection to a [`super::MockRemote`].
pub struct MockConnection {
    state: Shared,
    stream: Option<TcpStream>,
    banner: String,
    prefs: HashMap<MethodType, String>,
    authenticated: bool,
    failures: u32,
    last_error: (i32, String),
    blocking: bool,
    trace: i32,
}

impl MockConnection {
    pub(crate) fn new(state: Shared) -> Self {
        Self {
            state,
            stream: None,
            banner: String::new(),
            prefs: HashMap::new(),
            authenticated: false,
            failures: 0,
            last_error: (0, String::new()),
            blocking: true,
            trace: 0,
        }
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn trace_mask(&self) -> i32 {
        self.trace
    }

    fn fail<T>(&mut self, err: BackendError) -> BackendResult<T> {
        self.last_error = (err.code, err.message.clone());
        Err(err)
    }

    fn require_connected(&mut self) -> BackendResult<()> {
        if self.stream.is_none() {
            return self.fail(BackendError::new(ENGINE_SOCKET_SEND, "not connected"));
        }
        Ok(())
    }

    fn auth_result(&mut self, accepted: bool, method: &str) -> BackendResult<()> {
        self.require_connected()?;
        if accepted {
            self.authenticated = true;
            return Ok(());
        }
        self.failures += 1;
        let max = lock(&self.state).max_auth_attempts;
        if self.failures >= max {
            self.stream = None;
            return self.fail(BackendError::new(
                ENGINE_SOCKET_DISCONNECT,
                "too many authentication failures",
            ));
        }
        self.fail(BackendError::new(
            ENGINE_AUTHENTICATION_FAILED,
            format!("{} authentication failed", method),
        ))
    }

    fn require_authenticated(&mut self) -> BackendResult<()> {
        self.require_connected()?;
        if !self.authenticated {
            return self.fail(BackendError::new(ENGINE_INVAL, "not authenticated"));
        }
        Ok(())
    }
}

impl ConnectionBackend for MockConnection {
    fn set_banner(&mut self, banner: &str) -> BackendResult<()> {
        self.banner = banner.to_string();
        Ok(())
    }

    fn method_pref(&mut self, method: MethodType, prefs: &str) -> BackendResult<()> {
        if prefs.trim().is_empty() {
            return self.fail(BackendError::new(
                ENGINE_METHOD_NOT_SUPPORTED,
                "empty method preference",
            ));
        }
        self.prefs.insert(method, prefs.to_string());
        Ok(())
    }

    fn handshake(&mut self, stream: TcpStream) -> BackendResult<()> {
        if lock(&self.state).handshake_fails {
            return self.fail(BackendError::new(
                ENGINE_KEX_FAILURE,
                "unable to exchange encryption keys",
            ));
        }
        self.stream = Some(stream);
        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    fn set_trace(&mut self, bitmask: i32) {
        self.trace = bitmask;
    }

    fn userauth_password(&mut self, username: &str, password: &str) -> BackendResult<()> {
        let ok = lock(&self.state).passwords.get(username).map(String::as_str) == Some(password);
        self.auth_result(ok, "password")
    }

    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        _pubkey: Option<&Path>,
        privkey: &Path,
        _passphrase: Option<&str>,
    ) -> BackendResult<()> {
        let ok = lock(&self.state)
            .pubkeys
            .get(username)
            .map(|keys| keys.iter().any(|k| k == privkey))
            .unwrap_or(false);
        self.auth_result(ok, "publickey")
    }

    fn userauth_hostbased_file(
        &mut self,
        username: &str,
        _pubkey: &Path,
        _privkey: &Path,
        _passphrase: Option<&str>,
        hostname: &str,
        _local_username: Option<&str>,
    ) -> BackendResult<()> {
        let ok = lock(&self.state)
            .hostbased
            .contains(&(username.to_string(), hostname.to_string()));
        self.auth_result(ok, "hostbased")
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> BackendResult<()> {
        self.require_connected()?;
        let prompts = [InteractivePrompt {
            text: "Password: ".into(),
            echo: false,
        }];
        let answers = responder.prompt(username, "", &prompts);
        let expected = lock(&self.state).passwords.get(username).cloned();
        let ok = match (answers.first(), expected) {
            (Some(given), Some(expected)) => *given == expected,
            _ => false,
        };
        self.auth_result(ok, "keyboard-interactive")
    }

    fn userauth_agent_identity(
        &mut self,
        username: &str,
        identity: &AgentIdentity,
    ) -> BackendResult<()> {
        let ok = {
            let st = lock(&self.state);
            st.agent_available
                && st.agent_keys.iter().any(|k| k.blob == identity.blob)
                && st
                    .authorized_blobs
                    .get(username)
                    .map(|blobs| blobs.contains(&identity.blob))
                    .unwrap_or(false)
        };
        self.auth_result(ok, "publickey (agent)")
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn auth_methods(&mut self, username: &str) -> BackendResult<String> {
        self.require_connected()?;
        let st = lock(&self.state);
        let mut methods = vec!["publickey"];
        if st.passwords.contains_key(username) {
            methods.push("password");
            methods.push("keyboard-interactive");
        }
        if st.hostbased.iter().any(|(u, _)| u == username) {
            methods.push("hostbased");
        }
        Ok(methods.join(","))
    }

    fn methods(&self, method: MethodType) -> Option<String> {
        self.stream.as_ref()?;
        match self.prefs.get(&method) {
            Some(list) => list.split(',').next().map(|s| s.trim().to_string()),
            None => default_method(method).map(str::to_string),
        }
    }

    fn host_key_hash(&self, kind: HashKind) -> Option<Vec<u8>> {
        self.stream.as_ref()?;
        let len = match kind {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        };
        Some((0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(len as u8)).collect())
    }

    fn last_error(&self) -> (i32, String) {
        self.last_error.clone()
    }

    fn channel_session(&mut self) -> BackendResult<Box<dyn ChannelBackend>> {
        self.require_authenticated()?;
        Ok(Box::new(MockChannel::new(self.state.clone(), ChannelKind::Session)))
    }

    fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        _source: Option<(&str, u16)>,
    ) -> BackendResult<Box<dyn ChannelBackend>> {
        self.require_authenticated()?;
        if host.is_empty() || port == 0 {
            return self.fail(BackendError::new(
                ENGINE_CHANNEL_FAILURE,
                "administratively prohibited: open failed",
            ));
        }
        Ok(Box::new(MockChannel::new(self.state.clone(), ChannelKind::Tunnel)))
    }

    fn channel_forward_listen(
        &mut self,
        port: u16,
        _host: Option<&str>,
        _queue_maxsize: Option<u32>,
    ) -> BackendResult<(Box<dyn ListenerBackend>, u16)> {
        self.require_authenticated()?;
        let bound = if port == 0 {
            let mut st = lock(&self.state);
            st.next_port += 1;
            st.next_port
        } else {
            port
        };
        let listener = MockListener {
            state: self.state.clone(),
        };
        Ok((Box::new(listener), bound))
    }

    fn scp_send(&mut self, path: &Path, header: &ScpHeader) -> BackendResult<Box<dyn ChannelBackend>> {
        self.require_authenticated()?;
        let target = normalize(path);
        let parent_is_dir = {
            let st = lock(&self.state);
            let parent = super::fs::parent_of(&target);
            matches!(st.fs.get(&parent).map(|n| &n.kind), Some(NodeKind::Dir))
        };
        if !parent_is_dir {
            return self.fail(BackendError::new(
                ENGINE_SCP_PROTOCOL,
                format!("scp: {}: No such file or directory", path.display()),
            ));
        }
        Ok(Box::new(MockChannel::new(
            self.state.clone(),
            ChannelKind::ScpSink {
                path: target,
                header: *header,
            },
        )))
    }

    fn scp_recv(&mut self, path: &Path) -> BackendResult<(Box<dyn ChannelBackend>, ScpHeader)> {
        self.require_authenticated()?;
        let target = normalize(path);
        let found = {
            let st = lock(&self.state);
            match st.fs.resolve(&target).ok().and_then(|p| st.fs.get(&p).cloned()) {
                Some(node) => match node.kind {
                    NodeKind::File(content) => Some((content, scp_header(&node.stat))),
                    _ => None,
                },
                None => None,
            }
        };
        match found {
            Some((content, header)) => {
                let channel = MockChannel::source(self.state.clone(), &content);
                Ok((Box::new(channel), header))
            }
            None => self.fail(BackendError::new(
                ENGINE_SCP_PROTOCOL,
                format!("scp: {}: not a regular file", path.display()),
            )),
        }
    }

    fn sftp(&mut self) -> BackendResult<Box<dyn SftpBackend>> {
        self.require_authenticated()?;
        Ok(Box::new(MockSftp::new(self.state.clone())))
    }

    fn disconnect(&mut self, _description: &str) -> BackendResult<()> {
        self.stream = None;
        self.authenticated = false;
        Ok(())
    }
}

// ── Agent ────────────────────────────────────────────────────────────────────

/// Local agent process as seen through its socket.
pub struct MockAgent {
    state: Shared,
    connected: bool,
}

impl MockAgent {
    pub(crate) fn new(state: Shared) -> Self {
        Self {
            state,
            connected: false,
        }
    }
}

impl AgentBackend for MockAgent {
    fn connect(&mut self) -> BackendResult<()> {
        if !lock(&self.state).agent_available {
            return Err(BackendError::new(
                ENGINE_AGENT_PROTOCOL,
                "unable to connect to agent pipe",
            ));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> BackendResult<()> {
        self.connected = false;
        Ok(())
    }

    fn list_identities(&mut self) -> BackendResult<Vec<AgentIdentity>> {
        if !self.connected {
            return Err(BackendError::new(ENGINE_AGENT_PROTOCOL, "agent not connected"));
        }
        Ok(lock(&self.state).agent_keys.clone())
    }
}
