// ── Session ──────────────────────────────────────────────────────────────────

use crate::sftp::Sftp;
use crate::ssh::agent::AgentClient;
use crate::ssh::channel::Channel;
use crate::ssh::listener::Listener;
use crate::ssh::registry::{lock, SessionInner, SharedInner, WeakInner};
use log::{info, warn};
use sshkit_core::backend::{ConnectionBackend, KeyboardInteractive};
use sshkit_core::trace::{Component, TraceHook};
use sshkit_core::*;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One logical connection to a remote host.
///
/// Cloning yields another handle to the same connection; the connection is
/// torn down by [`Session::close`] or when the last handle is dropped.  All
/// engine calls for the session, its channels and its SFTP subsystems are
/// serialised through one lock.
#[derive(Clone)]
pub struct Session {
    inner: SharedInner,
    id: String,
}

impl Session {
    pub fn new(backend: Box<dyn ConnectionBackend>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            inner: Arc::new(Mutex::new(SessionInner::new(id.clone(), backend))),
            id,
        }
    }

    /// Install a hook observing every operation of this session and of all
    /// handles derived from it.
    pub fn with_hook(self, hook: Arc<dyn TraceHook>) -> Self {
        if let Ok(mut inner) = lock(&self.inner) {
            inner.hook = Some(hook);
        }
        self
    }

    pub fn set_hook(&self, hook: Option<Arc<dyn TraceHook>>) -> SshResult<()> {
        lock(&self.inner)?.hook = hook;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner)
            .map(|inner| inner.state)
            .unwrap_or(SessionState::Closed)
    }

    pub(crate) fn downgrade(&self) -> WeakInner {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn owns(&self, weak: &WeakInner) -> bool {
        std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.inner))
    }

    fn run<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SessionInner) -> SshResult<T>,
    ) -> SshResult<T> {
        let mut inner = lock(&self.inner)?;
        let result = f(&mut inner);
        inner.emit(Component::Session, operation, &result);
        result
    }

    // ── Pre-authentication setup ────────────────────────────────────────

    /// Perform the transport handshake over `stream`.  Allowed exactly once.
    pub fn startup(&self, stream: TcpStream) -> SshResult<()> {
        self.run("startup", |inner| {
            inner.ensure_live("session")?;
            if inner.handshake_attempted {
                return Err(SshError::configuration("startup may only be called once per session"));
            }
            inner.handshake_attempted = true;
            inner
                .conn
                .handshake(stream)
                .map_err(|e| e.into_kind(SshErrorKind::Connection, "handshake"))?;
            inner.state = SessionState::Connected;
            info!("[{}] handshake completed", inner.id);
            Ok(())
        })
    }

    /// Identification banner; `None` restores the default.
    pub fn set_banner(&self, banner: Option<&str>) -> SshResult<()> {
        self.run("set_banner", |inner| {
            inner.ensure_live("session")?;
            inner
                .conn
                .set_banner(banner.unwrap_or(DEFAULT_BANNER))
                .map_err(|e| e.into_kind(SshErrorKind::Configuration, "set banner"))
        })
    }

    /// Comma-separated algorithm preference for one slot.  Must precede
    /// [`Session::startup`].
    pub fn set_method_pref(&self, method: MethodType, prefs: &str) -> SshResult<()> {
        self.run("set_method_pref", |inner| {
            inner.ensure_live("session")?;
            if inner.handshake_attempted || inner.state != SessionState::Created {
                return Err(SshError::configuration(
                    "method preferences must be set before startup",
                ));
            }
            inner
                .conn
                .method_pref(method, prefs)
                .map_err(|e| e.into_kind(SshErrorKind::Configuration, "method preference"))
        })
    }

    pub fn set_blocking(&self, blocking: bool) -> SshResult<()> {
        self.run("set_blocking", |inner| {
            inner.ensure_live("session")?;
            inner.conn.set_blocking(blocking);
            Ok(())
        })
    }

    /// Forward an engine trace bitmask.
    pub fn set_trace(&self, bitmask: i32) -> SshResult<()> {
        self.run("set_trace", |inner| {
            inner.ensure_live("session")?;
            inner.conn.set_trace(bitmask);
            Ok(())
        })
    }

    // ── Authentication ──────────────────────────────────────────────────

    fn authenticate(
        &self,
        operation: &'static str,
        username: &str,
        f: impl FnOnce(&mut dyn ConnectionBackend) -> SshResult<()>,
    ) -> SshResult<()> {
        self.run(operation, |inner| {
            inner.require_connected()?;
            f(inner.conn.as_mut())?;
            inner.state = SessionState::Authenticated;
            info!("[{}] authenticated as {} ({})", inner.id, username, operation);
            Ok(())
        })
    }

    pub fn userauth_password(&self, username: &str, password: &str) -> SshResult<()> {
        self.authenticate("userauth_password", username, |conn| {
            conn.userauth_password(username, password)
                .map_err(|e| e.into_kind(SshErrorKind::Authentication, "password authentication"))
        })
    }

    pub fn userauth_pubkey_file(
        &self,
        username: &str,
        pubkey: Option<&Path>,
        privkey: &Path,
        passphrase: Option<&str>,
    ) -> SshResult<()> {
        self.authenticate("userauth_pubkey_file", username, |conn| {
            conn.userauth_pubkey_file(username, pubkey, privkey, passphrase)
                .map_err(|e| e.into_kind(SshErrorKind::Authentication, "public key authentication"))
        })
    }

    pub fn userauth_hostbased_file(
        &self,
        username: &str,
        pubkey: &Path,
        privkey: &Path,
        passphrase: Option<&str>,
        hostname: &str,
        local_username: Option<&str>,
    ) -> SshResult<()> {
        self.authenticate("userauth_hostbased_file", username, |conn| {
            conn.userauth_hostbased_file(
                username,
                pubkey,
                privkey,
                passphrase,
                hostname,
                local_username,
            )
            .map_err(|e| e.into_kind(SshErrorKind::Authentication, "host-based authentication"))
        })
    }

    pub fn userauth_keyboard_interactive(
        &self,
        username: &str,
        responder: &mut dyn KeyboardInteractive,
    ) -> SshResult<()> {
        self.authenticate("userauth_keyboard_interactive", username, |conn| {
            conn.userauth_keyboard_interactive(username, responder)
                .map_err(|e| {
                    e.into_kind(SshErrorKind::Authentication, "keyboard-interactive authentication")
                })
        })
    }

    /// Offer each identity the agent listed until one is accepted.  The
    /// session keeps no reference to `agent`.
    pub fn userauth_agent(&self, username: &str, agent: &AgentClient) -> SshResult<()> {
        self.authenticate("userauth_agent", username, |conn| {
            if agent.state() != AgentState::Connected {
                return Err(SshError::authentication("agent is not connected"));
            }
            let identities = agent.identities();
            if identities.is_empty() {
                return Err(SshError::authentication("agent offered no identities"));
            }
            let mut last = None;
            for identity in identities {
                match conn.userauth_agent_identity(username, identity) {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e),
                }
            }
            Err(match last {
                Some(e) => e.into_kind(SshErrorKind::Authentication, "agent authentication"),
                None => SshError::authentication("agent authentication failed"),
            })
        })
    }

    pub fn authenticated(&self) -> bool {
        lock(&self.inner)
            .map(|inner| inner.state == SessionState::Authenticated && inner.conn.authenticated())
            .unwrap_or(false)
    }

    /// Authentication methods the server advertises for `username`.
    pub fn auth_methods(&self, username: &str) -> SshResult<Vec<String>> {
        self.run("auth_methods", |inner| {
            inner.require_connected()?;
            let list = inner
                .conn
                .auth_methods(username)
                .map_err(|e| e.into_kind(SshErrorKind::Connection, "auth methods"))?;
            Ok(list
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect())
        })
    }

    // ── Negotiation results ─────────────────────────────────────────────

    pub fn methods(&self) -> SshResult<NegotiatedMethods> {
        self.run("methods", |inner| {
            inner.require_connected()?;
            let chosen = MethodType::ALL
                .iter()
                .filter_map(|m| inner.conn.methods(*m).map(|algo| (*m, algo)));
            Ok(group_methods(chosen.collect::<Vec<_>>()))
        })
    }

    pub fn method(&self, method: MethodType) -> SshResult<Option<String>> {
        self.run("method", |inner| {
            inner.require_connected()?;
            Ok(inner.conn.methods(method))
        })
    }

    pub fn host_key_hash(&self, kind: HashKind) -> SshResult<Vec<u8>> {
        self.run("host_key_hash", |inner| {
            inner.require_connected()?;
            inner
                .conn
                .host_key_hash(kind)
                .ok_or_else(|| SshError::unsupported(format!("{:?} host key digest unavailable", kind)))
        })
    }

    /// `(code, message)` of the engine's most recent failure.
    pub fn last_error(&self) -> (i32, String) {
        lock(&self.inner)
            .map(|inner| inner.conn.last_error())
            .unwrap_or((0, String::new()))
    }

    // ── Channel factories ───────────────────────────────────────────────

    pub fn open_channel(&self) -> SshResult<Channel> {
        let token = self.run("open_channel", |inner| {
            inner.require_authenticated()?;
            let backend = inner
                .conn
                .channel_session()
                .map_err(|e| e.into_kind(SshErrorKind::Channel, "open session channel"))?;
            Ok(inner.register_channel(backend))
        })?;
        Ok(Channel::new(self.downgrade(), token))
    }

    /// Direct TCP/IP channel to `host:port` as seen from the remote side.
    pub fn open_tunnel(
        &self,
        host: &str,
        port: u16,
        source: Option<(&str, u16)>,
    ) -> SshResult<Channel> {
        let token = self.run("open_tunnel", |inner| {
            inner.require_authenticated()?;
            let backend = inner
                .conn
                .channel_direct_tcpip(host, port, source)
                .map_err(|e| {
                    e.into_kind(SshErrorKind::Channel, &format!("tunnel to {}:{}", host, port))
                })?;
            Ok(inner.register_channel(backend))
        })?;
        Ok(Channel::new(self.downgrade(), token))
    }

    /// Ask the server to listen on `port` (0 picks one) and forward
    /// connections back.  `Ok(None)` when the engine would block.
    pub fn listen_forward(
        &self,
        port: u16,
        host: Option<&str>,
        queue_maxsize: Option<u32>,
    ) -> SshResult<Option<Listener>> {
        let opened = self.run("listen_forward", |inner| {
            inner.require_authenticated()?;
            match inner.conn.channel_forward_listen(port, host, queue_maxsize) {
                Ok((backend, bound)) => {
                    let token = inner.next_token();
                    inner.listeners.insert(token, backend);
                    info!("[{}] remote forward listening on port {}", inner.id, bound);
                    Ok(Some((token, bound)))
                }
                Err(e) if e.is_would_block() => Ok(None),
                Err(e) => Err(e.into_kind(SshErrorKind::Channel, "forward listen")),
            }
        })?;
        Ok(opened.map(|(token, bound)| Listener::new(self.downgrade(), token, bound)))
    }

    /// Open an SCP upload channel announcing `header`.
    pub fn scp_send(&self, path: &Path, header: ScpHeader) -> SshResult<Channel> {
        let token = self.run("scp_send", |inner| {
            inner.require_authenticated()?;
            let backend = inner.conn.scp_send(path, &header).map_err(|e| {
                e.into_kind(SshErrorKind::Channel, &format!("scp send '{}'", path.display()))
            })?;
            Ok(inner.register_channel(backend))
        })?;
        Ok(Channel::new(self.downgrade(), token))
    }

    /// Open an SCP download channel; returns it with the remote header.
    pub fn scp_recv(&self, path: &Path) -> SshResult<(Channel, ScpHeader)> {
        let (token, header) = self.run("scp_recv", |inner| {
            inner.require_authenticated()?;
            let (backend, header) = inner.conn.scp_recv(path).map_err(|e| {
                e.into_kind(SshErrorKind::Channel, &format!("scp recv '{}'", path.display()))
            })?;
            Ok((inner.register_channel(backend), header))
        })?;
        Ok((Channel::new(self.downgrade(), token), header))
    }

    pub fn open_sftp(&self) -> SshResult<Sftp> {
        let token = self.run("open_sftp", |inner| {
            inner.require_authenticated()?;
            let backend = inner
                .conn
                .sftp()
                .map_err(|e| e.into_kind(SshErrorKind::Sftp, "start sftp subsystem"))?;
            Ok(inner.register_subsystem(backend))
        })?;
        Ok(Sftp::new(self.downgrade(), token))
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Close a channel this session opened.
    pub fn close_channel(&self, channel: Channel) -> SshResult<()> {
        if !self.owns(channel.session_ref()) {
            return Err(SshError::configuration("channel belongs to another session"));
        }
        let token = channel.token();
        self.run("close_channel", |inner| {
            inner.ensure_live("session")?;
            inner.release_channel(token)
        })
    }

    pub fn shutdown_sftp(&self, sftp: &Sftp) -> SshResult<()> {
        if !self.owns(sftp.session_ref()) {
            return Err(SshError::configuration("sftp subsystem belongs to another session"));
        }
        sftp.shutdown()
    }

    /// Tear the connection down.  Every derived channel, listener, subsystem
    /// and handle is invalidated.
    pub fn close(&self, reason: Option<&str>) -> SshResult<()> {
        self.run("close", |inner| {
            let open = inner.channels.len() + inner.subsystems.len();
            if open > 0 {
                warn!("[{}] closing with {} live channel(s)/subsystem(s)", inner.id, open);
            }
            inner.teardown(reason.unwrap_or("closed by client"))
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::authenticated;
    use sshkit_core::backend::StaticResponder;
    use sshkit_core::mock::{loopback_stream, MockRemote};
    use sshkit_core::trace::{Outcome, TraceEvent};
    use std::sync::Mutex as StdMutex;

    fn connected() -> (MockRemote, Session) {
        let remote = MockRemote::new();
        remote.add_user("alice", "secret");
        let session = Session::new(remote.connection());
        session.startup(loopback_stream().unwrap()).unwrap();
        (remote, session)
    }

    #[test]
    fn test_startup_only_once() {
        let (_remote, session) = connected();
        assert_eq!(session.state(), SessionState::Connected);
        let err = session.startup(loopback_stream().unwrap()).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_failed_handshake_is_connection_error_and_final() {
        let remote = MockRemote::new();
        remote.set_handshake_failure(true);
        let session = Session::new(remote.connection());
        let err = session.startup(loopback_stream().unwrap()).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Connection);
        assert_eq!(session.state(), SessionState::Created);

        remote.set_handshake_failure(false);
        let err = session.startup(loopback_stream().unwrap()).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_method_pref_must_precede_startup() {
        let remote = MockRemote::new();
        let session = Session::new(remote.connection());
        session.set_method_pref(MethodType::CryptCs, "aes256-ctr,aes128-ctr").unwrap();
        session.startup(loopback_stream().unwrap()).unwrap();
        let err = session
            .set_method_pref(MethodType::Kex, "diffie-hellman-group14-sha256")
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
        assert_eq!(
            session.method(MethodType::CryptCs).unwrap().as_deref(),
            Some("aes256-ctr")
        );
    }

    #[test]
    fn test_methods_grouped_by_direction() {
        let (_remote, session) = connected();
        let methods = session.methods().unwrap();
        let cs = &methods[&Direction::ClientToServer];
        assert_eq!(cs[&AlgorithmCategory::Crypt], "aes128-ctr");
        assert_eq!(cs[&AlgorithmCategory::Mac], "hmac-sha2-256");
        assert!(!cs.contains_key(&AlgorithmCategory::Lang));
    }

    #[test]
    fn test_host_key_hash_lengths() {
        let (_remote, session) = connected();
        assert_eq!(session.host_key_hash(HashKind::Md5).unwrap().len(), 16);
        assert_eq!(session.host_key_hash(HashKind::Sha1).unwrap().len(), 20);
        assert_eq!(session.host_key_hash(HashKind::Sha256).unwrap().len(), 32);
    }

    #[test]
    fn test_channel_requires_authentication() {
        let (_remote, session) = connected();
        let err = session.open_channel().unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
        let err = session.open_sftp().unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_auth_before_startup_is_configuration_error() {
        let remote = MockRemote::new();
        remote.add_user("alice", "secret");
        let session = Session::new(remote.connection());
        let err = session.userauth_password("alice", "secret").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_password_auth_failure_then_success() {
        let (_remote, session) = connected();
        let err = session.userauth_password("alice", "wrong").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Authentication);
        assert!(!session.authenticated());
        session.userauth_password("alice", "secret").unwrap();
        assert!(session.authenticated());
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_keyboard_interactive() {
        let (_remote, session) = connected();
        let mut responder = StaticResponder("secret".into());
        session
            .userauth_keyboard_interactive("alice", &mut responder)
            .unwrap();
        assert!(session.authenticated());
    }

    #[test]
    fn test_auth_methods_listed() {
        let (_remote, session) = connected();
        let methods = session.auth_methods("alice").unwrap();
        assert_eq!(methods, vec!["publickey", "password", "keyboard-interactive"]);
    }

    #[test]
    fn test_agent_auth_outlives_agent() {
        let (remote, session) = connected();
        remote.add_agent_identity(None, "other", b"key-b");
        remote.add_agent_identity(Some("alice"), "alice@laptop", b"key-a");
        let mut agent = AgentClient::new(remote.agent());
        agent.connect().unwrap();
        assert_eq!(agent.list_identities().unwrap().len(), 2);
        session.userauth_agent("alice", &agent).unwrap();
        drop(agent);

        let mut channel = session.open_channel().unwrap();
        channel.exec("echo still here").unwrap();
        assert_eq!(channel.read_all().unwrap(), b"still here\n");
    }

    #[test]
    fn test_agent_auth_requires_connected_agent() {
        let (remote, session) = connected();
        let agent = AgentClient::new(remote.agent());
        let err = session.userauth_agent("alice", &agent).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Authentication);
    }

    #[test]
    fn test_close_invalidates_children() {
        let (remote, session) = authenticated();
        let mut channel = session.open_channel().unwrap();
        let sftp = session.open_sftp().unwrap();
        assert_eq!(remote.open_channels(), 1);
        assert_eq!(remote.open_subsystems(), 1);

        session.close(None).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(channel.read(16).unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(sftp.stat("/").unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(session.open_channel().unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(remote.open_channels(), 0);
        assert_eq!(remote.open_subsystems(), 0);

        // Idempotent.
        session.close(Some("again")).unwrap();
    }

    #[test]
    fn test_drop_last_handle_tears_down() {
        let (remote, session) = authenticated();
        let mut channel = session.open_channel().unwrap();
        drop(session);
        assert_eq!(remote.open_channels(), 0);
        assert_eq!(channel.exec("true").unwrap_err().kind, SshErrorKind::UseAfterClose);
    }

    #[test]
    fn test_close_channel_from_other_session() {
        let (_r1, first) = authenticated();
        let (_r2, second) = authenticated();
        let channel = first.open_channel().unwrap();
        let err = second.close_channel(channel).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_listen_forward_assigns_port() {
        let (_remote, session) = authenticated();
        let mut listener = session.listen_forward(0, None, None).unwrap().unwrap();
        assert!(listener.bound_port() > 0);
        let mut channel = listener.accept().unwrap();
        assert_eq!(channel.write(b"ping").unwrap(), 4);
        assert_eq!(channel.read(16).unwrap(), b"ping");
        listener.cancel().unwrap();
    }

    #[test]
    fn test_tunnel_rejected_by_server() {
        let (_remote, session) = authenticated();
        let err = session.open_tunnel("", 0, None).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Channel);
        assert!(session.open_tunnel("db.internal", 5432, None).is_ok());
    }

    struct Collect(StdMutex<Vec<TraceEvent>>);

    impl TraceHook for Collect {
        fn on_operation(&self, event: &TraceEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_hook_sees_session_and_child_operations() {
        let hook = Arc::new(Collect(StdMutex::new(Vec::new())));
        let (_remote, session) = authenticated();
        session
            .set_hook(Some(hook.clone() as Arc<dyn TraceHook>))
            .unwrap();

        let mut channel = session.open_channel().unwrap();
        let _ = channel.exec("missing-command");
        let _ = session.startup(loopback_stream().unwrap());

        let events = hook.0.lock().unwrap();
        let ops: Vec<_> = events.iter().map(|e| (e.component, e.operation)).collect();
        assert_eq!(
            ops,
            vec![
                (Component::Session, "open_channel"),
                (Component::Channel, "exec"),
                (Component::Session, "startup"),
            ]
        );
        assert_eq!(
            events[2].outcome,
            Outcome::Failed(SshErrorKind::Configuration)
        );
        assert!(events.iter().all(|e| e.session_id == session.id()));
    }
}
