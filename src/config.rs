// ── Session configuration and connect helper ─────────────────────────────────

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sshkit_core::{MethodType, SshError, SshResult};
use sshkit_ssh::{AgentClient, Session, StaticResponder};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

pub fn default_ssh_port() -> u16 {
    22
}
pub fn default_true() -> bool {
    true
}
pub fn default_connect_timeout() -> u64 {
    30
}

const COMPRESSION_PREFS: &str = "zlib@openssh.com,zlib,none";

/// Everything needed to open and authenticate one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub public_key_path: Option<String>,
    #[serde(default)]
    pub use_agent: bool,
    #[serde(default)]
    pub banner: Option<String>,
    // Algorithm preferences, most preferred first.
    #[serde(default)]
    pub preferred_kex: Vec<String>,
    #[serde(default)]
    pub preferred_host_key_algorithms: Vec<String>,
    #[serde(default)]
    pub preferred_ciphers: Vec<String>,
    #[serde(default)]
    pub preferred_macs: Vec<String>,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_true")]
    pub blocking: bool,
    /// Seconds allowed for the TCP connect.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            public_key_path: None,
            use_agent: false,
            banner: None,
            preferred_kex: Vec::new(),
            preferred_host_key_algorithms: Vec::new(),
            preferred_ciphers: Vec::new(),
            preferred_macs: Vec::new(),
            compression: false,
            blocking: true,
            connect_timeout: default_connect_timeout(),
        }
    }

    pub fn from_json(json: &str) -> SshResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| SshError::configuration(format!("invalid session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SshResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SshError::io(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> SshResult<()> {
        if self.host.trim().is_empty() {
            return Err(SshError::configuration("host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(SshError::configuration("username must not be empty"));
        }
        if self.port == 0 {
            return Err(SshError::configuration("port must be non-zero"));
        }
        if self.private_key_passphrase.is_some() && self.private_key_path.is_none() {
            return Err(SshError::configuration(
                "private key passphrase given without a private key path",
            ));
        }
        Ok(())
    }

    /// Preference strings to apply before the handshake, one per slot.
    /// Cipher, MAC and compression lists are applied to both directions.
    pub fn method_prefs(&self) -> Vec<(MethodType, String)> {
        let mut prefs = Vec::new();
        let mut push = |methods: &[MethodType], list: &[String]| {
            if list.is_empty() {
                return;
            }
            let joined = list.join(",");
            for method in methods {
                prefs.push((*method, joined.clone()));
            }
        };
        push(&[MethodType::Kex], &self.preferred_kex);
        push(&[MethodType::HostKey], &self.preferred_host_key_algorithms);
        push(&[MethodType::CryptCs, MethodType::CryptSc], &self.preferred_ciphers);
        push(&[MethodType::MacCs, MethodType::MacSc], &self.preferred_macs);
        if self.compression {
            prefs.push((MethodType::CompCs, COMPRESSION_PREFS.to_string()));
            prefs.push((MethodType::CompSc, COMPRESSION_PREFS.to_string()));
        }
        prefs
    }

    fn has_credentials(&self) -> bool {
        self.private_key_path.is_some() || self.password.is_some() || self.use_agent
    }
}

// ── Connect ──────────────────────────────────────────────────────────────────

/// Open a TCP connection to the configured host and run [`establish`] over it
/// with the libssh2 engine.
pub fn connect(config: &SessionConfig) -> SshResult<Session> {
    config.validate()?;
    let stream = open_stream(config)?;
    let agent = if config.use_agent {
        match AgentClient::system() {
            Ok(agent) => Some(agent),
            Err(e) => {
                warn!("ssh agent unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };
    establish(Session::libssh2()?, stream, config, agent)
}

fn open_stream(config: &SessionConfig) -> SshResult<TcpStream> {
    let timeout = Duration::from_secs(config.connect_timeout.max(1));
    let addrs: Vec<_> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| {
            SshError::connection(format!("failed to resolve {}: {}", config.host, e))
        })?
        .collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(SshError::connection(match last_err {
        Some(e) => format!("failed to connect to {}:{}: {}", config.host, config.port, e),
        None => format!("{} resolved to no addresses", config.host),
    }))
}

/// Configure `session`, perform the handshake over `stream` and
/// authenticate.  The session is closed again when any step fails.
pub fn establish(
    session: Session,
    stream: TcpStream,
    config: &SessionConfig,
    agent: Option<AgentClient>,
) -> SshResult<Session> {
    let result = (|| {
        if let Some(banner) = config.banner.as_deref() {
            session.set_banner(Some(banner))?;
        }
        for (method, prefs) in config.method_prefs() {
            session.set_method_pref(method, &prefs)?;
        }
        session.startup(stream)?;
        session.set_blocking(config.blocking)?;
        authenticate(&session, config, agent)
    })();
    match result {
        Ok(()) => {
            info!(
                "[{}] connected to {}:{} as {}",
                session.id(),
                config.host,
                config.port,
                config.username
            );
            Ok(session)
        }
        Err(e) => {
            if let Err(close_err) = session.close(Some("connection setup failed")) {
                warn!("[{}] close after failed setup: {}", session.id(), close_err);
            }
            Err(e)
        }
    }
}

/// Try each configured method in turn: public key, password,
/// keyboard-interactive answered with the password, then the agent.
pub fn authenticate(
    session: &Session,
    config: &SessionConfig,
    agent: Option<AgentClient>,
) -> SshResult<()> {
    if !config.has_credentials() {
        return Err(SshError::authentication("no authentication method configured"));
    }
    let user = config.username.as_str();

    if let Some(private_key) = config.private_key_path.as_deref() {
        let public_key = config.public_key_path.as_deref().map(Path::new);
        match session.userauth_pubkey_file(
            user,
            public_key,
            Path::new(private_key),
            config.private_key_passphrase.as_deref(),
        ) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("[{}] publickey rejected: {}", session.id(), e),
        }
    }

    if let Some(password) = config.password.as_deref() {
        match session.userauth_password(user, password) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("[{}] password rejected: {}", session.id(), e),
        }
        let mut responder = StaticResponder(password.to_string());
        match session.userauth_keyboard_interactive(user, &mut responder) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("[{}] keyboard-interactive rejected: {}", session.id(), e),
        }
    }

    if let Some(mut agent) = agent {
        let outcome = agent_auth(session, user, &mut agent);
        if let Err(e) = agent.disconnect() {
            warn!("agent disconnect failed: {}", e);
        }
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => debug!("[{}] agent authentication rejected: {}", session.id(), e),
        }
    }

    Err(SshError::authentication(format!(
        "all authentication methods failed for {}",
        user
    )))
}

fn agent_auth(session: &Session, user: &str, agent: &mut AgentClient) -> SshResult<()> {
    agent.connect()?;
    agent.list_identities()?;
    session.userauth_agent(user, agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshkit_core::mock::{loopback_stream, MockRemote};
    use sshkit_core::{SessionState, SshErrorKind};

    fn config() -> SessionConfig {
        let mut config = SessionConfig::new("build-01", "deploy");
        config.password = Some("hunter2".into());
        config
    }

    #[test]
    fn test_from_json_defaults() {
        let config =
            SessionConfig::from_json(r#"{"host":"10.0.0.5","username":"ops"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert!(config.blocking);
        assert_eq!(config.connect_timeout, 30);
        assert!(!config.use_agent);
        assert!(config.method_prefs().is_empty());
    }

    #[test]
    fn test_from_json_camel_case_fields() {
        let json = r#"{
            "host": "10.0.0.5",
            "port": 2222,
            "username": "ops",
            "privateKeyPath": "/keys/id_ed25519",
            "preferredCiphers": ["aes256-ctr", "aes128-ctr"],
            "compression": true
        }"#;
        let config = SessionConfig::from_json(json).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.private_key_path.as_deref(), Some("/keys/id_ed25519"));
        let prefs = config.method_prefs();
        assert!(prefs.contains(&(MethodType::CryptCs, "aes256-ctr,aes128-ctr".into())));
        assert!(prefs.contains(&(MethodType::CryptSc, "aes256-ctr,aes128-ctr".into())));
        assert!(prefs.contains(&(MethodType::CompSc, COMPRESSION_PREFS.into())));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SessionConfig::from_json(r#"{"host":"","username":"ops"}"#).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
        let err = SessionConfig::from_json("not json").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"host":"h","username":"u","useAgent":true}"#).unwrap();
        let config = SessionConfig::from_file(&path).unwrap();
        assert!(config.use_agent);

        let err = SessionConfig::from_file(dir.path().join("missing.json")).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Io);
    }

    #[test]
    fn test_establish_with_password() {
        let remote = MockRemote::new();
        remote.add_user("deploy", "hunter2");
        let mut config = config();
        config.preferred_kex = vec!["diffie-hellman-group14-sha256".into()];
        let session = establish(
            Session::new(remote.connection()),
            loopback_stream().unwrap(),
            &config,
            None,
        )
        .unwrap();
        assert!(session.authenticated());
        assert_eq!(
            session.method(MethodType::Kex).unwrap().as_deref(),
            Some("diffie-hellman-group14-sha256")
        );
    }

    #[test]
    fn test_establish_prefers_public_key() {
        let remote = MockRemote::new();
        remote.add_user("deploy", "other-password");
        remote.authorize_key("deploy", Path::new("/keys/deploy"));
        let mut config = config();
        config.private_key_path = Some("/keys/deploy".into());
        let session = establish(
            Session::new(remote.connection()),
            loopback_stream().unwrap(),
            &config,
            None,
        )
        .unwrap();
        assert!(session.authenticated());
    }

    #[test]
    fn test_establish_falls_back_to_agent() {
        let remote = MockRemote::new();
        remote.add_user("deploy", "other-password");
        remote.add_agent_identity(Some("deploy"), "deploy@laptop", b"blob-1");
        let mut config = config();
        config.use_agent = true;
        let agent = AgentClient::new(remote.agent());
        let session = establish(
            Session::new(remote.connection()),
            loopback_stream().unwrap(),
            &config,
            Some(agent),
        )
        .unwrap();
        assert!(session.authenticated());
    }

    #[test]
    fn test_all_methods_rejected_closes_session() {
        let remote = MockRemote::new();
        remote.add_user("deploy", "other-password");
        let session = Session::new(remote.connection());
        let err = establish(session.clone(), loopback_stream().unwrap(), &config(), None)
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Authentication);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_no_credentials() {
        let remote = MockRemote::new();
        let config = SessionConfig::new("h", "deploy");
        let err = establish(
            Session::new(remote.connection()),
            loopback_stream().unwrap(),
            &config,
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Authentication);
    }

    #[test]
    fn test_failed_handshake_is_connection_error() {
        let remote = MockRemote::new();
        remote.add_user("deploy", "hunter2");
        remote.set_handshake_failure(true);
        let err = establish(
            Session::new(remote.connection()),
            loopback_stream().unwrap(),
            &config(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Connection);
    }
}
