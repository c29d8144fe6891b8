//! In-memory remote host implementing the engine traits.
//!
//! `MockRemote` stands in for a server: a filesystem tree, a credential
//! table, canned command output and knobs that make the engine misbehave the
//! way real links do (short writes, truncated SCP streams, read faults).
//! Every connection, channel and SFTP object created from one `MockRemote`
//! shares its state.

mod channel;
mod connection;
mod fs;
mod sftp;

pub use connection::{MockAgent, MockConnection};

use crate::backend::{AgentBackend, ConnectionBackend};
use crate::types::*;
use fs::{normalize, MemFs, NodeKind};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

pub(crate) struct RemoteState {
    pub fs: MemFs,
    pub passwords: HashMap<String, String>,
    pub pubkeys: HashMap<String, Vec<PathBuf>>,
    pub hostbased: HashSet<(String, String)>,
    pub agent_available: bool,
    pub agent_keys: Vec<AgentIdentity>,
    pub authorized_blobs: HashMap<String, Vec<Vec<u8>>>,
    pub commands: HashMap<String, CommandOutput>,
    pub write_cap: Option<usize>,
    pub scp_recv_limit: Option<usize>,
    pub read_fault_after: Option<usize>,
    pub fstat_fails: bool,
    pub handshake_fails: bool,
    pub max_auth_attempts: u32,
    pub next_port: u16,
    pub open_channels: usize,
    pub open_files: usize,
    pub open_dirs: usize,
    pub open_subsystems: usize,
}

pub(crate) type Shared = Arc<Mutex<RemoteState>>;

pub(crate) fn lock(state: &Shared) -> MutexGuard<'_, RemoteState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated remote host.
#[derive(Clone)]
pub struct MockRemote {
    state: Shared,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        let state = RemoteState {
            fs: MemFs::new(),
            passwords: HashMap::new(),
            pubkeys: HashMap::new(),
            hostbased: HashSet::new(),
            agent_available: true,
            agent_keys: Vec::new(),
            authorized_blobs: HashMap::new(),
            commands: HashMap::new(),
            write_cap: None,
            scp_recv_limit: None,
            read_fault_after: None,
            fstat_fails: false,
            handshake_fails: false,
            max_auth_attempts: 6,
            next_port: 40000,
            open_channels: 0,
            open_files: 0,
            open_dirs: 0,
            open_subsystems: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Engine for a new connection to this host.
    pub fn connection(&self) -> Box<dyn ConnectionBackend> {
        Box::new(MockConnection::new(self.state.clone()))
    }

    /// Engine for the local agent process.
    pub fn agent(&self) -> Box<dyn AgentBackend> {
        Box::new(MockAgent::new(self.state.clone()))
    }

    // ── Credentials ─────────────────────────────────────────────────────

    pub fn add_user(&self, username: &str, password: &str) {
        let mut st = lock(&self.state);
        st.passwords.insert(username.into(), password.into());
        let home = format!("/home/{}", username);
        if st.fs.get("/home").is_none() {
            st.fs.insert_dir("/home", DEFAULT_DIR_MODE);
        }
        if st.fs.get(&home).is_none() {
            st.fs.insert_dir(&home, DEFAULT_DIR_MODE);
        }
    }

    pub fn authorize_key(&self, username: &str, private_key: &Path) {
        lock(&self.state)
            .pubkeys
            .entry(username.into())
            .or_default()
            .push(private_key.to_path_buf());
    }

    pub fn allow_hostbased(&self, username: &str, hostname: &str) {
        lock(&self.state)
            .hostbased
            .insert((username.into(), hostname.into()));
    }

    /// Load an identity into the local agent, optionally authorising it for
    /// `username` on this host.
    pub fn add_agent_identity(&self, username: Option<&str>, comment: &str, blob: &[u8]) {
        let mut st = lock(&self.state);
        st.agent_keys.push(AgentIdentity {
            blob: blob.to_vec(),
            comment: comment.into(),
        });
        if let Some(user) = username {
            st.authorized_blobs
                .entry(user.into())
                .or_default()
                .push(blob.to_vec());
        }
    }

    pub fn set_agent_available(&self, available: bool) {
        lock(&self.state).agent_available = available;
    }

    pub fn set_max_auth_attempts(&self, attempts: u32) {
        lock(&self.state).max_auth_attempts = attempts;
    }

    // ── Behaviour knobs ─────────────────────────────────────────────────

    pub fn set_command(&self, command: &str, stdout: &[u8], stderr: &[u8], exit_status: i32) {
        lock(&self.state).commands.insert(
            command.into(),
            CommandOutput {
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
                exit_status,
            },
        );
    }

    /// Largest number of bytes a single channel or file write accepts.
    pub fn set_write_cap(&self, cap: Option<usize>) {
        lock(&self.state).write_cap = cap;
    }

    /// Stop SCP downloads after `limit` bytes, leaving the declared size
    /// unsatisfied.
    pub fn set_scp_recv_limit(&self, limit: Option<usize>) {
        lock(&self.state).scp_recv_limit = limit;
    }

    /// Fail channel reads once `after` bytes have been delivered.
    pub fn set_read_fault(&self, after: Option<usize>) {
        lock(&self.state).read_fault_after = after;
    }

    /// Make every `fstat` on an open file handle fail.
    pub fn set_fstat_failure(&self, fails: bool) {
        lock(&self.state).fstat_fails = fails;
    }

    pub fn set_handshake_failure(&self, fails: bool) {
        lock(&self.state).handshake_fails = fails;
    }

    // ── Filesystem ──────────────────────────────────────────────────────

    pub fn put_file(&self, path: &str, content: &[u8], mode: u32) {
        lock(&self.state)
            .fs
            .insert_file(&normalize(Path::new(path)), content.to_vec(), mode);
    }

    pub fn put_dir(&self, path: &str, mode: u32) {
        lock(&self.state)
            .fs
            .insert_dir(&normalize(Path::new(path)), mode);
    }

    pub fn set_times(&self, path: &str, atime: u64, mtime: u64) {
        let mut st = lock(&self.state);
        if let Some(node) = st.fs.get_mut(&normalize(Path::new(path))) {
            node.stat.atime = atime;
            node.stat.mtime = mtime;
        }
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let st = lock(&self.state);
        match st.fs.get(&normalize(Path::new(path))) {
            Some(node) => match &node.kind {
                NodeKind::File(content) => Some(content.clone()),
                _ => None,
            },
            None => None,
        }
    }

    pub fn stat(&self, path: &str) -> Option<StatRecord> {
        lock(&self.state)
            .fs
            .get(&normalize(Path::new(path)))
            .map(|n| n.stat)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_some()
    }

    /// Every path with its metadata and file content.
    pub fn tree(&self) -> BTreeMap<String, (StatRecord, Option<Vec<u8>>)> {
        let st = lock(&self.state);
        st.fs
            .paths()
            .map(|(path, node)| {
                let content = match &node.kind {
                    NodeKind::File(c) => Some(c.clone()),
                    _ => None,
                };
                (path.clone(), (node.stat, content))
            })
            .collect()
    }

    // ── Live engine objects ─────────────────────────────────────────────

    pub fn open_channels(&self) -> usize {
        lock(&self.state).open_channels
    }

    pub fn open_files(&self) -> usize {
        lock(&self.state).open_files
    }

    pub fn open_dirs(&self) -> usize {
        lock(&self.state).open_dirs
    }

    pub fn open_subsystems(&self) -> usize {
        lock(&self.state).open_subsystems
    }
}

/// Connected loopback socket to hand to `startup` against the mock engine.
pub fn loopback_stream() -> std::io::Result<TcpStream> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let stream = TcpStream::connect(listener.local_addr()?)?;
    let _ = listener.accept()?;
    Ok(stream)
}
