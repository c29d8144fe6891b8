// ── Handle registry ──────────────────────────────────────────────────────────
//
// A `Session` owns one `SessionInner` behind a mutex.  Every engine object it
// spawns (channels, listeners, SFTP subsystems, file and directory handles)
// lives in a slot of that inner state, keyed by a token that is never reused.
// The public handle types only keep a `Weak` back-reference plus their token:
// a closed session, a shut-down subsystem or a removed slot all surface as
// `UseAfterClose` instead of touching freed engine state.

use log::{info, warn};
use sshkit_core::backend::*;
use sshkit_core::trace::{Component, Outcome, TraceEvent, TraceHook};
use sshkit_core::{ChannelState, SessionState, SshError, SshErrorKind, SshResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub(crate) type SharedInner = Arc<Mutex<SessionInner>>;
pub(crate) type WeakInner = Weak<Mutex<SessionInner>>;

pub(crate) struct ChannelSlot {
    pub backend: Box<dyn ChannelBackend>,
    pub state: ChannelState,
}

pub(crate) struct SubsystemSlot {
    pub backend: Box<dyn SftpBackend>,
    pub files: BTreeSet<u64>,
    pub dirs: BTreeSet<u64>,
}

pub(crate) struct FileSlot {
    pub backend: Box<dyn SftpFileBackend>,
    pub subsystem: u64,
    pub offset: u64,
    pub append: bool,
}

pub(crate) struct DirSlot {
    pub backend: Box<dyn SftpDirBackend>,
    pub subsystem: u64,
}

pub(crate) struct SessionInner {
    pub id: String,
    pub conn: Box<dyn ConnectionBackend>,
    pub state: SessionState,
    pub handshake_attempted: bool,
    pub hook: Option<Arc<dyn TraceHook>>,
    pub channels: HashMap<u64, ChannelSlot>,
    pub listeners: HashMap<u64, Box<dyn ListenerBackend>>,
    pub subsystems: HashMap<u64, SubsystemSlot>,
    pub files: HashMap<u64, FileSlot>,
    pub dirs: HashMap<u64, DirSlot>,
    next_token: u64,
}

impl SessionInner {
    pub fn new(id: String, conn: Box<dyn ConnectionBackend>) -> Self {
        Self {
            id,
            conn,
            state: SessionState::Created,
            handshake_attempted: false,
            hook: None,
            channels: HashMap::new(),
            listeners: HashMap::new(),
            subsystems: HashMap::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_token: 1,
        }
    }

    pub fn next_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    pub fn emit<T>(&self, component: Component, operation: &'static str, result: &SshResult<T>) {
        if let Some(hook) = &self.hook {
            hook.on_operation(&TraceEvent {
                session_id: self.id.clone(),
                component,
                operation,
                outcome: Outcome::of(result),
            });
        }
    }

    pub fn ensure_live(&self, what: &str) -> SshResult<()> {
        if self.state == SessionState::Closed {
            return Err(SshError::use_after_close(what));
        }
        Ok(())
    }

    pub fn require_connected(&self) -> SshResult<()> {
        match self.state {
            SessionState::Connected | SessionState::Authenticated => Ok(()),
            SessionState::Created => Err(SshError::configuration(
                "session is not connected; call startup first",
            )),
            SessionState::Closed => Err(SshError::use_after_close("session")),
        }
    }

    pub fn require_authenticated(&self) -> SshResult<()> {
        self.require_connected()?;
        if self.state != SessionState::Authenticated {
            return Err(SshError::configuration("session is not authenticated"));
        }
        Ok(())
    }

    // ── Slot lookup ─────────────────────────────────────────────────────

    pub fn channel_mut(&mut self, token: u64) -> SshResult<&mut ChannelSlot> {
        self.channels
            .get_mut(&token)
            .ok_or_else(|| SshError::use_after_close("channel"))
    }

    pub fn listener_mut(&mut self, token: u64) -> SshResult<&mut Box<dyn ListenerBackend>> {
        self.listeners
            .get_mut(&token)
            .ok_or_else(|| SshError::use_after_close("listener"))
    }

    pub fn subsystem_mut(&mut self, token: u64) -> SshResult<&mut SubsystemSlot> {
        self.subsystems
            .get_mut(&token)
            .ok_or_else(|| SshError::use_after_close("sftp subsystem"))
    }

    pub fn file_mut(&mut self, token: u64) -> SshResult<&mut FileSlot> {
        self.files
            .get_mut(&token)
            .ok_or_else(|| SshError::use_after_close("sftp file handle"))
    }

    pub fn dir_mut(&mut self, token: u64) -> SshResult<&mut DirSlot> {
        self.dirs
            .get_mut(&token)
            .ok_or_else(|| SshError::use_after_close("sftp directory handle"))
    }

    // ── Registration ────────────────────────────────────────────────────

    pub fn register_channel(&mut self, backend: Box<dyn ChannelBackend>) -> u64 {
        let token = self.next_token();
        self.channels.insert(
            token,
            ChannelSlot {
                backend,
                state: ChannelState::Open,
            },
        );
        token
    }

    pub fn register_subsystem(&mut self, backend: Box<dyn SftpBackend>) -> u64 {
        let token = self.next_token();
        self.subsystems.insert(
            token,
            SubsystemSlot {
                backend,
                files: BTreeSet::new(),
                dirs: BTreeSet::new(),
            },
        );
        token
    }

    pub fn register_file(
        &mut self,
        subsystem: u64,
        backend: Box<dyn SftpFileBackend>,
        offset: u64,
        append: bool,
    ) -> SshResult<u64> {
        let token = self.next_token();
        self.subsystem_mut(subsystem)?.files.insert(token);
        self.files.insert(
            token,
            FileSlot {
                backend,
                subsystem,
                offset,
                append,
            },
        );
        Ok(token)
    }

    pub fn register_dir(&mut self, subsystem: u64, backend: Box<dyn SftpDirBackend>) -> SshResult<u64> {
        let token = self.next_token();
        self.subsystem_mut(subsystem)?.dirs.insert(token);
        self.dirs.insert(token, DirSlot { backend, subsystem });
        Ok(token)
    }

    // ── Release ─────────────────────────────────────────────────────────

    pub fn release_channel(&mut self, token: u64) -> SshResult<()> {
        let mut slot = self
            .channels
            .remove(&token)
            .ok_or_else(|| SshError::use_after_close("channel"))?;
        slot.backend
            .close()
            .map_err(|e| e.into_kind(SshErrorKind::Channel, "close channel"))
    }

    pub fn release_file(&mut self, token: u64) -> SshResult<()> {
        let mut slot = self
            .files
            .remove(&token)
            .ok_or_else(|| SshError::use_after_close("sftp file handle"))?;
        if let Some(sub) = self.subsystems.get_mut(&slot.subsystem) {
            sub.files.remove(&token);
        }
        slot.backend
            .close()
            .map_err(|e| e.into_kind(SshErrorKind::Sftp, "close file"))
    }

    pub fn release_dir(&mut self, token: u64) -> SshResult<()> {
        let mut slot = self
            .dirs
            .remove(&token)
            .ok_or_else(|| SshError::use_after_close("sftp directory handle"))?;
        if let Some(sub) = self.subsystems.get_mut(&slot.subsystem) {
            sub.dirs.remove(&token);
        }
        slot.backend
            .close()
            .map_err(|e| e.into_kind(SshErrorKind::Sftp, "close directory"))
    }

    /// Shut a subsystem down, first invalidating every handle it still
    /// tracks.  The handles' engine objects are released before the
    /// subsystem's own.
    pub fn release_subsystem(&mut self, token: u64) -> SshResult<()> {
        let mut slot = self
            .subsystems
            .remove(&token)
            .ok_or_else(|| SshError::use_after_close("sftp subsystem"))?;
        for file in std::mem::take(&mut slot.files) {
            if let Some(mut f) = self.files.remove(&file) {
                if let Err(e) = f.backend.close() {
                    warn!("[{}] closing orphaned sftp file failed: {}", self.id, e);
                }
            }
        }
        for dir in std::mem::take(&mut slot.dirs) {
            if let Some(mut d) = self.dirs.remove(&dir) {
                if let Err(e) = d.backend.close() {
                    warn!("[{}] closing orphaned sftp directory failed: {}", self.id, e);
                }
            }
        }
        slot.backend
            .shutdown()
            .map_err(|e| e.into_kind(SshErrorKind::Sftp, "sftp shutdown"))
    }

    /// Release every child then disconnect.  Idempotent.
    pub fn teardown(&mut self, reason: &str) -> SshResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let subsystems: Vec<u64> = self.subsystems.keys().copied().collect();
        for token in subsystems {
            if let Err(e) = self.release_subsystem(token) {
                warn!("[{}] sftp shutdown during close failed: {}", self.id, e);
            }
        }
        self.listeners.clear();
        let channels: Vec<u64> = self.channels.keys().copied().collect();
        for token in channels {
            if let Err(e) = self.release_channel(token) {
                warn!("[{}] channel close during session close failed: {}", self.id, e);
            }
        }
        let was_connected = self.state != SessionState::Created;
        self.state = SessionState::Closed;
        if was_connected {
            self.conn
                .disconnect(reason)
                .map_err(|e| e.into_kind(SshErrorKind::Connection, "disconnect"))?;
        }
        info!("[{}] session closed: {}", self.id, reason);
        Ok(())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Err(e) = self.teardown("session dropped") {
            warn!("[{}] {}", self.id, e);
        }
    }
}

// ── Access helpers ───────────────────────────────────────────────────────────

pub(crate) fn lock(inner: &Mutex<SessionInner>) -> SshResult<MutexGuard<'_, SessionInner>> {
    inner
        .lock()
        .map_err(|_| SshError::connection("session state poisoned by a panicked operation"))
}

pub(crate) fn upgrade(weak: &WeakInner, what: &str) -> SshResult<SharedInner> {
    weak.upgrade().ok_or_else(|| SshError::use_after_close(what))
}

/// Run `f` against a live session reached through a child handle, reporting
/// the outcome to the trace hook.
pub(crate) fn with_live<T>(
    weak: &WeakInner,
    component: Component,
    what: &str,
    operation: &'static str,
    f: impl FnOnce(&mut SessionInner) -> SshResult<T>,
) -> SshResult<T> {
    let inner = upgrade(weak, what)?;
    let mut guard = lock(&inner)?;
    let result = match guard.ensure_live(what) {
        Ok(()) => f(&mut guard),
        Err(e) => Err(e),
    };
    guard.emit(component, operation, &result);
    result
}
