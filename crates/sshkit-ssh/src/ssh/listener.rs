// ── Remote port-forward listener ─────────────────────────────────────────────

use crate::ssh::channel::Channel;
use crate::ssh::registry::{with_live, WeakInner};
use sshkit_core::trace::Component;
use sshkit_core::{SshErrorKind, SshResult};

pub struct Listener {
    session: WeakInner,
    token: u64,
    bound_port: u16,
}

impl Listener {
    pub(crate) fn new(session: WeakInner, token: u64, bound_port: u16) -> Self {
        Self {
            session,
            token,
            bound_port,
        }
    }

    /// Port the server actually bound.
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Block until the server forwards a connection.
    pub fn accept(&mut self) -> SshResult<Channel> {
        let token = self.token;
        let channel = with_live(&self.session, Component::Listener, "listener", "accept", |inner| {
            let backend = inner
                .listener_mut(token)?
                .accept()
                .map_err(|e| e.into_kind(SshErrorKind::Channel, "accept forwarded connection"))?;
            Ok(inner.register_channel(backend))
        })?;
        Ok(Channel::new(self.session.clone(), channel))
    }

    /// Stop listening.
    pub fn cancel(self) -> SshResult<()> {
        let token = self.token;
        with_live(&self.session, Component::Listener, "listener", "cancel", |inner| {
            inner.listener_mut(token)?;
            inner.listeners.remove(&token);
            Ok(())
        })
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("token", &self.token).field("bound_port", &self.bound_port).finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.listeners.remove(&self.token);
            }
        }
    }
}
