// ── Agent client ─────────────────────────────────────────────────────────────

use log::info;
use sshkit_core::backend::AgentBackend;
use sshkit_core::*;

/// Connection to the local key agent.
///
/// Independent of any session: it lends its identity list to
/// [`crate::Session::userauth_agent`] and can be disconnected or dropped
/// afterwards without affecting the authenticated session.
pub struct AgentClient {
    backend: Box<dyn AgentBackend>,
    state: AgentState,
    identities: Vec<AgentIdentity>,
}

impl AgentClient {
    pub fn new(backend: Box<dyn AgentBackend>) -> Self {
        Self {
            backend,
            state: AgentState::Disconnected,
            identities: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn connect(&mut self) -> SshResult<()> {
        self.backend
            .connect()
            .map_err(|e| e.into_kind(SshErrorKind::Connection, "connect to agent"))?;
        self.state = AgentState::Connected;
        Ok(())
    }

    /// Fetch the agent's current identities.
    pub fn list_identities(&mut self) -> SshResult<&[AgentIdentity]> {
        if self.state != AgentState::Connected {
            return Err(SshError::configuration("agent is not connected"));
        }
        self.identities = self
            .backend
            .list_identities()
            .map_err(|e| e.into_kind(SshErrorKind::Authentication, "list agent identities"))?;
        info!("agent holds {} identities", self.identities.len());
        Ok(&self.identities)
    }

    /// Identities from the last [`AgentClient::list_identities`].
    pub fn identities(&self) -> &[AgentIdentity] {
        &self.identities
    }

    pub fn disconnect(&mut self) -> SshResult<()> {
        if self.state == AgentState::Disconnected {
            return Ok(());
        }
        self.backend
            .disconnect()
            .map_err(|e| e.into_kind(SshErrorKind::Connection, "disconnect from agent"))?;
        self.state = AgentState::Disconnected;
        Ok(())
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
