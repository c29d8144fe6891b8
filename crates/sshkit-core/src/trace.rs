// ── Operation hooks ──────────────────────────────────────────────────────────

use crate::error::{SshErrorKind, SshResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Component {
    Session,
    Channel,
    Listener,
    Sftp,
    SftpFile,
    SftpDir,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Session => "session",
            Component::Channel => "channel",
            Component::Listener => "listener",
            Component::Sftp => "sftp",
            Component::SftpFile => "sftp-file",
            Component::SftpDir => "sftp-dir",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Ok,
    Failed(SshErrorKind),
}

impl Outcome {
    pub fn of<T>(result: &SshResult<T>) -> Self {
        match result {
            Ok(_) => Outcome::Ok,
            Err(e) => Outcome::Failed(e.kind),
        }
    }
}

/// One finished public operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub session_id: String,
    pub component: Component,
    pub operation: &'static str,
    pub outcome: Outcome,
}

/// Observer invoked once at the end of every public operation.
///
/// Hooks run while the session lock is held and must not call back into the
/// session.
pub trait TraceHook: Send + Sync {
    fn on_operation(&self, event: &TraceEvent);
}

/// Forwards events to the `log` facade at debug level (failures at warn).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHook;

impl TraceHook for LogHook {
    fn on_operation(&self, event: &TraceEvent) {
        match event.outcome {
            Outcome::Ok => log::debug!(
                "[{}] {}.{} ok",
                event.session_id,
                event.component,
                event.operation
            ),
            Outcome::Failed(kind) => log::warn!(
                "[{}] {}.{} failed: {}",
                event.session_id,
                event.component,
                event.operation,
                kind
            ),
        }
    }
}

/// Emits one `tracing` event per operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl TraceHook for TracingHook {
    fn on_operation(&self, event: &TraceEvent) {
        match event.outcome {
            Outcome::Ok => tracing::debug!(
                session_id = %event.session_id,
                component = %event.component,
                operation = event.operation,
                "operation completed"
            ),
            Outcome::Failed(kind) => tracing::warn!(
                session_id = %event.session_id,
                component = %event.component,
                operation = event.operation,
                error_kind = %kind,
                "operation failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SshError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TraceEvent>>);

    impl TraceHook for Collect {
        fn on_operation(&self, event: &TraceEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_outcome_of_result() {
        let ok: SshResult<u8> = Ok(1);
        let err: SshResult<u8> = Err(SshError::transfer("short"));
        assert_eq!(Outcome::of(&ok), Outcome::Ok);
        assert_eq!(Outcome::of(&err), Outcome::Failed(SshErrorKind::Transfer));
    }

    #[test]
    fn test_hook_receives_event() {
        let hook = Collect::default();
        let event = TraceEvent {
            session_id: "s-1".into(),
            component: Component::SftpFile,
            operation: "seek",
            outcome: Outcome::Ok,
        };
        hook.on_operation(&event);
        LogHook.on_operation(&event);
        TracingHook.on_operation(&event);
        let seen = hook.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].component.to_string(), "sftp-file");
    }
}
