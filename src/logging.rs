// ── Logging bootstrap ────────────────────────────────────────────────────────

use sshkit_core::{SshError, SshResult};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "sshkit=info,sshkit_ssh=info,sshkit_scp=info";

/// Build the filter: `RUST_LOG` wins when set, otherwise `directives`, otherwise
/// [`DEFAULT_FILTER`].
pub fn env_filter(directives: Option<&str>) -> SshResult<EnvFilter> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(EnvFilter::from_default_env());
    }
    EnvFilter::try_new(directives.unwrap_or(DEFAULT_FILTER))
        .map_err(|e| SshError::configuration(format!("invalid log filter: {}", e)))
}

/// Install a global subscriber.  Records emitted through the `log` facade
/// are bridged into it.  With the `logs-json` feature every line is a JSON
/// object.
pub fn init_logging(directives: Option<&str>) -> SshResult<()> {
    let filter = env_filter(directives)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    #[cfg(feature = "logs-json")]
    let result = builder.json().try_init();
    #[cfg(not(feature = "logs-json"))]
    let result = builder.try_init();

    result.map_err(|e| SshError::configuration(format!("logging already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter() {
        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return;
        }
        let err = env_filter(Some("sshkit=notalevel")).unwrap_err();
        assert_eq!(err.kind, sshkit_core::SshErrorKind::Configuration);
        assert!(env_filter(Some("sshkit_scp=debug")).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(Some("warn"));
        let err = init_logging(Some("warn")).unwrap_err();
        assert_eq!(err.kind, sshkit_core::SshErrorKind::Configuration);
    }
}
