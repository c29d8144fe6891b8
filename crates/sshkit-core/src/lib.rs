//! # sshkit-core
//!
//! Shared foundation of the sshkit crates: the error taxonomy, value types
//! (stat records, open flags, negotiation slots, lifecycle states), the trait
//! boundary to the protocol engine and the per-operation trace hook.
//!
//! With the `mock` feature it also provides [`mock::MockRemote`], an
//! in-memory remote host implementing the engine traits.

pub mod backend;
pub mod errno;
pub mod error;
pub mod trace;
pub mod types;

#[cfg(feature = "mock")]
pub mod mock;

pub use error::{BackendError, BackendResult, SshError, SshErrorKind, SshResult};
pub use trace::{Component, LogHook, Outcome, TraceEvent, TraceHook, TracingHook};
pub use types::*;
