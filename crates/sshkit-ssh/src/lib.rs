//! SSH client sessions over a pluggable engine.
//!
//! A [`Session`] owns every engine object spawned from it.  [`Channel`],
//! [`Listener`], [`Sftp`], [`SftpFile`] and [`SftpDir`] are lightweight
//! handles into that session; once the owner closes (or the subsystem that
//! opened a file shuts down) they report `UseAfterClose` instead of touching
//! released engine state.

pub mod sftp;
pub mod ssh;

pub use sftp::{Sftp, SftpDir, SftpFile};
pub use ssh::{AgentClient, Channel, Libssh2Connection, Listener, Session};

pub use sshkit_core::backend::{KeyboardInteractive, StaticResponder};
pub use sshkit_core::*;

#[cfg(test)]
pub(crate) mod testutil {
    use crate::Session;
    use sshkit_core::mock::{loopback_stream, MockRemote};

    /// Remote with user `alice` (password `secret`) and a session already
    /// authenticated against it.
    pub fn authenticated() -> (MockRemote, Session) {
        let remote = MockRemote::new();
        remote.add_user("alice", "secret");
        let session = Session::new(remote.connection());
        session.startup(loopback_stream().expect("loopback")).expect("startup");
        session.userauth_password("alice", "secret").expect("auth");
        (remote, session)
    }
}
