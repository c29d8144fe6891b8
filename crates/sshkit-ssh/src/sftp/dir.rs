// ── SFTP directory handle ────────────────────────────────────────────────────

use crate::ssh::registry::{with_live, WeakInner};
use sshkit_core::trace::Component;
use sshkit_core::*;
use std::collections::BTreeMap;

/// Open remote directory listing.  Same validity rules as
/// [`crate::SftpFile`].
pub struct SftpDir {
    session: WeakInner,
    token: u64,
    done: bool,
}

impl SftpDir {
    pub(crate) fn new(session: WeakInner, token: u64) -> Self {
        Self {
            session,
            token,
            done: false,
        }
    }

    /// Next `(name, attributes)` pair; `None` once the listing is exhausted.
    pub fn read_entry(&mut self) -> SshResult<Option<(String, StatRecord)>> {
        let token = self.token;
        with_live(&self.session, Component::SftpDir, "sftp directory handle", "read_entry", |inner| {
            inner
                .dir_mut(token)?
                .backend
                .readdir()
                .map_err(|e| e.into_kind(SshErrorKind::Sftp, "readdir"))
        })
    }

    /// Drain the remaining entries keyed by name.  The server's `.` and
    /// `..` entries are included when it sends them.
    pub fn list_all(&mut self) -> SshResult<BTreeMap<String, StatRecord>> {
        let mut entries = BTreeMap::new();
        while let Some((name, stat)) = self.read_entry()? {
            entries.insert(name, stat);
        }
        Ok(entries)
    }

    pub fn close(self) -> SshResult<()> {
        let token = self.token;
        with_live(&self.session, Component::SftpDir, "sftp directory handle", "close", |inner| {
            inner.release_dir(token)
        })
    }
}

/// Yields entries until exhaustion; an error is yielded once and ends the
/// iteration.
impl Iterator for SftpDir {
    type Item = SshResult<(String, StatRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for SftpDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpDir").field("token", &self.token).finish()
    }
}

impl Drop for SftpDir {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                if inner.dirs.contains_key(&self.token) {
                    let _ = inner.release_dir(self.token);
                }
            }
        }
    }
}
