// ── Mock SFTP subsystem ──────────────────────────────────────────────────────

use super::fs::normalize;
use super::{lock, Shared};
use crate::backend::{SftpBackend, SftpDirBackend, SftpFileBackend};
use crate::errno::*;
use crate::error::{BackendError, BackendResult};
use crate::types::*;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

fn shut_down() -> BackendError {
    BackendError::new(ENGINE_SOCKET_SEND, "sftp subsystem already shut down")
}

pub(crate) struct MockSftp {
    state: Shared,
    shut: bool,
}

impl MockSftp {
    pub fn new(state: Shared) -> Self {
        lock(&state).open_subsystems += 1;
        Self { state, shut: false }
    }

    fn live(&self) -> BackendResult<()> {
        if self.shut {
            return Err(shut_down());
        }
        Ok(())
    }
}

impl SftpBackend for MockSftp {
    fn open(
        &mut self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> BackendResult<Box<dyn SftpFileBackend>> {
        self.live()?;
        let resolved = lock(&self.state).fs.open(&normalize(path), flags, mode)?;
        Ok(Box::new(MockFile::new(self.state.clone(), resolved, flags)))
    }

    fn opendir(&mut self, path: &Path) -> BackendResult<Box<dyn SftpDirBackend>> {
        self.live()?;
        let entries = lock(&self.state).fs.list(&normalize(path))?;
        Ok(Box::new(MockDir::new(self.state.clone(), entries)))
    }

    fn unlink(&mut self, path: &Path) -> BackendResult<()> {
        self.live()?;
        lock(&self.state).fs.unlink(&normalize(path))
    }

    fn rename(&mut self, src: &Path, dst: &Path) -> BackendResult<()> {
        self.live()?;
        lock(&self.state).fs.rename(&normalize(src), &normalize(dst))
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> BackendResult<()> {
        self.live()?;
        lock(&self.state).fs.mkdir(&normalize(path), mode)
    }

    fn rmdir(&mut self, path: &Path) -> BackendResult<()> {
        self.live()?;
        lock(&self.state).fs.rmdir(&normalize(path))
    }

    fn realpath(&mut self, path: &Path) -> BackendResult<PathBuf> {
        self.live()?;
        lock(&self.state)
            .fs
            .resolve(&normalize(path))
            .map(PathBuf::from)
    }

    fn readlink(&mut self, path: &Path) -> BackendResult<PathBuf> {
        self.live()?;
        lock(&self.state)
            .fs
            .readlink(&normalize(path))
            .map(PathBuf::from)
    }

    fn symlink(&mut self, path: &Path, target: &Path) -> BackendResult<()> {
        self.live()?;
        let target = target.to_string_lossy();
        lock(&self.state).fs.symlink(&normalize(path), &target)
    }

    fn stat(&mut self, path: &Path) -> BackendResult<StatRecord> {
        self.live()?;
        lock(&self.state).fs.stat(&normalize(path))
    }

    fn lstat(&mut self, path: &Path) -> BackendResult<StatRecord> {
        self.live()?;
        lock(&self.state).fs.lstat(&normalize(path))
    }

    fn setstat(&mut self, path: &Path, update: &StatUpdate) -> BackendResult<()> {
        self.live()?;
        lock(&self.state).fs.setstat(&normalize(path), update)
    }

    fn shutdown(&mut self) -> BackendResult<()> {
        self.live()?;
        self.shut = true;
        let mut st = lock(&self.state);
        st.open_subsystems = st.open_subsystems.saturating_sub(1);
        Ok(())
    }
}

impl Drop for MockSftp {
    fn drop(&mut self) {
        if !self.shut {
            let mut st = lock(&self.state);
            st.open_subsystems = st.open_subsystems.saturating_sub(1);
        }
    }
}

// ── Handles ──────────────────────────────────────────────────────────────────

pub(crate) struct MockFile {
    state: Shared,
    path: String,
    flags: OpenFlags,
    offset: u64,
    closed: bool,
}

impl MockFile {
    fn new(state: Shared, path: String, flags: OpenFlags) -> Self {
        lock(&state).open_files += 1;
        Self {
            state,
            path,
            flags,
            offset: 0,
            closed: false,
        }
    }

    fn live(&self) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::sftp(SSH_FX_INVALID_HANDLE, "handle closed"));
        }
        Ok(())
    }
}

impl SftpFileBackend for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize> {
        self.live()?;
        if !self.flags.read {
            return Err(BackendError::sftp(
                SSH_FX_PERMISSION_DENIED,
                "handle not opened for reading",
            ));
        }
        let n = lock(&self.state).fs.read_at(&self.path, self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> BackendResult<usize> {
        self.live()?;
        if !(self.flags.write || self.flags.append) {
            return Err(BackendError::sftp(
                SSH_FX_PERMISSION_DENIED,
                "handle not opened for writing",
            ));
        }
        let mut st = lock(&self.state);
        if self.flags.append {
            self.offset = st.fs.file_len(&self.path);
        }
        let cap = st.write_cap.unwrap_or(usize::MAX);
        let n = buf.len().min(cap);
        let written = st.fs.write_at(&self.path, self.offset, &buf[..n])?;
        self.offset += written as u64;
        Ok(written)
    }

    fn seek(&mut self, offset: u64) -> BackendResult<()> {
        self.live()?;
        self.offset = offset;
        Ok(())
    }

    fn fstat(&mut self) -> BackendResult<StatRecord> {
        self.live()?;
        let st = lock(&self.state);
        if st.fstat_fails {
            return Err(BackendError::sftp(SSH_FX_FAILURE, format!("fstat refused: {}", self.path)));
        }
        st.fs.lstat(&self.path)
    }

    fn close(&mut self) -> BackendResult<()> {
        self.live()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for MockFile {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        st.open_files = st.open_files.saturating_sub(1);
    }
}

pub(crate) struct MockDir {
    state: Shared,
    entries: VecDeque<(String, StatRecord)>,
    closed: bool,
}

impl MockDir {
    fn new(state: Shared, entries: Vec<(String, StatRecord)>) -> Self {
        lock(&state).open_dirs += 1;
        Self {
            state,
            entries: entries.into(),
            closed: false,
        }
    }
}

impl SftpDirBackend for MockDir {
    fn readdir(&mut self) -> BackendResult<Option<(String, StatRecord)>> {
        if self.closed {
            return Err(BackendError::sftp(SSH_FX_INVALID_HANDLE, "handle closed"));
        }
        Ok(self.entries.pop_front())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.closed = true;
        Ok(())
    }
}

impl Drop for MockDir {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        st.open_dirs = st.open_dirs.saturating_sub(1);
    }
}
