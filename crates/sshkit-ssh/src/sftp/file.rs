// ── SFTP file handle ─────────────────────────────────────────────────────────

use crate::ssh::channel::to_io;
use crate::ssh::registry::{with_live, FileSlot, WeakInner};
use sshkit_core::trace::Component;
use sshkit_core::*;
use std::io;

const READ_CHUNK: usize = 32 * 1024;

/// Open remote file.  Valid until closed, until its subsystem shuts down,
/// or until the session closes.
pub struct SftpFile {
    session: WeakInner,
    token: u64,
}

fn file_err(context: &str) -> impl FnOnce(BackendError) -> SshError + '_ {
    move |e| e.into_kind(SshErrorKind::Sftp, context)
}

fn advance(slot: &mut FileSlot, written: usize) -> SshResult<()> {
    if slot.append && written > 0 {
        slot.offset = slot.backend.fstat().map_err(file_err("fstat"))?.size;
    } else {
        slot.offset += written as u64;
    }
    Ok(())
}

impl SftpFile {
    pub(crate) fn new(session: WeakInner, token: u64) -> Self {
        Self { session, token }
    }

    fn with<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut FileSlot) -> SshResult<T>,
    ) -> SshResult<T> {
        let token = self.token;
        with_live(&self.session, Component::SftpFile, "sftp file handle", operation, |inner| {
            f(inner.file_mut(token)?)
        })
    }

    /// Read up to `max` bytes at the current offset; empty at end of file.
    /// A single call returns at most one chunk of 32 KiB.
    pub fn read(&mut self, max: usize) -> SshResult<Vec<u8>> {
        self.with("read", |slot| {
            let mut buf = vec![0u8; max.min(READ_CHUNK)];
            let n = slot.backend.read(&mut buf).map_err(file_err("read"))?;
            slot.offset += n as u64;
            buf.truncate(n);
            Ok(buf)
        })
    }

    /// Everything from the current offset to end of file.
    pub fn read_all(&mut self) -> SshResult<Vec<u8>> {
        self.with("read_all", |slot| {
            let mut out = Vec::new();
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = slot.backend.read(&mut buf).map_err(file_err("read"))?;
                if n == 0 {
                    break;
                }
                slot.offset += n as u64;
                out.extend_from_slice(&buf[..n]);
            }
            Ok(out)
        })
    }

    /// Write at the current offset; may accept fewer bytes than offered.
    /// Append handles always write at end of file, so their offset follows
    /// the remote size rather than any earlier seek.
    pub fn write(&mut self, buf: &[u8]) -> SshResult<usize> {
        self.with("write", |slot| {
            let n = match slot.backend.write(buf) {
                Ok(n) => n,
                Err(e) if e.is_would_block() => 0,
                Err(e) => return Err(e.into_kind(SshErrorKind::Sftp, "write")),
            };
            advance(slot, n)?;
            Ok(n)
        })
    }

    pub fn tell(&self) -> SshResult<u64> {
        self.with("tell", |slot| Ok(slot.offset))
    }

    /// Move to an absolute offset.
    pub fn seek(&mut self, offset: u64) -> SshResult<()> {
        self.with("seek", |slot| {
            slot.backend.seek(offset).map_err(file_err("seek"))?;
            slot.offset = offset;
            Ok(())
        })
    }

    pub fn stat(&mut self) -> SshResult<StatRecord> {
        self.with("stat", |slot| slot.backend.fstat().map_err(file_err("fstat")))
    }

    /// Close the remote handle.  Errors with `UseAfterClose` when the
    /// subsystem has already released it.
    pub fn close(self) -> SshResult<()> {
        let token = self.token;
        with_live(&self.session, Component::SftpFile, "sftp file handle", "close", |inner| {
            inner.release_file(token)
        })
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                if inner.files.contains_key(&self.token) {
                    let _ = inner.release_file(self.token);
                }
            }
        }
    }
}

impl io::Read for SftpFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with("read", |slot| {
            let n = slot.backend.read(buf).map_err(file_err("read"))?;
            slot.offset += n as u64;
            Ok(n)
        })
        .map_err(to_io)
    }
}

impl io::Write for SftpFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SftpFile::write(self, buf).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for SftpFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let target = match pos {
            io::SeekFrom::Start(n) => Some(n),
            io::SeekFrom::Current(delta) => self.tell().map_err(to_io)?.checked_add_signed(delta),
            io::SeekFrom::End(delta) => self.stat().map_err(to_io)?.size.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        SftpFile::seek(self, target).map_err(to_io)?;
        Ok(target)
    }
}

impl std::fmt::Debug for SftpFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFile").field("token", &self.token).finish()
    }
}
