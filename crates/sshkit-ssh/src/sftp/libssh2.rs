// ── libssh2 SFTP engine ──────────────────────────────────────────────────────

use crate::ssh::libssh2::{from_io, from_ssh2};
use sshkit_core::backend::{SftpBackend, SftpDirBackend, SftpFileBackend};
use sshkit_core::errno::{ENGINE_FILE, ENGINE_SFTP_PROTOCOL};
use sshkit_core::*;
use ssh2::{ErrorCode, FileStat, OpenType};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

fn stat_record(stat: &FileStat) -> StatRecord {
    StatRecord {
        mode: stat.perm.unwrap_or(0),
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime.unwrap_or(0),
        atime: stat.atime.unwrap_or(0),
        uid: stat.uid.unwrap_or(0),
        gid: stat.gid.unwrap_or(0),
    }
}

fn open_flags(flags: OpenFlags) -> ssh2::OpenFlags {
    let mut out = ssh2::OpenFlags::empty();
    if flags.read {
        out |= ssh2::OpenFlags::READ;
    }
    if flags.write {
        out |= ssh2::OpenFlags::WRITE;
    }
    if flags.append {
        out |= ssh2::OpenFlags::APPEND;
    }
    if flags.create {
        out |= ssh2::OpenFlags::CREATE;
    }
    if flags.truncate {
        out |= ssh2::OpenFlags::TRUNCATE;
    }
    if flags.exclusive {
        out |= ssh2::OpenFlags::EXCLUSIVE;
    }
    out
}

pub(crate) struct Libssh2Sftp {
    sftp: ssh2::Sftp,
}

impl Libssh2Sftp {
    pub(crate) fn new(sftp: ssh2::Sftp) -> Self {
        Self { sftp }
    }
}

impl SftpBackend for Libssh2Sftp {
    fn open(
        &mut self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> BackendResult<Box<dyn SftpFileBackend>> {
        let file = self
            .sftp
            .open_mode(path, open_flags(flags), mode as i32, OpenType::File)
            .map_err(from_ssh2)?;
        Ok(Box::new(Libssh2File(file)))
    }

    fn opendir(&mut self, path: &Path) -> BackendResult<Box<dyn SftpDirBackend>> {
        let dir = self.sftp.opendir(path).map_err(from_ssh2)?;
        Ok(Box::new(Libssh2Dir(dir)))
    }

    fn unlink(&mut self, path: &Path) -> BackendResult<()> {
        self.sftp.unlink(path).map_err(from_ssh2)
    }

    fn rename(&mut self, src: &Path, dst: &Path) -> BackendResult<()> {
        self.sftp.rename(src, dst, None).map_err(from_ssh2)
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> BackendResult<()> {
        self.sftp.mkdir(path, mode as i32).map_err(from_ssh2)
    }

    fn rmdir(&mut self, path: &Path) -> BackendResult<()> {
        self.sftp.rmdir(path).map_err(from_ssh2)
    }

    fn realpath(&mut self, path: &Path) -> BackendResult<PathBuf> {
        self.sftp.realpath(path).map_err(from_ssh2)
    }

    fn readlink(&mut self, path: &Path) -> BackendResult<PathBuf> {
        self.sftp.readlink(path).map_err(from_ssh2)
    }

    fn symlink(&mut self, path: &Path, target: &Path) -> BackendResult<()> {
        // ssh2 creates the link at its second argument.
        self.sftp.symlink(target, path).map_err(from_ssh2)
    }

    fn stat(&mut self, path: &Path) -> BackendResult<StatRecord> {
        self.sftp.stat(path).map(|s| stat_record(&s)).map_err(from_ssh2)
    }

    fn lstat(&mut self, path: &Path) -> BackendResult<StatRecord> {
        self.sftp.lstat(path).map(|s| stat_record(&s)).map_err(from_ssh2)
    }

    fn setstat(&mut self, path: &Path, update: &StatUpdate) -> BackendResult<()> {
        let stat = FileStat {
            size: None,
            uid: update.owner.map(|(uid, _)| uid),
            gid: update.owner.map(|(_, gid)| gid),
            perm: update.permissions,
            atime: update.times.map(|(atime, _)| atime),
            mtime: update.times.map(|(_, mtime)| mtime),
        };
        self.sftp.setstat(path, stat).map_err(from_ssh2)
    }

    fn shutdown(&mut self) -> BackendResult<()> {
        self.sftp.shutdown().map_err(from_ssh2)
    }
}

// ── Handles ──────────────────────────────────────────────────────────────────

struct Libssh2File(ssh2::File);

impl SftpFileBackend for Libssh2File {
    fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize> {
        self.0
            .read(buf)
            .map_err(|e| from_io(e, ENGINE_SFTP_PROTOCOL))
    }

    fn write(&mut self, buf: &[u8]) -> BackendResult<usize> {
        self.0
            .write(buf)
            .map_err(|e| from_io(e, ENGINE_SFTP_PROTOCOL))
    }

    fn seek(&mut self, offset: u64) -> BackendResult<()> {
        self.0
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| from_io(e, ENGINE_SFTP_PROTOCOL))
    }

    fn fstat(&mut self) -> BackendResult<StatRecord> {
        self.0.stat().map(|s| stat_record(&s)).map_err(from_ssh2)
    }

    fn close(&mut self) -> BackendResult<()> {
        self.0.close().map_err(from_ssh2)
    }
}

struct Libssh2Dir(ssh2::File);

impl SftpDirBackend for Libssh2Dir {
    fn readdir(&mut self) -> BackendResult<Option<(String, StatRecord)>> {
        match self.0.readdir() {
            Ok((path, stat)) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned());
                Ok(Some((name, stat_record(&stat))))
            }
            // End of listing.
            Err(e) if matches!(e.code(), ErrorCode::Session(ENGINE_FILE)) => Ok(None),
            Err(e) => Err(from_ssh2(e)),
        }
    }

    fn close(&mut self) -> BackendResult<()> {
        self.0.close().map_err(from_ssh2)
    }
}
