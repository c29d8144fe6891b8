// ── SFTP subsystem ───────────────────────────────────────────────────────────

use crate::sftp::dir::SftpDir;
use crate::sftp::file::SftpFile;
use crate::ssh::registry::{with_live, SessionInner, SubsystemSlot, WeakInner};
use log::{debug, info, warn};
use sshkit_core::errno::{EEXIST, EIO};
use sshkit_core::trace::Component;
use sshkit_core::*;
use std::path::{Path, PathBuf};

/// Remote filesystem session opened by [`crate::Session::open_sftp`].
///
/// The subsystem tracks the file and directory handles opened through it
/// without owning them; shutting it down invalidates those handles, which
/// then fail with `UseAfterClose`.
pub struct Sftp {
    session: WeakInner,
    token: u64,
}

fn sftp_err<'a>(op: &'a str, path: &'a Path) -> impl FnOnce(BackendError) -> SshError + 'a {
    move |e| e.into_kind(SshErrorKind::Sftp, &format!("{} '{}'", op, path.display()))
}

/// Whether `src` and `dst` name one existing directory entry.  Only the
/// parent directories are canonicalised so a symlink and its target stay
/// distinct.
fn same_entry(slot: &mut SubsystemSlot, src: &Path, dst: &Path) -> bool {
    if src == dst {
        return slot.backend.lstat(src).is_ok();
    }
    let mut locate = |path: &Path| -> Option<PathBuf> {
        let name = path.file_name()?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        slot.backend.realpath(parent).ok().map(|dir| dir.join(name))
    };
    match (locate(src), locate(dst)) {
        (Some(a), Some(b)) => a == b && slot.backend.lstat(src).is_ok(),
        _ => false,
    }
}

impl Sftp {
    pub(crate) fn new(session: WeakInner, token: u64) -> Self {
        Self { session, token }
    }

    pub(crate) fn session_ref(&self) -> &WeakInner {
        &self.session
    }

    fn with<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SubsystemSlot) -> SshResult<T>,
    ) -> SshResult<T> {
        let token = self.token;
        with_live(&self.session, Component::Sftp, "sftp subsystem", operation, |inner| {
            f(inner.subsystem_mut(token)?)
        })
    }

    fn with_inner<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SessionInner) -> SshResult<T>,
    ) -> SshResult<T> {
        let token = self.token;
        with_live(&self.session, Component::Sftp, "sftp subsystem", operation, |inner| {
            inner.subsystem_mut(token)?;
            f(inner)
        })
    }

    // ── Handles ─────────────────────────────────────────────────────────

    /// Open a remote file.  `mode` applies when the file is created and
    /// defaults to `0o755`.
    pub fn open_file(
        &self,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: Option<u32>,
    ) -> SshResult<SftpFile> {
        let path = path.as_ref();
        let subsystem = self.token;
        let token = self.with_inner("open_file", |inner| {
            let slot = inner.subsystem_mut(subsystem)?;
            let mut backend = slot
                .backend
                .open(path, flags, mode.unwrap_or(DEFAULT_FILE_MODE))
                .map_err(sftp_err("open", path))?;
            let offset = if flags.append {
                match backend.fstat() {
                    Ok(stat) => stat.size,
                    Err(e) => {
                        if let Err(close_err) = backend.close() {
                            warn!("closing {} after failed fstat: {}", path.display(), close_err);
                        }
                        return Err(sftp_err("fstat", path)(e));
                    }
                }
            } else {
                0
            };
            inner.register_file(subsystem, backend, offset, flags.append)
        })?;
        debug!("opened remote file {}", path.display());
        Ok(SftpFile::new(self.session.clone(), token))
    }

    /// Open with an fopen-style mode string (`"r"`, `"w+"`, `"a"`, ...).
    pub fn open(&self, path: impl AsRef<Path>, mode: &str) -> SshResult<SftpFile> {
        let flags = OpenFlags::from_mode_str(mode)
            .ok_or_else(|| SshError::configuration(format!("invalid open mode '{}'", mode)))?;
        self.open_file(path, flags, None)
    }

    pub fn open_dir(&self, path: impl AsRef<Path>) -> SshResult<SftpDir> {
        let path = path.as_ref();
        let subsystem = self.token;
        let token = self.with_inner("open_dir", |inner| {
            let backend = inner
                .subsystem_mut(subsystem)?
                .backend
                .opendir(path)
                .map_err(sftp_err("opendir", path))?;
            inner.register_dir(subsystem, backend)
        })?;
        Ok(SftpDir::new(self.session.clone(), token))
    }

    pub fn close_file(&self, file: SftpFile) -> SshResult<()> {
        file.close()
    }

    pub fn close_dir(&self, dir: SftpDir) -> SshResult<()> {
        dir.close()
    }

    // ── Namespace ───────────────────────────────────────────────────────

    pub fn unlink(&self, path: impl AsRef<Path>) -> SshResult<()> {
        let path = path.as_ref();
        self.with("unlink", |slot| {
            slot.backend.unlink(path).map_err(sftp_err("unlink", path))
        })
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> SshResult<()> {
        self.unlink(path)
    }

    /// Rename `src` to `dst`, replacing an existing `dst`.
    ///
    /// When the server refuses because `dst` exists, `dst` is unlinked and
    /// the rename retried once; if either step fails the first error is
    /// returned.  Renaming an entry onto itself succeeds without touching it.
    pub fn rename(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> SshResult<()> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        self.with("rename", |slot| {
            let first = match slot.backend.rename(src, dst) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if same_entry(slot, src, dst) {
                return Ok(());
            }
            let refused = matches!(first.errno(), EEXIST | EIO);
            if refused && slot.backend.lstat(dst).is_ok() {
                debug!("rename target {} exists, replacing it", dst.display());
                if slot.backend.unlink(dst).is_ok() && slot.backend.rename(src, dst).is_ok() {
                    return Ok(());
                }
            }
            Err(first.into_kind(
                SshErrorKind::Sftp,
                &format!("rename '{}' -> '{}'", src.display(), dst.display()),
            ))
        })
    }

    /// `mode` defaults to `0o755`.
    pub fn mkdir(&self, path: impl AsRef<Path>, mode: Option<u32>) -> SshResult<()> {
        let path = path.as_ref();
        self.with("mkdir", |slot| {
            slot.backend
                .mkdir(path, mode.unwrap_or(DEFAULT_DIR_MODE))
                .map_err(sftp_err("mkdir", path))
        })
    }

    pub fn rmdir(&self, path: impl AsRef<Path>) -> SshResult<()> {
        let path = path.as_ref();
        self.with("rmdir", |slot| {
            slot.backend.rmdir(path).map_err(sftp_err("rmdir", path))
        })
    }

    /// Canonical absolute path; `NotFound` when `path` does not resolve.
    pub fn realpath(&self, path: impl AsRef<Path>) -> SshResult<PathBuf> {
        let path = path.as_ref();
        self.with("realpath", |slot| {
            slot.backend.realpath(path).map_err(sftp_err("realpath", path))
        })
    }

    pub fn readlink(&self, path: impl AsRef<Path>) -> SshResult<PathBuf> {
        let path = path.as_ref();
        self.with("readlink", |slot| {
            slot.backend.readlink(path).map_err(sftp_err("readlink", path))
        })
    }

    /// Create a symbolic link at `path` pointing to `target`.
    pub fn symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> SshResult<()> {
        let (path, target) = (path.as_ref(), target.as_ref());
        self.with("symlink", |slot| {
            slot.backend
                .symlink(path, target)
                .map_err(sftp_err("symlink", path))
        })
    }

    // ── Attributes ──────────────────────────────────────────────────────

    pub fn stat(&self, path: impl AsRef<Path>) -> SshResult<StatRecord> {
        let path = path.as_ref();
        self.with("stat", |slot| {
            slot.backend.stat(path).map_err(sftp_err("stat", path))
        })
    }

    /// Like [`Sftp::stat`] without following a final symlink.
    pub fn lstat(&self, path: impl AsRef<Path>) -> SshResult<StatRecord> {
        let path = path.as_ref();
        self.with("lstat", |slot| {
            slot.backend.lstat(path).map_err(sftp_err("lstat", path))
        })
    }

    /// Apply the supplied attribute groups; absent groups are untouched.
    pub fn set_stat(&self, path: impl AsRef<Path>, update: &StatUpdate) -> SshResult<()> {
        let path = path.as_ref();
        self.with("set_stat", |slot| {
            if update.is_empty() {
                return Ok(());
            }
            slot.backend
                .setstat(path, update)
                .map_err(sftp_err("setstat", path))
        })
    }

    /// Whether `path` resolves.  Failures other than the remote side's
    /// answer (closed session or subsystem) are still errors.
    pub fn exists(&self, path: impl AsRef<Path>) -> SshResult<bool> {
        match self.realpath(path) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind, SshErrorKind::NotFound | SshErrorKind::Sftp) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a remote file by reading it whole into memory, then writing it
    /// out.  Meant for small files; large ones should be streamed.
    pub fn copy_file(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> SshResult<u64> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        let mode = self.stat(src)?.permissions();
        let mut source = self.open_file(src, OpenFlags::read_only(), None)?;
        let content = source.read_all()?;
        source.close()?;

        let mut target = self.open_file(dst, OpenFlags::write_create(), Some(mode))?;
        let mut written = 0usize;
        while written < content.len() {
            match target.write(&content[written..])? {
                0 => std::thread::yield_now(),
                n => written += n,
            }
        }
        target.close()?;
        Ok(written as u64)
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Release the subsystem.  Handles still open through it are closed on
    /// the engine side and become invalid.
    pub fn shutdown(&self) -> SshResult<()> {
        let token = self.token;
        self.with_inner("shutdown", |inner| {
            let orphans = {
                let slot = inner.subsystem_mut(token)?;
                slot.files.len() + slot.dirs.len()
            };
            if orphans > 0 {
                info!("[{}] sftp shutdown invalidates {} open handle(s)", inner.id, orphans);
            }
            inner.release_subsystem(token)
        })
    }
}

impl std::fmt::Debug for Sftp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sftp").field("token", &self.token).finish()
    }
}

impl Drop for Sftp {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                if inner.subsystems.contains_key(&self.token) {
                    let _ = inner.release_subsystem(self.token);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::authenticated;

    #[test]
    fn test_write_then_read_back() {
        let (remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let mut file = sftp.open("/home/alice/notes.txt", "w").unwrap();
        assert_eq!(file.write(b"first line\n").unwrap(), 11);
        assert_eq!(file.tell().unwrap(), 11);
        file.close().unwrap();
        assert_eq!(remote.read_file("/home/alice/notes.txt").unwrap(), b"first line\n");

        let mut file = sftp.open("/home/alice/notes.txt", "a").unwrap();
        assert_eq!(file.tell().unwrap(), 11);
        file.write(b"second\n").unwrap();
        file.close().unwrap();

        let mut file = sftp.open("/home/alice/notes.txt", "r").unwrap();
        assert_eq!(file.read_all().unwrap(), b"first line\nsecond\n");
    }

    #[test]
    fn test_append_offset_follows_remote_size() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/digits", b"0123456789", 0o644);
        let sftp = session.open_sftp().unwrap();
        let mut file = sftp.open("/tmp/digits", "a").unwrap();
        assert_eq!(file.tell().unwrap(), 10);
        file.seek(2).unwrap();
        assert_eq!(file.write(b"XY").unwrap(), 2);
        assert_eq!(file.tell().unwrap(), 12);
        file.close().unwrap();
        assert_eq!(remote.read_file("/tmp/digits").unwrap(), b"0123456789XY");
    }

    #[test]
    fn test_append_open_fails_when_size_unknown() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/journal", b"entry\n", 0o644);
        remote.set_fstat_failure(true);
        let sftp = session.open_sftp().unwrap();
        let err = sftp.open("/tmp/journal", "a").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Sftp);
        assert!(err.message.contains("/tmp/journal"));
        assert_eq!(remote.open_files(), 0);

        let file = sftp.open("/tmp/journal", "r").unwrap();
        file.close().unwrap();
        remote.set_fstat_failure(false);
        let mut file = sftp.open("/tmp/journal", "a").unwrap();
        assert_eq!(file.tell().unwrap(), 6);
    }

    #[test]
    fn test_unbounded_read_request_is_chunked() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/abc", b"abc", 0o644);
        let sftp = session.open_sftp().unwrap();
        let mut file = sftp.open("/tmp/abc", "r").unwrap();
        assert_eq!(file.read(usize::MAX).unwrap(), b"abc");
        assert!(file.read(usize::MAX).unwrap().is_empty());
        assert_eq!(file.tell().unwrap(), 3);
        file.close().unwrap();
        assert!(sftp.exists("/tmp/abc").unwrap());
    }

    #[test]
    fn test_handles_format_with_token() {
        let (_remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let dir = sftp.open_dir("/tmp").unwrap();
        assert!(format!("{:?}", sftp).starts_with("Sftp {"));
        assert!(format!("{:?}", dir).starts_with("SftpDir {"));
        let listener = session.listen_forward(0, None, None).unwrap().unwrap();
        assert!(format!("{:?}", listener).contains("bound_port"));
    }

    #[test]
    fn test_seek_and_partial_read() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/digits", b"0123456789", 0o644);
        let sftp = session.open_sftp().unwrap();
        let mut file = sftp.open_file("/tmp/digits", OpenFlags::read_only(), None).unwrap();
        file.seek(4).unwrap();
        assert_eq!(file.read(3).unwrap(), b"456");
        assert_eq!(file.tell().unwrap(), 7);
        assert_eq!(file.read_all().unwrap(), b"789");
        assert!(file.read(8).unwrap().is_empty());
        assert_eq!(file.stat().unwrap().size, 10);
    }

    #[test]
    fn test_invalid_mode_string() {
        let (_remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let err = sftp.open("/tmp/x", "q").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let (_remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let err = sftp.stat("/nope").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotFound);
        assert_eq!(err.errno, Some(errno::ENOENT));
        assert!(!sftp.exists("/nope").unwrap());
        assert!(sftp.exists("/tmp").unwrap());
    }

    #[test]
    fn test_rename_replaces_existing_destination() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/new", b"new", 0o644);
        remote.put_file("/tmp/old", b"old", 0o644);
        let sftp = session.open_sftp().unwrap();
        sftp.rename("/tmp/new", "/tmp/old").unwrap();
        assert_eq!(remote.read_file("/tmp/old").unwrap(), b"new");
        assert!(!remote.exists("/tmp/new"));
    }

    #[test]
    fn test_rename_onto_itself_keeps_file() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/keep", b"precious", 0o644);
        let sftp = session.open_sftp().unwrap();
        sftp.rename("/tmp/keep", "/tmp/keep").unwrap();
        sftp.rename("/tmp/keep", "/tmp/../tmp/keep").unwrap();
        assert_eq!(remote.read_file("/tmp/keep").unwrap(), b"precious");

        assert!(sftp.rename("/tmp/absent", "/tmp/absent").is_err());
    }

    #[test]
    fn test_rename_failure_reports_first_error() {
        let (_remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let err = sftp.rename("/tmp/absent", "/tmp/other").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::NotFound);
    }

    #[test]
    fn test_directory_operations() {
        let (remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        sftp.mkdir("/tmp/build", None).unwrap();
        assert_eq!(sftp.stat("/tmp/build").unwrap().permissions(), DEFAULT_DIR_MODE);
        remote.put_file("/tmp/build/a.o", b"a", 0o644);
        remote.put_file("/tmp/build/b.o", b"bb", 0o644);

        let mut dir = sftp.open_dir("/tmp/build").unwrap();
        let entries = dir.list_all().unwrap();
        let names: Vec<_> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec![".", "..", "a.o", "b.o"]);
        assert_eq!(entries["b.o"].size, 2);
        dir.close().unwrap();

        let err = sftp.rmdir("/tmp/build").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Sftp);
        sftp.remove("/tmp/build/a.o").unwrap();
        sftp.unlink("/tmp/build/b.o").unwrap();
        sftp.rmdir("/tmp/build").unwrap();
        assert!(!remote.exists("/tmp/build"));
    }

    #[test]
    fn test_dir_iterator() {
        let (remote, session) = authenticated();
        remote.put_dir("/srv", 0o755);
        remote.put_file("/srv/index.html", b"<html/>", 0o644);
        let sftp = session.open_sftp().unwrap();
        let dir = sftp.open_dir("/srv").unwrap();
        let names: Vec<String> = dir.map(|e| e.unwrap().0).collect();
        assert_eq!(names, vec![".", "..", "index.html"]);
        assert_eq!(remote.open_dirs(), 0);
    }

    #[test]
    fn test_symlink_points_at_target() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/real", b"data", 0o644);
        let sftp = session.open_sftp().unwrap();
        sftp.symlink("/tmp/link", "/tmp/real").unwrap();
        assert_eq!(sftp.readlink("/tmp/link").unwrap(), PathBuf::from("/tmp/real"));
        assert!(sftp.lstat("/tmp/link").unwrap().is_symlink());
        assert!(sftp.stat("/tmp/link").unwrap().is_file());
        assert_eq!(sftp.realpath("/tmp/link").unwrap(), PathBuf::from("/tmp/real"));
    }

    #[test]
    fn test_set_stat_updates_only_given_fields() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/f", b"x", 0o600);
        remote.set_times("/tmp/f", 100, 200);
        let sftp = session.open_sftp().unwrap();
        sftp.set_stat("/tmp/f", &StatUpdate::permissions(0o640)).unwrap();
        let stat = sftp.stat("/tmp/f").unwrap();
        assert_eq!(stat.permissions(), 0o640);
        assert_eq!((stat.atime, stat.mtime), (100, 200));

        let times = StatUpdate {
            times: Some((1_000, 2_000)),
            ..Default::default()
        };
        sftp.set_stat("/tmp/f", &times).unwrap();
        let stat = sftp.stat("/tmp/f").unwrap();
        assert_eq!(stat.permissions(), 0o640);
        assert_eq!((stat.atime, stat.mtime), (1_000, 2_000));
    }

    #[test]
    fn test_copy_file_with_short_writes() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/src", b"The quick brown fox", 0o600);
        remote.set_write_cap(Some(4));
        let sftp = session.open_sftp().unwrap();
        assert_eq!(sftp.copy_file("/tmp/src", "/tmp/dst").unwrap(), 19);
        assert_eq!(remote.read_file("/tmp/dst").unwrap(), b"The quick brown fox");
        assert_eq!(remote.stat("/tmp/dst").unwrap().permissions(), 0o600);
    }

    #[test]
    fn test_shutdown_orphans_handles() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/keep", b"contents", 0o644);
        let before = remote.tree();

        let sftp = session.open_sftp().unwrap();
        let mut file = sftp.open("/tmp/keep", "r").unwrap();
        let mut dir = sftp.open_dir("/tmp").unwrap();
        assert_eq!((remote.open_files(), remote.open_dirs()), (1, 1));

        session.shutdown_sftp(&sftp).unwrap();
        assert_eq!(remote.open_files(), 0);
        assert_eq!(remote.open_dirs(), 0);
        assert_eq!(remote.open_subsystems(), 0);

        assert_eq!(file.read(4).unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(dir.read_entry().unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(file.close().unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(sftp.stat("/").unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(sftp.shutdown().unwrap_err().kind, SshErrorKind::UseAfterClose);
        assert_eq!(remote.tree(), before);

        // The session itself is unaffected.
        assert!(session.open_sftp().is_ok());
    }

    #[test]
    fn test_drop_sftp_releases_subsystem() {
        let (remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let file = sftp.open("/tmp/new", "w").unwrap();
        drop(sftp);
        assert_eq!(remote.open_subsystems(), 0);
        assert_eq!(remote.open_files(), 0);
        drop(file);
    }

    #[test]
    fn test_shutdown_through_other_session_rejected() {
        let (_r1, first) = authenticated();
        let (_r2, second) = authenticated();
        let sftp = first.open_sftp().unwrap();
        let err = second.shutdown_sftp(&sftp).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Configuration);
        assert!(sftp.stat("/").is_ok());
    }

    #[test]
    fn test_io_traits_on_file() {
        use std::io::{Read, Seek, SeekFrom, Write};

        let (_remote, session) = authenticated();
        let sftp = session.open_sftp().unwrap();
        let mut file = sftp.open("/tmp/io", "w+").unwrap();
        file.write_all(b"abcdef").unwrap();
        assert_eq!(Seek::seek(&mut file, SeekFrom::End(-2)).unwrap(), 4);
        let mut tail = String::new();
        file.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "ef");
    }
}
