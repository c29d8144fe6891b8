// ── Transfer engine – SCP push & pull with chunked I/O ───────────────────────

use crate::scp::types::*;
use chrono::Utc;
use filetime::FileTime;
use log::{debug, info, warn};
use sshkit_core::{ScpHeader, SshError, SshErrorKind, SshResult, PERMISSION_MASK};
use sshkit_ssh::{Channel, Session, SftpFile};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

// ── Partial-write rule ───────────────────────────────────────────────────────

/// Destination that may accept fewer bytes than offered.
///
/// `offer` returns how many leading bytes of `buf` were taken; `0` means
/// the destination is momentarily full.
pub trait ChunkSink {
    fn offer(&mut self, buf: &[u8]) -> SshResult<usize>;
}

impl ChunkSink for Channel {
    fn offer(&mut self, buf: &[u8]) -> SshResult<usize> {
        self.write(buf)
    }
}

impl ChunkSink for SftpFile {
    fn offer(&mut self, buf: &[u8]) -> SshResult<usize> {
        self.write(buf)
    }
}

/// Hand all of `buf` to `sink`, re-offering the unwritten tail after short
/// writes and yielding when the sink accepts nothing.
pub fn write_fully<S: ChunkSink + ?Sized>(sink: &mut S, buf: &[u8]) -> SshResult<()> {
    let mut offset = 0;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        match sink.offer(&buf[offset..])? {
            0 => std::thread::yield_now(),
            n if n > remaining => {
                return Err(SshError::transfer(format!(
                    "engine reported {} bytes written of {} offered",
                    n, remaining
                )));
            }
            n => offset += n,
        }
    }
    Ok(())
}

/// Stream `reader` into `sink` in `chunk`-sized pieces.  Exactly `declared`
/// bytes must be sent.
fn send_stream<R: Read, S: ChunkSink + ?Sized>(
    reader: &mut R,
    sink: &mut S,
    declared: u64,
    chunk: usize,
) -> SshResult<u64> {
    let mut buffer = vec![0u8; chunk];
    let mut sent: u64 = 0;
    loop {
        let n = reader.read(&mut buffer).map_err(local_io("read local file"))?;
        if n == 0 {
            break;
        }
        if sent + n as u64 > declared {
            return Err(SshError::transfer(format!(
                "local file grew past its declared size of {} bytes",
                declared
            )));
        }
        write_fully(sink, &buffer[..n])?;
        sent += n as u64;
        debug!("scp push progress {}/{}", sent, declared);
    }
    if sent != declared {
        return Err(SshError::transfer(format!(
            "sent {} bytes but declared {}",
            sent, declared
        )));
    }
    Ok(sent)
}

/// Read exactly `declared` bytes from `channel` into `writer`.
fn receive_stream<W: Write>(
    channel: &mut Channel,
    writer: &mut W,
    declared: u64,
    chunk: usize,
) -> SshResult<u64> {
    let mut received: u64 = 0;
    while received < declared {
        let want = (declared - received).min(chunk as u64) as usize;
        let data = channel.read(want)?;
        if data.is_empty() {
            return Err(SshError::transfer(format!(
                "stream ended after {} of {} declared bytes",
                received, declared
            )));
        }
        writer.write_all(&data).map_err(local_io("write local file"))?;
        received += data.len() as u64;
    }
    Ok(received)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn local_io(context: &'static str) -> impl Fn(std::io::Error) -> SshError {
    move |e| SshError::io(format!("{}: {}", context, e))
}

fn channel_open_failed(path: &Path) -> impl FnOnce(SshError) -> SshError + '_ {
    move |e| {
        if e.kind == SshErrorKind::UseAfterClose {
            return e;
        }
        let mut err = SshError::transfer(format!(
            "cannot open scp channel for '{}': {}",
            path.display(),
            e.message
        ));
        err.code = e.code;
        err.errno = e.errno;
        err
    }
}

fn unix_secs(time: std::io::Result<SystemTime>) -> Option<u64> {
    time.ok()?.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

fn now_secs() -> u64 {
    unix_secs(Ok(SystemTime::now())).unwrap_or(0)
}

#[cfg(unix)]
fn local_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & PERMISSION_MASK
}

#[cfg(not(unix))]
fn local_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        SCP_DEFAULT_MODE
    }
}

#[cfg(unix)]
fn apply_local_mode(path: &Path, mode: u32) -> SshResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & PERMISSION_MASK))
        .map_err(local_io("set local permissions"))
}

#[cfg(not(unix))]
fn apply_local_mode(path: &Path, mode: u32) -> SshResult<()> {
    let mut perms = fs::metadata(path)
        .map_err(local_io("stat local file"))?
        .permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms).map_err(local_io("set local permissions"))
}

fn header_for(metadata: &fs::Metadata, options: &TransferOptions) -> ScpHeader {
    let mode = if options.preserve_mode {
        local_mode(metadata)
    } else {
        SCP_DEFAULT_MODE
    };
    let (mtime, atime) = if options.preserve_times {
        let mtime = unix_secs(metadata.modified()).unwrap_or_else(now_secs);
        let atime = unix_secs(metadata.accessed()).unwrap_or(mtime);
        (mtime, atime)
    } else {
        let now = now_secs();
        (now, now)
    };
    ScpHeader {
        mode,
        size: metadata.len(),
        mtime,
        atime,
    }
}

fn close_quietly(session: &Session, channel: Channel) {
    if let Err(e) = session.close_channel(channel) {
        warn!("closing scp channel after failure: {}", e);
    }
}

fn report(
    direction: TransferDirection,
    source: &Path,
    destination: &Path,
    header: &ScpHeader,
    transferred: u64,
    started: chrono::DateTime<Utc>,
    clock: Instant,
) -> TransferReport {
    let duration_ms = clock.elapsed().as_millis().max(1) as u64;
    TransferReport {
        transfer_id: Uuid::new_v4().to_string(),
        direction,
        source: source.display().to_string(),
        destination: destination.display().to_string(),
        declared_size: header.size,
        bytes_transferred: transferred,
        mode: header.mode & PERMISSION_MASK,
        mtime: header.mtime,
        atime: header.atime,
        started_at: started,
        duration_ms,
        average_speed: transferred as f64 / (duration_ms as f64 / 1000.0),
    }
}

// ── SCP Upload ───────────────────────────────────────────────────────────────

/// Upload `local` to `remote` over SCP.
///
/// The remote side receives the local permission bits and times (unless
/// disabled in `options`).  The channel is closed through `session` on both
/// success and failure.
pub fn push(
    session: &Session,
    local: impl AsRef<Path>,
    remote: impl AsRef<Path>,
    options: &TransferOptions,
) -> SshResult<TransferReport> {
    let (local, remote) = (local.as_ref(), remote.as_ref());
    let started = Utc::now();
    let clock = Instant::now();

    let metadata = fs::metadata(local).map_err(local_io("stat local file"))?;
    if !metadata.is_file() {
        return Err(SshError::io(format!(
            "'{}' is not a regular file",
            local.display()
        )));
    }
    let header = header_for(&metadata, options);
    let mut file = fs::File::open(local).map_err(local_io("open local file"))?;

    let mut channel = session
        .scp_send(remote, header)
        .map_err(channel_open_failed(remote))?;

    let sent = match send_stream(&mut file, &mut channel, header.size, options.effective_chunk_size()) {
        Ok(sent) => sent,
        Err(e) => {
            close_quietly(session, channel);
            return Err(e);
        }
    };

    let finished = channel
        .flush()
        .and_then(|_| channel.send_eof())
        .and_then(|_| channel.wait_eof())
        .and_then(|_| channel.wait_closed());
    if let Err(e) = finished {
        close_quietly(session, channel);
        return Err(e);
    }
    session.close_channel(channel)?;

    info!("SCP uploaded {} bytes to {}", sent, remote.display());
    Ok(report(
        TransferDirection::Push,
        local,
        remote,
        &header,
        sent,
        started,
        clock,
    ))
}

// ── SCP Download ─────────────────────────────────────────────────────────────

/// Download `remote` into `local` over SCP, creating or truncating it.
///
/// After the channel is closed the local file receives the permission bits
/// and times the remote header declared.
pub fn pull(
    session: &Session,
    remote: impl AsRef<Path>,
    local: impl AsRef<Path>,
    options: &TransferOptions,
) -> SshResult<TransferReport> {
    let (remote, local) = (remote.as_ref(), local.as_ref());
    let started = Utc::now();
    let clock = Instant::now();

    let (mut channel, header) = session
        .scp_recv(remote)
        .map_err(channel_open_failed(remote))?;

    let mut file = match fs::File::create(local) {
        Ok(file) => file,
        Err(e) => {
            close_quietly(session, channel);
            return Err(local_io("create local file")(e));
        }
    };

    let received = receive_stream(&mut channel, &mut file, header.size, options.effective_chunk_size())
        .and_then(|n| file.sync_all().map(|_| n).map_err(local_io("sync local file")));
    drop(file);
    let received = match received {
        Ok(n) => n,
        Err(e) => {
            close_quietly(session, channel);
            return Err(e);
        }
    };
    session.close_channel(channel)?;

    if options.preserve_mode {
        apply_local_mode(local, header.mode)?;
    }
    if options.preserve_times {
        filetime::set_file_times(
            local,
            FileTime::from_unix_time(header.atime as i64, 0),
            FileTime::from_unix_time(header.mtime as i64, 0),
        )
        .map_err(local_io("set local file times"))?;
    }

    info!("SCP downloaded {} bytes from {}", received, remote.display());
    Ok(report(
        TransferDirection::Pull,
        remote,
        local,
        &header,
        received,
        started,
        clock,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshkit_core::mock::{loopback_stream, MockRemote};

    fn authenticated() -> (MockRemote, Session) {
        let remote = MockRemote::new();
        remote.add_user("deploy", "hunter2");
        let session = Session::new(remote.connection());
        session.startup(loopback_stream().unwrap()).unwrap();
        session.userauth_password("deploy", "hunter2").unwrap();
        (remote, session)
    }

    /// Accepts at most half of what it is offered (rounded up).
    struct HalfSink(Vec<u8>, usize);

    impl ChunkSink for HalfSink {
        fn offer(&mut self, buf: &[u8]) -> SshResult<usize> {
            self.1 += 1;
            let n = (buf.len() + 1) / 2;
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    /// Alternates between stalling and accepting one byte.
    struct StallingSink(Vec<u8>, bool);

    impl ChunkSink for StallingSink {
        fn offer(&mut self, buf: &[u8]) -> SshResult<usize> {
            self.1 = !self.1;
            if self.1 {
                return Ok(0);
            }
            self.0.push(buf[0]);
            Ok(1)
        }
    }

    #[test]
    fn test_write_fully_half_writes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut sink = HalfSink(Vec::new(), 0);
        write_fully(&mut sink, &data).unwrap();
        assert_eq!(sink.0, data);
        assert!(sink.1 > 1);
    }

    #[test]
    fn test_write_fully_survives_stalls() {
        let mut sink = StallingSink(Vec::new(), false);
        write_fully(&mut sink, b"stall").unwrap();
        assert_eq!(sink.0, b"stall");
    }

    #[test]
    fn test_send_stream_rejects_size_mismatch() {
        let mut sink = HalfSink(Vec::new(), 0);
        let mut short: &[u8] = b"abc";
        let err = send_stream(&mut short, &mut sink, 5, 4096).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Transfer);

        let mut long: &[u8] = b"abcdefgh";
        let err = send_stream(&mut long, &mut sink, 5, 4096).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Transfer);
    }

    #[test]
    fn test_push_with_five_byte_writes() {
        let (remote, session) = authenticated();
        remote.set_write_cap(Some(5));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("digits.txt");
        fs::write(&local, b"0123456789\n9876543210").unwrap();

        let opts = TransferOptions::default().with_chunk_size(4096);
        let report = push(&session, &local, "/tmp/digits.txt", &opts).unwrap();
        assert_eq!(report.declared_size, 21);
        assert_eq!(report.bytes_transferred, 21);
        assert_eq!(report.direction, TransferDirection::Push);
        assert_eq!(
            remote.read_file("/tmp/digits.txt").unwrap(),
            b"0123456789\n9876543210"
        );
        assert_eq!(remote.open_channels(), 0);
    }

    #[test]
    fn test_push_with_half_chunk_writes() {
        let (remote, session) = authenticated();
        remote.set_write_cap(Some(2048));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(&local, &data).unwrap();

        let opts = TransferOptions::default().with_chunk_size(4096);
        push(&session, &local, "/tmp/blob.bin", &opts).unwrap();
        assert_eq!(remote.read_file("/tmp/blob.bin").unwrap(), data);
    }

    #[test]
    fn test_push_to_missing_directory_is_transfer_error() {
        let (remote, session) = authenticated();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        fs::write(&local, b"a").unwrap();
        let err = push(&session, &local, "/nowhere/a.txt", &TransferOptions::default()).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Transfer);
        assert!(!remote.exists("/nowhere/a.txt"));
    }

    #[test]
    fn test_push_missing_local_file_is_io_error() {
        let (_remote, session) = authenticated();
        let err = push(&session, "/definitely/not/here", "/tmp/x", &TransferOptions::default())
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Io);
    }

    #[cfg(unix)]
    #[test]
    fn test_push_pull_round_trip_preserves_metadata() {
        use std::os::unix::fs::PermissionsExt;

        let (remote, session) = authenticated();
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("config.ini");
        fs::write(&source, b"[core]\nname = demo\n").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o640)).unwrap();
        filetime::set_file_times(
            &source,
            FileTime::from_unix_time(1_600_000_100, 0),
            FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();

        let opts = TransferOptions::default();
        push(&session, &source, "/tmp/config.ini", &opts).unwrap();
        let stat = remote.stat("/tmp/config.ini").unwrap();
        assert_eq!(stat.permissions(), 0o640);
        assert_eq!(stat.mtime, 1_600_000_000);
        assert_eq!(stat.atime, 1_600_000_100);

        let target = dir.path().join("copy.ini");
        let report = pull(&session, "/tmp/config.ini", &target, &opts).unwrap();
        assert_eq!(report.bytes_transferred, 19);

        let meta = fs::metadata(&target).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_600_000_000
        );
        assert_eq!(
            FileTime::from_last_access_time(&meta).unix_seconds(),
            1_600_000_100
        );
        assert_eq!(fs::read(&target).unwrap(), b"[core]\nname = demo\n");
        assert_eq!(remote.open_channels(), 0);
    }

    #[test]
    fn test_pull_premature_eof_is_transfer_error() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/big", &[7u8; 100], 0o644);
        remote.set_scp_recv_limit(Some(40));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big");

        let err = pull(&session, "/tmp/big", &local, &TransferOptions::default()).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Transfer);
        assert_eq!(remote.open_channels(), 0);
        assert_eq!(fs::read(&local).unwrap().len(), 40);
    }

    #[test]
    fn test_pull_read_fault_closes_everything() {
        let (remote, session) = authenticated();
        remote.put_file("/tmp/log", &[1u8; 64], 0o644);
        remote.set_read_fault(Some(10));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("log");

        let err = pull(&session, "/tmp/log", &local, &TransferOptions::default()).unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Channel);
        assert_eq!(remote.open_channels(), 0);
        // The session stays usable.
        remote.set_read_fault(None);
        pull(&session, "/tmp/log", &local, &TransferOptions::default()).unwrap();
        assert_eq!(fs::read(&local).unwrap(), vec![1u8; 64]);
    }

    #[test]
    fn test_pull_missing_remote_is_transfer_error() {
        let (_remote, session) = authenticated();
        let dir = tempfile::tempdir().unwrap();
        let err = pull(&session, "/tmp/absent", dir.path().join("x"), &TransferOptions::default())
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Transfer);
    }

    #[test]
    fn test_transfer_after_close_is_use_after_close() {
        let (_remote, session) = authenticated();
        session.close(None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = pull(&session, "/tmp/a", dir.path().join("a"), &TransferOptions::default())
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::UseAfterClose);
    }
}
