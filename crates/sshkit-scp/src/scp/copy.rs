// ── Remote copy – SFTP read/write loop ───────────────────────────────────────

use crate::scp::transfer::write_fully;
use crate::scp::types::*;
use chrono::Utc;
use log::info;
use sshkit_core::{OpenFlags, SshResult, StatUpdate, DEFAULT_FILE_MODE};
use sshkit_ssh::Sftp;
use std::path::Path;
use std::time::Instant;
use uuid::Uuid;

/// Copy `src` to `dst` on the remote host in bounded chunks.
///
/// Data flows through this process; nothing larger than one chunk is held
/// in memory.  `dst` is created or truncated.  Unlike the SCP loops the copy
/// runs until the source reports end of file, so a source that changes size
/// mid-copy is copied as read.
pub fn copy_remote(
    sftp: &Sftp,
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    options: &TransferOptions,
) -> SshResult<TransferReport> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let started = Utc::now();
    let clock = Instant::now();

    let stat = sftp.stat(src)?;
    let mode = if options.preserve_mode {
        stat.permissions()
    } else {
        DEFAULT_FILE_MODE
    };

    let mut source = sftp.open_file(src, OpenFlags::read_only(), None)?;
    let mut target = sftp.open_file(dst, OpenFlags::write_create(), Some(mode))?;
    let chunk = options.effective_chunk_size();
    let mut copied: u64 = 0;
    loop {
        let data = source.read(chunk)?;
        if data.is_empty() {
            break;
        }
        write_fully(&mut target, &data)?;
        copied += data.len() as u64;
    }
    source.close()?;
    target.close()?;

    let mut update = StatUpdate::permissions(mode);
    if options.preserve_times {
        update.times = Some((stat.atime, stat.mtime));
    }
    sftp.set_stat(dst, &update)?;

    info!(
        "remote copy {} -> {} ({} bytes)",
        src.display(),
        dst.display(),
        copied
    );
    let duration_ms = clock.elapsed().as_millis().max(1) as u64;
    Ok(TransferReport {
        transfer_id: Uuid::new_v4().to_string(),
        direction: TransferDirection::RemoteCopy,
        source: src.display().to_string(),
        destination: dst.display().to_string(),
        declared_size: stat.size,
        bytes_transferred: copied,
        mode,
        mtime: stat.mtime,
        atime: stat.atime,
        started_at: started,
        duration_ms,
        average_speed: copied as f64 / (duration_ms as f64 / 1000.0),
    })
}
