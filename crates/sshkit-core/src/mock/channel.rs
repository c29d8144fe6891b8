// ── Mock channels and listener ───────────────────────────────────────────────

use super::{lock, Shared};
use crate::backend::{ChannelBackend, ListenerBackend};
use crate::errno::*;
use crate::error::{BackendError, BackendResult};
use crate::types::*;
use std::collections::VecDeque;

const WINDOW_DEFAULT: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    /// Plain session channel; becomes an exec or shell on request.
    Session,
    /// Direct or forwarded TCP stream echoing its input.
    Tunnel,
    ScpSink { path: String, header: ScpHeader },
    ScpSource,
}

pub(crate) struct MockChannel {
    state: Shared,
    kind: ChannelKind,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    received: Vec<u8>,
    exit_status: i32,
    started: bool,
    echo: bool,
    remote_eof: bool,
    eof_sent: bool,
    closed: bool,
    delivered: usize,
}

impl MockChannel {
    pub fn new(state: Shared, kind: ChannelKind) -> Self {
        lock(&state).open_channels += 1;
        let echo = kind == ChannelKind::Tunnel;
        Self {
            state,
            kind,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            received: Vec::new(),
            exit_status: 0,
            started: false,
            echo,
            remote_eof: false,
            eof_sent: false,
            closed: false,
            delivered: 0,
        }
    }

    pub fn source(state: Shared, content: &[u8]) -> Self {
        let mut ch = Self::new(state, ChannelKind::ScpSource);
        ch.stdout.extend(content);
        ch.remote_eof = true;
        ch
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::new(ENGINE_CHANNEL_CLOSED, "channel closed"));
        }
        Ok(())
    }

    fn ensure_idle(&self) -> BackendResult<()> {
        self.ensure_open()?;
        if self.started || self.kind != ChannelKind::Session {
            return Err(BackendError::new(
                ENGINE_CHANNEL_REQUEST_DENIED,
                "channel request denied",
            ));
        }
        Ok(())
    }

    fn commit_scp_upload(&self) {
        if let ChannelKind::ScpSink { path, header } = &self.kind {
            let mut st = lock(&self.state);
            st.fs.insert_file(path, self.received.clone(), header.mode & 0o7777);
            if let Some(node) = st.fs.get_mut(path) {
                node.stat.mtime = header.mtime;
                node.stat.atime = header.atime;
            }
        }
    }
}

impl ChannelBackend for MockChannel {
    fn exec(&mut self, command: &str) -> BackendResult<()> {
        self.ensure_idle()?;
        self.started = true;
        self.remote_eof = true;
        let known = lock(&self.state).commands.get(command).cloned();
        match known {
            Some(out) => {
                self.stdout.extend(out.stdout);
                self.stderr.extend(out.stderr);
                self.exit_status = out.exit_status;
            }
            None => match command.strip_prefix("echo ") {
                Some(text) => {
                    self.stdout.extend(text.as_bytes());
                    self.stdout.push_back(b'\n');
                }
                None => {
                    let msg = format!("sh: {}: command not found\n", command);
                    self.stderr.extend(msg.as_bytes());
                    self.exit_status = 127;
                }
            },
        }
        Ok(())
    }

    fn shell(&mut self) -> BackendResult<()> {
        self.ensure_idle()?;
        self.started = true;
        self.echo = true;
        Ok(())
    }

    fn request_pty(&mut self, term: &str, _size: Option<PtySize>) -> BackendResult<()> {
        self.ensure_open()?;
        if term.is_empty() {
            return Err(BackendError::new(ENGINE_CHANNEL_REQUEST_DENIED, "empty terminal type"));
        }
        Ok(())
    }

    fn request_pty_size(&mut self, size: PtySize) -> BackendResult<()> {
        self.ensure_open()?;
        if size.width == 0 || size.height == 0 {
            return Err(BackendError::new(ENGINE_INVAL, "zero-sized terminal"));
        }
        Ok(())
    }

    fn setenv(&mut self, name: &str, _value: &str) -> BackendResult<()> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(BackendError::new(ENGINE_CHANNEL_REQUEST_DENIED, "setenv denied"));
        }
        Ok(())
    }

    fn x11_req(&mut self, _request: &X11Request) -> BackendResult<()> {
        self.ensure_open()
    }

    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> BackendResult<usize> {
        self.ensure_open()?;
        if stream_id != 0 {
            let n = buf.len().min(self.stderr.len());
            for (slot, byte) in buf.iter_mut().zip(self.stderr.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        let (fault, limit) = {
            let st = lock(&self.state);
            (st.read_fault_after, st.scp_recv_limit)
        };
        if let Some(after) = fault {
            if self.delivered >= after {
                return Err(BackendError::new(ENGINE_SOCKET_RECV, "connection reset during read"));
            }
        }
        let mut allowed = buf.len().min(self.stdout.len());
        if self.kind == ChannelKind::ScpSource {
            if let Some(limit) = limit {
                allowed = allowed.min(limit.saturating_sub(self.delivered));
            }
        }
        if let Some(after) = fault {
            allowed = allowed.min(after - self.delivered);
        }
        for (slot, byte) in buf.iter_mut().zip(self.stdout.drain(..allowed)) {
            *slot = byte;
        }
        self.delivered += allowed;
        Ok(allowed)
    }

    fn write(&mut self, buf: &[u8]) -> BackendResult<usize> {
        self.ensure_open()?;
        if self.eof_sent {
            return Err(BackendError::new(ENGINE_CHANNEL_EOF_SENT, "EOF already sent"));
        }
        let cap = lock(&self.state).write_cap.unwrap_or(usize::MAX);
        let n = buf.len().min(cap);
        if self.echo {
            self.stdout.extend(&buf[..n]);
        }
        self.received.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.ensure_open()
    }

    fn send_eof(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        if !self.eof_sent {
            self.eof_sent = true;
            self.commit_scp_upload();
            if self.echo || matches!(self.kind, ChannelKind::ScpSink { .. }) {
                self.remote_eof = true;
            }
        }
        Ok(())
    }

    fn wait_eof(&mut self) -> BackendResult<()> {
        self.ensure_open()?;
        if !self.remote_eof {
            return Err(BackendError::new(
                ENGINE_INVAL,
                "peer never sends EOF on an idle channel",
            ));
        }
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.closed = true;
        Ok(())
    }

    fn wait_close(&mut self) -> BackendResult<()> {
        if !self.eof_sent && !self.closed {
            return Err(BackendError::new(ENGINE_INVAL, "channel is not in EOF state"));
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        self.remote_eof && self.stdout.is_empty()
    }

    fn poll_readable(&mut self, extended: bool) -> BackendResult<bool> {
        self.ensure_open()?;
        Ok(if extended {
            !self.stderr.is_empty()
        } else {
            !self.stdout.is_empty()
        })
    }

    fn read_window(&self) -> WindowStatus {
        WindowStatus {
            available: self.stdout.len().min(WINDOW_DEFAULT as usize) as u32,
            initial: WINDOW_DEFAULT,
        }
    }

    fn write_window(&self) -> WindowStatus {
        let cap = lock(&self.state).write_cap.unwrap_or(WINDOW_DEFAULT as usize);
        WindowStatus {
            available: cap.min(WINDOW_DEFAULT as usize) as u32,
            initial: WINDOW_DEFAULT,
        }
    }

    fn exit_status(&self) -> BackendResult<i32> {
        Ok(self.exit_status)
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        st.open_channels = st.open_channels.saturating_sub(1);
    }
}

pub(crate) struct MockListener {
    pub state: Shared,
}

impl ListenerBackend for MockListener {
    fn accept(&mut self) -> BackendResult<Box<dyn ChannelBackend>> {
        Ok(Box::new(MockChannel::new(self.state.clone(), ChannelKind::Tunnel)))
    }
}

/// Header a remote `scp -f` would announce for a file.
pub(crate) fn scp_header(stat: &StatRecord) -> ScpHeader {
    ScpHeader {
        mode: stat.mode,
        size: stat.size,
        mtime: stat.mtime,
        atime: stat.atime,
    }
}
