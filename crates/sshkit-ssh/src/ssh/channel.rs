// ── Channel ──────────────────────────────────────────────────────────────────

use crate::ssh::registry::{with_live, ChannelSlot, SessionInner, WeakInner};
use sshkit_core::trace::Component;
use sshkit_core::*;
use std::io;

/// Chunk used when draining a stream to exhaustion.
const DRAIN_CHUNK: usize = 32 * 1024;

/// Duplex byte stream multiplexed over a [`crate::Session`].
///
/// Only a token is held here; the engine channel lives in the session's
/// registry and is closed through [`crate::Session::close_channel`].
pub struct Channel {
    session: WeakInner,
    token: u64,
}

fn channel_err(context: &str) -> impl FnOnce(BackendError) -> SshError + '_ {
    move |e| e.into_kind(SshErrorKind::Channel, context)
}

impl Channel {
    pub(crate) fn new(session: WeakInner, token: u64) -> Self {
        Self { session, token }
    }

    pub(crate) fn session_ref(&self) -> &WeakInner {
        &self.session
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    fn with<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut ChannelSlot) -> SshResult<T>,
    ) -> SshResult<T> {
        let token = self.token;
        with_live(&self.session, Component::Channel, "channel", operation, |inner| {
            f(inner.channel_mut(token)?)
        })
    }

    fn with_session<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut SessionInner) -> SshResult<T>,
    ) -> SshResult<T> {
        let token = self.token;
        with_live(&self.session, Component::Channel, "channel", operation, |inner| {
            inner.channel_mut(token)?;
            f(inner)
        })
    }

    // ── Requests ────────────────────────────────────────────────────────

    pub fn exec(&mut self, command: &str) -> SshResult<()> {
        self.with("exec", |slot| {
            slot.backend.exec(command).map_err(channel_err("exec"))
        })
    }

    pub fn shell(&mut self) -> SshResult<()> {
        self.with("shell", |slot| slot.backend.shell().map_err(channel_err("shell")))
    }

    pub fn request_pty(&mut self, term: &str, size: Option<PtySize>) -> SshResult<()> {
        self.with("request_pty", |slot| {
            slot.backend
                .request_pty(term, size)
                .map_err(channel_err("request pty"))
        })
    }

    pub fn resize_pty(&mut self, size: PtySize) -> SshResult<()> {
        self.with("resize_pty", |slot| {
            slot.backend
                .request_pty_size(size)
                .map_err(channel_err("resize pty"))
        })
    }

    pub fn set_env(&mut self, name: &str, value: &str) -> SshResult<()> {
        self.with("set_env", |slot| {
            slot.backend.setenv(name, value).map_err(channel_err("setenv"))
        })
    }

    pub fn request_x11_forward(&mut self, request: &X11Request) -> SshResult<()> {
        self.with("request_x11_forward", |slot| {
            slot.backend.x11_req(request).map_err(channel_err("x11 request"))
        })
    }

    // ── Data ────────────────────────────────────────────────────────────

    /// Read up to `max` bytes of stream 0, at most one 32 KiB chunk per
    /// call; empty on EOF.
    pub fn read(&mut self, max: usize) -> SshResult<Vec<u8>> {
        self.read_extended(max, 0)
    }

    pub fn read_extended(&mut self, max: usize, stream_id: i32) -> SshResult<Vec<u8>> {
        self.with("read", |slot| {
            let mut buf = vec![0u8; max.min(DRAIN_CHUNK)];
            let n = slot
                .backend
                .read_stream(stream_id, &mut buf)
                .map_err(channel_err("read"))?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    pub fn read_stderr(&mut self, max: usize) -> SshResult<Vec<u8>> {
        self.read_extended(max, STDERR_STREAM)
    }

    /// Everything left on stream 0, read in chunks until the engine reports
    /// no more data.  A would-block answer counts as exhaustion.
    pub fn read_all(&mut self) -> SshResult<Vec<u8>> {
        self.with("read_all", |slot| drain(slot, 0))
    }

    pub fn read_all_stderr(&mut self) -> SshResult<Vec<u8>> {
        self.with("read_all_stderr", |slot| drain(slot, STDERR_STREAM))
    }

    /// Offer `buf`; returns how much the engine took, possibly less than
    /// offered or zero when the window is exhausted.
    pub fn write(&mut self, buf: &[u8]) -> SshResult<usize> {
        self.with("write", |slot| {
            if slot.state != ChannelState::Open {
                return Err(SshError::channel(format!(
                    "write on channel in state {:?}",
                    slot.state
                )));
            }
            match slot.backend.write(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.is_would_block() => Ok(0),
                Err(e) => Err(e.into_kind(SshErrorKind::Channel, "write")),
            }
        })
    }

    pub fn flush(&mut self) -> SshResult<()> {
        self.with("flush", |slot| slot.backend.flush().map_err(channel_err("flush")))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn send_eof(&mut self) -> SshResult<()> {
        self.with("send_eof", |slot| {
            slot.backend.send_eof().map_err(channel_err("send eof"))?;
            if slot.state == ChannelState::Open {
                slot.state = ChannelState::EofSent;
            }
            Ok(())
        })
    }

    /// Block until the peer's EOF arrives.
    pub fn wait_eof(&mut self) -> SshResult<()> {
        self.with("wait_eof", |slot| {
            slot.backend.wait_eof().map_err(channel_err("wait eof"))?;
            if slot.state == ChannelState::EofSent {
                slot.state = ChannelState::EofReceived;
            }
            Ok(())
        })
    }

    /// Block until the peer closes its side.
    pub fn wait_closed(&mut self) -> SshResult<()> {
        self.with("wait_closed", |slot| {
            slot.backend.wait_close().map_err(channel_err("wait closed"))?;
            slot.state = ChannelState::WaitClosed;
            Ok(())
        })
    }

    pub fn eof(&self) -> SshResult<bool> {
        self.with("eof", |slot| Ok(slot.backend.eof()))
    }

    pub fn state(&self) -> SshResult<ChannelState> {
        self.with("state", |slot| Ok(slot.state))
    }

    // ── Flow control ────────────────────────────────────────────────────

    /// Non-blocking readiness check.
    pub fn poll_readable(&mut self, extended: bool) -> SshResult<bool> {
        self.with("poll_readable", |slot| {
            slot.backend
                .poll_readable(extended)
                .map_err(channel_err("poll"))
        })
    }

    pub fn read_window(&self) -> SshResult<WindowStatus> {
        self.with("read_window", |slot| Ok(slot.backend.read_window()))
    }

    pub fn write_window(&self) -> SshResult<WindowStatus> {
        self.with("write_window", |slot| Ok(slot.backend.write_window()))
    }

    /// Blocking mode is a property of the whole connection.
    pub fn set_blocking(&mut self, blocking: bool) -> SshResult<()> {
        self.with_session("set_blocking", |inner| {
            inner.conn.set_blocking(blocking);
            Ok(())
        })
    }

    pub fn exit_status(&self) -> SshResult<i32> {
        self.with("exit_status", |slot| {
            slot.backend.exit_status().map_err(channel_err("exit status"))
        })
    }
}

fn drain(slot: &mut ChannelSlot, stream_id: i32) -> SshResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; DRAIN_CHUNK];
    loop {
        match slot.backend.read_stream(stream_id, &mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.is_would_block() => break,
            Err(e) => return Err(e.into_kind(SshErrorKind::Channel, "read")),
        }
    }
    Ok(out)
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.channels.remove(&self.token);
            }
        }
    }
}

impl io::Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with("read", |slot| {
            slot.backend
                .read_stream(0, buf)
                .map_err(channel_err("read"))
        })
        .map_err(to_io)
    }
}

impl io::Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(self, buf).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Channel::flush(self).map_err(to_io)
    }
}

pub(crate) fn to_io(e: SshError) -> io::Error {
    let kind = match e.kind {
        SshErrorKind::NotFound => io::ErrorKind::NotFound,
        SshErrorKind::UseAfterClose => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("token", &self.token).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::authenticated;

    #[test]
    fn test_exec_collects_streams_and_status() {
        let (remote, session) = authenticated();
        remote.set_command("uname -s", b"Linux\n", b"warning: deprecated\n", 0);
        let mut channel = session.open_channel().unwrap();
        channel.exec("uname -s").unwrap();
        assert!(channel.poll_readable(false).unwrap());
        assert_eq!(channel.read_all().unwrap(), b"Linux\n");
        assert_eq!(channel.read_all_stderr().unwrap(), b"warning: deprecated\n");
        assert_eq!(channel.exit_status().unwrap(), 0);
        assert!(channel.eof().unwrap());
    }

    #[test]
    fn test_unknown_command_exit_status() {
        let (_remote, session) = authenticated();
        let mut channel = session.open_channel().unwrap();
        channel.exec("frobnicate").unwrap();
        assert!(channel.read_all().unwrap().is_empty());
        assert_eq!(channel.exit_status().unwrap(), 127);
    }

    #[test]
    fn test_unbounded_read_request_is_chunked() {
        let (remote, session) = authenticated();
        remote.set_command("hostname", b"edge-3\n", b"note\n", 0);
        let mut channel = session.open_channel().unwrap();
        channel.exec("hostname").unwrap();
        assert_eq!(channel.read(usize::MAX).unwrap(), b"edge-3\n");
        assert_eq!(channel.read_stderr(usize::MAX).unwrap(), b"note\n");
        assert_eq!(channel.exit_status().unwrap(), 0);
        assert!(format!("{:?}", channel).starts_with("Channel"));
    }

    #[test]
    fn test_second_request_denied() {
        let (_remote, session) = authenticated();
        let mut channel = session.open_channel().unwrap();
        channel.request_pty("xterm", Some(PtySize::chars(80, 24))).unwrap();
        channel.set_env("LANG", "C").unwrap();
        channel.shell().unwrap();
        let err = channel.exec("ls").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Channel);
    }

    #[test]
    fn test_eof_state_transitions() {
        let (_remote, session) = authenticated();
        let mut channel = session.open_channel().unwrap();
        channel.shell().unwrap();
        assert_eq!(channel.state().unwrap(), ChannelState::Open);
        assert_eq!(channel.write(b"hello").unwrap(), 5);

        channel.send_eof().unwrap();
        assert_eq!(channel.state().unwrap(), ChannelState::EofSent);
        let err = channel.write(b"more").unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Channel);

        channel.wait_eof().unwrap();
        assert_eq!(channel.state().unwrap(), ChannelState::EofReceived);
        assert_eq!(channel.read_all().unwrap(), b"hello");

        channel.wait_closed().unwrap();
        assert_eq!(channel.state().unwrap(), ChannelState::WaitClosed);
        session.close_channel(channel).unwrap();
    }

    #[test]
    fn test_wait_eof_without_sending_keeps_state() {
        let (_remote, session) = authenticated();
        let mut channel = session.open_channel().unwrap();
        channel.exec("echo hi").unwrap();
        channel.wait_eof().unwrap();
        assert_eq!(channel.state().unwrap(), ChannelState::Open);
    }

    #[test]
    fn test_partial_writes_reported() {
        let (remote, session) = authenticated();
        remote.set_write_cap(Some(3));
        let mut channel = session.open_channel().unwrap();
        channel.shell().unwrap();
        assert_eq!(channel.write(b"abcdefg").unwrap(), 3);
        assert_eq!(channel.write_window().unwrap().available, 3);
    }

    #[test]
    fn test_close_channel_releases_engine() {
        let (remote, session) = authenticated();
        let channel = session.open_channel().unwrap();
        assert_eq!(remote.open_channels(), 1);
        session.close_channel(channel).unwrap();
        assert_eq!(remote.open_channels(), 0);
    }

    #[test]
    fn test_drop_releases_engine_channel() {
        let (remote, session) = authenticated();
        {
            let _channel = session.open_channel().unwrap();
            assert_eq!(remote.open_channels(), 1);
        }
        assert_eq!(remote.open_channels(), 0);
        assert!(session.authenticated());
    }

    #[test]
    fn test_io_traits() {
        use std::io::{Read, Write};

        let (_remote, session) = authenticated();
        let mut channel = session.open_tunnel("localhost", 8080, None).unwrap();
        channel.write_all(b"GET /\r\n").unwrap();
        let mut buf = [0u8; 64];
        let n = Read::read(&mut channel, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"GET /\r\n");
    }
}
