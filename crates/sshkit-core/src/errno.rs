//! POSIX errno values and the SFTP status → errno table.

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const EACCES: i32 = 13;
pub const EEXIST: i32 = 17;
pub const ENOTDIR: i32 = 20;
pub const EISDIR: i32 = 21;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const EROFS: i32 = 30;
pub const ENOSYS: i32 = 38;
pub const ENOTEMPTY: i32 = 39;
pub const EBADMSG: i32 = 74;
pub const ECONNRESET: i32 = 104;
pub const ENOTCONN: i32 = 107;
pub const EDQUOT: i32 = 122;

// SSH_FXP_STATUS codes (draft-ietf-secsh-filexfer).
pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
pub const SSH_FX_NO_CONNECTION: u32 = 6;
pub const SSH_FX_CONNECTION_LOST: u32 = 7;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;
pub const SSH_FX_INVALID_HANDLE: u32 = 9;
pub const SSH_FX_NO_SUCH_PATH: u32 = 10;
pub const SSH_FX_FILE_ALREADY_EXISTS: u32 = 11;
pub const SSH_FX_WRITE_PROTECT: u32 = 12;
pub const SSH_FX_NO_MEDIA: u32 = 13;
pub const SSH_FX_NO_SPACE_ON_FILESYSTEM: u32 = 14;
pub const SSH_FX_QUOTA_EXCEEDED: u32 = 15;
pub const SSH_FX_DIR_NOT_EMPTY: u32 = 18;
pub const SSH_FX_NOT_A_DIRECTORY: u32 = 19;
pub const SSH_FX_FILE_IS_A_DIRECTORY: u32 = 24;

// libssh2 engine return codes the wrappers need to recognise.
pub const ENGINE_KEX_FAILURE: i32 = -5;
pub const ENGINE_SOCKET_SEND: i32 = -7;
pub const ENGINE_SOCKET_DISCONNECT: i32 = -13;
pub const ENGINE_FILE: i32 = -16;
pub const ENGINE_AUTHENTICATION_FAILED: i32 = -18;
pub const ENGINE_CHANNEL_FAILURE: i32 = -21;
pub const ENGINE_CHANNEL_REQUEST_DENIED: i32 = -22;
pub const ENGINE_CHANNEL_CLOSED: i32 = -26;
pub const ENGINE_CHANNEL_EOF_SENT: i32 = -27;
pub const ENGINE_SCP_PROTOCOL: i32 = -28;
pub const ENGINE_SFTP_PROTOCOL: i32 = -31;
pub const ENGINE_METHOD_NOT_SUPPORTED: i32 = -33;
pub const ENGINE_INVAL: i32 = -34;
pub const ENGINE_EAGAIN: i32 = -37;
pub const ENGINE_AGENT_PROTOCOL: i32 = -42;
pub const ENGINE_SOCKET_RECV: i32 = -43;

pub fn from_sftp_status(status: u32) -> i32 {
    match status {
        SSH_FX_OK => 0,
        SSH_FX_NO_SUCH_FILE | SSH_FX_NO_SUCH_PATH => ENOENT,
        SSH_FX_PERMISSION_DENIED => EACCES,
        SSH_FX_BAD_MESSAGE => EBADMSG,
        SSH_FX_NO_CONNECTION => ENOTCONN,
        SSH_FX_CONNECTION_LOST => ECONNRESET,
        SSH_FX_OP_UNSUPPORTED => ENOSYS,
        SSH_FX_INVALID_HANDLE => EBADF,
        SSH_FX_FILE_ALREADY_EXISTS => EEXIST,
        SSH_FX_WRITE_PROTECT | SSH_FX_NO_MEDIA => EROFS,
        SSH_FX_NO_SPACE_ON_FILESYSTEM => ENOSPC,
        SSH_FX_QUOTA_EXCEEDED => EDQUOT,
        SSH_FX_DIR_NOT_EMPTY => ENOTEMPTY,
        SSH_FX_NOT_A_DIRECTORY => ENOTDIR,
        SSH_FX_FILE_IS_A_DIRECTORY => EISDIR,
        // SSH_FX_FAILURE and anything unknown: generic I/O failure, which is
        // what servers answer a rename onto an existing path with.
        _ => EIO,
    }
}
