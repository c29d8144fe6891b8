// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Mode bits ────────────────────────────────────────────────────────────────

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission bits compared or applied across systems.
pub const PERMISSION_MASK: u32 = 0o777;

pub const DEFAULT_FILE_MODE: u32 = 0o755;
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Identification string sent when no banner was configured.
pub const DEFAULT_BANNER: &str = "SSH-2.0-sshkit_0.1";

/// Extended data stream carrying the remote's diagnostic output.
pub const STDERR_STREAM: i32 = 1;

// ── Stat record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// POSIX-style metadata for a remote or local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatRecord {
    /// Type bits plus permission bits.
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub atime: u64,
    pub uid: u32,
    pub gid: u32,
}

impl StatRecord {
    pub fn permissions(&self) -> u32 {
        self.mode & PERMISSION_MASK
    }

    pub fn type_bits(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn file_type(&self) -> FileType {
        match self.type_bits() {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Other,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }
}

/// Partial attribute update for `set_stat`.  Only supplied groups mutate;
/// owner and times travel as pairs because the engine sets them together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatUpdate {
    #[serde(default)]
    pub permissions: Option<u32>,
    /// `(uid, gid)`
    #[serde(default)]
    pub owner: Option<(u32, u32)>,
    /// `(atime, mtime)`
    #[serde(default)]
    pub times: Option<(u64, u64)>,
}

impl StatUpdate {
    pub fn permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode & PERMISSION_MASK),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_none() && self.owner.is_none() && self.times.is_none()
    }

    /// Apply onto an existing record, keeping the type bits.
    pub fn apply_to(&self, stat: &mut StatRecord) {
        if let Some(perm) = self.permissions {
            stat.mode = stat.type_bits() | (perm & 0o7777);
        }
        if let Some((uid, gid)) = self.owner {
            stat.uid = uid;
            stat.gid = gid;
        }
        if let Some((atime, mtime)) = self.times {
            stat.atime = atime;
            stat.mtime = mtime;
        }
    }
}

// ── Open flags ───────────────────────────────────────────────────────────────

/// Open mode of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Write, creating or truncating.
    pub fn write_create() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Parse an fopen-style mode string (`r`, `r+`, `w`, `w+`, `a`, `a+`;
    /// `b` is accepted and ignored).
    pub fn from_mode_str(mode: &str) -> Option<Self> {
        let cleaned: String = mode.chars().filter(|c| *c != 'b').collect();
        let flags = match cleaned.as_str() {
            "r" => Self::read_only(),
            "r+" => Self {
                read: true,
                write: true,
                ..Self::default()
            },
            "w" => Self::write_create(),
            "w+" => Self {
                read: true,
                ..Self::write_create()
            },
            "a" => Self {
                write: true,
                append: true,
                create: true,
                ..Self::default()
            },
            "a+" => Self {
                read: true,
                write: true,
                append: true,
                create: true,
                ..Self::default()
            },
            _ => return None,
        };
        Some(flags)
    }
}

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Algorithm slot whose preference can be set or whose outcome can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MethodType {
    Kex,
    HostKey,
    CryptCs,
    CryptSc,
    MacCs,
    MacSc,
    CompCs,
    CompSc,
    LangCs,
    LangSc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlgorithmCategory {
    Kex,
    HostKey,
    Crypt,
    Mac,
    Comp,
    Lang,
}

impl MethodType {
    pub const ALL: [MethodType; 10] = [
        MethodType::Kex,
        MethodType::HostKey,
        MethodType::CryptCs,
        MethodType::CryptSc,
        MethodType::MacCs,
        MethodType::MacSc,
        MethodType::CompCs,
        MethodType::CompSc,
        MethodType::LangCs,
        MethodType::LangSc,
    ];

    /// `None` for slots shared by both directions (kex, host key).
    pub fn direction(&self) -> Option<Direction> {
        match self {
            MethodType::Kex | MethodType::HostKey => None,
            MethodType::CryptCs | MethodType::MacCs | MethodType::CompCs | MethodType::LangCs => {
                Some(Direction::ClientToServer)
            }
            MethodType::CryptSc | MethodType::MacSc | MethodType::CompSc | MethodType::LangSc => {
                Some(Direction::ServerToClient)
            }
        }
    }

    pub fn category(&self) -> AlgorithmCategory {
        match self {
            MethodType::Kex => AlgorithmCategory::Kex,
            MethodType::HostKey => AlgorithmCategory::HostKey,
            MethodType::CryptCs | MethodType::CryptSc => AlgorithmCategory::Crypt,
            MethodType::MacCs | MethodType::MacSc => AlgorithmCategory::Mac,
            MethodType::CompCs | MethodType::CompSc => AlgorithmCategory::Comp,
            MethodType::LangCs | MethodType::LangSc => AlgorithmCategory::Lang,
        }
    }
}

/// Direction → {category → chosen algorithm}.  Kex and host-key choices are
/// listed under both directions.
pub type NegotiatedMethods = BTreeMap<Direction, BTreeMap<AlgorithmCategory, String>>;

pub fn group_methods<I>(chosen: I) -> NegotiatedMethods
where
    I: IntoIterator<Item = (MethodType, String)>,
{
    let mut out: NegotiatedMethods = BTreeMap::new();
    for (method, algo) in chosen {
        let directions = match method.direction() {
            Some(d) => vec![d],
            None => vec![Direction::ClientToServer, Direction::ServerToClient],
        };
        for d in directions {
            out.entry(d).or_default().insert(method.category(), algo.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
}

// ── Lifecycle states ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Created,
    Connected,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    Open,
    EofSent,
    EofReceived,
    WaitClosed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubsystemState {
    Open,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    Disconnected,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "CREATED",
            SessionState::Connected => "CONNECTED",
            SessionState::Authenticated => "AUTHENTICATED",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

// ── Channel values ───────────────────────────────────────────────────────────

/// Flow-control window: bytes creditable now, and the size negotiated at
/// channel open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatus {
    pub available: u32,
    pub initial: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtySize {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub pixel_width: u32,
    #[serde(default)]
    pub pixel_height: u32,
}

impl PtySize {
    pub fn chars(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: Option<String>,
    pub auth_cookie: Option<String>,
    pub screen: i32,
}

/// SCP header exchanged when a push or pull channel opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScpHeader {
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub atime: u64,
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractivePrompt {
    pub text: String,
    pub echo: bool,
}

// ── Agent ────────────────────────────────────────────────────────────────────

/// Public-key record held by the local agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub blob: Vec<u8>,
    pub comment: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_type_and_permission_bits_separate() {
        let stat = StatRecord {
            mode: S_IFDIR | 0o755,
            ..StatRecord::default()
        };
        assert!(stat.is_dir());
        assert_eq!(stat.permissions(), 0o755);
        assert_eq!(stat.type_bits(), S_IFDIR);

        let link = StatRecord {
            mode: S_IFLNK | 0o777,
            ..StatRecord::default()
        };
        assert_eq!(link.file_type(), FileType::Symlink);
    }

    #[test]
    fn test_stat_update_only_touches_supplied_fields() {
        let mut stat = StatRecord {
            mode: S_IFREG | 0o644,
            size: 10,
            mtime: 100,
            atime: 200,
            uid: 1000,
            gid: 1000,
        };
        StatUpdate::permissions(0o400).apply_to(&mut stat);
        assert_eq!(stat.mode, S_IFREG | 0o400);
        assert_eq!(stat.uid, 1000);
        assert_eq!(stat.mtime, 100);

        let update = StatUpdate {
            times: Some((7, 8)),
            ..StatUpdate::default()
        };
        update.apply_to(&mut stat);
        assert_eq!((stat.atime, stat.mtime), (7, 8));
        assert_eq!(stat.mode, S_IFREG | 0o400);
    }

    #[test]
    fn test_open_flags_from_mode_str() {
        assert_eq!(OpenFlags::from_mode_str("r"), Some(OpenFlags::read_only()));
        assert_eq!(OpenFlags::from_mode_str("rb"), Some(OpenFlags::read_only()));
        let w = OpenFlags::from_mode_str("w").unwrap();
        assert!(w.write && w.create && w.truncate && !w.read);
        let a = OpenFlags::from_mode_str("a+").unwrap();
        assert!(a.read && a.write && a.append && a.create && !a.truncate);
        assert_eq!(OpenFlags::from_mode_str("x"), None);
    }

    #[test]
    fn test_group_methods_by_direction() {
        let grouped = group_methods(vec![
            (MethodType::Kex, "curve25519-sha256".to_string()),
            (MethodType::CryptCs, "aes128-ctr".to_string()),
            (MethodType::CryptSc, "aes256-ctr".to_string()),
        ]);
        let cs = &grouped[&Direction::ClientToServer];
        let sc = &grouped[&Direction::ServerToClient];
        assert_eq!(cs[&AlgorithmCategory::Crypt], "aes128-ctr");
        assert_eq!(sc[&AlgorithmCategory::Crypt], "aes256-ctr");
        assert_eq!(cs[&AlgorithmCategory::Kex], "curve25519-sha256");
        assert_eq!(sc[&AlgorithmCategory::Kex], "curve25519-sha256");
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ChannelState::EofSent).unwrap();
        assert_eq!(json, "\"eofSent\"");
        let state: SessionState = serde_json::from_str("\"authenticated\"").unwrap();
        assert_eq!(state, SessionState::Authenticated);
    }
}
