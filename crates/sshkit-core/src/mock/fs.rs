// ── In-memory remote filesystem ──────────────────────────────────────────────

use crate::errno::*;
use crate::error::{BackendError, BackendResult};
use crate::types::*;
use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub kind: NodeKind,
    pub stat: StatRecord,
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Absolute, `.`/`..`-free form of `path`; relative paths start at `/`.
pub(crate) fn normalize(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => parts.clear(),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

pub(crate) fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn no_such_file(path: &str) -> BackendError {
    BackendError::sftp(SSH_FX_NO_SUCH_FILE, format!("no such file: {}", path))
}

fn failure(msg: String) -> BackendError {
    BackendError::sftp(SSH_FX_FAILURE, msg)
}

pub(crate) struct MemFs {
    nodes: BTreeMap<String, Node>,
}

impl MemFs {
    pub fn new() -> Self {
        let mut fs = Self {
            nodes: BTreeMap::new(),
        };
        fs.insert_dir("/", DEFAULT_DIR_MODE);
        fs.insert_dir("/tmp", 0o777);
        fs
    }

    fn new_stat(type_bits: u32, mode: u32, size: u64) -> StatRecord {
        let now = now_secs();
        StatRecord {
            mode: type_bits | (mode & 0o7777),
            size,
            mtime: now,
            atime: now,
            uid: 1000,
            gid: 1000,
        }
    }

    pub fn insert_dir(&mut self, path: &str, mode: u32) {
        self.nodes.insert(
            path.to_string(),
            Node {
                kind: NodeKind::Dir,
                stat: Self::new_stat(S_IFDIR, mode, 4096),
            },
        );
    }

    pub fn insert_file(&mut self, path: &str, content: Vec<u8>, mode: u32) {
        let stat = Self::new_stat(S_IFREG, mode, content.len() as u64);
        self.nodes.insert(
            path.to_string(),
            Node {
                kind: NodeKind::File(content),
                stat,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.nodes.get_mut(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    /// Follow symlinks on the final component.
    pub fn resolve(&self, path: &str) -> BackendResult<String> {
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_HOPS {
            match self.nodes.get(&current) {
                None => return Err(no_such_file(&current)),
                Some(Node {
                    kind: NodeKind::Symlink(target),
                    ..
                }) => {
                    current = if target.starts_with('/') {
                        normalize(Path::new(target))
                    } else {
                        normalize(&Path::new(&parent_of(&current)).join(target))
                    };
                }
                Some(_) => return Ok(current),
            }
        }
        Err(failure(format!("too many levels of symbolic links: {}", path)))
    }

    fn require_parent_dir(&self, path: &str) -> BackendResult<()> {
        let parent = parent_of(path);
        match self.nodes.get(&parent) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => Ok(()),
            Some(_) => Err(BackendError::sftp(
                SSH_FX_NO_SUCH_FILE,
                format!("parent is not a directory: {}", parent),
            )),
            None => Err(no_such_file(&parent)),
        }
    }

    pub fn stat(&self, path: &str) -> BackendResult<StatRecord> {
        let resolved = self.resolve(path)?;
        self.nodes
            .get(&resolved)
            .map(|n| n.stat)
            .ok_or_else(|| no_such_file(path))
    }

    pub fn lstat(&self, path: &str) -> BackendResult<StatRecord> {
        self.nodes
            .get(path)
            .map(|n| n.stat)
            .ok_or_else(|| no_such_file(path))
    }

    /// Open (and possibly create or truncate) a regular file; returns the
    /// resolved path.
    pub fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> BackendResult<String> {
        let target = match self.resolve(path) {
            Ok(p) => {
                if flags.create && flags.exclusive {
                    return Err(BackendError::sftp(
                        SSH_FX_FILE_ALREADY_EXISTS,
                        format!("file exists: {}", path),
                    ));
                }
                p
            }
            Err(_) if flags.create => {
                self.require_parent_dir(path)?;
                self.insert_file(path, Vec::new(), mode);
                path.to_string()
            }
            Err(e) => return Err(e),
        };
        let node = self
            .nodes
            .get_mut(&target)
            .ok_or_else(|| no_such_file(&target))?;
        match &mut node.kind {
            NodeKind::File(content) => {
                if flags.truncate && (flags.write || flags.append) {
                    content.clear();
                    node.stat.size = 0;
                    node.stat.mtime = now_secs();
                }
                Ok(target)
            }
            _ => Err(failure(format!("not a regular file: {}", path))),
        }
    }

    pub fn list(&self, path: &str) -> BackendResult<Vec<(String, StatRecord)>> {
        let resolved = self.resolve(path)?;
        let node = self
            .nodes
            .get(&resolved)
            .ok_or_else(|| no_such_file(path))?;
        if node.kind != NodeKind::Dir {
            return Err(failure(format!("not a directory: {}", path)));
        }
        let parent_stat = self
            .nodes
            .get(&parent_of(&resolved))
            .map(|n| n.stat)
            .unwrap_or(node.stat);
        let mut entries = vec![(".".to_string(), node.stat), ("..".to_string(), parent_stat)];
        for (child, n) in &self.nodes {
            if child != "/" && child != &resolved && parent_of(child) == resolved {
                entries.push((name_of(child).to_string(), n.stat));
            }
        }
        Ok(entries)
    }

    pub fn unlink(&mut self, path: &str) -> BackendResult<()> {
        match self.nodes.get(path) {
            None => Err(no_such_file(path)),
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => Err(failure(format!("is a directory: {}", path))),
            Some(_) => {
                self.nodes.remove(path);
                Ok(())
            }
        }
    }

    /// Refuses to replace an existing destination, like most SFTP servers.
    pub fn rename(&mut self, src: &str, dst: &str) -> BackendResult<()> {
        if !self.nodes.contains_key(src) {
            return Err(no_such_file(src));
        }
        if self.nodes.contains_key(dst) {
            return Err(failure(format!("destination exists: {}", dst)));
        }
        self.require_parent_dir(dst)?;
        let prefix = format!("{}/", src);
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.as_str() == src || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = self.nodes.remove(&key) {
                let new_key = format!("{}{}", dst, &key[src.len()..]);
                self.nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> BackendResult<()> {
        if self.nodes.contains_key(path) {
            return Err(failure(format!("already exists: {}", path)));
        }
        self.require_parent_dir(path)?;
        self.insert_dir(path, mode);
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> BackendResult<()> {
        match self.nodes.get(path) {
            None => Err(no_such_file(path)),
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => {
                if path == "/" || self.nodes.keys().any(|k| k != path && parent_of(k) == path) {
                    return Err(failure(format!("directory not empty: {}", path)));
                }
                self.nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(failure(format!("not a directory: {}", path))),
        }
    }

    pub fn readlink(&self, path: &str) -> BackendResult<String> {
        match self.nodes.get(path) {
            None => Err(no_such_file(path)),
            Some(Node {
                kind: NodeKind::Symlink(target),
                ..
            }) => Ok(target.clone()),
            Some(_) => Err(failure(format!("not a symbolic link: {}", path))),
        }
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> BackendResult<()> {
        if self.nodes.contains_key(path) {
            return Err(failure(format!("already exists: {}", path)));
        }
        self.require_parent_dir(path)?;
        let stat = Self::new_stat(S_IFLNK, 0o777, target.len() as u64);
        self.nodes.insert(
            path.to_string(),
            Node {
                kind: NodeKind::Symlink(target.to_string()),
                stat,
            },
        );
        Ok(())
    }

    pub fn setstat(&mut self, path: &str, update: &StatUpdate) -> BackendResult<()> {
        let resolved = self.resolve(path)?;
        let node = self
            .nodes
            .get_mut(&resolved)
            .ok_or_else(|| no_such_file(path))?;
        update.apply_to(&mut node.stat);
        Ok(())
    }

    pub fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> BackendResult<usize> {
        match self.nodes.get(path) {
            Some(Node {
                kind: NodeKind::File(content),
                ..
            }) => {
                let start = (offset as usize).min(content.len());
                let n = buf.len().min(content.len() - start);
                buf[..n].copy_from_slice(&content[start..start + n]);
                Ok(n)
            }
            _ => Err(failure(format!("handle refers to a removed file: {}", path))),
        }
    }

    pub fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> BackendResult<usize> {
        match self.nodes.get_mut(path) {
            Some(Node {
                kind: NodeKind::File(content),
                stat,
            }) => {
                let start = offset as usize;
                if content.len() < start {
                    content.resize(start, 0);
                }
                let overlap = data.len().min(content.len() - start);
                content[start..start + overlap].copy_from_slice(&data[..overlap]);
                content.extend_from_slice(&data[overlap..]);
                stat.size = content.len() as u64;
                stat.mtime = now_secs();
                Ok(data.len())
            }
            _ => Err(failure(format!("handle refers to a removed file: {}", path))),
        }
    }

    pub fn file_len(&self, path: &str) -> u64 {
        self.nodes.get(path).map(|n| n.stat.size).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), "/a/c");
        assert_eq!(normalize(Path::new("x/y")), "/x/y");
        assert_eq!(normalize(Path::new("/..")), "/");
    }

    #[test]
    fn test_rename_refuses_existing_destination() {
        let mut fs = MemFs::new();
        fs.insert_file("/tmp/a", b"a".to_vec(), 0o644);
        fs.insert_file("/tmp/b", b"b".to_vec(), 0o644);
        let err = fs.rename("/tmp/a", "/tmp/b").unwrap_err();
        assert_eq!(err.sftp_status, Some(SSH_FX_FAILURE));
        fs.unlink("/tmp/b").unwrap();
        fs.rename("/tmp/a", "/tmp/b").unwrap();
        assert!(fs.get("/tmp/a").is_none());
    }

    #[test]
    fn test_list_includes_dot_entries() {
        let mut fs = MemFs::new();
        fs.mkdir("/tmp/d", 0o755).unwrap();
        fs.insert_file("/tmp/d/f", vec![], 0o644);
        let names: Vec<String> = fs.list("/tmp/d").unwrap().into_iter().map(|e| e.0).collect();
        assert_eq!(names, vec![".", "..", "f"]);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let mut fs = MemFs::new();
        fs.insert_file("/f", b"ab".to_vec(), 0o644);
        fs.write_at("/f", 4, b"z").unwrap();
        let mut buf = [0u8; 8];
        let n = fs.read_at("/f", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ab\0\0z");
    }
}
