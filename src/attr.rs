//! Attribute records for nodes of the replicated tree.
//!
//! A [`FileAttr`] describes a single path: its kind, permission bits, size,
//! timestamps, content digest and, for directories, the basename-to-kind map
//! that drives negative lookups. A [`FileSet`] is the sorted batch in which
//! attributes travel between master and mirrors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Permission bits carried in [`FileAttr::mode`].
pub const MODE_PERM_MASK: u32 = 0o7777;

/// What a tree node is.
///
/// `Deletion` marks a path as known-not-to-exist; it only ever appears in
/// transit, never inside the cache map.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Device nodes, sockets and fifos; tracked but content-free.
    Special,
    Deletion,
}

impl FileKind {
    /// The POSIX file-type high bits for this kind, as handed to directory
    /// listings on the consumer surface. `Deletion` has none.
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular => 0o100000,
            FileKind::Directory => 0o040000,
            FileKind::Symlink => 0o120000,
            FileKind::Special => 0o020000,
            FileKind::Deletion => 0,
        }
    }
}

/// Timestamp with nanosecond resolution.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { seconds: duration.as_secs() as i64, nanos: duration.subsec_nanos() }
    }
}

/// Content address of a regular file body (32-byte digest).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Attribute record of a single tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Rootless path of the node.
    pub path: String,
    pub kind: FileKind,
    /// Permission bits (low 12), distinct from the kind.
    pub mode: u32,
    pub size: u64,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
    /// Content address, when the node is a regular file with tracked content.
    pub hash: Option<ContentHash>,
    /// Symlink target, iff the node is a symlink.
    pub link: Option<String>,
    /// Basename-to-kind map, present iff the node is a directory.
    pub children: Option<BTreeMap<String, FileKind>>,
}

impl FileAttr {
    /// A record marking `path` as known-not-to-exist.
    pub fn deletion(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Deletion,
            mode: 0,
            size: 0,
            atime: FileTime::default(),
            mtime: FileTime::default(),
            ctime: FileTime::default(),
            hash: None,
            link: None,
            children: None,
        }
    }

    /// A directory record with the given permission bits and an empty listing.
    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        let now = FileTime::now();
        Self {
            path: path.into(),
            kind: FileKind::Directory,
            mode: mode & MODE_PERM_MASK,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            hash: None,
            link: None,
            children: Some(BTreeMap::new()),
        }
    }

    /// A regular-file record with the given permission bits and size.
    pub fn regular(path: impl Into<String>, mode: u32, size: u64) -> Self {
        let now = FileTime::now();
        Self {
            path: path.into(),
            kind: FileKind::Regular,
            mode: mode & MODE_PERM_MASK,
            size,
            atime: now,
            mtime: now,
            ctime: now,
            hash: None,
            link: None,
            children: None,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == FileKind::Deletion
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    /// Whether this directory's listing contains `base`.
    pub fn lists(&self, base: &str) -> bool {
        self.children.as_ref().is_some_and(|map| map.contains_key(base))
    }

    /// Deep copy; when `with_children` is false the listing of a directory
    /// is dropped, which keeps non-directory queries cheap.
    pub fn copy(&self, with_children: bool) -> Self {
        let mut out = self.clone();
        if !with_children {
            out.children = None;
        }
        out
    }

    /// Updates whichever timestamps are supplied.
    pub fn set_times(
        &mut self,
        atime: Option<FileTime>,
        mtime: Option<FileTime>,
        ctime: Option<FileTime>,
    ) {
        if let Some(atime) = atime {
            self.atime = atime;
        }
        if let Some(mtime) = mtime {
            self.mtime = mtime;
        }
        if let Some(ctime) = ctime {
            self.ctime = ctime;
        }
    }

    /// Folds `other` into `self`: other's fields win, except that directory
    /// listings are unioned. Listing entries only disappear through explicit
    /// deletion updates against the child path.
    pub fn merge(&mut self, other: FileAttr) {
        debug_assert_eq!(self.path, other.path);
        self.kind = other.kind;
        self.mode = other.mode;
        self.size = other.size;
        self.atime = other.atime;
        self.mtime = other.mtime;
        self.ctime = other.ctime;
        if other.hash.is_some() {
            self.hash = other.hash;
        }
        if other.link.is_some() {
            self.link = other.link;
        }
        match (&mut self.children, other.children) {
            (Some(mine), Some(theirs)) => mine.extend(theirs),
            (mine @ None, Some(theirs)) => *mine = Some(theirs),
            (_, None) => {}
        }
    }
}

/// A batch of attribute updates, sorted by path for determinism.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSet {
    pub files: Vec<FileAttr>,
}

impl FileSet {
    pub fn new(files: Vec<FileAttr>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn sort(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

/// The authoritative stat result a [`crate::cache::Statter`] reports.
///
/// Equality of the canonical encoding decides whether a cached entry is
/// stale during a refresh pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub kind: FileKind,
    pub size: u64,
    pub mtime: FileTime,
    pub mode: u32,
}

impl FileInfo {
    /// Canonical byte encoding: kind bits, size, mtime seconds and nanos,
    /// permission bits, all big-endian. Writes into a `Vec` never fail.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        buf.write_u32::<BigEndian>(self.kind.type_bits()).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_i64::<BigEndian>(self.mtime.seconds).unwrap();
        buf.write_u32::<BigEndian>(self.mtime.nanos).unwrap();
        buf.write_u32::<BigEndian>(self.mode & MODE_PERM_MASK).unwrap();
        buf
    }
}

impl From<&FileAttr> for FileInfo {
    fn from(attr: &FileAttr) -> Self {
        Self { kind: attr.kind, size: attr.size, mtime: attr.mtime, mode: attr.mode }
    }
}
