//! Consumer-facing filesystem surface of a worker mirror.
//!
//! [`MirrorFs`] is what the FUSE front-end of a build sandbox calls. It
//! answers every query out of the attribute cache and materialises file
//! bodies through a content-addressed [`ContentStore`], keeping small blobs
//! resident in memory. The tree is read-only by design: write flags and
//! write access checks are refused outright.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

use crate::attr::{ContentHash, FileAttr};
use crate::cache::AttributeCache;
use crate::config::ContentSettings;

/// `access(2)` existence probe.
pub const F_OK: u32 = 0;
/// `access(2)` execute bit.
pub const X_OK: u32 = 1;
/// `access(2)` write bit.
pub const W_OK: u32 = 2;
/// `access(2)` read bit.
pub const R_OK: u32 = 4;

/// Mask of the open-flags access mode; anything non-zero writes.
pub const O_ACCMODE: u32 = 3;

/// Errors surfaced to the filesystem front-end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FsError {
    /// The path is known not to exist.
    NotFound,
    /// The node is not of the kind the operation requires.
    InvalidArgument,
    /// The tree is read-only; opening for write is refused.
    PermissionDenied,
    /// An access probe asked for write permission.
    AccessDenied,
    /// Content could not be materialised.
    IO,
}

/// Local storage of content-addressed file bodies. The store is an
/// external collaborator; the mirror only pulls blobs through it and reads
/// them back.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Whether the blob is already present locally.
    fn has(&self, hash: &ContentHash) -> bool;

    /// Pulls the blob from upstream. `Ok(true)` means it is stored locally
    /// afterwards.
    async fn fetch(&self, hash: &ContentHash) -> io::Result<bool>;

    /// Reads the whole blob; `None` when absent.
    fn read(&self, hash: &ContentHash) -> Option<Vec<u8>>;

    /// Location of the blob in local storage, for lazy reads.
    fn local_path(&self, hash: &ContentHash) -> PathBuf;
}

/// An opened read-only file.
#[derive(Debug, Clone)]
pub enum OpenFile {
    /// Contents small enough to stay resident in memory.
    Resident { attr: FileAttr, contents: Arc<Vec<u8>> },
    /// Backed by the store's on-disk blob, read lazily.
    Lazy { attr: FileAttr, path: PathBuf },
}

struct Inner {
    attrs: Arc<AttributeCache>,
    contents: Arc<dyn ContentStore>,
    /// Bounded by total resident bytes; weighed by blob size.
    resident: moka::sync::Cache<ContentHash, Arc<Vec<u8>>>,
    mem_max_bytes: u64,
    /// Hashes with a pull in flight, so each blob crosses the wire once.
    fetching: Mutex<HashSet<ContentHash>>,
    fetched: Notify,
}

/// The replica filesystem of one worker mirror. Cheap to clone; clones
/// share the cache, the store and the resident-content budget.
#[derive(Clone)]
pub struct MirrorFs {
    inner: Arc<Inner>,
}

impl MirrorFs {
    pub fn new(
        attrs: Arc<AttributeCache>,
        contents: Arc<dyn ContentStore>,
        settings: &ContentSettings,
    ) -> Self {
        let resident = moka::sync::Cache::builder()
            .max_capacity(settings.resident_capacity_bytes)
            .weigher(|_hash, contents: &Arc<Vec<u8>>| {
                contents.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self {
            inner: Arc::new(Inner {
                attrs,
                contents,
                resident,
                mem_max_bytes: settings.mem_max_bytes,
                fetching: Mutex::new(HashSet::new()),
                fetched: Notify::new(),
            }),
        }
    }

    /// The attribute cache this mirror replicates.
    pub fn attributes(&self) -> &Arc<AttributeCache> {
        &self.inner.attrs
    }

    /// Lists a directory as basename to type-bits entries.
    pub async fn open_dir(&self, name: &str) -> Result<BTreeMap<String, u32>, FsError> {
        let attr = self.inner.attrs.get_dir(name).await;
        if attr.is_deletion() {
            return Err(FsError::NotFound);
        }
        if !attr.is_directory() {
            return Err(FsError::InvalidArgument);
        }
        let listing = attr.children.ok_or(FsError::InvalidArgument)?;
        Ok(listing.into_iter().map(|(child, kind)| (child, kind.type_bits())).collect())
    }

    /// Opens a file read-only, materialising its contents by hash.
    pub async fn open(&self, name: &str, flags: u32) -> Result<OpenFile, FsError> {
        if flags & O_ACCMODE != 0 {
            return Err(FsError::PermissionDenied);
        }
        let attr = self.inner.attrs.get(name).await;
        if attr.is_deletion() {
            return Err(FsError::NotFound);
        }
        let hash = attr.hash.ok_or(FsError::IO)?;

        self.fetch_hash_once(&attr, &hash).await?;

        if attr.size <= self.inner.mem_max_bytes {
            if let Some(contents) = self.load_resident(&hash) {
                return Ok(OpenFile::Resident { attr, contents });
            }
        }
        Ok(OpenFile::Lazy { path: self.inner.contents.local_path(&hash), attr })
    }

    /// Reads a symlink target.
    pub async fn read_link(&self, name: &str) -> Result<String, FsError> {
        let attr = self.inner.attrs.get(name).await;
        if attr.is_deletion() {
            return Err(FsError::NotFound);
        }
        if !attr.is_symlink() {
            return Err(FsError::InvalidArgument);
        }
        attr.link.ok_or(FsError::InvalidArgument)
    }

    /// Fetches a node's attributes. Content, when tracked, is prefetched in
    /// the background so a following open finds it local.
    pub async fn get_attr(&self, name: &str) -> Result<FileAttr, FsError> {
        let attr = self.inner.attrs.get(name).await;
        if attr.is_deletion() {
            return Err(FsError::NotFound);
        }
        if let Some(hash) = attr.hash {
            let fs = self.clone();
            let prefetch = attr.clone();
            tokio::spawn(async move {
                if fs.fetch_hash_once(&prefetch, &hash).await.is_ok()
                    && prefetch.size <= fs.inner.mem_max_bytes
                {
                    fs.load_resident(&hash);
                }
            });
        }
        Ok(attr)
    }

    /// Evaluates an access mask against the read-only tree.
    pub async fn access(&self, name: &str, mode: u32) -> Result<(), FsError> {
        if mode == F_OK {
            return self.get_attr(name).await.map(|_| ());
        }
        if mode & W_OK != 0 {
            return Err(FsError::AccessDenied);
        }
        Ok(())
    }

    fn load_resident(&self, hash: &ContentHash) -> Option<Arc<Vec<u8>>> {
        if let Some(hit) = self.inner.resident.get(hash) {
            return Some(hit);
        }
        let contents = Arc::new(self.inner.contents.read(hash)?);
        self.inner.resident.insert(*hash, contents.clone());
        Some(contents)
    }

    /// Pulls one blob with single-flight coordination: concurrent opens of
    /// the same hash share a single upstream fetch.
    async fn fetch_hash_once(&self, attr: &FileAttr, hash: &ContentHash) -> Result<(), FsError> {
        loop {
            let mut fetching = self.inner.fetching.lock().await;
            if self.inner.contents.has(hash) {
                return Ok(());
            }
            if !fetching.contains(hash) {
                fetching.insert(*hash);
                break;
            }
            let notified = self.inner.fetched.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(fetching);
            notified.await;
        }

        debug!(path = %attr.path, %hash, "fetching file contents");
        let outcome = self.inner.contents.fetch(hash).await;

        self.inner.fetching.lock().await.remove(hash);
        self.inner.fetched.notify_waiters();

        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!(%hash, "store does not hold blob after fetch");
                Err(FsError::IO)
            }
            Err(err) => {
                error!(%hash, %err, "content fetch failed");
                Err(FsError::IO)
            }
        }
    }
}
