//! Shared fixtures: scripted upstream stubs and a recording subscriber.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fsmirror::attr::{FileAttr, FileInfo, FileKind, FileSet};
use fsmirror::cache::{AttributeCache, Getter, SendError, Statter, Subscriber};

/// Getter stub answering from a scripted tree and counting upstream calls.
/// A path missing from the script is answered as a deletion, the way a real
/// master answers for a path that does not exist.
pub struct ScriptedGetter {
    tree: Mutex<HashMap<String, FileAttr>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl ScriptedGetter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: None,
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Some(delay),
        })
    }

    pub fn insert(&self, attr: FileAttr) {
        self.tree.lock().expect("script lock").insert(attr.path.clone(), attr);
    }

    /// Makes every following fetch fail transiently (return `None`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Getter for ScriptedGetter {
    async fn fetch_attr(&self, name: &str) -> Option<FileAttr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        let found = self.tree.lock().expect("script lock").get(name).cloned();
        Some(found.unwrap_or_else(|| FileAttr::deletion(name)))
    }
}

/// Statter stub reporting scripted stat results. A missing entry means the
/// path no longer exists.
#[derive(Default)]
pub struct ScriptedStatter {
    infos: Mutex<HashMap<String, FileInfo>>,
}

impl ScriptedStatter {
    pub fn insert(&self, name: &str, info: FileInfo) {
        self.infos.lock().expect("stat lock").insert(name.to_owned(), info);
    }

    pub fn remove(&self, name: &str) {
        self.infos.lock().expect("stat lock").remove(name);
    }
}

#[async_trait]
impl Statter for ScriptedStatter {
    async fn stat(&self, name: &str) -> Option<FileInfo> {
        self.infos.lock().expect("stat lock").get(name).copied()
    }
}

/// Subscriber recording every delivered batch.
pub struct RecordingSubscriber {
    id: String,
    batches: Mutex<Vec<Vec<FileAttr>>>,
    failing: AtomicBool,
}

impl RecordingSubscriber {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            batches: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<FileAttr>> {
        self.batches.lock().expect("batch lock").clone()
    }

    /// Every delivered record path, in delivery order.
    pub fn paths(&self) -> Vec<String> {
        self.batches()
            .into_iter()
            .flatten()
            .map(|record| record.path)
            .collect()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn send(&self, batch: &[FileAttr]) -> Result<(), SendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::Downstream("stub transport refused".to_owned()));
        }
        self.batches.lock().expect("batch lock").push(batch.to_vec());
        Ok(())
    }
}

/// A cache wired to scripted stubs, paranoia on.
pub struct Fixture {
    pub cache: Arc<AttributeCache>,
    pub getter: Arc<ScriptedGetter>,
    pub statter: Arc<ScriptedStatter>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_getter(ScriptedGetter::new())
    }

    pub fn with_getter(getter: Arc<ScriptedGetter>) -> Self {
        let statter = Arc::new(ScriptedStatter::default());
        let cache = Arc::new(AttributeCache::new(getter.clone(), Some(statter.clone())));
        cache.set_paranoia(true);
        Self { cache, getter, statter }
    }

    /// Installs the tree root as a directory with the given listing.
    pub async fn seed_root(&self, entries: &[(&str, FileKind)]) {
        self.cache.update(FileSet::new(vec![dir_attr("", entries)])).await;
    }

    /// Installs a batch of updates, parents first.
    pub async fn seed(&self, records: Vec<FileAttr>) {
        self.cache.update(FileSet::new(records)).await;
    }
}

/// A directory record with an explicit listing.
pub fn dir_attr(path: &str, entries: &[(&str, FileKind)]) -> FileAttr {
    let mut attr = FileAttr::directory(path, 0o755);
    let listing: BTreeMap<String, FileKind> =
        entries.iter().map(|(name, kind)| (name.to_string(), *kind)).collect();
    attr.children = Some(listing);
    attr
}

/// A regular-file record of the given size.
pub fn file_attr(path: &str, size: u64) -> FileAttr {
    FileAttr::regular(path, 0o644, size)
}
