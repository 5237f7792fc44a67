//! The in-memory attribute cache replicated between master and mirrors.
//!
//! One instance holds a map from rootless path to [`FileAttr`]. Misses are
//! resolved through a user-supplied [`Getter`] with single-flight
//! coordination, parents before children, so that a materialised directory
//! listing answers sibling lookups negatively without another round-trip.
//! Mutations arrive as sorted [`FileSet`] batches and are fanned out to
//! every registered subscriber (see [`fanout`]).
//!
//! Invariant: for every cached entry, its parent directory is cached too
//! and lists the entry.

mod fanout;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, warn};

use crate::attr::{FileAttr, FileInfo, FileKind, FileSet};
use crate::path;

pub use fanout::{SendError, Subscriber};

/// Fetches authoritative attributes for one path, typically an RPC to the
/// master. For a directory the returned record must carry a populated
/// listing. `None` signals a transient failure; it is surfaced as a
/// synthetic deletion and never cached, so a later lookup retries.
#[async_trait]
pub trait Getter: Send + Sync {
    async fn fetch_attr(&self, name: &str) -> Option<FileAttr>;
}

/// Authoritative local stat source, consulted only by [`AttributeCache::refresh`].
/// `None` means the path no longer exists.
#[async_trait]
pub trait Statter: Send + Sync {
    async fn stat(&self, name: &str) -> Option<FileInfo>;
}

pub(crate) struct State {
    attrs: HashMap<String, FileAttr>,
    busy: HashSet<String>,
    clients: HashMap<String, fanout::ClientState>,
}

/// Concurrent path-to-attribute store with single-flight fetch and
/// subscriber fanout.
pub struct AttributeCache {
    state: RwLock<State>,
    /// Broadcast for every condition wait: fetch completion, update
    /// installation, subscriber removal and send completion.
    wakeup: Notify,
    getter: Arc<dyn Getter>,
    statter: Option<Arc<dyn Statter>>,
    paranoia: AtomicBool,
}

impl AttributeCache {
    pub fn new(getter: Arc<dyn Getter>, statter: Option<Arc<dyn Statter>>) -> Self {
        Self {
            state: RwLock::new(State {
                attrs: HashMap::new(),
                busy: HashSet::new(),
                clients: HashMap::new(),
            }),
            wakeup: Notify::new(),
            getter,
            statter,
            paranoia: AtomicBool::new(false),
        }
    }

    /// Enables the full invariant scan after every mutation. Meant for tests.
    pub fn set_paranoia(&self, enabled: bool) {
        self.paranoia.store(enabled, Ordering::Relaxed);
    }

    /// Whether `name` is currently cached. Never blocks or fetches.
    pub async fn have(&self, name: &str) -> bool {
        path::assert_rootless(name);
        self.state.read().await.attrs.contains_key(name)
    }

    /// Returns the attributes of `name` without directory contents,
    /// fetching through the [`Getter`] when necessary. A node known not to
    /// exist comes back as a deletion record.
    pub async fn get(&self, name: &str) -> FileAttr {
        self.get_inner(name, false).await
    }

    /// Like [`AttributeCache::get`], with the listing populated when the
    /// node is a directory.
    pub async fn get_dir(&self, name: &str) -> FileAttr {
        self.get_inner(name, true).await
    }

    async fn get_inner(&self, name: &str, with_children: bool) -> FileAttr {
        path::assert_rootless(name);
        if let Some(found) = self.local_get(name, with_children).await {
            return found;
        }

        // Parents are resolved first so siblings share the listing. The
        // authoritative parent check happens inside fetch_one, under the
        // same guard as the install; a deletion or non-directory on the
        // way down answers the whole lookup negatively.
        for prefix in path::ancestors(name) {
            let with = if prefix == name { with_children } else { true };
            let attr = self.fetch_one(prefix, with).await;
            if prefix == name {
                return attr;
            }
            if attr.is_deletion() || !attr.is_directory() {
                return FileAttr::deletion(name);
            }
        }
        FileAttr::deletion(name)
    }

    /// Fast path under the shared lock: a cached entry, or a negative
    /// answer derived from the parent's listing.
    async fn local_get(&self, name: &str, with_children: bool) -> Option<FileAttr> {
        let state = self.state.read().await;
        if let Some(found) = state.attrs.get(name) {
            return Some(found.copy(with_children));
        }
        if !name.is_empty() {
            let (dir, base) = path::split_path(name);
            if let Some(dir_attr) = state.attrs.get(dir) {
                if dir_attr.children.as_ref().is_some_and(|map| !map.contains_key(base)) {
                    return Some(FileAttr::deletion(name));
                }
            }
        }
        None
    }

    /// Single-flight fetch of one path. Concurrent callers for the same
    /// path share one [`Getter`] call.
    ///
    /// The parent listing is consulted and the result installed under the
    /// same guard: a path whose cached parent does not list it is answered
    /// negatively without a fetch, and a fetched child whose parent vanished
    /// while the callout was in flight is never installed. Either way the
    /// parent-coverage invariant holds at every release of the lock.
    async fn fetch_one(&self, name: &str, with_children: bool) -> FileAttr {
        loop {
            let mut state = self.state.write().await;
            if let Some(found) = state.attrs.get(name) {
                return found.copy(with_children);
            }
            if !parent_lists(&state, name) {
                return FileAttr::deletion(name);
            }
            if !state.busy.contains(name) {
                state.busy.insert(name.to_owned());
                break;
            }
            self.wait_broadcast(state).await;
        }

        debug!(path = %name, "fetching attributes upstream");
        let fetched = self.getter.fetch_attr(name).await;

        let mut state = self.state.write().await;
        state.busy.remove(name);
        let result = match fetched {
            None => {
                error!(path = %name, "attribute fetch failed upstream");
                FileAttr::deletion(name)
            }
            Some(mut attr) => {
                attr.path = name.to_owned();
                if !attr.is_deletion() && parent_lists(&state, name) {
                    state.attrs.insert(name.to_owned(), attr.clone());
                }
                attr
            }
        };
        self.wakeup.notify_waiters();
        self.verify_locked(&state);
        result.copy(with_children)
    }

    /// Atomically applies a batch of mutations and queues it to every
    /// subscriber. Callers sort batches for determinism; correctness does
    /// not depend on the order.
    pub async fn update(&self, batch: FileSet) {
        let mut state = self.state.write().await;
        self.apply_locked(&mut state, batch);
    }

    fn apply_locked(&self, state: &mut State, batch: FileSet) {
        // The batch reaches every pending queue inside the same critical
        // section as the map mutation, so all mirrors observe a consistent
        // prefix of one total order.
        fanout::queue_locked(state, &batch);

        for record in batch.files {
            path::assert_rootless(&record.path);
            let record_path = record.path.clone();
            let (dir, base) = path::split_path(&record_path);

            if !base.is_empty() {
                match state.attrs.get_mut(dir) {
                    None => {
                        warn!(path = %record_path, "discarding update for unknown parent");
                        continue;
                    }
                    Some(dir_attr) => match dir_attr.children.as_mut() {
                        None => panic!("parent directory {dir:?} has no listing"),
                        Some(listing) => {
                            if record.is_deletion() {
                                listing.remove(base);
                            } else {
                                listing.insert(base.to_owned(), record.kind);
                            }
                        }
                    },
                }
            }

            if record.is_deletion() {
                state.attrs.remove(&record_path);
                continue;
            }

            match state.attrs.entry(record_path.clone()) {
                Entry::Occupied(mut occupied) => occupied.get_mut().merge(record),
                Entry::Vacant(vacant) => {
                    if record.is_directory() && record.children.is_none() {
                        // A metadata-only directory record cannot answer
                        // negative lookups: a child could exist that we
                        // have never seen.
                        warn!(path = %record_path, "discarding contentless directory update");
                        continue;
                    }
                    vacant.insert(record);
                }
            }
            state.busy.remove(&record_path);
        }

        self.wakeup.notify_waiters();
        self.verify_locked(state);
    }

    /// Reconciles every cached entry under `prefix` against the statter,
    /// refetching stale entries and emitting deletions for vanished paths.
    /// The applied batch is returned, sorted, for forwarding upstream.
    ///
    /// Stats and refetches run with the lock released; the batch is applied
    /// in one critical section afterwards.
    pub async fn refresh(&self, prefix: &str) -> FileSet {
        path::assert_rootless(prefix);
        let statter = match &self.statter {
            Some(statter) => statter.clone(),
            None => panic!("refresh requires a statter"),
        };

        let candidates: Vec<(String, Vec<u8>)> = {
            let state = self.state.read().await;
            state
                .attrs
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, attr)| (key.clone(), FileInfo::from(attr).encode()))
                .collect()
        };

        let mut updated = Vec::new();
        for (key, stored) in candidates {
            match statter.stat(&key).await {
                None => updated.push(FileAttr::deletion(key)),
                Some(info) => {
                    if info.encode() != stored {
                        match self.getter.fetch_attr(&key).await {
                            Some(mut fresh) => {
                                fresh.path = key;
                                updated.push(fresh);
                            }
                            None => error!(path = %key, "refresh refetch failed upstream"),
                        }
                    }
                }
            }
        }

        let mut batch = FileSet::new(updated);
        batch.sort();
        debug!(prefix = %prefix, entries = batch.files.len(), "refresh diff computed");

        let mut state = self.state.write().await;
        self.apply_locked(&mut state, batch.clone());
        batch
    }

    /// A sorted copy of every cached entry, listings included.
    pub async fn snapshot(&self) -> FileSet {
        let state = self.state.read().await;
        snapshot_locked(&state)
    }

    /// Runs the full invariant scan. A no-op unless paranoia is enabled.
    pub async fn verify(&self) {
        let state = self.state.read().await;
        self.verify_locked(&state);
    }

    fn verify_locked(&self, state: &State) {
        if !self.paranoia.load(Ordering::Relaxed) {
            return;
        }
        for (key, attr) in &state.attrs {
            if !path::is_clean(key) {
                panic!("unclean path {key:?} in cache");
            }
            if attr.path != *key {
                panic!("entry {key:?} carries path {:?}", attr.path);
            }
            if state.busy.contains(key) {
                panic!("{key:?} is both busy and cached");
            }
            if attr.is_deletion() {
                panic!("cache may not contain deletions: {key:?}");
            }
            if attr.is_directory() && attr.children.is_none() {
                panic!("directory {key:?} has no listing");
            }
            if let Some(listing) = &attr.children {
                for (child, kind) in listing {
                    if child.is_empty() || child.contains('/') || child.contains('\0') {
                        panic!("{key:?} has illegal child name {child:?}");
                    }
                    if *kind == FileKind::Deletion {
                        panic!("{key:?} lists child {child:?} as a deletion");
                    }
                }
            }
            let (dir, base) = path::split_path(key);
            if !base.is_empty() {
                match state.attrs.get(dir) {
                    None => panic!("missing parent for {key:?}"),
                    Some(parent) => {
                        if !parent.is_directory() {
                            panic!("parent {dir:?} of {key:?} is not a directory");
                        }
                        if !parent.lists(base) {
                            panic!("parent {dir:?} has no entry for {base:?}");
                        }
                    }
                }
            }
        }
    }

    /// Condition wait bound to the cache broadcast. Interest is registered
    /// before the guard drops so a wakeup in between is not lost.
    async fn wait_broadcast<G>(&self, guard: G) {
        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        notified.await;
    }
}

fn snapshot_locked(state: &State) -> FileSet {
    let mut set = FileSet::new(state.attrs.values().map(|attr| attr.copy(true)).collect());
    set.sort();
    set
}

/// Whether the cached parent of `name` is a directory that lists it. The
/// root has no parent and always qualifies.
fn parent_lists(state: &State, name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    let (dir, base) = path::split_path(name);
    match state.attrs.get(dir) {
        Some(parent) => parent.is_directory() && parent.lists(base),
        None => false,
    }
}
