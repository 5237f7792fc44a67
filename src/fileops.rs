//! Logical `mkdir` and `rm` executed by the master against the cache.
//!
//! These never touch a real disk: each operation resolves its arguments
//! against the virtual tree, validates them, and applies the resulting
//! attribute batch through [`AttributeCache::update`], which fans it out to
//! every mirror.

use std::future::Future;
use std::pin::Pin;

use tracing::info;

use crate::attr::{FileAttr, FileKind, FileSet, FileTime};
use crate::cache::AttributeCache;
use crate::path;

/// Outcome of an operation: diagnostics plus the shell-style exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpReport {
    pub stderr: Vec<String>,
    pub exit_code: i32,
}

impl OpReport {
    /// The exit code in wait-status convention.
    pub fn wait_status(&self) -> i32 {
        self.exit_code << 8
    }

    fn fail(&mut self, message: String) {
        self.stderr.push(message);
        self.exit_code = 1;
    }
}

/// Behavior switches for [`rm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RmOptions {
    /// Suppress missing-target diagnostics.
    pub force: bool,
    /// Remove directories and their contents.
    pub recursive: bool,
}

/// Resolves an argument against the virtual working directory and strips it
/// down to a clean rootless path.
fn resolve(cwd: &str, arg: &str) -> String {
    let rooted = if arg.starts_with('/') { arg.to_owned() } else { format!("{cwd}/{arg}") };
    path::clean(rooted.trim_start_matches('/'))
}

/// Runs `mkdir` (or `mkdir -p`) against the cache. Returns `None` when any
/// argument has a `..` component: `mkdir -p a/../b` must create both `a`
/// and `b`, which normalisation would lose, so such invocations belong on
/// a real worker.
pub async fn try_mkdir(
    cache: &AttributeCache,
    cwd: &str,
    args: &[String],
    parents: bool,
) -> Option<OpReport> {
    if args.iter().any(|arg| arg.split('/').any(|component| component == "..")) {
        return None;
    }

    info!(?args, parents, "running mkdir against the cache");
    let mut report = OpReport::default();
    for arg in args {
        let rootless = resolve(cwd, arg);
        if parents {
            mkdir_parents(cache, &rootless, &mut report).await;
        } else {
            mkdir_single(cache, &rootless, &mut report).await;
        }
    }
    Some(report)
}

fn mkdir_entry(rootless: &str) -> FileAttr {
    FileAttr::directory(rootless, 0o755)
}

async fn mkdir_single(cache: &AttributeCache, rootless: &str, report: &mut OpReport) {
    let (dir, _) = path::split_path(rootless);
    let mut parent = cache.get(dir).await;
    if parent.is_deletion() {
        report.fail(format!("file not found: /{dir}"));
        return;
    }
    if !parent.is_directory() {
        report.fail(format!("is not a directory: /{dir}"));
        return;
    }
    if !cache.get(rootless).await.is_deletion() {
        report.fail(format!("file exists: /{rootless}"));
        return;
    }

    let child = mkdir_entry(rootless);
    parent.set_times(None, Some(child.mtime), Some(child.ctime));
    cache.update(FileSet::new(vec![parent, child])).await;
}

/// Walks the components left to right, materialising the missing ones. Each
/// created level is applied as its own batch, so mirrors observe the
/// directories appearing top-down.
async fn mkdir_parents(cache: &AttributeCache, rootless: &str, report: &mut OpReport) {
    let mut parent = cache.get(path::ROOT).await;
    for prefix in path::ancestors(rootless).into_iter().skip(1) {
        let current = cache.get(prefix).await;
        if current.is_deletion() {
            let entry = mkdir_entry(prefix);
            parent.set_times(None, Some(entry.mtime), Some(entry.ctime));
            cache.update(FileSet::new(vec![parent, entry.clone()])).await;
            parent = entry;
        } else if current.is_directory() {
            parent = current;
        } else {
            report.fail(format!("Not a directory: /{prefix}"));
            return;
        }
    }
}

/// Runs `rm` against the cache. Arguments resolve against `cwd`; the
/// accumulated deletion batch is applied in one update.
pub async fn rm(cache: &AttributeCache, cwd: &str, args: &[String], options: RmOptions) -> OpReport {
    info!(?args, force = options.force, recursive = options.recursive, "running rm against the cache");
    let targets: Vec<String> = args.iter().map(|arg| resolve(cwd, arg)).collect();

    let mut report = OpReport::default();
    let mut batch = Vec::new();
    let now = FileTime::now();

    if options.recursive {
        for target in &targets {
            let (parent_dir, _) = path::split_path(target);
            let mut parent = cache.get(parent_dir).await;
            if parent.is_deletion() {
                continue;
            }
            parent.set_times(None, Some(now), Some(now));
            batch.push(parent);
            for name in recurse_names(cache, target).await {
                batch.push(FileAttr::deletion(name));
            }
        }
    } else {
        for target in &targets {
            let attr = cache.get_dir(target).await;
            if attr.is_deletion() {
                if !options.force {
                    report.fail(format!("rm: no such file or directory: {target}"));
                }
            } else if attr.is_directory() {
                report.fail(format!("rm: is a directory: {target}"));
            } else {
                let (parent_dir, _) = path::split_path(target);
                let mut parent = cache.get(parent_dir).await;
                parent.set_times(None, Some(now), Some(now));
                batch.push(parent);
                batch.push(FileAttr::deletion(target.clone()));
            }
        }
    }

    // Deliberately not sorted: deletions must stay descendants-first so
    // every record still finds its parent when applied.
    cache.update(FileSet::new(batch)).await;
    report
}

/// Lists `name` and everything below it, descendants strictly before their
/// ancestor, in listing order. A path that turns out not to exist yields
/// nothing.
async fn recurse_names(cache: &AttributeCache, name: &str) -> Vec<String> {
    let mut out = Vec::new();
    collect_names(cache, name.to_owned(), &mut out).await;
    out
}

fn collect_names<'a>(
    cache: &'a AttributeCache,
    name: String,
    out: &'a mut Vec<String>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let attr = cache.get_dir(&name).await;
        if let Some(listing) = &attr.children {
            for (child, kind) in listing {
                let child_path = path::join(&name, child);
                if *kind == FileKind::Directory {
                    collect_names(cache, child_path, out).await;
                } else {
                    out.push(child_path);
                }
            }
        }
        if !attr.is_deletion() {
            out.push(name);
        }
    })
}
