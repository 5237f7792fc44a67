use std::sync::Arc;
use std::time::Duration;

use fsmirror::attr::{FileAttr, FileKind};

use super::common::{dir_attr, file_attr, Fixture, ScriptedGetter};

#[tokio::test]
async fn get_returns_entry_without_children() {
    let fixture = Fixture::new();
    fixture.seed_root(&[]).await;
    fixture.seed(vec![dir_attr("a", &[("x", FileKind::Regular)])]).await;

    let attr = fixture.cache.get("a").await;
    assert!(attr.is_directory());
    assert!(attr.children.is_none());

    let with_listing = fixture.cache.get_dir("a").await;
    assert!(with_listing.lists("x"));
}

#[tokio::test]
async fn returned_copies_are_independent_of_the_store() {
    let fixture = Fixture::new();
    fixture.seed_root(&[]).await;
    fixture.seed(vec![file_attr("f", 10)]).await;

    let mut copy = fixture.cache.get("f").await;
    copy.size = 999;
    copy.path = "mangled".to_owned();

    assert_eq!(fixture.cache.get("f").await.size, 10);
}

#[tokio::test]
async fn negative_lookup_answers_from_parent_listing() {
    let fixture = Fixture::new();
    fixture.seed_root(&[("a", FileKind::Regular)]).await;

    let attr = fixture.cache.get("b").await;
    assert!(attr.is_deletion());
    assert_eq!(attr.path, "b");
    assert_eq!(fixture.getter.calls(), 0);
}

#[tokio::test]
async fn fetched_directory_listing_shortcuts_sibling_misses() {
    let fixture = Fixture::new();
    fixture.getter.insert(dir_attr("", &[("d", FileKind::Directory)]));
    fixture.getter.insert(dir_attr("d", &[("a", FileKind::Regular), ("b", FileKind::Regular)]));

    let dir = fixture.cache.get_dir("d").await;
    assert!(dir.lists("a"));
    let fetches_so_far = fixture.getter.calls();
    assert_eq!(fetches_so_far, 2);

    let missing = fixture.cache.get("d/c").await;
    assert!(missing.is_deletion());
    assert_eq!(fixture.getter.calls(), fetches_so_far);
}

#[tokio::test]
async fn parents_are_fetched_before_children() {
    let fixture = Fixture::new();
    fixture.getter.insert(dir_attr("", &[("d", FileKind::Directory)]));
    fixture.getter.insert(dir_attr("d", &[("f", FileKind::Regular)]));
    fixture.getter.insert(file_attr("d/f", 7));

    let attr = fixture.cache.get("d/f").await;
    assert!(attr.is_regular());
    assert!(fixture.cache.have("").await);
    assert!(fixture.cache.have("d").await);
    fixture.cache.verify().await;
}

#[tokio::test]
async fn lookup_through_missing_directory_is_negative() {
    let fixture = Fixture::new();
    fixture.getter.insert(dir_attr("", &[("d", FileKind::Directory)]));
    fixture.getter.insert(dir_attr("d", &[]));

    let attr = fixture.cache.get("d/nope/deeper").await;
    assert!(attr.is_deletion());
    assert_eq!(attr.path, "d/nope/deeper");
    // "d/nope" is not listed, so neither it nor anything below is fetched.
    assert_eq!(fixture.getter.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_fetch() {
    let getter = ScriptedGetter::with_delay(Duration::from_millis(50));
    let fixture = Fixture::with_getter(getter);
    fixture.seed_root(&[("foo", FileKind::Regular)]).await;
    fixture.getter.insert(file_attr("foo", 42));

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let cache = Arc::clone(&fixture.cache);
        tasks.push(tokio::spawn(async move { cache.get("foo").await }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("lookup task"));
    }

    assert!(results.iter().all(|attr| attr.is_regular() && attr.size == 42));
    assert_eq!(fixture.getter.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn child_fetched_across_a_parent_deletion_is_not_installed() {
    let getter = ScriptedGetter::with_delay(Duration::from_millis(100));
    let fixture = Fixture::with_getter(getter);
    fixture.seed_root(&[]).await;
    fixture.seed(vec![dir_attr("d", &[("f", FileKind::Regular)])]).await;
    fixture.getter.insert(file_attr("d/f", 7));

    let cache = Arc::clone(&fixture.cache);
    let lookup = tokio::spawn(async move { cache.get("d/f").await });

    // Remove the subtree while the fetch is still out, descendants first
    // as a recursive removal would.
    tokio::time::sleep(Duration::from_millis(20)).await;
    fixture.seed(vec![FileAttr::deletion("d/f"), FileAttr::deletion("d")]).await;

    lookup.await.expect("lookup task");
    assert!(!fixture.cache.have("d/f").await);
    assert!(!fixture.cache.have("d").await);
    fixture.cache.verify().await;
}

#[tokio::test]
async fn transient_fetch_failure_is_not_cached() {
    let fixture = Fixture::new();
    fixture.seed_root(&[("flaky", FileKind::Regular)]).await;
    fixture.getter.insert(file_attr("flaky", 1));
    fixture.getter.set_failing(true);

    let first = fixture.cache.get("flaky").await;
    assert!(first.is_deletion());
    assert!(!fixture.cache.have("flaky").await);

    fixture.getter.set_failing(false);
    let second = fixture.cache.get("flaky").await;
    assert!(second.is_regular());
    assert_eq!(fixture.getter.calls(), 2);
}

#[tokio::test]
#[should_panic(expected = "leading slash")]
async fn rooted_paths_are_a_contract_violation() {
    let fixture = Fixture::new();
    fixture.cache.get("/etc").await;
}
