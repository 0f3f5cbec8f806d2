//! Submodule Resolver (component F) against real `git` subprocess
//! fixtures. Covers spec §8 scenario 5 (submodule missing commit) and the
//! boundary behavior for relative-URL resolution.

mod support;

use gitmirror::{CancellationToken, ErrorKind, RepoUrl, StateSnapshot};
use support::{git_available, refs, TestPool, TestRemote};

#[test]
fn relative_submodule_url_resolves_against_superproject_remote() {
    if !git_available() {
        return;
    }
    let sub_remote = TestRemote::init();
    sub_remote.commit("lib.txt", "x", "init");

    let parent_remote = TestRemote::init();
    parent_remote.add_submodule("libs/foo", &sub_remote);
    let parent_commit = parent_remote.head_sha();

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let parent_url = RepoUrl::parse(&parent_remote.url()).unwrap();
    let parent_mirror = pool.resolve(&parent_url, &token).unwrap();

    let fetch = pool.fetch_coordinator();
    let snapshot = StateSnapshot::new(refs(&[("refs/heads/main", &parent_commit)]));
    fetch.ensure_present(&parent_mirror, &snapshot, &Default::default(), &token).unwrap();

    let pointer_sha = sub_remote.head_sha();
    let resolver = pool.submodule_resolver(&fetch);
    let (sub_mirror, resolved_sha) = resolver
        .get_submodule_commit(&parent_mirror, &parent_commit, "libs/foo", &pointer_sha, &token)
        .unwrap();

    assert_eq!(resolved_sha, pointer_sha);
    assert_eq!(sub_mirror.canonical_url, RepoUrl::parse(&sub_remote.url()).unwrap().canonical());
}

#[test]
fn submodule_missing_commit_is_reported_with_full_context() {
    if !git_available() {
        return;
    }
    // Scenario 5: the submodule pointer commit no longer exists on the
    // sub-mirror's remote (history rewritten), so resolution must fail
    // with `SubmoduleMissingCommit` carrying the full context tuple.
    let sub_remote = TestRemote::init();
    sub_remote.commit("lib.txt", "x", "init");

    let parent_remote = TestRemote::init();
    parent_remote.add_submodule("libs/foo", &sub_remote);
    let parent_commit = parent_remote.head_sha();

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let parent_url = RepoUrl::parse(&parent_remote.url()).unwrap();
    let parent_mirror = pool.resolve(&parent_url, &token).unwrap();

    let fetch = pool.fetch_coordinator();
    let snapshot = StateSnapshot::new(refs(&[("refs/heads/main", &parent_commit)]));
    fetch.ensure_present(&parent_mirror, &snapshot, &Default::default(), &token).unwrap();

    let bogus_commit = "1".repeat(40);
    let resolver = pool.submodule_resolver(&fetch);
    let err = resolver
        .get_submodule_commit(&parent_mirror, &parent_commit, "libs/foo", &bogus_commit, &token)
        .unwrap_err();

    match err.kind {
        ErrorKind::SubmoduleMissingCommit {
            main_repo_url,
            main_commit,
            submodule_path,
            submodule_commit,
            ..
        } => {
            assert_eq!(main_repo_url, parent_mirror.canonical_url);
            assert_eq!(main_commit, parent_commit);
            assert_eq!(submodule_path, "libs/foo");
            assert_eq!(submodule_commit, bogus_commit);
        }
        other => panic!("expected SubmoduleMissingCommit, got {other:?}"),
    }
}
