//! Change Collector (component E) against a real `git` subprocess fixture.
//! Covers spec §8 scenarios 1-3 and invariants 3-5.

mod support;

use gitmirror::{CancellationToken, CheckoutRules, RepoUrl, StateSnapshot};
use support::{git_available, refs, TestPool, TestRemote};

#[test]
fn linear_history_orders_children_before_parents() {
    if !git_available() {
        return;
    }
    // Scenario 1: A <- B <- C on `main`.
    let remote = TestRemote::init();
    let a = remote.commit("f.txt", "a", "A");
    let b = remote.commit("f.txt", "b", "B");
    let c = remote.commit("f.txt", "c", "C");

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let url = RepoUrl::parse(&remote.url()).unwrap();
    let mirror = pool.resolve(&url, &token).unwrap();

    let fetch = pool.fetch_coordinator();
    let from = StateSnapshot::new(refs(&[("refs/heads/main", &a)]));
    let to = StateSnapshot::new(refs(&[("refs/heads/main", &c)]));

    let collector = pool.change_collector(&fetch);
    let records = collector
        .collect_changes(&mirror, &from, &to, &CheckoutRules::all(), None, &token)
        .unwrap();

    assert_eq!(records.len(), 2, "expected [C, B], got {records:?}");
    assert_eq!(records[0].commit_sha, c);
    assert_eq!(records[0].parents, vec![b.clone()]);
    assert_eq!(records[1].commit_sha, b);
    assert_eq!(records[1].parents, vec![a.clone()]);

    // Invariant 4: no commit reachable from `from` (i.e. A) appears.
    assert!(!records.iter().any(|r| r.commit_sha == a));

    // Invariant 3: reverse-topo order -- every parent sha, if it also
    // appears in the output, must be at a later index than its child.
    for (i, record) in records.iter().enumerate() {
        for parent in &record.parents {
            if let Some(parent_idx) = records.iter().position(|r| &r.commit_sha == parent) {
                assert!(i < parent_idx, "child {} must precede parent {}", record.commit_sha, parent);
            }
        }
    }
}

#[test]
fn collect_changes_is_idempotent_across_calls() {
    if !git_available() {
        return;
    }
    // Invariant 5.
    let remote = TestRemote::init();
    let a = remote.commit("f.txt", "a", "A");
    let c = remote.commit("f.txt", "c", "C");

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let url = RepoUrl::parse(&remote.url()).unwrap();
    let mirror = pool.resolve(&url, &token).unwrap();
    let fetch = pool.fetch_coordinator();
    let from = StateSnapshot::new(refs(&[("refs/heads/main", &a)]));
    let to = StateSnapshot::new(refs(&[("refs/heads/main", &c)]));
    let collector = pool.change_collector(&fetch);

    let first = collector
        .collect_changes(&mirror, &from, &to, &CheckoutRules::all(), None, &token)
        .unwrap();
    let second = collector
        .collect_changes(&mirror, &from, &to, &CheckoutRules::all(), None, &token)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn merge_commit_uses_combined_diff_and_reverse_topo_order() {
    if !git_available() {
        return;
    }
    // Scenario 2: A <- B, A <- C, {B, C} <- M on `main`.
    let remote = TestRemote::init();
    let a = remote.commit("base.txt", "a", "A");
    remote.checkout_new_branch("feature", &a);
    let b = remote.commit("feature.txt", "b", "B");
    remote.checkout("main");
    let c = remote.commit("main.txt", "c", "C");
    let m = remote.merge("feature", "M");

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let url = RepoUrl::parse(&remote.url()).unwrap();
    let mirror = pool.resolve(&url, &token).unwrap();
    let fetch = pool.fetch_coordinator();
    let from = StateSnapshot::new(refs(&[("refs/heads/main", &a)]));
    let to = StateSnapshot::new(refs(&[("refs/heads/main", &m)]));
    let collector = pool.change_collector(&fetch);

    let records = collector
        .collect_changes(&mirror, &from, &to, &CheckoutRules::all(), None, &token)
        .unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].commit_sha, m);
    let mut parents = records[0].parents.clone();
    parents.sort();
    let mut expected_parents = vec![b.clone(), c.clone()];
    expected_parents.sort();
    assert_eq!(parents, expected_parents);

    let rest: Vec<&str> = records[1..].iter().map(|r| r.commit_sha.as_str()).collect();
    assert!(rest.contains(&b.as_str()));
    assert!(rest.contains(&c.as_str()));
}

#[test]
fn missing_fetch_is_performed_transparently() {
    if !git_available() {
        return;
    }
    // Scenario 3: `from={main:A}` with A absent locally; one fetch brings
    // it in and the result is non-empty.
    let remote = TestRemote::init();
    let a = remote.commit("f.txt", "a", "A");
    let b = remote.commit("f.txt", "b", "B");

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let url = RepoUrl::parse(&remote.url()).unwrap();
    // `resolve` only creates the empty bare mirror; nothing has been
    // fetched yet, so both A and B are "missing" at this point.
    let mirror = pool.resolve(&url, &token).unwrap();

    let fetch = pool.fetch_coordinator();
    let from = StateSnapshot::new(refs(&[("refs/heads/main", &a)]));
    let to = StateSnapshot::new(refs(&[("refs/heads/main", &b)]));
    let collector = pool.change_collector(&fetch);

    let records = collector
        .collect_changes(&mirror, &from, &to, &CheckoutRules::all(), None, &token)
        .unwrap();
    assert!(!records.is_empty());
    assert_eq!(records[0].commit_sha, b);
}

#[test]
fn from_entirely_absent_returns_empty_list_not_error() {
    if !git_available() {
        return;
    }
    let remote = TestRemote::init();
    let b = remote.commit("f.txt", "a", "A");

    let test_pool = TestPool::new();
    let pool = &test_pool.pool;
    let token = CancellationToken::new();
    let url = RepoUrl::parse(&remote.url()).unwrap();
    let mirror = pool.resolve(&url, &token).unwrap();
    let fetch = pool.fetch_coordinator();

    // A `from` sha that never existed on the remote at all: fetch cannot
    // make it present, so collect_changes must degrade to an empty result
    // rather than propagating the fetch error.
    let bogus = "0".repeat(40);
    let from = StateSnapshot::new(refs(&[("refs/heads/main", &bogus)]));
    let to = StateSnapshot::new(refs(&[("refs/heads/main", &b)]));
    let collector = pool.change_collector(&fetch);

    let records = collector
        .collect_changes(&mirror, &from, &to, &CheckoutRules::all(), None, &token)
        .unwrap();
    assert!(records.is_empty());
}
