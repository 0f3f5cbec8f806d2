//! Shared fixtures for the integration tests: a disposable local "remote"
//! driven through the real `git` binary, and a `MirrorPool` rooted in a
//! disposable base directory.
//!
//! These tests shell out to `git` directly (not through `GitFacade`) to set
//! up fixtures, then exercise the crate's public API against them -- same
//! split the teacher's own integration tests draw between fixture setup and
//! the thing under test.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use gitmirror::{MirrorPool, MirrorPoolConfig};
use tempfile::TempDir;

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A plain (non-bare) local repository standing in for a remote. Mirrors
/// clone/fetch from it over `file://`.
pub struct TestRemote {
    _dir: TempDir,
    pub path: Utf8PathBuf,
}

impl TestRemote {
    pub fn init() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        run_git(&path, &["init", "--quiet", "--initial-branch=main"]);
        run_git(&path, &["config", "user.email", "test@example.com"]);
        run_git(&path, &["config", "user.name", "Test User"]);
        Self { _dir: dir, path }
    }

    pub fn commit(&self, file: &str, content: &str, message: &str) -> String {
        std::fs::write(self.path.join(file).as_std_path(), content).unwrap();
        run_git(&self.path, &["add", "."]);
        run_git(&self.path, &["commit", "--quiet", "-m", message]);
        self.head_sha()
    }

    /// Merges `branch` into `main`, producing a merge commit (scenario 2:
    /// `A<-B, A<-C, {B,C}<-M`).
    pub fn merge(&self, branch: &str, message: &str) -> String {
        run_git(&self.path, &["merge", "--no-ff", "--quiet", "-m", message, branch]);
        self.head_sha()
    }

    pub fn checkout_new_branch(&self, name: &str, at: &str) {
        run_git(&self.path, &["checkout", "--quiet", "-b", name, at]);
    }

    pub fn checkout(&self, rev: &str) {
        run_git(&self.path, &["checkout", "--quiet", rev]);
    }

    pub fn head_sha(&self) -> String {
        run_git(&self.path, &["rev-parse", "HEAD"]).trim().to_string()
    }

    pub fn rev_parse(&self, rev: &str) -> String {
        run_git(&self.path, &["rev-parse", rev]).trim().to_string()
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path)
    }

    pub fn add_submodule(&self, path: &str, sub_remote: &TestRemote) {
        run_git(
            &self.path,
            &["-c", "protocol.file.allow=always", "submodule", "add", "--quiet", &sub_remote.url(), path],
        );
        run_git(&self.path, &["commit", "--quiet", "-m", format!("add submodule {path}").as_str()]);
    }
}

fn run_git(dir: &Utf8Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir.as_str())
        .args(args)
        .env("GIT_ALLOW_PROTOCOL", "file")
        .output()
        .expect("failed to spawn git");
    assert!(
        out.status.success(),
        "git {args:?} in {dir} failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// A `MirrorPool` rooted in a fresh temp directory, with native git
/// transport and in-place gc (copy-swap is exercised separately, where the
/// extra directory juggling is the point of the test).
pub struct TestPool {
    _base: TempDir,
    pub pool: MirrorPool,
}

impl TestPool {
    pub fn new() -> Self {
        let base = tempfile::tempdir().unwrap();
        let base_dir = Utf8PathBuf::from_path_buf(base.path().to_path_buf()).unwrap();
        let config = MirrorPoolConfig {
            base_dir,
            ..MirrorPoolConfig::default()
        };
        Self {
            _base: base,
            pool: MirrorPool::new(config),
        }
    }
}

pub fn refs(pairs: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
