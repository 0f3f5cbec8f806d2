//! Native-git argument-vector/environment builder (component C).
//!
//! Grounded on the teacher's `GitRepo::git`/`Command::new("git")` call
//! sites, collapsed per REDESIGN FLAGS (spec §9) into one record of
//! function values instead of one ad hoc `Command` builder per call site:
//! every subcommand takes an explicit options struct, never ambient
//! parameters.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use derive_builder::Builder;

use crate::cancellation::CancellationToken;
use crate::error::{ErrorKind, GitMirrorError, Result};
use crate::process::{tail_lines, ProcessOutput, ProcessRunner, Timeouts};
use crate::registry::ErrorRegistry;

/// Lowest native `git` version this facade will drive. Callers must check
/// [`GitFacade::version_supported`] before relying on `fetch --stdin`-based
/// batched ref updates.
pub const MIN_SUPPORTED_GIT_VERSION: (u32, u32, u32) = (2, 20, 0);

#[derive(Debug, Clone, Default, Builder)]
#[builder(default)]
pub struct FetchOptions {
    pub refspecs: Vec<String>,
    pub prune: bool,
}

#[derive(Debug, Clone, Default, Builder)]
#[builder(default)]
pub struct RepackOptions {
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CloneMirrorOptions {
    pub url: String,
    pub target: Utf8PathBuf,
}

/// Assembles argv + env for each git subcommand the mirror pool needs, and
/// drives it through [`ProcessRunner`] (component B). Holds no repo-specific
/// state; every call takes the git-dir explicitly.
pub struct GitFacade {
    git_executable: Utf8PathBuf,
    runner: ProcessRunner,
    extra_env: BTreeMap<String, String>,
    error_registry: Option<Arc<ErrorRegistry>>,
}

impl GitFacade {
    pub fn new(git_executable: Utf8PathBuf, timeouts: Timeouts) -> Self {
        Self {
            git_executable,
            runner: ProcessRunner::new(timeouts),
            extra_env: BTreeMap::new(),
            error_registry: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Wires up the Error/Progress Registry (component I) so every failed
    /// git invocation this facade makes is recorded as the pool's most
    /// recent native-git error, surfaced by the admin CLI's `status`
    /// subcommand.
    pub fn with_error_registry(mut self, registry: Arc<ErrorRegistry>) -> Self {
        self.error_registry = Some(registry);
        self
    }

    fn record_native_git_error(&self, message: &str) {
        if let Some(registry) = &self.error_registry {
            registry.record_native_git_error(message.to_string());
        }
    }

    fn base_command(&self, git_dir: &Utf8Path) -> Command {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("--git-dir").arg(git_dir.as_str());
        for (k, v) in &self.extra_env {
            cmd.env(k, v);
        }
        cmd
    }

    fn run(&self, cmd: Command, token: &CancellationToken) -> Result<ProcessOutput> {
        self.runner.run_checked(cmd, None, token).map_err(|e| {
            self.record_native_git_error(&e.to_string());
            GitMirrorError::from(e)
        })
    }

    pub fn version(&self, token: &CancellationToken) -> Result<(u32, u32, u32)> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("version");
        let out = self
            .runner
            .run_checked(cmd, None, token)
            .map_err(GitMirrorError::from)?;
        parse_git_version(&out.stdout_string())
            .ok_or_else(|| GitMirrorError::new(ErrorKind::NativeGitUnavailable, "unparseable git version"))
    }

    pub fn version_supported(&self, token: &CancellationToken) -> Result<bool> {
        Ok(self.version(token)? >= MIN_SUPPORTED_GIT_VERSION)
    }

    pub fn init_bare(&self, git_dir: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("init").arg("--bare").arg(git_dir.as_str());
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn clone_mirror(&self, opts: &CloneMirrorOptions, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("clone")
            .arg("--mirror")
            .arg("--")
            .arg(&opts.url)
            .arg(opts.target.as_str());
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn fetch(&self, git_dir: &Utf8Path, opts: &FetchOptions, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("fetch").arg("--stdin");
        if opts.prune {
            cmd.arg("--prune");
        }
        cmd.arg("origin");
        self.run_with_stdin(cmd, opts.refspecs.join("\n"), token)?;
        Ok(())
    }

    fn run_with_stdin(&self, mut cmd: Command, stdin: String, token: &CancellationToken) -> Result<ProcessOutput> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // `ProcessRunner::run` owns spawn; to feed stdin we spawn directly
        // here and hand the already-running child's remaining lifecycle to
        // the same checked-output convention as every other call.
        let mut child = cmd.spawn().map_err(|e| {
            GitMirrorError::with_source(ErrorKind::Internal, "failed to spawn git fetch", e)
        })?;
        use std::io::Write;
        if let Some(mut stdin_pipe) = child.stdin.take() {
            let _ = stdin_pipe.write_all(stdin.as_bytes());
        }
        let output = child.wait_with_output().map_err(|e| {
            GitMirrorError::with_source(ErrorKind::Internal, "failed to wait on git fetch", e)
        })?;
        let _ = token.check();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("git fetch exited with {}: {}", output.status, tail_lines(&stderr, 20));
            self.record_native_git_error(&message);
            return Err(GitMirrorError::new(classify_fetch_failure(&stderr), message));
        }
        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            duration: std::time::Duration::default(),
        })
    }

    pub fn ls_remote(&self, url: &str, token: &CancellationToken) -> Result<String> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("ls-remote").arg(url);
        Ok(self.run(cmd, token)?.stdout_string())
    }

    pub fn push(&self, git_dir: &Utf8Path, remote: &str, refspec: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("push").arg(remote).arg(refspec);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn update_ref(&self, git_dir: &Utf8Path, ref_name: &str, new_value: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("update-ref").arg(ref_name).arg(new_value);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn config_get(&self, git_dir: &Utf8Path, key: &str, token: &CancellationToken) -> Result<Option<String>> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("config").arg("--get").arg(key);
        match self.runner.run(cmd, None, token) {
            Ok(out) if out.success() => Ok(Some(out.stdout_string().trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn config_set(&self, git_dir: &Utf8Path, key: &str, value: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("config").arg("--set").arg(key).arg(value);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn config_list(&self, git_dir: &Utf8Path, token: &CancellationToken) -> Result<String> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("config").arg("--list");
        Ok(self.run(cmd, token)?.stdout_string())
    }

    pub fn gc_auto_quiet(&self, git_dir: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("gc").arg("--auto").arg("--quiet");
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn repack(&self, git_dir: &Utf8Path, opts: &RepackOptions, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("repack");
        cmd.args(&opts.extra_args);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn pack_refs_all(&self, git_dir: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("pack-refs").arg("--all");
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn clean(&self, git_dir: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("clean").arg("-fdx");
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn reset_hard(&self, git_dir: &Utf8Path, commit: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("reset").arg("--hard").arg(commit);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn checkout(&self, git_dir: &Utf8Path, commit: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("checkout").arg(commit);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn branch_delete(&self, git_dir: &Utf8Path, name: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("branch").arg("-D").arg(name);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn tag_delete(&self, git_dir: &Utf8Path, name: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("tag").arg("-d").arg(name);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn remote_add(&self, git_dir: &Utf8Path, name: &str, url: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("remote").arg("add").arg(name).arg(url);
        self.run(cmd, token)?;
        Ok(())
    }

    /// `git log --topo-order --format=... <start> ^<stop>...`, parsed by
    /// the Change Collector (component E). Deliberately omits `--reverse`:
    /// default topo order already lists each commit before its parents,
    /// which is the "children precede parents" order the collector needs.
    pub fn log_topo(
        &self,
        git_dir: &Utf8Path,
        range_args: &[String],
        token: &CancellationToken,
    ) -> Result<String> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("log")
            .arg("--topo-order")
            .arg("--format=%H%x1f%P%x1f%an%x1f%ae%x1f%at%x1f%cn%x1f%ce%x1f%ct%x1f%B%x1e");
        cmd.args(range_args);
        Ok(self.run(cmd, token)?.stdout_string())
    }

    pub fn diff_name_status(
        &self,
        git_dir: &Utf8Path,
        from: &str,
        to: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("diff")
            .arg("--name-status")
            .arg("-M")
            .arg("-C")
            .arg(from)
            .arg(to);
        Ok(self.run(cmd, token)?.stdout_string())
    }

    pub fn ls_tree(&self, git_dir: &Utf8Path, treeish: &str, token: &CancellationToken) -> Result<String> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("ls-tree").arg(treeish);
        Ok(self.run(cmd, token)?.stdout_string())
    }

    pub fn rev_parse(&self, git_dir: &Utf8Path, rev: &str, token: &CancellationToken) -> Result<Option<String>> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("rev-parse").arg("--verify").arg("--quiet").arg(rev);
        match self.runner.run(cmd, None, token) {
            Ok(out) if out.success() => Ok(Some(out.stdout_string().trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn show_ref(&self, git_dir: &Utf8Path, token: &CancellationToken) -> Result<String> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("show-ref");
        match self.runner.run(cmd, None, token) {
            Ok(out) => Ok(out.stdout_string()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn show_blob(&self, git_dir: &Utf8Path, object: &str, token: &CancellationToken) -> Result<Vec<u8>> {
        let mut cmd = self.base_command(git_dir);
        cmd.arg("show").arg(object);
        Ok(self.run(cmd, token)?.stdout)
    }

    pub fn submodule_init(&self, worktree: &Utf8Path, path: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("-C").arg(worktree.as_str());
        cmd.arg("submodule").arg("init").arg("--").arg(path);
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn submodule_sync(&self, worktree: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("-C").arg(worktree.as_str());
        cmd.arg("submodule").arg("sync");
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn submodule_update(&self, worktree: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("-C").arg(worktree.as_str());
        cmd.arg("submodule").arg("update");
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn update_index_refresh(&self, worktree: &Utf8Path, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("-C").arg(worktree.as_str());
        cmd.arg("update-index").arg("--refresh");
        self.run(cmd, token)?;
        Ok(())
    }

    pub fn merge(&self, worktree: &Utf8Path, commit: &str, token: &CancellationToken) -> Result<()> {
        let mut cmd = Command::new(self.git_executable.as_str());
        cmd.arg("-C").arg(worktree.as_str());
        cmd.arg("merge").arg(commit);
        self.run(cmd, token)?;
        Ok(())
    }
}

/// Classifies a failed `git fetch`'s stderr into the transport taxonomy
/// `fetch.rs`'s retry loop branches on (spec §4.D): auth rejections and a
/// remote that doesn't exist are permanent and must not be retried, unlike
/// a dropped connection or a transient DNS failure.
fn classify_fetch_failure(stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    let auth_markers = [
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied (publickey)",
        "invalid credentials",
        "http basic: access denied",
        "the requested url returned error: 403",
    ];
    if auth_markers.iter().any(|m| lower.contains(m)) {
        return ErrorKind::AuthWrongCredentials;
    }

    let permanent_markers = [
        "repository not found",
        "does not appear to be a git repository",
        "the requested url returned error: 404",
    ];
    if permanent_markers.iter().any(|m| lower.contains(m)) {
        return ErrorKind::TransportPermanent;
    }

    ErrorKind::TransportRecoverable
}

fn parse_git_version(stdout: &str) -> Option<(u32, u32, u32)> {
    // "git version 2.43.0" (possibly with a vendor suffix after a space).
    let version_part = stdout.trim().strip_prefix("git version ")?;
    let version_part = version_part.split_whitespace().next()?;
    let mut parts = version_part.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_git_version() {
        assert_eq!(parse_git_version("git version 2.43.0\n"), Some((2, 43, 0)));
    }

    #[test]
    fn parses_vendor_suffixed_git_version() {
        assert_eq!(
            parse_git_version("git version 2.39.3 (Apple Git-145)\n"),
            Some((2, 39, 3))
        );
    }

    #[test]
    fn classifies_auth_rejection_as_wrong_credentials() {
        let stderr = "fatal: Authentication failed for 'https://example.com/repo.git/'";
        assert_eq!(classify_fetch_failure(stderr), ErrorKind::AuthWrongCredentials);
    }

    #[test]
    fn classifies_missing_repository_as_transport_permanent() {
        let stderr = "remote: Repository not found.\nfatal: repository 'https://example.com/gone.git/' not found";
        assert_eq!(classify_fetch_failure(stderr), ErrorKind::TransportPermanent);
    }

    #[test]
    fn classifies_unrecognized_failure_as_transport_recoverable() {
        let stderr = "fatal: unable to access 'https://example.com/repo.git/': Could not resolve host: example.com";
        assert_eq!(classify_fetch_failure(stderr), ErrorKind::TransportRecoverable);
    }

    #[test]
    fn min_supported_version_ordering() {
        assert!((2, 43, 0) >= MIN_SUPPORTED_GIT_VERSION);
        assert!((2, 10, 0) < MIN_SUPPORTED_GIT_VERSION);
    }

    #[test]
    fn facade_reports_real_git_version_when_available() {
        if which_git().is_none() {
            return;
        }
        let facade = GitFacade::new(Utf8PathBuf::from("git"), Timeouts::default());
        let token = CancellationToken::new();
        let version = facade.version(&token).unwrap();
        assert!(version.0 >= 1);
    }

    fn which_git() -> Option<Utf8PathBuf> {
        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|p| p.join("git"))
                .find(|p| p.exists())
                .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        })
    }
}
