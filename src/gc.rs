//! Compactor (component H): expires stale mirrors, cleans monitoring
//! data and crashed copy-swap leftovers, then repacks every mirror that
//! needs it within a wall-clock quota.
//!
//! Grounded on the teacher's `GitCacheRepo::gc` (`git gc --auto --quiet`
//! under a write lock); generalized into two strategies -- in-place
//! (teacher's own approach) and copy-swap, selected per spec §4.H so a
//! crashed gc never leaves a mirror half-packed under its real name.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam::channel;
use rand::seq::SliceRandom;
use scopeguard::defer;

use crate::cancellation::CancellationToken;
use crate::config::MirrorPoolConfig;
use crate::error::{ErrorKind, GitMirrorError, Result};
use crate::facade::{GitFacade, RepackOptionsBuilder};
use crate::mirror_dir::{MirrorDir, MirrorDirManager};
use crate::registry::{ErrorRegistry, LoggingProgressSink, ProgressSink};

/// One mirror's outcome from a worker thread, reported back to the main
/// thread over `result_tx` for sequential summary/registry aggregation --
/// the same two-channel split the teacher uses in its prefetch worker pool
/// (work queue in, results out).
enum MirrorOutcome {
    SkippedQuota,
    SkippedNotNeeded { hash: String },
    Compacted { hash: String, elapsed: Duration },
    Failed { hash: String, error: GitMirrorError },
}

/// Only one compaction round runs at a time per process (spec §5); a
/// second caller gets `Internal` rather than queuing behind the first.
static GC_RUNNING: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub expired_removed: usize,
    pub compacted: usize,
    pub skipped_quota: usize,
    pub skipped_not_needed: usize,
    pub failed: usize,
}

pub struct Compactor<'a> {
    mirror_dirs: &'a MirrorDirManager,
    facade: &'a GitFacade,
    config: &'a MirrorPoolConfig,
    registry: &'a ErrorRegistry,
    progress: Box<dyn ProgressSink>,
}

impl<'a> Compactor<'a> {
    pub fn new(mirror_dirs: &'a MirrorDirManager, facade: &'a GitFacade, config: &'a MirrorPoolConfig, registry: &'a ErrorRegistry) -> Self {
        Self {
            mirror_dirs,
            facade,
            config,
            registry,
            progress: Box::new(LoggingProgressSink),
        }
    }

    pub fn with_progress_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(sink);
        self
    }

    /// Runs one full compaction round (spec §4.H steps 1-8).
    pub fn run(&self, token: &CancellationToken) -> Result<GcSummary> {
        if GC_RUNNING.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(GitMirrorError::new(ErrorKind::Internal, "a compaction round is already running"));
        }
        defer! { GC_RUNNING.store(false, Ordering::SeqCst); }

        let mut summary = GcSummary::default();

        self.remove_expired_mirrors(&mut summary, token)?;
        self.prune_stale_errors()?;
        self.clean_monitoring_data()?;
        self.clean_leftover_gc_artifacts()?;
        self.compact_all(&mut summary, token)?;

        Ok(summary)
    }

    /// Drops error-registry entries for mirrors removed in this round (or
    /// otherwise gone from disk), so a hash that gets reused by a later
    /// `resolve` doesn't inherit a stale error from a mirror that no longer
    /// exists.
    fn prune_stale_errors(&self) -> Result<()> {
        let still_present: std::collections::HashSet<String> = self
            .list_mirror_dirs()?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.strip_suffix(".git")).map(str::to_string))
            .collect();
        self.registry.retain_errors(|hash| still_present.contains(hash));
        Ok(())
    }

    /// Step 1: delete mirrors idle past `mirror_expiration_days`, under
    /// `rm.write` so no reader/writer can be mid-operation.
    fn remove_expired_mirrors(&self, summary: &mut GcSummary, token: &CancellationToken) -> Result<()> {
        let expired = self.mirror_dirs.expired_dirs(self.config.mirror_expiration_days)?;
        for mirror in expired {
            token.check()?;
            let _write = self.mirror_dirs.rm_write_lock(&mirror)?;
            match fs::remove_dir_all(&mirror.path) {
                Ok(()) => {
                    summary.expired_removed += 1;
                    self.registry.clear_error(&mirror.hash);
                    log::info!("removed expired mirror {} ({})", mirror.canonical_url, mirror.hash);
                }
                Err(e) => {
                    self.mirror_dirs.invalidate(&mirror);
                    let err = GitMirrorError::with_source(ErrorKind::Internal, format!("removing expired mirror {}", mirror.path), e);
                    self.registry.register_error(&mirror.hash, &err);
                    log::warn!("failed to remove expired mirror {}: {err}", mirror.path);
                }
            }
        }
        Ok(())
    }

    /// Step 2: delete `monitoring/*.data` files older than
    /// `monitoring_expiration_timeout_hours`.
    fn clean_monitoring_data(&self) -> Result<()> {
        let cutoff = Duration::from_secs(self.config.monitoring_expiration_timeout_hours.saturating_mul(3600));
        for mirror_path in self.list_mirror_dirs()? {
            let monitoring_dir = mirror_path.join("monitoring");
            let Ok(entries) = fs::read_dir(&monitoring_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(metadata) = entry.metadata() else { continue };
                let Ok(age) = metadata.modified().and_then(|m| SystemTime::now().duration_since(m).map_err(std::io::Error::other)) else {
                    continue;
                };
                if age > cutoff {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Step 3: a `<hash>.git.gc` or `<hash>.git.old` directory left behind
    /// by a crashed copy-swap is safe to delete once it's older than the
    /// gc quota itself -- nothing still mid-flight would leave one that
    /// stale.
    fn clean_leftover_gc_artifacts(&self) -> Result<()> {
        let cutoff = Duration::from_secs(self.config.native_gc_quota_minutes.saturating_mul(60) * 4);
        let Ok(entries) = fs::read_dir(self.mirror_dirs.base_dir().as_std_path()) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !(name.ends_with(".git.gc") || name.ends_with(".git.old")) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(age) = metadata.modified().and_then(|m| SystemTime::now().duration_since(m).map_err(std::io::Error::other)) else {
                continue;
            };
            if age > cutoff {
                log::warn!("removing stale gc leftover {}", path.display());
                let _ = fs::remove_dir_all(&path);
            }
        }
        Ok(())
    }

    fn list_mirror_dirs(&self) -> Result<Vec<Utf8PathBuf>> {
        let mut result = Vec::new();
        let entries = match fs::read_dir(self.mirror_dirs.base_dir().as_std_path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(GitMirrorError::with_source(ErrorKind::Internal, "scanning base directory", e)),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.ends_with(".git") || name.ends_with(".git.gc") || name.ends_with(".git.old") {
                continue;
            }
            if let Ok(utf8) = Utf8PathBuf::from_path_buf(path) {
                result.push(utf8);
            }
        }
        Ok(result)
    }

    /// Steps 4-8: decide which mirrors need gc, shuffle the order so one
    /// unlucky mirror doesn't always eat the whole quota, and repack each
    /// one until the wall-clock budget runs out.
    ///
    /// Mirrors a pool of independent repos, each with its own lock files and
    /// subprocess, so work fans out over a worker pool the same shape as the
    /// teacher's prefetcher: one channel hands out mirror paths, a second
    /// carries results back for single-threaded summary/registry updates.
    fn compact_all(&self, summary: &mut GcSummary, token: &CancellationToken) -> Result<()> {
        let mut mirror_paths = self.list_mirror_dirs()?;
        mirror_paths.shuffle(&mut rand::rng());

        let deadline = Instant::now() + Duration::from_secs(self.config.native_gc_quota_minutes.saturating_mul(60));
        let worker_count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(mirror_paths.len().max(1));

        let (work_tx, work_rx) = channel::unbounded::<Utf8PathBuf>();
        let (result_tx, result_rx) = channel::unbounded::<MirrorOutcome>();
        for path in mirror_paths {
            let _ = work_tx.send(path);
        }
        drop(work_tx);

        thread::scope(|scope| {
            for _ in 0..worker_count {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(|| {
                    for path in work_rx.iter() {
                        if token.is_cancelled() {
                            break;
                        }
                        if Instant::now() >= deadline {
                            let _ = result_tx.send(MirrorOutcome::SkippedQuota);
                            continue;
                        }
                        let _ = result_tx.send(self.gc_one(&path, token));
                    }
                });
            }
            drop(result_tx);

            for outcome in result_rx.iter() {
                self.apply_outcome(summary, outcome);
            }
        });

        token.check()
    }

    fn gc_one(&self, path: &Utf8Path, token: &CancellationToken) -> MirrorOutcome {
        let hash = path.file_name().and_then(|n| n.strip_suffix(".git")).unwrap_or_default().to_string();
        let canonical_url = self.facade.config_get(path, "teamcity.remote", token).ok().flatten().unwrap_or_default();
        let mirror = MirrorDir {
            hash: hash.clone(),
            path: path.to_path_buf(),
            canonical_url,
        };

        if !self.needs_gc(path) {
            self.progress.on_gc_skip(&hash, "below gc.auto/gc.autopacklimit thresholds");
            return MirrorOutcome::SkippedNotNeeded { hash };
        }

        match self.disk_space_sufficient(path) {
            Ok(true) => {}
            Ok(false) => {
                let error = GitMirrorError::new(ErrorKind::GcDiskFull, format!("insufficient free space to gc {}", mirror.path));
                return MirrorOutcome::Failed { hash, error };
            }
            Err(error) => return MirrorOutcome::Failed { hash, error },
        }

        self.progress.on_gc_start(&hash);
        let start = Instant::now();
        match self.compact_one(&mirror, token) {
            Ok(()) => MirrorOutcome::Compacted { hash, elapsed: start.elapsed() },
            Err(error) => MirrorOutcome::Failed { hash, error },
        }
    }

    fn apply_outcome(&self, summary: &mut GcSummary, outcome: MirrorOutcome) {
        match outcome {
            MirrorOutcome::SkippedQuota => summary.skipped_quota += 1,
            MirrorOutcome::SkippedNotNeeded { .. } => summary.skipped_not_needed += 1,
            MirrorOutcome::Compacted { hash, elapsed } => {
                summary.compacted += 1;
                self.registry.clear_error(&hash);
                self.progress.on_gc_done(&hash, elapsed);
            }
            MirrorOutcome::Failed { hash, error } => {
                summary.failed += 1;
                log::warn!("gc failed for {hash}: {error}");
                self.registry.register_error(&hash, &error);
            }
        }
    }

    fn needs_gc(&self, mirror_path: &Utf8Path) -> bool {
        self.loose_object_estimate(mirror_path) >= self.config.gc_auto || self.pack_count(mirror_path) >= self.config.gc_autopacklimit as u64
    }

    /// git's own `gc --auto` heuristic: count objects in one fan-out
    /// bucket (`objects/17`) and multiply by the 256 buckets rather than
    /// walking the whole loose-object tree.
    fn loose_object_estimate(&self, mirror_path: &Utf8Path) -> u64 {
        let bucket = mirror_path.join("objects").join("17");
        fs::read_dir(bucket.as_std_path()).map(|it| it.count()).unwrap_or(0) as u64 * 256
    }

    fn pack_count(&self, mirror_path: &Utf8Path) -> u64 {
        let pack_dir = mirror_path.join("objects").join("pack");
        fs::read_dir(pack_dir.as_std_path())
            .map(|it| {
                it.flatten()
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "pack"))
                    .count()
            })
            .unwrap_or(0) as u64
    }

    fn disk_space_sufficient(&self, mirror_path: &Utf8Path) -> Result<bool> {
        let pack_dir = mirror_path.join("objects").join("pack");
        let needed = dir_size(&pack_dir);
        let available = fs4::fs_std::available_space(mirror_path.as_std_path())
            .map_err(|e| GitMirrorError::with_source(ErrorKind::Internal, "checking free disk space", e))?;
        Ok(available >= needed)
    }

    fn compact_one(&self, mirror: &MirrorDir, token: &CancellationToken) -> Result<()> {
        if self.config.run_in_place_gc {
            self.in_place_gc(mirror, token)
        } else {
            self.copy_swap_gc(mirror, token)
        }
    }

    /// In-place strategy: repack under the plain write lock, the same
    /// sequencing the teacher used for its single always-on `git gc`.
    fn in_place_gc(&self, mirror: &MirrorDir, token: &CancellationToken) -> Result<()> {
        let _write = self.mirror_dirs.write_lock(mirror)?;
        let opts = RepackOptionsBuilder::default()
            .extra_args(repack_args(self.config))
            .build()
            .map_err(|e| GitMirrorError::new(ErrorKind::Internal, e.to_string()))?;
        self.facade.repack(&mirror.path, &opts, token)?;
        self.facade.pack_refs_all(&mirror.path, token)?;
        Ok(())
    }

    /// Copy-swap strategy (spec §4.H.8): build a freshly repacked copy
    /// alongside the original while readers keep working against it, then
    /// swap the two directory names under the exclusive rm lock.
    fn copy_swap_gc(&self, mirror: &MirrorDir, token: &CancellationToken) -> Result<()> {
        let gc_dir = Utf8PathBuf::from(format!("{}.gc", mirror.path));
        let old_dir = Utf8PathBuf::from(format!("{}.old", mirror.path));

        // `defer!` moves its captures, so clean up via clones rather than
        // losing `gc_dir`/`old_dir` for the rest of this function.
        let cleanup_gc_dir = gc_dir.clone();
        let cleanup_old_dir = old_dir.clone();
        defer! {
            let _ = fs::remove_dir_all(cleanup_gc_dir.as_std_path());
            let _ = fs::remove_dir_all(cleanup_old_dir.as_std_path());
        }

        {
            let _rm_read = self.mirror_dirs.rm_read_lock(mirror)?;
            self.build_gc_copy(mirror, &gc_dir, token)?;
        }

        {
            let _rm_write = self.mirror_dirs.rm_write_lock(mirror)?;
            if old_dir.exists() {
                fs::remove_dir_all(old_dir.as_std_path()).ok();
            }
            rename_with_retry(&mirror.path, &old_dir)?;
            if let Err(e) = rename_with_retry(&gc_dir, &mirror.path) {
                // Best-effort restore so the mirror isn't left missing.
                let _ = fs::rename(old_dir.as_std_path(), mirror.path.as_std_path());
                return Err(e);
            }
        }

        Ok(())
    }

    fn build_gc_copy(&self, mirror: &MirrorDir, gc_dir: &Utf8Path, token: &CancellationToken) -> Result<()> {
        if gc_dir.exists() {
            fs::remove_dir_all(gc_dir.as_std_path()).ok();
        }
        self.facade.init_bare(gc_dir, token)?;

        let alternates_path = gc_dir.join("objects").join("info").join("alternates");
        fs::write(alternates_path.as_std_path(), format!("{}\n", mirror.path.join("objects")))
            .map_err(|e| GitMirrorError::with_source(ErrorKind::Internal, "writing gc alternates file", e))?;

        copy_file_if_present(&mirror.path.join("packed-refs"), &gc_dir.join("packed-refs"))?;
        copy_file_if_present(&mirror.path.join("config"), &gc_dir.join("config"))?;
        copy_dir_all(&mirror.path.join("refs"), &gc_dir.join("refs"))?;
        if mirror.monitoring_dir().is_dir() {
            copy_dir_all(&mirror.monitoring_dir(), &gc_dir.join("monitoring"))?;
        }
        copy_file_if_present(&mirror.timestamp_path(), &gc_dir.join("timestamp"))?;

        let opts = RepackOptionsBuilder::default()
            .extra_args(repack_args(self.config))
            .build()
            .map_err(|e| GitMirrorError::new(ErrorKind::Internal, e.to_string()))?;
        self.facade.repack(gc_dir, &opts, token)?;
        self.facade.pack_refs_all(gc_dir, token)?;

        // The copy must stand on its own before the swap -- otherwise the
        // alternates file would point at a directory about to be renamed
        // away.
        fs::remove_file(alternates_path.as_std_path()).ok();
        Ok(())
    }
}

fn repack_args(config: &MirrorPoolConfig) -> Vec<String> {
    let mut args = vec!["-a".to_string(), "-d".to_string()];
    args.extend(config.repack_args.iter().cloned());
    args
}

fn rename_with_retry(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        match fs::rename(from.as_std_path(), to.as_std_path()) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < 5 => {
                attempt += 1;
                log::debug!("rename {from} -> {to} failed (attempt {attempt}/5): {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(GitMirrorError::with_source(
                    ErrorKind::GcRenameFailed,
                    format!("renaming {from} to {to} after {attempt} retries"),
                    e,
                ))
            }
        }
    }
}

fn copy_file_if_present(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    match fs::copy(from.as_std_path(), to.as_std_path()) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GitMirrorError::with_source(ErrorKind::Internal, format!("copying {from} to {to}"), e)),
    }
}

fn copy_dir_all(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    fs::create_dir_all(to.as_std_path()).map_err(|e| GitMirrorError::with_source(ErrorKind::Internal, format!("creating {to}"), e))?;
    let Ok(entries) = fs::read_dir(from.as_std_path()) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        let dest = to.join(name);
        if path.is_dir() {
            let src = Utf8PathBuf::from_path_buf(path).unwrap_or_default();
            copy_dir_all(&src, &dest)?;
        } else {
            copy_file_if_present(&Utf8PathBuf::from_path_buf(path).unwrap_or_default(), &dest)?;
        }
    }
    Ok(())
}

fn dir_size(dir: &Utf8Path) -> u64 {
    fs::read_dir(dir.as_std_path())
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::GitFacade;
    use crate::process::Timeouts;
    use tempfile::tempdir;

    fn manager(dir: &Utf8Path) -> MirrorDirManager {
        let facade = GitFacade::new(Utf8PathBuf::from("git"), Timeouts::default());
        MirrorDirManager::new(dir.to_path_buf(), facade)
    }

    #[test]
    fn needs_gc_is_false_for_empty_mirror() {
        let dir = tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mgr = manager(&base);
        let facade = GitFacade::new(Utf8PathBuf::from("git"), Timeouts::default());
        let config = MirrorPoolConfig::default();
        let registry = ErrorRegistry::new();
        let compactor = Compactor::new(&mgr, &facade, &config, &registry);

        let token = CancellationToken::new();
        let url = crate::url::RepoUrl::parse("https://host/team/proj.git").unwrap();
        let mirror = mgr.resolve(&url, &token).unwrap();
        assert!(!compactor.needs_gc(&mirror.path));
    }

    #[test]
    fn second_concurrent_run_is_rejected() {
        assert!(GC_RUNNING.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok());
        let dir = tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mgr = manager(&base);
        let facade = GitFacade::new(Utf8PathBuf::from("git"), Timeouts::default());
        let config = MirrorPoolConfig::default();
        let registry = ErrorRegistry::new();
        let compactor = Compactor::new(&mgr, &facade, &config, &registry);

        let result = compactor.run(&CancellationToken::new());
        assert!(result.is_err());
        GC_RUNNING.store(false, Ordering::SeqCst);
    }

    #[test]
    fn rename_with_retry_succeeds_immediately_when_uncontended() {
        let dir = tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let from = base.join("a");
        let to = base.join("b");
        fs::create_dir(from.as_std_path()).unwrap();
        rename_with_retry(&from, &to).unwrap();
        assert!(to.is_dir());
    }
}
