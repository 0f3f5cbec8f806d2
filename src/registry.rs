//! Error/Progress Registry (component I): the compactor's memory of what
//! went wrong per mirror, plus a narrow progress-reporting seam.
//!
//! Grounded on the teacher's `eprintln!`-based progress lines in
//! `GitCacheCloner`, generalized into a trait so a caller (the admin CLI,
//! a future status endpoint) can swap in a structured sink; the default
//! still just logs, matching the teacher's own terseness.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{ErrorKindTag, GitMirrorError};

#[derive(Debug, Clone)]
pub struct GcErrorEntry {
    pub message: String,
    pub kind: ErrorKindTag,
    pub occurred_at_unix: u64,
}

impl GcErrorEntry {
    /// `occurred_at_unix` as an RFC 3339 timestamp, for display in the admin
    /// CLI's `status` output rather than a raw epoch count.
    pub fn occurred_at_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp(self.occurred_at_unix as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.occurred_at_unix.to_string())
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-mirror last-error memory, keyed by mirror hash, plus a single slot
/// for the most recent native-git execution failure observed by any
/// component (spec §4.I).
#[derive(Default)]
pub struct ErrorRegistry {
    errors: Mutex<HashMap<String, GcErrorEntry>>,
    last_native_git_error: Mutex<Option<String>>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_error(&self, mirror_hash: &str, err: &GitMirrorError) {
        let entry = GcErrorEntry {
            message: err.message.clone(),
            kind: err.kind.tag(),
            occurred_at_unix: now_unix(),
        };
        self.errors.lock().unwrap().insert(mirror_hash.to_string(), entry);
    }

    pub fn clear_error(&self, mirror_hash: &str) {
        self.errors.lock().unwrap().remove(mirror_hash);
    }

    pub fn error_for(&self, mirror_hash: &str) -> Option<GcErrorEntry> {
        self.errors.lock().unwrap().get(mirror_hash).cloned()
    }

    /// Drops entries for mirrors no longer present, so a recreated mirror
    /// with a reused hash doesn't inherit a stale error.
    pub fn retain_errors(&self, still_present: impl Fn(&str) -> bool) {
        self.errors.lock().unwrap().retain(|hash, _| still_present(hash));
    }

    pub fn record_native_git_error(&self, message: impl Into<String>) {
        *self.last_native_git_error.lock().unwrap() = Some(message.into());
    }

    pub fn last_native_git_error(&self) -> Option<String> {
        self.last_native_git_error.lock().unwrap().clone()
    }
}

/// Reports compactor progress without coupling it to a concrete transport
/// (log line, metrics counter, admin CLI...).
pub trait ProgressSink: Send + Sync {
    fn on_gc_start(&self, mirror_hash: &str) {
        let _ = mirror_hash;
    }
    fn on_gc_skip(&self, mirror_hash: &str, reason: &str) {
        let _ = (mirror_hash, reason);
    }
    fn on_gc_done(&self, mirror_hash: &str, duration: std::time::Duration) {
        let _ = (mirror_hash, duration);
    }
}

/// Default sink: every event becomes a log line at an appropriate level.
pub struct LoggingProgressSink;

impl ProgressSink for LoggingProgressSink {
    fn on_gc_start(&self, mirror_hash: &str) {
        log::debug!("gc: starting {mirror_hash}");
    }
    fn on_gc_skip(&self, mirror_hash: &str, reason: &str) {
        log::debug!("gc: skipping {mirror_hash}: {reason}");
    }
    fn on_gc_done(&self, mirror_hash: &str, duration: std::time::Duration) {
        log::info!("gc: compacted {mirror_hash} in {:.1}s", duration.as_secs_f64());
    }
}
