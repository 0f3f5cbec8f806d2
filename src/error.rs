//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the mirror pool returns [`GitMirrorError`],
//! whose [`ErrorKind`] lets callers distinguish "retry me" from "surface me"
//! without parsing messages.

use std::fmt;

/// Coarse classification of a failure, matching the taxonomy a caller
/// needs to branch on (retry, surface, or route to the error registry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection reset, DNS temp failure, auth handshake timeout: retried
    /// automatically by the fetch coordinator up to the configured budget.
    TransportRecoverable,
    /// Permission denied, invalid cert, unknown host after retries exhausted.
    TransportPermanent,
    /// Wrong passphrase or other permanent auth rejection; never retried.
    AuthWrongCredentials,
    /// A requested sha was still absent after a fetch.
    RevisionNotFound,
    /// `.gitmodules` blob missing at the given commit.
    SubmoduleMissingConfig {
        main_repo_url: String,
        main_commit: String,
        submodule_path: String,
    },
    /// `.gitmodules` present but has no entry for the path.
    SubmoduleMissingEntry {
        main_repo_url: String,
        main_commit: String,
        submodule_path: String,
    },
    /// Submodule pointer commit absent even after fetching the sub-mirror.
    SubmoduleMissingCommit {
        main_repo_url: String,
        main_commit: String,
        submodule_path: String,
        submodule_url: String,
        submodule_commit: String,
    },
    /// Free space below the size of `objects/pack`.
    GcDiskFull,
    /// The gc subprocess (native or library fallback) failed.
    GcProcessFailed,
    /// Copy-swap rename sequence could not complete even after retries.
    GcRenameFailed,
    /// `pathToGit` missing, or the detected version is below the minimum.
    NativeGitUnavailable,
    /// A `Context`'s interruption reason was set mid-operation.
    OperationCancelled,
    /// Unclassified.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TransportRecoverable => write!(f, "transport error (recoverable)"),
            ErrorKind::TransportPermanent => write!(f, "transport error (permanent)"),
            ErrorKind::AuthWrongCredentials => write!(f, "authentication rejected"),
            ErrorKind::RevisionNotFound => write!(f, "revision not found"),
            ErrorKind::SubmoduleMissingConfig {
                main_repo_url,
                main_commit,
                submodule_path,
            } => write!(
                f,
                ".gitmodules missing at {main_repo_url}@{main_commit} (wanted {submodule_path})"
            ),
            ErrorKind::SubmoduleMissingEntry {
                main_repo_url,
                main_commit,
                submodule_path,
            } => write!(
                f,
                "no .gitmodules entry for {submodule_path} at {main_repo_url}@{main_commit}"
            ),
            ErrorKind::SubmoduleMissingCommit {
                main_repo_url,
                main_commit,
                submodule_path,
                submodule_url,
                submodule_commit,
            } => write!(
                f,
                "submodule {submodule_path} ({submodule_url}) missing commit {submodule_commit}, \
                 referenced from {main_repo_url}@{main_commit}"
            ),
            ErrorKind::GcDiskFull => write!(f, "insufficient disk space for gc"),
            ErrorKind::GcProcessFailed => write!(f, "gc process failed"),
            ErrorKind::GcRenameFailed => write!(f, "gc copy-swap rename failed"),
            ErrorKind::NativeGitUnavailable => write!(f, "native git unavailable or too old"),
            ErrorKind::OperationCancelled => write!(f, "operation cancelled"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

/// The crate's single error type: a classified kind, a human message, and
/// an optional chained cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GitMirrorError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl GitMirrorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::OperationCancelled, "interrupted")
    }

    /// Wraps this error with the identity of the enclosing VCS root, as
    /// required of the Change Collector by spec §7 ("wraps *all* exceptions
    /// with the enclosing operation context before re-throwing").
    pub fn wrap_with_root(self, root_url: &str) -> Self {
        Self {
            kind: self.kind.clone(),
            message: format!("[{root_url}] {}", self.message),
            source: self.source,
        }
    }
}

/// Lightweight copy of [`ErrorKind`]'s discriminant, used where the full
/// payload isn't needed (e.g. dispatch tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKindTag {
    TransportRecoverable,
    TransportPermanent,
    AuthWrongCredentials,
    RevisionNotFound,
    SubmoduleMissingConfig,
    SubmoduleMissingEntry,
    SubmoduleMissingCommit,
    GcDiskFull,
    GcProcessFailed,
    GcRenameFailed,
    NativeGitUnavailable,
    OperationCancelled,
    Internal,
}

impl ErrorKind {
    pub fn tag(&self) -> ErrorKindTag {
        match self {
            ErrorKind::TransportRecoverable => ErrorKindTag::TransportRecoverable,
            ErrorKind::TransportPermanent => ErrorKindTag::TransportPermanent,
            ErrorKind::AuthWrongCredentials => ErrorKindTag::AuthWrongCredentials,
            ErrorKind::RevisionNotFound => ErrorKindTag::RevisionNotFound,
            ErrorKind::SubmoduleMissingConfig { .. } => ErrorKindTag::SubmoduleMissingConfig,
            ErrorKind::SubmoduleMissingEntry { .. } => ErrorKindTag::SubmoduleMissingEntry,
            ErrorKind::SubmoduleMissingCommit { .. } => ErrorKindTag::SubmoduleMissingCommit,
            ErrorKind::GcDiskFull => ErrorKindTag::GcDiskFull,
            ErrorKind::GcProcessFailed => ErrorKindTag::GcProcessFailed,
            ErrorKind::GcRenameFailed => ErrorKindTag::GcRenameFailed,
            ErrorKind::NativeGitUnavailable => ErrorKindTag::NativeGitUnavailable,
            ErrorKind::OperationCancelled => ErrorKindTag::OperationCancelled,
            ErrorKind::Internal => ErrorKindTag::Internal,
        }
    }
}

/// Is this error eligible for the Fetch Coordinator's automatic retry?
/// A pure function of the error, per spec §4.D.
pub fn is_recoverable(err: &GitMirrorError) -> bool {
    matches!(err.kind, ErrorKind::TransportRecoverable)
}

pub type Result<T> = std::result::Result<T, GitMirrorError>;
