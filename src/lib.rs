//! A server-side pool of bare git mirrors for a CI server: one canonical,
//! deduplicated on-disk clone per remote URL, kept up to date on demand
//! and compacted in the background.
//!
//! The crate is organized as the pipeline a CI build check actually
//! drives: [`url`] canonicalizes what the caller asked for, [`mirror_dir`]
//! maps that to a stable on-disk mirror and its locks, [`fetch`] makes
//! sure the commits a caller needs are present, [`changes`] and [`walker`]
//! answer questions about history, [`submodule`] follows pointers into
//! other mirrors, and [`gc`] keeps the pool's disk footprint bounded.

pub mod cancellation;
pub mod changes;
pub mod config;
pub mod error;
pub mod facade;
pub mod fetch;
pub mod gc;
pub mod mirror_dir;
pub mod process;
pub mod registry;
pub mod submodule;
pub mod url;
pub mod walker;

pub use cancellation::CancellationToken;
pub use changes::{ChangeCollector, ChangeKind, CheckoutRules, FileChange, ModificationRecord};
pub use config::MirrorPoolConfig;
pub use error::{ErrorKind, GitMirrorError, Result};
pub use facade::GitFacade;
pub use fetch::{EnsurePresentOptions, FetchCoordinator, StateSnapshot};
pub use gc::{Compactor, GcSummary};
pub use mirror_dir::{MirrorDir, MirrorDirManager};
pub use process::{ProcessRunner, Timeouts};
pub use registry::{ErrorRegistry, ProgressSink};
pub use submodule::{SubmoduleEntry, SubmoduleResolver};
pub use url::RepoUrl;
pub use walker::{CheckoutRulesWalker, WalkResult};

/// Everything one caller needs to drive the pool: constructed once per
/// process and handed to each request.
pub struct MirrorPool {
    pub mirror_dirs: MirrorDirManager,
    pub facade: GitFacade,
    pub config: MirrorPoolConfig,
    pub registry: std::sync::Arc<ErrorRegistry>,
}

impl MirrorPool {
    pub fn new(config: MirrorPoolConfig) -> Self {
        let git_executable = config
            .path_to_git
            .clone()
            .unwrap_or_else(|| camino::Utf8PathBuf::from("git"));
        let timeouts = Timeouts {
            idle_seconds: config.repack_idle_timeout_seconds,
            total_seconds: config.repack_idle_timeout_seconds.saturating_mul(4),
        };
        let registry = std::sync::Arc::new(ErrorRegistry::new());
        // `MirrorDirManager` needs its own `GitFacade` for `init_bare`/
        // `config_set` during mirror creation; both handles are cheap,
        // stateless wrappers around the same executable and timeouts, and
        // both share the pool's error registry so a failure surfaced via
        // either path still shows up in `status`.
        let facade = GitFacade::new(git_executable.clone(), timeouts).with_error_registry(registry.clone());
        let mirror_dirs = MirrorDirManager::new(
            config.base_dir.clone(),
            GitFacade::new(git_executable, timeouts).with_error_registry(registry.clone()),
        );
        Self {
            mirror_dirs,
            facade,
            config,
            registry,
        }
    }

    pub fn resolve(&self, url: &RepoUrl, token: &CancellationToken) -> Result<MirrorDir> {
        self.mirror_dirs.resolve(url, token)
    }

    pub fn fetch_coordinator(&self) -> FetchCoordinator<'_> {
        FetchCoordinator::new(&self.mirror_dirs, &self.facade, &self.config)
    }

    pub fn submodule_resolver<'a>(&'a self, fetch: &'a FetchCoordinator<'a>) -> SubmoduleResolver<'a> {
        SubmoduleResolver::new(&self.mirror_dirs, &self.facade, fetch)
    }

    pub fn change_collector<'a>(&'a self, fetch: &'a FetchCoordinator<'a>) -> ChangeCollector<'a> {
        ChangeCollector::new(&self.mirror_dirs, &self.facade, fetch)
    }

    pub fn walker(&self) -> CheckoutRulesWalker<'_> {
        CheckoutRulesWalker::new(&self.facade)
    }

    pub fn compactor(&self) -> Compactor<'_> {
        Compactor::new(&self.mirror_dirs, &self.facade, &self.config, &self.registry)
    }
}
