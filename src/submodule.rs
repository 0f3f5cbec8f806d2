//! Submodule Resolver (component F): maps `(parent commit, path)` to a
//! child mirror, fetching the pointer commit if it's missing.
//!
//! Grounded directly on the teacher's `GitRepo::get_submodules` (parsing
//! `.gitmodules` via `gix_config::File`) and `clone_submodule`/recursion
//! through `cache.cloner()`; generalized so each submodule URL gets its own
//! mirror via the Mirror Directory Manager (breaking cycles) instead of a
//! nested on-disk clone, and relative URLs resolve against
//! `teamcity.remote` rather than the parent's literal origin.

use std::collections::BTreeMap;

use gix_config::file::init::Options;
use gix_config::file::Metadata;
use gix_config::File as GixConfigFile;

use crate::cancellation::CancellationToken;
use crate::error::{ErrorKind, GitMirrorError, Result};
use crate::facade::GitFacade;
use crate::fetch::{EnsurePresentOptions, FetchCoordinator, StateSnapshot};
use crate::mirror_dir::{MirrorDir, MirrorDirManager};
use crate::url::RepoUrl;

/// One `path -> (remoteUrl, branch?)` entry parsed from a `.gitmodules`
/// blob (spec §3 "Submodule Config").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleEntry {
    pub path: String,
    pub url: String,
    pub branch: Option<String>,
}

/// Parses the `.gitmodules` blob content into `path -> entry`.
pub fn parse_gitmodules(blob: &[u8]) -> Result<BTreeMap<String, SubmoduleEntry>> {
    let config = GixConfigFile::from_bytes_no_includes(blob, Metadata::api(), Options::default())
        .map_err(|e| GitMirrorError::with_source(ErrorKind::Internal, "parsing .gitmodules", e))?;

    let mut entries = BTreeMap::new();
    let Some(sections) = config.sections_by_name("submodule") else {
        return Ok(entries);
    };
    for section in sections {
        let Some(path) = section.body().value("path") else {
            continue;
        };
        let Some(url) = section.body().value("url") else {
            continue;
        };
        let branch = section.body().value("branch").map(|b| b.to_string());
        let path = path.into_owned().to_string();
        entries.insert(
            path.clone(),
            SubmoduleEntry {
                path,
                url: url.into_owned().to_string(),
                branch,
            },
        );
    }
    Ok(entries)
}

/// Resolves a possibly-relative submodule URL against the superproject's
/// canonical remote, following git's own algorithm (not RFC 3986 URL
/// resolution): each leading `../` strips one trailing path component from
/// the superproject URL (including the superproject's own repo name)
/// before the remainder of the submodule URL is appended. See DESIGN.md
/// for why `url::Url::join` does not reproduce this.
pub fn resolve_relative_url(superproject_canonical: &str, submodule_url: &str) -> String {
    if !submodule_url.starts_with('.') {
        return submodule_url.to_string();
    }

    let mut base = superproject_canonical.trim_end_matches('/').to_string();
    let mut rest = submodule_url;

    loop {
        if let Some(stripped) = rest.strip_prefix("../") {
            if let Some(idx) = base.rfind('/') {
                base.truncate(idx);
            }
            rest = stripped;
        } else if rest == ".." {
            if let Some(idx) = base.rfind('/') {
                base.truncate(idx);
            }
            rest = "";
            break;
        } else if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else {
            break;
        }
    }

    if rest.is_empty() {
        base
    } else {
        format!("{base}/{rest}")
    }
}

/// `getSubmoduleCommit` (spec §4.F): locates/fetches the sub-mirror and
/// returns its local commit sha for a submodule pointer.
pub struct SubmoduleResolver<'a> {
    mirror_dirs: &'a MirrorDirManager,
    facade: &'a GitFacade,
    fetch: &'a FetchCoordinator<'a>,
}

impl<'a> SubmoduleResolver<'a> {
    pub fn new(mirror_dirs: &'a MirrorDirManager, facade: &'a GitFacade, fetch: &'a FetchCoordinator<'a>) -> Self {
        Self {
            mirror_dirs,
            facade,
            fetch,
        }
    }

    /// Resolves `(parentCommit, pathInParent, pointerSha)` to the
    /// submodule's own commit sha, fetching the sub-mirror if the pointer
    /// commit is missing.
    pub fn get_submodule_commit(
        &self,
        parent_mirror: &MirrorDir,
        parent_commit: &str,
        path_in_parent: &str,
        pointer_sha: &str,
        token: &CancellationToken,
    ) -> Result<(MirrorDir, String)> {
        let blob = self
            .facade
            .show_blob(&parent_mirror.path, &format!("{parent_commit}:.gitmodules"), token)
            .map_err(|_| {
                GitMirrorError::new(
                    ErrorKind::SubmoduleMissingConfig {
                        main_repo_url: parent_mirror.canonical_url.clone(),
                        main_commit: parent_commit.to_string(),
                        submodule_path: path_in_parent.to_string(),
                    },
                    "no .gitmodules blob at this commit",
                )
            })?;

        let entries = parse_gitmodules(&blob)?;
        let entry = entries.get(path_in_parent).ok_or_else(|| {
            GitMirrorError::new(
                ErrorKind::SubmoduleMissingEntry {
                    main_repo_url: parent_mirror.canonical_url.clone(),
                    main_commit: parent_commit.to_string(),
                    submodule_path: path_in_parent.to_string(),
                },
                "no .gitmodules entry for this path",
            )
        })?;

        let resolved_url = resolve_relative_url(&parent_mirror.canonical_url, &entry.url);
        let sub_repo_url = RepoUrl::parse(&resolved_url)?;
        let sub_mirror = self.mirror_dirs.resolve(&sub_repo_url, token)?;

        // A submodule pointer commit isn't necessarily any branch's current
        // tip, so there's no single ref name to request it by; fetch every
        // branch the sub-mirror's remote has and let `ensure_present`'s
        // post-fetch `rev_parse` confirm the pointer landed.
        let mut refs = BTreeMap::new();
        refs.insert("refs/heads/*".to_string(), pointer_sha.to_string());
        let snapshot = StateSnapshot::new(refs);

        let ensure_result = self.fetch.ensure_present(
            &sub_mirror,
            &snapshot,
            &EnsurePresentOptions {
                throw_if_missing_after_fetch: true,
            },
            token,
        );

        if ensure_result.is_err() {
            return Err(GitMirrorError::new(
                ErrorKind::SubmoduleMissingCommit {
                    main_repo_url: parent_mirror.canonical_url.clone(),
                    main_commit: parent_commit.to_string(),
                    submodule_path: path_in_parent.to_string(),
                    submodule_url: resolved_url,
                    submodule_commit: pointer_sha.to_string(),
                },
                "submodule commit missing even after fetch",
            ));
        }

        Ok((sub_mirror, pointer_sha.to_string()))
    }

    /// Returns a child resolver scoped to `sub_mirror`, so nested
    /// submodules recurse through the same machinery (spec §4.F
    /// "nesting is handled by recursion").
    pub fn scoped(&self) -> SubmoduleResolver<'a> {
        SubmoduleResolver {
            mirror_dirs: self.mirror_dirs,
            facade: self.facade,
            fetch: self.fetch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_url_with_single_dotdot_strips_own_repo_name() {
        assert_eq!(
            resolve_relative_url("https://host/team/proj.git", "../sibling.git"),
            "https://host/team/sibling.git"
        );
    }

    #[test]
    fn relative_url_with_two_dotdot_strips_two_components() {
        assert_eq!(
            resolve_relative_url("https://host/team/sub/proj.git", "../../sibling.git"),
            "https://host/team/sibling.git"
        );
    }

    #[test]
    fn absolute_submodule_url_is_unchanged() {
        assert_eq!(
            resolve_relative_url("https://host/team/proj.git", "https://other/x.git"),
            "https://other/x.git"
        );
    }

    #[test]
    fn parse_gitmodules_reads_path_url_and_branch() {
        let blob = br#"
[submodule "libs/foo"]
	path = libs/foo
	url = ../foo.git
	branch = main
"#;
        let entries = parse_gitmodules(blob).unwrap();
        let foo = entries.get("libs/foo").unwrap();
        assert_eq!(foo.url, "../foo.git");
        assert_eq!(foo.branch.as_deref(), Some("main"));
    }

    #[test]
    fn parse_gitmodules_skips_entries_missing_url() {
        let blob = br#"
[submodule "broken"]
	path = broken
"#;
        let entries = parse_gitmodules(blob).unwrap();
        assert!(entries.is_empty());
    }
}
