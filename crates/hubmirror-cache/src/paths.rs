//! Cache directory layout.
//!
//! Every persisted artifact's path is a pure function of the repository
//! coordinate — no hashing, so no collisions across coordinates. Path
//! components are sanitized before joining: `..` is stripped, `\` becomes
//! `/`, repeated slashes collapse.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoType {
    Models,
    Datasets,
    Spaces,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Models => "models",
            RepoType::Datasets => "datasets",
            RepoType::Spaces => "spaces",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRepoType(pub String);

impl std::fmt::Display for InvalidRepoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown repository type: {}", self.0)
    }
}

impl std::error::Error for InvalidRepoType {}

impl std::str::FromStr for RepoType {
    type Err = InvalidRepoType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "models" => Ok(RepoType::Models),
            "datasets" => Ok(RepoType::Datasets),
            "spaces" => Ok(RepoType::Spaces),
            other => Err(InvalidRepoType(other.to_string())),
        }
    }
}

impl std::fmt::Display for RepoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(repo_type, org, repo)` triple naming a repository. `org` is
/// absent for single-segment repository names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoCoord {
    pub repo_type: RepoType,
    pub org: Option<String>,
    pub repo: String,
}

impl RepoCoord {
    pub fn new(repo_type: RepoType, org: Option<String>, repo: String) -> Self {
        Self {
            repo_type,
            org,
            repo,
        }
    }

    /// `org/repo`, or the bare repo name when there is no org.
    pub fn org_repo(&self) -> String {
        match &self.org {
            Some(org) => format!("{org}/{}", self.repo),
            None => self.repo.clone(),
        }
    }

    /// Splits an `org/repo` pair; more than one `/` is rejected.
    pub fn parse_org_repo(org_repo: &str) -> Option<(Option<String>, String)> {
        let mut parts = org_repo.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(repo), None, _) => Some((None, repo.to_string())),
            (Some(org), Some(repo), None) => Some((Some(org.to_string()), repo.to_string())),
            _ => None,
        }
    }
}

/// Sanitizes one path component (which may itself contain `/` separators,
/// e.g. a file path inside a repository).
pub fn clean_path_component(component: &str) -> String {
    let mut out = component.replace('\\', "/");
    while out.contains("..") {
        out = out.replace("..", "");
    }
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out.trim_start_matches('/').to_string()
}

/// Creates the parent directories of `path`.
pub fn make_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Maps repository coordinates to on-disk cache paths under one root.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, top: &str, coord: &RepoCoord) -> PathBuf {
        let mut path = self.root.join(top).join(coord.repo_type.as_str());
        if let Some(org) = &coord.org {
            path.push(clean_path_component(org));
        }
        path.push(clean_path_component(&coord.repo));
        path
    }

    /// Envelope for a prior `HEAD` of a resolved file.
    pub fn head_path(&self, coord: &RepoCoord, commit: &str, file_path: &str) -> PathBuf {
        self.repo_dir("heads", coord)
            .join("resolve")
            .join(clean_path_component(commit))
            .join(clean_path_component(file_path))
    }

    /// Block container for a resolved file.
    pub fn file_path(&self, coord: &RepoCoord, commit: &str, file_path: &str) -> PathBuf {
        self.repo_dir("files", coord)
            .join("resolve")
            .join(clean_path_component(commit))
            .join(clean_path_component(file_path))
    }

    /// Envelope for a CDN-form fetch, keyed by content hash.
    pub fn cdn_head_path(&self, coord: &RepoCoord, file_hash: &str) -> PathBuf {
        self.repo_dir("heads", coord)
            .join("cdn")
            .join(clean_path_component(file_hash))
    }

    /// Block container for a CDN-form fetch.
    pub fn cdn_file_path(&self, coord: &RepoCoord, file_hash: &str) -> PathBuf {
        self.repo_dir("files", coord)
            .join("cdn")
            .join(clean_path_component(file_hash))
    }

    /// Envelope for an LFS blob `HEAD`.
    pub fn lfs_head_path(&self, d1: &str, d2: &str, hash_repo: &str, hash_file: &str) -> PathBuf {
        self.lfs_path("heads", d1, d2, hash_repo, hash_file)
    }

    /// Block container for an LFS blob.
    pub fn lfs_file_path(&self, d1: &str, d2: &str, hash_repo: &str, hash_file: &str) -> PathBuf {
        self.lfs_path("files", d1, d2, hash_repo, hash_file)
    }

    fn lfs_path(&self, kind: &str, d1: &str, d2: &str, hash_repo: &str, hash_file: &str) -> PathBuf {
        self.root
            .join("lfs")
            .join(kind)
            .join(clean_path_component(d1))
            .join(clean_path_component(d2))
            .join(clean_path_component(hash_repo))
            .join(clean_path_component(hash_file))
    }

    /// Directory holding per-revision metadata envelopes.
    pub fn revision_dir(&self, coord: &RepoCoord) -> PathBuf {
        self.repo_dir("api", coord).join("revision")
    }

    /// Metadata envelope for one revision, keyed by request method.
    pub fn meta_path(&self, coord: &RepoCoord, commit: &str, method: &str) -> PathBuf {
        self.revision_dir(coord)
            .join(clean_path_component(commit))
            .join(format!("meta_{}.json", method.to_ascii_lowercase()))
    }

    /// Tree-listing envelope, keyed by method and the two listing flags.
    pub fn tree_path(
        &self,
        coord: &RepoCoord,
        commit: &str,
        path: &str,
        method: &str,
        recursive: bool,
        expand: bool,
    ) -> PathBuf {
        let mut dir = self
            .repo_dir("api", coord)
            .join("tree")
            .join(clean_path_component(commit));
        let path = clean_path_component(path);
        if !path.is_empty() {
            dir.push(path);
        }
        dir.join(format!(
            "tree_{}_recursive_{}_expand_{}.json",
            method.to_ascii_lowercase(),
            recursive,
            expand
        ))
    }

    /// Paths-info envelope for one queried path.
    pub fn paths_info_path(
        &self,
        coord: &RepoCoord,
        commit: &str,
        path: &str,
        method: &str,
    ) -> PathBuf {
        let mut dir = self
            .repo_dir("api", coord)
            .join("paths-info")
            .join(clean_path_component(commit));
        let path = clean_path_component(path);
        if !path.is_empty() {
            dir.push(path);
        }
        dir.join(format!(
            "paths-info_{}.json",
            method.to_ascii_lowercase()
        ))
    }

    /// Commit-history envelope.
    pub fn commits_path(&self, coord: &RepoCoord, commit: &str, method: &str) -> PathBuf {
        self.repo_dir("api", coord)
            .join("commits")
            .join(clean_path_component(commit))
            .join(format!("commits_{}.json", method.to_ascii_lowercase()))
    }
}
