use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use git2::{ErrorCode, Oid, Repository, Sort};
use regex::Regex;
use tokio::process::Command;

use crate::config::VerifyConfig;
use crate::process;

use super::SetupError;
use super::types::CheckResult;

/// Name of the temporary remote this tool owns while a run is in flight.
pub(crate) const TOOL_REMOTE: &str = "_chartgate-upstream";

const UPSTREAM_BRANCHES: [&str; 2] = ["main", "master"];

static GITHUB_SSH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^git@github\.com:(?P<path>.+?)(?:\.git)?/?$").unwrap());
static GITHUB_HTTPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://github\.com/(?P<path>.+?)(?:\.git)?/?$").unwrap());

/// Git state a verification run compares against.
#[derive(Debug, Clone)]
pub(crate) struct GitRefs {
    pub head_ref: String,
    pub head_commit: Oid,
    pub upstream_ref: String,
    pub upstream_commit: Oid,
    pub merge_base: Oid,
}

/// `owner/repo` for a GitHub SSH or HTTPS URL, `.git` suffix removed.
pub(crate) fn github_repo_path(url: &str) -> Option<String> {
    let url = url.trim();
    GITHUB_SSH
        .captures(url)
        .or_else(|| GITHUB_HTTPS.captures(url))
        .map(|c| c["path"].to_string())
}

/// Canonical `https://github.com/<owner>/<repo>.git` form; non-GitHub URLs pass through.
pub(crate) fn normalize_github_url(url: &str) -> String {
    match github_repo_path(url) {
        Some(path) => format!("https://github.com/{}.git", path),
        None => url.trim().to_string(),
    }
}

pub(crate) fn is_github_repo_url(url: &str, identity: &str) -> bool {
    github_repo_path(url)
        .map(|path| path.eq_ignore_ascii_case(identity.trim_matches('/')))
        .unwrap_or(false)
}

/// First configured remote (by name) whose URL points at `identity`.
pub(crate) fn find_canonical_remote(repo: &Repository, identity: &str) -> Option<String> {
    let remotes = repo.remotes().ok()?;
    // A leftover tool remote from an interrupted run is not the user's upstream.
    let mut names: Vec<&str> = remotes
        .iter()
        .flatten()
        .filter(|name| *name != TOOL_REMOTE)
        .collect();
    names.sort_unstable();
    names.into_iter().find_map(|name| {
        let remote = repo.find_remote(name).ok()?;
        let matches = remote
            .url()
            .into_iter()
            .chain(remote.pushurl())
            .any(|url| is_github_repo_url(url, identity));
        matches.then(|| name.to_string())
    })
}

pub(crate) fn check_upstream_remote(repo: &Repository, identity: &str) -> CheckResult {
    const NAME: &str = "Upstream Repository";
    match find_canonical_remote(repo, identity) {
        Some(remote) => {
            tracing::debug!("upstream: existing canonical remote={}", remote);
            CheckResult::pass(
                NAME,
                false,
                format!("Found canonical upstream in remote '{}'", remote),
            )
        }
        None => CheckResult::fail(
            NAME,
            false,
            format!(
                "No remote points to canonical upstream ({}); a temporary remote is used instead",
                identity
            ),
        ),
    }
}

/// Scoped ownership of [`TOOL_REMOTE`]: the remote is deleted when this drops.
pub(crate) struct ToolRemote {
    repo: Repository,
    root: PathBuf,
    name: String,
    url: String,
}

impl ToolRemote {
    pub(crate) fn acquire(root: &Path, url: &str) -> Result<Self, SetupError> {
        let repo = Repository::open(root)?;
        let url = normalize_github_url(url);
        let existing = match repo.find_remote(TOOL_REMOTE) {
            Ok(remote) => Some(remote.url().map(str::to_string)),
            Err(err) if err.code() == ErrorCode::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if existing.is_none() {
            tracing::debug!("upstream: creating remote={} url={}", TOOL_REMOTE, url);
            repo.remote(TOOL_REMOTE, &url)?;
        }

        let guard = Self {
            repo,
            root: root.to_path_buf(),
            name: TOOL_REMOTE.to_string(),
            url,
        };
        if let Some(previous) = existing
            && previous.as_deref() != Some(guard.url.as_str())
        {
            tracing::debug!("upstream: repointing leftover remote={}", guard.name);
            guard.repo.remote_set_url(&guard.name, &guard.url)?;
        }
        Ok(guard)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Fetch the remote's branches, killing `git` once `timeout` elapses.
    pub(crate) async fn fetch(&self, timeout: Duration) -> Result<(), SetupError> {
        tracing::info!("upstream: fetching remote={} url={}", self.name, self.url);
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.root)
            .args(["fetch", "--quiet", "--no-tags", "--prune"])
            .arg(&self.name)
            .env("GIT_TERMINAL_PROMPT", "0");
        let output = process::run_captured(cmd, Some(timeout))
            .await
            .map_err(|err| match err {
                process::ProcessError::TimedOut { after, .. } => SetupError::FetchTimedOut {
                    url: self.url.clone(),
                    secs: after.as_secs(),
                },
                other => SetupError::Fetch {
                    url: self.url.clone(),
                    output: other.to_string(),
                },
            })?;
        if !output.success() {
            return Err(SetupError::Fetch {
                url: self.url.clone(),
                output: output.combined(),
            });
        }
        Ok(())
    }

    /// `refs/remotes/<remote>/main`, else `.../master`.
    pub(crate) fn upstream_branch(&self) -> Result<(String, Oid), SetupError> {
        for branch in UPSTREAM_BRANCHES {
            let refname = format!("refs/remotes/{}/{}", self.name, branch);
            match self.repo.refname_to_id(&refname) {
                Ok(oid) => {
                    tracing::debug!("upstream: using ref={}", refname);
                    return Ok((refname, oid));
                }
                Err(err) if err.code() == ErrorCode::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(SetupError::UpstreamBranchNotFound {
            remote: self.name.clone(),
        })
    }
}

impl Drop for ToolRemote {
    fn drop(&mut self) {
        match self.repo.remote_delete(&self.name) {
            Ok(()) => tracing::debug!("upstream: removed remote={}", self.name),
            Err(err) => tracing::warn!("upstream: failed to remove remote={}: {}", self.name, err),
        }
    }
}

/// Resolve HEAD, the freshly fetched upstream tip, and their merge-base.
///
/// The tool-owned remote only lives for the duration of this call.
pub(crate) async fn resolve_git_refs(
    repo: &Repository,
    root: &Path,
    cfg: &VerifyConfig,
) -> Result<GitRefs, SetupError> {
    let head = repo.head()?;
    let head_ref = head
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| String::from("HEAD"));
    let head_commit = head.peel_to_commit()?.id();

    let remote = ToolRemote::acquire(root, &cfg.upstream_url())?;
    remote.fetch(cfg.fetch_timeout()).await?;
    let (upstream_ref, upstream_commit) = remote.upstream_branch()?;
    let merge_base = merge_base(repo, head_commit, upstream_commit)?;
    tracing::info!(
        "upstream: resolved head={} upstream={} merge_base={} via={}",
        short(head_commit),
        short(upstream_commit),
        short(merge_base),
        remote.name()
    );

    Ok(GitRefs {
        head_ref,
        head_commit,
        upstream_ref,
        upstream_commit,
        merge_base,
    })
}

fn merge_base(repo: &Repository, head: Oid, upstream: Oid) -> Result<Oid, SetupError> {
    match repo.merge_base(head, upstream) {
        Ok(oid) => Ok(oid),
        Err(err) if err.code() == ErrorCode::NotFound => Err(SetupError::NoCommonAncestor),
        Err(err) => Err(err.into()),
    }
}

/// Commits on the upstream branch walked from its tip before reaching `merge_base`.
pub(crate) fn count_commits_behind(repo: &Repository, upstream: Oid, merge_base: Oid) -> usize {
    let walk = repo.revwalk().and_then(|mut walk| {
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        walk.push(upstream)?;
        Ok(walk)
    });
    let Ok(walk) = walk else {
        return 0;
    };

    let mut behind = 0;
    for oid in walk {
        match oid {
            Ok(oid) if oid == merge_base => break,
            Ok(_) => behind += 1,
            Err(_) => break,
        }
    }
    behind
}

/// `upstream/<branch>` for display, taken from the resolved remote-tracking ref.
fn upstream_label(refs: &GitRefs) -> String {
    let branch = refs
        .upstream_ref
        .rsplit_once('/')
        .map(|(_, branch)| branch)
        .unwrap_or(refs.upstream_ref.as_str());
    format!("upstream/{}", branch)
}

pub(crate) fn check_branch_current(repo: &Repository, refs: &GitRefs) -> CheckResult {
    const NAME: &str = "Branch Current with Upstream";
    let upstream = upstream_label(refs);
    if refs.merge_base == refs.upstream_commit {
        return CheckResult::pass(
            NAME,
            false,
            format!("Branch is up-to-date with {}", upstream),
        );
    }

    let behind = count_commits_behind(repo, refs.upstream_commit, refs.merge_base);
    let message = if behind > 0 {
        format!(
            "Branch is {} commit(s) behind {} - consider rebasing to ensure version checks are accurate",
            behind, upstream
        )
    } else {
        format!(
            "Branch is behind {} - consider rebasing to ensure version checks are accurate",
            upstream
        )
    };
    CheckResult::fail(NAME, false, message)
}

fn short(oid: Oid) -> String {
    oid.to_string()[..7].to_string()
}
