use std::path::Path;

use anyhow::{Context, Result};
use git2::Repository;
use tera::{Context as TeraContext, Tera};

use crate::verify::{current_branch, open_repository};

const CLUSTER_REPO_TEMPLATE: &str = include_str!("../templates/cluster_repo.yaml");

/// Where QA should point a Rancher `ClusterRepo` to install the current branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchHint {
    pub branch: String,
    pub repo_name: String,
    pub repo_url: String,
}

impl BranchHint {
    /// Resource name, lowercased and restricted to what Kubernetes accepts.
    pub(crate) fn resource_name(&self) -> String {
        let raw = format!("{}-{}", self.repo_name, self.branch);
        let name: String = raw
            .to_ascii_lowercase()
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '-' | '.' => c,
                _ => '-',
            })
            .collect();
        name.trim_matches(|c| c == '-' || c == '.').to_string()
    }
}

pub(crate) fn resolve_hint(path: &Path) -> Result<BranchHint> {
    let repo = open_repository(path)?;
    let branch = current_branch(&repo)?;
    let remote = select_remote(&repo, &branch)?;
    let raw_url = repo
        .find_remote(&remote)
        .with_context(|| format!("failed to read remote '{}'", remote))?
        .url()
        .map(str::to_string)
        .with_context(|| format!("remote '{}' has no usable URL", remote))?;

    let repo_url = to_browsable_url(&raw_url);
    let repo_name = if remote == "origin" {
        url_owner(&repo_url).unwrap_or(remote)
    } else {
        remote
    };
    tracing::debug!(
        "hint: branch={} repo_name={} url={}",
        branch,
        repo_name,
        repo_url
    );
    Ok(BranchHint {
        branch,
        repo_name,
        repo_url,
    })
}

/// Tracking remote of `branch`, else `origin`, else the first remote by name.
fn select_remote(repo: &Repository, branch: &str) -> Result<String> {
    let refname = format!("refs/heads/{}", branch);
    if let Ok(buf) = repo.branch_upstream_remote(&refname)
        && let Some(name) = buf.as_str()
    {
        return Ok(name.to_string());
    }
    tracing::debug!("hint: branch={} has no upstream, guessing remote", branch);

    let remotes = repo.remotes().context("failed to list remotes")?;
    let mut names: Vec<&str> = remotes.iter().flatten().collect();
    if names.contains(&"origin") {
        return Ok(String::from("origin"));
    }
    names.sort_unstable();
    names
        .first()
        .map(|name| name.to_string())
        .context("repository has no remotes to build a ClusterRepo from")
}

/// `git@host:owner/repo.git` becomes `https://host/owner/repo`; `.git` is always dropped.
pub(crate) fn to_browsable_url(url: &str) -> String {
    let url = url.trim();
    let url = match url.strip_prefix("git@").and_then(|rest| rest.split_once(':')) {
        Some((host, path)) => format!("https://{}/{}", host, path),
        None => url.to_string(),
    };
    let url = url.trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url).to_string()
}

fn url_owner(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let owner = rest.split('/').nth(1)?;
    (!owner.is_empty()).then(|| owner.to_string())
}

pub(crate) fn render_hint(hint: &BranchHint) -> Result<String> {
    let mut ctx = TeraContext::new();
    ctx.insert("name", &hint.resource_name());
    ctx.insert("branch", &hint.branch);
    ctx.insert("git_repo", &hint.repo_url);
    let yaml = Tera::one_off(CLUSTER_REPO_TEMPLATE, &ctx, false)
        .context("failed to render ClusterRepo template")?;
    Ok(format!("```yaml\n{}\n```", yaml.trim_end()))
}
