mod build;
mod packages;
mod probe;
mod report;
pub(crate) mod sequence;
mod types;
mod upstream;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

use crate::config::{self, VerifyConfig};

use self::report::Progress;
use self::sequence::{ManifestLayouts, PackageVersionInfo};
use self::types::{CheckResult, PackageInfo, VerificationResult};

pub(crate) use self::probe::{current_branch, open_repository};

/// Failures that abort a run before a report can be produced.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{} is not a git repository: {source}", .path.display())]
    NotARepository {
        path: PathBuf,
        source: git2::Error,
    },
    #[error("current HEAD is not on a branch")]
    NotABranch,
    #[error("could not find main/master branch on upstream remote '{remote}'")]
    UpstreamBranchNotFound { remote: String },
    #[error("no common ancestor found between branch and upstream/main")]
    NoCommonAncestor,
    #[error("failed to fetch from upstream {url}: {output}")]
    Fetch { url: String, output: String },
    #[error("fetching {url} timed out after {secs}s")]
    FetchTimedOut { url: String, secs: u64 },
    #[error(transparent)]
    Git(#[from] git2::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct VerifyOptions {
    pub repo_path: PathBuf,
    pub json_output: bool,
    pub report_path: Option<PathBuf>,
}

/// Verify the branch checked out at `opts.repo_path` and render the report.
///
/// Stages run strictly in order: global checks, per-package version checks,
/// the clean-before-build gate, then one build per package. Check failures end
/// up in the returned report; only setup failures are returned as `Err`.
pub(crate) async fn run_verify(opts: &VerifyOptions) -> Result<VerificationResult> {
    let progress = Progress::new(opts.json_output);
    let mut result = VerificationResult::new();

    progress.stage(&format!("Verifying {}", opts.repo_path.display()));
    let repo_check = probe::check_is_git_repo(&opts.repo_path);
    if !repo_check.passed() {
        let err = probe::open_repository(&opts.repo_path)
            .err()
            .context("repository probe disagreed with open")?;
        return Err(err.into());
    }
    record_global(&mut result, &progress, repo_check);

    let repo = probe::open_repository(&opts.repo_path)?;
    let root = repo
        .workdir()
        .context("bare repositories cannot be verified")?
        .to_path_buf();
    let cfg = config::load_config(&root).await?;
    let overrides = cfg.branch_controlled_overrides();
    if !overrides.is_empty() {
        tracing::warn!(
            "config: {} set by the branch in {} differ from the canonical setup",
            overrides.join(", "),
            config::CONFIG_FILE
        );
    }
    let layouts = ManifestLayouts::with_overrides(&cfg.manifest_layouts);

    record_global(
        &mut result,
        &progress,
        upstream::check_upstream_remote(&repo, &cfg.upstream_repo),
    );
    let (branch, branch_check) = probe::check_on_feature_branch(&repo);
    record_global(&mut result, &progress, branch_check);

    progress.stage("Resolving upstream state");
    progress.flush();
    let refs = upstream::resolve_git_refs(&repo, &root, &cfg)
        .await
        .context("failed to resolve upstream state")?;
    tracing::debug!(
        "verify: comparing head_ref={} against upstream_ref={}",
        refs.head_ref,
        refs.upstream_ref
    );
    record_global(
        &mut result,
        &progress,
        upstream::check_branch_current(&repo, &refs),
    );

    let (packages, packages_check) = packages::find_modified_packages(&repo, &refs);
    record_global(&mut result, &progress, packages_check);

    for pkg in &packages {
        progress.stage(&format!("Checking versions of {}", pkg.full_path));
        verify_package_versions(&mut result, &progress, &root, pkg, &layouts);
    }

    if !packages.is_empty() {
        run_build_stage(&mut result, &progress, &repo, &root, &packages, &cfg).await;
    }

    let success = result.finalize();
    tracing::info!(
        "verify: finished success={} packages={}",
        success,
        packages.len()
    );
    write_report(&result, branch.as_deref(), opts)?;
    Ok(result)
}

fn record_global(result: &mut VerificationResult, progress: &Progress, check: CheckResult) {
    progress.check(&check);
    result.add_global_check(check);
}

fn record_package(
    result: &mut VerificationResult,
    progress: &Progress,
    pkg: &PackageInfo,
    check: CheckResult,
) {
    progress.check(&check);
    result.get_or_create_package_result(pkg).add_check(check);
}

fn verify_package_versions(
    result: &mut VerificationResult,
    progress: &Progress,
    root: &Path,
    pkg: &PackageInfo,
    layouts: &ManifestLayouts,
) {
    match PackageVersionInfo::load(root, pkg, layouts) {
        Ok(info) => {
            tracing::debug!(
                "sequence: package={} manifest={} charts={}",
                pkg.full_path,
                info.manifest_path.display(),
                info.charts_dir.display()
            );
            record_package(result, progress, pkg, sequence::check_chart_built(pkg, &info));
            record_package(
                result,
                progress,
                pkg,
                sequence::check_sequential_version(pkg, &info),
            );
        }
        Err(err) => {
            let message = format!("{:#}", err);
            tracing::warn!("sequence: package={} unreadable: {}", pkg.full_path, message);
            record_package(
                result,
                progress,
                pkg,
                CheckResult::fail(format!("Chart Built ({})", pkg.full_path), true, &message),
            );
            record_package(
                result,
                progress,
                pkg,
                CheckResult::fail(
                    format!("Sequential Version ({})", pkg.full_path),
                    true,
                    message,
                ),
            );
        }
    }
}

/// Build every package in the shared checkout, but only from a clean worktree.
async fn run_build_stage(
    result: &mut VerificationResult,
    progress: &Progress,
    repo: &git2::Repository,
    root: &Path,
    packages: &[PackageInfo],
    cfg: &VerifyConfig,
) {
    progress.stage("Checking repository is clean before build");
    let clean = build::check_repo_clean(repo);
    let is_clean = clean.passed();
    record_global(result, progress, clean);
    if !is_clean {
        progress.note("Skipping build checks: repository has uncommitted changes");
        return;
    }

    if packages.len() > 1 {
        tracing::warn!(
            "build: {} packages share one worktree; a drifting build also dirties later checks",
            packages.len()
        );
    }
    for pkg in packages {
        progress.stage(&format!("Building {}", pkg.full_path));
        progress.flush();
        let check = build::check_build_no_changes(root, pkg, cfg).await;
        record_package(result, progress, pkg, check);
    }
}

fn write_report(
    result: &VerificationResult,
    branch: Option<&str>,
    opts: &VerifyOptions,
) -> Result<()> {
    match &opts.report_path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            report::render(result, branch, opts.json_output, &mut out)?;
            out.flush()
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            report::render(result, branch, opts.json_output, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}
