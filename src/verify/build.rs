use std::path::Path;

use git2::{Repository, Status, StatusOptions};
use tokio::process::Command;

use crate::config::VerifyConfig;
use crate::process;

use super::types::{CheckResult, PackageInfo};

/// Worktree snapshot. Taken fresh each time, never cached across stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepoStatus {
    pub is_clean: bool,
    pub modified_files: Vec<String>,
}

pub(crate) fn repo_status(repo: &Repository) -> Result<RepoStatus, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;

    let modified_files: Vec<String> = statuses
        .iter()
        .filter(|entry| {
            let status = entry.status();
            status != Status::CURRENT && !status.contains(Status::IGNORED)
        })
        .map(|entry| {
            entry
                .path()
                .map(str::to_string)
                .unwrap_or_else(|| String::from_utf8_lossy(entry.path_bytes()).into_owned())
        })
        .collect();

    Ok(RepoStatus {
        is_clean: modified_files.is_empty(),
        modified_files,
    })
}

pub(crate) fn check_repo_clean(repo: &Repository) -> CheckResult {
    const NAME: &str = "Repository Clean Before Build";
    match repo_status(repo) {
        Err(err) => CheckResult::fail(NAME, true, format!("failed to get status: {}", err)),
        Ok(status) if status.is_clean => {
            CheckResult::pass(NAME, true, "Repository is clean before build")
        }
        Ok(status) => CheckResult::fail(
            NAME,
            true,
            format!(
                "Repository has uncommitted changes before build (cannot verify build cleanliness): [{}]",
                status.modified_files.join(", ")
            ),
        ),
    }
}

/// Run the build for `pkg` in `repo_root` and fail on any resulting worktree change.
pub(crate) async fn check_build_no_changes(
    repo_root: &Path,
    pkg: &PackageInfo,
    cfg: &VerifyConfig,
) -> CheckResult {
    let name = format!("Build Check ({})", pkg.full_path);

    let (program, args) = match cfg.build_command.split_first() {
        Some(split) => split,
        None => return CheckResult::fail(name, true, "Build failed: no build command configured"),
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(repo_root)
        .env(&cfg.package_env, &pkg.name);

    tracing::info!(
        "build: running `{}` {}={}",
        cfg.build_command.join(" "),
        cfg.package_env,
        pkg.name
    );
    let output = match process::run_captured(cmd, cfg.build_timeout()).await {
        Ok(output) => output,
        Err(err) => return CheckResult::fail(name, true, format!("Build failed: {}", err)),
    };
    if !output.success() {
        return CheckResult::fail(
            name,
            true,
            format!(
                "Build failed: {}\nOutput: {}",
                output.status,
                output.combined()
            ),
        );
    }

    let repo = match Repository::open(repo_root) {
        Ok(repo) => repo,
        Err(err) => {
            return CheckResult::fail(
                name,
                true,
                format!("Failed to open repo after build: {}", err),
            );
        }
    };
    match repo_status(&repo) {
        Err(err) => CheckResult::fail(name, true, format!("failed to get status: {}", err)),
        Ok(status) if status.is_clean => {
            CheckResult::pass(name, true, "Build successful with no uncommitted changes")
        }
        Ok(status) => CheckResult::fail(
            name,
            true,
            format!(
                "Build created uncommitted changes: [{}]",
                status.modified_files.join(", ")
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{IndexAddOption, RepositoryInitOptions, Signature};
    use std::fs;
    use tempfile::TempDir;

    fn committed_repo() -> (TempDir, Repository) {
        let td = TempDir::new().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("feature");
        let repo = Repository::init_opts(td.path(), &opts).unwrap();
        fs::write(td.path().join("Makefile"), "charts:\n\ttrue\n").unwrap();
        fs::write(td.path().join(".gitignore"), "build/\n").unwrap();
        {
            let mut idx = repo.index().unwrap();
            idx.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
                .unwrap();
            idx.write().unwrap();
            let tree = repo.find_tree(idx.write_tree().unwrap()).unwrap();
            let sig = Signature::now("chartgate", "chartgate@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        (td, repo)
    }

    fn config(command: &[&str]) -> VerifyConfig {
        VerifyConfig {
            build_command: command.iter().map(|s| s.to_string()).collect(),
            ..VerifyConfig::default()
        }
    }

    #[test]
    fn clean_checkout_reports_clean() {
        let (_td, repo) = committed_repo();
        let status = repo_status(&repo).unwrap();
        assert!(status.is_clean);
        assert!(check_repo_clean(&repo).passed());
    }

    #[test]
    fn untracked_and_modified_files_are_dirty() {
        let (td, repo) = committed_repo();
        fs::write(td.path().join("Makefile"), "changed\n").unwrap();
        fs::write(td.path().join("stray.txt"), "x\n").unwrap();
        fs::create_dir_all(td.path().join("build")).unwrap();
        fs::write(td.path().join("build/ignored.txt"), "x\n").unwrap();

        let status = repo_status(&repo).unwrap();
        assert!(!status.is_clean);
        assert_eq!(status.modified_files, ["Makefile", "stray.txt"]);

        let check = check_repo_clean(&repo);
        assert!(!check.passed());
        assert!(check.critical());
        assert!(check.message().contains("stray.txt"));
    }

    #[tokio::test]
    async fn build_without_drift_passes() {
        let (td, _repo) = committed_repo();
        let pkg = PackageInfo::new("rancher-logging", "4.10");
        let check = check_build_no_changes(
            td.path(),
            &pkg,
            &config(&["sh", "-c", "test \"$PACKAGE\" = rancher-logging"]),
        )
        .await;
        assert!(check.passed(), "{}", check.message());
    }

    #[tokio::test]
    async fn build_drift_fails_with_file_list() {
        let (td, _repo) = committed_repo();
        let pkg = PackageInfo::new("rancher-logging", "4.10");
        let check = check_build_no_changes(
            td.path(),
            &pkg,
            &config(&["sh", "-c", "echo \"$PACKAGE\" > generated.txt"]),
        )
        .await;
        assert!(!check.passed());
        assert!(check.critical());
        assert_eq!(
            check.message(),
            "Build created uncommitted changes: [generated.txt]"
        );
    }

    #[tokio::test]
    async fn failing_build_carries_output() {
        let (td, _repo) = committed_repo();
        let pkg = PackageInfo::new("rancher-logging", "4.10");
        let check = check_build_no_changes(
            td.path(),
            &pkg,
            &config(&["sh", "-c", "echo missing chart >&2; exit 2"]),
        )
        .await;
        assert!(!check.passed());
        assert!(check.message().starts_with("Build failed:"));
        assert!(check.message().contains("missing chart"));
    }
}
