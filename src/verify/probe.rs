use std::path::Path;

use git2::Repository;

use super::SetupError;
use super::types::CheckResult;

const DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];

/// Best-effort discovery; any failure means "not a repository".
pub(crate) fn is_git_repository(path: &Path) -> bool {
    Repository::discover(path).is_ok()
}

/// Open the repository containing `path`, searching parent directories.
pub(crate) fn open_repository(path: &Path) -> Result<Repository, SetupError> {
    Repository::discover(path).map_err(|source| SetupError::NotARepository {
        path: path.to_path_buf(),
        source,
    })
}

/// Short name of the checked-out branch.
pub(crate) fn current_branch(repo: &Repository) -> Result<String, SetupError> {
    let head = repo.head()?;
    if !head.is_branch() {
        return Err(SetupError::NotABranch);
    }
    head.shorthand()
        .map(str::to_string)
        .ok_or(SetupError::NotABranch)
}

pub(crate) fn check_is_git_repo(path: &Path) -> CheckResult {
    const NAME: &str = "Git Repository";
    if is_git_repository(path) {
        CheckResult::pass(NAME, true, "Path is a valid git repository")
    } else {
        CheckResult::fail(NAME, true, "Path is not a git repository")
    }
}

/// Returns the branch name (when HEAD is a branch) alongside the check.
pub(crate) fn check_on_feature_branch(repo: &Repository) -> (Option<String>, CheckResult) {
    const NAME: &str = "Branch Status";
    let branch = match current_branch(repo) {
        Ok(branch) => branch,
        Err(err) => {
            return (
                None,
                CheckResult::fail(NAME, true, format!("Failed to find branch name: {}", err)),
            );
        }
    };

    let check = if DEFAULT_BRANCHES.contains(&branch.as_str()) {
        CheckResult::fail(
            NAME,
            true,
            format!(
                "Currently on main branch '{}', should be on a feature branch",
                branch
            ),
        )
    } else {
        CheckResult::pass(NAME, true, format!("On branch '{}'", branch))
    };
    (Some(branch), check)
}
