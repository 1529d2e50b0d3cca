use std::collections::BTreeMap;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use git2::{Oid, Repository};

use super::types::{CheckResult, PackageInfo};
use super::upstream::GitRefs;

const PACKAGES_DIR: &str = "packages";
const CHECK_NAME: &str = "Modified Packages";

/// `(name, version)` for a path shaped like `packages/<name>/<version>/...`.
fn package_for_path(path: &Path) -> Option<(String, String)> {
    let mut parts = path.components().map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    });
    if parts.next()?? != PACKAGES_DIR {
        return None;
    }
    let name = parts.next()??;
    let version = parts.next()??;
    // A file directly under packages/<name>/ is not inside a version directory.
    parts.next()??;
    Some((name.to_string(), version.to_string()))
}

/// Versioned package directories that differ between `base` and `head`, sorted by full path.
pub(crate) fn diff_packages(repo: &Repository, base: Oid, head: Oid) -> Result<Vec<PackageInfo>> {
    let base_tree = repo
        .find_commit(base)
        .and_then(|c| c.tree())
        .context("failed to get merge-base tree")?;
    let head_tree = repo
        .find_commit(head)
        .and_then(|c| c.tree())
        .context("failed to get HEAD tree")?;
    let diff = repo
        .diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)
        .context("failed to diff trees")?;

    let mut touched: BTreeMap<String, PackageInfo> = BTreeMap::new();
    for delta in diff.deltas() {
        let paths = [delta.new_file().path(), delta.old_file().path()];
        for path in paths.into_iter().flatten() {
            if let Some((name, version)) = package_for_path(path) {
                let info = PackageInfo::new(&name, &version);
                touched.entry(info.full_path.clone()).or_insert(info);
            }
        }
    }
    Ok(touched.into_values().collect())
}

/// Detect modified packages and classify the result.
///
/// None is fine, one is expected, several is a warning.
pub(crate) fn find_modified_packages(
    repo: &Repository,
    refs: &GitRefs,
) -> (Vec<PackageInfo>, CheckResult) {
    let packages = match diff_packages(repo, refs.merge_base, refs.head_commit) {
        Ok(packages) => packages,
        Err(err) => {
            return (
                Vec::new(),
                CheckResult::fail(CHECK_NAME, true, format!("{:#}", err)),
            );
        }
    };
    tracing::debug!("packages: modified count={}", packages.len());
    let check = classify(&packages);
    (packages, check)
}

fn classify(packages: &[PackageInfo]) -> CheckResult {
    match packages {
        [] => CheckResult::pass(
            CHECK_NAME,
            false,
            "No packages modified in this branch (nothing to verify)",
        ),
        [only] => CheckResult::pass(
            CHECK_NAME,
            false,
            format!("Single package version modified: {}", only.full_path),
        ),
        many => {
            let names: Vec<&str> = many.iter().map(|p| p.full_path.as_str()).collect();
            CheckResult::fail(
                CHECK_NAME,
                false,
                format!(
                    "Multiple package versions modified: [{}] (recommend modifying only one)",
                    names.join(", ")
                ),
            )
        }
    }
}
