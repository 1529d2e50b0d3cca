use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use assert_cmd::Command;
use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature};
use serde_json::Value;
use tempfile::TempDir;

const BRANCH: &str = "bump-monitoring";
const TOOL_REMOTE: &str = "_chartgate-upstream";

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, content)?;
    Ok(())
}

fn commit_all(repo: &Repository, message: &str) -> Result<()> {
    let mut idx = repo.index()?;
    idx.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    idx.write()?;
    let oid = idx.write_tree()?;
    let tree = repo.find_tree(oid)?;
    let sig = Signature::now("chartgate", "chartgate@example.com")?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(())
}

/// An upstream charts repository plus a clone checked out on a feature branch.
struct Workspace {
    td: TempDir,
    upstream: PathBuf,
    work: PathBuf,
}

impl Workspace {
    fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let upstream = td.path().join("upstream");
        let work = td.path().join("work");

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&upstream, &opts)?;
        write_file(&upstream.join("README.md"), "# charts\n")?;
        write_file(
            &upstream.join("packages/rancher-monitoring/77.8/rancher-monitoring/package.yaml"),
            "url: local\nversion: \"77.8\"\n",
        )?;
        write_file(
            &upstream.join("charts/rancher-monitoring/77.8/Chart.yaml"),
            "name: rancher-monitoring\nversion: 77.8.0\n",
        )?;
        write_file(
            &upstream.join("charts/rancher-logging/4.9/Chart.yaml"),
            "name: rancher-logging\nversion: 4.9.0\n",
        )?;
        commit_all(&repo, "initial charts")?;

        let cloned = Repository::clone(&upstream.to_string_lossy(), &work)?;
        {
            let head = cloned.head()?.peel_to_commit()?;
            cloned.branch(BRANCH, &head, false)?;
        }
        cloned.set_head(&format!("refs/heads/{}", BRANCH))?;

        Ok(Self { td, upstream, work })
    }

    fn work_repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.work)?)
    }

    /// Commit a `.chartgate.toml` pointing at the local upstream with `sh -c <script>` as build.
    fn configure(&self, script: &str) -> Result<()> {
        let config = format!(
            "upstream_url = '{}'\nfetch_timeout_secs = 60\nbuild_command = ['sh', '-c', '{}']\n",
            self.upstream.display(),
            script
        );
        write_file(&self.work.join(".chartgate.toml"), &config)?;
        commit_all(&self.work_repo()?, "configure chartgate")
    }

    fn bump_monitoring(&self) -> Result<()> {
        write_file(
            &self
                .work
                .join("packages/rancher-monitoring/77.9/rancher-monitoring/package.yaml"),
            "url: local\nversion: \"77.9\"\n",
        )?;
        write_file(
            &self.work.join("charts/rancher-monitoring/77.9/Chart.yaml"),
            "name: rancher-monitoring\nversion: 77.9.0\n",
        )?;
        commit_all(&self.work_repo()?, "bump rancher-monitoring to 77.9")
    }

    fn chartgate(&self) -> Result<Command> {
        let mut cmd = Command::cargo_bin("chartgate")?;
        cmd.current_dir(&self.work);
        cmd.env_remove("CHARTGATE_UPSTREAM_URL");
        cmd.env_remove("CHARTGATE_LOG");
        Ok(cmd)
    }

    fn verify_json(&self) -> Result<(i32, Value)> {
        let output = self.chartgate()?.args(["verify-branch", "--json"]).output()?;
        let code = output.status.code().unwrap_or(-1);
        let json: Value = serde_json::from_slice(&output.stdout).map_err(|err| {
            anyhow::anyhow!(
                "stdout is not JSON ({}): {}\nstderr: {}",
                err,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        })?;
        Ok((code, json))
    }

    fn assert_tool_remote_removed(&self) -> Result<()> {
        let repo = self.work_repo()?;
        assert!(
            repo.find_remote(TOOL_REMOTE).is_err(),
            "tool remote left behind"
        );
        Ok(())
    }
}

fn label(check: &Value) -> &'static str {
    match (check["passed"].as_bool(), check["critical"].as_bool()) {
        (Some(true), _) => "PASS",
        (_, Some(true)) => "FAIL",
        _ => "WARN",
    }
}

/// One `LABEL name` line per check, package checks indented under their package.
fn summarize(json: &Value) -> String {
    let mut lines = Vec::new();
    for check in json["globalChecks"].as_array().into_iter().flatten() {
        lines.push(format!("{} {}", label(check), check["name"].as_str().unwrap_or("")));
    }
    for pkg in json["packageResults"].as_array().into_iter().flatten() {
        lines.push(format!(
            "{}:",
            pkg["package"]["fullPath"].as_str().unwrap_or("")
        ));
        for check in pkg["checks"].as_array().into_iter().flatten() {
            lines.push(format!(
                "  {} {}",
                label(check),
                check["name"].as_str().unwrap_or("")
            ));
        }
    }
    lines.join("\n")
}

fn package_check<'a>(json: &'a Value, name: &str) -> Option<&'a Value> {
    json["packageResults"]
        .as_array()?
        .iter()
        .flat_map(|pkg| pkg["checks"].as_array().into_iter().flatten())
        .find(|check| check["name"].as_str() == Some(name))
}

#[test]
fn clean_bump_passes() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("test \"$PACKAGE\" = rancher-monitoring")?;
    ws.bump_monitoring()?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 0, "{}", json);
    assert_eq!(json["success"], Value::Bool(true));
    insta::assert_snapshot!(summarize(&json), @r###"PASS Git Repository
WARN Upstream Repository
PASS Branch Status
PASS Branch Current with Upstream
PASS Modified Packages
PASS Repository Clean Before Build
rancher-monitoring/77.9:
  PASS Chart Built (rancher-monitoring/77.9)
  PASS Sequential Version (rancher-monitoring/77.9)
  PASS Build Check (rancher-monitoring/77.9)"###);
    assert_eq!(
        package_check(&json, "Sequential Version (rancher-monitoring/77.9)").unwrap()["message"],
        "Version 77.9 is valid (previous version 77.8 exists)"
    );
    ws.assert_tool_remote_removed()
}

#[test]
fn runs_from_a_subdirectory_and_warns_about_redirects() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    ws.bump_monitoring()?;

    let output = ws
        .chartgate()?
        .current_dir(ws.work.join("packages/rancher-monitoring"))
        .args(["verify-branch", "--json"])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    let json: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(
        json["packageResults"][0]["package"]["fullPath"],
        "rancher-monitoring/77.9"
    );
    let stderr = String::from_utf8(output.stderr)?;
    assert!(
        stderr.contains("upstream_url, build_command set by the branch"),
        "{}",
        stderr
    );
    ws.assert_tool_remote_removed()
}

#[test]
fn dirty_worktree_skips_builds() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    ws.bump_monitoring()?;
    write_file(&ws.work.join("notes.txt"), "scratch\n")?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 1);
    assert_eq!(json["success"], Value::Bool(false));
    insta::assert_snapshot!(summarize(&json), @r###"PASS Git Repository
WARN Upstream Repository
PASS Branch Status
PASS Branch Current with Upstream
PASS Modified Packages
FAIL Repository Clean Before Build
rancher-monitoring/77.9:
  PASS Chart Built (rancher-monitoring/77.9)
  PASS Sequential Version (rancher-monitoring/77.9)"###);
    let clean = json["globalChecks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "Repository Clean Before Build")
        .unwrap();
    assert!(clean["message"].as_str().unwrap().contains("notes.txt"));
    ws.assert_tool_remote_removed()
}

#[test]
fn build_drift_fails() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("echo \"$PACKAGE\" > generated.txt")?;
    ws.bump_monitoring()?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 1);
    let build = package_check(&json, "Build Check (rancher-monitoring/77.9)").unwrap();
    assert_eq!(build["passed"], Value::Bool(false));
    assert_eq!(
        build["message"],
        "Build created uncommitted changes: [generated.txt]"
    );
    ws.assert_tool_remote_removed()
}

#[test]
fn failing_build_reports_output() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("echo chart lint exploded >&2; exit 3")?;
    ws.bump_monitoring()?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 1);
    let message = package_check(&json, "Build Check (rancher-monitoring/77.9)").unwrap()["message"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(message.starts_with("Build failed:"), "{}", message);
    assert!(message.contains("chart lint exploded"), "{}", message);
    ws.assert_tool_remote_removed()
}

#[test]
fn missing_built_chart_fails() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    write_file(
        &ws.work
            .join("packages/rancher-monitoring/77.10/rancher-monitoring/package.yaml"),
        "url: local\nversion: \"77.10\"\n",
    )?;
    commit_all(&ws.work_repo()?, "bump without building")?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 1);
    let built = package_check(&json, "Chart Built (rancher-monitoring/77.10)").unwrap();
    assert_eq!(built["passed"], Value::Bool(false));
    assert_eq!(
        built["message"],
        "Version 77.10 not found in built charts - chart has not been built"
    );
    ws.assert_tool_remote_removed()
}

#[test]
fn several_packages_warn_but_pass() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    write_file(
        &ws.work.join("packages/rancher-logging/4.10/package.yaml"),
        "url: local\nversion: \"4.10\"\n",
    )?;
    write_file(
        &ws.work.join("charts/rancher-logging/4.10/Chart.yaml"),
        "name: rancher-logging\nversion: 4.10.0\n",
    )?;
    ws.bump_monitoring()?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 0, "{}", json);
    insta::assert_snapshot!(summarize(&json), @r###"PASS Git Repository
WARN Upstream Repository
PASS Branch Status
PASS Branch Current with Upstream
WARN Modified Packages
PASS Repository Clean Before Build
rancher-logging/4.10:
  PASS Chart Built (rancher-logging/4.10)
  PASS Sequential Version (rancher-logging/4.10)
  PASS Build Check (rancher-logging/4.10)
rancher-monitoring/77.9:
  PASS Chart Built (rancher-monitoring/77.9)
  PASS Sequential Version (rancher-monitoring/77.9)
  PASS Build Check (rancher-monitoring/77.9)"###);
    ws.assert_tool_remote_removed()
}

#[test]
fn behind_upstream_is_a_warning() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    ws.bump_monitoring()?;
    let upstream = Repository::open(&ws.upstream)?;
    write_file(&ws.upstream.join("README.md"), "# charts\n\nmore docs\n")?;
    commit_all(&upstream, "docs")?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 0, "{}", json);
    let current = json["globalChecks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "Branch Current with Upstream")
        .unwrap();
    assert_eq!(current["passed"], Value::Bool(false));
    assert_eq!(current["critical"], Value::Bool(false));
    assert!(
        current["message"]
            .as_str()
            .unwrap()
            .starts_with("Branch is 1 commit(s) behind upstream/main")
    );
    ws.assert_tool_remote_removed()
}

#[test]
fn main_branch_fails_without_packages() -> Result<()> {
    let ws = Workspace::new()?;
    let repo = ws.work_repo()?;
    repo.set_head("refs/heads/main")?;
    ws.configure("true")?;

    let (code, json) = ws.verify_json()?;
    assert_eq!(code, 1);
    insta::assert_snapshot!(summarize(&json), @r###"PASS Git Repository
WARN Upstream Repository
FAIL Branch Status
PASS Branch Current with Upstream
PASS Modified Packages"###);
    ws.assert_tool_remote_removed()
}

#[test]
fn unreachable_upstream_is_a_setup_error() -> Result<()> {
    let ws = Workspace::new()?;
    ws.bump_monitoring()?;

    let output = ws
        .chartgate()?
        .env("CHARTGATE_UPSTREAM_URL", ws.td.path().join("missing"))
        .args(["verify-branch", "--json"])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(
        stderr.contains("failed to resolve upstream state"),
        "{}",
        stderr
    );
    ws.assert_tool_remote_removed()
}

#[test]
fn not_a_repository_exits_nonzero() -> Result<()> {
    let td = tempfile::tempdir()?;
    let output = Command::cargo_bin("chartgate")?
        .arg("verify-branch")
        .arg(td.path())
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("is not a git repository"), "{}", stderr);
    Ok(())
}

#[test]
fn report_file_matches_stdout_schema() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    ws.bump_monitoring()?;
    let report = ws.td.path().join("report.json");

    let output = ws
        .chartgate()?
        .args(["verify-branch", "--json", "--report"])
        .arg(&report)
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    assert!(output.stdout.is_empty());

    let json: Value = serde_json::from_str(&fs::read_to_string(&report)?)?;
    assert_eq!(json["success"], Value::Bool(true));
    assert_eq!(
        json["packageResults"][0]["package"]["fullPath"],
        "rancher-monitoring/77.9"
    );
    Ok(())
}

#[test]
fn human_report_ends_with_verdict() -> Result<()> {
    let ws = Workspace::new()?;
    ws.configure("true")?;
    ws.bump_monitoring()?;

    let output = ws.chartgate()?.arg("verify-branch").output()?;
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("=== Branch Verification Results for 'bump-monitoring' ==="));
    assert!(stdout.contains("--- Package rancher-monitoring/77.9 ---"));
    assert!(stdout.contains("Summary: 8 passed, 0 failed, 1 warnings"));
    assert!(stdout.trim_end().ends_with("Verification PASSED with warnings"));
    Ok(())
}

#[test]
fn qa_hint_prints_cluster_repo() -> Result<()> {
    let ws = Workspace::new()?;
    ws.work_repo()?
        .remote_set_url("origin", "git@github.com:jdoe/ob-team-charts.git")?;

    let output = ws.chartgate()?.arg("qa-hint").output()?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout)?;
    insta::assert_snapshot!(stdout.trim(), @r###"```yaml
apiVersion: catalog.cattle.io/v1
kind: ClusterRepo
metadata:
  name: jdoe-bump-monitoring
spec:
  gitBranch: bump-monitoring
  gitRepo: https://github.com/jdoe/ob-team-charts
```"###);
    Ok(())
}
