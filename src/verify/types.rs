use serde::{Deserialize, Serialize};

/// Outcome of a single verification step.
///
/// A failed critical check blocks the merge; a failed non-critical check is a
/// warning only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CheckResult {
    name: String,
    passed: bool,
    message: String,
    critical: bool,
}

impl CheckResult {
    pub(crate) fn pass(name: impl Into<String>, critical: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            critical,
        }
    }

    pub(crate) fn fail(name: impl Into<String>, critical: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            critical,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn passed(&self) -> bool {
        self.passed
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn critical(&self) -> bool {
        self.critical
    }

    pub(crate) fn status(&self) -> CheckStatus {
        match (self.passed, self.critical) {
            (true, _) => CheckStatus::Pass,
            (false, true) => CheckStatus::Fail,
            (false, false) => CheckStatus::Warn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

impl CheckStatus {
    pub(crate) fn label(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
        }
    }
}

/// One versioned package directory, e.g. `rancher-monitoring/77.9`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageInfo {
    pub full_path: String,
    pub name: String,
    pub version_dir: String,
}

impl PackageInfo {
    pub(crate) fn new(name: &str, version_dir: &str) -> Self {
        Self {
            full_path: format!("{}/{}", name, version_dir),
            name: name.to_string(),
            version_dir: version_dir.to_string(),
        }
    }
}

impl PartialEq for PackageInfo {
    fn eq(&self, other: &Self) -> bool {
        self.full_path == other.full_path
    }
}

impl Eq for PackageInfo {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PackageResult {
    package: PackageInfo,
    checks: Vec<CheckResult>,
}

impl PackageResult {
    pub(crate) fn package(&self) -> &PackageInfo {
        &self.package
    }

    pub(crate) fn checks(&self) -> &[CheckResult] {
        &self.checks
    }

    pub(crate) fn add_check(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    pub(crate) fn has_critical_failure(&self) -> bool {
        self.checks.iter().any(|c| !c.passed() && c.critical())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CheckCounts {
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
}

/// Full report of one verification run.
///
/// `success` stays `false` until [`VerificationResult::finalize`] derives it
/// from the accumulated checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VerificationResult {
    success: bool,
    global_checks: Vec<CheckResult>,
    package_results: Vec<PackageResult>,
}

impl VerificationResult {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn success(&self) -> bool {
        self.success
    }

    pub(crate) fn global_checks(&self) -> &[CheckResult] {
        &self.global_checks
    }

    pub(crate) fn package_results(&self) -> &[PackageResult] {
        &self.package_results
    }

    pub(crate) fn add_global_check(&mut self, check: CheckResult) {
        self.global_checks.push(check);
    }

    /// Look up the result bucket for `pkg` by `full_path`, creating it on first use.
    pub(crate) fn get_or_create_package_result(&mut self, pkg: &PackageInfo) -> &mut PackageResult {
        let idx = match self
            .package_results
            .iter()
            .position(|r| r.package.full_path == pkg.full_path)
        {
            Some(idx) => idx,
            None => {
                self.package_results.push(PackageResult {
                    package: pkg.clone(),
                    checks: Vec::new(),
                });
                self.package_results.len() - 1
            }
        };
        &mut self.package_results[idx]
    }

    pub(crate) fn has_critical_failure(&self) -> bool {
        self.global_checks.iter().any(|c| !c.passed() && c.critical())
            || self
                .package_results
                .iter()
                .any(PackageResult::has_critical_failure)
    }

    pub(crate) fn finalize(&mut self) -> bool {
        self.success = !self.has_critical_failure();
        self.success
    }

    /// Every check in report order: globals first, then each package's checks.
    pub(crate) fn all_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.global_checks
            .iter()
            .chain(self.package_results.iter().flat_map(|r| r.checks.iter()))
    }

    pub(crate) fn counts(&self) -> CheckCounts {
        let mut counts = CheckCounts::default();
        for check in self.all_checks() {
            match check.status() {
                CheckStatus::Pass => counts.passed += 1,
                CheckStatus::Fail => counts.failed += 1,
                CheckStatus::Warn => counts.warnings += 1,
            }
        }
        counts
    }
}
