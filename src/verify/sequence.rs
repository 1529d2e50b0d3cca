use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use semver::Version;
use serde::Deserialize;

use super::types::{CheckResult, PackageInfo};

const MANIFEST_FILE: &str = "package.yaml";

static RANCHER_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<base>.+)-rancher\.(?P<release>\d+)$").unwrap());

/// Where a package keeps its `package.yaml` inside `packages/<name>/<version>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestLayout {
    /// `packages/<name>/<version>/package.yaml`
    VersionRoot,
    /// `packages/<name>/<version>/<name>/package.yaml`
    Nested,
}

impl ManifestLayout {
    pub(crate) fn manifest_path(self, repo_root: &Path, pkg: &PackageInfo) -> PathBuf {
        let version_dir = repo_root
            .join("packages")
            .join(&pkg.name)
            .join(&pkg.version_dir);
        match self {
            ManifestLayout::VersionRoot => version_dir.join(MANIFEST_FILE),
            ManifestLayout::Nested => version_dir.join(&pkg.name).join(MANIFEST_FILE),
        }
    }
}

/// Package name to manifest layout; unlisted packages use [`ManifestLayout::VersionRoot`].
#[derive(Debug, Clone)]
pub(crate) struct ManifestLayouts {
    table: BTreeMap<String, ManifestLayout>,
}

impl Default for ManifestLayouts {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(String::from("rancher-monitoring"), ManifestLayout::Nested);
        Self { table }
    }
}

impl ManifestLayouts {
    pub(crate) fn with_overrides(overrides: &BTreeMap<String, ManifestLayout>) -> Self {
        let mut layouts = Self::default();
        layouts
            .table
            .extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        layouts
    }

    pub(crate) fn layout_for(&self, package: &str) -> ManifestLayout {
        self.table
            .get(package)
            .copied()
            .unwrap_or(ManifestLayout::VersionRoot)
    }
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    version: String,
}

/// Declared version of a package plus the versions already built under `charts/<name>/`.
#[derive(Debug, Clone)]
pub(crate) struct PackageVersionInfo {
    pub version: String,
    pub manifest_path: PathBuf,
    pub charts_dir: PathBuf,
    pub existing_versions: BTreeSet<String>,
}

impl PackageVersionInfo {
    pub(crate) fn load(
        repo_root: &Path,
        pkg: &PackageInfo,
        layouts: &ManifestLayouts,
    ) -> Result<Self> {
        let manifest_path = layouts
            .layout_for(&pkg.name)
            .manifest_path(repo_root, pkg);
        let charts_dir = repo_root.join("charts").join(&pkg.name);

        let content = fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let manifest: PackageManifest = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

        let existing_versions = built_versions(&charts_dir)?;
        tracing::debug!(
            "sequence: package={} version={} built={}",
            pkg.full_path,
            manifest.version,
            existing_versions.len()
        );

        Ok(Self {
            version: manifest.version.trim().to_string(),
            manifest_path,
            charts_dir,
            existing_versions,
        })
    }
}

/// Subdirectory names of `charts_dir`; a missing directory means nothing was built.
fn built_versions(charts_dir: &Path) -> Result<BTreeSet<String>> {
    let entries = match fs::read_dir(charts_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", charts_dir.display()));
        }
    };

    let mut versions = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            versions.insert(name.to_string());
        }
    }
    Ok(versions)
}

/// Parse a chart version, padding `77` / `77.9` to full `major.minor.patch`.
pub(crate) fn parse_chart_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(split);
    let padded = match core.matches('.').count() {
        0 => format!("{}.0.0{}", core, rest),
        1 => format!("{}.0{}", core, rest),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
}

pub(crate) fn check_chart_built(pkg: &PackageInfo, info: &PackageVersionInfo) -> CheckResult {
    let name = format!("Chart Built ({})", pkg.full_path);
    if info.existing_versions.is_empty() {
        return CheckResult::fail(
            name,
            true,
            format!("No charts exist for {} - chart has not been built", pkg.name),
        );
    }
    if !info.existing_versions.contains(&info.version) {
        return CheckResult::fail(
            name,
            true,
            format!(
                "Version {} not found in built charts - chart has not been built",
                info.version
            ),
        );
    }
    CheckResult::pass(
        name,
        true,
        format!("Chart version {} exists in built charts", info.version),
    )
}

/// How a declared version relates to the versions already built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sequence {
    FirstVersion,
    FirstRancherRelease,
    RancherSuccessor { previous: String },
    RancherGap { previous: String },
    SemverSuccessor { previous: String },
    NoPredecessor,
    Invalid { reason: String },
}

impl Sequence {
    pub(crate) fn evaluate(current: &str, existing: &BTreeSet<String>) -> Self {
        if existing.iter().all(|v| v == current) {
            return Sequence::FirstVersion;
        }

        if let Some(caps) = RANCHER_SUFFIX.captures(current) {
            let base = &caps["base"];
            return match caps["release"].parse::<u64>() {
                Ok(0) => Sequence::Invalid {
                    reason: format!("rancher release numbers start at 1 in {}", current),
                },
                Ok(1) => Sequence::FirstRancherRelease,
                Ok(n) => {
                    let previous = format!("{}-rancher.{}", base, n - 1);
                    if existing.contains(&previous) {
                        Sequence::RancherSuccessor { previous }
                    } else {
                        Sequence::RancherGap { previous }
                    }
                }
                Err(err) => Sequence::Invalid {
                    reason: format!("bad rancher release in {}: {}", current, err),
                },
            };
        }

        let current_version = match parse_chart_version(current) {
            Ok(v) => v,
            Err(err) => {
                return Sequence::Invalid {
                    reason: format!("{}: {}", current, err),
                };
            }
        };
        existing
            .iter()
            .filter_map(|raw| {
                let v = parse_chart_version(raw).ok()?;
                (v.cmp_precedence(&current_version) == Ordering::Less).then_some((v, raw))
            })
            .max_by(|a, b| a.0.cmp_precedence(&b.0))
            .map(|(_, raw)| Sequence::SemverSuccessor {
                previous: raw.clone(),
            })
            .unwrap_or(Sequence::NoPredecessor)
    }

    pub(crate) fn passed(&self) -> bool {
        matches!(
            self,
            Sequence::FirstVersion
                | Sequence::FirstRancherRelease
                | Sequence::RancherSuccessor { .. }
                | Sequence::SemverSuccessor { .. }
        )
    }

    pub(crate) fn message(&self, version: &str) -> String {
        match self {
            Sequence::FirstVersion => {
                format!("Version {} is first version for this package", version)
            }
            Sequence::FirstRancherRelease => format!(
                "Version {} is first rancher release for this base version",
                version
            ),
            Sequence::RancherSuccessor { previous } => format!(
                "Version {} is sequential (previous {} exists)",
                version, previous
            ),
            Sequence::RancherGap { previous } => format!(
                "Version {} is not sequential: previous version {} not found in built charts",
                version, previous
            ),
            Sequence::SemverSuccessor { previous } => format!(
                "Version {} is valid (previous version {} exists)",
                version, previous
            ),
            Sequence::NoPredecessor => {
                format!("Version {} has no previous version in built charts", version)
            }
            Sequence::Invalid { reason } => format!("Invalid version format: {}", reason),
        }
    }
}

pub(crate) fn check_sequential_version(pkg: &PackageInfo, info: &PackageVersionInfo) -> CheckResult {
    let name = format!("Sequential Version ({})", pkg.full_path);
    let sequence = Sequence::evaluate(&info.version, &info.existing_versions);
    if sequence.passed() {
        CheckResult::pass(name, true, sequence.message(&info.version))
    } else {
        CheckResult::fail(name, true, sequence.message(&info.version))
    }
}
