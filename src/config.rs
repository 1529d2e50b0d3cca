use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::verify::sequence::ManifestLayout;

pub const CONFIG_FILE: &str = ".chartgate.toml";
pub const UPSTREAM_URL_ENV: &str = "CHARTGATE_UPSTREAM_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    /// Canonical upstream identity as `owner/repo`.
    pub upstream_repo: String,
    pub upstream_url: Option<String>,
    pub fetch_timeout_secs: u64,
    pub build_command: Vec<String>,
    pub package_env: String,
    /// Zero disables the build deadline.
    pub build_timeout_secs: u64,
    pub manifest_layouts: BTreeMap<String, ManifestLayout>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            upstream_repo: String::from("rancher/ob-team-charts"),
            upstream_url: None,
            fetch_timeout_secs: 120,
            build_command: vec![String::from("make"), String::from("charts")],
            package_env: String::from("PACKAGE"),
            build_timeout_secs: 1800,
            manifest_layouts: BTreeMap::new(),
        }
    }
}

impl VerifyConfig {
    pub fn upstream_url(&self) -> String {
        self.upstream_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.upstream_repo))
    }

    /// Settings that come from the branch under review and change what it is checked against.
    pub fn branch_controlled_overrides(&self) -> Vec<&'static str> {
        let defaults = Self::default();
        let canonical = format!("https://github.com/{}.git", self.upstream_repo);
        let mut keys = Vec::new();
        if self.upstream_repo != defaults.upstream_repo {
            keys.push("upstream_repo");
        }
        if self.upstream_url.as_deref().is_some_and(|url| url != canonical) {
            keys.push("upstream_url");
        }
        if self.build_command != defaults.build_command {
            keys.push("build_command");
        }
        keys
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout_secs > 0).then(|| Duration::from_secs(self.build_timeout_secs))
    }
}

pub async fn load_config(repo_root: &Path) -> Result<VerifyConfig> {
    let path = repo_root.join(CONFIG_FILE);
    let mut cfg = if path.exists() {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        parse_config(&content).with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        VerifyConfig::default()
    };

    if let Ok(url) = std::env::var(UPSTREAM_URL_ENV)
        && !url.is_empty()
    {
        tracing::debug!("config: upstream url overridden by {}", UPSTREAM_URL_ENV);
        cfg.upstream_url = Some(url);
    }
    Ok(cfg)
}

fn parse_config(content: &str) -> Result<VerifyConfig> {
    let cfg: VerifyConfig = toml::from_str(content)?;
    if cfg.build_command.is_empty() {
        anyhow::bail!("build_command must not be empty");
    }
    Ok(cfg)
}
