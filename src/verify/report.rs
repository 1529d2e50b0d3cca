use std::io::{self, Write};

use anyhow::Result;

use super::types::{CheckResult, VerificationResult};

/// Incremental progress on stdout; silent in JSON mode.
pub(crate) struct Progress {
    enabled: bool,
}

impl Progress {
    pub(crate) fn new(json_output: bool) -> Self {
        Self {
            enabled: !json_output,
        }
    }

    pub(crate) fn stage(&self, msg: &str) {
        if self.enabled {
            println!("==> {}", msg);
        }
    }

    pub(crate) fn check(&self, check: &CheckResult) {
        if self.enabled {
            println!("  [{}] {}", check.status().label(), check.name());
        }
    }

    pub(crate) fn note(&self, msg: &str) {
        if self.enabled {
            println!("  {}", msg);
        }
    }

    pub(crate) fn flush(&self) {
        if self.enabled {
            let _ = io::stdout().flush();
        }
    }
}

fn write_check<W: Write>(out: &mut W, check: &CheckResult) -> io::Result<()> {
    writeln!(out, "[{}] {}", check.status().label(), check.name())?;
    for line in check.message().lines() {
        writeln!(out, "  {}", line)?;
    }
    writeln!(out)
}

pub(crate) fn render_human<W: Write>(
    result: &VerificationResult,
    branch: Option<&str>,
    out: &mut W,
) -> io::Result<()> {
    match branch {
        Some(branch) => writeln!(out, "\n=== Branch Verification Results for '{}' ===\n", branch)?,
        None => writeln!(out, "\n=== Branch Verification Results ===\n")?,
    }

    for check in result.global_checks() {
        write_check(out, check)?;
    }
    for pkg in result.package_results() {
        writeln!(out, "--- Package {} ---\n", pkg.package().full_path)?;
        for check in pkg.checks() {
            write_check(out, check)?;
        }
    }

    let counts = result.counts();
    writeln!(
        out,
        "Summary: {} passed, {} failed, {} warnings",
        counts.passed, counts.failed, counts.warnings
    )?;

    let verdict = if !result.success() {
        "Verification FAILED - Critical issues found"
    } else if counts.warnings > 0 {
        "Verification PASSED with warnings"
    } else {
        "Verification PASSED - All checks successful"
    };
    writeln!(out, "\n{}", verdict)
}

pub(crate) fn render_json<W: Write>(result: &VerificationResult, out: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, result)?;
    writeln!(out)?;
    Ok(())
}

pub(crate) fn render<W: Write>(
    result: &VerificationResult,
    branch: Option<&str>,
    json_output: bool,
    out: &mut W,
) -> Result<()> {
    if json_output {
        render_json(result, out)
    } else {
        render_human(result, branch, out)?;
        Ok(())
    }
}
