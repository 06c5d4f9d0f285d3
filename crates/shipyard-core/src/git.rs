//! Source revision discovery.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{Result, ShipyardError};

/// Revision of `HEAD` in the repository containing `repo_dir`.
pub fn capture_head_revision(repo_dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| ShipyardError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ShipyardError::Git(format!(
            "git rev-parse HEAD failed: {}",
            stderr.trim()
        )));
    }

    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if revision.is_empty() {
        return Err(ShipyardError::Git(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }
    Ok(revision)
}
