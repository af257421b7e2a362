//! Runtime provisioning through mise.
//!
//! mise installs the runtime versions a repo declares (`mise.toml`,
//! `node@22`, `go@1.24`, ...). The runner installs mise itself when it is
//! missing, provisions the declared runtimes into the work dir, and pins a
//! legacy `NODE_VERSION` declaration by writing a `mise.toml`.

use crate::reporter::Reporter;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;

const INSTALL_SCRIPT_URL: &str = "https://mise.run";

#[derive(Debug, Error)]
pub enum MiseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mise command failed: {0}")]
    CommandFailed(String),
}

pub struct Mise;

impl Mise {
    /// Whether the mise binary is reachable on PATH.
    pub async fn is_installed() -> bool {
        tokio::process::Command::new("mise")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Install mise via its install script when absent.
    pub async fn ensure_installed(reporter: &Reporter) -> Result<(), MiseError> {
        if Self::is_installed().await {
            return Ok(());
        }

        reporter.add_step("install mise");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("curl -fsSL {INSTALL_SCRIPT_URL} | sh"))
            .stdout(Stdio::from(reporter.file()?))
            .stderr(Stdio::from(reporter.file()?))
            .status()
            .await?;

        if !status.success() {
            return Err(MiseError::CommandFailed("mise install script".to_string()));
        }
        Ok(())
    }

    /// `mise install` in the work dir: provisions everything the repo
    /// declares.
    pub async fn install_local(
        work_dir: &Path,
        reporter: &Reporter,
        runtime: Option<&str>,
    ) -> Result<(), MiseError> {
        let mut command = tokio::process::Command::new("mise");
        command
            .arg("install")
            .arg("--yes")
            .current_dir(work_dir)
            .stdout(Stdio::from(reporter.file()?))
            .stderr(Stdio::from(reporter.file()?));

        if let Some(runtime) = runtime {
            command.arg(runtime);
        }

        let status = command.status().await?;
        if !status.success() {
            return Err(MiseError::CommandFailed(format!(
                "mise install {}",
                runtime.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Runtimes declared for the work dir, as `name@version` strings.
    pub async fn list_local(work_dir: &Path) -> Result<Vec<String>, MiseError> {
        let output = tokio::process::Command::new("mise")
            .args(["ls", "--current"])
            .current_dir(work_dir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(MiseError::CommandFailed("mise ls --current".to_string()));
        }

        Ok(parse_runtime_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Legacy compatibility: `NODE_VERSION=<v>` pins node by writing a
    /// `mise.toml` when the repo has none.
    pub fn pin_legacy_node_version(
        work_dir: &Path,
        node_version: &str,
    ) -> Result<bool, MiseError> {
        let mise_toml = work_dir.join("mise.toml");
        if mise_toml.exists() || node_version.is_empty() {
            return Ok(false);
        }

        let version = node_version.trim_start_matches('v');
        std::fs::write(&mise_toml, format!("[tools]\nnode = \"{version}\"\n"))?;
        Ok(true)
    }
}

/// Parse `mise ls` output lines (`node  22.11.0  ...`) into `name@version`.
fn parse_runtime_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let version = fields.next()?;
            if name.is_empty() || version.starts_with('(') {
                return None;
            }
            Some(format!("{name}@{version}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_runtime_list() {
        let output = "node    22.11.0   ~/.config/mise/config.toml\ngo      1.24.1    mise.toml\n";
        assert_eq!(parse_runtime_list(output), vec!["node@22.11.0", "go@1.24.1"]);
        assert!(parse_runtime_list("").is_empty());
    }

    #[test]
    fn test_pin_legacy_node_version() {
        let temp = TempDir::new().unwrap();

        assert!(Mise::pin_legacy_node_version(temp.path(), "v20.10.0").unwrap());
        let pinned = std::fs::read_to_string(temp.path().join("mise.toml")).unwrap();
        assert!(pinned.contains("node = \"20.10.0\""));

        // Existing mise.toml wins over the legacy variable.
        assert!(!Mise::pin_legacy_node_version(temp.path(), "18").unwrap());
    }

    #[test]
    fn test_pin_skips_empty_version() {
        let temp = TempDir::new().unwrap();
        assert!(!Mise::pin_legacy_node_version(temp.path(), "").unwrap());
        assert!(!temp.path().join("mise.toml").exists());
    }
}
