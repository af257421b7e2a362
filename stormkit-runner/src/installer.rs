//! Phase A: runtime detection and dependency install.
//!
//! The package manager is picked from the lockfile (`bun|pnpm|yarn|npm`),
//! `go.mod` selects the Go toolchain, and a custom install command
//! overrides everything. Installs are retried with capped exponential
//! backoff under a wall-clock ceiling.

use crate::deps::PackageJson;
use crate::mise::Mise;
use crate::reporter::Reporter;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const INSTALL_CEILING: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("install command failed: {0}")]
    CommandFailed(String),

    #[error("install did not succeed within the allowed time")]
    Exhausted,

    #[error(transparent)]
    Mise(#[from] crate::mise::MiseError),
}

/// What the repository looks like: manifest, lockfiles, toolchain.
#[derive(Debug, Clone, Default)]
pub struct RepoProbe {
    pub package_json: Option<PackageJson>,
    pub is_bun: bool,
    pub is_yarn: bool,
    pub is_pnpm: bool,
    pub has_package_lock: bool,
    pub has_go_mod: bool,
}

impl RepoProbe {
    pub fn detect(work_dir: &Path) -> Self {
        let package_json = PackageJson::load(&work_dir.join("package.json"));
        let exists = |name: &str| work_dir.join(name).is_file();

        Self {
            is_bun: package_json.is_some()
                && (exists("bun.lockb") || exists("bun.lock")),
            is_pnpm: package_json.is_some() && exists("pnpm-lock.yaml"),
            is_yarn: package_json.is_some() && exists("yarn.lock"),
            has_package_lock: exists("package-lock.json"),
            has_go_mod: exists("go.mod"),
            package_json,
        }
    }

    /// Runtime to provision via mise.
    pub fn runtime(&self) -> Option<&'static str> {
        if self.package_json.is_some() {
            Some(if self.is_bun { "bun" } else { "node" })
        } else if self.has_go_mod {
            Some("go")
        } else {
            None
        }
    }
}

/// One command of the install plan, `argv` form.
pub type PlannedCommand = Vec<String>;

/// Build the install plan without executing anything.
///
/// `yarn_major` is the detected `yarn --version` major, when yarn is the
/// package manager.
pub fn install_plan(
    probe: &RepoProbe,
    install_cmd: &str,
    yarn_major: Option<u32>,
) -> Vec<PlannedCommand> {
    let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    if !install_cmd.is_empty() {
        return vec![argv(&["sh", "-c", install_cmd])];
    }

    let Some(package_json) = &probe.package_json else {
        // Go (and everything else) installs during the build.
        return Vec::new();
    };

    if probe.is_bun {
        return vec![argv(&["bun", "install"])];
    }

    if probe.is_yarn {
        let mut plan = Vec::new();
        // Yarn v1 needs the workspaces experiment enabled explicitly.
        if yarn_major == Some(1) && !package_json.workspaces.is_empty() {
            plan.push(argv(&[
                "yarn",
                "config",
                "set",
                "workspaces-experimental",
                "true",
            ]));
        }
        if yarn_major == Some(1) {
            plan.push(argv(&["yarn", "--production=false"]));
        } else {
            plan.push(argv(&["yarn"]));
        }
        return plan;
    }

    if probe.is_pnpm {
        return vec![argv(&["pnpm", "install"])];
    }

    let npm_install = if probe.has_package_lock { "ci" } else { "install" };
    vec![
        argv(&["sh", "-c", "echo -n 'registry: '"]),
        argv(&["npm", "config", "get", "registry"]),
        argv(&["npm", npm_install, "--no-audit", "--include=dev"]),
    ]
}

pub struct Installer {
    work_dir: PathBuf,
    install_cmd: String,
    env: Vec<(String, String)>,
    reporter: Reporter,
    probe: RepoProbe,
}

impl Installer {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        install_cmd: String,
        env: Vec<(String, String)>,
        reporter: Reporter,
    ) -> Self {
        let work_dir = work_dir.into();
        let probe = RepoProbe::detect(&work_dir);

        Self {
            work_dir,
            install_cmd,
            env,
            reporter,
            probe,
        }
    }

    pub fn probe(&self) -> &RepoProbe {
        &self.probe
    }

    /// Provision declared runtimes with mise, installing the toolchain
    /// explicitly when the repo declares nothing for it.
    pub async fn install_runtime_dependencies(&self) -> Result<Vec<String>, InstallError> {
        self.reporter.add_step("mise install");

        Mise::ensure_installed(&self.reporter).await?;

        if let Ok(node_version) = std::env::var("NODE_VERSION") {
            if Mise::pin_legacy_node_version(&self.work_dir, &node_version)? {
                self.reporter
                    .add_line(&format!("pinned node {node_version} from NODE_VERSION"));
            }
        }

        Mise::install_local(&self.work_dir, &self.reporter, None).await?;
        let mut runtimes = Mise::list_local(&self.work_dir).await?;

        if let Some(runtime) = self.probe.runtime() {
            let declared = runtimes
                .iter()
                .any(|rt| rt.split('@').next() == Some(runtime));

            if !declared {
                Mise::install_local(&self.work_dir, &self.reporter, Some(runtime)).await?;
                runtimes.push(runtime.to_string());
            }
        }

        Ok(runtimes)
    }

    /// Print the toolchain version to the build log.
    pub async fn runtime_version(&self) -> Result<(), InstallError> {
        let (command, version_arg) = if self.probe.package_json.is_some() {
            if self.probe.is_bun {
                ("bun", "--version")
            } else {
                ("node", "--version")
            }
        } else if self.probe.has_go_mod {
            ("go", "version")
        } else {
            return Ok(());
        };

        self.reporter.add_step(&format!("{command} {version_arg}"));
        self.run(&[command.to_string(), version_arg.to_string()])
            .await
    }

    /// Run the install plan, retrying failed attempts with capped
    /// exponential backoff (1 s doubling to 30 s, five attempts, two
    /// minute ceiling).
    pub async fn install(&self) -> Result<(), InstallError> {
        let yarn_major = if self.probe.is_yarn && self.install_cmd.is_empty() {
            self.yarn_version().await
        } else {
            None
        };

        let plan = install_plan(&self.probe, &self.install_cmd, yarn_major);
        if plan.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut backoff = Duration::from_secs(1);

        for attempt in 1..=MAX_ATTEMPTS {
            match self.run_plan(&plan).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "install attempt failed: {e}");
                    self.reporter
                        .add_line(&format!("install attempt {attempt} failed: {e}"));
                }
            }

            if attempt == MAX_ATTEMPTS || started.elapsed() + backoff > INSTALL_CEILING {
                return Err(InstallError::Exhausted);
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }

        Err(InstallError::Exhausted)
    }

    async fn run_plan(&self, plan: &[PlannedCommand]) -> Result<(), InstallError> {
        for command in plan {
            self.reporter.add_step(&command.join(" "));
            self.run(command).await?;
        }
        Ok(())
    }

    async fn run(&self, argv: &[String]) -> Result<(), InstallError> {
        let status = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.work_dir)
            .envs(self.env.iter().cloned())
            .stdout(Stdio::from(self.reporter.file()?))
            .stderr(Stdio::from(self.reporter.file()?))
            .status()
            .await?;

        if !status.success() {
            return Err(InstallError::CommandFailed(format!(
                "'{}' exited with {:?}",
                argv.join(" "),
                status.code()
            )));
        }
        Ok(())
    }

    async fn yarn_version(&self) -> Option<u32> {
        let output = tokio::process::Command::new("yarn")
            .arg("--version")
            .current_dir(&self.work_dir)
            .output()
            .await
            .ok()?;

        parse_yarn_major(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_yarn_major(raw: &str) -> Option<u32> {
    raw.trim()
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}
