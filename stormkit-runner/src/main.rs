mod bundler;
mod deps;
mod headers_file;
mod installer;
mod mise;
mod redirects_file;
mod reporter;

use crate::bundler::{Bundler, BundlerOpts};
use crate::installer::Installer;
use crate::reporter::Reporter;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use stormkit_core::{ApiFile, CdnFile, DeploymentId, RedirectRule, StaticFileMeta};
use stormkit_storage::{Kv, LocalStore, ObjectStore, S3Config, S3Store, UploadArgs};
use tracing_subscriber::EnvFilter;

/// Stormkit Runner - builds a source tree into deployable artifacts
#[derive(Parser)]
#[command(name = "stormkit-runner")]
#[command(version)]
#[command(about = "Stormkit Runner - install, build, bundle and upload deployments")]
pub struct Args {
    /// Build working directory (the checked out source tree)
    #[arg(long)]
    pub work_dir: PathBuf,

    /// Repository root, when the work dir is a subdirectory
    #[arg(long)]
    pub repo_dir: Option<PathBuf>,

    #[arg(long)]
    pub app_id: u64,

    #[arg(long)]
    pub env_id: u64,

    #[arg(long)]
    pub deployment_id: u64,

    /// Hostname served by this deployment; used to write the host config
    /// snapshot and invalidate the edge cache
    #[arg(long)]
    pub host: Option<String>,

    /// Custom install command, overriding package-manager detection
    #[arg(long, default_value = "")]
    pub install_cmd: String,

    /// Build command, e.g. `npm run build`
    #[arg(long, default_value = "")]
    pub build_cmd: String,

    /// Long-running server command for the deployed app
    #[arg(long, default_value = "")]
    pub server_cmd: String,

    /// Explicit output folder
    #[arg(long, default_value = "")]
    pub dist_folder: String,

    /// Explicit server output folder
    #[arg(long, default_value = "")]
    pub server_folder: String,

    #[arg(long, default_value = "")]
    pub redirects_file: String,

    #[arg(long, default_value = "")]
    pub headers_file: String,

    /// Environment variables for install/build, KEY=VALUE
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Storage root for the local backend and host config snapshots
    #[arg(long, env = "STORMKIT_DATA_DIR", default_value = "/var/lib/stormkit")]
    pub data_dir: PathBuf,

    /// Redis address for edge cache invalidation
    #[arg(long, env = "STORMKIT_REDIS_ADDR")]
    pub redis_addr: Option<String>,
}

/// Everything the deployment produced, as written next to the artifacts
/// and merged into the host config snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentManifest {
    app_id: u64,
    env_id: u64,
    deployment_id: DeploymentId,
    storage_location: String,
    function_location: String,
    api_location: String,
    server_cmd: String,
    cdn_files: Vec<CdnFile>,
    api_files: Vec<ApiFile>,
    redirects: Vec<RedirectRule>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Stormkit Runner v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        app = args.app_id,
        deployment = args.deployment_id,
        "building {}",
        args.work_dir.display()
    );

    let repo_dir = args.repo_dir.clone().unwrap_or_else(|| args.work_dir.clone());
    let dist_dir = args.work_dir.join("stormkit-tmp");
    let reporter = Reporter::new(dist_dir.parent().unwrap_or(&args.work_dir).join(format!(
        "deployment-{}.log",
        args.deployment_id
    )))?;

    let env = build_env(&args.env);

    // Phase A: runtimes and dependencies.
    let installer = Installer::new(
        &args.work_dir,
        args.install_cmd.clone(),
        env.clone(),
        reporter.clone(),
    );

    let runtimes = installer.install_runtime_dependencies().await?;
    if !runtimes.is_empty() {
        tracing::info!(?runtimes, "provisioned runtimes");
    }
    installer.runtime_version().await?;
    installer.install().await?;

    // Build.
    if !args.build_cmd.is_empty() {
        reporter.add_step(&args.build_cmd);
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&args.build_cmd)
            .current_dir(&args.work_dir)
            .envs(env.iter().cloned())
            .stdout(Stdio::from(reporter.file()?))
            .stderr(Stdio::from(reporter.file()?))
            .status()
            .await?;

        if !status.success() {
            return Err(format!("build command failed with {:?}", status.code()).into());
        }
    }

    // Phase B: bundle + zip.
    let bundler = Bundler::new(
        BundlerOpts {
            work_dir: args.work_dir.clone(),
            repo_dir,
            dist_dir: dist_dir.clone(),
            dist_folder: args.dist_folder.clone(),
            server_folder: args.server_folder.clone(),
            server_cmd: args.server_cmd.clone(),
            redirects_file: args.redirects_file.clone(),
            headers_file: args.headers_file.clone(),
            package_json: installer.probe().package_json.clone(),
        },
        reporter.clone(),
    )?;

    let mut artifacts = bundler.bundle()?;
    bundler.parse_redirects(&mut artifacts)?;
    bundler.parse_headers(&mut artifacts)?;
    bundler.zip(&mut artifacts)?;

    // Upload.
    let store = object_store(&args);
    let upload = store
        .upload(UploadArgs {
            app_id: args.app_id,
            deployment_id: DeploymentId(args.deployment_id),
            client_zip: artifacts.client_zip.clone(),
            server_zip: artifacts.server_zip.clone(),
            api_zip: artifacts.api_zip.clone(),
            server_handler: artifacts.function_handler.clone(),
            api_handler: artifacts.api_handler.clone(),
        })
        .await?;

    let manifest = DeploymentManifest {
        app_id: args.app_id,
        env_id: args.env_id,
        deployment_id: DeploymentId(args.deployment_id),
        storage_location: upload.client.as_ref().map(|o| o.location.clone()).unwrap_or_default(),
        function_location: upload.server.as_ref().map(|o| o.location.clone()).unwrap_or_default(),
        api_location: upload.api.as_ref().map(|o| o.location.clone()).unwrap_or_default(),
        server_cmd: args.server_cmd.clone(),
        cdn_files: artifacts.cdn_files(),
        api_files: artifacts.api_files(),
        redirects: artifacts.redirects.clone(),
    };

    let manifest_path = dist_dir.join("manifest.json");
    std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;
    tracing::info!("manifest written to {}", manifest_path.display());

    // Publish the new snapshot and let the edge drop its caches.
    if let Some(host) = &args.host {
        write_host_config(&args.data_dir.join("hosts"), host, &manifest)?;

        if let Some(addr) = &args.redis_addr {
            match Kv::connect(addr).await {
                Ok(kv) => {
                    kv.publish(crate::HOST_INVALIDATE_CHANNEL, host).await?;
                    tracing::info!(host, "edge cache invalidated");
                }
                Err(e) => tracing::warn!("cannot reach redis for invalidation: {e}"),
            }
        }
    }

    tracing::info!(
        client = manifest.storage_location,
        server = manifest.function_location,
        api = manifest.api_location,
        "deployment complete"
    );

    Ok(())
}

/// The pub/sub channel the edge listens on for host cache invalidation.
pub const HOST_INVALIDATE_CHANNEL: &str = "invalidate-host-cache";

fn build_env(pairs: &[String]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = pairs
        .iter()
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect();

    for inherited in ["PATH", "HOME"] {
        if let Ok(value) = std::env::var(inherited) {
            env.push((inherited.to_string(), value));
        }
    }

    env
}

fn object_store(args: &Args) -> ObjectStore {
    match std::env::var("STORMKIT_S3_ENDPOINT") {
        Ok(endpoint) => ObjectStore::S3(S3Store::new(S3Config {
            endpoint,
            region: std::env::var("STORMKIT_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: std::env::var("STORMKIT_S3_BUCKET").unwrap_or_else(|_| "stormkit".to_string()),
            access_key: std::env::var("STORMKIT_S3_ACCESS_KEY").unwrap_or_default(),
            secret_key: std::env::var("STORMKIT_S3_SECRET_KEY").unwrap_or_default(),
        })),
        Err(_) => ObjectStore::Local(LocalStore::new(args.data_dir.join("deployments"))),
    }
}

/// Write the host's config snapshot atomically (write + rename), merging
/// the new deployment's locations and manifest.
fn write_host_config(
    hosts_dir: &std::path::Path,
    host: &str,
    manifest: &DeploymentManifest,
) -> std::io::Result<()> {
    use stormkit_core::AppConfig;

    std::fs::create_dir_all(hosts_dir)?;
    let path = hosts_dir.join(format!("{host}.json"));

    let mut config: AppConfig = std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    config.app_id = manifest.app_id;
    config.env_id = manifest.env_id;
    config.deployment_id = manifest.deployment_id;
    config.storage_location = manifest.storage_location.clone();
    config.function_location = manifest.function_location.clone();
    config.api_location = manifest.api_location.clone();
    config.server_cmd = manifest.server_cmd.clone();
    config.redirects = manifest.redirects.clone();
    config.updated_at = Some(time::OffsetDateTime::now_utc());

    config.static_files = manifest
        .cdn_files
        .iter()
        .map(|file| {
            (
                file.name.to_lowercase(),
                StaticFileMeta {
                    file_name: file.name.clone(),
                    headers: file.headers.clone(),
                },
            )
        })
        .collect();

    let serialized = serde_json::to_vec_pretty(&config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, &path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_env_parses_pairs() {
        let env = build_env(&["A=1".to_string(), "B=x=y".to_string(), "invalid".to_string()]);
        assert!(env.contains(&("A".to_string(), "1".to_string())));
        assert!(env.contains(&("B".to_string(), "x=y".to_string())));
        assert!(env.iter().any(|(k, _)| k == "PATH"));
    }

    #[test]
    fn test_write_host_config_is_atomic_and_merges() {
        let temp = TempDir::new().unwrap();
        let hosts = temp.path().join("hosts");

        let manifest = DeploymentManifest {
            app_id: 1,
            env_id: 2,
            deployment_id: DeploymentId(3),
            storage_location: "local:/srv/deployment-3/client".to_string(),
            cdn_files: vec![CdnFile {
                name: "/Index.html".to_string(),
                headers: Default::default(),
            }],
            ..Default::default()
        };

        write_host_config(&hosts, "www.example.org", &manifest).unwrap();

        let raw = std::fs::read_to_string(hosts.join("www.example.org.json")).unwrap();
        let config: stormkit_core::AppConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config.deployment_id, DeploymentId(3));
        // Manifest keys are lowercased for request-path lookup.
        assert!(config.static_files.contains_key("/index.html"));
        assert!(!hosts.join("www.example.org.json.tmp").exists());

        // A second deployment replaces the manifest.
        let manifest2 = DeploymentManifest {
            app_id: 1,
            env_id: 2,
            deployment_id: DeploymentId(4),
            ..Default::default()
        };
        write_host_config(&hosts, "www.example.org", &manifest2).unwrap();
        let raw = std::fs::read_to_string(hosts.join("www.example.org.json")).unwrap();
        let config: stormkit_core::AppConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config.deployment_id, DeploymentId(4));
        assert!(config.static_files.is_empty());
    }
}
