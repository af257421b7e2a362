use stormkit_edge::admin::{AdminConfig, AdminStore};
use stormkit_edge::analytics::Batcher;
use stormkit_edge::authwall::{AuthWallGate, LoginBackend};
use stormkit_edge::certs::{CertManager, CertManagerConfig, CertStorage, DnsProvider};
use stormkit_edge::hosts::{ConfigSource, HostResolver};
use stormkit_edge::imageopt::ImageOptimizer;
use stormkit_edge::invoker::{Invoker, ProcessPool, RemoteInvoker};
use stormkit_edge::pipeline::Pipeline;
use stormkit_edge::server::{self, EdgeConfig};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stormkit_storage::{Kv, LocalStore, ObjectStore, S3Config, S3Store};
use tracing_subscriber::EnvFilter;

/// Stormkit Edge - hosting edge for tenant deployments
#[derive(Parser)]
#[command(name = "stormkit-edge")]
#[command(version)]
#[command(about = "Stormkit Edge - TLS termination, host routing and deployment serving")]
pub struct Args {
    /// HTTP port
    #[arg(long, env = "STORMKIT_HTTP_PORT", default_value_t = 80)]
    pub http_port: u16,

    /// HTTPS port
    #[arg(long, env = "STORMKIT_HTTPS_PORT", default_value_t = 443)]
    pub https_port: u16,

    /// Disable TLS entirely (`false`, `0` and `off` all disable it)
    #[arg(long, env = "STORMKIT_HTTPS", default_value = "true")]
    pub https: String,

    /// ACME contact email
    #[arg(long, env = "STORMKIT_ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[arg(long)]
    pub acme_staging: bool,

    /// Managed wildcard root for dev subdomains (DNS-01)
    #[arg(long, env = "STORMKIT_DOMAIN")]
    pub domain: Option<String>,

    /// Redis address, e.g. redis://127.0.0.1:6379. Falls back to the
    /// in-memory store for single-node setups.
    #[arg(long, env = "STORMKIT_REDIS_ADDR")]
    pub redis_addr: Option<String>,

    /// Data directory: host config snapshots and local artifacts
    #[arg(long, env = "STORMKIT_DATA_DIR", default_value = "/var/lib/stormkit")]
    pub data_dir: PathBuf,

    /// Remote function service endpoint; local artifacts are executed
    /// directly when unset
    #[arg(long, env = "STORMKIT_FUNCTIONS_URL")]
    pub functions_url: Option<String>,

    /// Platform DNS API endpoint for DNS-01 challenges
    #[arg(long, env = "STORMKIT_DNS_API_URL")]
    pub dns_api_url: Option<String>,

    /// DNS zone id for the managed wildcard domain
    #[arg(long, env = "STORMKIT_DNS_ZONE_ID")]
    pub dns_zone_id: Option<String>,

    /// Secret used to sign auth-wall session tokens
    #[arg(long, env = "STORMKIT_SESSION_SECRET", default_value = "")]
    pub session_secret: String,

    /// KV list drained by the analytics worker
    #[arg(long, env = "STORMKIT_HOSTING_QUEUE", default_value = "hosting-records")]
    pub hosting_queue: String,

    /// Request wall clock in seconds
    #[arg(long, env = "STORMKIT_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Certificate renewal check interval in hours
    #[arg(long, default_value_t = 12)]
    pub renewal_interval_hours: u64,
}

fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

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
    let https = args.https.to_lowercase();
    let enable_https = !matches!(https.as_str(), "false" | "0" | "off");

    tracing::info!("Stormkit Edge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("HTTP port: {}", args.http_port);
    if enable_https {
        tracing::info!("HTTPS port: {}", args.https_port);
    }
    tracing::info!("Data directory: {}", args.data_dir.display());

    std::fs::create_dir_all(&args.data_dir)?;
    std::fs::create_dir_all(args.data_dir.join("hosts"))?;
    std::fs::create_dir_all(args.data_dir.join("deployments"))?;

    // Shared KV. Single-node setups run without Redis.
    let kv = match &args.redis_addr {
        Some(addr) => Kv::connect(addr).await?,
        None => {
            tracing::warn!("no redis address configured, using in-memory KV");
            Kv::in_memory()
        }
    };

    let admin = AdminStore::new(AdminConfig::from_env);
    admin.watch_invalidation(kv.clone());

    let resolver = HostResolver::with_internal(
        admin.clone(),
        ConfigSource::Dir(args.data_dir.join("hosts")),
        std::env::var("STORMKIT_API").map(|v| v != "off").unwrap_or(true),
        true,
    );
    resolver.watch_invalidation(kv.clone());

    let store = match std::env::var("STORMKIT_S3_ENDPOINT") {
        Ok(endpoint) => ObjectStore::S3(S3Store::new(S3Config {
            endpoint,
            region: std::env::var("STORMKIT_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: std::env::var("STORMKIT_S3_BUCKET").unwrap_or_else(|_| "stormkit".to_string()),
            access_key: std::env::var("STORMKIT_S3_ACCESS_KEY").unwrap_or_default(),
            secret_key: std::env::var("STORMKIT_S3_SECRET_KEY").unwrap_or_default(),
        })),
        Err(_) => ObjectStore::Local(LocalStore::new(args.data_dir.join("deployments"))),
    };

    let cert_storage = Arc::new(CertStorage::new(kv.clone()));
    let dns = match (&args.dns_api_url, &args.dns_zone_id) {
        (Some(base), Some(zone)) => Some(DnsProvider::new(base.clone(), zone.clone())),
        _ => None,
    };

    let certs = CertManager::new(
        CertManagerConfig {
            staging: args.acme_staging,
            email: args.acme_email.clone(),
            managed_wildcard: args.domain.clone().filter(|_| dns.is_some()),
            ..Default::default()
        },
        cert_storage,
        admin.clone(),
        resolver.clone(),
        dns,
    );

    if enable_https {
        if let Err(e) = certs.init().await {
            tracing::error!("failed to initialize ACME account: {e}");
            tracing::warn!("continuing without ACME - certificates must exist in storage");
        }

        let renewal = certs.clone();
        let interval = Duration::from_secs(args.renewal_interval_hours * 3600);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                tracing::info!("checking for certificates needing renewal...");
                let attempted = renewal.check_renewals().await;
                if attempted > 0 {
                    tracing::info!(attempted, "certificate renewals attempted");
                }
            }
        });
    }

    let invoker = match &args.functions_url {
        Some(base) => Invoker::Remote(RemoteInvoker::new(
            base.clone(),
            Duration::from_secs(args.request_timeout_secs),
        )),
        None => Invoker::LocalOnly,
    };

    let session_secret = if args.session_secret.is_empty() {
        tracing::warn!("STORMKIT_SESSION_SECRET is not set, generating an ephemeral secret");
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..32).map(|_| rng.r#gen::<u8>()).collect::<Vec<u8>>()
    } else {
        args.session_secret.clone().into_bytes()
    };

    let login_backend = match std::env::var("STORMKIT_API_URL") {
        Ok(base) if !base.is_empty() => LoginBackend::Http {
            base,
            client: reqwest::Client::new(),
        },
        _ => LoginBackend::Static(HashMap::new()),
    };

    let pool = Arc::new(ProcessPool::new());
    let pipeline = Arc::new(Pipeline {
        resolver,
        admin,
        store,
        invoker,
        pool: pool.clone(),
        optimizer: ImageOptimizer::new(kv.clone()),
        authwall: Arc::new(AuthWallGate::new(session_secret, kv.clone(), login_backend)),
        batcher: Batcher::start(kv, args.hosting_queue.clone()),
        certs: Some(certs.clone()),
        ui_dir: std::env::var("STORMKIT_UI_DIR").ok().map(PathBuf::from),
        dev_mode: cfg!(debug_assertions),
        server_header_off: std::env::var("STORMKIT_SERVER_HEADER")
            .is_ok_and(|v| v == "off"),
        proxy_client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?,
    });

    let edge_config = EdgeConfig {
        http_port: args.http_port,
        https_port: args.https_port,
        enable_https,
        request_timeout: Duration::from_secs(args.request_timeout_secs),
    };

    let serve = server::run(pipeline, enable_https.then(|| certs.clone()), edge_config);

    tokio::select! {
        result = serve => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down, killing managed services");
            pool.kill_all().await;
        }
    }

    Ok(())
}
