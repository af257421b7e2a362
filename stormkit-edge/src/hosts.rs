//! Host resolution.
//!
//! Maps the incoming `Host` header to what the pipeline should do with the
//! request: proxy it per an admin rule, hand it to an internal endpoint
//! (API/App/Health), or serve a tenant deployment. Tenant configs are
//! cached process-wide and invalidated over pub/sub when a deployment is
//! published.

use crate::admin::{AdminStore, ProxyRule};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use stormkit_core::AppConfig;
use stormkit_storage::Kv;

pub const INVALIDATE_CHANNEL: &str = "invalidate-host-cache";

/// A resolved tenant host.
#[derive(Clone)]
pub struct Host {
    pub name: String,
    pub is_stormkit_subdomain: bool,
    pub config: Arc<AppConfig>,
}

/// Internal (non-tenant) endpoints served by this binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalEndpoint {
    Api,
    App,
    Health,
}

/// What the pipeline should do with a request for a given host.
pub enum Resolution {
    Proxy(ProxyRule),
    Internal(InternalEndpoint),
    Tenant(Host),
    NotFound,
}

/// Where tenant configs come from. The authoring side is external; the
/// edge only reads snapshots.
pub enum ConfigSource {
    /// `<dir>/<host>.json` files, written by the deployment pipeline.
    Dir(PathBuf),
    /// Internal config service returning the snapshot as JSON.
    Http {
        base: String,
        client: reqwest::Client,
    },
    /// Fixed map, used by tests and single-tenant setups.
    Static(HashMap<String, AppConfig>),
}

impl ConfigSource {
    async fn fetch(&self, host: &str) -> Option<AppConfig> {
        match self {
            ConfigSource::Dir(dir) => {
                let path = dir.join(format!("{host}.json"));
                let raw = tokio::fs::read_to_string(path).await.ok()?;
                match serde_json::from_str(&raw) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::error!(host, "invalid host config snapshot: {e}");
                        None
                    }
                }
            }
            ConfigSource::Http { base, client } => {
                let url = format!("{base}/hosts/{host}/config");
                let response = client.get(&url).send().await.ok()?;
                if !response.status().is_success() {
                    return None;
                }
                response.json().await.ok()
            }
            ConfigSource::Static(map) => map.get(host).cloned(),
        }
    }
}

pub struct HostResolver {
    admin: Arc<AdminStore>,
    source: ConfigSource,
    cache: DashMap<String, Arc<AppConfig>>,
    serve_internal_api: bool,
    serve_internal_app: bool,
}

impl HostResolver {
    pub fn new(admin: Arc<AdminStore>, source: ConfigSource) -> Arc<Self> {
        Arc::new(Self {
            admin,
            source,
            cache: DashMap::new(),
            serve_internal_api: true,
            serve_internal_app: true,
        })
    }

    pub fn with_internal(
        admin: Arc<AdminStore>,
        source: ConfigSource,
        serve_internal_api: bool,
        serve_internal_app: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            admin,
            source,
            cache: DashMap::new(),
            serve_internal_api,
            serve_internal_app,
        })
    }

    /// Resolve a raw `Host` header value.
    pub async fn resolve(&self, host_header: &str) -> Resolution {
        let host = normalize_host(host_header);
        let admin = self.admin.config();

        // 1. Admin proxy rules win over everything.
        if let Some(rule) = admin.proxy_rules.get(&host) {
            return Resolution::Proxy(rule.clone());
        }
        if let Some(rule) = admin.proxy_rules.get(host_header) {
            return Resolution::Proxy(rule.clone());
        }

        // 2. Internal endpoints are not part of the tenant path.
        if let Some(endpoint) = self.internal_endpoint(&admin.domain_config, host_header) {
            return Resolution::Internal(endpoint);
        }

        // 3+4. Tenant lookup with the dev-subdomain flag.
        let is_dev = is_dev_subdomain(&admin.domain_config.dev, &host);
        match self.config_for(&host).await {
            Some(config) => Resolution::Tenant(Host {
                name: host,
                is_stormkit_subdomain: is_dev,
                config,
            }),
            None => Resolution::NotFound,
        }
    }

    /// Tenant config for a bare hostname, from cache or the source.
    pub async fn config_for(&self, host: &str) -> Option<Arc<AppConfig>> {
        if let Some(cached) = self.cache.get(host) {
            return Some(cached.clone());
        }

        let config = Arc::new(self.source.fetch(host).await?);
        self.cache.insert(host.to_string(), config.clone());
        Some(config)
    }

    fn internal_endpoint(
        &self,
        domains: &crate::admin::DomainConfig,
        host_header: &str,
    ) -> Option<InternalEndpoint> {
        let candidates = [
            (domains.health.as_str(), InternalEndpoint::Health, true),
            (domains.api.as_str(), InternalEndpoint::Api, self.serve_internal_api),
            (domains.app.as_str(), InternalEndpoint::App, self.serve_internal_app),
        ];

        let with_port = wo_scheme(host_header);
        let without_port = wo_port(with_port);

        for (url, endpoint, enabled) in candidates {
            if !enabled || url.is_empty() {
                continue;
            }
            let ep = wo_scheme(url);
            // Both with and without port must work.
            if ep == with_port || wo_port(ep) == without_port {
                return Some(endpoint);
            }
        }

        None
    }

    /// Drop one host (or the whole cache for `*`) on a pub/sub message.
    pub fn watch_invalidation(self: &Arc<Self>, kv: Kv) {
        let resolver = self.clone();
        tokio::spawn(async move {
            let mut rx = match kv.subscribe(INVALIDATE_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!("cannot subscribe to host invalidation channel: {e}");
                    return;
                }
            };

            while let Some(host) = rx.recv().await {
                if host == "*" {
                    resolver.cache.clear();
                } else {
                    resolver.cache.remove(&normalize_host(&host));
                }
                tracing::debug!(host, "host config invalidated");
            }
        });
    }
}

/// Lowercase and strip the port.
pub fn normalize_host(host_header: &str) -> String {
    wo_port(host_header).trim().to_lowercase()
}

/// Drop the scheme part of a URL-ish string.
fn wo_scheme(value: &str) -> &str {
    match value.split_once("//") {
        Some((_, rest)) => rest,
        None => value,
    }
}

/// Drop the `:port` suffix.
fn wo_port(value: &str) -> &str {
    value.split(':').next().unwrap_or(value)
}

/// Whether `host` sits under the managed dev domain. The dev domain is
/// configured as a URL whose host part is the wildcard root, e.g.
/// `https://dev.stormkit.example` matches `my-app--1.dev.stormkit.example`.
fn is_dev_subdomain(dev_url: &str, host: &str) -> bool {
    if dev_url.is_empty() {
        return false;
    }

    let root = wo_port(wo_scheme(dev_url)).to_lowercase();
    if root.is_empty() {
        return false;
    }

    host == root || host.ends_with(&format!(".{root}"))
}
