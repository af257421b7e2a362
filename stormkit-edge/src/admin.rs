//! Admin configuration snapshot.
//!
//! A single process-wide, read-only view of instance configuration. Readers
//! grab an `Arc` under the lock and keep working with that snapshot;
//! invalidation (local or via the `invalidate-admin-cache` pub/sub channel)
//! nulls the cache so the next reader reloads from the authoritative
//! source and re-normalizes domain URLs.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use stormkit_storage::Kv;

pub const INVALIDATE_CHANNEL: &str = "invalidate-admin-cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignUpMode {
    On,
    #[default]
    Off,
    Waitlist,
}

/// Proxy rule for a configured hostname: requests are forwarded to
/// `target` with `headers` injected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRule {
    pub target: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Internal endpoint URLs, defaulted from `STORMKIT_*_URL` environment
/// variables on first load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub dev: String,
    #[serde(default)]
    pub health: String,
    #[serde(default)]
    pub webhooks: String,
}

impl DomainConfig {
    /// Strip trailing slashes and default the scheme to https.
    pub fn normalize(&mut self) {
        for url in [
            &mut self.api,
            &mut self.app,
            &mut self.dev,
            &mut self.health,
            &mut self.webhooks,
        ] {
            if url.is_empty() {
                continue;
            }
            let trimmed = url.trim_end_matches('/');
            *url = if trimmed.contains("//") {
                trimmed.to_string()
            } else {
                format!("https://{trimmed}")
            };
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    #[serde(default)]
    pub domain_config: DomainConfig,
    /// host → rule.
    #[serde(default)]
    pub proxy_rules: HashMap<String, ProxyRule>,
    #[serde(default = "default_sign_up_mode")]
    pub sign_up_mode: SignUpMode,
    /// Allow-list, or deny-list when the first entry starts with `!`.
    /// Modes are never mixed; validation is upstream.
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub is_enterprise: bool,
}

fn default_sign_up_mode() -> SignUpMode {
    SignUpMode::Off
}

impl AdminConfig {
    /// Load defaults from the `STORMKIT_*` environment.
    pub fn from_env() -> Self {
        let env = |name: &str| std::env::var(name).unwrap_or_default();

        let mut config = AdminConfig {
            domain_config: DomainConfig {
                api: env("STORMKIT_API_URL"),
                app: env("STORMKIT_APP_URL"),
                dev: env("STORMKIT_DEV_URL"),
                health: env("STORMKIT_HEALTH_URL"),
                webhooks: env("STORMKIT_WEBHOOKS_URL"),
            },
            ..Default::default()
        };
        config.domain_config.normalize();
        config
    }

    /// Effective sign-up mode. Self-hosted non-enterprise instances cannot
    /// run a waitlist, so it downgrades to off.
    pub fn sign_up_mode(&self) -> SignUpMode {
        if self.sign_up_mode == SignUpMode::Waitlist && !self.is_enterprise {
            SignUpMode::Off
        } else {
            self.sign_up_mode
        }
    }

    /// Whitelist check. Allow-list when no entry starts with `!`, deny-list
    /// when the first one does. Comparison is case-insensitive and matches
    /// either the full address or its domain.
    pub fn is_user_whitelisted(&self, email: &str) -> bool {
        if self.whitelist.is_empty() {
            return false;
        }

        let email = email.to_lowercase();
        let domain = email.rsplit('@').next().unwrap_or(&email);
        let deny_mode = self.whitelist[0].starts_with('!');

        let matches = |entry: &str| {
            let entry = entry.trim_start_matches('!').to_lowercase();
            email == entry || domain == entry
        };

        if deny_mode {
            !self.whitelist.iter().any(|e| matches(e))
        } else {
            self.whitelist.iter().any(|e| matches(e))
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        join_url(&self.domain_config.api, path)
    }

    pub fn app_url(&self, path: &str) -> String {
        join_url(&self.domain_config.app, path)
    }

    /// Deep link into the app UI for a deployment's runtime logs.
    pub fn runtime_logs_url(&self, app_id: u64, env_id: u64, deployment_id: u64) -> String {
        if self.domain_config.app.is_empty() {
            return String::new();
        }
        self.app_url(&format!(
            "/apps/{app_id}/environments/{env_id}/deployments/{deployment_id}/runtime-logs"
        ))
    }
}

fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        return String::new();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}

type Loader = dyn Fn() -> AdminConfig + Send + Sync;

/// Process-wide snapshot holder. Created once at startup and carried
/// through the handler state.
pub struct AdminStore {
    cached: RwLock<Option<Arc<AdminConfig>>>,
    loader: Box<Loader>,
}

impl AdminStore {
    pub fn new(loader: impl Fn() -> AdminConfig + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            cached: RwLock::new(None),
            loader: Box::new(loader),
        })
    }

    /// Current snapshot. Successive calls within one request observe the
    /// same snapshot as long as the caller holds the returned `Arc`.
    pub fn config(&self) -> Arc<AdminConfig> {
        if let Some(cached) = self.cached.read().as_ref() {
            return cached.clone();
        }

        let mut slot = self.cached.write();
        // Another reader may have reloaded while we waited for the lock.
        if let Some(cached) = slot.as_ref() {
            return cached.clone();
        }

        let mut config = (self.loader)();
        config.domain_config.normalize();
        let config = Arc::new(config);
        *slot = Some(config.clone());
        config
    }

    /// Drop the local snapshot; the next read reloads.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    /// Subscribe to the invalidation channel and null the cache on every
    /// message. Invalidation never blocks a request.
    pub fn watch_invalidation(self: &Arc<Self>, kv: Kv) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut rx = match kv.subscribe(INVALIDATE_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!("cannot subscribe to admin invalidation channel: {e}");
                    return;
                }
            };

            while rx.recv().await.is_some() {
                tracing::debug!("admin config invalidated via pub/sub");
                store.invalidate();
            }
        });
    }
}
