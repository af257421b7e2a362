//! Per-host deployment configuration.
//!
//! An [`AppConfig`] is a read-only snapshot produced by the deployment
//! pipeline and cached per hostname at the edge. It carries everything a
//! request needs: the static file manifest, redirect rules, function
//! locations and per-deployment policy flags.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;

/// Monotonic deployment identifier, unique per `(app, env)` pair.
///
/// Doubles as the ETag namespace and the image variant cache prefix, so the
/// string form matters: it is the bare integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DeploymentId(pub u64);

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl DeploymentId {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// Auth wall mode for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthWall {
    /// No gate.
    #[default]
    #[serde(rename = "")]
    Off,
    /// Every request requires a session.
    All,
    /// Only requests on the managed dev subdomain require a session.
    Dev,
}

/// A single entry of the static file manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticFileMeta {
    /// Object key relative to the deployment's client bucket.
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Headers recorded at build time (etag, custom headers).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A redirect/rewrite/proxy rule. Rules are evaluated in order; the first
/// match wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub from: String,
    pub to: String,
    /// 3xx makes this a redirect; 0 makes it a rewrite (same host) or a
    /// transparent proxy (absolute `to`); 200 proxies with a fixed status.
    #[serde(default)]
    pub status: u16,
    /// When set, the rewrite target is resolved against the static manifest.
    #[serde(default)]
    pub assets: bool,
}

/// Anchor position for an HTML snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetAnchor {
    HeadPrepend,
    HeadAppend,
    BodyPrepend,
    BodyAppend,
}

/// Admin-authored HTML fragment injected into served pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub anchor: SnippetAnchor,
    pub content: String,
}

/// Per-hostname snapshot of everything the request pipeline needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub app_id: u64,
    pub env_id: u64,
    pub deployment_id: DeploymentId,
    #[serde(default)]
    pub domain_id: u64,
    #[serde(default)]
    pub billing_user_id: u64,

    /// Tagged URI of the artifact bucket + prefix (`s3:bucket/prefix` or
    /// `local:/absolute/path`).
    #[serde(default)]
    pub storage_location: String,
    /// ARN of the serverless renderer, if any.
    #[serde(default)]
    pub function_location: String,
    /// ARN of the API handler, if any.
    #[serde(default)]
    pub api_location: String,
    /// Routing prefix that forces `api_location`.
    #[serde(default)]
    pub api_path_prefix: String,
    /// Shell command for long-running server mode.
    #[serde(default)]
    pub server_cmd: String,

    /// Lowercased request path → manifest entry.
    #[serde(default)]
    pub static_files: HashMap<String, StaticFileMeta>,
    #[serde(default)]
    pub redirects: Vec<RedirectRule>,
    #[serde(default)]
    pub snippets: Vec<Snippet>,
    /// Manifest path of the custom error page, e.g. `/oops.html`.
    #[serde(default)]
    pub error_file: String,
    #[serde(default)]
    pub auth_wall: AuthWall,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    /// Traffic percentage; a deployment is published when this is non-zero.
    #[serde(default)]
    pub percentage: u8,
    #[serde(default)]
    pub is_enterprise: bool,

    /// Custom certificate material. When both are set, automatic issuance
    /// is refused for this host.
    #[serde(default)]
    pub cert_key: String,
    #[serde(default)]
    pub cert_value: String,
}

impl AppConfig {
    pub fn is_published(&self) -> bool {
        self.percentage > 0
    }

    pub fn has_custom_certificate(&self) -> bool {
        !self.cert_key.is_empty() && !self.cert_value.is_empty()
    }

    /// Resolve a request path against the static manifest.
    ///
    /// Tries, in order: the exact (lowercased) path, `path + ".html"` and
    /// `path + "/index.html"`.
    pub fn resolve_static(&self, request_path: &str) -> Option<&StaticFileMeta> {
        if self.static_files.is_empty() {
            return None;
        }

        let path = request_path.to_lowercase();
        let trimmed = path.trim_end_matches('/');
        let lookup = [
            path.clone(),
            format!("{path}.html"),
            if trimmed.is_empty() {
                "/index.html".to_string()
            } else {
                format!("{trimmed}/index.html")
            },
        ];

        lookup
            .iter()
            .find_map(|candidate| self.static_files.get(candidate))
    }

    /// First manifest entry usable as an error page: the configured
    /// `error_file`, then `/404.html`, `/500.html` and `/error.html`.
    pub fn error_page(&self) -> Option<&StaticFileMeta> {
        let lookup = [
            self.error_file.as_str(),
            "/404.html",
            "/500.html",
            "/error.html",
        ];

        lookup
            .iter()
            .filter(|name| !name.is_empty())
            .find_map(|name| self.static_files.get(*name))
    }
}
