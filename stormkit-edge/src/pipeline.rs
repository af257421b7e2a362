//! Request pipeline.
//!
//! Orchestrates a tenant request: host resolution → admin proxy rules →
//! auth wall → redirect engine → static or dynamic dispatch, then response
//! finalization (snippets, headers, cache defaults, custom error pages)
//! and the asynchronous analytics side effect. Steps communicate through a
//! small sum type instead of exceptions: a step either lets the request
//! continue or produces the response.

use crate::admin::{AdminStore, ProxyRule};
use crate::analytics::{Batcher, build_record};
use crate::authwall::{self, AuthWallGate};
use crate::certs::CertManager;
use crate::hosts::{Host, HostResolver, InternalEndpoint, Resolution};
use crate::html;
use crate::imageopt::{ImageOptimizer, ImageQuery};
use crate::invoker::{InvokeArgs, Invoker, ProcessPool};
use crate::redirects::{self, RedirectAction};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use stormkit_core::{
    AppConfig, HostingRecord, LogLine, Snippet, SnippetAnchor, format_http_date, parse_http_date,
};
use stormkit_storage::{GetFileArgs, ObjectStore};

/// An incoming request, already lifted out of the HTTP stack.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub method: String,
    pub scheme: String,
    /// Raw `Host` header.
    pub host: String,
    pub path: String,
    /// Raw query string, without `?`.
    pub query: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub remote_ip: String,
}

impl PipelineRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then_some(value)
        })
    }

    pub fn url(&self) -> String {
        let query = if self.query.is_empty() {
            String::new()
        } else {
            format!("?{}", self.query)
        };
        format!("{}://{}{}{query}", self.scheme, self.host, self.path)
    }

    /// Proxy-aware client address: first `X-Forwarded-For` entry, falling
    /// back to the socket address.
    pub fn client_ip(&self) -> String {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.remote_ip.clone())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl PipelineResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn html(status: u16, body: String) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            "content-type".to_string(),
            "text/html; charset=utf-8".to_string(),
        );
        response.body = body.into_bytes();
        response
    }

    pub fn redirect(status: u16, location: String) -> Self {
        let mut response = Self::new(status);
        response.headers.insert("location".to_string(), location);
        response
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

pub struct Pipeline {
    pub resolver: Arc<HostResolver>,
    pub admin: Arc<AdminStore>,
    pub store: ObjectStore,
    pub invoker: Invoker,
    pub pool: Arc<ProcessPool>,
    pub optimizer: ImageOptimizer,
    pub authwall: Arc<AuthWallGate>,
    pub batcher: Arc<Batcher>,
    pub certs: Option<Arc<CertManager>>,
    /// Serve the admin UI from this directory on the App host, when set.
    pub ui_dir: Option<PathBuf>,
    pub dev_mode: bool,
    pub server_header_off: bool,
    pub proxy_client: reqwest::Client,
}

impl Pipeline {
    pub async fn handle(&self, mut request: PipelineRequest) -> PipelineResponse {
        // ACME HTTP-01 answers are served for any host, before resolution.
        if let Some(token) = request.path.strip_prefix("/.well-known/acme-challenge/") {
            if let Some(manager) = &self.certs {
                if let Some(key_auth) = manager.challenge_response(token) {
                    let mut response = PipelineResponse::new(200);
                    response
                        .headers
                        .insert("content-type".to_string(), "text/plain".to_string());
                    response.body = key_auth.into_bytes();
                    return response;
                }
            }
            return PipelineResponse::new(404);
        }

        let host = match self.resolver.resolve(&request.host).await {
            Resolution::Proxy(rule) => return self.proxy_rule(&request, &rule).await,
            Resolution::Internal(endpoint) => return self.internal(endpoint, &request).await,
            Resolution::Tenant(host) => host,
            Resolution::NotFound => {
                let app_url = self.admin.config().app_url("/");
                return PipelineResponse::html(404, html::not_found(&app_url));
            }
        };

        let original_path = request.path.clone();

        // Auth wall short-circuits before anything is served.
        if authwall::requires_session(&host.config, host.is_stormkit_subdomain)
            && !self
                .authwall
                .has_valid_session(request.header("cookie"), host.config.env_id)
        {
            let api_url = self.admin.config().api_url("");
            let page = self
                .authwall
                .login_page(&api_url, host.config.env_id, &request.url())
                .await;
            return PipelineResponse::html(200, page);
        }

        // Redirect engine: rewrites continue, everything else returns.
        match redirects::evaluate(
            &host.config,
            &request.scheme,
            &host.name,
            &request.path,
            &request.query,
        ) {
            Some(RedirectAction::Rewrite { path }) => request.path = path,
            Some(RedirectAction::Redirect { location, status }) => {
                return PipelineResponse::redirect(status, location);
            }
            Some(RedirectAction::Proxy {
                target,
                fixed_status,
            }) => {
                let mut response = self.proxy_pass(&request, &target, &HashMap::new()).await;
                if response.status == 404 {
                    // A proxied 404 on a resolved host serves the tenant's
                    // 404 page, and its bandwidth still counts.
                    let response = self.not_found(&host).await;
                    self.ship_artifacts(
                        &host,
                        &request,
                        &original_path,
                        &response,
                        false,
                        Vec::new(),
                        false,
                    );
                    return response;
                }
                if fixed_status {
                    response.status = 200;
                }
                return response;
            }
            Some(RedirectAction::NotFound) => {
                let response = self.not_found(&host).await;
                self.ship_artifacts(
                    &host,
                    &request,
                    &original_path,
                    &response,
                    false,
                    Vec::new(),
                    false,
                );
                return response;
            }
            None => {}
        }

        // Dispatch and finalize.
        let mut function_invoked = false;
        let mut logs: Vec<LogLine> = Vec::new();

        let mut response = match host.config.resolve_static(&request.path) {
            Some(_) => self.serve_static(&host, &request).await,
            None => {
                self.serve_dynamic(&host, &request, &mut function_invoked, &mut logs)
                    .await
            }
        };

        self.inject_snippets(&host.config, &original_path, &mut response);
        self.inject_headers(&host, &mut response);
        self.ship_artifacts(
            &host,
            &request,
            &original_path,
            &response,
            function_invoked,
            logs,
            true,
        );

        response
    }

    /// Admin-configured proxy rule: forward upstream with the rule's
    /// headers injected, stream the response back.
    async fn proxy_rule(&self, request: &PipelineRequest, rule: &ProxyRule) -> PipelineResponse {
        let query = if request.query.is_empty() {
            String::new()
        } else {
            format!("?{}", request.query)
        };
        let target = if rule.target.contains("://") {
            format!("{}{}{query}", rule.target.trim_end_matches('/'), request.path)
        } else {
            format!(
                "{}://{}{}{query}",
                request.scheme, rule.target, request.path
            )
        };

        self.proxy_pass(request, &target, &rule.headers).await
    }

    async fn internal(
        &self,
        endpoint: InternalEndpoint,
        request: &PipelineRequest,
    ) -> PipelineResponse {
        match endpoint {
            InternalEndpoint::Health => PipelineResponse::html(200, "OK".to_string()),
            InternalEndpoint::Api => self.internal_api(request).await,
            InternalEndpoint::App => self.serve_ui(request).await,
        }
    }

    /// The slice of the internal API this binary answers: the auth-wall
    /// login endpoint. The full CRUD surface lives elsewhere.
    async fn internal_api(&self, request: &PipelineRequest) -> PipelineResponse {
        if request.method == "POST" && request.path == "/auth-wall/login" {
            let form: HashMap<String, String> = parse_form(&request.body);
            let login = authwall::LoginForm {
                email: form.get("email").cloned().unwrap_or_default(),
                password: form.get("password").cloned().unwrap_or_default(),
                token: form.get("token").cloned().unwrap_or_default(),
                env_id: form
                    .get("envId")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                referrer: form.get("referrer").cloned().unwrap_or_default(),
            };

            return match self.authwall.handle_login(login).await {
                authwall::LoginOutcome::Success { cookie, redirect_to } => {
                    let mut response = PipelineResponse::redirect(302, redirect_to);
                    response.headers.insert("set-cookie".to_string(), cookie);
                    response
                }
                authwall::LoginOutcome::Failure { redirect_to } => {
                    PipelineResponse::redirect(302, redirect_to)
                }
            };
        }

        PipelineResponse::html(404, html::not_found(""))
    }

    /// Serve the admin UI directory with an index.html fallback.
    async fn serve_ui(&self, request: &PipelineRequest) -> PipelineResponse {
        let Some(ui_dir) = &self.ui_dir else {
            return PipelineResponse::html(404, html::not_found(""));
        };

        let relative = request.path.trim_start_matches('/');
        let candidate = if relative.is_empty() {
            ui_dir.join("index.html")
        } else {
            ui_dir.join(relative)
        };

        let path = if candidate.is_file() {
            candidate
        } else {
            ui_dir.join("index.html")
        };

        match tokio::fs::read(&path).await {
            Ok(content) => {
                let mut response = PipelineResponse::new(200);
                response.headers.insert(
                    "content-type".to_string(),
                    stormkit_storage::content_type_for(&path.to_string_lossy()).to_string(),
                );
                response.body = content;
                response
            }
            Err(_) => PipelineResponse::html(404, html::not_found("")),
        }
    }

    async fn serve_static(&self, host: &Host, request: &PipelineRequest) -> PipelineResponse {
        let config = &host.config;
        let Some(meta) = config.resolve_static(&request.path) else {
            return self.not_found(host).await;
        };

        let mut headers: HashMap<String, String> = meta
            .headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();

        // If-Modified-Since wins; ETag is consulted only without it.
        let mut not_modified = false;
        let ims = request.header("if-modified-since");
        if let (Some(ims), Some(updated_at)) = (ims, config.updated_at) {
            if let Some(since) = parse_http_date(ims) {
                let last_modified = updated_at.replace_nanosecond(0).unwrap_or(updated_at);
                not_modified = last_modified <= since;
            }
        }
        if ims.is_none() {
            if let Some(inm) = request.header("if-none-match") {
                not_modified = headers.get("etag").is_some_and(|etag| etag == inm);
            }
        }

        if !headers.contains_key("cache-control") {
            let value = if headers
                .get("content-type")
                .is_some_and(|ct| ct.starts_with("text/html"))
            {
                "no-cache, must-revalidate"
            } else {
                "public, max-age=86400"
            };
            headers.insert("cache-control".to_string(), value.to_string());
        }

        if !headers.contains_key("last-modified") {
            if let Some(updated_at) = config.updated_at {
                headers.insert("last-modified".to_string(), format_http_date(updated_at));
            }
        }

        if not_modified {
            return PipelineResponse {
                status: 304,
                headers,
                body: Vec::new(),
            };
        }

        let should_optimize = headers
            .get("content-type")
            .is_some_and(|ct| ct.starts_with("image"))
            && request.query_param("size").is_some();

        let file_name = meta.file_name.clone();

        if should_optimize {
            let size = request.query_param("size").unwrap_or_default();
            if let Some(cached) = self
                .optimizer
                .cached(config.deployment_id, size, &file_name)
                .await
            {
                return PipelineResponse {
                    status: 200,
                    headers,
                    body: cached,
                };
            }
        }

        let fetched = self
            .store
            .get_file(GetFileArgs {
                location: config.storage_location.clone(),
                file_name: file_name.clone(),
                deployment_id: config.deployment_id,
            })
            .await;

        let file = match fetched {
            Ok(Some(file)) => file,
            Ok(None) => return self.not_found(host).await,
            Err(e) => return self.error_page(host, &e.to_string()).await,
        };

        if !headers.contains_key("content-type") {
            headers.insert("content-type".to_string(), file.content_type.clone());
        }

        let body = if should_optimize {
            let size = request.query_param("size").unwrap_or_default().to_string();
            let query = ImageQuery::parse(&size, request.query_param("smart"));
            self.optimizer
                .optimize(config.deployment_id, &size, &file_name, query, file.content)
                .await
        } else {
            file.content
        };

        PipelineResponse {
            status: 200,
            headers,
            body,
        }
    }

    async fn serve_dynamic(
        &self,
        host: &Host,
        request: &PipelineRequest,
        function_invoked: &mut bool,
        logs: &mut Vec<LogLine>,
    ) -> PipelineResponse {
        let config = &host.config;

        let mut arn = if !config.function_location.is_empty() {
            config.function_location.clone()
        } else {
            config.api_location.clone()
        };

        if !config.api_location.is_empty()
            && !config.api_path_prefix.is_empty()
            && request.path.starts_with(&config.api_path_prefix)
        {
            arn = config.api_location.clone();
        }

        if arn.is_empty() {
            return self.not_found(host).await;
        }

        let batcher = self.batcher.clone();
        let record_base = self.hosting_record_base(host);
        let log_queue: crate::invoker::LogQueue = Arc::new(move |log: LogLine| {
            let mut record = record_base.clone();
            record.logs = vec![log];
            batcher.enqueue(record);
        });

        let args = InvokeArgs {
            arn,
            method: request.method.clone(),
            url: request.url(),
            path: request.path.clone(),
            query: parse_query_multi(&request.query),
            headers: request.headers.clone(),
            body: request.body.clone(),
            host_name: host.name.clone(),
            app_id: config.app_id,
            env_id: config.env_id,
            deployment_id: config.deployment_id,
            command: config.server_cmd.clone(),
            env_variables: config.env_variables.clone(),
            is_published: config.is_published(),
            capture_logs: true,
            log_queue: Some(log_queue),
            context: serde_json::json!({ "apiPrefix": config.api_path_prefix }),
        };

        *function_invoked = true;

        match self.invoker.invoke(&self.pool, args).await {
            Ok(result) => {
                logs.extend(result.logs.clone());
                PipelineResponse {
                    status: result.status_code,
                    headers: result.headers,
                    body: result.body,
                }
            }
            Err(e) => self.error_page(host, &e.to_string()).await,
        }
    }

    /// Custom 404 (error file, `/404.html`, `/500.html`, `/error.html`) or
    /// the built-in page.
    async fn not_found(&self, host: &Host) -> PipelineResponse {
        if let Some(page) = self.custom_error_page(host, 404).await {
            return page;
        }
        let app_url = self.admin.config().app_url("/");
        PipelineResponse::html(404, html::not_found(&app_url))
    }

    async fn error_page(&self, host: &Host, message: &str) -> PipelineResponse {
        if let Some(page) = self.custom_error_page(host, 500).await {
            return page;
        }

        let config = &host.config;
        let logs_url = self.admin.config().runtime_logs_url(
            config.app_id,
            config.env_id,
            config.deployment_id.0,
        );
        PipelineResponse::html(500, html::server_error(message, &logs_url))
    }

    async fn custom_error_page(&self, host: &Host, status: u16) -> Option<PipelineResponse> {
        let meta = host.config.error_page()?;

        let file = self
            .store
            .get_file(GetFileArgs {
                location: host.config.storage_location.clone(),
                file_name: meta.file_name.clone(),
                deployment_id: host.config.deployment_id,
            })
            .await
            .ok()??;

        let mut headers: HashMap<String, String> = meta
            .headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        headers.insert("content-type".to_string(), file.content_type);

        Some(PipelineResponse {
            status,
            headers,
            body: file.content,
        })
    }

    /// Transparent proxy to an absolute target, used by both admin proxy
    /// rules and redirect-engine proxy rules.
    async fn proxy_pass(
        &self,
        request: &PipelineRequest,
        target: &str,
        extra_headers: &HashMap<String, String>,
    ) -> PipelineResponse {
        let method: reqwest::Method = request.method.parse().unwrap_or(reqwest::Method::GET);

        let mut upstream = self.proxy_client.request(method, target);
        for (name, value) in &request.headers {
            if name == "host" {
                continue;
            }
            upstream = upstream.header(name, value);
        }
        for (name, value) in extra_headers {
            upstream = upstream.header(name, value);
        }
        upstream = upstream
            .header("x-forwarded-host", &request.host)
            .header("x-forwarded-proto", &request.scheme);

        let sent = upstream.body(request.body.clone()).send().await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(target, "proxy upstream unreachable: {e}");
                return PipelineResponse::html(502, html::server_error(&e.to_string(), ""));
            }
        };

        let status = response.status().as_u16();
        let mut headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        headers.remove("connection");
        headers.remove("keep-alive");
        headers.remove("transfer-encoding");

        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();

        PipelineResponse {
            status,
            headers,
            body,
        }
    }

    /// Inject admin snippets into HTML bodies at their four anchors.
    /// Skipped for encoded bodies; inserting the same snippet twice is a
    /// no-op.
    fn inject_snippets(
        &self,
        config: &AppConfig,
        _original_path: &str,
        response: &mut PipelineResponse,
    ) {
        if config.snippets.is_empty() {
            return;
        }
        let is_html = response
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("text/html"));
        if !is_html || response.header("content-encoding").is_some() {
            return;
        }

        let Ok(mut body) = String::from_utf8(std::mem::take(&mut response.body)) else {
            return;
        };

        for snippet in &config.snippets {
            body = inject_snippet(body, snippet);
        }

        response.body = body.into_bytes();
    }

    fn inject_headers(&self, host: &Host, response: &mut PipelineResponse) {
        response.headers.insert(
            "x-sk-version".to_string(),
            host.config.deployment_id.to_string(),
        );

        if !self.server_header_off {
            response
                .headers
                .insert("server".to_string(), "Stormkit".to_string());
        }

        if host.is_stormkit_subdomain && !response.headers.contains_key("x-robots-tag") {
            response
                .headers
                .insert("x-robots-tag".to_string(), "noindex".to_string());
        }

        if !response.headers.contains_key("content-type") {
            response.headers.insert(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            );
        }
    }

    fn hosting_record_base(&self, host: &Host) -> HostingRecord {
        HostingRecord {
            app_id: host.config.app_id,
            env_id: host.config.env_id,
            deployment_id: host.config.deployment_id,
            host_name: host.name.clone(),
            billing_user_id: host.config.billing_user_id,
            ..Default::default()
        }
    }

    /// Fire-and-forget the hosting record for a served response. Analytics
    /// sampling only happens on the dispatch tail; short-circuit 404s ship
    /// bandwidth and nothing else.
    #[allow(clippy::too_many_arguments)]
    fn ship_artifacts(
        &self,
        host: &Host,
        request: &PipelineRequest,
        original_path: &str,
        response: &PipelineResponse,
        function_invoked: bool,
        logs: Vec<LogLine>,
        include_analytics: bool,
    ) {
        let analytics = (include_analytics
            && response
                .header("content-type")
                .is_some_and(|ct| ct.starts_with("text/html")))
        .then(|| {
            build_record(
                host,
                response.status,
                original_path,
                &request.client_ip(),
                request.header("referer"),
                request.header("user-agent"),
                request.header("x-requested-with"),
                self.dev_mode,
            )
        })
        .flatten();

        let headers_bytes = stormkit_storage::headers_size(&response.headers);

        let mut record = self.hosting_record_base(host);
        record.function_invoked = function_invoked;
        record.logs = logs;
        record.analytics = analytics;
        record.total_bandwidth = response.body.len() as i64 + headers_bytes;

        self.batcher.enqueue(record);
    }
}

/// Insert a snippet at its anchor, once. Bodies missing the anchor token
/// are returned unchanged, as are bodies that already contain the snippet.
fn inject_snippet(body: String, snippet: &Snippet) -> String {
    if snippet.content.is_empty() || body.contains(&snippet.content) {
        return body;
    }

    match snippet.anchor {
        SnippetAnchor::HeadPrepend => insert_after_open_tag(body, "<head", &snippet.content),
        SnippetAnchor::BodyPrepend => insert_after_open_tag(body, "<body", &snippet.content),
        SnippetAnchor::HeadAppend => insert_before(body, "</head>", &snippet.content),
        SnippetAnchor::BodyAppend => insert_before(body, "</body>", &snippet.content),
    }
}

/// Insert right after the opening tag, tolerating attributes on the tag.
fn insert_after_open_tag(body: String, tag_start: &str, content: &str) -> String {
    let Some(start) = body.find(tag_start) else {
        return body;
    };
    let Some(end) = body[start..].find('>') else {
        return body;
    };

    let index = start + end + 1;
    format!("{}{}{}", &body[..index], content, &body[index..])
}

fn insert_before(body: String, token: &str, content: &str) -> String {
    match body.find(token) {
        Some(index) => format!("{}{}{}", &body[..index], content, &body[index..]),
        None => body,
    }
}

fn parse_form(body: &[u8]) -> HashMap<String, String> {
    let raw = String::from_utf8_lossy(body);
    raw.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), url_decode(value)))
        })
        .collect()
}

fn url_decode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                out.push(' ');
                index += 1;
            }
            b'%' if index + 3 <= bytes.len() => {
                match u8::from_str_radix(&value[index + 1..index + 3], 16) {
                    Ok(byte) => {
                        out.push(byte as char);
                        index += 3;
                    }
                    Err(_) => {
                        out.push('%');
                        index += 1;
                    }
                }
            }
            b => {
                out.push(b as char);
                index += 1;
            }
        }
    }

    out
}

fn parse_query_multi(query: &str) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminConfig;
    use crate::authwall::LoginBackend;
    use crate::hosts::ConfigSource;
    use std::collections::HashMap;
    use stormkit_core::{DeploymentId, StaticFileMeta};
    use stormkit_storage::{Kv, LocalStore};
    use tempfile::TempDir;
    use time::macros::datetime;

    struct Fixture {
        pipeline: Pipeline,
        kv: Kv,
        _temp: TempDir,
    }

    fn fixture(configure: impl FnOnce(&mut AppConfig, &std::path::Path)) -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage_root = temp.path().join("deployment-7").join("client");
        std::fs::create_dir_all(&storage_root).unwrap();

        let mut config = AppConfig {
            app_id: 1,
            env_id: 2,
            deployment_id: DeploymentId(7),
            domain_id: 9,
            storage_location: format!("local:{}", storage_root.display()),
            updated_at: Some(datetime!(2023-11-20 14:05:44 UTC)),
            ..Default::default()
        };
        configure(&mut config, &storage_root);

        let admin = AdminStore::new(|| AdminConfig::default());
        let resolver = HostResolver::new(
            admin.clone(),
            ConfigSource::Static(HashMap::from([(
                "www.stormkit.io".to_string(),
                config,
            )])),
        );

        let kv = Kv::in_memory();
        let pipeline = Pipeline {
            resolver,
            admin,
            store: ObjectStore::Local(LocalStore::new(temp.path())),
            invoker: Invoker::LocalOnly,
            pool: Arc::new(ProcessPool::new()),
            optimizer: ImageOptimizer::new(kv.clone()),
            authwall: Arc::new(AuthWallGate::new(
                b"secret".to_vec(),
                kv.clone(),
                LoginBackend::Static(HashMap::new()),
            )),
            batcher: Batcher::start(kv.clone(), "records".to_string()),
            certs: None,
            ui_dir: None,
            dev_mode: false,
            server_header_off: false,
            proxy_client: reqwest::Client::new(),
        };

        Fixture {
            pipeline,
            kv,
            _temp: temp,
        }
    }

    fn add_file(config: &mut AppConfig, root: &std::path::Path, path: &str, content: &[u8]) {
        add_file_with_headers(config, root, path, content, &[]);
    }

    fn add_file_with_headers(
        config: &mut AppConfig,
        root: &std::path::Path,
        path: &str,
        content: &[u8],
        headers: &[(&str, &str)],
    ) {
        let relative = path.trim_start_matches('/');
        let full = root.join(relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();

        let mut header_map: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        header_map
            .entry("content-type".to_string())
            .or_insert_with(|| stormkit_storage::content_type_for(path).to_string());

        config.static_files.insert(
            path.to_string(),
            StaticFileMeta {
                file_name: path.to_string(),
                headers: header_map,
            },
        );
    }

    fn get(path_and_query: &str) -> PipelineRequest {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        PipelineRequest {
            method: "GET".to_string(),
            scheme: "https".to_string(),
            host: "www.stormkit.io".to_string(),
            path: path.to_string(),
            query: query.to_string(),
            remote_ip: "203.0.113.5".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_static_file_served_with_injected_headers() {
        let fx = fixture(|config, root| {
            add_file(config, root, "/index.html", b"<html><body>hi</body></html>");
        });

        let response = fx.pipeline.handle(get("/")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"<html><body>hi</body></html>");
        assert_eq!(response.headers.get("x-sk-version").unwrap(), "7");
        assert_eq!(response.headers.get("server").unwrap(), "Stormkit");
        assert_eq!(
            response.headers.get("cache-control").unwrap(),
            "no-cache, must-revalidate"
        );
        assert_eq!(
            response.headers.get("last-modified").unwrap(),
            "Mon, 20 Nov 2023 14:05:44 GMT"
        );
    }

    #[tokio::test]
    async fn test_conditional_get_if_modified_since_wins() {
        // Deployment updated 2023-11-20; the client cached on 2023-12-19.
        let fx = fixture(|config, root| {
            add_file_with_headers(
                config,
                root,
                "/some/url/index.html",
                b"cached content",
                &[("etag", "123")],
            );
        });

        let mut request = get("/some/url?w=1");
        request.headers.insert(
            "if-modified-since".to_string(),
            "Sat, 19 Dec 2023 11:25:44 GMT".to_string(),
        );

        let response = fx.pipeline.handle(request).await;
        assert_eq!(response.status, 304);
        assert!(response.body.is_empty());
        assert_eq!(
            response.headers.get("cache-control").unwrap(),
            "no-cache, must-revalidate"
        );
        assert_eq!(
            response.headers.get("last-modified").unwrap(),
            "Mon, 20 Nov 2023 14:05:44 GMT"
        );
    }

    #[tokio::test]
    async fn test_conditional_get_etag_only_without_ims() {
        let fx = fixture(|config, root| {
            add_file_with_headers(config, root, "/app.js", b"console.log(1)", &[("etag", "\"abc\"")]);
        });

        let mut request = get("/app.js");
        request
            .headers
            .insert("if-none-match".to_string(), "\"abc\"".to_string());
        let response = fx.pipeline.handle(request).await;
        assert_eq!(response.status, 304);

        // A stale ETag serves the content.
        let mut request = get("/app.js");
        request
            .headers
            .insert("if-none-match".to_string(), "\"old\"".to_string());
        let response = fx.pipeline.handle(request).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("cache-control").unwrap(),
            "public, max-age=86400"
        );
    }

    #[tokio::test]
    async fn test_unknown_host_gets_builtin_404() {
        let fx = fixture(|_, _| {});
        let mut request = get("/");
        request.host = "unknown.example.org".to_string();

        let response = fx.pipeline.handle(request).await;
        assert_eq!(response.status, 404);
        assert!(String::from_utf8_lossy(&response.body).contains("404"));
    }

    #[tokio::test]
    async fn test_custom_404_page_is_served() {
        let fx = fixture(|config, root| {
            add_file(config, root, "/404.html", b"<html>custom not found</html>");
        });

        let response = fx.pipeline.handle(get("/missing")).await;
        assert_eq!(response.status, 404);
        assert!(String::from_utf8_lossy(&response.body).contains("custom not found"));
    }

    #[tokio::test]
    async fn test_auth_wall_blocks_without_session() {
        let fx = fixture(|config, _| {
            config.auth_wall = stormkit_core::AuthWall::All;
        });

        let response = fx.pipeline.handle(get("/my-page?with=query")).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
        let body = String::from_utf8_lossy(&response.body);
        assert!(body.contains("auth-wall/login"));
        assert!(body.contains(r#"name="token""#));
    }

    #[tokio::test]
    async fn test_auth_wall_passes_with_session() {
        let fx = fixture(|config, root| {
            config.auth_wall = stormkit_core::AuthWall::All;
            add_file(config, root, "/index.html", b"private");
        });

        let cookie = fx.pipeline.authwall.session_cookie(2);
        let mut request = get("/");
        request.headers.insert(
            "cookie".to_string(),
            cookie.split(';').next().unwrap().to_string(),
        );

        let response = fx.pipeline.handle(request).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"private");
    }

    #[tokio::test]
    async fn test_redirect_rule_back_references() {
        let fx = fixture(|config, _| {
            config.redirects = vec![stormkit_core::RedirectRule {
                from: "/*/metrics/*/metric".to_string(),
                to: "/$1/charts/$2/chart".to_string(),
                status: 302,
                assets: false,
            }];
        });

        let mut request = get("/stormkitio/metrics/4391919/metric");
        request.scheme = "http".to_string();

        let response = fx.pipeline.handle(request).await;
        assert_eq!(response.status, 302);
        assert_eq!(
            response.headers.get("location").unwrap(),
            "http://www.stormkit.io/stormkitio/charts/4391919/chart"
        );
    }

    #[tokio::test]
    async fn test_rewrite_continues_to_static_manifest() {
        let fx = fixture(|config, root| {
            config.redirects = vec![stormkit_core::RedirectRule {
                from: "/old".to_string(),
                to: "/new.html".to_string(),
                status: 0,
                assets: false,
            }];
            add_file(config, root, "/new.html", b"<html>rewritten</html>");
        });

        let response = fx.pipeline.handle(get("/old")).await;
        assert_eq!(response.status, 200);
        assert!(String::from_utf8_lossy(&response.body).contains("rewritten"));
    }

    #[tokio::test]
    async fn test_image_variant_cap_serves_original() {
        let png = {
            let img = image::DynamicImage::new_rgb8(32, 32);
            let mut out = std::io::Cursor::new(Vec::new());
            img.write_to(&mut out, image::ImageFormat::Png).unwrap();
            out.into_inner()
        };
        let png_clone = png.clone();

        let fx = fixture(move |config, root| {
            add_file(config, root, "/image.png", &png_clone);
        });

        // Counter past the budget: the original bytes are served.
        fx.kv.set("7-/image.png", "6", None).await.unwrap();

        let response = fx.pipeline.handle(get("/image.png?size=10x10")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, png);
    }

    #[tokio::test]
    async fn test_snippet_injection_and_idempotence() {
        let fx = fixture(|config, root| {
            config.snippets = vec![Snippet {
                anchor: SnippetAnchor::HeadAppend,
                content: "<script>analytics()</script>".to_string(),
            }];
            add_file(
                config,
                root,
                "/index.html",
                b"<html><head><title>t</title></head><body>x</body></html>",
            );
        });

        let response = fx.pipeline.handle(get("/")).await;
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("<script>analytics()</script></head>"));

        // Injecting into an already injected body changes nothing.
        let snippet = Snippet {
            anchor: SnippetAnchor::HeadAppend,
            content: "<script>analytics()</script>".to_string(),
        };
        assert_eq!(inject_snippet(body.clone(), &snippet), body);
    }

    #[tokio::test]
    async fn test_snippets_skip_encoded_bodies() {
        let fx = fixture(|config, root| {
            config.snippets = vec![Snippet {
                anchor: SnippetAnchor::BodyAppend,
                content: "<script>x</script>".to_string(),
            }];
            add_file_with_headers(
                config,
                root,
                "/index.html",
                b"<html><body>compressed</body></html>",
                &[("content-encoding", "gzip")],
            );
        });

        let response = fx.pipeline.handle(get("/")).await;
        assert!(!String::from_utf8_lossy(&response.body).contains("<script>"));
    }

    #[tokio::test]
    async fn test_snippet_without_anchor_is_identity() {
        let snippet = Snippet {
            anchor: SnippetAnchor::HeadAppend,
            content: "<script>x</script>".to_string(),
        };
        let body = "plain text, no markup".to_string();
        assert_eq!(inject_snippet(body.clone(), &snippet), body);
    }

    #[tokio::test]
    async fn test_analytics_record_for_html_response() {
        let fx = fixture(|config, root| {
            add_file(config, root, "/index.html", b"<html>page</html>");
        });

        let mut request = get("/");
        request.headers.insert(
            "user-agent".to_string(),
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36".to_string(),
        );

        let _ = fx.pipeline.handle(request).await;

        // The batcher flushes on a one second tick.
        let mut payload = None;
        for _ in 0..60 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            payload = fx.kv.rpop("records").await.unwrap();
            if payload.is_some() {
                break;
            }
        }

        let record: HostingRecord = serde_json::from_str(&payload.unwrap()).unwrap();
        assert_eq!(record.app_id, 1);
        assert!(record.total_bandwidth > 0);
        let analytics = record.analytics.expect("analytics record expected");
        assert_eq!(analytics.request_path, "/");
        assert_eq!(analytics.status_code, 200);
    }

    #[tokio::test]
    async fn test_dev_subdomain_gets_noindex() {
        let temp = TempDir::new().unwrap();
        let storage_root = temp.path().join("deployment-7").join("client");
        std::fs::create_dir_all(&storage_root).unwrap();
        std::fs::write(storage_root.join("index.html"), b"<html></html>").unwrap();

        let mut config = AppConfig {
            deployment_id: DeploymentId(7),
            storage_location: format!("local:{}", storage_root.display()),
            ..Default::default()
        };
        config.static_files.insert(
            "/index.html".to_string(),
            StaticFileMeta {
                file_name: "/index.html".to_string(),
                headers: HashMap::from([(
                    "content-type".to_string(),
                    "text/html".to_string(),
                )]),
            },
        );

        let admin = AdminStore::new(|| AdminConfig {
            domain_config: crate::admin::DomainConfig {
                dev: "https://dev.stormkit.example".to_string(),
                ..Default::default()
            },
            ..Default::default()
        });
        let resolver = HostResolver::new(
            admin.clone(),
            ConfigSource::Static(HashMap::from([(
                "app--1.dev.stormkit.example".to_string(),
                config,
            )])),
        );

        let kv = Kv::in_memory();
        let pipeline = Pipeline {
            resolver,
            admin,
            store: ObjectStore::Local(LocalStore::new(temp.path())),
            invoker: Invoker::LocalOnly,
            pool: Arc::new(ProcessPool::new()),
            optimizer: ImageOptimizer::new(kv.clone()),
            authwall: Arc::new(AuthWallGate::new(
                b"secret".to_vec(),
                kv.clone(),
                LoginBackend::Static(HashMap::new()),
            )),
            batcher: Batcher::start(kv, "records".to_string()),
            certs: None,
            ui_dir: None,
            dev_mode: false,
            server_header_off: false,
            proxy_client: reqwest::Client::new(),
        };

        let mut request = get("/");
        request.host = "app--1.dev.stormkit.example".to_string();

        let response = pipeline.handle(request).await;
        assert_eq!(response.headers.get("x-robots-tag").unwrap(), "noindex");
    }

    #[tokio::test]
    async fn test_no_content_source_is_404() {
        let fx = fixture(|_, _| {});
        let response = fx.pipeline.handle(get("/anything")).await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_redirect_engine_404_ships_bandwidth_without_analytics() {
        let fx = fixture(|config, _| {
            config.redirects = vec![stormkit_core::RedirectRule {
                from: "/private/*".to_string(),
                to: String::new(),
                status: 0,
                assets: false,
            }];
        });

        let response = fx.pipeline.handle(get("/private/file")).await;
        assert_eq!(response.status, 404);

        let mut payload = None;
        for _ in 0..60 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            payload = fx.kv.rpop("records").await.unwrap();
            if payload.is_some() {
                break;
            }
        }

        let record: HostingRecord = serde_json::from_str(&payload.unwrap()).unwrap();
        assert!(record.total_bandwidth > 0);
        assert!(record.analytics.is_none());
        assert!(!record.function_invoked);
    }

    #[test]
    fn test_parse_query_multi() {
        let query = parse_query_multi("a=1&a=2&b=&c");
        assert_eq!(query["a"], vec!["1", "2"]);
        assert_eq!(query["b"], vec![""]);
        assert_eq!(query["c"], vec![""]);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut request = get("/");
        assert_eq!(request.client_ip(), "203.0.113.5");

        request.headers.insert(
            "x-forwarded-for".to_string(),
            "198.51.100.1, 203.0.113.5".to_string(),
        );
        assert_eq!(request.client_ip(), "198.51.100.1");
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a%20b+c"), "a b c");
        assert_eq!(url_decode("plain"), "plain");
        assert_eq!(url_decode("%zz"), "%zz");
    }
}
