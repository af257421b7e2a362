//! Function invoker.
//!
//! Uniform `invoke(args) → result` over the two callable backends: a
//! remote function service, and local artifacts on disk (`local:` ARNs)
//! executed either as one-shot node handlers or as long-running services
//! through the process pool. The backend is chosen from the ARN scheme at
//! call time; the variants are constructed once at startup.

pub mod pool;
pub mod remote;

pub use pool::{PoolError, ProcessPool, ServerConfig};
pub use remote::RemoteInvoker;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use stormkit_core::{DeploymentId, LogLine};
use thiserror::Error;

/// Callback receiving captured logs as they arrive.
pub type LogQueue = Arc<dyn Fn(LogLine) + Send + Sync>;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid function response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Normalized request envelope handed to a callable unit.
#[derive(Clone, Default)]
pub struct InvokeArgs {
    pub arn: String,
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    pub path: String,
    pub query: HashMap<String, Vec<String>>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,

    pub host_name: String,
    pub app_id: u64,
    pub env_id: u64,
    pub deployment_id: DeploymentId,

    /// Shell command for long-running server mode; empty for serverless.
    pub command: String,
    pub env_variables: HashMap<String, String>,
    pub is_published: bool,

    pub capture_logs: bool,
    pub log_queue: Option<LogQueue>,
    /// Free-form invocation context, e.g. `{"apiPrefix": "/api"}`.
    pub context: serde_json::Value,
}

/// Result of an invocation, already decoded.
#[derive(Debug, Clone, Default)]
pub struct InvokeResult {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub logs: Vec<LogLine>,
    pub error_message: String,
    pub error_stack: String,
}

impl InvokeResult {
    /// Apply the status defaulting rules: 200 when unset, 500 when only an
    /// error message came back (the message becomes the body).
    pub fn normalize(mut self) -> Self {
        if !self.error_message.is_empty() && self.status_code == 0 {
            self.status_code = 500;
            self.body = self.error_message.clone().into_bytes();
        }
        if self.status_code == 0 {
            self.status_code = 200;
        }
        self
    }
}

/// Raw response shape produced by function runtimes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
    /// Alternative field carrying base64 content.
    #[serde(default)]
    pub buffer: String,
    #[serde(default)]
    pub headers: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_stack: String,
}

impl FunctionResponse {
    /// Convert to an [`InvokeResult`], decoding base64 bodies
    /// transparently.
    pub fn into_result(self) -> InvokeResult {
        let raw = if !self.buffer.is_empty() {
            self.buffer
        } else {
            self.body
        };

        let body = match BASE64.decode(&raw) {
            Ok(decoded) => decoded,
            Err(_) => raw.into_bytes(),
        };

        let headers = self
            .headers
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect();

        InvokeResult {
            status_code: if self.status_code > 0 {
                self.status_code
            } else {
                self.status
            },
            headers,
            body,
            logs: self.logs,
            error_message: self.error_message,
            error_stack: self.error_stack,
        }
    }
}

/// JSON request envelope sent to function runtimes.
pub fn request_envelope(args: &InvokeArgs) -> serde_json::Value {
    serde_json::json!({
        "method": args.method,
        "url": args.url,
        "path": args.path,
        "body": BASE64.encode(&args.body),
        "query": args.query,
        "headers": args.headers,
        "context": args.context,
    })
}

/// The invoker over both backends.
pub enum Invoker {
    Remote(RemoteInvoker),
    LocalOnly,
}

impl Invoker {
    /// Dispatch on the ARN scheme: `local:` runs from disk, anything else
    /// goes to the remote function service.
    pub async fn invoke(
        &self,
        pool: &ProcessPool,
        args: InvokeArgs,
    ) -> Result<InvokeResult, InvokeError> {
        if let Some(rest) = args.arn.strip_prefix("local:") {
            return invoke_local(pool, rest.to_string(), args).await;
        }

        match self {
            Invoker::Remote(remote) => remote.invoke(&args).await,
            Invoker::LocalOnly => Err(InvokeError::InvalidResponse(format!(
                "no remote backend configured for arn {}",
                args.arn
            ))),
        }
    }
}

/// Split `"<path>:<handler>"`; a missing handler yields the path itself.
pub(crate) fn parse_function_location(location: &str) -> (String, String) {
    match location.rsplit_once(':') {
        Some((path, handler)) if !path.is_empty() => (path.to_string(), handler.to_string()),
        _ => (location.to_string(), String::new()),
    }
}

/// Run a `local:` artifact: server-command deployments go through the
/// process pool; serverless handlers run as a one-shot node process.
async fn invoke_local(
    pool: &ProcessPool,
    location: String,
    args: InvokeArgs,
) -> Result<InvokeResult, InvokeError> {
    let (fn_path, fn_handler) = parse_function_location(&location);
    let fn_dir = Path::new(&fn_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    if !args.command.is_empty() {
        return Ok(pool.invoke(args, fn_dir).await?);
    }

    let payload = serde_json::to_string(&request_envelope(&args))
        .map_err(|e| InvokeError::InvalidResponse(e.to_string()))?;

    let file_name = Path::new(&fn_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let script = if fn_path.ends_with(".mjs") {
        format!(
            r#"import("./{file_name}").then(m => m.{fn_handler}({payload}, {{}}, (e, r) => console.log(JSON.stringify(r))).then(r => r && console.log(JSON.stringify(r))))"#
        )
    } else {
        format!(
            r#"require("./{file_name}").{fn_handler}({payload}, {{}}, (e, r) => console.log(JSON.stringify(r)))"#
        )
    };

    let mut command = tokio::process::Command::new("node");
    command
        .arg("-e")
        .arg(&script)
        .current_dir(&fn_dir)
        .env_clear()
        .envs(std::env::var("PATH").map(|p| ("PATH".to_string(), p)))
        .envs(std::env::var("HOME").map(|h| ("HOME".to_string(), h)))
        .envs(args.env_variables.clone());

    // Help node resolve bundled dependencies next to the handler.
    for candidate in [fn_dir.join("node_modules"), fn_dir.join("../node_modules")] {
        if candidate.is_dir() {
            command.env("NODE_PATH", &candidate);
            break;
        }
    }

    let output = command.output().await?;

    if !output.status.success() {
        tracing::error!(
            "error while running local handler: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(InvokeError::InvalidResponse(format!(
            "handler exited with {:?}",
            output.status.code()
        )));
    }

    if output.stdout.is_empty() {
        return Ok(InvokeResult::default().normalize());
    }

    let response: FunctionResponse = serde_json::from_slice(&output.stdout)
        .map_err(|e| InvokeError::InvalidResponse(e.to_string()))?;

    let result = response.into_result();
    if args.capture_logs {
        if let Some(queue) = &args.log_queue {
            for log in &result.logs {
                queue(log.clone());
            }
        }
    }

    Ok(result.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_function_location() {
        assert_eq!(
            parse_function_location("/srv/deployment-1/server/index.mjs:handler"),
            (
                "/srv/deployment-1/server/index.mjs".to_string(),
                "handler".to_string()
            )
        );
        assert_eq!(
            parse_function_location("/srv/deployment-1/server"),
            ("/srv/deployment-1/server".to_string(), String::new())
        );
    }

    #[test]
    fn test_normalize_defaults_status() {
        let ok = InvokeResult::default().normalize();
        assert_eq!(ok.status_code, 200);

        let failed = InvokeResult {
            error_message: "boom".to_string(),
            ..Default::default()
        }
        .normalize();
        assert_eq!(failed.status_code, 500);
        assert_eq!(failed.body, b"boom");
    }

    #[test]
    fn test_normalize_keeps_explicit_status() {
        let result = InvokeResult {
            status_code: 404,
            error_message: "not found".to_string(),
            ..Default::default()
        }
        .normalize();
        assert_eq!(result.status_code, 404);
    }

    #[test]
    fn test_function_response_decodes_base64_body() {
        let response = FunctionResponse {
            body: BASE64.encode(b"<html>ok</html>"),
            status: 200,
            ..Default::default()
        };
        assert_eq!(response.into_result().body, b"<html>ok</html>");
    }

    #[test]
    fn test_function_response_plain_body_passes_through() {
        // "hi!" is not valid base64, so it stays as-is.
        let response = FunctionResponse {
            body: "hi!".to_string(),
            ..Default::default()
        };
        assert_eq!(response.into_result().body, b"hi!");
    }

    #[test]
    fn test_function_response_prefers_buffer_and_status_code() {
        let response = FunctionResponse {
            buffer: BASE64.encode(b"buffered"),
            body: "ignored".to_string(),
            status: 200,
            status_code: 201,
            ..Default::default()
        };
        let result = response.into_result();
        assert_eq!(result.body, b"buffered");
        assert_eq!(result.status_code, 201);
    }

    #[test]
    fn test_request_envelope_shape() {
        let args = InvokeArgs {
            method: "POST".to_string(),
            url: "https://www.example.org/api/x?q=1".to_string(),
            path: "/api/x".to_string(),
            query: HashMap::from([("q".to_string(), vec!["1".to_string()])]),
            body: b"my-payload".to_vec(),
            context: serde_json::json!({"apiPrefix": "/api"}),
            ..Default::default()
        };

        let envelope = request_envelope(&args);
        assert_eq!(envelope["method"], "POST");
        assert_eq!(envelope["path"], "/api/x");
        assert_eq!(envelope["query"]["q"][0], "1");
        assert_eq!(envelope["context"]["apiPrefix"], "/api");
        assert_eq!(envelope["body"], BASE64.encode(b"my-payload"));
    }
}
