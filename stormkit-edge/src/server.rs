//! HTTP/HTTPS listeners.
//!
//! The HTTP port serves ACME HTTP-01 challenges and (when TLS is on)
//! redirects everything else to HTTPS. The HTTPS port terminates TLS with
//! certificates obtained on demand during the handshake: the SNI name is
//! read first, the certificate manager is consulted asynchronously, and
//! the handshake only proceeds when a certificate exists or can be issued.

use crate::certs::{CertManager, CertPair};
use crate::pipeline::{Pipeline, PipelineRequest, PipelineResponse};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::LazyConfigAcceptor;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    /// Wall clock for one request.
    pub request_timeout: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            enable_https: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct HandlerState {
    pipeline: Arc<Pipeline>,
    scheme: &'static str,
    request_timeout: Duration,
    /// Redirect non-challenge requests to HTTPS (plain listener only).
    redirect_to_https: bool,
}

/// Run both listeners until the process is shut down.
pub async fn run(
    pipeline: Arc<Pipeline>,
    certs: Option<Arc<CertManager>>,
    config: EdgeConfig,
) -> Result<(), ServerError> {
    let http = tokio::spawn(run_http(
        pipeline.clone(),
        config.clone(),
        config.enable_https,
    ));

    if config.enable_https {
        let manager = certs.ok_or_else(|| {
            ServerError::Tls("https enabled but no certificate manager configured".to_string())
        })?;
        let https = tokio::spawn(run_https(pipeline, manager, config));

        let (http_result, https_result) = tokio::join!(http, https);
        http_result.map_err(|e| ServerError::Tls(e.to_string()))??;
        https_result.map_err(|e| ServerError::Tls(e.to_string()))??;
    } else {
        http.await.map_err(|e| ServerError::Tls(e.to_string()))??;
    }

    Ok(())
}

fn router(state: HandlerState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn run_http(
    pipeline: Arc<Pipeline>,
    config: EdgeConfig,
    redirect_to_https: bool,
) -> Result<(), ServerError> {
    let state = HandlerState {
        pipeline,
        scheme: "http",
        request_timeout: config.request_timeout,
        redirect_to_https,
    };

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP listener started");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn run_https(
    pipeline: Arc<Pipeline>,
    manager: Arc<CertManager>,
    config: EdgeConfig,
) -> Result<(), ServerError> {
    let state = HandlerState {
        pipeline,
        scheme: "https",
        request_timeout: config.request_timeout,
        redirect_to_https: false,
    };

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.https_port)).await?;
    tracing::info!(port = config.https_port, "HTTPS listener started");

    loop {
        let (tcp, remote) = listener.accept().await?;
        let manager = manager.clone();
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_tls_connection(tcp, remote, manager, state).await {
                tracing::debug!(%remote, "tls connection ended: {e}");
            }
        });
    }
}

/// Read the SNI name, obtain a certificate (possibly issuing on demand),
/// finish the handshake and serve the connection. Hosts failing the
/// decision function abort here; the client sees a TLS error.
async fn serve_tls_connection(
    tcp: tokio::net::TcpStream,
    remote: SocketAddr,
    manager: Arc<CertManager>,
    state: HandlerState,
) -> Result<(), ServerError> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp);
    let start = acceptor.await.map_err(|e| ServerError::Tls(e.to_string()))?;

    let sni = start
        .client_hello()
        .server_name()
        .unwrap_or_default()
        .to_string();

    let pair = manager
        .obtain(&sni)
        .await
        .map_err(|e| ServerError::Tls(format!("no certificate for '{sni}': {e}")))?;

    let tls_config = Arc::new(tls_server_config(&pair)?);
    let stream = start
        .into_stream(tls_config)
        .await
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    let app = router(state).layer(axum::Extension(ConnectInfo(remote)));
    let service = TowerToHyperService::new(app);

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(())
}

/// Build a rustls config for one certificate pair, with h2 + http/1.1.
fn tls_server_config(pair: &CertPair) -> Result<rustls::ServerConfig, ServerError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pair.cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("invalid certificate pem: {e}")))?;
    let key = rustls_pemfile::private_key(&mut pair.key_pem.as_bytes())
        .map_err(|e| ServerError::Tls(format!("invalid key pem: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key in pem".to_string()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

async fn handle(
    State(state): State<HandlerState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    extension: Option<axum::Extension<ConnectInfo<SocketAddr>>>,
    request: Request<Body>,
) -> Response {
    let remote_ip = connect_info
        .map(|info| info.0.ip().to_string())
        .or_else(|| extension.map(|ext| ext.0.0.ip().to_string()))
        .unwrap_or_default();

    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or_default().to_string();

    // HTTP→HTTPS redirect, except for ACME challenges which must be
    // answered over plain HTTP.
    if state.redirect_to_https && !path.starts_with("/.well-known/acme-challenge/") {
        let suffix = if query.is_empty() {
            String::new()
        } else {
            format!("?{query}")
        };
        let location = format!("https://{host}{path}{suffix}");
        return Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header("location", location)
            .body(Body::empty())
            .unwrap_or_default();
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "payload too large").into_response();
        }
    };

    // Header values that are not valid UTF-8 are dropped here, which also
    // covers the analytics user-agent validity check.
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    let pipeline_request = PipelineRequest {
        method: parts.method.to_string(),
        scheme: state.scheme.to_string(),
        host,
        path,
        query,
        headers,
        body,
        remote_ip,
    };

    let handled =
        tokio::time::timeout(state.request_timeout, state.pipeline.handle(pipeline_request)).await;

    let response = match handled {
        Ok(response) => response,
        Err(_) => PipelineResponse::html(
            500,
            crate::html::server_error("request timed out", ""),
        ),
    };

    into_axum_response(response)
}

fn into_axum_response(response: PipelineResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );

    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_config_defaults() {
        let config = EdgeConfig::default();
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert!(config.enable_https);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_tls_server_config_from_self_signed() {
        let key = rcgen::generate_simple_self_signed(vec!["www.example.org".to_string()]).unwrap();
        let pair = CertPair {
            cert_pem: key.cert.pem(),
            key_pem: key.signing_key.serialize_pem(),
        };

        let config = tls_server_config(&pair).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_into_axum_response_carries_headers() {
        let mut response = PipelineResponse::new(302);
        response
            .headers
            .insert("location".to_string(), "https://x.example/".to_string());

        let converted = into_axum_response(response);
        assert_eq!(converted.status(), StatusCode::FOUND);
        assert_eq!(
            converted.headers().get("location").unwrap(),
            "https://x.example/"
        );
    }
}
