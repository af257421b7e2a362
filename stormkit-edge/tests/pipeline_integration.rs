//! End-to-end pipeline tests over the public API: a tenant config, a local
//! artifact tree and a real upstream socket for proxy rules.

use std::collections::HashMap;
use std::sync::Arc;
use stormkit_core::{AppConfig, DeploymentId, RedirectRule, StaticFileMeta};
use stormkit_edge::admin::{AdminConfig, AdminStore};
use stormkit_edge::analytics::Batcher;
use stormkit_edge::authwall::{AuthWallGate, LoginBackend};
use stormkit_edge::hosts::{ConfigSource, HostResolver};
use stormkit_edge::imageopt::ImageOptimizer;
use stormkit_edge::invoker::{Invoker, ProcessPool};
use stormkit_edge::pipeline::{Pipeline, PipelineRequest};
use stormkit_storage::{Kv, LocalStore, ObjectStore};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn pipeline_for(temp: &TempDir, config: AppConfig) -> Pipeline {
    let kv = Kv::in_memory();
    let admin = AdminStore::new(AdminConfig::default);
    let resolver = HostResolver::new(
        admin.clone(),
        ConfigSource::Static(HashMap::from([("www.stormkit.io".to_string(), config)])),
    );

    Pipeline {
        resolver,
        admin,
        store: ObjectStore::Local(LocalStore::new(temp.path())),
        invoker: Invoker::LocalOnly,
        pool: Arc::new(ProcessPool::new()),
        optimizer: ImageOptimizer::new(kv.clone()),
        authwall: Arc::new(AuthWallGate::new(
            b"integration-secret".to_vec(),
            kv.clone(),
            LoginBackend::Static(HashMap::new()),
        )),
        batcher: Batcher::start(kv, "records".to_string()),
        certs: None,
        ui_dir: None,
        dev_mode: false,
        server_header_off: false,
        proxy_client: reqwest::Client::new(),
    }
}

fn request(method: &str, path_and_query: &str) -> PipelineRequest {
    let (path, query) = path_and_query
        .split_once('?')
        .unwrap_or((path_and_query, ""));

    PipelineRequest {
        method: method.to_string(),
        scheme: "https".to_string(),
        host: "www.stormkit.io".to_string(),
        path: path.to_string(),
        query: query.to_string(),
        remote_ip: "203.0.113.10".to_string(),
        ..Default::default()
    }
}

/// Upstream stub capturing the first request line and headers it receives.
async fn spawn_upstream(body: &'static str) -> (u16, tokio::sync::oneshot::Receiver<String>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buffer = vec![0u8; 8192];
        let read = socket.read(&mut buffer).await.unwrap_or(0);
        let captured = String::from_utf8_lossy(&buffer[..read]).to_string();

        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = tx.send(captured);
    });

    (port, rx)
}

#[tokio::test]
async fn test_proxy_rewrite_forwards_verbatim_with_forwarded_headers() {
    let (port, captured) = spawn_upstream("upstream-body").await;

    let temp = TempDir::new().unwrap();
    let config = AppConfig {
        deployment_id: DeploymentId(1),
        redirects: vec![RedirectRule {
            from: "/api/v1/*".to_string(),
            to: format!("http://127.0.0.1:{port}/api/v1/$1"),
            status: 0,
            assets: false,
        }],
        ..Default::default()
    };

    let pipeline = pipeline_for(&temp, config);
    let mut req = request("GET", "/api/v1/my-endpoint/");
    req.body = b"my-payload".to_vec();

    let response = pipeline.handle(req).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"upstream-body");

    let upstream_request = captured.await.unwrap();
    assert!(upstream_request.starts_with("GET /api/v1/my-endpoint/ HTTP/1.1"));
    assert!(upstream_request.contains("x-forwarded-host: www.stormkit.io"));
    assert!(upstream_request.contains("x-forwarded-proto: https"));
    assert!(upstream_request.contains("my-payload"));
}

#[tokio::test]
async fn test_fixed_status_proxy_pins_200() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buffer = [0u8; 2048];
        let _ = socket.read(&mut buffer).await;
        let _ = socket
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 4\r\nconnection: close\r\n\r\nbusy")
            .await;
    });

    let temp = TempDir::new().unwrap();
    let config = AppConfig {
        deployment_id: DeploymentId(1),
        redirects: vec![RedirectRule {
            from: "/embed/*".to_string(),
            to: format!("http://127.0.0.1:{port}/widget/$1"),
            status: 200,
            assets: false,
        }],
        ..Default::default()
    };

    let pipeline = pipeline_for(&temp, config);
    let response = pipeline.handle(request("GET", "/embed/chart")).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"busy");
}

#[tokio::test]
async fn test_static_serving_end_to_end() {
    let temp = TempDir::new().unwrap();
    let client_dir = temp.path().join("deployment-42/client");
    std::fs::create_dir_all(&client_dir).unwrap();
    std::fs::write(client_dir.join("index.html"), "<html>live</html>").unwrap();

    let mut static_files = HashMap::new();
    static_files.insert(
        "/index.html".to_string(),
        StaticFileMeta {
            file_name: "/index.html".to_string(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )]),
        },
    );

    let config = AppConfig {
        deployment_id: DeploymentId(42),
        storage_location: format!("local:{}", client_dir.display()),
        static_files,
        ..Default::default()
    };

    let pipeline = pipeline_for(&temp, config);
    let response = pipeline.handle(request("GET", "/")).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"<html>live</html>");
    assert_eq!(response.headers.get("x-sk-version").unwrap(), "42");
    assert_eq!(response.headers.get("server").unwrap(), "Stormkit");
}

#[tokio::test]
async fn test_final_status_codes_stay_in_contract() {
    // Every terminal status the pipeline can produce on its own belongs to
    // the documented set.
    let allowed = [200u16, 204, 301, 302, 304, 307, 400, 401, 402, 404, 409, 500, 502];

    let temp = TempDir::new().unwrap();
    let pipeline = pipeline_for(&temp, AppConfig::default());

    for path in ["/", "/missing", "/deep/path?q=1"] {
        let response = pipeline.handle(request("GET", path)).await;
        assert!(
            allowed.contains(&response.status),
            "status {} for {path} not in contract",
            response.status
        );
    }
}
