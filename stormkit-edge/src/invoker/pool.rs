//! Process pool for long-running user services.
//!
//! One `Service` per ARN: a child process bound to an ephemeral (or
//! custom) port, a log file with a tail task, an idle timer and an
//! optional setup/stop lifecycle declared in `stormkit.server.yml`.
//! The pool map sits behind a single mutex; services surface through it.

use super::{InvokeArgs, InvokeResult};
use crate::html;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use stormkit_core::LogLine;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

const SERVER_CONFIG_FILE: &str = "stormkit.server.yml";
const LOCK_FILE: &str = "stormkit.lock";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SPAWN_WAIT: Duration = Duration::from_secs(10);

const DEFAULT_MAX_IDLE_MINUTES: u64 = 10;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid server config: {0}")]
    Config(String),

    #[error("cannot find an available port: {0}")]
    PortUnavailable(String),

    #[error("server is not up and running within allowed timeout")]
    NotReady,

    #[error("relay error: {0}")]
    Relay(#[from] reqwest::Error),
}

/// Optional per-deployment service lifecycle, `stormkit.server.yml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    New,
    SettingUp,
    Starting,
    Ready,
    Killed,
}

struct Service {
    arn: String,
    port: u16,
    is_custom_port: bool,
    work_dir: PathBuf,
    log_path: PathBuf,
    server_config: Option<ServerConfig>,
    env: Vec<(String, String)>,

    state: Mutex<ServiceState>,
    idle_deadline: Mutex<Instant>,
    max_idle: Option<Duration>,
    pid: AtomicU32,
    killed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pool: Arc<Mutex<PoolInner>>,
}

impl Service {
    fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock() = state;
    }

    fn reset_idle(&self) {
        if let Some(max_idle) = self.max_idle {
            *self.idle_deadline.lock() = Instant::now() + max_idle;
        }
    }

    /// Kill the service: run stop scripts, terminate the process group,
    /// drop the log file and remove the service from the pool maps.
    /// Idempotent; the second call is a no-op.
    async fn kill(self: &Arc<Self>) {
        if self.killed.swap(true, Ordering::SeqCst) {
            tracing::debug!(arn = %self.arn, "service is already killed");
            return;
        }
        self.set_state(ServiceState::Killed);

        if let Some(config) = &self.server_config {
            for script in &config.stop {
                tracing::debug!(arn = %self.arn, script, "running stop script");
                if let Err(e) = run_script(script, &self.work_dir, &self.env, &self.log_path).await
                {
                    tracing::error!("error while running stop script: {e}");
                }
            }
        }

        let pid = self.pid.load(Ordering::SeqCst);
        if pid != 0 {
            tracing::debug!(arn = %self.arn, pid, "killing service process group");
            kill_process_group(pid);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Err(e) = std::fs::remove_file(&self.log_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!("error while removing log file: {e}");
            }
        }

        let mut inner = self.pool.lock();
        inner.services.remove(&self.arn);
        if self.is_custom_port {
            inner.custom_ports.remove(&self.port);
        }
    }
}

#[derive(Default)]
struct PoolInner {
    services: HashMap<String, Arc<Service>>,
    custom_ports: HashMap<u16, Arc<Service>>,
}

pub struct ProcessPool {
    inner: Arc<Mutex<PoolInner>>,
    client: reqwest::Client,
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .no_proxy()
                .build()
                .unwrap_or_default(),
        }
    }

    /// Invoke the service bound to `args.arn`, starting it on first use.
    pub async fn invoke(
        &self,
        args: InvokeArgs,
        work_dir: PathBuf,
    ) -> Result<InvokeResult, PoolError> {
        let custom_port = args.env_variables.get("PORT").filter(|p| !p.is_empty());

        if custom_port.is_some() && !args.is_published {
            return Ok(page_result(400, html::custom_port_rejected(), None));
        }

        let service = match self.get_service(&args.arn) {
            Some(service) => service,
            None => self.start(&args, work_dir).await?,
        };

        match service.state() {
            ServiceState::SettingUp => {
                return Ok(page_result(200, html::service_setting_up(5), Some("5")));
            }
            ServiceState::Killed => {
                return Ok(page_result(200, html::service_starting(), Some("1")));
            }
            ServiceState::New => {
                // Setup finished but the child is not spawned yet; give it
                // a moment before telling the client to retry.
                let waited = tokio::time::timeout(SPAWN_WAIT, async {
                    loop {
                        if service.state() != ServiceState::New {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                })
                .await;

                if waited.is_err() || service.state() == ServiceState::New {
                    return Ok(page_result(200, html::service_starting(), Some("1")));
                }
                if service.state() == ServiceState::SettingUp {
                    return Ok(page_result(200, html::service_setting_up(5), Some("5")));
                }
            }
            ServiceState::Starting | ServiceState::Ready => {}
        }

        self.relay_with_retry(&args, &service).await
    }

    /// Kill every service. Used at shutdown; killing twice is harmless.
    pub async fn kill_all(&self) {
        let services: Vec<Arc<Service>> =
            self.inner.lock().services.values().cloned().collect();

        tracing::debug!(count = services.len(), "killing all services");
        for service in services {
            service.kill().await;
        }
    }

    pub fn service_count(&self) -> usize {
        self.inner.lock().services.len()
    }

    /// Fetch a live service and arm its idle timer.
    fn get_service(&self, arn: &str) -> Option<Arc<Service>> {
        let service = {
            let inner = self.inner.lock();
            inner.services.get(arn).cloned()
        }?;

        if service.killed.load(Ordering::SeqCst) {
            tracing::debug!(arn, "service was previously killed, removing from the list");
            self.inner.lock().services.remove(arn);
            return None;
        }

        service.reset_idle();
        Some(service)
    }

    async fn start(
        &self,
        args: &InvokeArgs,
        mut work_dir: PathBuf,
    ) -> Result<Arc<Service>, PoolError> {
        let log_path =
            std::env::temp_dir().join(format!("logs-d-{}.txt", args.deployment_id));
        std::fs::File::create(&log_path)?;

        let port = allocate_port(args)?;
        let is_custom_port = args
            .env_variables
            .get("PORT")
            .is_some_and(|p| !p.is_empty());

        // A published deployment re-claiming its custom port evicts the
        // previous holder.
        if is_custom_port {
            let previous = self.inner.lock().custom_ports.get(&port).cloned();
            if let Some(previous) = previous {
                if previous.arn != args.arn {
                    tracing::debug!(
                        previous_arn = %previous.arn,
                        new_arn = %args.arn,
                        port,
                        "found previous service on the same port, killing it"
                    );
                    previous.kill().await;
                }
            }
        }

        let mut server_config = None;
        let config_path = work_dir.join(SERVER_CONFIG_FILE);
        if config_path.is_file() {
            let raw = std::fs::read_to_string(&config_path)?;
            let config: ServerConfig =
                serde_yaml::from_str(&raw).map_err(|e| PoolError::Config(e.to_string()))?;

            if !config.workdir.is_empty() {
                work_dir = work_dir.join(&config.workdir);
                std::fs::create_dir_all(&work_dir)?;
            }
            server_config = Some(config);
        }

        let env = prepare_environment(args, port);
        let max_idle = max_idle_for(args);

        let service = Arc::new(Service {
            arn: args.arn.clone(),
            port,
            is_custom_port,
            work_dir: work_dir.clone(),
            log_path: log_path.clone(),
            server_config: server_config.clone(),
            env: env.clone(),
            state: Mutex::new(ServiceState::New),
            idle_deadline: Mutex::new(Instant::now() + max_idle.unwrap_or(Duration::ZERO)),
            max_idle,
            pid: AtomicU32::new(0),
            killed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            pool: self.inner.clone(),
        });
        service.reset_idle();

        {
            let mut inner = self.inner.lock();
            inner.services.insert(args.arn.clone(), service.clone());
            if is_custom_port {
                inner.custom_ports.insert(port, service.clone());
            }
        }

        let runner = tokio::spawn(run_service(service.clone(), args.clone()));
        service.tasks.lock().push(runner);

        if args.capture_logs {
            if let Some(queue) = args.log_queue.clone() {
                let tailer = tokio::spawn(tail_logs(log_path, queue));
                service.tasks.lock().push(tailer);
            }
        }

        if max_idle.is_some() {
            let watcher = tokio::spawn(idle_watcher(service.clone()));
            service.tasks.lock().push(watcher);
        }

        Ok(service)
    }

    /// Relay the request, retrying every 250 ms until the service answers
    /// or the 30 second ceiling is reached.
    async fn relay_with_retry(
        &self,
        args: &InvokeArgs,
        service: &Arc<Service>,
    ) -> Result<InvokeResult, PoolError> {
        let deadline = Instant::now() + READY_TIMEOUT;

        loop {
            if Instant::now() >= deadline {
                return Err(PoolError::NotReady);
            }

            match self.relay(args, service).await {
                Ok(result) => {
                    service.set_state(ServiceState::Ready);
                    service.reset_idle();
                    return Ok(result);
                }
                Err(_) => {
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Proxy the original request to the bound port, preserving method,
    /// headers and body, and stripping hop-by-hop headers on the way back.
    async fn relay(
        &self,
        args: &InvokeArgs,
        service: &Arc<Service>,
    ) -> Result<InvokeResult, PoolError> {
        let query = args
            .url
            .split_once('?')
            .map(|(_, q)| format!("?{q}"))
            .unwrap_or_default();
        let target = format!("http://127.0.0.1:{}{}{query}", service.port, args.path);

        let method: reqwest::Method = args
            .method
            .parse()
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.client.request(method, &target);
        for (name, value) in &args.headers {
            request = request.header(name, value);
        }
        let response = request.body(args.body.clone()).send().await?;

        let status_code = response.status().as_u16();
        let mut headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();

        // HTTP/2 on the edge side is incompatible with these.
        headers.remove("keep-alive");
        headers.remove("connection");

        let body = response.bytes().await?.to_vec();

        Ok(InvokeResult {
            status_code,
            headers,
            body,
            ..Default::default()
        })
    }
}

/// Setup + spawn lifecycle, run off the request path.
async fn run_service(service: Arc<Service>, args: InvokeArgs) {
    let lock_file = service.work_dir.join(LOCK_FILE);

    if let Some(config) = service.server_config.clone() {
        if !lock_file.exists() && !config.setup.is_empty() {
            service.set_state(ServiceState::SettingUp);

            for script in &config.setup {
                tracing::debug!(script, "running setup script");
                queue_log(&args, script);

                let expanded = expand_vars(script, &args.env_variables);
                if let Err(e) =
                    run_script(&expanded, &service.work_dir, &service.env, &service.log_path).await
                {
                    tracing::error!("error while running setup script {script}: {e}");
                    queue_log(&args, &e.to_string());
                    // No lock file on failure: the next request re-attempts.
                    service.kill().await;
                    return;
                }
            }

            if let Err(e) = std::fs::write(&lock_file, b"") {
                tracing::error!("error while writing setup lock file: {e}");
            }
        }
    }

    service.set_state(ServiceState::Starting);

    let log_file = match open_log(&service.log_path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("cannot open log file: {e}");
            service.kill().await;
            return;
        }
    };
    let log_err = match log_file.try_clone() {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("cannot clone log file handle: {e}");
            service.kill().await;
            return;
        }
    };

    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(&args.command)
        .current_dir(&service.work_dir)
        .env_clear()
        .envs(service.env.iter().cloned())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_err));

    new_process_group(&mut command);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            queue_log(&args, &e.to_string());
            service.kill().await;
            return;
        }
    };

    if let Some(pid) = child.id() {
        service.pid.store(pid, Ordering::SeqCst);
    }
    tracing::debug!(arn = %service.arn, port = service.port, "service started");

    // Wait for the command; a still-bound port means it daemonized and the
    // service stays alive.
    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::debug!(arn = %service.arn, "service finished successfully");
        }
        Ok(status) => {
            tracing::error!(arn = %service.arn, ?status, "service exited");
        }
        Err(e) => {
            tracing::error!(arn = %service.arn, "error while waiting for service: {e}");
        }
    }

    if !is_port_in_use(service.port).await {
        tracing::debug!(arn = %service.arn, port = service.port, "service finished and port is free");
        service.kill().await;
    }
}

/// Kill expired-idle services. One task per service.
async fn idle_watcher(service: Arc<Service>) {
    loop {
        let deadline = *service.idle_deadline.lock();
        let now = Instant::now();

        if now >= deadline {
            tracing::debug!(arn = %service.arn, "service has been idle for too long, killing it");
            service.kill().await;
            return;
        }

        tokio::time::sleep(deadline - now).await;
    }
}

/// Forward appended log lines once per second.
async fn tail_logs(log_path: PathBuf, queue: super::LogQueue) {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut offset: u64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        ticker.tick().await;

        let Ok(mut file) = tokio::fs::File::open(&log_path).await else {
            // Removed on kill; the task gets aborted right after.
            return;
        };

        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            continue;
        }

        let mut buffer = String::new();
        if file.read_to_string(&mut buffer).await.is_err() {
            continue;
        }

        // Hold back a trailing partial line until it is terminated.
        let complete = match buffer.rfind('\n') {
            Some(index) => &buffer[..=index],
            None => continue,
        };
        offset += complete.len() as u64;

        let message = complete.trim_end_matches('\n');
        if !message.is_empty() {
            queue(LogLine {
                timestamp: OffsetDateTime::now_utc().unix_timestamp(),
                message: message.to_string(),
            });
        }
    }
}

fn queue_log(args: &InvokeArgs, message: &str) {
    if let Some(queue) = &args.log_queue {
        queue(LogLine {
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            message: message.to_string(),
        });
    }
}

async fn run_script(
    script: &str,
    work_dir: &Path,
    env: &[(String, String)],
    log_path: &Path,
) -> Result<(), PoolError> {
    let log_file = open_log(log_path)?;
    let log_err = log_file.try_clone()?;

    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(work_dir)
        .env_clear()
        .envs(env.iter().cloned())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_err))
        .status()
        .await?;

    if !status.success() {
        return Err(PoolError::Config(format!(
            "script '{script}' exited with {:?}",
            status.code()
        )));
    }
    Ok(())
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Custom port when declared (published deployments only, enforced by the
/// caller); otherwise an OS-assigned free port.
fn allocate_port(args: &InvokeArgs) -> Result<u16, PoolError> {
    if let Some(port) = args.env_variables.get("PORT") {
        if let Ok(port) = port.parse::<u16>() {
            if port != 0 {
                return Ok(port);
            }
        }
    }

    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| PoolError::PortUnavailable(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| PoolError::PortUnavailable(e.to_string()))?
        .port();
    Ok(port)
}

async fn is_port_in_use(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

/// The service environment: deployment vars plus `ORIGIN` (defaulted to
/// the serving host), `PATH`, `HOME` and the bound `PORT`.
fn prepare_environment(args: &InvokeArgs, port: u16) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = args
        .env_variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if !args.env_variables.contains_key("ORIGIN") && !args.host_name.is_empty() {
        env.push(("ORIGIN".to_string(), format!("https://{}", args.host_name)));
    }

    env.push(("PATH".to_string(), std::env::var("PATH").unwrap_or_default()));
    env.push(("HOME".to_string(), std::env::var("HOME").unwrap_or_default()));
    env.retain(|(k, _)| k != "PORT");
    env.push(("PORT".to_string(), port.to_string()));

    env
}

fn max_idle_for(args: &InvokeArgs) -> Option<Duration> {
    let minutes = match args.env_variables.get("STORMKIT_MAX_IDLE") {
        Some(value) => value.parse::<u64>().unwrap_or(0),
        None => DEFAULT_MAX_IDLE_MINUTES,
    };

    // Zero means the idle timer is never armed.
    (minutes > 0).then(|| Duration::from_secs(minutes * 60))
}

/// Expand `$NAME` / `${NAME}` against the deployment environment.
fn expand_vars(script: &str, env: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(script.len());
    let mut chars = script.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        if name.is_empty() {
            result.push('$');
            if braced {
                result.push('{');
            }
        } else {
            result.push_str(env.get(&name).map(String::as_str).unwrap_or_default());
        }
    }

    result
}

#[cfg(unix)]
fn new_process_group(command: &mut tokio::process::Command) {
    // Each service runs in its own process group so the whole tree can be
    // signaled at once.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_process_group(_command: &mut tokio::process::Command) {}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        tracing::debug!(pid, "SIGTERM to process group failed: {e}");
    }
    let _ = killpg(pgid, Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(pid: u32) {
    // Windows has no process groups in the Unix sense; terminate the
    // process handle directly.
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

fn page_result(status: u16, body: String, retry_after: Option<&str>) -> InvokeResult {
    let mut headers = HashMap::from([(
        "content-type".to_string(),
        "text/html".to_string(),
    )]);
    if let Some(retry) = retry_after {
        headers.insert("retry-after".to_string(), retry.to_string());
    }

    InvokeResult {
        status_code: status,
        headers,
        body: body.into_bytes(),
        ..Default::default()
    }
}
