//! Shared fakes and helpers for the integration tests.
//!
//! `FakeRuntime` stands in for the external container runtime. Process
//! behavior is derived from the process path the way the real agent
//! would see it: `/bin/true` exits 0, `/bin/false` exits 1, and
//! `/bin/sleep <secs>` sleeps (cancellable by terminate/kill): enough
//! vocabulary to script every lifecycle scenario.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

use stevedore::actions::Action;
use stevedore::config::AgentConfig;
use stevedore::container::{Container, ContainerState, LogConfig, Resource};
use stevedore::downloader::{ArtifactDownloader, FetchedArtifact};
use stevedore::error::{DownloadError, RuntimeError, UploadError};
use stevedore::logstream::{LogLine, LogSink, LogStream};
use stevedore::runtime::{
    ByteReader, ProcessIo, ProcessSignal, ProcessSpec, RuntimeCapacity, RuntimeClient, Sandbox,
    SandboxInfo, SandboxProcess, SandboxSpec,
};
use stevedore::uploader::Uploader;
use stevedore::agent::{Agent, Collaborators};
use stevedore::credentials::NoopCredentialManager;

// =============================================================================
// Fake Runtime
// =============================================================================

#[derive(Default)]
pub struct FakeRuntime {
    pub sandboxes: Mutex<HashMap<String, Arc<FakeSandbox>>>,
    pub failing_pings: AtomicUsize,
    pub unrecoverable: AtomicBool,
    pub fail_create: AtomicBool,
    pub destroyed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sandbox(&self, handle: &str) -> Option<Arc<FakeSandbox>> {
        self.sandboxes.lock().unwrap().get(handle).cloned()
    }

    /// Registers a sandbox directly, as a previous agent instance would
    /// have left it.
    pub fn seed_sandbox(&self, handle: &str, properties: HashMap<String, String>) {
        let sandbox = Arc::new(FakeSandbox::new(SandboxSpec {
            handle: handle.to_string(),
            properties,
            ..SandboxSpec::default()
        }));
        self.sandboxes
            .lock()
            .unwrap()
            .insert(handle.to_string(), sandbox);
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.unrecoverable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unrecoverable("runtime wedged".to_string()));
        }

        let remaining = self.failing_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::Connection("connection refused".to_string()));
        }

        Ok(())
    }

    async fn capacity(&self) -> Result<RuntimeCapacity, RuntimeError> {
        Ok(RuntimeCapacity {
            memory_mb: 1024,
            disk_mb: 1024,
            max_containers: 10,
        })
    }

    async fn create(&self, spec: SandboxSpec) -> Result<Arc<dyn Sandbox>, RuntimeError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::operation(
                "create",
                &spec.handle,
                "quota exceeded",
            ));
        }

        let handle = spec.handle.clone();
        let sandbox = Arc::new(FakeSandbox::new(spec));
        self.sandboxes
            .lock()
            .unwrap()
            .insert(handle, Arc::clone(&sandbox));
        Ok(sandbox)
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        self.destroyed.lock().unwrap().push(handle.to_string());
        self.sandboxes
            .lock()
            .unwrap()
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ContainerNotFound(handle.to_string()))
    }

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Sandbox>, RuntimeError> {
        self.sandbox(handle)
            .map(|s| s as Arc<dyn Sandbox>)
            .ok_or_else(|| RuntimeError::ContainerNotFound(handle.to_string()))
    }

    async fn list(
        &self,
        properties: HashMap<String, String>,
    ) -> Result<Vec<Arc<dyn Sandbox>>, RuntimeError> {
        let sandboxes = self.sandboxes.lock().unwrap();
        Ok(sandboxes
            .values()
            .filter(|sandbox| {
                let props = sandbox.properties.lock().unwrap();
                properties.iter().all(|(k, v)| props.get(k) == Some(v))
            })
            .map(|s| Arc::clone(s) as Arc<dyn Sandbox>)
            .collect())
    }
}

// =============================================================================
// Fake Sandbox
// =============================================================================

pub struct FakeSandbox {
    handle: String,
    pub properties: Mutex<HashMap<String, String>>,
    pub events: Mutex<Vec<String>>,
    pub ran: Mutex<Vec<ProcessSpec>>,
    /// Signals delivered to any process of this sandbox, as
    /// (process path, signal) pairs. Outlives the process handles.
    pub signals: Arc<Mutex<Vec<(String, ProcessSignal)>>>,
    pub streamed_in: Mutex<Vec<(String, Vec<u8>)>>,
    pub stream_out_data: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeSandbox {
    pub fn new(spec: SandboxSpec) -> Self {
        Self {
            handle: spec.handle.clone(),
            properties: Mutex::new(spec.properties),
            events: Mutex::new(Vec::new()),
            ran: Mutex::new(Vec::new()),
            signals: Arc::new(Mutex::new(Vec::new())),
            streamed_in: Mutex::new(Vec::new()),
            stream_out_data: Mutex::new(HashMap::new()),
        }
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().get(key).cloned()
    }

    pub fn ran_paths(&self) -> Vec<String> {
        self.ran.lock().unwrap().iter().map(|s| s.path.clone()).collect()
    }

    /// Signals delivered to processes spawned from `path`.
    pub fn signals_for(&self, path: &str) -> Vec<ProcessSignal> {
        self.signals
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, signal)| *signal)
            .collect()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        mut io: ProcessIo,
    ) -> Result<Box<dyn SandboxProcess>, RuntimeError> {
        // Echo a banner so log-streaming paths have bytes to carry.
        if let Some(stdout) = io.stdout.as_mut() {
            use tokio::io::AsyncWriteExt;
            let _ = stdout
                .write_all(format!("starting {}\n", spec.path).as_bytes())
                .await;
        }

        let process = FakeProcess::plan(&spec, Arc::clone(&self.signals));
        self.ran.lock().unwrap().push(spec);
        Ok(Box::new(process))
    }

    async fn stream_in(&self, path: &str, mut archive: ByteReader) -> Result<(), RuntimeError> {
        let mut bytes = Vec::new();
        archive
            .read_to_end(&mut bytes)
            .await
            .map_err(|err| RuntimeError::operation("stream-in", &self.handle, err))?;
        self.streamed_in
            .lock()
            .unwrap()
            .push((path.to_string(), bytes));
        Ok(())
    }

    async fn stream_out(&self, path: &str) -> Result<ByteReader, RuntimeError> {
        let data = self
            .stream_out_data
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::operation("stream-out", &self.handle, "no such path"))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn set_property(&self, key: &str, value: &str) -> Result<(), RuntimeError> {
        self.properties
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn info(&self) -> Result<SandboxInfo, RuntimeError> {
        Ok(SandboxInfo {
            events: self.events.lock().unwrap().clone(),
            internal_ip: "10.0.0.5".to_string(),
            external_ip: "192.168.1.2".to_string(),
            properties: self.properties.lock().unwrap().clone(),
        })
    }
}

// =============================================================================
// Fake Process
// =============================================================================

pub struct FakeProcess {
    path: String,
    exit_status: i32,
    /// `None` means the process never exits on its own
    /// (`/bin/sleep infinity`).
    delay: Option<Duration>,
    terminated: Arc<Notify>,
    signal_log: Arc<Mutex<Vec<(String, ProcessSignal)>>>,
}

impl FakeProcess {
    /// Derives behavior from the process path, shell style.
    fn plan(spec: &ProcessSpec, signal_log: Arc<Mutex<Vec<(String, ProcessSignal)>>>) -> Self {
        let name = Path::new(&spec.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let (exit_status, delay) = match name.as_str() {
            "false" => (1, Some(Duration::ZERO)),
            "sleep" => match spec.args.first().map(String::as_str) {
                Some("infinity") => (0, None),
                Some(secs) => (
                    0,
                    Some(Duration::from_secs_f64(secs.parse().unwrap_or(3600.0))),
                ),
                None => (0, Some(Duration::from_secs(3600))),
            },
            _ => (0, Some(Duration::ZERO)),
        };

        Self {
            path: spec.path.clone(),
            exit_status,
            delay,
            terminated: Arc::new(Notify::new()),
            signal_log,
        }
    }

    async fn run_until_exit(&self) -> i32 {
        match self.delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                self.exit_status
            }
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl SandboxProcess for FakeProcess {
    async fn wait(&mut self) -> Result<i32, RuntimeError> {
        tokio::select! {
            status = self.run_until_exit() => Ok(status),
            _ = self.terminated.notified() => Ok(143),
        }
    }

    async fn signal(&self, signal: ProcessSignal) -> Result<(), RuntimeError> {
        self.signal_log
            .lock()
            .unwrap()
            .push((self.path.clone(), signal));
        self.terminated.notify_one();
        Ok(())
    }
}

// =============================================================================
// Fake Downloader / Uploader
// =============================================================================

#[derive(Default)]
pub struct FakeDownloader {
    pub payload: Mutex<Vec<u8>>,
    pub fail: AtomicBool,
    pub fetches: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn with_payload(payload: &[u8]) -> Arc<Self> {
        let downloader = Self::default();
        *downloader.payload.lock().unwrap() = payload.to_vec();
        Arc::new(downloader)
    }
}

#[async_trait]
impl ArtifactDownloader for FakeDownloader {
    async fn fetch(
        &self,
        url: &Url,
        _cache_key: &str,
        _checksum: Option<&str>,
        token: &CancellationToken,
    ) -> Result<FetchedArtifact, DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        self.fetches.lock().unwrap().push(url.to_string());

        if self.fail.load(Ordering::SeqCst) {
            return Err(DownloadError::BadStatus {
                url: url.to_string(),
                status: 500,
            });
        }

        let payload = self.payload.lock().unwrap().clone();
        let size = payload.len() as u64;
        Ok(FetchedArtifact {
            stream: Box::new(std::io::Cursor::new(payload)),
            size_bytes: Some(size),
        })
    }
}

#[derive(Default)]
pub struct FakeUploader {
    pub uploads: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn upload(
        &self,
        path: &Path,
        url: &Url,
        _token: &CancellationToken,
    ) -> Result<u64, UploadError> {
        let size = std::fs::metadata(path)?.len();
        self.uploads
            .lock()
            .unwrap()
            .push((url.to_string(), size));
        Ok(size)
    }
}

// =============================================================================
// Capturing Log Sink
// =============================================================================

#[derive(Default)]
pub struct CapturingLogSink {
    pub lines: Mutex<Vec<LogLine>>,
}

impl CapturingLogSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|line| line.message.clone())
            .collect()
    }

    pub fn stdout_messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.stream == LogStream::Stdout)
            .map(|line| line.message.clone())
            .collect()
    }
}

impl LogSink for CapturingLogSink {
    fn write_line(&self, line: LogLine) {
        self.lines.lock().unwrap().push(line);
    }
}

// =============================================================================
// Builders
// =============================================================================

/// A config with short intervals suitable for paused-clock tests.
pub fn test_config() -> AgentConfig {
    AgentConfig {
        reserved_expiration_time: Duration::from_millis(200),
        container_reap_interval: Duration::from_secs(60),
        healthy_monitoring_interval: Duration::from_millis(30),
        unhealthy_monitoring_interval: Duration::from_millis(10),
        temp_dir: std::env::temp_dir().display().to_string(),
        ..AgentConfig::default()
    }
}

/// A minimal container running `/bin/true`.
pub fn container(guid: &str) -> Container {
    Container {
        guid: guid.to_string(),
        state: ContainerState::Reserved,
        resource: Resource {
            memory_mb: 64,
            disk_mb: 64,
            ..Resource::default()
        },
        tags: Default::default(),
        external_ip: String::new(),
        internal_ip: String::new(),
        ports: Vec::new(),
        log: LogConfig {
            guid: guid.to_string(),
            source_name: "TEST".to_string(),
            index: 0,
        },
        setup: None,
        action: Action::run("/bin/true", Vec::new()),
        monitor: None,
        start_timeout_secs: 0,
        credentials_mount_path: String::new(),
        run_result: Default::default(),
        allocated_at: None,
    }
}

pub struct TestAgent {
    pub agent: Arc<Agent>,
    pub runtime: Arc<FakeRuntime>,
    pub downloader: Arc<FakeDownloader>,
    pub uploader: Arc<FakeUploader>,
    pub sink: Arc<CapturingLogSink>,
}

/// Starts an agent wired entirely to fakes.
pub async fn start_agent(config: AgentConfig) -> TestAgent {
    let runtime = FakeRuntime::new();
    start_agent_with_runtime(config, runtime).await
}

pub async fn start_agent_with_runtime(config: AgentConfig, runtime: Arc<FakeRuntime>) -> TestAgent {
    let downloader = FakeDownloader::with_payload(b"artifact-bytes");
    let uploader = Arc::new(FakeUploader::default());
    let sink = CapturingLogSink::new();

    let agent = Agent::start(
        config,
        Collaborators {
            runtime: Arc::clone(&runtime) as Arc<dyn RuntimeClient>,
            downloader: Arc::clone(&downloader) as Arc<dyn ArtifactDownloader>,
            uploader: Arc::clone(&uploader) as Arc<dyn Uploader>,
            credentials: Arc::new(NoopCredentialManager),
            log_sink: Arc::clone(&sink) as Arc<dyn LogSink>,
        },
    )
    .await
    .expect("agent should start");

    TestAgent {
        agent,
        runtime,
        downloader,
        uploader,
        sink,
    }
}

/// Builds a tar archive holding one file entry.
pub fn tar_with_file(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, std::io::Cursor::new(contents.to_vec()))
        .unwrap();
    builder.into_inner().unwrap()
}
