//! Agent process supervision: install on demand, spawn, track, and tear down.

use std::{
    collections::{HashMap, HashSet},
    io::Read,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

use crate::error::SupervisorError;

#[cfg(unix)]
use nix::{
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};

const METADATA_FILE: &str = "agent.json";
const DEFAULT_ENTRY_POINT: &str = "dist/index.js";

/// The slice of supervision that message delivery depends on.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Make sure `agent_id` is running, starting it if needed.
    async fn start_agent(
        &self,
        agent_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), SupervisorError>;

    /// The client a supervised agent was started for.
    fn client_for(&self, agent_id: &str) -> Option<String>;

    fn running(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Metadata persisted next to an installed agent package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "zipFilePath")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
}

impl AgentMetadata {
    pub fn entry_point(&self) -> &str {
        self.entry_point
            .as_deref()
            .filter(|entry| !entry.trim().is_empty())
            .unwrap_or(DEFAULT_ENTRY_POINT)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub agents_dir: PathBuf,
    pub registry_url: String,
    pub runtime: String,
    pub gateway_url: String,
    pub stop_timeout: Duration,
}

#[derive(Debug)]
struct ManagedAgent {
    generation: u64,
    pid: Option<u32>,
    parent: Option<String>,
    started_at: DateTime<Utc>,
    stop_tx: Option<oneshot::Sender<()>>,
    waiter: Option<JoinHandle<()>>,
}

type RunningMap = Arc<Mutex<HashMap<String, ManagedAgent>>>;
/// Agent id to the client it was started for.
type ClientMap = Arc<Mutex<HashMap<String, String>>>;

pub struct ProcessSupervisor {
    options: SupervisorOptions,
    http: reqwest::Client,
    running: RunningMap,
    starting: Mutex<HashSet<String>>,
    clients: ClientMap,
    generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            http: reqwest::Client::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            starting: Mutex::new(HashSet::new()),
            clients: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.options.agents_dir.join(sanitize_agent_id(agent_id))
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.running.lock().contains_key(agent_id)
    }

    /// Snapshot of tracked children for the HTTP surface.
    pub fn list_running(&self) -> Vec<Value> {
        let mut list: Vec<Value> = self
            .running
            .lock()
            .iter()
            .map(|(id, managed)| {
                serde_json::json!({
                    "agentId": id,
                    "pid": managed.pid,
                    "parentId": managed.parent,
                    "startedAt": managed.started_at.to_rfc3339(),
                })
            })
            .collect();
        list.sort_by(|a, b| a["agentId"].as_str().cmp(&b["agentId"].as_str()));
        list
    }

    /// Succeeds once the agent's package is installed locally. A failed
    /// install leaves no directory behind.
    pub async fn ensure_agent_exists(&self, agent_id: &str) -> Result<PathBuf, SupervisorError> {
        let dir = self.agent_dir(agent_id);
        if let Some(metadata) = read_metadata(&dir) {
            if dir.join(metadata.entry_point()).is_file() {
                return Ok(dir);
            }
        } else if dir.join(DEFAULT_ENTRY_POINT).is_file() {
            return Ok(dir);
        }

        tracing::info!(
            target = "agent_gateway::supervisor",
            agent = %agent_id,
            dir = %dir.display(),
            "agent not installed locally, fetching from registry"
        );
        match self.install(agent_id, &dir).await {
            Ok(()) => Ok(dir),
            Err(error) => {
                if dir.exists() {
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                        tracing::warn!(
                            target = "agent_gateway::supervisor",
                            dir = %dir.display(),
                            error = %cleanup,
                            "failed to remove partial agent install"
                        );
                    }
                }
                Err(error)
            }
        }
    }

    async fn install(&self, agent_id: &str, dir: &Path) -> Result<(), SupervisorError> {
        let metadata = self.fetch_metadata(agent_id).await?;
        let url = metadata
            .download_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| SupervisorError::NoPackage(agent_id.to_string()))?;

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SupervisorError::RegistryStatus {
                agent_id: agent_id.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes().await?;

        let target = dir.to_path_buf();
        tokio::task::spawn_blocking(move || extract_package(&bytes, &target))
            .await
            .map_err(|e| SupervisorError::Spawn(e.to_string()))??;

        let entry = dir.join(metadata.entry_point());
        if !entry.is_file() {
            return Err(SupervisorError::MissingEntryPoint(entry));
        }
        let persisted = AgentMetadata {
            id: agent_id.to_string(),
            ..metadata
        };
        tokio::fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_vec_pretty(&persisted)?,
        )
        .await?;
        tracing::info!(
            target = "agent_gateway::supervisor",
            agent = %agent_id,
            version = ?persisted.version,
            "agent installed"
        );
        Ok(())
    }

    /// `<registry>/api/agents/<agent_id>`, with the id escaped as one segment.
    fn metadata_url(&self, agent_id: &str) -> Result<reqwest::Url, SupervisorError> {
        let base = &self.options.registry_url;
        let mut url = reqwest::Url::parse(base)
            .map_err(|e| SupervisorError::RegistryUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| SupervisorError::RegistryUrl(base.clone()))?
            .pop_if_empty()
            .extend(["api", "agents", agent_id]);
        Ok(url)
    }

    async fn fetch_metadata(&self, agent_id: &str) -> Result<AgentMetadata, SupervisorError> {
        let url = self.metadata_url(agent_id)?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::RegistryStatus {
                agent_id: agent_id.to_string(),
                status: status.as_u16(),
            });
        }
        let body: Value = response.json().await?;
        let record = body.get("data").cloned().unwrap_or(body);
        let mut metadata: AgentMetadata = serde_json::from_value(merge_id(record, agent_id))?;
        if metadata.id.is_empty() {
            metadata.id = agent_id.to_string();
        }
        Ok(metadata)
    }

    async fn spawn(&self, agent_id: &str, parent_id: Option<&str>) -> Result<u32, SupervisorError> {
        let dir = self.ensure_agent_exists(agent_id).await?;
        let entry = read_metadata(&dir)
            .map(|m| m.entry_point().to_string())
            .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string());

        let mut cmd = Command::new(&self.options.runtime);
        cmd.arg(&entry)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("AGENT_ID", agent_id)
            .env("GATEWAY_URL", &self.options.gateway_url);
        if let Some(parent) = parent_id {
            cmd.env("PARENT_ID", parent);
        }

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("spawned agent missing pid".into()))?;

        if let Some(stdout) = child.stdout.take() {
            pipe_output(agent_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pipe_output(agent_id.to_string(), "stderr", stderr);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();

        // Tracked before the watcher starts, so a child that exits immediately
        // is still untracked by it.
        if let Some(parent) = parent_id {
            self.clients
                .lock()
                .insert(agent_id.to_string(), parent.to_string());
        }
        self.running.lock().insert(
            agent_id.to_string(),
            ManagedAgent {
                generation,
                pid: Some(pid),
                parent: parent_id.map(ToOwned::to_owned),
                started_at: Utc::now(),
                stop_tx: Some(stop_tx),
                waiter: None,
            },
        );
        let waiter = tokio::spawn(watch_child(
            agent_id.to_string(),
            generation,
            child,
            stop_rx,
            Arc::clone(&self.running),
            Arc::clone(&self.clients),
            self.options.stop_timeout,
        ));
        if let Some(managed) = self
            .running
            .lock()
            .get_mut(agent_id)
            .filter(|m| m.generation == generation)
        {
            managed.waiter = Some(waiter);
        }
        Ok(pid)
    }

    /// Terminate one agent: SIGTERM, a short grace period, then SIGKILL.
    pub async fn stop_agent(&self, agent_id: &str) -> Result<(), SupervisorError> {
        let managed = self
            .running
            .lock()
            .remove(agent_id)
            .ok_or_else(|| SupervisorError::NotRunning(agent_id.to_string()))?;
        self.clients.lock().remove(agent_id);
        shutdown_managed(agent_id, managed).await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, ManagedAgent)> = self.running.lock().drain().collect();
        self.clients.lock().clear();
        for (agent_id, managed) in drained {
            shutdown_managed(&agent_id, managed).await;
        }
    }
}

#[async_trait]
impl AgentLauncher for ProcessSupervisor {
    async fn start_agent(
        &self,
        agent_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), SupervisorError> {
        if self.is_running(agent_id) {
            tracing::debug!(target = "agent_gateway::supervisor", agent = %agent_id, "agent already running");
            return Ok(());
        }
        if !self.starting.lock().insert(agent_id.to_string()) {
            tracing::debug!(target = "agent_gateway::supervisor", agent = %agent_id, "agent start already in progress");
            return Ok(());
        }

        let result = self.spawn(agent_id, parent_id).await;
        self.starting.lock().remove(agent_id);

        match result {
            Ok(pid) => {
                tracing::info!(
                    target = "agent_gateway::supervisor",
                    agent = %agent_id,
                    parent = ?parent_id,
                    pid,
                    "agent started"
                );
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    target = "agent_gateway::supervisor",
                    agent = %agent_id,
                    error = %error,
                    "failed to start agent"
                );
                Err(error)
            }
        }
    }

    fn client_for(&self, agent_id: &str) -> Option<String> {
        self.clients.lock().get(agent_id).cloned()
    }

    fn running(&self) -> Vec<Value> {
        self.list_running()
    }
}

async fn shutdown_managed(agent_id: &str, mut managed: ManagedAgent) {
    if let Some(stop_tx) = managed.stop_tx.take() {
        let _ = stop_tx.send(());
    }
    if let Some(waiter) = managed.waiter.take() {
        if let Err(error) = waiter.await {
            tracing::warn!(
                target = "agent_gateway::supervisor",
                agent = %agent_id,
                error = %error,
                "agent waiter task failed"
            );
        }
    }
    tracing::info!(target = "agent_gateway::supervisor", agent = %agent_id, "agent stopped");
}

/// Owns the child until it exits on its own or a stop is requested.
async fn watch_child(
    agent_id: String,
    generation: u64,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    running: RunningMap,
    clients: ClientMap,
    stop_timeout: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let current = {
                let mut running = running.lock();
                let current = running.get(&agent_id).is_some_and(|m| m.generation == generation);
                if current {
                    running.remove(&agent_id);
                }
                current
            };
            if current {
                clients.lock().remove(&agent_id);
            }
            match status {
                Ok(status) => tracing::warn!(
                    target = "agent_gateway::supervisor",
                    agent = %agent_id,
                    code = ?status.code(),
                    "agent process exited"
                ),
                Err(error) => tracing::warn!(
                    target = "agent_gateway::supervisor",
                    agent = %agent_id,
                    error = %error,
                    "failed waiting on agent process"
                ),
            }
        }
        _ = stop_rx => {
            terminate_child(&mut child, stop_timeout).await;
        }
    }
}

/// SIGTERM the agent's process group, wait up to `timeout_duration`, then
/// SIGKILL whatever is left of the group.
pub async fn terminate_child(child: &mut Child, timeout_duration: Duration) {
    #[cfg(unix)]
    let pid = child.id().map(|pid| Pid::from_raw(pid as i32));

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }

    let exited = timeout(timeout_duration, child.wait()).await.is_ok();

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            if exited {
                // The leader is reaped; only stragglers in its group remain.
                let _ = killpg(pid, Signal::SIGKILL);
            } else {
                signal_group(pid, Signal::SIGKILL);
            }
        }
    }

    if !exited {
        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }
        let _ = child.wait().await;
    }
}

/// Agents lead their own session, so their pid is also their group id.
/// A child without its own group gets the signal directly.
#[cfg(unix)]
fn signal_group(pid: Pid, signal: Signal) {
    if killpg(pid, signal).is_err() {
        let _ = kill(pid, signal);
    }
}

fn pipe_output<R>(agent_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(
                target = "agent_gateway::agent_output",
                agent = %agent_id,
                stream,
                "{line}"
            );
        }
    });
}

fn read_metadata(dir: &Path) -> Option<AgentMetadata> {
    let raw = std::fs::read(dir.join(METADATA_FILE)).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn merge_id(mut record: Value, agent_id: &str) -> Value {
    if let Value::Object(map) = &mut record {
        map.entry("id").or_insert_with(|| Value::from(agent_id));
    }
    record
}

/// Directory-safe form of an agent id.
pub fn sanitize_agent_id(agent_id: &str) -> String {
    let cleaned: String = agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

fn extract_package(bytes: &[u8], dest: &Path) -> Result<(), SupervisorError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    std::fs::create_dir_all(dest)?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let relative = file
            .enclosed_name()
            .ok_or_else(|| SupervisorError::UnsafeArchivePath(file.name().to_string()))?;
        let out = dest.join(relative);
        if file.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        std::fs::write(&out, contents)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use httpmock::Method::GET;
    use httpmock::MockServer;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn options(dir: &Path, registry_url: &str, runtime: &str) -> SupervisorOptions {
        SupervisorOptions {
            agents_dir: dir.to_path_buf(),
            registry_url: registry_url.to_string(),
            runtime: runtime.to_string(),
            gateway_url: "ws://127.0.0.1:12345".to_string(),
            stop_timeout: Duration::from_millis(200),
        }
    }

    fn zip_with(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let opts =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, body) in files {
            writer.start_file(*name, opts).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn install_script(root: &Path, agent_id: &str, script: &str) {
        let dir = root.join(agent_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), script).unwrap();
        std::fs::write(
            dir.join(METADATA_FILE),
            serde_json::json!({"id": agent_id, "entryPoint": "run.sh"}).to_string(),
        )
        .unwrap();
    }

    #[test]
    fn sanitizes_agent_ids() {
        assert_eq!(sanitize_agent_id("my-agent_1.0"), "my-agent_1.0");
        assert_eq!(sanitize_agent_id("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_agent_id(".."), "_");
        assert_eq!(sanitize_agent_id("a b/c"), "a_b_c");
    }

    #[tokio::test]
    async fn existing_install_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(tmp.path(), "local", "exit 0");
        // Unroutable registry: any network call would fail the test.
        let sup = ProcessSupervisor::new(options(tmp.path(), "http://127.0.0.1:9", "sh"));
        let dir = sup.ensure_agent_exists("local").await.unwrap();
        assert_eq!(dir, tmp.path().join("local"));
    }

    #[tokio::test]
    async fn downloads_and_extracts_missing_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let server = MockServer::start();
        let package = zip_with(&[("dist/index.js", "console.log('hi')"), ("README.md", "x")]);
        let meta = server.mock(|when, then| {
            when.method(GET).path("/api/agents/remote-agent");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "data": {
                        "name": "Remote Agent",
                        "version": "1.2.0",
                        "zipFilePath": server.url("/pkg/remote-agent.zip"),
                    }
                }));
        });
        let pkg = server.mock(|when, then| {
            when.method(GET).path("/pkg/remote-agent.zip");
            then.status(200).body(package.clone());
        });

        let sup = ProcessSupervisor::new(options(tmp.path(), &server.base_url(), "node"));
        let dir = sup.ensure_agent_exists("remote-agent").await.unwrap();

        assert!(dir.join("dist/index.js").is_file());
        let persisted = read_metadata(&dir).unwrap();
        assert_eq!(persisted.id, "remote-agent");
        assert_eq!(persisted.version.as_deref(), Some("1.2.0"));
        meta.assert_hits(1);
        pkg.assert_hits(1);

        // Second call is served from disk.
        sup.ensure_agent_exists("remote-agent").await.unwrap();
        meta.assert_hits(1);
    }

    #[tokio::test]
    async fn missing_entry_point_removes_partial_install() {
        let tmp = tempfile::tempdir().unwrap();
        let server = MockServer::start();
        let package = zip_with(&[("lib/other.js", "x")]);
        server.mock(|when, then| {
            when.method(GET).path("/api/agents/broken");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "downloadUrl": server.url("/pkg/broken.zip"),
                }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/pkg/broken.zip");
            then.status(200).body(package.clone());
        });

        let sup = ProcessSupervisor::new(options(tmp.path(), &server.base_url(), "node"));
        let err = sup.ensure_agent_exists("broken").await.unwrap_err();
        assert!(matches!(err, SupervisorError::MissingEntryPoint(_)));
        assert!(!tmp.path().join("broken").exists());
    }

    #[tokio::test]
    async fn registry_miss_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/agents/ghost");
            then.status(404);
        });
        let sup = ProcessSupervisor::new(options(tmp.path(), &server.base_url(), "node"));
        let err = sup.ensure_agent_exists("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::RegistryStatus { status: 404, .. }
        ));
        assert!(!tmp.path().join("ghost").exists());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn start_tracks_and_stop_terminates() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(tmp.path(), "sleeper", "sleep 30");
        let sup = ProcessSupervisor::new(options(tmp.path(), "http://127.0.0.1:9", "sh"));

        sup.start_agent("sleeper", Some("app-1")).await.unwrap();
        assert!(sup.is_running("sleeper"));
        assert_eq!(sup.client_for("sleeper").as_deref(), Some("app-1"));
        assert_eq!(sup.list_running()[0]["parentId"], "app-1");

        // Already running: no second process.
        sup.start_agent("sleeper", Some("app-1")).await.unwrap();
        assert_eq!(sup.list_running().len(), 1);

        sup.stop_agent("sleeper").await.unwrap();
        assert!(!sup.is_running("sleeper"));
        assert_eq!(sup.client_for("sleeper"), None);
        assert!(matches!(
            sup.stop_agent("sleeper").await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn exited_agent_is_untracked() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(tmp.path(), "quick", "exit 3");
        let sup = ProcessSupervisor::new(options(tmp.path(), "http://127.0.0.1:9", "sh"));

        sup.start_agent("quick", Some("app-1")).await.unwrap();
        for _ in 0..50 {
            if !sup.is_running("quick") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!sup.is_running("quick"));
        assert_eq!(sup.client_for("quick"), None);

        // A later start is not blocked by the stale entry.
        sup.start_agent("quick", None).await.unwrap();
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        install_script(tmp.path(), "norun", "exit 0");
        let sup = ProcessSupervisor::new(options(
            tmp.path(),
            "http://127.0.0.1:9",
            "definitely-not-a-runtime-binary",
        ));
        let err = sup.start_agent("norun", None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert!(!sup.is_running("norun"));
    }

    #[test]
    fn metadata_url_escapes_agent_id() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(options(tmp.path(), "http://registry.test/base/", "node"));
        assert_eq!(
            sup.metadata_url("plain").unwrap().as_str(),
            "http://registry.test/base/api/agents/plain"
        );
        assert_eq!(
            sup.metadata_url("../a/b?x#y").unwrap().as_str(),
            "http://registry.test/base/api/agents/..%2Fa%2Fb%3Fx%23y"
        );

        let sup = ProcessSupervisor::new(options(tmp.path(), "not a url", "node"));
        assert!(matches!(
            sup.metadata_url("plain"),
            Err(SupervisorError::RegistryUrl(_))
        ));
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: i32) -> bool {
        if kill(Pid::from_raw(pid), None).is_err() {
            return true;
        }
        // Orphans may linger as zombies until init reaps them.
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| {
                stat.rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(true)
    }

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn terminate_child_takes_down_the_process_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30 & echo $!; wait")
            .stdout(Stdio::piped());
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }
        let mut child = cmd.spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        let line = BufReader::new(stdout).lines().next_line().await.unwrap().unwrap();
        let grandchild: i32 = line.trim().parse().unwrap();
        assert!(!is_gone(grandchild));

        terminate_child(&mut child, Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());

        let mut gone = false;
        for _ in 0..50 {
            if is_gone(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} survived");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn terminate_child_kills_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate_child(&mut child, Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
