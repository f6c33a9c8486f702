//! One provider lane of a run.
//!
//! Each lane provisions a sandbox, clones the repository inside it,
//! installs dependencies, starts the agent server as a background process,
//! and relays the agent's own event stream onto the run bus tagged with the
//! lane's provider. Failures are classified, surfaced as `error` events,
//! and never touch peer lanes.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bus::AgentEventType;
use crate::capability::Driver;
use crate::client;
use crate::error::{with_backoff, DriverResult, SandboxError};
use crate::provider::DriverRegistry;
use crate::types::{
    ChunkChannel, CreateOptions, Provider, RunCommand, StartProcessOptions,
};

use super::{LanePhase, RunHandle, RunRequest};

/// Grace window for destroying a sandbox after cancellation.
const CLEANUP_GRACE: Duration = Duration::from_secs(30);

/// Attempts per retryable provider call. Retries are a lane decision, not
/// the facade's; streams are never retried because they are not
/// restartable.
const CALL_ATTEMPTS: u32 = 3;

pub(crate) struct LaneContext {
    pub run_id: String,
    pub provider: Provider,
    pub registry: Arc<DriverRegistry>,
    pub handle: Arc<RunHandle>,
    pub request: RunRequest,
    pub provisioned: oneshot::Sender<Result<String, String>>,
}

pub(crate) async fn run_lane(ctx: LaneContext) {
    let LaneContext {
        run_id,
        provider,
        registry,
        handle,
        request,
        provisioned,
    } = ctx;
    let cancel = handle.cancel_token();

    let driver = match registry.get(provider) {
        Ok(d) => d.clone(),
        Err(e) => {
            let _ = provisioned.send(Err(e.to_string()));
            fail_lane(&handle, provider, &e);
            return;
        }
    };

    let mut provisioned = Some(provisioned);
    let outcome = tokio::select! {
        r = drive(&run_id, provider, &driver, &handle, &request, &mut provisioned) => r,
        _ = cancel.cancelled() => {
            info!(run = %run_id, %provider, "lane cancelled");
            handle.bus.publish(
                AgentEventType::Status,
                Some(provider),
                json!({"message": "stopped"}),
            );
            cleanup(&driver, &handle, provider).await;
            handle.update_lane(provider, |l| l.status = LanePhase::Failed);
            return;
        }
    };

    match outcome {
        Ok(()) => {
            info!(run = %run_id, %provider, "lane completed");
            handle.update_lane(provider, |l| l.status = LanePhase::Completed);
        }
        Err(e) => {
            warn!(run = %run_id, %provider, error = %e, "lane failed");
            // A dropped sender is fine here; start() already answered.
            if let Some(tx) = provisioned.take() {
                let _ = tx.send(Err(e.to_string()));
            }
            fail_lane(&handle, provider, &e);
        }
    }
}

fn fail_lane(handle: &RunHandle, provider: Provider, error: &SandboxError) {
    handle.bus.publish(
        AgentEventType::Error,
        Some(provider),
        json!({
            "message": error.message.clone(),
            "kind": error.kind,
            "operation": error.context.operation.clone(),
        }),
    );
    handle.update_lane(provider, |l| l.status = LanePhase::Failed);
}

/// Destroy the lane's sandbox, bounded by the grace window. Sandboxes
/// abandoned past the window are the provider's to reap.
async fn cleanup(driver: &Driver, handle: &RunHandle, provider: Provider) {
    let sandbox_id = handle
        .state()
        .per_provider
        .get(provider.as_str())
        .and_then(|l| l.sandbox_id.clone());
    let Some(sandbox_id) = sandbox_id else { return };
    let destroy = driver.lifecycle().destroy(&sandbox_id);
    match tokio::time::timeout(CLEANUP_GRACE, destroy).await {
        Ok(Ok(())) => debug!(%sandbox_id, "sandbox destroyed on cleanup"),
        Ok(Err(e)) => warn!(%sandbox_id, error = %e, "cleanup destroy failed"),
        Err(_) => warn!(%sandbox_id, "cleanup destroy timed out, abandoning sandbox"),
    }
}

async fn drive(
    run_id: &str,
    provider: Provider,
    driver: &Driver,
    handle: &RunHandle,
    request: &RunRequest,
    provisioned: &mut Option<oneshot::Sender<Result<String, String>>>,
) -> DriverResult<()> {
    let config = &request.config;

    // ── Provision ────────────────────────────────────────────────────────
    let opts = CreateOptions {
        name: Some(format!("{run_id}-{provider}")),
        encrypted_ports: vec![config.agent_port],
        ..Default::default()
    };
    let lifecycle = driver.lifecycle();
    let created = with_backoff(CALL_ATTEMPTS, || lifecycle.create(opts.clone())).await;
    let info = match created {
        Ok(info) => {
            if let Some(tx) = provisioned.take() {
                let _ = tx.send(Ok(info.id.clone()));
            }
            info
        }
        Err(e) => {
            if let Some(tx) = provisioned.take() {
                let _ = tx.send(Err(e.to_string()));
            }
            return Err(e);
        }
    };
    let sandbox_id = info.id.clone();
    handle.update_lane(provider, |l| l.sandbox_id = Some(sandbox_id.clone()));
    handle.bus.publish(
        AgentEventType::Status,
        Some(provider),
        json!({"message": "sandbox created", "sandboxId": &sandbox_id}),
    );

    // ── Clone ────────────────────────────────────────────────────────────
    handle.update_lane(provider, |l| l.status = LanePhase::Cloning);
    clone_repository(provider, driver, handle, request, &sandbox_id).await?;

    // ── Install ──────────────────────────────────────────────────────────
    handle.update_lane(provider, |l| l.status = LanePhase::Installing);
    install_dependencies(provider, driver, handle, request, &sandbox_id).await?;

    // ── Agent ────────────────────────────────────────────────────────────
    let (cmd, args) = config
        .agent_command
        .split_first()
        .map(|(c, rest)| (c.clone(), rest.to_vec()))
        .ok_or_else(|| SandboxError::validation("agent command is empty"))?;
    driver
        .process()
        .start_process(
            &sandbox_id,
            StartProcessOptions {
                cmd,
                args,
                cwd: Some(config.workdir.clone()),
                env: Default::default(),
                background: true,
            },
        )
        .await?;

    let process = driver.process();
    let agent_ports = [config.agent_port];
    let urls = with_backoff(CALL_ATTEMPTS, || {
        process.process_urls(&sandbox_id, &agent_ports)
    })
    .await?;
    let base_url = urls
        .get(&config.agent_port)
        .cloned()
        .ok_or_else(|| {
            SandboxError::provider(format!("no url for agent port {}", config.agent_port))
                .with_provider(provider)
                .with_sandbox(&sandbox_id)
        })?;

    wait_until_healthy(provider, handle, config, &base_url, &sandbox_id).await?;
    handle.update_lane(provider, |l| {
        l.status = LanePhase::Running;
        l.opencode_url = Some(base_url.clone());
    });

    // Kick the agent loop off, then follow its event stream.
    let start_url = format!("{base_url}{}", config.start_path);
    let kick = reqwest::Client::new()
        .post(&start_url)
        .json(&json!({
            "task": &request.task,
            "repoUrl": &request.repo_url,
            "branch": &request.branch,
            "maxIterations": config.max_iterations,
        }))
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| {
            SandboxError::network(format!("agent start failed: {e}"))
                .with_provider(provider)
                .with_sandbox(&sandbox_id)
        })?;
    if !kick.status().is_success() {
        return Err(SandboxError::provider(format!(
            "agent start answered {}",
            kick.status()
        ))
        .with_provider(provider)
        .with_sandbox(&sandbox_id));
    }

    relay_agent_events(provider, handle, config, &base_url, &sandbox_id).await
}

static PROGRESS_RE: OnceLock<Regex> = OnceLock::new();

/// Pull the percentage out of a git progress line
/// (`Receiving objects:  42% (128/305)`).
fn clone_percent(line: &str) -> Option<u8> {
    let re = PROGRESS_RE.get_or_init(|| Regex::new(r"(\d{1,3})%").unwrap());
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|p| *p <= 100)
}

async fn clone_repository(
    provider: Provider,
    driver: &Driver,
    handle: &RunHandle,
    request: &RunRequest,
    sandbox_id: &str,
) -> DriverResult<()> {
    let config = &request.config;
    handle.bus.publish(
        AgentEventType::Status,
        Some(provider),
        json!({"message": "cloning repository", "repoUrl": &request.repo_url}),
    );

    let cmd = RunCommand::new("git")
        .args(["clone", "--progress", "--single-branch", "--branch"])
        .arg(&request.branch)
        .arg(&request.repo_url)
        .arg(&config.workdir);
    let mut stream = driver.process().stream(sandbox_id, cmd).await?;

    // Git reports progress on stderr.
    let consume = async {
        while let Some(chunk) = stream.next().await {
            if chunk.channel != ChunkChannel::Stderr {
                continue;
            }
            let text = String::from_utf8_lossy(&chunk.data);
            for line in text.split(['\n', '\r']) {
                if let Some(percent) = clone_percent(line) {
                    handle.bus.publish(
                        AgentEventType::CloneProgress,
                        Some(provider),
                        json!({"percent": percent, "message": line.trim()}),
                    );
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_millis(config.clone_timeout_ms), consume)
        .await
        .map_err(|_| {
            SandboxError::timeout("clone did not finish in time")
                .with_provider(provider)
                .with_sandbox(sandbox_id)
        })?;

    // The stream carries no exit code; confirm the checkout landed.
    let process = driver.process();
    let check_cmd = RunCommand::new("sh")
        .arg("-c")
        .arg(format!("test -d {}/.git", config.workdir));
    let check = with_backoff(CALL_ATTEMPTS, || {
        process.run(sandbox_id, check_cmd.clone())
    })
    .await?;
    if !check.success() {
        return Err(SandboxError::provider("clone did not produce a repository")
            .with_provider(provider)
            .with_operation("clone")
            .with_sandbox(sandbox_id));
    }
    handle.bus.publish(
        AgentEventType::CloneProgress,
        Some(provider),
        json!({"percent": 100, "message": "clone complete"}),
    );
    Ok(())
}

async fn install_dependencies(
    provider: Provider,
    driver: &Driver,
    handle: &RunHandle,
    request: &RunRequest,
    sandbox_id: &str,
) -> DriverResult<()> {
    let config = &request.config;
    let workdir = &config.workdir;

    let process = driver.process();
    let probe_cmd = RunCommand::new("sh").arg("-c").arg(format!(
        "if [ -f {workdir}/package.json ]; then echo node; \
         elif [ -f {workdir}/requirements.txt ]; then echo python; \
         else echo none; fi"
    ));
    let probe = with_backoff(CALL_ATTEMPTS, || {
        process.run(sandbox_id, probe_cmd.clone())
    })
    .await?;

    let install = match probe.stdout.trim() {
        "node" => Some(
            RunCommand::new("npm")
                .args(["install", "--no-audit", "--no-fund"])
                .cwd(workdir.clone()),
        ),
        "python" => Some(
            RunCommand::new("pip")
                .args(["install", "-r", "requirements.txt"])
                .cwd(workdir.clone()),
        ),
        _ => None,
    };

    let Some(install) = install else {
        handle.bus.publish(
            AgentEventType::InstallProgress,
            Some(provider),
            json!({"message": "no dependencies to install"}),
        );
        return Ok(());
    };

    handle.bus.publish(
        AgentEventType::InstallProgress,
        Some(provider),
        json!({"message": format!("installing dependencies with {}", install.cmd)}),
    );
    let mut stream = driver.process().stream(sandbox_id, install).await?;
    let consume = async {
        while let Some(chunk) = stream.next().await {
            let text = String::from_utf8_lossy(&chunk.data);
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                handle.bus.publish(
                    AgentEventType::InstallProgress,
                    Some(provider),
                    json!({"message": line.trim()}),
                );
            }
        }
    };
    tokio::time::timeout(Duration::from_millis(config.install_timeout_ms), consume)
        .await
        .map_err(|_| {
            SandboxError::timeout("dependency install did not finish in time")
                .with_provider(provider)
                .with_sandbox(sandbox_id)
        })?;
    Ok(())
}

async fn wait_until_healthy(
    provider: Provider,
    handle: &RunHandle,
    config: &super::RunConfig,
    base_url: &str,
    sandbox_id: &str,
) -> DriverResult<()> {
    let health_url = format!("{base_url}{}", config.health_path);
    let deadline = tokio::time::Instant::now()
        + Duration::from_millis(config.ready_timeout_ms);
    loop {
        if client::probe_http(&health_url, Duration::from_secs(5)).await {
            handle.bus.publish(
                AgentEventType::OpencodeReady,
                Some(provider),
                json!({"url": base_url}),
            );
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SandboxError::timeout(format!(
                "agent at {health_url} never became healthy"
            ))
            .with_provider(provider)
            .with_sandbox(sandbox_id));
        }
        tokio::time::sleep(Duration::from_millis(config.health_poll_interval_ms)).await;
    }
}

/// Follow the agent's SSE stream, tagging each upstream event with this
/// lane's provider. `ralph_complete` ends the lane; a stream that ends
/// without one is a failure.
async fn relay_agent_events(
    provider: Provider,
    handle: &RunHandle,
    config: &super::RunConfig,
    base_url: &str,
    sandbox_id: &str,
) -> DriverResult<()> {
    let events_url = format!("{base_url}{}", config.events_path);
    let mut records = client::sse_records(&events_url).await?;
    while let Some(record) = records.next().await {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&record) else {
            debug!(%record, "skipping unparseable agent record");
            continue;
        };
        let event_type = AgentEventType::parse(value["type"].as_str().unwrap_or(""));
        if let Some(session) = value["sessionId"].as_str() {
            let session = session.to_string();
            handle.update_lane(provider, |l| l.session_id = Some(session));
        }
        let data = if value["data"].is_null() {
            value.clone()
        } else {
            value["data"].clone()
        };
        handle.bus.publish(event_type, Some(provider), data);
        if event_type == AgentEventType::RalphComplete {
            return Ok(());
        }
    }
    Err(SandboxError::provider("agent stream ended before completion")
        .with_provider(provider)
        .with_sandbox(sandbox_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFrame;
    use crate::capability::{Capabilities, Code, Fs, Lifecycle, Process};
    use crate::error::DriverResult;
    use crate::run::{Orchestrator, RunConfig, RunStatus};
    use crate::types::{
        ChunkStream, FsEntry, ProcessChunk, ProcessInfo, ProcessStatus, RunCodeInput, RunResult,
        SandboxInfo, SandboxStatus,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn clone_percent_parses_git_progress() {
        assert_eq!(clone_percent("Receiving objects:  42% (128/305)"), Some(42));
        assert_eq!(clone_percent("Resolving deltas: 100% (88/88), done."), Some(100));
        assert_eq!(clone_percent("Cloning into '/workspace/repo'..."), None);
    }

    /// In-memory driver whose agent endpoint is a mock HTTP server.
    struct FakeAdapter {
        agent_base: String,
        destroyed: Arc<AtomicBool>,
        /// Remaining create calls that fail with a transient network error.
        create_failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Lifecycle for FakeAdapter {
        async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
            if self
                .create_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SandboxError::network("connection reset by peer"));
            }
            Ok(SandboxInfo {
                id: "fake-sbx-1".into(),
                name: opts.name,
                provider: Provider::Docker,
                status: SandboxStatus::Ready,
                created_at: chrono::Utc::now(),
                metadata: BTreeMap::new(),
            })
        }

        async fn destroy(&self, _id: &str) -> DriverResult<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self, _id: &str) -> DriverResult<SandboxStatus> {
            Ok(SandboxStatus::Ready)
        }

        async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
            Ok(vec![])
        }

        async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
            Ok(SandboxInfo {
                id: id.to_string(),
                name: None,
                provider: Provider::Docker,
                status: SandboxStatus::Ready,
                created_at: chrono::Utc::now(),
                metadata: BTreeMap::new(),
            })
        }
    }

    #[async_trait]
    impl Process for FakeAdapter {
        async fn run(&self, _id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
            // The install probe answers "node"; every check passes.
            let stdout = if cmd.args.iter().any(|a| a.contains("package.json")) {
                "node\n".to_string()
            } else {
                String::new()
            };
            Ok(RunResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            })
        }

        async fn stream(&self, _id: &str, cmd: RunCommand) -> DriverResult<ChunkStream> {
            let chunks = if cmd.cmd == "git" {
                vec![
                    ProcessChunk::stderr(&b"Cloning into '/workspace/repo'...\n"[..]),
                    ProcessChunk::stderr(&b"Receiving objects:  42% (128/305)\r"[..]),
                    ProcessChunk::stderr(&b"Receiving objects: 100% (305/305), done.\n"[..]),
                ]
            } else {
                vec![ProcessChunk::stdout(&b"added 120 packages in 3s\n"[..])]
            };
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn start_process(
            &self,
            _id: &str,
            _opts: StartProcessOptions,
        ) -> DriverResult<ProcessInfo> {
            Ok(ProcessInfo {
                id: "81".into(),
                status: ProcessStatus::Running,
            })
        }

        async fn stop_process(&self, _id: &str, _proc_id: &str) -> DriverResult<()> {
            Ok(())
        }

        async fn process_urls(
            &self,
            _id: &str,
            ports: &[u16],
        ) -> DriverResult<BTreeMap<u16, String>> {
            Ok(ports.iter().map(|p| (*p, self.agent_base.clone())).collect())
        }
    }

    #[async_trait]
    impl Fs for FakeAdapter {
        async fn read_file(&self, _id: &str, _path: &str) -> DriverResult<Bytes> {
            Ok(Bytes::new())
        }

        async fn write_file(
            &self,
            _id: &str,
            _path: &str,
            _data: Bytes,
            _mode: Option<u32>,
        ) -> DriverResult<()> {
            Ok(())
        }

        async fn list_dir(
            &self,
            _id: &str,
            _path: &str,
            _recursive: bool,
        ) -> DriverResult<Vec<FsEntry>> {
            Ok(vec![])
        }

        async fn mkdir(&self, _id: &str, _path: &str) -> DriverResult<()> {
            Ok(())
        }

        async fn rm(&self, _id: &str, _path: &str, _recursive: bool, _force: bool) -> DriverResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Code for FakeAdapter {
        async fn run_code(&self, _id: &str, _input: RunCodeInput) -> DriverResult<RunResult> {
            Ok(RunResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn registry_with_fake(agent_base: String, destroyed: Arc<AtomicBool>) -> DriverRegistry {
        registry_with_flaky(agent_base, destroyed, 0)
    }

    fn registry_with_flaky(
        agent_base: String,
        destroyed: Arc<AtomicBool>,
        create_failures: usize,
    ) -> DriverRegistry {
        let adapter = Arc::new(FakeAdapter {
            agent_base,
            destroyed,
            create_failures: std::sync::atomic::AtomicUsize::new(create_failures),
        });
        let driver = Driver::new(
            Provider::Docker,
            Capabilities {
                background_processes: true,
                process_urls: true,
                ..Default::default()
            },
            adapter.clone(),
            adapter.clone(),
            adapter.clone(),
            adapter,
        );
        let mut registry = DriverRegistry::new();
        registry.register(driver);
        registry
    }

    fn request(config: RunConfig) -> RunRequest {
        RunRequest {
            repo_url: "https://github.com/acme/app.git".into(),
            branch: "main".into(),
            task: "fix the tests".into(),
            providers: vec![Provider::Docker],
            config,
        }
    }

    fn fast_config() -> RunConfig {
        RunConfig {
            ready_timeout_ms: 5_000,
            health_poll_interval_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lane_runs_to_completion_and_relays_agent_events() {
        let agent = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&agent)
            .await;
        Mock::given(method("POST"))
            .and(path("/ralph/start"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&agent)
            .await;
        let events = "\
data: {\"type\":\"thought\",\"data\":{\"text\":\"reading code\"},\"sessionId\":\"ses-1\"}\n\
data: {\"type\":\"ralph_iteration\",\"data\":{\"iteration\":1}}\n\
data: {\"type\":\"ralph_complete\",\"data\":{\"iterations\":1}}\n";
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(events),
            )
            .mount(&agent)
            .await;

        let destroyed = Arc::new(AtomicBool::new(false));
        let registry = registry_with_fake(agent.uri(), destroyed);
        let orchestrator = Orchestrator::new(Arc::new(registry));

        let report = orchestrator.start(request(fast_config())).await.unwrap();
        assert_eq!(report.providers.len(), 1);
        assert!(report.providers[0].success);
        assert_eq!(report.providers[0].sandbox_id.as_deref(), Some("fake-sbx-1"));

        let handle = orchestrator.get(&report.run_id).unwrap();
        let frames: Vec<BusFrame> = tokio::time::timeout(
            Duration::from_secs(10),
            handle.bus.subscribe().collect::<Vec<_>>(),
        )
        .await
        .expect("run did not finish");

        let types: Vec<AgentEventType> = frames
            .iter()
            .filter_map(|f| match f {
                BusFrame::Event(e) => Some(e.event_type),
                _ => None,
            })
            .collect();
        assert!(types.contains(&AgentEventType::CloneProgress));
        assert!(types.contains(&AgentEventType::InstallProgress));
        assert!(types.contains(&AgentEventType::OpencodeReady));
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == AgentEventType::RalphComplete)
                .count(),
            1
        );

        let state = handle.state();
        assert_eq!(state.status, RunStatus::Completed);
        let lane = &state.per_provider["docker"];
        assert_eq!(lane.status, LanePhase::Completed);
        assert_eq!(lane.session_id.as_deref(), Some("ses-1"));
        assert!(lane.opencode_url.is_some());
    }

    #[tokio::test]
    async fn stop_cancels_lane_and_destroys_sandbox() {
        let agent = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&agent)
            .await;
        Mock::given(method("POST"))
            .and(path("/ralph/start"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&agent)
            .await;
        // The event stream stalls so the lane stays in the relay phase.
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_delay(Duration::from_secs(30))
                    .set_body_string("data: {\"type\":\"thought\",\"data\":{}}\n"),
            )
            .mount(&agent)
            .await;

        let destroyed = Arc::new(AtomicBool::new(false));
        let registry = registry_with_fake(agent.uri(), destroyed.clone());
        let orchestrator = Orchestrator::new(Arc::new(registry));

        let report = orchestrator.start(request(fast_config())).await.unwrap();
        let handle = orchestrator.get(&report.run_id).unwrap();

        // Give the lane a moment to get going, then cancel.
        tokio::time::sleep(Duration::from_millis(300)).await;
        orchestrator.stop(&report.run_id).unwrap();

        let frames: Vec<BusFrame> = tokio::time::timeout(
            Duration::from_secs(10),
            handle.bus.subscribe().collect::<Vec<_>>(),
        )
        .await
        .expect("run did not settle after stop");

        assert!(frames.iter().any(|f| matches!(
            f,
            BusFrame::Event(e)
                if e.event_type == AgentEventType::Status
                    && e.data["message"] == "stopped"
        )));
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(handle.is_terminal());
    }

    #[tokio::test]
    async fn transient_create_failure_is_retried() {
        let agent = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&agent)
            .await;
        Mock::given(method("POST"))
            .and(path("/ralph/start"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&agent)
            .await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"type\":\"ralph_complete\",\"data\":{}}\n"),
            )
            .mount(&agent)
            .await;

        // The first create attempt fails with a network error; the lane's
        // backoff policy must absorb it.
        let destroyed = Arc::new(AtomicBool::new(false));
        let registry = registry_with_flaky(agent.uri(), destroyed, 1);
        let orchestrator = Orchestrator::new(Arc::new(registry));

        let report = orchestrator.start(request(fast_config())).await.unwrap();
        assert!(report.providers[0].success);
        assert_eq!(report.providers[0].sandbox_id.as_deref(), Some("fake-sbx-1"));

        let handle = orchestrator.get(&report.run_id).unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            handle.bus.subscribe().collect::<Vec<_>>(),
        )
        .await
        .expect("run did not finish");
        assert_eq!(handle.state().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn lane_failure_reports_error_event() {
        // Agent server that never becomes healthy.
        let agent = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&agent)
            .await;

        let destroyed = Arc::new(AtomicBool::new(false));
        let registry = registry_with_fake(agent.uri(), destroyed);
        let orchestrator = Orchestrator::new(Arc::new(registry));

        let config = RunConfig {
            ready_timeout_ms: 200,
            health_poll_interval_ms: 50,
            ..Default::default()
        };
        let report = orchestrator.start(request(config)).await.unwrap();
        // Provisioning succeeded even though the run later fails.
        assert!(report.providers[0].success);

        let handle = orchestrator.get(&report.run_id).unwrap();
        let frames: Vec<BusFrame> = tokio::time::timeout(
            Duration::from_secs(10),
            handle.bus.subscribe().collect::<Vec<_>>(),
        )
        .await
        .expect("run did not settle");

        assert!(frames.iter().any(|f| matches!(
            f,
            BusFrame::Event(e)
                if e.event_type == AgentEventType::Error && e.data["kind"] == "timeout"
        )));
        assert_eq!(handle.state().status, RunStatus::Failed);
    }
}
