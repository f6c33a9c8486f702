//! E2B adapter.
//!
//! Control-plane REST for lifecycle, command execution through the
//! sandbox's agent endpoint, port URLs synthesized from E2B's
//! `{port}-{sandboxId}` host scheme. No persistent volumes or snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::capability::{Capabilities, Driver, Lifecycle, Process};
use crate::client::ProviderClient;
use crate::config::RestSettings;
use crate::error::{DriverResult, ErrorKind, SandboxError};
use crate::shellops::{self, ShellCode, ShellFs};
use crate::types::{
    ChunkStream, CreateOptions, ProcessChunk, ProcessInfo, ProcessStatus, Provider, RunCommand,
    RunResult, SandboxInfo, SandboxStatus, StartProcessOptions,
};

const DEFAULT_TEMPLATE: &str = "base";

/// Compose the E2B driver from settings.
pub fn compose(settings: RestSettings) -> Driver {
    let adapter = Arc::new(E2bAdapter::new(settings));
    let capabilities = Capabilities {
        pause_resume: false,
        background_processes: true,
        process_urls: true,
        snapshots: false,
        snapshot_restore: false,
        volumes: false,
    };
    Driver::new(
        Provider::E2b,
        capabilities,
        adapter.clone(),
        adapter.clone(),
        Arc::new(ShellFs::new(adapter.clone() as Arc<dyn Process>)),
        Arc::new(ShellCode::new(adapter as Arc<dyn Process>)),
    )
}

pub struct E2bAdapter {
    client: ProviderClient,
    /// Public hostname suffix for sandbox port URLs, derived from the API
    /// base (`api.e2b.dev` → `e2b.dev`).
    domain: String,
}

impl E2bAdapter {
    pub fn new(settings: RestSettings) -> Self {
        let domain = settings
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("api.")
            .trim_end_matches('/')
            .to_string();
        let client = ProviderClient::new(Provider::E2b, settings.base_url, settings.timeout)
            .with_header("X-API-Key", settings.api_key);
        Self { client, domain }
    }

    fn info_from(&self, value: &serde_json::Value) -> SandboxInfo {
        SandboxInfo {
            id: value["sandboxID"].as_str().unwrap_or_default().to_string(),
            name: value["alias"].as_str().map(str::to_string),
            provider: Provider::E2b,
            status: map_state(value["state"].as_str()),
            created_at: value["startedAt"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            metadata: value["metadata"]
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }
}

fn map_state(state: Option<&str>) -> SandboxStatus {
    match state {
        Some("running") => SandboxStatus::Ready,
        Some("paused") => SandboxStatus::Stopped,
        Some("pending") => SandboxStatus::Creating,
        None => SandboxStatus::Ready,
        _ => SandboxStatus::Failed,
    }
}

#[async_trait]
impl Lifecycle for E2bAdapter {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        if !opts.volumes.is_empty() {
            return Err(SandboxError::unsupported("volumes").with_provider(Provider::E2b));
        }
        let template = opts
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        let timeout_secs = opts.timeout_ms.map(|ms| ms.div_ceil(1000)).unwrap_or(300);
        let body = json!({
            "templateID": template,
            "metadata": opts.name.as_ref().map(|n| json!({"name": n})).unwrap_or(json!({})),
            "envVars": opts.env,
            "timeout": timeout_secs,
        });
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::POST, "/sandboxes", Some(&body))
            .await?;
        let mut info = self.info_from(&value);
        info.name = opts.name;
        info.status = SandboxStatus::Ready;
        debug!(sandbox = %info.id, "created e2b sandbox");
        Ok(info)
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        self.client
            .request_empty(reqwest::Method::DELETE, &format!("/sandboxes/{id}"), None)
            .await
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &format!("/sandboxes/{id}"), None)
            .await?;
        Ok(map_state(value["state"].as_str()))
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        // Cursor pagination: follow nextToken until the server stops
        // returning one.
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let path = match &token {
                Some(t) => format!("/sandboxes?limit=100&nextToken={t}"),
                None => "/sandboxes?limit=100".to_string(),
            };
            let value: serde_json::Value = match self
                .client
                .request_json(reqwest::Method::GET, &path, None)
                .await
            {
                Ok(v) => v,
                Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::Timeout) => {
                    warn!(error = %e, "e2b list failed transiently, returning partial");
                    return Ok(out);
                }
                Err(e) => return Err(e),
            };
            // Both a bare array and the enveloped shape appear in the wild.
            let (items, next) = match value.as_array() {
                Some(items) => (items.clone(), None),
                None => (
                    value["sandboxes"].as_array().cloned().unwrap_or_default(),
                    value["nextToken"].as_str().map(str::to_string),
                ),
            };
            out.extend(items.iter().map(|v| self.info_from(v)));
            match next {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => return Ok(out),
            }
        }
    }

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &format!("/sandboxes/{id}"), None)
            .await?;
        Ok(self.info_from(&value))
    }
}

#[async_trait]
impl Process for E2bAdapter {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        // The agent endpoint takes a single command string; the base64
        // envelope carries argv, env, and cwd.
        let command = shellops::encode_command(&cmd);
        let body = json!({
            "cmd": command,
            "timeoutMs": cmd.timeout_ms,
        });
        let value: serde_json::Value = self
            .client
            .request_json(
                reqwest::Method::POST,
                &format!("/sandboxes/{id}/commands"),
                Some(&body),
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        Ok(RunResult {
            exit_code: value["exitCode"].as_i64().unwrap_or(-1) as i32,
            stdout: value["stdout"].as_str().unwrap_or_default().to_string(),
            stderr: value["stderr"].as_str().unwrap_or_default().to_string(),
        })
    }

    // No socket on this control plane; stream degrades to a buffered run.
    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream> {
        let result = self.run(id, cmd).await?;
        let mut chunks = Vec::new();
        if !result.stdout.is_empty() {
            chunks.push(ProcessChunk::stdout(result.stdout.into_bytes()));
        }
        if !result.stderr.is_empty() {
            chunks.push(ProcessChunk::stderr(result.stderr.into_bytes()));
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn start_process(
        &self,
        id: &str,
        opts: StartProcessOptions,
    ) -> DriverResult<ProcessInfo> {
        let inner = std::iter::once(opts.cmd.as_str())
            .chain(opts.args.iter().map(String::as_str))
            .map(|a| shell_words::quote(a).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let mut cmd = RunCommand::new("sh").arg("-c").arg(format!(
            "nohup {inner} > /tmp/crucible-proc.log 2>&1 & echo $!"
        ));
        cmd.env = opts.env;
        cmd.cwd = opts.cwd;
        let result = self.run(id, cmd).await?;
        let pid = result.stdout.trim().to_string();
        if !result.success() || pid.is_empty() {
            return Err(SandboxError::provider(format!(
                "failed to start background process: {}",
                result.stderr.trim()
            ))
            .with_provider(Provider::E2b)
            .with_sandbox(id));
        }
        Ok(ProcessInfo {
            id: pid,
            status: ProcessStatus::Running,
        })
    }

    async fn stop_process(&self, id: &str, proc_id: &str) -> DriverResult<()> {
        let result = self.run(id, RunCommand::new("kill").arg(proc_id)).await?;
        if !result.success() {
            return Err(SandboxError::not_found(format!(
                "process {proc_id} not running"
            ))
            .with_provider(Provider::E2b)
            .with_sandbox(id));
        }
        Ok(())
    }

    async fn process_urls(
        &self,
        id: &str,
        ports: &[u16],
    ) -> DriverResult<BTreeMap<u16, String>> {
        // E2B exposes every sandbox port at {port}-{sandboxId}.{domain}.
        Ok(ports
            .iter()
            .map(|port| (*port, format!("https://{port}-{id}.{}", self.domain)))
            .collect())
    }
}
