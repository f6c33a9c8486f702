//! Modal adapter.
//!
//! Drives Modal through the bundled `modal_sandbox.py` helper over a shell
//! connector. Every verb prints one machine-readable line on stdout; build
//! and create progress arrives on stderr and is forwarded to the log.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bundled;
use crate::capability::{Capabilities, Driver, Lifecycle, Process, Snapshots, Volumes};
use crate::config::ModalSettings;
use crate::connector::{Connector, ShellConnector, ShellResult};
use crate::error::{classify_message, DriverResult, ErrorKind, SandboxError};
use crate::shellops::{self, ShellCode, ShellFs};
use crate::types::{
    ChunkStream, CreateOptions, ProcessChunk, ProcessInfo, ProcessStatus, Provider, RunCommand,
    RunResult, SandboxInfo, SandboxStatus, SnapshotInfo, StartProcessOptions, VolumeInfo,
};

const DEFAULT_IMAGE: &str = "python:3.12-slim";

/// Compose the Modal driver from settings.
pub fn compose(settings: ModalSettings) -> Driver {
    let adapter = Arc::new(ModalAdapter::new(settings));
    let capabilities = Capabilities {
        pause_resume: false,
        background_processes: true,
        process_urls: true,
        snapshots: true,
        snapshot_restore: false,
        volumes: true,
    };
    Driver::new(
        Provider::Modal,
        capabilities,
        adapter.clone(),
        adapter.clone(),
        Arc::new(ShellFs::new(adapter.clone() as Arc<dyn Process>)),
        Arc::new(ShellCode::new(adapter.clone() as Arc<dyn Process>)),
    )
    .with_snapshots(adapter.clone())
    .with_volumes(adapter)
}

struct SandboxMeta {
    created_at: chrono::DateTime<chrono::Utc>,
    name: Option<String>,
}

pub struct ModalAdapter {
    connector: Arc<ShellConnector>,
    sandboxes: Mutex<HashMap<String, SandboxMeta>>,
    snapshots: Mutex<HashMap<String, Vec<SnapshotInfo>>>,
}

impl ModalAdapter {
    pub fn new(settings: ModalSettings) -> Self {
        let connector = ShellConnector::new()
            .with_env("MODAL_TOKEN_ID", settings.token_id)
            .with_env("MODAL_TOKEN_SECRET", settings.token_secret)
            .with_timeout(settings.timeout);
        Self {
            connector: Arc::new(connector),
            sandboxes: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Run one helper verb; returns stdout with stderr forwarded to the log.
    async fn helper(&self, verb: &str, args: &str) -> DriverResult<ShellResult> {
        let command = bundled::expand_command(&format!(
            "python3 @modal_sandbox.py {verb} {args}"
        ))
        .map_err(|e| SandboxError::validation(e.to_string()).with_provider(Provider::Modal))?;
        debug!(verb, "running modal helper");
        let result = self.connector.run(&command).await?;
        for line in result.stderr.lines().filter(|l| !l.trim().is_empty()) {
            info!(target: "modal", "{line}");
        }
        if result.exit_code != 0 {
            let detail = result.stderr.trim().to_string();
            let kind = classify_message(Some(Provider::Modal), &detail);
            return Err(SandboxError::new(kind, detail)
                .with_provider(Provider::Modal)
                .with_operation(format!("modal {verb}")));
        }
        Ok(result)
    }

    /// The helper prints exactly one id on stdout.
    fn single_line(result: &ShellResult, what: &str) -> DriverResult<String> {
        let line = result.stdout.trim().to_string();
        if line.is_empty() {
            return Err(SandboxError::provider(format!("{what} returned no output"))
                .with_provider(Provider::Modal));
        }
        Ok(line)
    }
}

/// Parse the trailing JSON line of an exec reply.
fn parse_exec_reply(stdout: &str) -> Option<RunResult> {
    let line = stdout.lines().rev().find(|l| l.trim_start().starts_with('{'))?;
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    Some(RunResult {
        exit_code: value["exit_code"].as_i64()? as i32,
        stdout: value["stdout"].as_str().unwrap_or_default().to_string(),
        stderr: value["stderr"].as_str().unwrap_or_default().to_string(),
    })
}

fn map_status(text: &str) -> SandboxStatus {
    match text.trim() {
        "ready" => SandboxStatus::Ready,
        "stopped" => SandboxStatus::Stopped,
        "creating" => SandboxStatus::Creating,
        _ => SandboxStatus::Failed,
    }
}

#[async_trait]
impl Lifecycle for ModalAdapter {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        let image = opts.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let mut args = vec![shell_words::quote(&image).into_owned()];
        for (key, value) in &opts.env {
            args.push(format!("--env {}", shell_words::quote(&format!("{key}={value}"))));
        }
        for (mount, name) in &opts.volumes {
            args.push(format!(
                "--volume {}",
                shell_words::quote(&format!("{name}={mount}"))
            ));
        }
        if let Some(workdir) = &opts.workdir {
            args.push(format!("--workdir {}", shell_words::quote(workdir)));
        }
        if let Some(ms) = opts.timeout_ms {
            args.push(format!("--timeout {}", ms.div_ceil(1000)));
        }

        let result = self.helper("create", &args.join(" ")).await?;
        let id = Self::single_line(&result, "create")?;
        let created_at = chrono::Utc::now();
        self.sandboxes.lock().await.insert(
            id.clone(),
            SandboxMeta {
                created_at,
                name: opts.name.clone(),
            },
        );
        info!(sandbox = %id, "created modal sandbox");
        Ok(SandboxInfo {
            id,
            name: opts.name,
            provider: Provider::Modal,
            status: SandboxStatus::Ready,
            created_at,
            metadata: BTreeMap::new(),
        })
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        self.helper("destroy", &shell_words::quote(id)).await?;
        self.sandboxes.lock().await.remove(id);
        self.snapshots.lock().await.remove(id);
        Ok(())
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        let result = self.helper("status", &shell_words::quote(id)).await?;
        Ok(map_status(&result.stdout))
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        let result = match self.helper("list", "").await {
            Ok(r) => r,
            Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::Timeout) => {
                warn!(error = %e, "modal list failed transiently, returning empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(result.stdout.trim()).unwrap_or_default();
        let metas = self.sandboxes.lock().await;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row["id"].as_str()?.to_string();
                let meta = metas.get(&id);
                Some(SandboxInfo {
                    id: id.clone(),
                    name: meta.and_then(|m| m.name.clone()),
                    provider: Provider::Modal,
                    status: SandboxStatus::Ready,
                    created_at: meta
                        .map(|m| m.created_at)
                        .unwrap_or_else(chrono::Utc::now),
                    metadata: BTreeMap::new(),
                })
            })
            .collect())
    }

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
        let status = self.status(id).await?;
        let metas = self.sandboxes.lock().await;
        let meta = metas.get(id);
        Ok(SandboxInfo {
            id: id.to_string(),
            name: meta.and_then(|m| m.name.clone()),
            provider: Provider::Modal,
            status,
            created_at: meta
                .map(|m| m.created_at)
                .unwrap_or_else(chrono::Utc::now),
            metadata: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl Process for ModalAdapter {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        // The helper's exec verb takes one command string; the base64
        // envelope keeps argv, env, and cwd intact across both shells.
        let encoded = shellops::encode_command(&cmd);
        let args = format!(
            "{} {}",
            shell_words::quote(id),
            shell_words::quote(&encoded)
        );
        let work = self.helper("exec", &args);
        let result = match cmd.timeout_ms {
            Some(ms) => tokio::time::timeout(std::time::Duration::from_millis(ms), work)
                .await
                .map_err(|_| {
                    SandboxError::timeout(format!("command exceeded {ms} ms"))
                        .with_provider(Provider::Modal)
                        .with_operation("run")
                        .with_sandbox(id)
                })??,
            None => work.await?,
        };
        parse_exec_reply(&result.stdout).ok_or_else(|| {
            SandboxError::provider("exec reply was not valid JSON")
                .with_provider(Provider::Modal)
                .with_sandbox(id)
        })
    }

    // The helper buffers exec output, so streaming degrades to a buffered
    // run replayed as chunks.
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
            .with_provider(Provider::Modal)
            .with_sandbox(id));
        }
        Ok(ProcessInfo {
            id: pid,
            status: ProcessStatus::Running,
        })
    }

    async fn stop_process(&self, id: &str, proc_id: &str) -> DriverResult<()> {
        let result = self
            .run(id, RunCommand::new("kill").arg(proc_id))
            .await?;
        if !result.success() {
            return Err(SandboxError::not_found(format!(
                "process {proc_id} not running"
            ))
            .with_provider(Provider::Modal)
            .with_sandbox(id));
        }
        Ok(())
    }

    async fn process_urls(
        &self,
        id: &str,
        ports: &[u16],
    ) -> DriverResult<BTreeMap<u16, String>> {
        let result = self.helper("tunnels", &shell_words::quote(id)).await?;
        let mapping: HashMap<String, String> =
            serde_json::from_str(result.stdout.trim()).map_err(|e| {
                SandboxError::provider(format!("tunnels reply was not valid JSON: {e}"))
                    .with_provider(Provider::Modal)
                    .with_sandbox(id)
            })?;
        let mut urls = BTreeMap::new();
        for port in ports {
            let url = mapping.get(&port.to_string()).ok_or_else(|| {
                SandboxError::not_found(format!("no tunnel for port {port}"))
                    .with_provider(Provider::Modal)
                    .with_sandbox(id)
            })?;
            urls.insert(*port, url.clone());
        }
        Ok(urls)
    }
}

#[async_trait]
impl Snapshots for ModalAdapter {
    async fn create(
        &self,
        id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> DriverResult<SnapshotInfo> {
        let result = self.helper("snapshot", &shell_words::quote(id)).await?;
        let image_id = Self::single_line(&result, "snapshot")?;
        let info = SnapshotInfo {
            id: image_id,
            created_at: chrono::Utc::now(),
            metadata,
        };
        self.snapshots
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .push(info.clone());
        Ok(info)
    }

    async fn list(&self, id: &str) -> DriverResult<Vec<SnapshotInfo>> {
        Ok(self
            .snapshots
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Volumes for ModalAdapter {
    async fn create(&self, name: &str) -> DriverResult<VolumeInfo> {
        let result = self
            .helper("volume-ensure", &shell_words::quote(name))
            .await?;
        let id = Self::single_line(&result, "volume-ensure")?;
        Ok(VolumeInfo {
            id,
            name: name.to_string(),
            created_at: None,
        })
    }

    async fn delete(&self, name: &str) -> DriverResult<()> {
        self.helper("volume-delete", &shell_words::quote(name))
            .await?;
        Ok(())
    }

    async fn list(&self) -> DriverResult<Vec<VolumeInfo>> {
        let result = self.helper("volume-list", "").await?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(result.stdout.trim()).unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(VolumeInfo {
                    id: row["id"].as_str()?.to_string(),
                    name: row["name"].as_str()?.to_string(),
                    created_at: None,
                })
            })
            .collect())
    }

    async fn get(&self, name: &str) -> DriverResult<VolumeInfo> {
        let all = Volumes::list(self).await?;
        all.into_iter()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                SandboxError::not_found(format!("volume '{name}' not found"))
                    .with_provider(Provider::Modal)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_reply_parses_trailing_json() {
        let stdout = "building image...\n{\"exit_code\": 3, \"stdout\": \"hi\\n\", \"stderr\": \"\"}\n";
        let reply = parse_exec_reply(stdout).unwrap();
        assert_eq!(reply.exit_code, 3);
        assert_eq!(reply.stdout, "hi\n");
    }

    #[test]
    fn exec_reply_rejects_garbage() {
        assert!(parse_exec_reply("no json here").is_none());
    }

    #[test]
    fn status_mapping_defaults_to_failed() {
        assert_eq!(map_status("ready\n"), SandboxStatus::Ready);
        assert_eq!(map_status("stopped"), SandboxStatus::Stopped);
        assert_eq!(map_status("???"), SandboxStatus::Failed);
    }
}
