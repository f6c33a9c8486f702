//! Daytona adapter.
//!
//! REST against the workspace API plus the per-sandbox toolbox routes.
//! Daytona is the one backend with native pause/resume; both transitions
//! are asynchronous server-side, so the adapter polls until the status
//! converges. Files use the toolbox file API (multipart upload, raw
//! download), so binary content never crosses a shell.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};

use crate::capability::{Capabilities, Driver, Fs, Lifecycle, Process};
use crate::client::ProviderClient;
use crate::config::RestSettings;
use crate::error::{DriverResult, ErrorKind, SandboxError};
use crate::shellops::{self, ShellCode};
use crate::types::{
    ChunkStream, CreateOptions, FsEntry, FsEntryKind, ProcessChunk, ProcessInfo, ProcessStatus,
    Provider, RunCommand, RunResult, SandboxInfo, SandboxStatus, StartProcessOptions,
};

const DEFAULT_IMAGE: &str = "daytonaio/workspace:latest";

/// Compose the Daytona driver from settings.
pub fn compose(settings: RestSettings) -> Driver {
    let adapter = Arc::new(DaytonaAdapter::new(settings));
    let capabilities = Capabilities {
        pause_resume: true,
        background_processes: true,
        process_urls: true,
        snapshots: false,
        snapshot_restore: false,
        volumes: false,
    };
    Driver::new(
        Provider::Daytona,
        capabilities,
        adapter.clone(),
        adapter.clone(),
        adapter.clone(),
        Arc::new(ShellCode::new(adapter as Arc<dyn Process>)),
    )
}

pub struct DaytonaAdapter {
    client: ProviderClient,
}

impl DaytonaAdapter {
    pub fn new(settings: RestSettings) -> Self {
        let client = ProviderClient::new(Provider::Daytona, settings.base_url, settings.timeout)
            .with_bearer(&settings.api_key);
        Self { client }
    }

    fn info_from(&self, value: &serde_json::Value) -> SandboxInfo {
        SandboxInfo {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            name: value["name"].as_str().map(str::to_string),
            provider: Provider::Daytona,
            status: map_state(value["state"].as_str()),
            created_at: value["createdAt"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            metadata: value["labels"]
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }

    /// Poll `status` until it reaches `target` or the budget runs out.
    /// Provider-side transitions are asynchronous; pause/resume only return
    /// once the new state is observable.
    async fn wait_for(&self, id: &str, target: SandboxStatus) -> DriverResult<()> {
        let mut delay = std::time::Duration::from_millis(500);
        for _ in 0..20 {
            if self.status(id).await? == target {
                return Ok(());
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 3 / 2).min(std::time::Duration::from_secs(5));
        }
        Err(SandboxError::timeout(format!(
            "sandbox did not reach {target} in time"
        ))
        .with_provider(Provider::Daytona)
        .with_sandbox(id))
    }

    fn ws_base(&self) -> String {
        let base = self.client.base_url();
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        }
    }
}

/// Daytona's eight workspace states, folded onto the uniform four.
fn map_state(state: Option<&str>) -> SandboxStatus {
    match state {
        Some("started") => SandboxStatus::Ready,
        Some("creating") | Some("starting") | Some("restoring") => SandboxStatus::Creating,
        Some("stopped") | Some("stopping") | Some("archived") => SandboxStatus::Stopped,
        Some("error") | Some("destroyed") | Some("destroying") => SandboxStatus::Failed,
        _ => SandboxStatus::Failed,
    }
}

#[async_trait]
impl Lifecycle for DaytonaAdapter {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        let image = opts.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let body = json!({
            "image": image,
            "name": opts.name,
            "env": opts.env,
            "cpu": opts.cpu,
            "memory": opts.memory_mib,
            "autoStopInterval": opts.idle_timeout_ms.map(|ms| ms / 60_000),
        });
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::POST, "/sandbox", Some(&body))
            .await?;
        let info = self.info_from(&value);
        debug!(sandbox = %info.id, "created daytona sandbox");
        Ok(info)
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        self.client
            .request_empty(
                reqwest::Method::DELETE,
                &format!("/sandbox/{id}?force=true"),
                None,
            )
            .await
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &format!("/sandbox/{id}"), None)
            .await?;
        Ok(map_state(value["state"].as_str()))
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        let value: serde_json::Value = match self
            .client
            .request_json(reqwest::Method::GET, "/sandbox", None)
            .await
        {
            Ok(v) => v,
            Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::Timeout) => {
                warn!(error = %e, "daytona list failed transiently, returning empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(value
            .as_array()
            .map(|items| items.iter().map(|v| self.info_from(v)).collect())
            .unwrap_or_default())
    }

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &format!("/sandbox/{id}"), None)
            .await?;
        Ok(self.info_from(&value))
    }

    async fn pause(&self, id: &str) -> DriverResult<()> {
        self.client
            .request_empty(reqwest::Method::POST, &format!("/sandbox/{id}/stop"), None)
            .await?;
        self.wait_for(id, SandboxStatus::Stopped).await
    }

    async fn resume(&self, id: &str) -> DriverResult<()> {
        self.client
            .request_empty(reqwest::Method::POST, &format!("/sandbox/{id}/start"), None)
            .await?;
        self.wait_for(id, SandboxStatus::Ready).await
    }
}

#[async_trait]
impl Process for DaytonaAdapter {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        let command = shellops::encode_command(&cmd);
        let body = json!({
            "command": command,
            "timeout": cmd.timeout_ms.map(|ms| ms.div_ceil(1000)),
        });
        let value: serde_json::Value = self
            .client
            .request_json(
                reqwest::Method::POST,
                &format!("/toolbox/{id}/toolbox/process/execute"),
                Some(&body),
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        Ok(RunResult {
            exit_code: value["exitCode"].as_i64().unwrap_or(-1) as i32,
            // The toolbox merges both channels into `result`.
            stdout: value["result"].as_str().unwrap_or_default().to_string(),
            stderr: String::new(),
        })
    }

    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream> {
        // Raw frames, stdout only, per the toolbox socket convention.
        let token =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(shellops::encode_command(&cmd));
        let url = format!(
            "{}/toolbox/{id}/toolbox/process/stream?commandB64={token}",
            self.ws_base()
        );
        self.client.ws_chunks(&url, |message| match message {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                Some(ProcessChunk::stdout(text.into_bytes()))
            }
            tokio_tungstenite::tungstenite::Message::Binary(data) => {
                Some(ProcessChunk::stdout(data))
            }
            _ => None,
        })
        .await
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
            return Err(SandboxError::provider("failed to start background process")
                .with_provider(Provider::Daytona)
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
            .with_provider(Provider::Daytona)
            .with_sandbox(id));
        }
        Ok(())
    }

    async fn process_urls(
        &self,
        id: &str,
        ports: &[u16],
    ) -> DriverResult<BTreeMap<u16, String>> {
        let mut urls = BTreeMap::new();
        for port in ports {
            let value: serde_json::Value = self
                .client
                .request_json(
                    reqwest::Method::GET,
                    &format!("/sandbox/{id}/ports/{port}/preview-url"),
                    None,
                )
                .await
                .map_err(|e| e.with_sandbox(id))?;
            let url = value["url"].as_str().ok_or_else(|| {
                SandboxError::provider(format!("no preview url for port {port}"))
                    .with_provider(Provider::Daytona)
                    .with_sandbox(id)
            })?;
            urls.insert(*port, url.to_string());
        }
        Ok(urls)
    }
}

#[async_trait]
impl Fs for DaytonaAdapter {
    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes> {
        self.client
            .request_bytes(
                reqwest::Method::GET,
                &format!("/toolbox/{id}/toolbox/files/download?path={path}"),
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }

    async fn write_file(
        &self,
        id: &str,
        path: &str,
        data: Bytes,
        _mode: Option<u32>,
    ) -> DriverResult<()> {
        let file_name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::validation(format!("not a file path: {path}")))?;
        self.client
            .upload_multipart(
                &format!("/toolbox/{id}/toolbox/files/upload?path={path}"),
                "file",
                &file_name,
                data,
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }

    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>> {
        let value: serde_json::Value = self
            .client
            .request_json(
                reqwest::Method::GET,
                &format!("/toolbox/{id}/toolbox/files?path={path}&recursive={recursive}"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item["name"].as_str()?;
                        let full = if name.starts_with('/') {
                            name.to_string()
                        } else {
                            format!("{}/{name}", path.trim_end_matches('/'))
                        };
                        Some(FsEntry {
                            path: full,
                            kind: if item["isDir"].as_bool().unwrap_or(false) {
                                FsEntryKind::Dir
                            } else {
                                FsEntryKind::File
                            },
                            size: item["size"].as_u64(),
                            modified_at: item["modTime"]
                                .as_str()
                                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                                .map(|d| d.with_timezone(&chrono::Utc)),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()> {
        self.client
            .request_empty(
                reqwest::Method::POST,
                &format!("/toolbox/{id}/toolbox/files/folder?path={path}&mode=0755"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }

    async fn rm(&self, id: &str, path: &str, recursive: bool, _force: bool) -> DriverResult<()> {
        self.client
            .request_empty(
                reqwest::Method::DELETE,
                &format!("/toolbox/{id}/toolbox/files?path={path}&recursive={recursive}"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> DaytonaAdapter {
        DaytonaAdapter::new(RestSettings {
            api_key: "dtn_key".into(),
            base_url: server.uri(),
            timeout: std::time::Duration::from_secs(5),
        })
    }

    #[test]
    fn eight_states_fold_to_four() {
        assert_eq!(map_state(Some("started")), SandboxStatus::Ready);
        assert_eq!(map_state(Some("creating")), SandboxStatus::Creating);
        assert_eq!(map_state(Some("starting")), SandboxStatus::Creating);
        assert_eq!(map_state(Some("restoring")), SandboxStatus::Creating);
        assert_eq!(map_state(Some("stopped")), SandboxStatus::Stopped);
        assert_eq!(map_state(Some("stopping")), SandboxStatus::Stopped);
        assert_eq!(map_state(Some("error")), SandboxStatus::Failed);
        assert_eq!(map_state(Some("destroying")), SandboxStatus::Failed);
        assert_eq!(map_state(Some("???")), SandboxStatus::Failed);
    }

    #[tokio::test]
    async fn create_maps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandbox"))
            .and(body_partial_json(serde_json::json!({"image": "python:3.12-slim"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ws-7",
                "state": "creating",
                "createdAt": "2026-02-01T10:00:00Z",
            })))
            .mount(&server)
            .await;

        let info = adapter(&server)
            .create(CreateOptions::default().with_image("python:3.12-slim"))
            .await
            .unwrap();
        assert_eq!(info.id, "ws-7");
        assert_eq!(info.status, SandboxStatus::Creating);
    }

    #[tokio::test]
    async fn pause_polls_until_stopped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandbox/ws-1/stop"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        // First poll still sees the transition, second sees convergence.
        Mock::given(method("GET"))
            .and(path("/sandbox/ws-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ws-1", "state": "stopping",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sandbox/ws-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ws-1", "state": "stopped",
            })))
            .mount(&server)
            .await;

        adapter(&server).pause("ws-1").await.unwrap();
    }

    #[tokio::test]
    async fn run_reads_toolbox_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/toolbox/ws-1/toolbox/process/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exitCode": 0,
                "result": "hello\n",
            })))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .run("ws-1", RunCommand::new("echo").arg("hello"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    async fn list_dir_maps_file_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/toolbox/ws-1/toolbox/files"))
            .and(query_param("path", "/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "x.txt", "isDir": false, "size": 10, "modTime": "2026-02-01T10:00:00Z"},
                {"name": "sub", "isDir": true},
            ])))
            .mount(&server)
            .await;

        let entries = adapter(&server).list_dir("ws-1", "/data", false).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/data/x.txt");
        assert_eq!(entries[0].kind, FsEntryKind::File);
        assert_eq!(entries[0].size, Some(10));
        assert_eq!(entries[1].kind, FsEntryKind::Dir);
    }

    #[tokio::test]
    async fn preview_url_per_port() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/ws-1/ports/8080/preview-url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://8080-ws-1.h7800.daytona.work",
            })))
            .mount(&server)
            .await;

        let urls = adapter(&server).process_urls("ws-1", &[8080]).await.unwrap();
        assert_eq!(urls[&8080], "https://8080-ws-1.h7800.daytona.work");
    }
}
