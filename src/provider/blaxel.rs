//! Blaxel adapter.
//!
//! Two planes: the control API (workspace-scoped, `x-blaxel-workspace`
//! header) for lifecycle, and a per-sandbox runtime endpoint for process
//! and filesystem work. The runtime URL is discovered once per sandbox and
//! cached; destroy invalidates the entry.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::capability::{Capabilities, Driver, Fs, Lifecycle, Process};
use crate::client::ProviderClient;
use crate::config::BlaxelSettings;
use crate::error::{DriverResult, ErrorKind, SandboxError};
use crate::shellops::{self, ShellCode};
use crate::types::{
    ChunkStream, CreateOptions, FsEntry, FsEntryKind, ProcessChunk, ProcessInfo, ProcessStatus,
    Provider, RunCommand, RunResult, SandboxInfo, SandboxStatus, StartProcessOptions,
};

const DEFAULT_IMAGE: &str = "blaxel/base:latest";

/// Compose the Blaxel driver from settings.
pub fn compose(settings: BlaxelSettings) -> Driver {
    let adapter = Arc::new(BlaxelAdapter::new(settings));
    let capabilities = Capabilities {
        pause_resume: false,
        background_processes: true,
        process_urls: true,
        snapshots: false,
        snapshot_restore: false,
        volumes: false,
    };
    Driver::new(
        Provider::Blaxel,
        capabilities,
        adapter.clone(),
        adapter.clone(),
        adapter.clone(),
        Arc::new(ShellCode::new(adapter as Arc<dyn Process>)),
    )
}

pub struct BlaxelAdapter {
    client: ProviderClient,
    workspace: String,
    run_base_url: String,
    /// Sandbox id → runtime endpoint, filled on first use.
    urls: Mutex<HashMap<String, String>>,
}

impl BlaxelAdapter {
    pub fn new(settings: BlaxelSettings) -> Self {
        let client = ProviderClient::new(Provider::Blaxel, settings.base_url, settings.timeout)
            .with_bearer(&settings.api_key)
            .with_header("x-blaxel-workspace", settings.workspace.clone());
        Self {
            client,
            workspace: settings.workspace,
            run_base_url: settings.run_base_url,
            urls: Mutex::new(HashMap::new()),
        }
    }

    /// Runtime endpoint for a sandbox, from cache or discovered via the
    /// control plane.
    async fn sandbox_url(&self, id: &str) -> DriverResult<String> {
        if let Some(url) = self.urls.lock().await.get(id) {
            return Ok(url.clone());
        }
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &format!("/sandboxes/{id}"), None)
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let url = value["url"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("{}/{}/sandboxes/{id}", self.run_base_url, self.workspace)
            });
        debug!(sandbox = %id, %url, "discovered blaxel runtime endpoint");
        self.urls.lock().await.insert(id.to_string(), url.clone());
        Ok(url)
    }

    fn info_from(&self, value: &serde_json::Value) -> SandboxInfo {
        let id = value["metadata"]["name"]
            .as_str()
            .or_else(|| value["name"].as_str())
            .unwrap_or_default()
            .to_string();
        SandboxInfo {
            name: Some(id.clone()),
            id,
            provider: Provider::Blaxel,
            status: map_state(value["status"].as_str()),
            created_at: value["metadata"]["createdAt"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            metadata: BTreeMap::new(),
        }
    }
}

/// Blaxel's nine deployment states, folded onto the uniform four.
fn map_state(state: Option<&str>) -> SandboxStatus {
    match state.map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("DEPLOYED") => SandboxStatus::Ready,
        Some("DEPLOYING") | Some("UPLOADING") | Some("BUILDING") => SandboxStatus::Creating,
        Some("STANDBY") | Some("STOPPED") => SandboxStatus::Stopped,
        Some("FAILED") | Some("DELETING") | Some("DELETED") | Some("ERROR") => {
            SandboxStatus::Failed
        }
        _ => SandboxStatus::Failed,
    }
}

#[async_trait]
impl Lifecycle for BlaxelAdapter {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("crucible-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        let image = opts.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let ports: Vec<serde_json::Value> = opts
            .requested_ports()
            .iter()
            .map(|p| json!({"target": p, "protocol": "HTTP"}))
            .collect();
        let body = json!({
            "metadata": {"name": name},
            "spec": {
                "runtime": {
                    "image": image,
                    "memory": opts.memory_mib,
                    "ports": ports,
                    "envs": opts.env.iter()
                        .map(|(k, v)| json!({"name": k, "value": v}))
                        .collect::<Vec<_>>(),
                }
            }
        });
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::POST, "/sandboxes", Some(&body))
            .await?;
        Ok(self.info_from(&value))
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        self.client
            .request_empty(reqwest::Method::DELETE, &format!("/sandboxes/{id}"), None)
            .await
            .map_err(|e| e.with_sandbox(id))?;
        self.urls.lock().await.remove(id);
        Ok(())
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &format!("/sandboxes/{id}"), None)
            .await
            .map_err(|e| e.with_sandbox(id))?;
        Ok(map_state(value["status"].as_str()))
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        let value: serde_json::Value = match self
            .client
            .request_json(reqwest::Method::GET, "/sandboxes", None)
            .await
        {
            Ok(v) => v,
            Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::Timeout) => {
                warn!(error = %e, "blaxel list failed transiently, returning empty");
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
            .request_json(reqwest::Method::GET, &format!("/sandboxes/{id}"), None)
            .await
            .map_err(|e| e.with_sandbox(id))?;
        Ok(self.info_from(&value))
    }
}

#[async_trait]
impl Process for BlaxelAdapter {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        let base = self.sandbox_url(id).await?;
        let command = shellops::encode_command(&cmd);
        let body = json!({
            "command": command,
            "waitForCompletion": true,
        });
        let value: serde_json::Value = self
            .client
            .sandbox_request(&base, reqwest::Method::POST, "/process", Some(&body))
            .await
            .map_err(|e| e.with_sandbox(id))?;
        Ok(RunResult {
            exit_code: value["exitCode"].as_i64().unwrap_or(-1) as i32,
            stdout: value["stdout"]
                .as_str()
                .or_else(|| value["logs"].as_str())
                .unwrap_or_default()
                .to_string(),
            stderr: value["stderr"].as_str().unwrap_or_default().to_string(),
        })
    }

    // The runtime endpoint buffers process output; stream degrades to a
    // buffered run.
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
        let base = self.sandbox_url(id).await?;
        let mut cmd = RunCommand::new(opts.cmd.clone());
        cmd.args = opts.args.clone();
        cmd.env = opts.env.clone();
        cmd.cwd = opts.cwd.clone();
        let body = json!({
            "command": shellops::encode_command(&cmd),
            "waitForCompletion": false,
        });
        let value: serde_json::Value = self
            .client
            .sandbox_request(&base, reqwest::Method::POST, "/process", Some(&body))
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let pid = value["pid"]
            .as_str()
            .map(str::to_string)
            .or_else(|| value["pid"].as_i64().map(|p| p.to_string()))
            .or_else(|| value["name"].as_str().map(str::to_string))
            .ok_or_else(|| {
                SandboxError::provider("process reply carried no pid")
                    .with_provider(Provider::Blaxel)
                    .with_sandbox(id)
            })?;
        Ok(ProcessInfo {
            id: pid,
            status: ProcessStatus::Running,
        })
    }

    async fn stop_process(&self, id: &str, proc_id: &str) -> DriverResult<()> {
        let base = self.sandbox_url(id).await?;
        self.client
            .sandbox_request_empty(
                &base,
                reqwest::Method::DELETE,
                &format!("/process/{proc_id}"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }

    async fn process_urls(
        &self,
        id: &str,
        ports: &[u16],
    ) -> DriverResult<BTreeMap<u16, String>> {
        // Port previews hang off the runtime endpoint.
        let base = self.sandbox_url(id).await?;
        Ok(ports
            .iter()
            .map(|port| (*port, format!("{base}/ports/{port}")))
            .collect())
    }
}

#[async_trait]
impl Fs for BlaxelAdapter {
    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes> {
        let base = self.sandbox_url(id).await?;
        let value: serde_json::Value = self
            .client
            .sandbox_request(
                &base,
                reqwest::Method::GET,
                &format!("/filesystem{path}?encoding=base64"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let content = value["content"].as_str().ok_or_else(|| {
            SandboxError::provider(format!("no content for {path}"))
                .with_provider(Provider::Blaxel)
                .with_sandbox(id)
        })?;
        base64::engine::general_purpose::STANDARD
            .decode(content)
            .map(Bytes::from)
            .map_err(|e| {
                SandboxError::provider(format!("invalid base64 content: {e}"))
                    .with_provider(Provider::Blaxel)
                    .with_sandbox(id)
            })
    }

    async fn write_file(
        &self,
        id: &str,
        path: &str,
        data: Bytes,
        mode: Option<u32>,
    ) -> DriverResult<()> {
        let base = self.sandbox_url(id).await?;
        let body = json!({
            "content": base64::engine::general_purpose::STANDARD.encode(&data),
            "encoding": "base64",
            "permissions": mode.map(|m| format!("{m:o}")),
        });
        self.client
            .sandbox_request_empty(
                &base,
                reqwest::Method::PUT,
                &format!("/filesystem{path}"),
                Some(&body),
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }

    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>> {
        let base = self.sandbox_url(id).await?;
        let value: serde_json::Value = self
            .client
            .sandbox_request(
                &base,
                reqwest::Method::GET,
                &format!("/filesystem{path}?recursive={recursive}"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let mut entries = Vec::new();
        for file in value["files"].as_array().into_iter().flatten() {
            if let Some(name) = file["path"].as_str().or_else(|| file["name"].as_str()) {
                entries.push(FsEntry {
                    path: join_path(path, name),
                    kind: FsEntryKind::File,
                    size: file["size"].as_u64(),
                    modified_at: None,
                });
            }
        }
        for dir in value["subdirectories"].as_array().into_iter().flatten() {
            if let Some(name) = dir["path"].as_str().or_else(|| dir["name"].as_str()) {
                entries.push(FsEntry {
                    path: join_path(path, name),
                    kind: FsEntryKind::Dir,
                    size: None,
                    modified_at: None,
                });
            }
        }
        Ok(entries)
    }

    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()> {
        let base = self.sandbox_url(id).await?;
        let body = json!({"isDirectory": true});
        self.client
            .sandbox_request_empty(
                &base,
                reqwest::Method::PUT,
                &format!("/filesystem{path}"),
                Some(&body),
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }

    async fn rm(&self, id: &str, path: &str, recursive: bool, _force: bool) -> DriverResult<()> {
        let base = self.sandbox_url(id).await?;
        self.client
            .sandbox_request_empty(
                &base,
                reqwest::Method::DELETE,
                &format!("/filesystem{path}?recursive={recursive}"),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))
    }
}

fn join_path(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{name}", base.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_with(server: &MockServer) -> BlaxelAdapter {
        BlaxelAdapter::new(BlaxelSettings {
            api_key: "bl_key".into(),
            workspace: "acme".into(),
            base_url: server.uri(),
            run_base_url: "https://run.blaxel.ai".into(),
            timeout: std::time::Duration::from_secs(5),
        })
    }

    #[test]
    fn nine_states_fold_to_four() {
        assert_eq!(map_state(Some("DEPLOYED")), SandboxStatus::Ready);
        assert_eq!(map_state(Some("deploying")), SandboxStatus::Creating);
        assert_eq!(map_state(Some("UPLOADING")), SandboxStatus::Creating);
        assert_eq!(map_state(Some("BUILDING")), SandboxStatus::Creating);
        assert_eq!(map_state(Some("STANDBY")), SandboxStatus::Stopped);
        assert_eq!(map_state(Some("STOPPED")), SandboxStatus::Stopped);
        assert_eq!(map_state(Some("FAILED")), SandboxStatus::Failed);
        assert_eq!(map_state(Some("DELETING")), SandboxStatus::Failed);
        assert_eq!(map_state(Some("DELETED")), SandboxStatus::Failed);
        assert_eq!(map_state(None), SandboxStatus::Failed);
    }

    #[tokio::test]
    async fn workspace_header_travels_on_every_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes"))
            .and(header("x-blaxel-workspace", "acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let all = adapter_with(&server).list().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn runtime_url_is_discovered_once_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"name": "demo"},
                "status": "DEPLOYED",
                "url": format!("{}/runtime/demo", server.uri()),
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/runtime/demo/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exitCode": 0, "stdout": "ok", "stderr": "",
            })))
            .expect(2)
            .mount(&server)
            .await;

        let adapter = adapter_with(&server);
        let first = adapter.run("demo", RunCommand::new("true")).await.unwrap();
        assert_eq!(first.exit_code, 0);
        // Second run must not re-hit the control plane.
        adapter.run("demo", RunCommand::new("true")).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_invalidates_url_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"name": "demo"},
                "url": format!("{}/runtime/demo", server.uri()),
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/runtime/demo/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exitCode": 0, "stdout": "", "stderr": "",
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/sandboxes/demo"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = adapter_with(&server);
        adapter.run("demo", RunCommand::new("true")).await.unwrap();
        adapter.destroy("demo").await.unwrap();
        // A fresh run re-discovers the endpoint.
        adapter.run("demo", RunCommand::new("true")).await.unwrap();
    }

    #[tokio::test]
    async fn read_file_decodes_base64_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandboxes/demo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "metadata": {"name": "demo"},
                "url": format!("{}/runtime/demo", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/runtime/demo/filesystem/tmp/b.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": base64::engine::general_purpose::STANDARD.encode(b"Hello"),
            })))
            .mount(&server)
            .await;

        let bytes = adapter_with(&server)
            .read_file("demo", "/tmp/b.bin")
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"Hello");
    }
}
