//! Cloudflare adapter.
//!
//! Every route is account-scoped and every response is wrapped in the
//! `{success, result, errors[]}` envelope, including 200s that carry a
//! failure. Exec streaming upgrades to a WebSocket whose text frames are
//! `{"stream": "stdout"|"stderr", "data": …}` objects. The upgrade request
//! authenticates with the bearer header, never a query-string token.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::capability::{Capabilities, Driver, Lifecycle, Process};
use crate::client::ProviderClient;
use crate::config::CloudflareSettings;
use crate::error::{classify_message, DriverResult, ErrorKind, SandboxError};
use crate::shellops::{self, ShellCode, ShellFs};
use crate::types::{
    ChunkStream, CreateOptions, ProcessChunk, ProcessInfo, ProcessStatus, Provider, RunCommand,
    RunResult, SandboxInfo, SandboxStatus, StartProcessOptions,
};

const DEFAULT_IMAGE: &str = "registry.cloudflare.com/sandbox:latest";

/// Compose the Cloudflare driver from settings.
pub fn compose(settings: CloudflareSettings) -> Driver {
    let adapter = Arc::new(CloudflareAdapter::new(settings));
    let capabilities = Capabilities {
        pause_resume: false,
        background_processes: true,
        process_urls: false,
        snapshots: false,
        snapshot_restore: false,
        volumes: false,
    };
    Driver::new(
        Provider::Cloudflare,
        capabilities,
        adapter.clone(),
        adapter.clone(),
        Arc::new(ShellFs::new(adapter.clone() as Arc<dyn Process>)),
        Arc::new(ShellCode::new(adapter as Arc<dyn Process>)),
    )
}

pub struct CloudflareAdapter {
    client: ProviderClient,
    account_id: String,
}

impl CloudflareAdapter {
    pub fn new(settings: CloudflareSettings) -> Self {
        let client =
            ProviderClient::new(Provider::Cloudflare, settings.base_url, settings.timeout)
                .with_bearer(&settings.api_token)
                .with_envelope(envelope_message);
        Self {
            client,
            account_id: settings.account_id,
        }
    }

    fn scoped(&self, rest: &str) -> String {
        format!("/accounts/{}/sandbox/sandboxes{rest}", self.account_id)
    }

    /// Unwrap the `{success, result, errors[]}` envelope; a 200 with
    /// `success: false` still carries a failure.
    fn unwrap(&self, value: serde_json::Value, op: &str) -> DriverResult<serde_json::Value> {
        if value["success"].as_bool().unwrap_or(true) {
            return Ok(value["result"].clone());
        }
        let message =
            envelope_message(&value).unwrap_or_else(|| "cloudflare reported failure".to_string());
        let kind = classify_message(Some(Provider::Cloudflare), &message);
        Err(SandboxError::new(kind, message)
            .with_provider(Provider::Cloudflare)
            .with_operation(op.to_string()))
    }

    fn info_from(&self, value: &serde_json::Value) -> SandboxInfo {
        SandboxInfo {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            name: value["name"].as_str().map(str::to_string),
            provider: Provider::Cloudflare,
            status: map_state(value["status"].as_str()),
            created_at: value["created_on"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            metadata: BTreeMap::new(),
        }
    }
}

fn envelope_message(value: &serde_json::Value) -> Option<String> {
    let errors = value["errors"].as_array()?;
    let parts: Vec<String> = errors
        .iter()
        .filter_map(|e| {
            let message = e["message"].as_str()?;
            match e["code"].as_i64() {
                Some(code) => Some(format!("{code}: {message}")),
                None => Some(message.to_string()),
            }
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

/// Cloudflare's three sandbox states.
fn map_state(state: Option<&str>) -> SandboxStatus {
    match state {
        Some("running") => SandboxStatus::Ready,
        Some("stopped") => SandboxStatus::Stopped,
        Some("failed") => SandboxStatus::Failed,
        _ => SandboxStatus::Failed,
    }
}

/// Decode one exec-stream frame.
fn decode_frame(message: tokio_tungstenite::tungstenite::Message) -> Option<ProcessChunk> {
    let text = match message {
        tokio_tungstenite::tungstenite::Message::Text(t) => t,
        _ => return None,
    };
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    let data = value["data"].as_str()?.as_bytes().to_vec();
    match value["stream"].as_str() {
        Some("stderr") => Some(ProcessChunk::stderr(data)),
        Some("stdout") => Some(ProcessChunk::stdout(data)),
        _ => None,
    }
}

#[async_trait]
impl Lifecycle for CloudflareAdapter {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        let image = opts.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let body = json!({
            "name": opts.name,
            "image": image,
            "env": opts.env,
            "command": opts.command,
        });
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::POST, &self.scoped(""), Some(&body))
            .await?;
        let result = self.unwrap(value, "create")?;
        let info = self.info_from(&result);
        debug!(sandbox = %info.id, "created cloudflare sandbox");
        Ok(info)
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        let value: serde_json::Value = self
            .client
            .request_json(
                reqwest::Method::DELETE,
                &self.scoped(&format!("/{id}")),
                None,
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        self.unwrap(value, "destroy").map(|_| ())
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &self.scoped(&format!("/{id}")), None)
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let result = self.unwrap(value, "status")?;
        Ok(map_state(result["status"].as_str()))
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        let value: serde_json::Value = match self
            .client
            .request_json(reqwest::Method::GET, &self.scoped(""), None)
            .await
        {
            Ok(v) => v,
            Err(e) if matches!(e.kind, ErrorKind::Network | ErrorKind::Timeout) => {
                warn!(error = %e, "cloudflare list failed transiently, returning empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let result = self.unwrap(value, "list")?;
        Ok(result
            .as_array()
            .map(|items| items.iter().map(|v| self.info_from(v)).collect())
            .unwrap_or_default())
    }

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
        let value: serde_json::Value = self
            .client
            .request_json(reqwest::Method::GET, &self.scoped(&format!("/{id}")), None)
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let result = self.unwrap(value, "get")?;
        Ok(self.info_from(&result))
    }
}

#[async_trait]
impl Process for CloudflareAdapter {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        let body = json!({
            "command": shellops::encode_command(&cmd),
            "timeout_ms": cmd.timeout_ms,
        });
        let value: serde_json::Value = self
            .client
            .request_json(
                reqwest::Method::POST,
                &self.scoped(&format!("/{id}/exec")),
                Some(&body),
            )
            .await
            .map_err(|e| e.with_sandbox(id))?;
        let result = self.unwrap(value, "exec")?;
        Ok(RunResult {
            exit_code: result["exit_code"].as_i64().unwrap_or(-1) as i32,
            stdout: result["stdout"].as_str().unwrap_or_default().to_string(),
            stderr: result["stderr"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream> {
        let token = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            shellops::encode_command(&cmd),
        );
        let base = self.client.base_url();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        let url = format!(
            "{ws_base}{}?commandB64={token}",
            self.scoped(&format!("/{id}/exec/stream"))
        );
        self.client.ws_chunks(&url, decode_frame).await
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
                .with_provider(Provider::Cloudflare)
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
            .with_provider(Provider::Cloudflare)
            .with_sandbox(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> CloudflareAdapter {
        CloudflareAdapter::new(CloudflareSettings {
            api_token: "cf_token".into(),
            account_id: "acct123".into(),
            base_url: server.uri(),
            timeout: std::time::Duration::from_secs(5),
        })
    }

    #[test]
    fn three_states_map_directly() {
        assert_eq!(map_state(Some("running")), SandboxStatus::Ready);
        assert_eq!(map_state(Some("stopped")), SandboxStatus::Stopped);
        assert_eq!(map_state(Some("failed")), SandboxStatus::Failed);
        assert_eq!(map_state(Some("mystery")), SandboxStatus::Failed);
    }

    #[test]
    fn frame_decoder_reads_stream_field() {
        use tokio_tungstenite::tungstenite::Message;

        let chunk = decode_frame(Message::Text(
            "{\"stream\": \"stderr\", \"data\": \"oops\"}".into(),
        ))
        .unwrap();
        assert_eq!(chunk.channel, crate::types::ChunkChannel::Stderr);
        assert_eq!(&chunk.data[..], b"oops");

        assert!(decode_frame(Message::Text("not json".into())).is_none());
        assert!(decode_frame(Message::Ping(vec![])).is_none());
    }

    #[tokio::test]
    async fn create_uses_account_scoped_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/acct123/sandbox/sandboxes"))
            .and(header("Authorization", "Bearer cf_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": {"id": "cf-1", "status": "running"},
            })))
            .mount(&server)
            .await;

        let info = adapter(&server).create(CreateOptions::default()).await.unwrap();
        assert_eq!(info.id, "cf-1");
        assert_eq!(info.status, SandboxStatus::Ready);
    }

    #[tokio::test]
    async fn success_false_on_200_is_still_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acct123/sandbox/sandboxes/cf-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 10007, "message": "sandbox not found"}],
                "result": null,
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).status("cf-9").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("10007"));
    }

    #[tokio::test]
    async fn envelope_message_surfaces_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acct123/sandbox/sandboxes"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 9109, "message": "Unauthorized to access requested resource"}],
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).list().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert!(err.message.contains("9109"));
    }

    #[tokio::test]
    async fn exec_unwraps_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/acct123/sandbox/sandboxes/cf-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": {"exit_code": 42, "stdout": "", "stderr": "boom"},
            })))
            .mount(&server)
            .await;

        let result = adapter(&server)
            .run("cf-1", RunCommand::new("sh").arg("-c").arg("exit 42"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.stderr, "boom");
    }
}
