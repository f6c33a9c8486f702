//! Core data model shared by every capability and adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// The sandbox backends this SDK can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Modal,
    E2b,
    Daytona,
    Blaxel,
    Cloudflare,
    Vercel,
    Docker,
}

impl Provider {
    pub const ALL: [Provider; 7] = [
        Provider::Modal,
        Provider::E2b,
        Provider::Daytona,
        Provider::Blaxel,
        Provider::Cloudflare,
        Provider::Vercel,
        Provider::Docker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Modal => "modal",
            Provider::E2b => "e2b",
            Provider::Daytona => "daytona",
            Provider::Blaxel => "blaxel",
            Provider::Cloudflare => "cloudflare",
            Provider::Vercel => "vercel",
            Provider::Docker => "docker",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "modal" => Ok(Provider::Modal),
            "e2b" => Ok(Provider::E2b),
            "daytona" => Ok(Provider::Daytona),
            "blaxel" => Ok(Provider::Blaxel),
            "cloudflare" => Ok(Provider::Cloudflare),
            "vercel" => Ok(Provider::Vercel),
            "docker" => Ok(Provider::Docker),
            other => Err(SandboxError::validation(format!(
                "unknown provider '{other}'"
            ))),
        }
    }
}

/// Uniform sandbox status across all backends.
///
/// `Failed` is terminal from this SDK's point of view; providers may move a
/// sandbox from `Stopped` back to `Ready` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Ready,
    Stopped,
    Failed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Information about a sandbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    /// Opaque provider-assigned identifier. Immutable.
    pub id: String,
    /// Optional user label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub provider: Provider,
    pub status: SandboxStatus,
    /// Set once at creation and never changed afterwards.
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A command to execute inside a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommand {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RunCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Result of a blocking command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// 0 means success.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Which output channel a streamed chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkChannel {
    Stdout,
    Stderr,
}

/// A piece of process output, emitted in arrival order.
///
/// No partial-UTF-8 normalization is applied; `data` is whatever the
/// transport delivered.
#[derive(Debug, Clone)]
pub struct ProcessChunk {
    pub channel: ChunkChannel,
    pub data: Bytes,
}

impl ProcessChunk {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            channel: ChunkChannel::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            channel: ChunkChannel::Stderr,
            data: data.into(),
        }
    }
}

/// A finite, non-restartable stream of process output.
///
/// Terminates when the remote process exits; dropping it aborts the remote
/// process best-effort.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProcessChunk> + Send>>;

/// A filesystem entry inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    /// Absolute path.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FsEntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEntryKind {
    File,
    Dir,
}

/// A frozen filesystem image of a sandbox. Immutable once created; restoring
/// always produces a new sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A named persistent filesystem region that outlives sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub id: String,
    /// User-chosen, unique per provider.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Languages accepted by the code-execution capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "py")]
    Python,
    #[serde(alias = "js")]
    Javascript,
    #[serde(alias = "ts")]
    Typescript,
    #[serde(alias = "sh")]
    Bash,
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" => Ok(Language::Javascript),
            "typescript" | "ts" => Ok(Language::Typescript),
            "bash" | "sh" => Ok(Language::Bash),
            other => Err(SandboxError::validation(format!(
                "unsupported language '{other}'"
            ))),
        }
    }
}

/// Input to the code-execution capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCodeInput {
    pub language: Language,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Where a sandbox's initial filesystem content comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    Git {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        depth: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<GitCredentials>,
    },
    Tarball {
        url: String,
    },
    Snapshot {
        id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredentials {
    pub username: String,
    pub token: String,
}

/// Configuration for creating a sandbox.
///
/// Every field is optional; adapters apply their documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    /// Image hint, resolved per provider (`python:3.12-slim` or a
    /// provider-native shortcut).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(rename = "memoryMiB", skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    /// Mount path → volume name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encrypted_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unencrypted_ports: Vec<u16>,
    /// Entry argv; providers default to an idle keep-alive command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
}

impl CreateOptions {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, mount: impl Into<String>, name: impl Into<String>) -> Self {
        self.volumes.insert(mount.into(), name.into());
        self
    }

    pub fn with_encrypted_port(mut self, port: u16) -> Self {
        self.encrypted_ports.push(port);
        self
    }

    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// All ports the caller asked to expose, encrypted first.
    pub fn requested_ports(&self) -> Vec<u16> {
        let mut ports = self.encrypted_ports.clone();
        for p in &self.unencrypted_ports {
            if !ports.contains(p) {
                ports.push(*p);
            }
        }
        ports
    }
}

/// A process started in the background inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
}

/// Options for starting a managed (possibly background) process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessOptions {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub background: bool,
}
