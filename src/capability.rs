//! Capability contracts that every provider adapter satisfies.
//!
//! The driver surface is decomposed into six orthogonal service traits.
//! Adapters implement the groups their backend supports; optional operations
//! default to an `unsupported` error so callers can probe capabilities via
//! [`Capabilities`] before dispatching.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DriverResult, SandboxError};
use crate::types::{
    ChunkStream, CreateOptions, FsEntry, ProcessInfo, Provider, RunCodeInput, RunCommand,
    RunResult, SandboxInfo, SandboxStatus, SnapshotInfo, StartProcessOptions, VolumeInfo,
};

/// Sandbox lifecycle operations.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo>;

    async fn destroy(&self, id: &str) -> DriverResult<()>;

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus>;

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>>;

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo>;

    /// Suspend the sandbox. Status converges to `Stopped`, possibly after a
    /// provider-side async transition.
    async fn pause(&self, _id: &str) -> DriverResult<()> {
        Err(SandboxError::unsupported("pause").with_capability("lifecycle"))
    }

    /// Resume a paused sandbox back to `Ready`.
    async fn resume(&self, _id: &str) -> DriverResult<()> {
        Err(SandboxError::unsupported("resume").with_capability("lifecycle"))
    }
}

/// Command execution inside a sandbox.
#[async_trait]
pub trait Process: Send + Sync {
    /// Run a command and wait for exit or timeout.
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult>;

    /// Run a command and stream its output. The stream is finite and not
    /// restartable; dropping it aborts the remote process best-effort.
    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream>;

    /// Start a managed (possibly background) process.
    async fn start_process(
        &self,
        _id: &str,
        _opts: StartProcessOptions,
    ) -> DriverResult<ProcessInfo> {
        Err(SandboxError::unsupported("start_process").with_capability("process"))
    }

    async fn stop_process(&self, _id: &str, _proc_id: &str) -> DriverResult<()> {
        Err(SandboxError::unsupported("stop_process").with_capability("process"))
    }

    /// Resolve reachable URLs for in-sandbox TCP ports.
    async fn process_urls(
        &self,
        _id: &str,
        _ports: &[u16],
    ) -> DriverResult<BTreeMap<u16, String>> {
        Err(SandboxError::unsupported("process_urls").with_capability("process"))
    }
}

/// Sandbox filesystem access.
#[async_trait]
pub trait Fs: Send + Sync {
    /// Read a file as raw bytes.
    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes>;

    /// Read a file and decode it as UTF-8.
    async fn read_file_utf8(&self, id: &str, path: &str) -> DriverResult<String> {
        let bytes = self.read_file(id, path).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            SandboxError::validation(format!("{path} is not valid UTF-8: {e}"))
                .with_capability("fs")
                .with_sandbox(id)
        })
    }

    /// Write a file, creating parent directories as needed. `mode` is a Unix
    /// permission bit set where the backend honors one.
    async fn write_file(
        &self,
        id: &str,
        path: &str,
        data: Bytes,
        mode: Option<u32>,
    ) -> DriverResult<()>;

    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>>;

    /// Create a directory including intermediate components.
    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()>;

    async fn rm(&self, id: &str, path: &str, recursive: bool, force: bool) -> DriverResult<()>;
}

/// Filesystem snapshots. Snapshots are immutable; restore produces a new
/// sandbox and never mutates an existing one.
#[async_trait]
pub trait Snapshots: Send + Sync {
    async fn create(
        &self,
        id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> DriverResult<SnapshotInfo>;

    async fn restore(&self, _id: &str, _snapshot_id: &str) -> DriverResult<SandboxInfo> {
        Err(SandboxError::unsupported("restore").with_capability("snapshots"))
    }

    async fn list(&self, id: &str) -> DriverResult<Vec<SnapshotInfo>>;
}

impl std::fmt::Debug for dyn Snapshots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Snapshots")
    }
}

/// Named persistent volumes that outlive sandboxes.
#[async_trait]
pub trait Volumes: Send + Sync {
    async fn create(&self, name: &str) -> DriverResult<VolumeInfo>;

    /// Deleting a mounted volume is the provider's error to raise.
    async fn delete(&self, name: &str) -> DriverResult<()>;

    async fn list(&self) -> DriverResult<Vec<VolumeInfo>>;

    async fn get(&self, name: &str) -> DriverResult<VolumeInfo>;
}

impl std::fmt::Debug for dyn Volumes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Volumes")
    }
}

/// High-level code execution.
#[async_trait]
pub trait Code: Send + Sync {
    async fn run_code(&self, id: &str, input: RunCodeInput) -> DriverResult<RunResult>;
}

/// Which optional operations a driver actually implements.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Capabilities {
    pub pause_resume: bool,
    pub background_processes: bool,
    pub process_urls: bool,
    pub snapshots: bool,
    pub snapshot_restore: bool,
    pub volumes: bool,
}

/// The composite driver: six capability services behind one facade.
///
/// The facade performs no retries and recovers nothing; it only checks
/// capability presence before dispatch so absent groups fail with a
/// classified `unsupported` error instead of a panic.
#[derive(Clone)]
pub struct Driver {
    provider: Provider,
    capabilities: Capabilities,
    lifecycle: Arc<dyn Lifecycle>,
    process: Arc<dyn Process>,
    fs: Arc<dyn Fs>,
    code: Arc<dyn Code>,
    snapshots: Option<Arc<dyn Snapshots>>,
    volumes: Option<Arc<dyn Volumes>>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("provider", &self.provider)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Driver {
    pub fn new(
        provider: Provider,
        capabilities: Capabilities,
        lifecycle: Arc<dyn Lifecycle>,
        process: Arc<dyn Process>,
        fs: Arc<dyn Fs>,
        code: Arc<dyn Code>,
    ) -> Self {
        Self {
            provider,
            capabilities,
            lifecycle,
            process,
            fs,
            code,
            snapshots: None,
            volumes: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn Snapshots>) -> Self {
        self.capabilities.snapshots = true;
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_volumes(mut self, volumes: Arc<dyn Volumes>) -> Self {
        self.capabilities.volumes = true;
        self.volumes = Some(volumes);
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn lifecycle(&self) -> &Arc<dyn Lifecycle> {
        &self.lifecycle
    }

    pub fn process(&self) -> &Arc<dyn Process> {
        &self.process
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    pub fn code(&self) -> &Arc<dyn Code> {
        &self.code
    }

    pub fn snapshots(&self) -> DriverResult<&Arc<dyn Snapshots>> {
        self.snapshots.as_ref().ok_or_else(|| {
            SandboxError::unsupported("snapshots").with_provider(self.provider)
        })
    }

    pub fn volumes(&self) -> DriverResult<&Arc<dyn Volumes>> {
        self.volumes.as_ref().ok_or_else(|| {
            SandboxError::unsupported("volumes").with_provider(self.provider)
        })
    }
}

// ── Legacy monolithic drivers ─────────────────────────────────────────────────

/// The pre-split driver shape: one object carrying every operation.
///
/// Kept for gradual migration and for symmetric testing of the capability
/// split. [`Driver::from_legacy`] exposes the six services backed by it.
#[async_trait]
pub trait LegacyDriver: Send + Sync {
    fn provider(&self) -> Provider;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo>;
    async fn destroy(&self, id: &str) -> DriverResult<()>;
    async fn status(&self, id: &str) -> DriverResult<SandboxStatus>;
    async fn list(&self) -> DriverResult<Vec<SandboxInfo>>;
    async fn get(&self, id: &str) -> DriverResult<SandboxInfo>;

    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult>;
    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream>;

    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes>;
    async fn write_file(
        &self,
        id: &str,
        path: &str,
        data: Bytes,
        mode: Option<u32>,
    ) -> DriverResult<()>;
    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>>;
    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()>;
    async fn rm(&self, id: &str, path: &str, recursive: bool, force: bool) -> DriverResult<()>;

    async fn run_code(&self, id: &str, input: RunCodeInput) -> DriverResult<RunResult>;
}

struct LegacyLifecycle(Arc<dyn LegacyDriver>);

#[async_trait]
impl Lifecycle for LegacyLifecycle {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        self.0.create(opts).await
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        self.0.destroy(id).await
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        self.0.status(id).await
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        self.0.list().await
    }

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
        self.0.get(id).await
    }
}

struct LegacyProcess(Arc<dyn LegacyDriver>);

#[async_trait]
impl Process for LegacyProcess {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        self.0.run(id, cmd).await
    }

    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream> {
        self.0.stream(id, cmd).await
    }
}

struct LegacyFs(Arc<dyn LegacyDriver>);

#[async_trait]
impl Fs for LegacyFs {
    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes> {
        self.0.read_file(id, path).await
    }

    async fn write_file(
        &self,
        id: &str,
        path: &str,
        data: Bytes,
        mode: Option<u32>,
    ) -> DriverResult<()> {
        self.0.write_file(id, path, data, mode).await
    }

    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>> {
        self.0.list_dir(id, path, recursive).await
    }

    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()> {
        self.0.mkdir(id, path).await
    }

    async fn rm(&self, id: &str, path: &str, recursive: bool, force: bool) -> DriverResult<()> {
        self.0.rm(id, path, recursive, force).await
    }
}

struct LegacyCode(Arc<dyn LegacyDriver>);

#[async_trait]
impl Code for LegacyCode {
    async fn run_code(&self, id: &str, input: RunCodeInput) -> DriverResult<RunResult> {
        self.0.run_code(id, input).await
    }
}

impl Driver {
    /// Expose the six capability services backed by a monolithic driver.
    pub fn from_legacy(legacy: Arc<dyn LegacyDriver>) -> Self {
        let provider = legacy.provider();
        let capabilities = legacy.capabilities();
        Self {
            provider,
            capabilities,
            lifecycle: Arc::new(LegacyLifecycle(legacy.clone())),
            process: Arc::new(LegacyProcess(legacy.clone())),
            fs: Arc::new(LegacyFs(legacy.clone())),
            code: Arc::new(LegacyCode(legacy)),
            snapshots: None,
            volumes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::ChunkChannel;

    struct FakeLegacy;

    #[async_trait]
    impl LegacyDriver for FakeLegacy {
        fn provider(&self) -> Provider {
            Provider::Docker
        }

        async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
            Ok(SandboxInfo {
                id: "sbx-1".into(),
                name: opts.name,
                provider: Provider::Docker,
                status: SandboxStatus::Ready,
                created_at: chrono::Utc::now(),
                metadata: Default::default(),
            })
        }

        async fn destroy(&self, _id: &str) -> DriverResult<()> {
            Ok(())
        }

        async fn status(&self, _id: &str) -> DriverResult<SandboxStatus> {
            Ok(SandboxStatus::Ready)
        }

        async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
            Ok(vec![])
        }

        async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
            Err(SandboxError::not_found(format!("sandbox {id}")))
        }

        async fn run(&self, _id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
            Ok(RunResult {
                exit_code: 0,
                stdout: cmd.cmd,
                stderr: String::new(),
            })
        }

        async fn stream(&self, _id: &str, _cmd: RunCommand) -> DriverResult<ChunkStream> {
            Ok(Box::pin(futures::stream::iter(vec![
                crate::types::ProcessChunk::stdout(&b"hi"[..]),
            ])))
        }

        async fn read_file(&self, _id: &str, _path: &str) -> DriverResult<Bytes> {
            Ok(Bytes::from_static(b"data"))
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

        async fn rm(
            &self,
            _id: &str,
            _path: &str,
            _recursive: bool,
            _force: bool,
        ) -> DriverResult<()> {
            Ok(())
        }

        async fn run_code(&self, _id: &str, _input: RunCodeInput) -> DriverResult<RunResult> {
            Ok(RunResult {
                exit_code: 0,
                stdout: "ok".into(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn legacy_adapter_round_trip() {
        use futures::StreamExt;

        let driver = Driver::from_legacy(Arc::new(FakeLegacy));
        assert_eq!(driver.provider(), Provider::Docker);

        let info = driver
            .lifecycle()
            .create(CreateOptions::default().with_name("demo"))
            .await
            .unwrap();
        assert_eq!(info.name.as_deref(), Some("demo"));

        let result = driver
            .process()
            .run("sbx-1", RunCommand::new("echo"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "echo");

        let mut stream = driver
            .process()
            .stream("sbx-1", RunCommand::new("cat"))
            .await
            .unwrap();
        let chunk = stream.next().await.unwrap();
        assert_eq!(chunk.channel, ChunkChannel::Stdout);
    }

    #[tokio::test]
    async fn absent_groups_fail_unsupported() {
        let driver = Driver::from_legacy(Arc::new(FakeLegacy));
        let err = driver.snapshots().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
        let err = driver.volumes().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn optional_process_ops_default_to_unsupported() {
        let driver = Driver::from_legacy(Arc::new(FakeLegacy));
        let err = driver
            .process()
            .start_process("sbx-1", StartProcessOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
        let err = driver.process().process_urls("sbx-1", &[80]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }
}
