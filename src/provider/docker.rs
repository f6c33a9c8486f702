//! Local Docker adapter.
//!
//! Talks to the local daemon. Requested ports are bound to ephemeral host
//! ports at create time; the mapping is cached per sandbox so
//! `process_urls` can synthesize `http://{advertise_host}:{host_port}`
//! URLs. Files travel as tar archives, which keeps binary content intact
//! without shell encoding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, ListImagesOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::capability::{
    Capabilities, Driver, Fs, Lifecycle, Process, Snapshots, Volumes,
};
use crate::config::DockerSettings;
use crate::error::{classify_http, DriverResult, ErrorContext, ErrorKind, SandboxError};
use crate::shellops::{self, ShellCode};
use crate::types::{
    ChunkStream, CreateOptions, FsEntry, ProcessChunk, ProcessInfo, ProcessStatus, Provider,
    RunCommand, RunResult, SandboxInfo, SandboxStatus, SnapshotInfo, StartProcessOptions,
    VolumeInfo,
};

const MANAGED_LABEL: &str = "crucible.managed";
const SANDBOX_LABEL: &str = "crucible.sandbox";
const SNAPSHOT_REPO: &str = "sandbox-snapshot";

/// Compose the Docker driver from settings.
pub fn compose(settings: DockerSettings) -> DriverResult<Driver> {
    let adapter = Arc::new(DockerAdapter::connect(settings)?);
    let capabilities = Capabilities {
        pause_resume: false,
        background_processes: true,
        process_urls: true,
        snapshots: true,
        snapshot_restore: false,
        volumes: true,
    };
    Ok(Driver::new(
        Provider::Docker,
        capabilities,
        adapter.clone(),
        adapter.clone(),
        adapter.clone(),
        Arc::new(ShellCode::new(adapter.clone() as Arc<dyn Process>)),
    )
    .with_snapshots(adapter.clone())
    .with_volumes(adapter))
}

struct ContainerEntry {
    /// In-sandbox port → host port.
    ports: HashMap<u16, u16>,
}

pub struct DockerAdapter {
    docker: Docker,
    settings: DockerSettings,
    containers: Mutex<HashMap<String, ContainerEntry>>,
}

impl DockerAdapter {
    pub fn connect(settings: DockerSettings) -> DriverResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::network(format!("cannot reach docker daemon: {e}"))
                .with_provider(Provider::Docker)
        })?;
        Ok(Self {
            docker,
            settings,
            containers: Mutex::new(HashMap::new()),
        })
    }

    fn err(&self, operation: &str, sandbox: Option<&str>, e: bollard::errors::Error) -> SandboxError {
        let context = ErrorContext {
            provider: Some(Provider::Docker),
            operation: operation.to_string(),
            sandbox_id: sandbox.map(str::to_string),
            ..Default::default()
        };
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => classify_http(status_code, message, None, context),
            other => {
                let kind =
                    crate::error::classify_message(Some(Provider::Docker), &other.to_string());
                let kind = if kind == ErrorKind::Provider {
                    ErrorKind::Network
                } else {
                    kind
                };
                let mut err = SandboxError::new(kind, other.to_string());
                err.context = context;
                err
            }
        }
    }

    /// Run an exec and collect output plus the exit code.
    async fn exec_collect(
        &self,
        id: &str,
        argv: Vec<String>,
        env: Vec<String>,
        cwd: Option<String>,
    ) -> DriverResult<RunResult> {
        let options = CreateExecOptions {
            cmd: Some(argv),
            env: Some(env),
            working_dir: cwd,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| self.err("create_exec", Some(id), e))?;

        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| self.err("start_exec", Some(id), e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| self.err("inspect_exec", Some(id), e))?;

        Ok(RunResult {
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
            stdout,
            stderr,
        })
    }

    async fn host_ports(&self, id: &str) -> DriverResult<HashMap<u16, u16>> {
        if let Some(entry) = self.containers.lock().await.get(id) {
            return Ok(entry.ports.clone());
        }
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| self.err("inspect_container", Some(id), e))?;
        let ports = parse_port_map(
            inspect
                .network_settings
                .and_then(|n| n.ports)
                .unwrap_or_default(),
        );
        self.containers.lock().await.insert(
            id.to_string(),
            ContainerEntry {
                ports: ports.clone(),
            },
        );
        Ok(ports)
    }
}

/// Map an inspect status enum onto the uniform status.
fn map_state_enum(
    state: Option<bollard::models::ContainerStateStatusEnum>,
) -> SandboxStatus {
    use bollard::models::ContainerStateStatusEnum as S;
    match state {
        Some(S::RUNNING) => SandboxStatus::Ready,
        Some(S::CREATED) | Some(S::RESTARTING) => SandboxStatus::Creating,
        Some(S::EXITED) | Some(S::PAUSED) => SandboxStatus::Stopped,
        _ => SandboxStatus::Failed,
    }
}

/// Map a daemon state string onto the uniform status.
fn map_state(state: Option<&str>) -> SandboxStatus {
    match state {
        Some("running") => SandboxStatus::Ready,
        Some("created") | Some("restarting") => SandboxStatus::Creating,
        Some("exited") | Some("paused") => SandboxStatus::Stopped,
        Some("dead") | Some("removing") => SandboxStatus::Failed,
        _ => SandboxStatus::Failed,
    }
}

/// Recover in-sandbox → host port pairs from an inspect port map.
fn parse_port_map(
    ports: HashMap<String, Option<Vec<bollard::models::PortBinding>>>,
) -> HashMap<u16, u16> {
    let mut out = HashMap::new();
    for (key, bindings) in ports {
        let container_port = key
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok());
        let host_port = bindings
            .unwrap_or_default()
            .into_iter()
            .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()));
        if let (Some(cp), Some(hp)) = (container_port, host_port) {
            out.insert(cp, hp);
        }
    }
    out
}

#[async_trait]
impl Lifecycle for DockerAdapter {
    async fn create(&self, opts: CreateOptions) -> DriverResult<SandboxInfo> {
        let image = opts
            .image
            .clone()
            .unwrap_or_else(|| self.settings.default_image.clone());

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds: Vec<String> = opts
            .volumes
            .iter()
            .map(|(mount, name)| format!("{name}:{mount}"))
            .collect();

        let requested = opts.requested_ports();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            HashMap::new();
        for port in &requested {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    // "0" asks the daemon for an ephemeral host port.
                    host_port: Some("0".to_string()),
                }]),
            );
        }

        let mut host_config = bollard::models::HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };
        if let Some(cpu) = opts.cpu {
            host_config.cpu_period = Some(100_000);
            host_config.cpu_quota = Some((cpu * 100_000.0) as i64);
        }
        if let Some(mib) = opts.memory_mib {
            host_config.memory = Some((mib * 1024 * 1024) as i64);
        }

        let command = opts
            .command
            .clone()
            .unwrap_or_else(|| vec!["sleep".to_string(), "infinity".to_string()]);

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        if let Some(name) = &opts.name {
            labels.insert("crucible.name".to_string(), name.clone());
        }

        let container_config = ContainerConfig {
            image: Some(image),
            env: Some(env),
            working_dir: opts.workdir.clone(),
            cmd: Some(command),
            labels: Some(labels),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            tty: Some(true),
            ..Default::default()
        };

        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("crucible-{}", uuid::Uuid::new_v4()));
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| self.err("create_container", None, e))?;
        let id = response.id;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| self.err("start_container", Some(&id), e))?;

        // Ephemeral ports are only known after start.
        let inspect = self
            .docker
            .inspect_container(&id, None)
            .await
            .map_err(|e| self.err("inspect_container", Some(&id), e))?;
        let ports = parse_port_map(
            inspect
                .network_settings
                .and_then(|n| n.ports)
                .unwrap_or_default(),
        );
        debug!(sandbox = %id, ?ports, "docker sandbox started");
        self.containers
            .lock()
            .await
            .insert(id.clone(), ContainerEntry { ports });

        Ok(SandboxInfo {
            id,
            name: opts.name,
            provider: Provider::Docker,
            status: SandboxStatus::Ready,
            created_at: chrono::Utc::now(),
            metadata: BTreeMap::new(),
        })
    }

    async fn destroy(&self, id: &str) -> DriverResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| self.err("remove_container", Some(id), e))?;
        self.containers.lock().await.remove(id);
        Ok(())
    }

    async fn status(&self, id: &str) -> DriverResult<SandboxStatus> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| self.err("inspect_container", Some(id), e))?;
        Ok(map_state_enum(inspect.state.and_then(|s| s.status)))
    }

    async fn list(&self) -> DriverResult<Vec<SandboxInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = match self.docker.list_containers(Some(options)).await {
            Ok(s) => s,
            Err(e) => {
                let err = self.err("list_containers", None, e);
                if matches!(err.kind, ErrorKind::Network | ErrorKind::Timeout) {
                    warn!(error = %err, "docker list failed transiently, returning empty");
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };
        Ok(summaries
            .into_iter()
            .map(|c| {
                let created = c
                    .created
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                    .unwrap_or_else(chrono::Utc::now);
                SandboxInfo {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .and_then(|n| n.first().map(|s| s.trim_start_matches('/').to_string())),
                    provider: Provider::Docker,
                    status: map_state(c.state.as_deref()),
                    created_at: created,
                    metadata: BTreeMap::new(),
                }
            })
            .collect())
    }

    async fn get(&self, id: &str) -> DriverResult<SandboxInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| self.err("inspect_container", Some(id), e))?;
        let created = inspect
            .created
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let status = map_state_enum(inspect.state.and_then(|s| s.status));
        Ok(SandboxInfo {
            id: id.to_string(),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string()),
            provider: Provider::Docker,
            status,
            created_at: created,
            metadata: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl Process for DockerAdapter {
    async fn run(&self, id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
        let argv: Vec<String> = std::iter::once(cmd.cmd.clone())
            .chain(cmd.args.iter().cloned())
            .collect();
        let env: Vec<String> = cmd.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let work = self.exec_collect(id, argv, env, cmd.cwd.clone());
        match cmd.timeout_ms {
            Some(ms) => tokio::time::timeout(std::time::Duration::from_millis(ms), work)
                .await
                .map_err(|_| {
                    SandboxError::timeout(format!("command exceeded {ms} ms"))
                        .with_provider(Provider::Docker)
                        .with_operation("run")
                        .with_sandbox(id)
                })?,
            None => work.await,
        }
    }

    async fn stream(&self, id: &str, cmd: RunCommand) -> DriverResult<ChunkStream> {
        let argv: Vec<String> = std::iter::once(cmd.cmd.clone())
            .chain(cmd.args.iter().cloned())
            .collect();
        let env: Vec<String> = cmd.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let options = CreateExecOptions {
            cmd: Some(argv),
            env: Some(env),
            working_dir: cmd.cwd.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| self.err("create_exec", Some(id), e))?;
        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| self.err("start_exec", Some(id), e))?;

        if let StartExecResults::Attached { output, .. } = output {
            let stream = output.filter_map(|msg| async {
                match msg {
                    Ok(LogOutput::StdOut { message }) => Some(ProcessChunk::stdout(message)),
                    Ok(LogOutput::StdErr { message }) => Some(ProcessChunk::stderr(message)),
                    _ => None,
                }
            });
            Ok(Box::pin(stream))
        } else {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    async fn start_process(
        &self,
        id: &str,
        opts: StartProcessOptions,
    ) -> DriverResult<ProcessInfo> {
        // Launch under nohup and capture the pid; the pid doubles as the
        // process handle for stop_process.
        let inner = std::iter::once(opts.cmd.as_str())
            .chain(opts.args.iter().map(String::as_str))
            .map(|a| shell_words::quote(a).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let mut line = String::new();
        for (k, v) in &opts.env {
            line.push_str(&format!("export {}={} && ", k, shell_words::quote(v)));
        }
        if let Some(cwd) = &opts.cwd {
            line.push_str(&format!("cd {} && ", shell_words::quote(cwd)));
        }
        line.push_str(&format!(
            "nohup {inner} > /tmp/crucible-proc.log 2>&1 & echo $!"
        ));

        let result = self
            .exec_collect(
                id,
                vec!["sh".to_string(), "-c".to_string(), line],
                Vec::new(),
                None,
            )
            .await?;
        let pid = result.stdout.trim().to_string();
        if result.exit_code != 0 || pid.is_empty() {
            return Err(SandboxError::provider(format!(
                "failed to start background process: {}",
                result.stderr.trim()
            ))
            .with_provider(Provider::Docker)
            .with_sandbox(id));
        }
        Ok(ProcessInfo {
            id: pid,
            status: ProcessStatus::Running,
        })
    }

    async fn stop_process(&self, id: &str, proc_id: &str) -> DriverResult<()> {
        let result = self
            .exec_collect(
                id,
                vec!["kill".to_string(), proc_id.to_string()],
                Vec::new(),
                None,
            )
            .await?;
        if result.exit_code != 0 {
            return Err(SandboxError::not_found(format!(
                "process {proc_id} not running: {}",
                result.stderr.trim()
            ))
            .with_provider(Provider::Docker)
            .with_sandbox(id));
        }
        Ok(())
    }

    async fn process_urls(
        &self,
        id: &str,
        ports: &[u16],
    ) -> DriverResult<BTreeMap<u16, String>> {
        let mapping = self.host_ports(id).await?;
        let mut urls = BTreeMap::new();
        for port in ports {
            let host_port = mapping.get(port).ok_or_else(|| {
                SandboxError::not_found(format!("port {port} was not exposed at create time"))
                    .with_provider(Provider::Docker)
                    .with_sandbox(id)
            })?;
            urls.insert(
                *port,
                format!("http://{}:{}", self.settings.advertise_host, host_port),
            );
        }
        Ok(urls)
    }
}

#[async_trait]
impl Fs for DockerAdapter {
    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes> {
        let mut stream = self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.err("download_from_container", Some(id), e))?;
            archive.extend_from_slice(&chunk);
        }
        extract_single_file(&archive, path).map_err(|e| {
            SandboxError::provider(format!("malformed archive for {path}: {e}"))
                .with_provider(Provider::Docker)
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
        let parent = std::path::Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let file_name = std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::validation(format!("not a file path: {path}")))?;

        self.mkdir(id, &parent).await?;

        let archive = single_file_archive(&file_name, &data, mode.unwrap_or(0o644))?;
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| self.err("upload_to_container", Some(id), e))?;
        Ok(())
    }

    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>> {
        let quoted = shell_words::quote(path).into_owned();
        let line = if recursive {
            format!("find {quoted} -mindepth 1 -exec ls -ld {{}} +")
        } else {
            format!("ls -la {quoted}")
        };
        let result = self
            .run(id, RunCommand::new("sh").arg("-c").arg(line))
            .await?;
        if result.exit_code != 0 {
            let kind = crate::error::classify_message(Some(Provider::Docker), &result.stderr);
            return Err(SandboxError::new(kind, result.stderr.trim().to_string())
                .with_provider(Provider::Docker)
                .with_operation("list_dir")
                .with_sandbox(id));
        }
        Ok(result
            .stdout
            .lines()
            .filter_map(|l| shellops::parse_ls_line(l, path))
            .collect())
    }

    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()> {
        let result = self
            .run(id, RunCommand::new("mkdir").arg("-p").arg(path))
            .await?;
        if result.exit_code != 0 {
            return Err(SandboxError::provider(result.stderr.trim().to_string())
                .with_provider(Provider::Docker)
                .with_operation("mkdir")
                .with_sandbox(id));
        }
        Ok(())
    }

    async fn rm(&self, id: &str, path: &str, recursive: bool, force: bool) -> DriverResult<()> {
        let mut cmd = RunCommand::new("rm");
        if recursive {
            cmd = cmd.arg("-r");
        }
        if force {
            cmd = cmd.arg("-f");
        }
        let result = self.run(id, cmd.arg(path)).await?;
        if result.exit_code != 0 {
            let kind = crate::error::classify_message(Some(Provider::Docker), &result.stderr);
            return Err(SandboxError::new(kind, result.stderr.trim().to_string())
                .with_provider(Provider::Docker)
                .with_operation("rm")
                .with_sandbox(id));
        }
        Ok(())
    }
}

#[async_trait]
impl Snapshots for DockerAdapter {
    async fn create(
        &self,
        id: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> DriverResult<SnapshotInfo> {
        let snapshot_id = format!("{:x}", {
            use sha2::Digest;
            let mut hasher = sha2::Sha256::new();
            hasher.update(id.as_bytes());
            hasher.update(uuid::Uuid::new_v4().as_bytes());
            hasher.finalize()
        });
        let snapshot_id = &snapshot_id[..12];

        let options = CommitContainerOptions {
            container: id.to_string(),
            repo: SNAPSHOT_REPO.to_string(),
            tag: snapshot_id.to_string(),
            ..Default::default()
        };
        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), id.to_string());
        let config = ContainerConfig::<String> {
            labels: Some(labels),
            ..Default::default()
        };
        self.docker
            .commit_container(options, config)
            .await
            .map_err(|e| self.err("commit_container", Some(id), e))?;

        Ok(SnapshotInfo {
            id: format!("{SNAPSHOT_REPO}:{snapshot_id}"),
            created_at: chrono::Utc::now(),
            metadata,
        })
    }

    // Restoring would need a new container created from the committed image;
    // the default `restore` surfaces `unsupported`.

    async fn list(&self, id: &str) -> DriverResult<Vec<SnapshotInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{SANDBOX_LABEL}={id}")],
        );
        let options = ListImagesOptions {
            all: false,
            filters,
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|e| self.err("list_images", Some(id), e))?;
        Ok(images
            .into_iter()
            .map(|img| SnapshotInfo {
                id: img
                    .repo_tags
                    .first()
                    .cloned()
                    .unwrap_or(img.id),
                created_at: chrono::DateTime::from_timestamp(img.created, 0)
                    .unwrap_or_else(chrono::Utc::now),
                metadata: BTreeMap::new(),
            })
            .collect())
    }
}

#[async_trait]
impl Volumes for DockerAdapter {
    async fn create(&self, name: &str) -> DriverResult<VolumeInfo> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels,
                ..Default::default()
            })
            .await
            .map_err(|e| self.err("create_volume", None, e))?;
        Ok(VolumeInfo {
            id: volume.name.clone(),
            name: volume.name,
            created_at: volume
                .created_at
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc)),
        })
    }

    async fn delete(&self, name: &str) -> DriverResult<()> {
        self.docker
            .remove_volume(name, None)
            .await
            .map_err(|e| self.err("remove_volume", None, e))
    }

    async fn list(&self) -> DriverResult<Vec<VolumeInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );
        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(|e| self.err("list_volumes", None, e))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeInfo {
                id: v.name.clone(),
                name: v.name,
                created_at: v
                    .created_at
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&chrono::Utc)),
            })
            .collect())
    }

    async fn get(&self, name: &str) -> DriverResult<VolumeInfo> {
        let volume = self
            .docker
            .inspect_volume(name)
            .await
            .map_err(|e| self.err("inspect_volume", None, e))?;
        Ok(VolumeInfo {
            id: volume.name.clone(),
            name: volume.name,
            created_at: volume
                .created_at
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&chrono::Utc)),
        })
    }
}

/// Build an in-memory tar archive holding one file.
fn single_file_archive(name: &str, data: &[u8], mode: u32) -> DriverResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| SandboxError::provider(format!("tar build failed: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| SandboxError::provider(format!("tar finish failed: {e}")))
}

/// Pull the first regular file out of a tar archive.
fn extract_single_file(archive: &[u8], path: &str) -> std::io::Result<Bytes> {
    use std::io::Read;

    let mut tar = tar::Archive::new(archive);
    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(Bytes::from(data));
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no file entry for {path} in archive"),
    ))
}
