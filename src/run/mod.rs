//! Run orchestration: one task fanned across N provider lanes.
//!
//! A run provisions one sandbox per selected provider, prepares the
//! repository inside each, starts the in-sandbox agent, and relays its
//! events onto the run's bus. Lanes are independent: a failing lane never
//! cancels its peers, and the run only reports a terminal status once every
//! lane has settled.

mod lane;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{AgentEventType, EventBus};
use crate::error::{DriverResult, SandboxError};
use crate::provider::DriverRegistry;
use crate::types::Provider;

/// What the caller asks for.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    #[serde(rename = "repoUrl")]
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub task: String,
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub config: RunConfig,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Knobs for the in-sandbox agent and phase deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on agent loop iterations, forwarded to the agent.
    pub max_iterations: u32,
    /// Where the repository is cloned inside every sandbox.
    pub workdir: String,
    /// Argv that starts the agent server inside the sandbox.
    pub agent_command: Vec<String>,
    /// Port the agent server listens on.
    pub agent_port: u16,
    /// Health route polled until the agent answers.
    pub health_path: String,
    /// Route that kicks off the agent loop.
    pub start_path: String,
    /// SSE route carrying the agent's own events.
    pub events_path: String,
    pub clone_timeout_ms: u64,
    pub install_timeout_ms: u64,
    /// Budget for the agent server to come up.
    pub ready_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            workdir: "/workspace/repo".to_string(),
            agent_command: vec![
                "opencode".to_string(),
                "serve".to_string(),
                "--hostname".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                "4096".to_string(),
            ],
            agent_port: 4096,
            health_path: "/health".to_string(),
            start_path: "/ralph/start".to_string(),
            events_path: "/events".to_string(),
            clone_timeout_ms: 300_000,
            install_timeout_ms: 600_000,
            ready_timeout_ms: 120_000,
            health_poll_interval_ms: 2_000,
        }
    }
}

/// Aggregate run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Cloning,
    Installing,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Where a single lane currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanePhase {
    Pending,
    Cloning,
    Installing,
    Running,
    Completed,
    Failed,
}

impl LanePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LanePhase::Completed | LanePhase::Failed)
    }

    /// How far along a lane is, for the most-advanced aggregation.
    fn rank(&self) -> u8 {
        match self {
            LanePhase::Pending => 0,
            LanePhase::Cloning => 1,
            LanePhase::Installing => 2,
            LanePhase::Running | LanePhase::Completed | LanePhase::Failed => 3,
        }
    }
}

/// Per-provider slice of a run.
#[derive(Debug, Clone, Serialize)]
pub struct LaneState {
    #[serde(rename = "sandboxId", skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub status: LanePhase,
    #[serde(rename = "opencodeUrl", skip_serializing_if = "Option::is_none")]
    pub opencode_url: Option<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl LaneState {
    fn new() -> Self {
        Self {
            sandbox_id: None,
            status: LanePhase::Pending,
            opencode_url: None,
            session_id: None,
        }
    }
}

/// Snapshot of a run's state.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub id: String,
    pub status: RunStatus,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "perProvider")]
    pub per_provider: BTreeMap<String, LaneState>,
    /// Highest phase rank the run has reached; the aggregate never
    /// regresses even when a lane re-enters an earlier phase.
    #[serde(skip)]
    high_water: u8,
}

impl RunState {
    /// Recompute the aggregate from lane phases.
    ///
    /// While any lane is live, the aggregate is the most-advanced active
    /// phase (running > installing > cloning), clamped so it never moves
    /// backwards. Terminal only once every lane is terminal: `failed` if at
    /// least one lane failed, otherwise `completed`.
    fn recompute(&mut self) {
        let lanes: Vec<LanePhase> = self.per_provider.values().map(|l| l.status).collect();
        if lanes.is_empty() {
            return;
        }
        if lanes.iter().all(|p| p.is_terminal()) {
            self.status = if lanes.iter().any(|p| *p == LanePhase::Failed) {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
            self.completed_at = Some(chrono::Utc::now());
            return;
        }
        let rank = lanes
            .iter()
            .filter(|p| !p.is_terminal())
            .map(|p| p.rank())
            .max()
            .unwrap_or(0)
            .max(self.high_water);
        self.high_water = rank;
        self.status = match rank {
            0 => RunStatus::Idle,
            1 => RunStatus::Cloning,
            2 => RunStatus::Installing,
            _ => RunStatus::Running,
        };
    }
}

/// A live (or finished) run.
pub struct RunHandle {
    pub id: String,
    pub bus: Arc<EventBus>,
    state: Mutex<RunState>,
    cancel: CancellationToken,
}

impl RunHandle {
    fn new(id: String, providers: &[Provider]) -> Self {
        let per_provider = providers
            .iter()
            .map(|p| (p.as_str().to_string(), LaneState::new()))
            .collect();
        Self {
            id: id.clone(),
            bus: Arc::new(EventBus::new()),
            state: Mutex::new(RunState {
                id,
                status: RunStatus::Idle,
                started_at: chrono::Utc::now(),
                completed_at: None,
                per_provider,
                high_water: 0,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state.lock().expect("run state lock poisoned").clone()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state().status,
            RunStatus::Completed | RunStatus::Failed
        )
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mutate one lane and re-derive the aggregate. Closes the bus when the
    /// run just became terminal.
    pub(crate) fn update_lane(&self, provider: Provider, f: impl FnOnce(&mut LaneState)) {
        let became_terminal = {
            let mut state = self.state.lock().expect("run state lock poisoned");
            let was_terminal =
                matches!(state.status, RunStatus::Completed | RunStatus::Failed);
            if let Some(lane) = state.per_provider.get_mut(provider.as_str()) {
                f(lane);
            }
            state.recompute();
            let now_terminal =
                matches!(state.status, RunStatus::Completed | RunStatus::Failed);
            !was_terminal && now_terminal
        };
        if became_terminal {
            let status = self.state().status;
            info!(run = %self.id, ?status, "run reached terminal status");
            self.bus.publish(
                AgentEventType::Complete,
                None,
                serde_json::json!({"status": status}),
            );
            self.bus.close();
        }
    }
}

/// Outcome of provisioning one lane, reported from `POST /run/start`.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStartReport {
    pub provider: Provider,
    #[serde(rename = "sandboxId", skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub providers: Vec<LaneStartReport>,
}

/// Owns every active run.
pub struct Orchestrator {
    registry: Arc<DriverRegistry>,
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a run: spawn one lane per provider and wait only for sandbox
    /// provisioning before answering. If every lane fails to provision, the
    /// first lane's error is surfaced and no run is retained.
    pub async fn start(&self, request: RunRequest) -> DriverResult<StartReport> {
        if request.providers.is_empty() {
            return Err(SandboxError::validation("no providers selected"));
        }
        let run_id = format!("run-{}", &uuid::Uuid::new_v4().to_string()[..13]);
        let handle = Arc::new(RunHandle::new(run_id.clone(), &request.providers));
        info!(run = %run_id, providers = ?request.providers, "starting run");

        let mut provision_rxs = Vec::new();
        for provider in request.providers.clone() {
            let (tx, rx) = tokio::sync::oneshot::channel();
            provision_rxs.push((provider, rx));
            let ctx = lane::LaneContext {
                run_id: run_id.clone(),
                provider,
                registry: self.registry.clone(),
                handle: handle.clone(),
                request: request.clone(),
                provisioned: tx,
            };
            tokio::spawn(lane::run_lane(ctx));
        }

        let mut reports = Vec::new();
        for (provider, rx) in provision_rxs {
            let report = match rx.await {
                Ok(Ok(sandbox_id)) => LaneStartReport {
                    provider,
                    sandbox_id: Some(sandbox_id),
                    success: true,
                    error: None,
                },
                Ok(Err(message)) => LaneStartReport {
                    provider,
                    sandbox_id: None,
                    success: false,
                    error: Some(message),
                },
                Err(_) => LaneStartReport {
                    provider,
                    sandbox_id: None,
                    success: false,
                    error: Some("lane exited before provisioning".to_string()),
                },
            };
            reports.push(report);
        }

        if reports.iter().all(|r| !r.success) {
            let first = reports
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "all lanes failed to provision".to_string());
            warn!(run = %run_id, "no lane provisioned, surfacing failure");
            return Err(SandboxError::provider(first).with_operation("run_start"));
        }

        self.runs
            .lock()
            .expect("runs lock poisoned")
            .insert(run_id.clone(), handle);
        Ok(StartReport {
            run_id,
            providers: reports,
        })
    }

    /// Cancel every lane of a run. Cleanup is cooperative: each lane gets a
    /// bounded grace window to destroy its sandbox.
    pub fn stop(&self, run_id: &str) -> DriverResult<()> {
        let handle = self
            .get(run_id)
            .ok_or_else(|| SandboxError::not_found(format!("run '{run_id}' not found")))?;
        info!(run = %run_id, "stopping run");
        handle.cancel.cancel();
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .get(run_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<RunHandle>> {
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
