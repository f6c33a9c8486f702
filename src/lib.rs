//! # crucible
//!
//! A multi-provider sandbox orchestration SDK: one programmatic interface
//! for creating ephemeral isolated compute environments, executing commands
//! and code inside them, streaming their output, manipulating their
//! filesystems, managing volumes and snapshots, and exposing their network
//! ports — across heterogeneous backends (Modal, E2B, Daytona, Blaxel,
//! Cloudflare, Vercel, and local Docker).
//!
//! ## Architecture
//!
//! The crate is organized around four ideas:
//!
//! ### Capabilities ([`capability`])
//!
//! The driver surface is split into six orthogonal service traits —
//! [`Lifecycle`], [`Process`], [`Fs`], [`Snapshots`], [`Volumes`], and
//! [`Code`] — composed behind a [`Driver`] facade. Optional operations
//! surface a classified `unsupported` error, and a [`Capabilities`]
//! descriptor lets callers probe before dispatching.
//!
//! ### Adapters ([`provider`])
//!
//! One adapter per backend translates the uniform contracts into that
//! provider's native model: REST calls, WebSocket streams, the local Docker
//! daemon, or vendor tooling driven over a shell connector. Adapters own
//! the per-provider quirks — status-enum folding, image resolution, port
//! tunnel discovery, base64 command envelopes, `ls -la` parsing.
//!
//! ### Orchestration ([`run`])
//!
//! A run fans one task across N providers. Each lane provisions a sandbox,
//! clones the repository, installs dependencies, starts the in-sandbox
//! agent, and relays its events. Lanes fail independently; the aggregate
//! status reconciles once every lane settles.
//!
//! ### Events ([`bus`] and [`api`])
//!
//! Every run owns an append-only event log with replay-on-subscribe
//! broadcast, served to the dashboard over SSE along with the REST surface.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use crucible::config::Settings;
//! use crucible::provider::DriverRegistry;
//! use crucible::types::{CreateOptions, Language, Provider, RunCodeInput};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::from_env();
//!     let registry = Arc::new(DriverRegistry::from_settings(&settings));
//!
//!     let driver = registry.get(Provider::Docker)?;
//!     let sandbox = driver
//!         .lifecycle()
//!         .create(CreateOptions::default().with_image("python:3.12-alpine"))
//!         .await?;
//!
//!     let result = driver
//!         .code()
//!         .run_code(
//!             &sandbox.id,
//!             RunCodeInput {
//!                 language: Language::Python,
//!                 code: "print('Hello from Python!')".into(),
//!                 timeout_ms: None,
//!             },
//!         )
//!         .await?;
//!     println!("{}", result.stdout);
//!
//!     driver.lifecycle().destroy(&sandbox.id).await?;
//!     Ok(())
//! }
//! ```
//!
//! [`Lifecycle`]: capability::Lifecycle
//! [`Process`]: capability::Process
//! [`Fs`]: capability::Fs
//! [`Snapshots`]: capability::Snapshots
//! [`Volumes`]: capability::Volumes
//! [`Code`]: capability::Code
//! [`Driver`]: capability::Driver
//! [`Capabilities`]: capability::Capabilities

pub mod api;
pub mod bundled;
pub mod bus;
pub mod capability;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod provider;
pub mod run;
pub mod shellops;
pub mod store;
pub mod types;

// The types most users need when embedding the SDK.

pub use capability::{Capabilities, Driver};
pub use config::Settings;
pub use error::{DriverResult, ErrorKind, SandboxError};
pub use provider::DriverRegistry;
pub use run::{Orchestrator, RunRequest, RunStatus};
pub use types::{
    CreateOptions, Provider, RunCodeInput, RunCommand, RunResult, SandboxInfo, SandboxStatus,
};
