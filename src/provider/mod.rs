//! Provider adapters and driver composition.
//!
//! Each submodule adapts one backend to the capability contracts. This
//! module assembles the configured adapters into a [`DriverRegistry`] once
//! at startup; per-adapter caches (container ports, runtime URLs) live
//! inside the adapters behind their own locks.

pub mod blaxel;
pub mod cloudflare;
pub mod daytona;
pub mod docker;
pub mod e2b;
pub mod modal;
pub mod vercel;

use std::collections::HashMap;

use tracing::{info, warn};

use crate::capability::Driver;
use crate::config::Settings;
use crate::error::{DriverResult, SandboxError};
use crate::types::Provider;

/// Dispatches calls to the driver composed for each configured backend.
pub struct DriverRegistry {
    drivers: HashMap<Provider, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Compose a registry from resolved settings. Backends that fail to
    /// compose (for example no reachable Docker daemon) are skipped with a
    /// warning rather than failing startup.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new();
        if let Some(s) = settings.modal.clone() {
            registry.register(modal::compose(s));
        }
        if let Some(s) = settings.e2b.clone() {
            registry.register(e2b::compose(s));
        }
        if let Some(s) = settings.daytona.clone() {
            registry.register(daytona::compose(s));
        }
        if let Some(s) = settings.blaxel.clone() {
            registry.register(blaxel::compose(s));
        }
        if let Some(s) = settings.cloudflare.clone() {
            registry.register(cloudflare::compose(s));
        }
        if let Some(s) = settings.vercel.clone() {
            registry.register(vercel::compose(s));
        }
        if let Some(s) = settings.docker.clone() {
            match docker::compose(s) {
                Ok(driver) => {
                    registry.register(driver);
                }
                Err(e) => warn!(error = %e, "docker driver unavailable, skipping"),
            }
        }
        info!(providers = ?registry.providers(), "composed driver registry");
        registry
    }

    pub fn register(&mut self, driver: Driver) -> &mut Self {
        self.drivers.insert(driver.provider(), driver);
        self
    }

    /// Resolve the driver for a provider. Unconfigured providers are a
    /// caller error, not an upstream one.
    pub fn get(&self, provider: Provider) -> DriverResult<&Driver> {
        self.drivers.get(&provider).ok_or_else(|| {
            SandboxError::validation(format!("provider '{provider}' is not configured"))
                .with_provider(provider)
        })
    }

    /// All providers with a composed driver, in declaration order.
    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.drivers.contains_key(p))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
