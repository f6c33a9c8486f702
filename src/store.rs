//! Narrow persistence seam.
//!
//! The user/auth plane lives in an external document store; the server only
//! needs these few record shapes and index-style queries. [`InMemoryStore`]
//! backs the server by default and the tests always.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::Provider;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A sandbox a user created through the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub sandbox_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A run a user started through the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub user_id: String,
    pub repo_url: String,
    pub task: String,
    pub providers: Vec<Provider>,
    pub status: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// One persisted agent event, for history queries after the bus is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEventRecord {
    pub id: String,
    pub run_id: String,
    pub seq: u64,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

/// An opaque per-user provider credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKeyRecord {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Never returned by list queries.
    #[serde(skip_serializing)]
    pub secret: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put_sandbox(&self, record: SandboxRecord) -> Result<(), StoreError>;
    async fn sandboxes_by_user(&self, user_id: &str) -> Result<Vec<SandboxRecord>, StoreError>;
    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), StoreError>;

    async fn put_run(&self, record: RunRecord) -> Result<(), StoreError>;
    async fn runs_by_user(&self, user_id: &str) -> Result<Vec<RunRecord>, StoreError>;
    async fn set_run_status(&self, run_id: &str, status: &str) -> Result<(), StoreError>;

    async fn append_event(&self, record: AgentEventRecord) -> Result<(), StoreError>;
    async fn events_by_run(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentEventRecord>, StoreError>;

    async fn put_key(&self, record: ProviderKeyRecord) -> Result<(), StoreError>;
    async fn keys_by_user(&self, user_id: &str) -> Result<Vec<ProviderKeyRecord>, StoreError>;
    async fn key_by_user_provider(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<ProviderKeyRecord>, StoreError>;
    async fn delete_key(&self, key_id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    sandboxes: HashMap<String, SandboxRecord>,
    runs: HashMap<String, RunRecord>,
    events: Vec<AgentEventRecord>,
    keys: HashMap<String, ProviderKeyRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn put_sandbox(&self, record: SandboxRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .sandboxes
            .insert(record.sandbox_id.clone(), record);
        Ok(())
    }

    async fn sandboxes_by_user(&self, user_id: &str) -> Result<Vec<SandboxRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut out: Vec<SandboxRecord> = tables
            .sandboxes
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(out)
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .sandboxes
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("sandbox {sandbox_id}")))
    }

    async fn put_run(&self, record: RunRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .runs
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn runs_by_user(&self, user_id: &str) -> Result<Vec<RunRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut out: Vec<RunRecord> = tables
            .runs
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        Ok(out)
    }

    async fn set_run_status(&self, run_id: &str, status: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let run = tables
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        run.status = status.to_string();
        Ok(())
    }

    async fn append_event(&self, record: AgentEventRecord) -> Result<(), StoreError> {
        self.tables.write().await.events.push(record);
        Ok(())
    }

    async fn events_by_run(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentEventRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn put_key(&self, record: ProviderKeyRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .keys
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn keys_by_user(&self, user_id: &str) -> Result<Vec<ProviderKeyRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut out: Vec<ProviderKeyRecord> = tables
            .keys
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(out)
    }

    async fn key_by_user_provider(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<ProviderKeyRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .keys
            .values()
            .find(|r| r.user_id == user_id && r.provider == provider)
            .cloned())
    }

    async fn delete_key(&self, key_id: &str) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .keys
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("key {key_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(user: &str, sandbox_id: &str) -> SandboxRecord {
        SandboxRecord {
            id: format!("rec-{sandbox_id}"),
            user_id: user.to_string(),
            provider: Provider::Docker,
            sandbox_id: sandbox_id.to_string(),
            name: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn sandbox_index_is_per_user() {
        let store = InMemoryStore::new();
        store.put_sandbox(sandbox("alice", "s1")).await.unwrap();
        store.put_sandbox(sandbox("bob", "s2")).await.unwrap();

        let mine = store.sandboxes_by_user("alice").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].sandbox_id, "s1");
    }

    #[tokio::test]
    async fn delete_missing_sandbox_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.delete_sandbox("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn key_lookup_by_user_and_provider() {
        let store = InMemoryStore::new();
        store
            .put_key(ProviderKeyRecord {
                id: "k1".into(),
                user_id: "alice".into(),
                provider: Provider::Modal,
                label: Some("work".into()),
                secret: "ak-123".into(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let hit = store
            .key_by_user_provider("alice", Provider::Modal)
            .await
            .unwrap();
        assert_eq!(hit.unwrap().id, "k1");
        let miss = store
            .key_by_user_provider("alice", Provider::E2b)
            .await
            .unwrap();
        assert!(miss.is_none());

        store.delete_key("k1").await.unwrap();
        assert!(store.keys_by_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_status_updates_in_place() {
        let store = InMemoryStore::new();
        store
            .put_run(RunRecord {
                id: "run-1".into(),
                user_id: "alice".into(),
                repo_url: "https://github.com/acme/app.git".into(),
                task: "do it".into(),
                providers: vec![Provider::Docker],
                status: "running".into(),
                started_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        store.set_run_status("run-1", "completed").await.unwrap();
        let runs = store.runs_by_user("alice").await.unwrap();
        assert_eq!(runs[0].status, "completed");
    }

    #[test]
    fn key_secret_never_serializes() {
        let record = ProviderKeyRecord {
            id: "k1".into(),
            user_id: "alice".into(),
            provider: Provider::Modal,
            label: None,
            secret: "ak-123".into(),
            created_at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("secret").is_none());
    }
}
