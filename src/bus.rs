//! Per-run event log and fan-out.
//!
//! Every run owns one [`EventBus`]: an append-only log of [`AgentEvent`]s
//! plus a broadcast channel. Subscribers replay the log from sequence zero
//! and then switch to live delivery without gaps or duplicates. A
//! subscriber that cannot keep up is dropped on broadcast lag; the run
//! never blocks on one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::Provider;

/// Default interval between keep-alive pings when no events flow.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Event categories multiplexed onto a run's bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventType {
    Status,
    CloneProgress,
    InstallProgress,
    Thought,
    ToolCall,
    ToolResult,
    Output,
    Error,
    Complete,
    OpencodeReady,
    RalphIteration,
    RalphComplete,
}

impl AgentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentEventType::Status => "status",
            AgentEventType::CloneProgress => "clone_progress",
            AgentEventType::InstallProgress => "install_progress",
            AgentEventType::Thought => "thought",
            AgentEventType::ToolCall => "tool_call",
            AgentEventType::ToolResult => "tool_result",
            AgentEventType::Output => "output",
            AgentEventType::Error => "error",
            AgentEventType::Complete => "complete",
            AgentEventType::OpencodeReady => "opencode_ready",
            AgentEventType::RalphIteration => "ralph_iteration",
            AgentEventType::RalphComplete => "ralph_complete",
        }
    }

    /// Parse an upstream agent event name. Unknown names are carried as
    /// plain output so nothing from the agent stream is lost.
    pub fn parse(name: &str) -> AgentEventType {
        match name {
            "status" => AgentEventType::Status,
            "clone_progress" => AgentEventType::CloneProgress,
            "install_progress" => AgentEventType::InstallProgress,
            "thought" => AgentEventType::Thought,
            "tool_call" => AgentEventType::ToolCall,
            "tool_result" => AgentEventType::ToolResult,
            "error" => AgentEventType::Error,
            "complete" => AgentEventType::Complete,
            "opencode_ready" => AgentEventType::OpencodeReady,
            "ralph_iteration" => AgentEventType::RalphIteration,
            "ralph_complete" => AgentEventType::RalphComplete,
            _ => AgentEventType::Output,
        }
    }
}

/// One event in a run's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Unique within the run.
    pub id: String,
    /// Strictly increasing per run.
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: AgentEventType,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// Which provider lane produced this, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    pub data: serde_json::Value,
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum BusFrame {
    Event(Arc<AgentEvent>),
    /// Emitted when no events flowed for the keep-alive interval.
    Ping,
    /// Terminal frame; the stream ends after this.
    Closed,
}

struct Inner {
    log: Vec<Arc<AgentEvent>>,
    next_seq: u64,
    closed: bool,
}

pub struct EventBus {
    inner: Mutex<Inner>,
    tx: broadcast::Sender<Arc<AgentEvent>>,
    keepalive: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_tuning(256, KEEPALIVE_INTERVAL)
    }

    /// Capacity bounds how far a live subscriber may fall behind before it
    /// is dropped.
    pub fn with_tuning(capacity: usize, keepalive: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Mutex::new(Inner {
                log: Vec::new(),
                next_seq: 0,
                closed: false,
            }),
            tx,
            keepalive,
        }
    }

    /// Append an event and fan it out. Returns the stored event.
    pub fn publish(
        &self,
        event_type: AgentEventType,
        provider: Option<Provider>,
        data: serde_json::Value,
    ) -> Arc<AgentEvent> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = Arc::new(AgentEvent {
            id: format!("evt-{seq}"),
            seq,
            event_type,
            timestamp: chrono::Utc::now().timestamp_millis(),
            provider,
            data,
        });
        inner.log.push(event.clone());
        // Send failures just mean nobody is listening right now.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Mark the run terminal. Subscribers see everything up to this point
    /// and then a clean close.
    pub fn close(&self) {
        self.inner.lock().expect("bus lock poisoned").closed = true;
        // Wake blocked subscribers so they observe the closed flag.
        let _ = self.tx.send(Arc::new(AgentEvent {
            id: "evt-close".to_string(),
            seq: u64::MAX,
            event_type: AgentEventType::Complete,
            timestamp: chrono::Utc::now().timestamp_millis(),
            provider: None,
            data: serde_json::Value::Null,
        }));
    }

    /// Snapshot of the log so far.
    pub fn events(&self) -> Vec<Arc<AgentEvent>> {
        self.inner.lock().expect("bus lock poisoned").log.clone()
    }

    /// Replay the full log, then deliver live events until the run closes.
    ///
    /// Sequence numbers are strictly increasing with no gaps or duplicates
    /// across the replay/live boundary. Pings are interleaved when the bus
    /// is idle.
    pub fn subscribe(&self) -> impl Stream<Item = BusFrame> + Send {
        let (snapshot, closed, mut rx) = {
            // Taking the receiver under the same lock as the snapshot makes
            // the replay/live hand-off seamless.
            let inner = self.inner.lock().expect("bus lock poisoned");
            (inner.log.clone(), inner.closed, self.tx.subscribe())
        };
        let keepalive = self.keepalive;

        async_stream::stream! {
            let mut last_seq: Option<u64> = None;
            for event in snapshot {
                last_seq = Some(event.seq);
                yield BusFrame::Event(event);
            }
            if closed {
                yield BusFrame::Closed;
                return;
            }
            loop {
                match tokio::time::timeout(keepalive, rx.recv()).await {
                    Ok(Ok(event)) => {
                        if event.seq == u64::MAX {
                            // close() sentinel
                            yield BusFrame::Closed;
                            return;
                        }
                        if last_seq.is_some_and(|s| event.seq <= s) {
                            continue;
                        }
                        last_seq = Some(event.seq);
                        yield BusFrame::Event(event);
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        // Slow subscriber: drop it rather than stall the run.
                        tracing::warn!(skipped, "dropping lagged event bus subscriber");
                        yield BusFrame::Closed;
                        return;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        yield BusFrame::Closed;
                        return;
                    }
                    Err(_) => {
                        yield BusFrame::Ping;
                    }
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn replay_then_live_without_gaps_or_duplicates() {
        let bus = Arc::new(EventBus::new());
        for i in 0..3 {
            bus.publish(AgentEventType::Status, None, json!({"i": i}));
        }

        let mut stream = Box::pin(bus.subscribe());
        let mut seqs = Vec::new();
        for _ in 0..3 {
            match stream.next().await.unwrap() {
                BusFrame::Event(e) => seqs.push(e.seq),
                other => panic!("expected replayed event, got {other:?}"),
            }
        }

        bus.publish(AgentEventType::Output, Some(Provider::Docker), json!("live"));
        bus.publish(AgentEventType::Complete, None, json!({}));
        for _ in 0..2 {
            match stream.next().await.unwrap() {
                BusFrame::Event(e) => seqs.push(e.seq),
                other => panic!("expected live event, got {other:?}"),
            }
        }

        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        let unique: std::collections::HashSet<_> = seqs.iter().collect();
        assert_eq!(unique.len(), seqs.len());
    }

    #[tokio::test]
    async fn subscribe_after_close_replays_and_ends() {
        let bus = EventBus::new();
        bus.publish(AgentEventType::Status, None, json!({"m": "a"}));
        bus.publish(AgentEventType::Complete, None, json!({"status": "completed"}));
        bus.close();

        let frames: Vec<BusFrame> = bus.subscribe().collect().await;
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], BusFrame::Event(ref e) if e.seq == 0));
        assert!(matches!(frames[1], BusFrame::Event(ref e) if e.seq == 1));
        assert!(matches!(frames[2], BusFrame::Closed));
    }

    #[tokio::test]
    async fn idle_bus_pings() {
        let bus = EventBus::with_tuning(16, Duration::from_millis(30));
        let mut stream = Box::pin(bus.subscribe());
        match stream.next().await.unwrap() {
            BusFrame::Ping => {}
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_is_dropped() {
        let bus = EventBus::with_tuning(4, Duration::from_secs(5));
        let mut stream = Box::pin(bus.subscribe());
        // Overflow the live channel while the subscriber sleeps.
        for i in 0..32 {
            bus.publish(AgentEventType::Output, None, json!({"i": i}));
        }
        // The first poll observes the lag and closes.
        match stream.next().await.unwrap() {
            BusFrame::Closed => {}
            BusFrame::Event(_) => {
                // Depending on timing a few events may arrive first, but the
                // stream must still terminate with a close.
                let rest: Vec<BusFrame> = stream.collect().await;
                assert!(matches!(rest.last(), Some(BusFrame::Closed)));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_ids_are_unique_per_run() {
        let bus = EventBus::new();
        let a = bus.publish(AgentEventType::Status, None, json!({}));
        let b = bus.publish(AgentEventType::Status, None, json!({}));
        assert_ne!(a.id, b.id);
        assert!(a.timestamp <= b.timestamp);
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&AgentEventType::RalphComplete).unwrap();
        assert_eq!(json, "\"ralph_complete\"");
        assert_eq!(AgentEventType::parse("clone_progress"), AgentEventType::CloneProgress);
        assert_eq!(AgentEventType::parse("mystery"), AgentEventType::Output);
    }
}
