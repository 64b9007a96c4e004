// apiflow — Execution event pub/sub
//
// Listeners run synchronously on the engine task. A listener that returns an
// error or panics is logged and skipped; it never reaches the engine loop.

use super::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "execution:started")]
    Started,
    #[serde(rename = "execution:step-started")]
    StepStarted,
    #[serde(rename = "execution:step-completed")]
    StepCompleted,
    #[serde(rename = "execution:step-failed")]
    StepFailed,
    #[serde(rename = "execution:paused")]
    Paused,
    #[serde(rename = "execution:resumed")]
    Resumed,
    #[serde(rename = "execution:completed")]
    Completed,
    #[serde(rename = "execution:failed")]
    Failed,
    #[serde(rename = "execution:cancelled")]
    Cancelled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Started => "execution:started",
            EventKind::StepStarted => "execution:step-started",
            EventKind::StepCompleted => "execution:step-completed",
            EventKind::StepFailed => "execution:step-failed",
            EventKind::Paused => "execution:paused",
            EventKind::Resumed => "execution:resumed",
            EventKind::Completed => "execution:completed",
            EventKind::Failed => "execution:failed",
            EventKind::Cancelled => "execution:cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub kind: EventKind,
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Extra data, e.g. the step record for step events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

pub type Listener = Arc<dyn Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut removed = false;
        for listeners in inner.by_kind.values_mut() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .read()
            .map(|inner| inner.by_kind.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn emit(&self, event: &ExecutionEvent) {
        // Snapshot so listeners may subscribe/unsubscribe without deadlocking.
        let listeners: Vec<Listener> = match self.inner.read() {
            Ok(inner) => inner
                .by_kind
                .get(&event.kind)
                .map(|l| l.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        tracing::debug!(
            event = %event.kind,
            execution_id = %event.execution_id,
            listeners = listeners.len(),
            "Emitting event"
        );

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(event = %event.kind, "Event listener failed: {}", e);
                }
                Err(_) => {
                    tracing::error!(event = %event.kind, "Event listener panicked");
                }
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .inner
            .read()
            .map(|inner| inner.by_kind.values().map(Vec::len).sum::<usize>())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}
