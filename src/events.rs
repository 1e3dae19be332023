//! Per-session ordered event feed.
//!
//! Events are appended while the owning session's mutex is held, so the
//! backlog order matches the order state transitions were committed.
//! Subscribers get the full backlog plus a live receiver; transitions
//! committed before the subscription are never lost.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionCreated,
    SessionStarted,
    SessionCompleted,
    SessionFailed,
    SessionAborted,
    PhaseStarted,
    PhaseCompleted,
    AgentDispatched,
    AgentCompleted,
    AgentFailed,
    OperationWarned,
    OperationDenied,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionStarted => "session.started",
            Self::SessionCompleted => "session.completed",
            Self::SessionFailed => "session.failed",
            Self::SessionAborted => "session.aborted",
            Self::PhaseStarted => "phase.started",
            Self::PhaseCompleted => "phase.completed",
            Self::AgentDispatched => "agent.dispatched",
            Self::AgentCompleted => "agent.completed",
            Self::AgentFailed => "agent.failed",
            Self::OperationWarned => "operation.warned",
            Self::OperationDenied => "operation.denied",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::SessionFailed | Self::SessionAborted | Self::AgentFailed | Self::OperationDenied
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_type: EventType,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(event_type: EventType, session_id: impl Into<String>) -> Self {
        Self {
            event_type,
            session_id: session_id.into(),
            agent_id: None,
            phase: None,
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_phase(mut self, phase: usize) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Append-only log with a live broadcast tail, one per session.
#[derive(Debug)]
pub struct EventLog {
    backlog: Mutex<Vec<SessionEvent>>,
    live: broadcast::Sender<SessionEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backlog: Mutex::new(Vec::new()),
            live,
        }
    }

    /// Record an event. Backlog append and broadcast happen under one
    /// lock so subscribers never observe reordering.
    pub fn emit(&self, event: SessionEvent) {
        let mut backlog = self.backlog.lock();
        backlog.push(event.clone());
        // No receivers is fine; the backlog still has the event.
        let _ = self.live.send(event);
    }

    /// Everything committed so far, plus a receiver for what follows.
    pub fn subscribe(&self) -> (Vec<SessionEvent>, broadcast::Receiver<SessionEvent>) {
        let backlog = self.backlog.lock();
        (backlog.clone(), self.live.subscribe())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_preserves_commit_order() {
        let log = EventLog::new();
        log.emit(SessionEvent::new(EventType::SessionCreated, "s1"));
        log.emit(SessionEvent::new(EventType::SessionStarted, "s1"));
        log.emit(SessionEvent::new(EventType::AgentDispatched, "s1").with_phase(0));

        let (backlog, _rx) = log.subscribe();
        let kinds: Vec<_> = backlog.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::SessionCreated,
                EventType::SessionStarted,
                EventType::AgentDispatched
            ]
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(EventType::AgentFailed.is_error());
        assert!(EventType::OperationDenied.is_error());
        assert!(!EventType::AgentCompleted.is_error());
        assert!(!EventType::OperationWarned.is_error());
    }

    #[tokio::test]
    async fn test_subscriber_sees_live_events() {
        let log = EventLog::new();
        log.emit(SessionEvent::new(EventType::SessionCreated, "s1"));

        let (backlog, mut rx) = log.subscribe();
        assert_eq!(backlog.len(), 1);

        log.emit(SessionEvent::new(EventType::SessionStarted, "s1"));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.event_type, EventType::SessionStarted);
    }
}
