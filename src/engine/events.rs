//! Engine lifecycle events and their fan-out bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Per-subscriber buffer depth. A subscriber that trails further behind
/// loses the oldest events and sees a `lagged` marker.
const EVENT_BUFFER: usize = 256;

/// Lifecycle transitions broadcast by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineEventKind {
    EngineStarted,
    EngineStopping,
    EngineStopped,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobTimedOut,
    JobSkipped,
    SchedulerTick,
}

/// One broadcast record. Consumers (CLI, gateway) serialize this as-is.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub kind: EngineEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EngineEvent {
    pub fn new(kind: EngineEventKind) -> Self {
        Self {
            kind,
            job_name: None,
            run_id: None,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn for_job(kind: EngineEventKind, job_name: &str) -> Self {
        let mut event = Self::new(kind);
        event.job_name = Some(job_name.to_string());
        event
    }

    pub fn for_run(kind: EngineEventKind, job_name: &str, run_id: i64) -> Self {
        let mut event = Self::for_job(kind, job_name);
        event.run_id = Some(run_id);
        event
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Fan-out bus owned by the engine host. Publishing never blocks: each
/// subscriber owns a bounded buffer, and a slow subscriber only hurts
/// itself.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            lagged: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the stream, in emission order.
pub struct EventStream {
    rx: broadcast::Receiver<EngineEvent>,
    lagged: bool,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone. After a buffer overflow
    /// the next delivered event carries a `"lagged"` detail marker.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(mut event) => {
                    if self.lagged {
                        self.lagged = false;
                        event.detail = Some(match event.detail {
                            Some(existing) => format!("lagged; {existing}"),
                            None => "lagged".to_string(),
                        });
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => self.lagged = true,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        bus.publish(EngineEvent::new(EngineEventKind::EngineStarted));
        bus.publish(EngineEvent::for_run(EngineEventKind::JobStarted, "job", 1));
        bus.publish(EngineEvent::for_run(EngineEventKind::JobCompleted, "job", 1));

        assert_eq!(
            stream.recv().await.unwrap().kind,
            EngineEventKind::EngineStarted
        );
        let started = stream.recv().await.unwrap();
        assert_eq!(started.kind, EngineEventKind::JobStarted);
        assert_eq!(started.job_name.as_deref(), Some("job"));
        assert_eq!(started.run_id, Some(1));
        assert_eq!(
            stream.recv().await.unwrap().kind,
            EngineEventKind::JobCompleted
        );
    }

    #[tokio::test]
    async fn stream_ends_when_bus_is_dropped() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lagged_marker_not_a_stall() {
        let bus = EventBus::with_capacity(2);
        let mut stream = bus.subscribe();

        for i in 0..5 {
            bus.publish(
                EngineEvent::new(EngineEventKind::SchedulerTick).with_detail(format!("tick {i}")),
            );
        }

        // Oldest ticks were dropped; the first delivered event is marked.
        let first = stream.recv().await.unwrap();
        let detail = first.detail.unwrap();
        assert!(detail.starts_with("lagged"), "got: {detail}");

        let second = stream.recv().await.unwrap();
        assert_eq!(second.detail.as_deref(), Some("tick 4"));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::new(EngineEventKind::EngineStopped));
    }

    #[test]
    fn events_serialize_without_empty_fields() {
        let event = EngineEvent::new(EngineEventKind::EngineStarted);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "EngineStarted");
        assert!(json.get("job_name").is_none());
        assert!(json.get("run_id").is_none());
    }
}
