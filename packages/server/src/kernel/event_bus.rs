//! Live event bus: per-(organization, project) pub/sub for log and job
//! progress events.
//!
//! Workers publish; WebSocket connections subscribe. Every publish is also
//! mirrored to the cross-instance broker on subject `ws.<org>.<project>` so
//! subscribers connected to another instance see the same stream. Mirrored
//! messages carry the origin instance id and are delivered locally only,
//! never re-published, which keeps two instances from ping-ponging events.
//!
//! Delivery is in publish order per topic; there is no ordering across
//! topics.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::common::redact_fields;
use crate::kernel::jobs::{JobStatus, JobType};
use crate::kernel::nats::NatsPublisher;

/// Bus topics are (organization, project) pairs.
pub type Topic = (Uuid, Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogModule {
    Stream,
    Db,
    Worker,
    Api,
}

/// Ephemeral log record; exists only on the bus, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub module: LogModule,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fields: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: i32,
    pub processed_items: i64,
    pub total_items: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    pub project_id: Uuid,
    pub total: i64,
    pub indexed: i64,
    pub pending: i64,
    pub error: i64,
}

/// An event on the live bus, tagged the way the WebSocket surface frames it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum LiveEvent {
    #[serde(rename = "LOG")]
    Log(LogEvent),
    #[serde(rename = "JOB_UPDATE")]
    JobUpdate(JobUpdate),
    #[serde(rename = "STATS_UPDATE")]
    StatsUpdate(StatsUpdate),
}

impl LiveEvent {
    /// Terminal job updates must reach subscribers even under back-pressure.
    pub fn is_terminal_job_update(&self) -> bool {
        match self {
            LiveEvent::JobUpdate(update) => update.status.is_terminal(),
            _ => false,
        }
    }
}

/// Envelope for cross-instance mirroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    origin: Uuid,
    organization_id: Uuid,
    project_id: Uuid,
    event: LiveEvent,
}

struct BusInner {
    channels: RwLock<HashMap<Topic, broadcast::Sender<LiveEvent>>>,
    capacity: usize,
    instance_id: Uuid,
    nats: Arc<dyn NatsPublisher>,
}

/// Thread-safe, cloneable pub/sub hub keyed by (organization, project).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Default per-topic buffer of 256 events.
    pub fn new(nats: Arc<dyn NatsPublisher>) -> Self {
        Self::with_capacity(nats, 256)
    }

    pub fn with_capacity(nats: Arc<dyn NatsPublisher>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: RwLock::new(HashMap::new()),
                capacity,
                instance_id: Uuid::new_v4(),
                nats,
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Broker subject for a topic.
    pub fn subject(organization_id: Uuid, project_id: Uuid) -> String {
        format!("ws.{}.{}", organization_id, project_id)
    }

    /// Subscribe to a topic. Creates the channel if it doesn't exist.
    pub async fn subscribe(
        &self,
        organization_id: Uuid,
        project_id: Uuid,
    ) -> broadcast::Receiver<LiveEvent> {
        let mut channels = self.inner.channels.write().await;
        let tx = channels
            .entry((organization_id, project_id))
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0);
        tx.subscribe()
    }

    /// Publish to local subscribers and mirror to the cross-instance broker.
    pub async fn publish(&self, organization_id: Uuid, project_id: Uuid, event: LiveEvent) {
        self.deliver_local(organization_id, project_id, event.clone())
            .await;

        let envelope = WireEnvelope {
            origin: self.inner.instance_id,
            organization_id,
            project_id,
            event,
        };
        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                let subject = Self::subject(organization_id, project_id);
                if let Err(e) = self.inner.nats.publish(subject, Bytes::from(payload)).await {
                    warn!(error = %e, "failed to mirror event to broker");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize event envelope"),
        }
    }

    /// Deliver to local subscribers only. Used for events received from the
    /// broker so they are never re-published.
    pub async fn deliver_local(&self, organization_id: Uuid, project_id: Uuid, event: LiveEvent) {
        let channels = self.inner.channels.read().await;
        if let Some(tx) = channels.get(&(organization_id, project_id)) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(event);
        }
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.inner.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    #[cfg(test)]
    async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }
}

/// Consume the broker mirror and deliver other instances' events locally.
///
/// Runs until the subscription ends; spawn it alongside the server.
pub async fn run_mirror(bus: EventBus, client: async_nats::Client) -> anyhow::Result<()> {
    let mut subscription = client.subscribe("ws.>").await?;

    while let Some(message) = subscription.next().await {
        match serde_json::from_slice::<WireEnvelope>(&message.payload) {
            Ok(envelope) if envelope.origin != bus.instance_id() => {
                bus.deliver_local(
                    envelope.organization_id,
                    envelope.project_id,
                    envelope.event,
                )
                .await;
            }
            // Our own publish echoed back; local delivery already happened.
            Ok(_) => {}
            Err(e) => warn!(error = %e, "ignoring malformed broker event"),
        }
    }

    Ok(())
}

/// Structured logger bound to a bus topic.
///
/// Every record goes to tracing and, with its fields redacted, to the live
/// bus as a LOG event.
#[derive(Clone)]
pub struct EventLogger {
    bus: EventBus,
    organization_id: Uuid,
    project_id: Uuid,
    job_id: Option<Uuid>,
    module: LogModule,
}

impl EventLogger {
    pub fn new(
        bus: EventBus,
        organization_id: Uuid,
        project_id: Uuid,
        job_id: Option<Uuid>,
        module: LogModule,
    ) -> Self {
        Self {
            bus,
            organization_id,
            project_id,
            job_id,
            module,
        }
    }

    pub fn with_module(&self, module: LogModule) -> Self {
        Self {
            module,
            ..self.clone()
        }
    }

    pub async fn info(&self, message: impl Into<String>, fields: Value) {
        self.emit(LogLevel::Info, message.into(), fields).await;
    }

    pub async fn warn(&self, message: impl Into<String>, fields: Value) {
        self.emit(LogLevel::Warn, message.into(), fields).await;
    }

    pub async fn error(&self, message: impl Into<String>, fields: Value) {
        self.emit(LogLevel::Error, message.into(), fields).await;
    }

    pub async fn success(&self, message: impl Into<String>, fields: Value) {
        self.emit(LogLevel::Success, message.into(), fields).await;
    }

    async fn emit(&self, level: LogLevel, message: String, mut fields: Value) {
        redact_fields(&mut fields);

        match level {
            LogLevel::Warn => {
                warn!(module = ?self.module, job_id = ?self.job_id, fields = %fields, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(module = ?self.module, job_id = ?self.job_id, fields = %fields, "{message}")
            }
            _ => {
                tracing::info!(module = ?self.module, job_id = ?self.job_id, fields = %fields, "{message}")
            }
        }

        let event = LiveEvent::Log(LogEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            module: self.module,
            message,
            job_id: self.job_id,
            project_id: Some(self.project_id),
            fields,
        });
        self.bus
            .publish(self.organization_id, self.project_id, event)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::nats::TestNats;
    use serde_json::json;

    fn bus_with_capture() -> (EventBus, Arc<TestNats>) {
        let nats = Arc::new(TestNats::new());
        (EventBus::new(nats.clone()), nats)
    }

    fn log_event(message: &str) -> LiveEvent {
        LiveEvent::Log(LogEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level: LogLevel::Info,
            module: LogModule::Worker,
            message: message.to_string(),
            job_id: None,
            project_id: None,
            fields: Value::Null,
        })
    }

    #[tokio::test]
    async fn publish_reaches_local_subscriber() {
        let (bus, _) = bus_with_capture();
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(org, project).await;

        bus.publish(org, project, log_event("hello")).await;

        match rx.recv().await.unwrap() {
            LiveEvent::Log(log) => assert_eq!(log.message, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_mirrors_to_broker_subject() {
        let (bus, nats) = bus_with_capture();
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();

        bus.publish(org, project, log_event("mirrored")).await;

        let subject = EventBus::subject(org, project);
        assert_eq!(nats.messages_for_subject(&subject).len(), 1);
    }

    #[tokio::test]
    async fn deliver_local_does_not_mirror() {
        let (bus, nats) = bus_with_capture();
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();

        bus.deliver_local(org, project, log_event("local only")).await;

        assert_eq!(nats.publish_count(), 0);
    }

    #[tokio::test]
    async fn events_are_delivered_in_publish_order() {
        let (bus, _) = bus_with_capture();
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(org, project).await;

        for i in 0..10 {
            bus.publish(org, project, log_event(&format!("event-{i}"))).await;
        }

        for i in 0..10 {
            match rx.recv().await.unwrap() {
                LiveEvent::Log(log) => assert_eq!(log.message, format!("event-{i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let (bus, _) = bus_with_capture();
        let org = Uuid::new_v4();
        let mut rx_a = bus.subscribe(org, Uuid::new_v4()).await;
        let project_b = Uuid::new_v4();
        bus.subscribe(org, project_b).await;

        bus.publish(org, project_b, log_event("for b")).await;

        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_empty_channels() {
        let (bus, _) = bus_with_capture();
        let rx = bus.subscribe(Uuid::new_v4(), Uuid::new_v4()).await;
        assert_eq!(bus.channel_count().await, 1);

        drop(rx);
        bus.cleanup().await;
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn logger_redacts_secret_fields() {
        let (bus, _) = bus_with_capture();
        let org = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut rx = bus.subscribe(org, project).await;

        let logger = EventLogger::new(bus.clone(), org, project, None, LogModule::Api);
        logger
            .info("submitting", json!({"apiKey": "sk-secret", "count": 3}))
            .await;

        match rx.recv().await.unwrap() {
            LiveEvent::Log(log) => {
                assert_eq!(log.fields["apiKey"], "[REDACTED]");
                assert_eq!(log.fields["count"], 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn wire_format_is_type_plus_payload() {
        let event = LiveEvent::StatsUpdate(StatsUpdate {
            project_id: Uuid::new_v4(),
            total: 10,
            indexed: 4,
            pending: 5,
            error: 1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "STATS_UPDATE");
        assert_eq!(json["payload"]["total"], 10);
    }
}
