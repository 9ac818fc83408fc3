//! Status/event reporting
//!
//! Emits operator-visible events at every reconciliation decision point.
//! Consecutive identical messages for the same object increment a counter
//! on the existing record instead of producing a new one; the first
//! transition into or out of a distinct message text always produces a new
//! record and is forwarded to the event sink.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter as KubeReporter};
use kube::{Client, Resource, ResourceExt};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::crd::ResourceKey;
use crate::metrics::Metrics;
use crate::validation::ValidationErrors;

/// Build an event ObjectReference for a typed resource
pub fn object_ref<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        ..Default::default()
    }
}

/// The decision an event reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    AddedOrUpdated,
    NotApplied,
    Rejected,
    IgnoredRoute,
    IgnoredBy,
    Orphan,
}

impl EventKind {
    pub fn reason(&self) -> &'static str {
        match self {
            EventKind::AddedOrUpdated => "AddedOrUpdated",
            EventKind::NotApplied => "AddedOrUpdatedWithError",
            EventKind::Rejected => "Rejected",
            EventKind::IgnoredRoute => "IgnoredVirtualServerRoute",
            EventKind::IgnoredBy => "Ignored",
            EventKind::Orphan => "NoVirtualServersFound",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::AddedOrUpdated => EventType::Normal,
            _ => EventType::Warning,
        }
    }
}

/// One entry in the reporter's audit log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub object: String,
    pub reason: &'static str,
    pub message: String,
    pub count: u64,
}

/// An event published to a sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedEvent {
    pub object: String,
    pub reason: String,
    pub message: String,
    pub warning: bool,
}

/// Destination for first-occurrence events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, object: &ObjectReference, kind: EventKind, message: &str);
}

/// Publishes Kubernetes Events attached to the originating object
pub struct KubeEventSink {
    client: Client,
    reporter: KubeReporter,
}

impl KubeEventSink {
    pub fn new(client: Client, reporter: KubeReporter) -> Self {
        Self { client, reporter }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, object: &ObjectReference, kind: EventKind, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let result = recorder
            .publish(Event {
                type_: kind.event_type(),
                reason: kind.reason().to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to publish event");
        }
    }
}

/// Collects published events in memory, for tests
#[derive(Default)]
pub struct RecordingSink {
    events: RwLock<Vec<PublishedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PublishedEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, object: &ObjectReference, kind: EventKind, message: &str) {
        self.events.write().await.push(PublishedEvent {
            object: format!(
                "{}/{}",
                object.namespace.as_deref().unwrap_or_default(),
                object.name.as_deref().unwrap_or_default()
            ),
            reason: kind.reason().to_string(),
            message: message.to_string(),
            warning: matches!(kind.event_type(), EventType::Warning),
        });
    }
}

struct ReporterState {
    records: Vec<EventRecord>,
    /// index of the latest record per object
    last: HashMap<String, usize>,
}

/// De-duplicating event reporter
pub struct EventReporter {
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    state: Mutex<ReporterState>,
}

impl EventReporter {
    pub fn new(sink: Arc<dyn EventSink>, metrics: Arc<Metrics>) -> Self {
        Self {
            sink,
            metrics,
            state: Mutex::new(ReporterState {
                records: Vec::new(),
                last: HashMap::new(),
            }),
        }
    }

    /// The in-process audit log, including dedup counters
    pub async fn records(&self) -> Vec<EventRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn report(&self, object: &ObjectReference, kind: EventKind, message: String) {
        let object_key = format!(
            "{}/{}",
            object.namespace.as_deref().unwrap_or_default(),
            object.name.as_deref().unwrap_or_default()
        );

        self.metrics.record_event(kind.reason());

        {
            let mut state = self.state.lock().await;
            if let Some(&idx) = state.last.get(&object_key) {
                if state.records[idx].message == message {
                    state.records[idx].count += 1;
                    return;
                }
            }
            let idx = state.records.len();
            state.records.push(EventRecord {
                object: object_key.clone(),
                reason: kind.reason(),
                message: message.clone(),
                count: 1,
            });
            state.last.insert(object_key, idx);
        }

        self.sink.publish(object, kind, &message).await;
    }

    // ------------------------------------------------------------------
    // Message literals
    // ------------------------------------------------------------------

    pub async fn added_or_updated(&self, object: &ObjectReference, key: &ResourceKey) {
        self.report(
            object,
            EventKind::AddedOrUpdated,
            format!("Configuration for {} was added or updated", key),
        )
        .await;
    }

    pub async fn not_applied(&self, object: &ObjectReference, key: &ResourceKey, reason: &str) {
        self.report(
            object,
            EventKind::NotApplied,
            format!(
                "Configuration for {} was updated but was not applied: {}",
                key, reason
            ),
        )
        .await;
    }

    pub async fn rejected(
        &self,
        object: &ObjectReference,
        kind: &str,
        key: &ResourceKey,
        errors: &ValidationErrors,
    ) {
        self.report(
            object,
            EventKind::Rejected,
            format!("{} {} is invalid and was rejected: {}", kind, key, errors),
        )
        .await;
    }

    pub async fn orphan_route(&self, object: &ObjectReference, key: &ResourceKey) {
        self.report(
            object,
            EventKind::Orphan,
            format!("No VirtualServer references VirtualServerRoute {}", key),
        )
        .await;
    }

    pub async fn ignored_route(
        &self,
        vs_object: &ObjectReference,
        route_key: &ResourceKey,
        reason: &str,
    ) {
        self.report(
            vs_object,
            EventKind::IgnoredRoute,
            format!("Ignored VirtualServerRoute {}: {}", route_key, reason),
        )
        .await;
    }

    pub async fn ignored_by(&self, route_object: &ObjectReference, vs_key: &ResourceKey) {
        self.report(
            route_object,
            EventKind::IgnoredBy,
            format!("Ignored by VirtualServer {}", vs_key),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ref(name: &str) -> ObjectReference {
        ObjectReference {
            kind: Some("VirtualServer".to_string()),
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    fn reporter() -> (Arc<RecordingSink>, EventReporter) {
        let sink = Arc::new(RecordingSink::new());
        let reporter = EventReporter::new(sink.clone(), Arc::new(Metrics::new()));
        (sink, reporter)
    }

    #[tokio::test]
    async fn test_message_literals() {
        let (sink, reporter) = reporter();
        let key = ResourceKey::new("default", "cafe");
        let route_key = ResourceKey::new("default", "tea-route");

        reporter.added_or_updated(&test_ref("cafe"), &key).await;
        reporter
            .orphan_route(&test_ref("tea-route"), &route_key)
            .await;
        reporter
            .ignored_route(&test_ref("cafe"), &route_key, "spec.host: required value")
            .await;
        reporter.ignored_by(&test_ref("tea-route"), &key).await;

        let events = sink.events().await;
        assert_eq!(
            events[0].message,
            "Configuration for default/cafe was added or updated"
        );
        assert_eq!(
            events[1].message,
            "No VirtualServer references VirtualServerRoute default/tea-route"
        );
        assert_eq!(
            events[2].message,
            "Ignored VirtualServerRoute default/tea-route: spec.host: required value"
        );
        assert_eq!(events[3].message, "Ignored by VirtualServer default/cafe");
        assert!(!events[0].warning);
        assert!(events[1].warning);
    }

    #[tokio::test]
    async fn test_consecutive_duplicates_increment_counter() {
        let (sink, reporter) = reporter();
        let key = ResourceKey::new("default", "cafe");

        for _ in 0..3 {
            reporter.added_or_updated(&test_ref("cafe"), &key).await;
        }

        let records = reporter.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 3);
        // the sink saw the first occurrence only
        assert_eq!(sink.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_text_transition_starts_new_record() {
        let (sink, reporter) = reporter();
        let key = ResourceKey::new("default", "cafe");

        reporter.added_or_updated(&test_ref("cafe"), &key).await;
        reporter
            .not_applied(&test_ref("cafe"), &key, "reload failed")
            .await;
        reporter.added_or_updated(&test_ref("cafe"), &key).await;

        let records = reporter.records().await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.count == 1));
        assert_eq!(sink.events().await.len(), 3);
    }

    #[tokio::test]
    async fn test_dedup_is_per_object() {
        let (_, reporter) = reporter();
        let cafe = ResourceKey::new("default", "cafe");
        let bar = ResourceKey::new("default", "bar");

        reporter.added_or_updated(&test_ref("cafe"), &cafe).await;
        reporter.added_or_updated(&test_ref("bar"), &bar).await;
        reporter.added_or_updated(&test_ref("cafe"), &cafe).await;

        let records = reporter.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].count, 2);
        assert_eq!(records[1].count, 1);
    }
}
