//! Publishes events for objects
use std::sync::Arc;

use k8s_openapi::{
    api::{core::v1::ObjectReference, events::v1::Event},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
    chrono::Utc,
};
use kiln_client::Api;

/// Required information to publish a new event via [`Recorder::publish`].
#[derive(Clone, Debug)]
pub struct NewEvent {
    /// The action that was taken (either successfully or unsuccessfully) against
    /// the referenced object.
    ///
    /// `action` must be machine-readable.
    pub action: String,
    /// The reason explaining why the `action` was taken.
    ///
    /// `reason` must be human-readable.
    pub reason: String,
    /// A optional description of the status of the `action`.
    pub note: Option<String>,
    /// The event severity.
    pub event_type: EventType,
    /// Another object affected by the action, mapped to `related`.
    pub secondary: Option<ObjectReference>,
}

impl NewEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self::new(EventType::Normal, reason.into(), note.into())
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self::new(EventType::Warning, reason.into(), note.into())
    }

    fn new(event_type: EventType, reason: String, note: String) -> Self {
        Self {
            action: reason.clone(),
            reason,
            note: Some(note),
            event_type,
            secondary: None,
        }
    }
}

/// The event severity or type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    /// An event took place - nothing to worry about.
    Normal,
    /// Something is not working as expected - it might be worth to have a look.
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Details about the event emitter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reporter {
    /// The name of the controller publishing the event, mapped to `reportingController`.
    pub controller: String,
    /// The name of the controller instance, mapped to `reportingInstance`.
    pub instance: String,
}

impl From<&str> for Reporter {
    fn from(controller: &str) -> Self {
        Self {
            controller: controller.into(),
            instance: controller.into(),
        }
    }
}

/// A publisher of `events.k8s.io/v1` events
///
/// Unlike a per-object recorder, the regarding object is passed on every publish so a
/// single recorder can be shared by all workers.
#[derive(Clone)]
pub struct Recorder {
    events: Arc<dyn Api<Event>>,
    reporter: Reporter,
}

impl Recorder {
    #[must_use]
    pub fn new(events: Arc<dyn Api<Event>>, reporter: Reporter) -> Self {
        Self { events, reporter }
    }

    /// Publish a new event regarding `reference`.
    ///
    /// The event is created in the namespace of `reference`.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`](`kiln_client::Error`) if the event is rejected.
    pub async fn publish(&self, reference: &ObjectReference, ev: NewEvent) -> Result<(), kiln_client::Error> {
        let namespace = reference.namespace.clone();
        let event = Event {
            action: Some(ev.action),
            reason: Some(ev.reason),
            deprecated_count: None,
            deprecated_first_timestamp: None,
            deprecated_last_timestamp: None,
            deprecated_source: None,
            event_time: Some(MicroTime(Utc::now())),
            regarding: Some(reference.clone()),
            note: ev.note,
            metadata: ObjectMeta {
                namespace: namespace.clone(),
                generate_name: Some(format!("{}-", self.reporter.controller)),
                ..Default::default()
            },
            reporting_controller: Some(self.reporter.controller.clone()),
            reporting_instance: Some(self.reporter.instance.clone()),
            series: None,
            type_: Some(ev.event_type.as_str().into()),
            related: ev.secondary,
        };
        self.events
            .create(namespace.as_deref().unwrap_or("default"), &event)
            .await?;
        Ok(())
    }
}
