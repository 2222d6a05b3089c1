//! Kubernetes events emitted by the controller.
//!
//! Events are fire-and-forget, a failed publish is logged and never fails
//! a reconciliation.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Client, Resource};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use log::warn;

/// Value of `reportingController` on published events.
pub(crate) const REPORTER: &'static str = "rustrial-alb-controller";

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ControllerEvent {
    /// The load balancer converged, carries its DNS name.
    Reconciled { dns_name: String },
    /// The desired state could not be derived from the group.
    BuildFailed { message: String },
    /// A group member was skipped because of an invalid configuration.
    MemberFailed { group: String, message: String },
    ApplyFailed { reason: String, message: String },
    /// The Ingress left the group and its finalizer was removed.
    Released { group: String },
    /// All cloud resources of the configuration have been removed.
    Deleted,
}

impl ControllerEvent {
    fn to_event(&self) -> Event {
        let (type_, reason, note, action) = match self {
            Self::Reconciled { dns_name } => (
                EventType::Normal,
                "Reconciled",
                format!("load balancer is available at {}", dns_name),
                "Reconcile",
            ),
            Self::BuildFailed { message } => {
                (EventType::Warning, "BuildFailed", message.clone(), "Build")
            }
            Self::MemberFailed { group, message } => (
                EventType::Warning,
                "MemberFailed",
                format!("skipped by group {}: {}", group, message),
                "Build",
            ),
            Self::ApplyFailed { reason, message } => {
                (EventType::Warning, reason.as_str(), message.clone(), "Apply")
            }
            Self::Released { group } => (
                EventType::Normal,
                "Released",
                format!("no longer a member of group {}", group),
                "Reconcile",
            ),
            Self::Deleted => (
                EventType::Normal,
                "Deleted",
                "released all cloud resources".to_string(),
                "Delete",
            ),
        };
        Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        }
    }
}

pub(crate) struct EventPublisher {
    recorder: Recorder,
}

impl EventPublisher {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn publish<K>(&self, object: &K, event: ControllerEvent)
    where
        K: Resource<DynamicType = ()>,
    {
        let reference: ObjectReference = object.object_ref(&());
        if let Err(e) = self.recorder.publish(&event.to_event(), &reference).await {
            warn!(
                "failed to publish event {:?} on {}/{}: {}",
                event,
                reference.namespace.as_deref().unwrap_or(""),
                reference.name.as_deref().unwrap_or(""),
                e
            );
        }
    }
}
