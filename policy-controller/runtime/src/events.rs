use crate::k8s::{Client, ObjectReference};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use netpol_controller_core::{EventRecorder, Policy, CONTROLLER_NAME};

/// Publishes warnings as Kubernetes Events on the affected NetworkPolicy.
pub(crate) struct KubeEvents {
    recorder: Recorder,
}

// === impl KubeEvents ===

impl KubeEvents {
    pub(crate) fn new(client: Client, hostname: &str) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: Some(hostname.to_string()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn object_ref(policy: &Policy) -> ObjectReference {
    ObjectReference {
        api_version: Some("networking.k8s.io/v1".to_string()),
        kind: Some("NetworkPolicy".to_string()),
        namespace: Some(policy.id.namespace.clone()),
        name: Some(policy.id.name.clone()),
        uid: policy.uid.clone(),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEvents {
    async fn warn(&self, policy: &Policy, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, &object_ref(policy)).await {
            tracing::warn!(policy = %policy.id, reason, %error, "Failed to publish event");
        }
    }
}
