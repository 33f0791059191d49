use crate::{metrics::IndexMetrics, SharedIndex};
use ahash::AHashMap as HashMap;
use netpol_controller_core::{LeaderGate, Policy, PolicyId, Task};
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use netpol_controller_queue::WorkQueue;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Holds the cached policies and admits their changes into the work queue.
pub struct Index {
    policies: HashMap<PolicyId, Arc<Policy>>,
    gate: LeaderGate,
    queue: Arc<WorkQueue<Task>>,
    metrics: IndexMetrics,
}

// === impl Index ===

impl Index {
    pub fn shared(
        gate: LeaderGate,
        queue: Arc<WorkQueue<Task>>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            policies: HashMap::new(),
            gate,
            queue,
            metrics,
        }))
    }

    pub fn get(&self, id: &PolicyId) -> Option<Arc<Policy>> {
        self.policies.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Queues an add for every cached policy.
    ///
    /// Events observed while another replica held the lease were not queued, so
    /// a new term starts by reconciling everything.
    pub fn resync(&self) {
        let Some(token) = self.gate.token() else {
            return;
        };
        info!(term = token.term(), policies = self.policies.len(), "Resyncing");
        self.metrics.resyncs.inc();
        for id in self.policies.keys() {
            self.queue.add_rate_limited(Task::add(id.clone()));
        }
    }

    fn on_add(&self, id: &PolicyId) {
        self.enqueue(Task::add(id.clone()));
    }

    fn on_update(&self, old: &Policy, new: &Policy) {
        if old.rules_eq(new) {
            trace!(policy = %new.id, "Rules unchanged");
            return;
        }
        self.enqueue(Task::update(new.id.clone()));
    }

    fn on_delete(&self, id: PolicyId) {
        self.enqueue(Task::delete(id));
    }

    fn enqueue(&self, task: Task) {
        let Some(token) = self.gate.token() else {
            trace!(%task, "Not the leader");
            return;
        };
        debug!(%task, term = token.term(), "Enqueuing");
        self.queue.add_rate_limited(task);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, resource: k8s::NetworkPolicy) {
        self.metrics.applies.inc();

        let policy = match k8s::to_policy(&resource) {
            Ok(policy) => Arc::new(policy),
            Err(error) => {
                self.metrics.invalid.inc();
                let namespace = resource.namespace().unwrap_or_default();
                let name = resource.name_any();
                warn!(%namespace, %name, %error, "Ignoring NetworkPolicy");
                return;
            }
        };

        match self.policies.insert(policy.id.clone(), policy.clone()) {
            None => self.on_add(&policy.id),
            Some(old) => self.on_update(&old, &policy),
        }
        self.metrics.size.set(self.policies.len() as i64);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.metrics.deletes.inc();

        let id = PolicyId::new(namespace, name);
        if self.policies.remove(&id).is_none() {
            debug!(policy = %id, "Deleted policy was not cached");
        }
        self.metrics.size.set(self.policies.len() as i64);
        self.on_delete(id);
    }

    // Resets are handled by the default implementation, which applies every
    // listed policy and deletes the rest.
}
