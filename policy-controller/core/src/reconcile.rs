//! Translates policies into SDN primitives.
//!
//! Each policy owns one port group and, for each direction with at least one
//! rule, an allow address set, an except address set and an ACL that
//! references all three. Objects are always created in that order (port group,
//! address sets, ACL) and torn down in the reverse order, since the backend
//! does not permit an object to reference one that does not exist.
//!
//! A pass stops at its first failure; the task is then retried from the top,
//! which is safe because every backend call is idempotent.

use crate::{
    names::{AddressSets, Names},
    Direction, EventRecorder, Policy, PolicyId, PolicyStore, PortSpec, SdnClient,
};
use anyhow::{Context, Result};
use netpol_controller_queue::{worker::Handler, Item};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::fmt;
use tracing::{debug, info_span, Instrument};

/// Event reason recorded when a policy's backend objects could not be created.
pub const CREATE_ACL_FAILED: &str = "CreateACLFailed";

/// Event reason recorded when a policy's backend objects could not be updated.
pub const UPDATE_ACL_FAILED: &str = "UpdateACLFailed";

/// The kind of change a task reconciles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Add,
    Update,
    Delete,
}

/// A unit of work: reconcile `id` for `verb`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Task {
    pub verb: Verb,
    pub id: PolicyId,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    verb: &'static str,
    result: &'static str,
}

pub struct Reconciler<S, C, R> {
    store: S,
    sdn: C,
    events: R,
    metrics: ReconcileMetrics,
}

// === impl Verb ===

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Task ===

impl Task {
    pub fn add(id: PolicyId) -> Self {
        Self { verb: Verb::Add, id }
    }

    pub fn update(id: PolicyId) -> Self {
        Self {
            verb: Verb::Update,
            id,
        }
    }

    pub fn delete(id: PolicyId) -> Self {
        Self {
            verb: Verb::Delete,
            id,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.id)
    }
}

impl Item for Task {
    type Key = PolicyId;

    fn key(&self) -> PolicyId {
        self.id.clone()
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of policy reconciliation passes by verb and result",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    fn observe(&self, verb: Verb, result: &Result<()>) {
        let result = if result.is_ok() { "ok" } else { "error" };
        self.reconciles
            .get_or_create(&ReconcileLabels {
                verb: verb.as_str(),
                result,
            })
            .inc();
    }
}

// === impl Reconciler ===

impl<S, C, R> Reconciler<S, C, R>
where
    S: PolicyStore,
    C: SdnClient,
    R: EventRecorder,
{
    pub fn new(store: S, sdn: C, events: R, metrics: ReconcileMetrics) -> Self {
        Self {
            store,
            sdn,
            events,
            metrics,
        }
    }

    pub async fn reconcile(&self, task: &Task) -> Result<()> {
        let span = info_span!("reconcile", verb = %task.verb, policy = %task.id);
        let result = match task.verb {
            Verb::Add => self.add(&task.id).instrument(span).await,
            Verb::Update => self.update(&task.id).instrument(span).await,
            Verb::Delete => self.delete(&task.id).instrument(span).await,
        };
        self.metrics.observe(task.verb, &result);
        result
    }

    /// Creates the backend objects for a policy.
    ///
    /// A policy that is no longer cached was deleted after the task was queued;
    /// there is nothing to create.
    pub async fn add(&self, id: &PolicyId) -> Result<()> {
        let Some(policy) = self.store.get_policy(id)? else {
            debug!("Policy not found");
            return Ok(());
        };

        if let Err(error) = self.create(&policy).await {
            self.events
                .warn(&policy, CREATE_ACL_FAILED, format!("{error:#}"))
                .await;
            return Err(error);
        }
        Ok(())
    }

    /// Converges the backend objects for a policy whose rules changed.
    pub async fn update(&self, id: &PolicyId) -> Result<()> {
        let Some(policy) = self.store.get_policy(id)? else {
            debug!("Policy not found");
            return Ok(());
        };
        self.update_policy(&policy).await
    }

    /// Removes the backend objects of a deleted policy.
    ///
    /// If the policy has been recreated since the deletion was observed, its
    /// objects are converged to the new incarnation instead.
    pub async fn delete(&self, id: &PolicyId) -> Result<()> {
        if let Some(policy) = self.store.get_policy(id)? {
            debug!("Policy was recreated");
            return self.update_policy(&policy).await;
        }

        let names = Names::new(id);
        for direction in Direction::ALL.into_iter().rev() {
            self.remove_direction(&names, direction).await?;
        }
        self.sdn
            .delete_port_group(&names.port_group)
            .await
            .with_context(|| format!("deleting port group {}", names.port_group))?;
        debug!("Deleted");
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<()> {
        if let Err(error) = self.converge(policy).await {
            self.events
                .warn(policy, UPDATE_ACL_FAILED, format!("{error:#}"))
                .await;
            return Err(error);
        }
        Ok(())
    }

    async fn create(&self, policy: &Policy) -> Result<()> {
        let names = Names::new(&policy.id);
        self.create_port_group(&names).await?;
        for direction in Direction::ALL {
            if policy.rules(direction).is_empty() {
                continue;
            }
            self.create_direction(&names, direction, &policy.ports(direction))
                .await?;
        }
        debug!("Created");
        Ok(())
    }

    async fn converge(&self, policy: &Policy) -> Result<()> {
        let names = Names::new(&policy.id);
        self.create_port_group(&names).await?;
        for direction in Direction::ALL {
            if policy.rules(direction).is_empty() {
                self.remove_direction(&names, direction).await?;
            } else {
                self.create_direction(&names, direction, &policy.ports(direction))
                    .await?;
            }
        }
        debug!("Updated");
        Ok(())
    }

    async fn create_port_group(&self, names: &Names) -> Result<()> {
        self.sdn
            .create_port_group(&names.port_group)
            .await
            .with_context(|| format!("creating port group {}", names.port_group))
    }

    async fn create_direction(
        &self,
        names: &Names,
        direction: Direction,
        ports: &[PortSpec],
    ) -> Result<()> {
        let AddressSets { allow, except } = names.address_sets(direction);
        self.sdn
            .create_address_set(allow)
            .await
            .with_context(|| format!("creating address set {allow}"))?;
        self.sdn
            .create_address_set(except)
            .await
            .with_context(|| format!("creating address set {except}"))?;

        let pg = &names.port_group;
        let created = match direction {
            Direction::Ingress => self.sdn.create_ingress_acl(pg, allow, except, ports).await,
            Direction::Egress => self.sdn.create_egress_acl(pg, allow, except, ports).await,
        };
        created.with_context(|| format!("creating {direction} ACL for port group {pg}"))
    }

    async fn remove_direction(&self, names: &Names, direction: Direction) -> Result<()> {
        let pg = &names.port_group;
        self.sdn
            .delete_acl(pg, direction)
            .await
            .with_context(|| format!("deleting {direction} ACL for port group {pg}"))?;

        let AddressSets { allow, except } = names.address_sets(direction);
        self.sdn
            .delete_address_set(except)
            .await
            .with_context(|| format!("deleting address set {except}"))?;
        self.sdn
            .delete_address_set(allow)
            .await
            .with_context(|| format!("deleting address set {allow}"))
    }
}

#[async_trait::async_trait]
impl<S, C, R> Handler<Task> for Reconciler<S, C, R>
where
    S: PolicyStore,
    C: SdnClient,
    R: EventRecorder,
{
    async fn handle(&self, task: &Task) -> Result<()> {
        self.reconcile(task).await
    }
}
