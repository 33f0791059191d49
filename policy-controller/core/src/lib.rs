#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod leader;
pub mod names;
mod network_match;
mod policy;
pub mod reconcile;

#[cfg(test)]
mod tests;

pub use self::{
    leader::{LeaderGate, Terms, WriteToken},
    names::Names,
    network_match::NetworkMatch,
    policy::{
        Direction, Expression, InvalidKey, Peer, Policy, PolicyId, Port, PortSpec, Protocol, Rule,
        Selector,
    },
    reconcile::{ReconcileMetrics, Reconciler, Task, Verb},
};
pub use ipnet::IpNet;

use anyhow::Result;
use std::sync::Arc;

pub const CONTROLLER_NAME: &str = "netpol-controller";

/// Primitive operations against the SDN backend.
///
/// Implementations must be idempotent: creating an object that already exists
/// must converge to the requested state without duplicating it, and deleting
/// an object that does not exist must succeed. Reconciliation re-issues every
/// call of a pass when it is retried.
#[async_trait::async_trait]
pub trait SdnClient: Send + Sync {
    async fn create_port_group(&self, name: &str) -> Result<()>;

    async fn create_address_set(&self, name: &str) -> Result<()>;

    /// Sets the ingress ACL of `port_group`, replacing any existing one.
    async fn create_ingress_acl(
        &self,
        port_group: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()>;

    /// Sets the egress ACL of `port_group`, replacing any existing one.
    async fn create_egress_acl(
        &self,
        port_group: &str,
        allow: &str,
        except: &str,
        ports: &[PortSpec],
    ) -> Result<()>;

    async fn delete_acl(&self, port_group: &str, direction: Direction) -> Result<()>;

    async fn delete_address_set(&self, name: &str) -> Result<()>;

    async fn delete_port_group(&self, name: &str) -> Result<()>;
}

/// Surfaces reconciliation failures on the affected policy.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    /// Records a warning. Failures to record are logged by the implementation.
    async fn warn(&self, policy: &Policy, reason: &str, note: String);
}

/// Reads policies from the local cache.
pub trait PolicyStore: Send + Sync {
    fn get_policy(&self, id: &PolicyId) -> Result<Option<Arc<Policy>>>;
}
