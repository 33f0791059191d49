//! Names of the backend objects owned by a policy.
//!
//! Names are pure functions of the policy's name and namespace, so every
//! reconciliation pass (and every replica) derives the same names.

use crate::{Direction, PolicyId};

/// Every backend object name derived for a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Names {
    pub port_group: String,
    pub ingress: AddressSets,
    pub egress: AddressSets,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSets {
    pub allow: String,
    pub except: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Purpose {
    Allow,
    Except,
}

pub fn port_group(id: &PolicyId) -> String {
    format!("{}.{}", id.name, id.namespace)
}

pub fn address_set(id: &PolicyId, direction: Direction, purpose: Purpose) -> String {
    format!(
        "{}.{}.{}.{}",
        id.name,
        id.namespace,
        direction.as_str(),
        purpose.as_str()
    )
}

// === impl Names ===

impl Names {
    pub fn new(id: &PolicyId) -> Self {
        Self {
            port_group: port_group(id),
            ingress: AddressSets::new(id, Direction::Ingress),
            egress: AddressSets::new(id, Direction::Egress),
        }
    }

    pub fn address_sets(&self, direction: Direction) -> &AddressSets {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }
}

// === impl AddressSets ===

impl AddressSets {
    fn new(id: &PolicyId, direction: Direction) -> Self {
        Self {
            allow: address_set(id, direction, Purpose::Allow),
            except: address_set(id, direction, Purpose::Except),
        }
    }
}

// === impl Purpose ===

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Except => "except",
        }
    }
}
