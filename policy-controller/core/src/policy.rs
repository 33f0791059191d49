use crate::NetworkMatch;
use std::{collections::BTreeMap, fmt, num::NonZeroU16, str::FromStr};

/// Identifies a policy by its namespace and name.
///
/// The canonical string form is `<namespace>/<name>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyId {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid resource key: {0:?}")]
pub struct InvalidKey(pub String);

/// A network policy, reduced to the fields that drive reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub id: PolicyId,

    /// Used to attribute events to this incarnation of the policy.
    pub uid: Option<String>,

    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub ports: Vec<PortSpec>,
    pub peers: Vec<Peer>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub protocol: Protocol,

    /// When unset, the rule applies to all ports of the protocol.
    pub port: Option<Port>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    Number(NonZeroU16),
    Named(String),
    Range { start: NonZeroU16, end: NonZeroU16 },
}

/// The traffic source (ingress) or destination (egress) of a rule.
///
/// Peers are not interpreted by the reconciler; they determine the membership
/// of the rule's address sets, which is managed elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Peer {
    IpBlock(NetworkMatch),
    Selector {
        namespaces: Option<Selector>,
        pods: Option<Selector>,
    },
}

/// A label selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<Expression>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

// === impl PolicyId ===

impl PolicyId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            return self.name.fmt(f);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PolicyId {
    type Err = InvalidKey;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidKey(key.to_string());
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new("", name)),
            (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(invalid()),
        }
    }
}

// === impl Policy ===

impl Policy {
    pub fn rules(&self, direction: Direction) -> &[Rule] {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    /// Concatenates the ports of every rule in `direction`, in rule order.
    ///
    /// Duplicates are preserved.
    pub fn ports(&self, direction: Direction) -> Vec<PortSpec> {
        self.rules(direction)
            .iter()
            .flat_map(|rule| rule.ports.iter().cloned())
            .collect()
    }

    /// Compares exactly the fields whose changes require reconciliation: the
    /// ingress and egress rules.
    pub fn rules_eq(&self, other: &Self) -> bool {
        self.ingress == other.ingress && self.egress == other.egress
    }
}

// === impl Direction ===

impl Direction {
    /// Directions in the order their backend objects are created.
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl PortSpec ===

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port: NonZeroU16::new(port).map(Port::Number),
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            port: NonZeroU16::new(port).map(Port::Number),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port {
            None => self.protocol.fmt(f),
            Some(port) => write!(f, "{}/{}", self.protocol, port),
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "SCTP" => Ok(Self::Sctp),
            _ => anyhow::bail!("unsupported protocol: {s}"),
        }
    }
}

// === impl Port ===

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(port) => port.fmt(f),
            Self::Named(name) => name.fmt(f),
            Self::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}
