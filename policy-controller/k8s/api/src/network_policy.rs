//! Converts `networking.k8s.io/v1` NetworkPolicy resources into the
//! controller's policy model.

use k8s_openapi::{
    api::networking::v1::{IPBlock, NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort},
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::api::ObjectMeta;
use netpol_controller_core::{
    Expression, IpNet, NetworkMatch, Peer, Policy, PolicyId, Port, PortSpec, Protocol, Rule,
    Selector,
};
use std::num::NonZeroU16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("NetworkPolicy must have a namespace")]
    MissingNamespace,

    #[error("NetworkPolicy must have a name")]
    MissingName,

    #[error("not a valid CIDR or IP address: {0}")]
    InvalidCidr(String),

    #[error("not a valid port: {0}")]
    InvalidPort(i32),

    #[error("unsupported protocol: {0}")]
    InvalidProtocol(String),
}

/// Derives the key of a NetworkPolicy from its metadata.
pub fn policy_id(meta: &ObjectMeta) -> Result<PolicyId, ConvertError> {
    let namespace = meta
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .ok_or(ConvertError::MissingNamespace)?;
    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(ConvertError::MissingName)?;
    Ok(PolicyId::new(namespace, name))
}

pub fn to_policy(np: &NetworkPolicy) -> Result<Policy, ConvertError> {
    let id = policy_id(&np.metadata)?;
    let spec = np.spec.as_ref();

    let ingress = spec
        .and_then(|s| s.ingress.as_ref())
        .into_iter()
        .flatten()
        .map(|rule| mk_rule(rule.ports.as_deref(), rule.from.as_deref()))
        .collect::<Result<Vec<_>, _>>()?;

    let egress = spec
        .and_then(|s| s.egress.as_ref())
        .into_iter()
        .flatten()
        .map(|rule| mk_rule(rule.ports.as_deref(), rule.to.as_deref()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Policy {
        id,
        uid: np.metadata.uid.clone(),
        ingress,
        egress,
    })
}

fn mk_rule(
    ports: Option<&[NetworkPolicyPort]>,
    peers: Option<&[NetworkPolicyPeer]>,
) -> Result<Rule, ConvertError> {
    let ports = ports
        .unwrap_or_default()
        .iter()
        .map(mk_port)
        .collect::<Result<Vec<_>, _>>()?;
    let peers = peers
        .unwrap_or_default()
        .iter()
        .map(mk_peer)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Rule { ports, peers })
}

fn mk_port(port: &NetworkPolicyPort) -> Result<PortSpec, ConvertError> {
    let protocol = match port.protocol.as_deref() {
        None => Protocol::default(),
        Some(p) => p
            .parse()
            .map_err(|_| ConvertError::InvalidProtocol(p.to_string()))?,
    };

    let port = match (port.port.as_ref(), port.end_port) {
        (None, _) => None,
        (Some(IntOrString::String(name)), _) => Some(Port::Named(name.clone())),
        (Some(IntOrString::Int(port)), None) => Some(Port::Number(port_number(*port)?)),
        (Some(IntOrString::Int(start)), Some(end)) => {
            let start = port_number(*start)?;
            let end = port_number(end)?;
            if end < start {
                return Err(ConvertError::InvalidPort(end.get().into()));
            }
            if start == end {
                Some(Port::Number(start))
            } else {
                Some(Port::Range { start, end })
            }
        }
    };

    Ok(PortSpec { protocol, port })
}

fn port_number(port: i32) -> Result<NonZeroU16, ConvertError> {
    u16::try_from(port)
        .ok()
        .and_then(NonZeroU16::new)
        .ok_or(ConvertError::InvalidPort(port))
}

fn mk_peer(peer: &NetworkPolicyPeer) -> Result<Peer, ConvertError> {
    if let Some(IPBlock { cidr, except }) = &peer.ip_block {
        let net = parse_cidr(cidr)?;
        let except = except
            .iter()
            .flatten()
            .map(|c| parse_cidr(c))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Peer::IpBlock(NetworkMatch { net, except }));
    }

    Ok(Peer::Selector {
        namespaces: peer.namespace_selector.as_ref().map(mk_selector),
        pods: peer.pod_selector.as_ref().map(mk_selector),
    })
}

/// Parses either a network or a single address.
fn parse_cidr(s: &str) -> Result<IpNet, ConvertError> {
    if let Ok(net) = s.parse() {
        return Ok(net);
    }
    if let Ok(addr) = s.parse::<std::net::IpAddr>() {
        return Ok(IpNet::from(addr));
    }
    Err(ConvertError::InvalidCidr(s.to_string()))
}

fn mk_selector(selector: &LabelSelector) -> Selector {
    Selector {
        match_labels: selector.match_labels.clone().unwrap_or_default(),
        match_expressions: selector
            .match_expressions
            .iter()
            .flatten()
            .map(|expr| Expression {
                key: expr.key.clone(),
                operator: expr.operator.clone(),
                values: expr.values.clone().unwrap_or_default(),
            })
            .collect(),
    }
}
