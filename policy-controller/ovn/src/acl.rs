use netpol_controller_core::{Direction, Port, PortSpec, Protocol};

/// The priority of every ACL managed by the controller.
pub const PRIORITY: u16 = 2001;

/// The logical-switch pipeline in which a direction's ACL is evaluated.
pub fn pipeline(direction: Direction) -> &'static str {
    match direction {
        Direction::Ingress => "to-lport",
        Direction::Egress => "from-lport",
    }
}

/// Builds the match expression for a port group's ACL.
///
/// Ingress traffic leaves the switch toward the group's ports and is matched
/// on its source; egress traffic enters the switch from them and is matched on
/// its destination.
pub fn build_match(
    direction: Direction,
    port_group: &str,
    allow: &str,
    except: &str,
    ports: &[PortSpec],
) -> String {
    let (port, peer) = match direction {
        Direction::Ingress => ("outport", "ip4.src"),
        Direction::Egress => ("inport", "ip4.dst"),
    };

    let mut expr = format!("{port} == @{port_group} && {peer} == ${allow} && {peer} != ${except}");
    if let Some(ports) = ports_match(ports) {
        expr.push_str(&format!(" && ({ports})"));
    }
    expr
}

/// Builds the disjunction of port clauses, or `None` when all ports are
/// permitted.
///
/// Named ports cannot be resolved to numbers here and are skipped. If every
/// port is named, the clause matches nothing rather than everything.
fn ports_match(ports: &[PortSpec]) -> Option<String> {
    if ports.is_empty() {
        return None;
    }

    let clauses = ports.iter().filter_map(port_clause).collect::<Vec<_>>();
    if clauses.is_empty() {
        tracing::debug!(?ports, "No ports could be matched");
        return Some("0".to_string());
    }
    Some(clauses.join(" || "))
}

fn port_clause(spec: &PortSpec) -> Option<String> {
    let proto = match spec.protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Sctp => "sctp",
    };
    match &spec.port {
        None => Some(proto.to_string()),
        Some(Port::Number(port)) => Some(format!("{proto}.dst == {port}")),
        Some(Port::Range { start, end }) => {
            Some(format!("{proto}.dst >= {start} && {proto}.dst <= {end}"))
        }
        Some(Port::Named(name)) => {
            tracing::debug!(%name, "Skipping named port");
            None
        }
    }
}
