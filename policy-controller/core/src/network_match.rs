use ipnet::IpNet;
use std::fmt;

/// A CIDR that a policy peer selects, minus the networks it excludes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NetworkMatch {
    /// A network to match against.
    pub net: IpNet,

    /// Networks to exclude from the match.
    pub except: Vec<IpNet>,
}

// === impl NetworkMatch ===

impl fmt::Display for NetworkMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.net.fmt(f)?;
        for except in &self.except {
            write!(f, " except {except}")?;
        }
        Ok(())
    }
}
