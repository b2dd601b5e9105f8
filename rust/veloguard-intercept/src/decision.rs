use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Verdict for the first packet of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedDecision {
    /// Pass the packet through untouched
    Direct,
    /// Drop the flow
    Block,
    /// NAT the flow to a loopback listener
    Redirect { address: IpAddr, port: u16 },
}

impl AllowedDecision {
    pub fn redirect(target: SocketAddr) -> Self {
        AllowedDecision::Redirect {
            address: target.ip(),
            port: target.port(),
        }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        match self {
            AllowedDecision::Redirect { address, port } => Some(SocketAddr::new(*address, *port)),
            _ => None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, AllowedDecision::Redirect { .. })
    }

    /// Whether any packet of the flow transits
    pub fn admits(&self) -> bool {
        !matches!(self, AllowedDecision::Block)
    }
}

impl fmt::Display for AllowedDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowedDecision::Direct => write!(f, "direct"),
            AllowedDecision::Block => write!(f, "block"),
            AllowedDecision::Redirect { address, port } => {
                write!(f, "redirect {}", SocketAddr::new(*address, *port))
            }
        }
    }
}
