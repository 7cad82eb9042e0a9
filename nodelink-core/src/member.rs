//! Member identity and address.
//!
//! A [`Member`] is the record discovery keeps for each cluster node: the
//! [`NodeId`] it is known by and the host/port its transport listens on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cluster-wide identity of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A peer's identity and transport address as known cluster-wide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Identity of the node.
    pub node_id: NodeId,
    /// Host the node's transport listens on.
    pub host: String,
    /// Port the node's transport listens on.
    pub port: u16,
}

impl Member {
    /// Create a member record.
    pub fn new(node_id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for [`crate::NetworkProvider::connect`].
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether both records describe the same node.
    pub fn is_same_node(&self, other: &Member) -> bool {
        self.node_id == other.node_id
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.node_id, self.host, self.port)
    }
}

/// Errors from parsing a `node_id@host:port` member string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemberParseError {
    /// The `@` separating id and address is missing or the id is empty.
    #[error("missing node id in {input:?} (expected node_id@host:port)")]
    MissingNodeId {
        /// The rejected input.
        input: String,
    },

    /// The address part has no `:port`.
    #[error("missing port in {input:?} (expected node_id@host:port)")]
    MissingPort {
        /// The rejected input.
        input: String,
    },

    /// The port is not a valid u16.
    #[error("invalid port {port:?} in {input:?}")]
    InvalidPort {
        /// The rejected input.
        input: String,
        /// The port fragment.
        port: String,
    },
}

impl FromStr for Member {
    type Err = MemberParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_id, address) = match s.split_once('@') {
            Some((id, address)) if !id.is_empty() => (id, address),
            _ => {
                return Err(MemberParseError::MissingNodeId {
                    input: s.to_string(),
                });
            }
        };
        let (host, port) = address
            .rsplit_once(':')
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| MemberParseError::MissingPort {
                input: s.to_string(),
            })?;
        let port = port.parse::<u16>().map_err(|_| MemberParseError::InvalidPort {
            input: s.to_string(),
            port: port.to_string(),
        })?;
        Ok(Member::new(node_id, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_address_and_display() {
        let member = Member::new("service-1", "10.0.0.7", 7510);
        assert_eq!(member.address(), "10.0.0.7:7510");
        assert_eq!(member.to_string(), "service-1[10.0.0.7:7510]");
    }

    #[test]
    fn test_same_node_ignores_address() {
        let a = Member::new("n1", "127.0.0.1", 7000);
        let b = Member::new("n1", "127.0.0.1", 7001);
        let c = Member::new("n2", "127.0.0.1", 7000);
        assert!(a.is_same_node(&b));
        assert!(!a.is_same_node(&c));
    }

    #[test]
    fn test_parse_member() {
        let member: Member = "gateway-2@localhost:7001".parse().expect("parse");
        assert_eq!(member, Member::new("gateway-2", "localhost", 7001));
    }

    #[test]
    fn test_parse_member_errors() {
        assert!(matches!(
            "localhost:7001".parse::<Member>(),
            Err(MemberParseError::MissingNodeId { .. })
        ));
        assert!(matches!(
            "n1@localhost".parse::<Member>(),
            Err(MemberParseError::MissingPort { .. })
        ));
        assert!(matches!(
            "n1@localhost:http".parse::<Member>(),
            Err(MemberParseError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_node_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&NodeId::new("n1")).expect("serialize");
        assert_eq!(json, "\"n1\"");
    }
}
