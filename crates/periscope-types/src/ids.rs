//! Strongly-typed identifier wrappers to prevent accidental misuse of strings.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Strongly-typed user identity. Uses `Arc<str>` internally so cloning is an
/// atomic increment instead of a heap allocation.
///
/// A `UserId` is the opaque, stable identity a remote platform assigns to a
/// user. It is bound to exactly one agent instance at any moment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(Arc<str>);

impl UserId {
    /// Create a new UserId from any string-like value.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::borrow::Borrow<str> for UserId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// The role of a transport link within a session.
///
/// Each user has at most one live link per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// The remote client side (chat interface or browser).
    Remote,
    /// The local agent side (screen and AI session access).
    Agent,
}

impl LinkRole {
    /// The counterpart role on the other side of the session.
    pub fn peer(self) -> Self {
        match self {
            LinkRole::Remote => LinkRole::Agent,
            LinkRole::Agent => LinkRole::Remote,
        }
    }

    /// Parse a role from its path segment.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "remote" => Some(LinkRole::Remote),
            "agent" => Some(LinkRole::Agent),
            _ => None,
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Remote => f.write_str("remote"),
            LinkRole::Agent => f.write_str("agent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_equality_and_display() {
        let a = UserId::new("5014764185");
        let b = UserId::from("5014764185");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "5014764185");
    }

    #[test]
    fn role_peer_is_involutive() {
        assert_eq!(LinkRole::Remote.peer(), LinkRole::Agent);
        assert_eq!(LinkRole::Agent.peer().peer(), LinkRole::Agent);
    }

    #[test]
    fn role_parse() {
        assert_eq!(LinkRole::parse("agent"), Some(LinkRole::Agent));
        assert_eq!(LinkRole::parse("remote"), Some(LinkRole::Remote));
        assert_eq!(LinkRole::parse("observer"), None);
    }
}
