//! Opaque identifier newtypes
//!
//! All handles are globally unique within a deployment and compare byte-wise.
//! Generated IDs are 12-character nanoids with a short type prefix so they
//! stay greppable in logs.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a 12-character nanoid for entity IDs
pub fn generate_id(prefix: &str) -> String {
    format!("{}{}", prefix, nanoid!(12))
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(generate_id($prefix))
            }

            #[must_use]
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a published media track
    TrackId,
    "TR_"
);

string_id!(
    /// Identifier of a room participant (publisher side)
    ParticipantId,
    "PA_"
);

string_id!(
    /// Identifier of a subscribing participant; keys down tracks in the spreader
    SubscriberId,
    "SU_"
);

string_id!(
    /// Identifier of a single signaling connection between nodes
    ConnectionId,
    "CO_"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_are_unique() {
        let a = TrackId::new();
        let b = TrackId::new();
        assert!(a.as_str().starts_with("TR_"));
        assert_ne!(a, b);
    }

    #[test]
    fn ids_compare_bytewise() {
        assert_eq!(SubscriberId::from("sub-1"), SubscriberId::from_string("sub-1"));
        assert_ne!(SubscriberId::from("sub-1"), SubscriberId::from("sub-2"));
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConnectionId::from("CO_abc123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"CO_abc123\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
