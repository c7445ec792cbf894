//! Opaque string identifiers (§3: "id [opaque string, globally unique]").
//!
//! Every entity kind gets its own newtype so a `GroupId` can't be handed to
//! a function expecting a `PeerId` by accident, while still round-tripping
//! through JSON/SQLite as a plain string.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Generates a random, URL-safe opaque id with the given short prefix
/// (`peer_`, `grp_`, ...), in the style of the object ids used by most
/// hosted APIs.
pub fn generate(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{prefix}_{}", hex::encode(bytes))
}

macro_rules! id_type {
    ($name:ident, $prefix:expr) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(crate::id::generate($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True for the zero value produced by `#[derive(Default)]`,
            /// i.e. an id a client omitted rather than one the server
            /// assigned.
            pub fn is_unset(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
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

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type!(NetworkId, "net");
id_type!(PeerId, "peer");
id_type!(GroupId, "grp");
id_type!(PolicyId, "pol");
id_type!(PolicyRuleId, "rule");
id_type!(RouteId, "route");
id_type!(DnsMappingId, "dns");
id_type!(AgentSessionId, "sess");
id_type!(SecurityIncidentId, "inc");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("peer_"));
    }
}
