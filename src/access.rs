//! Access-control gate for macro invocation.
//!
//! Devices and macros carry an access tier plus a set of bearer keys. The
//! gate is a pure decision function over the caller's key set:
//! - `SHARED` resources are open to everyone, authenticated or not.
//! - `NONE` resources are disabled outright.
//! - `RESTRICTED` resources require at least one key in common. A
//!   RESTRICTED resource with an empty key set is unreachable until a key
//!   is provisioned — that is intentional, not a bug.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Access tier for users, devices, and macros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessTier {
    /// Invocable by anyone.
    Shared,
    /// Invocable only with a matching key.
    Restricted,
    /// Disabled (administrative).
    None,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "SHARED",
            Self::Restricted => "RESTRICTED",
            Self::None => "NONE",
        }
    }

    /// Parse the stored tier string; unknown values collapse to the most
    /// restrictive tier so a corrupted row can never open a resource up.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "SHARED" => Self::Shared,
            "RESTRICTED" => Self::Restricted,
            _ => Self::None,
        }
    }
}

/// Decide whether a caller holding `actor_keys` may invoke a resource with
/// the given tier and key set.
pub fn can_invoke(
    actor_keys: &HashSet<String>,
    tier: AccessTier,
    resource_keys: &HashSet<String>,
) -> bool {
    match tier {
        AccessTier::Shared => true,
        AccessTier::None => false,
        AccessTier::Restricted => actor_keys.iter().any(|k| resource_keys.contains(k)),
    }
}
