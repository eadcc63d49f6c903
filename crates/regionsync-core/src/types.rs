//! Shared types used across regionsync crates.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Numeric region id as assigned by a store's region map.
///
/// Ids are always > 0; [`UNKNOWN_REGION_ID`] is reserved.
pub type RegionId = u32;

/// Reserved id meaning "local or unknown".
pub const UNKNOWN_REGION_ID: RegionId = 0;

/// The id every store assigns to its own region.
pub const LOCAL_REGION_ID: RegionId = 1;

// ── Agent identity ──────────────────────────────────────────────────

/// Position of this process within its agent group.
///
/// Index 0 is the lead. This is a static convention, not an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    group_size: u32,
    index: u32,
}

impl AgentIdentity {
    /// Build an identity, rejecting an empty group or an out-of-range index.
    pub fn new(group_size: u32, index: u32) -> Option<Self> {
        (group_size >= 1 && index < group_size).then_some(Self { group_size, index })
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_lead(&self) -> bool {
        self.index == 0
    }

    /// A group of one has nobody to agree with.
    pub fn is_solo(&self) -> bool {
        self.group_size == 1
    }

    /// Stable name used as the owner column of checkpoint rows.
    pub fn agent_id(&self) -> String {
        format!("agent-{}-of-{}", self.index, self.group_size)
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.group_size)
    }
}

// ── Region ─────────────────────────────────────────────────────────

/// A regional deployment of the store.
///
/// Two regions are equal when their names (case-insensitive) and store
/// identifiers match. Endpoint sets and credentials do not take part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    name: String,
    store: String,
    endpoints: BTreeSet<String>,
    #[serde(default)]
    credential: Option<String>,
}

impl Region {
    pub fn new<I, S>(name: &str, store: &str, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            store: store.to_string(),
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: &str) -> Self {
        self.credential = Some(credential.to_string());
        self
    }

    /// Attach the security credential reference after construction.
    ///
    /// Only the serving region gains one late, once the store login is
    /// known; it must happen before the region is shared.
    pub fn attach_credential(&mut self, credential: &str) {
        self.credential = Some(credential.to_string());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower-cased name, used as the key of every per-region map.
    pub fn key(&self) -> String {
        region_key(&self.name)
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn endpoints(&self) -> &BTreeSet<String> {
        &self.endpoints
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.store == other.store
    }
}

impl Eq for Region {}

impl Hash for Region {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
        self.store.hash(state);
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.store)
    }
}

/// Normalize a region name for map lookups.
pub fn region_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rejects_bad_index() {
        assert!(AgentIdentity::new(0, 0).is_none());
        assert!(AgentIdentity::new(3, 3).is_none());
        let id = AgentIdentity::new(3, 0).unwrap();
        assert!(id.is_lead());
        assert!(!id.is_solo());
        assert_eq!(id.to_string(), "0/3");
    }

    #[test]
    fn solo_group() {
        let id = AgentIdentity::new(1, 0).unwrap();
        assert!(id.is_solo());
        assert_eq!(id.agent_id(), "agent-0-of-1");
    }

    #[test]
    fn region_equality_ignores_case_and_endpoints() {
        let a = Region::new("US-East", "kvstore", ["host1:5000"]);
        let b = Region::new("us-east", "kvstore", ["host2:5000", "host3:5000"]);
        assert_eq!(a, b);

        let c = Region::new("us-east", "otherstore", ["host1:5000"]);
        assert_ne!(a, c);
    }

    #[test]
    fn region_hash_matches_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Region::new("EU", "kv", ["a:1"]));
        assert!(set.contains(&Region::new("eu", "kv", ["b:2"])));
    }

    #[test]
    fn credential_attached_late() {
        let mut serving = Region::new("local", "kv", ["h:1"]);
        assert!(serving.credential().is_none());
        serving.attach_credential("/etc/regionsync/login");
        assert_eq!(serving.credential(), Some("/etc/regionsync/login"));
        // Credential does not change identity.
        assert_eq!(serving, Region::new("local", "kv", ["h:1"]));
    }
}
