//! Software version rules for agents sharing one group.
//!
//! Every agent announces its running version together with the oldest
//! version it can interoperate with. The group's negotiated minimum is the
//! highest such floor announced by any peer.

use semver::Version;
use serde::{Deserialize, Serialize};

/// Version of this build.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest agent version this build can share a group with.
pub const MIN_COMPATIBLE_VERSION: &str = "0.1.0";

/// A version announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub version: Version,
    pub min_compatible: Version,
}

/// Outcome of comparing the local version with the rest of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionVerdict {
    /// Safe to run. `skew` is set when some peer runs a different version.
    Compatible { skew: bool },
    /// A peer requires a newer version than the local one.
    TooOld { required: Version },
    /// The oldest peer predates what the local version supports.
    TooNew { group_floor: Version, min_compatible: Version },
}

impl VersionVerdict {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VersionVerdict::Compatible { .. })
    }
}

impl ProtocolVersion {
    pub fn new(version: Version, min_compatible: Version) -> Self {
        Self {
            version,
            min_compatible,
        }
    }

    /// The version compiled into this binary.
    pub fn current() -> Self {
        let version = Version::parse(AGENT_VERSION).unwrap_or_else(|_| Version::new(0, 0, 0));
        let min_compatible =
            Version::parse(MIN_COMPATIBLE_VERSION).unwrap_or_else(|_| Version::new(0, 0, 0));
        Self {
            version,
            min_compatible,
        }
    }

    /// Compare against the announcements of every other known agent.
    pub fn check_against<'a, I>(&self, peers: I) -> VersionVerdict
    where
        I: IntoIterator<Item = &'a ProtocolVersion>,
    {
        let mut required: Option<&Version> = None;
        let mut floor: Option<&Version> = None;
        let mut skew = false;

        for peer in peers {
            if required.is_none_or(|r| peer.min_compatible > *r) {
                required = Some(&peer.min_compatible);
            }
            if floor.is_none_or(|f| peer.version < *f) {
                floor = Some(&peer.version);
            }
            skew |= peer.version != self.version;
        }

        if let Some(required) = required {
            if self.version < *required {
                return VersionVerdict::TooOld {
                    required: required.clone(),
                };
            }
        }
        if let Some(floor) = floor {
            if *floor < self.min_compatible {
                return VersionVerdict::TooNew {
                    group_floor: floor.clone(),
                    min_compatible: self.min_compatible.clone(),
                };
            }
        }
        VersionVerdict::Compatible { skew }
    }
}
