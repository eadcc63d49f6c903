//! Startup version negotiation against the group's version row.

use semver::Version;
use tracing::{info, warn};

use regionsync_core::{AgentIdentity, ProtocolVersion, VersionVerdict};
use regionsync_state::StateStore;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedVersion {
    /// Highest `min_compatible` announced by anyone, this agent included.
    pub minimum: Version,
    pub skew: bool,
}

/// Check `local` against every peer's announcement. Too old or too new is
/// fatal; a skew between compatible versions is only reported.
pub fn negotiate(
    store: &StateStore,
    identity: AgentIdentity,
    local: &ProtocolVersion,
) -> EngineResult<NegotiatedVersion> {
    let row = store.get_versions()?;
    let peers: Vec<&ProtocolVersion> = row.peers_of(identity.index()).map(|r| &r.version).collect();

    let minimum = peers
        .iter()
        .map(|p| &p.min_compatible)
        .chain(std::iter::once(&local.min_compatible))
        .max()
        .cloned()
        .unwrap_or_else(|| local.min_compatible.clone());

    match local.check_against(peers.iter().copied()) {
        VersionVerdict::Compatible { skew } => {
            if skew {
                warn!(version = %local.version, %minimum, "group runs mixed versions");
            }
            info!(version = %local.version, %minimum, peers = peers.len(), "version negotiated");
            Ok(NegotiatedVersion { minimum, skew })
        }
        VersionVerdict::TooOld { required } => Err(EngineError::VersionTooOld {
            local: local.version.clone(),
            required,
        }),
        VersionVerdict::TooNew {
            group_floor,
            min_compatible,
        } => Err(EngineError::VersionTooNew {
            group_floor,
            min_compatible,
        }),
    }
}
