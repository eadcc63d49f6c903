//! Lead/member validation state machine.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use regionsync_core::config::Timing;
use regionsync_core::{AgentIdentity, Backoff, ProtocolVersion, Shutdown};
use regionsync_state::{StateStore, VersionRecord, VersionRow, epoch_secs};

use crate::error::{ValidatorError, ValidatorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorRole {
    /// Group of one: nothing to agree with.
    Disabled,
    LeadAtStartup,
    LeadAtRuntime,
    Member,
}

impl fmt::Display for ValidatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidatorRole::Disabled => "disabled",
            ValidatorRole::LeadAtStartup => "lead-at-startup",
            ValidatorRole::LeadAtRuntime => "lead-at-runtime",
            ValidatorRole::Member => "member",
        };
        f.write_str(s)
    }
}

/// What startup validation observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub role: ValidatorRole,
    /// Some peer announced a different (but accepted) version.
    pub version_skew: bool,
    /// How long a member waited for the lead.
    pub waited: Duration,
}

pub struct ConfigValidator {
    store: StateStore,
    identity: AgentIdentity,
    version: ProtocolVersion,
    instance: String,
    role: ValidatorRole,
    startup_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    interval: Duration,
}

impl ConfigValidator {
    pub fn new(store: StateStore, identity: AgentIdentity, timing: &Timing) -> Self {
        let role = if identity.is_solo() {
            ValidatorRole::Disabled
        } else if identity.is_lead() {
            ValidatorRole::LeadAtStartup
        } else {
            ValidatorRole::Member
        };
        Self {
            store,
            identity,
            version: ProtocolVersion::current(),
            instance: uuid::Uuid::new_v4().to_string(),
            role,
            startup_timeout: timing.startup_timeout,
            backoff_initial: timing.backoff_initial,
            backoff_max: timing.backoff_max,
            interval: timing.validator_interval,
        }
    }

    /// Announce `version` instead of the compiled-in one.
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn role(&self) -> ValidatorRole {
        self.role
    }

    /// Token identifying this process in the version row.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Startup validation. A member blocks here until the lead has posted.
    pub async fn validate_startup(&mut self, shutdown: &Shutdown) -> ValidatorResult<StartupReport> {
        let report = match self.role {
            ValidatorRole::Disabled => {
                self.announce()?;
                StartupReport {
                    role: self.role,
                    version_skew: false,
                    waited: Duration::ZERO,
                }
            }
            ValidatorRole::LeadAtStartup | ValidatorRole::LeadAtRuntime => {
                let row = self.store.get_versions()?;
                for peer in row.peers_of(0) {
                    if peer.group_size != self.identity.group_size() {
                        warn!(
                            peer = peer.agent_index,
                            peer_group_size = peer.group_size,
                            group_size = self.identity.group_size(),
                            "member announced a different group size"
                        );
                    }
                }
                self.announce()?;
                self.role = ValidatorRole::LeadAtRuntime;
                StartupReport {
                    role: self.role,
                    version_skew: self.log_skew(&row),
                    waited: Duration::ZERO,
                }
            }
            ValidatorRole::Member => self.member_startup(shutdown).await?,
        };
        info!(
            agent = %self.identity,
            role = %report.role,
            waited = ?report.waited,
            "group validation passed"
        );
        Ok(report)
    }

    async fn member_startup(&mut self, shutdown: &Shutdown) -> ValidatorResult<StartupReport> {
        let mut shutdown = shutdown.clone();
        let started = Instant::now();
        let deadline = started + self.startup_timeout;
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);

        let (lead, row) = loop {
            match self.store.get_versions() {
                Ok(row) => {
                    if let Some(lead) = row.get(0).cloned() {
                        break (lead, row);
                    }
                    debug!(agent = %self.identity, "lead has not posted its version yet");
                }
                Err(e) if e.is_transient() || e.is_not_found() => {
                    warn!(agent = %self.identity, error = %e, "version row unreadable, retrying");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                error!(agent = %self.identity, waited = ?self.startup_timeout, "gave up waiting for lead");
                return Err(ValidatorError::StartupTimeout {
                    waited: self.startup_timeout,
                });
            }
            let delay = backoff.next_delay().min(deadline - now);
            if !shutdown.sleep(delay).await {
                return Err(ValidatorError::Cancelled);
            }
        };

        self.check_lead_group_size(&lead)?;
        self.announce()?;
        Ok(StartupReport {
            role: self.role,
            version_skew: self.log_skew(&row),
            waited: started.elapsed(),
        })
    }

    /// One periodic re-check. Transient store faults are logged and ignored.
    pub fn check_runtime(&self) -> ValidatorResult<()> {
        let row = match self.store.get_versions() {
            Ok(row) => row,
            Err(e) if e.is_transient() || e.is_not_found() => {
                warn!(agent = %self.identity, error = %e, "version row unreadable, skipping check");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.role {
            ValidatorRole::Disabled | ValidatorRole::LeadAtStartup => Ok(()),
            ValidatorRole::LeadAtRuntime => match row.get(0) {
                Some(slot) if slot.instance != self.instance => {
                    error!(
                        ours = %self.instance,
                        theirs = %slot.instance,
                        "another process claimed the lead slot"
                    );
                    Err(ValidatorError::LeadConflict {
                        ours: self.instance.clone(),
                        theirs: slot.instance.clone(),
                    })
                }
                _ => Ok(()),
            },
            ValidatorRole::Member => match row.get(0) {
                Some(lead) => self.check_lead_group_size(lead),
                None => Ok(()),
            },
        }
    }

    /// Re-check every validator interval until shutdown or a fatal finding.
    pub async fn run(self, shutdown: Shutdown) -> ValidatorResult<()> {
        let mut shutdown = shutdown;
        info!(agent = %self.identity, role = %self.role, interval = ?self.interval, "validator loop started");
        while shutdown.sleep(self.interval).await {
            self.check_runtime()?;
        }
        info!(agent = %self.identity, "validator loop shutting down");
        Ok(())
    }

    fn check_lead_group_size(&self, lead: &VersionRecord) -> ValidatorResult<()> {
        if lead.group_size != self.identity.group_size() {
            error!(
                agent = %self.identity,
                lead_group_size = lead.group_size,
                "group size disagrees with lead"
            );
            return Err(ValidatorError::GroupSizeMismatch {
                ours: self.identity.group_size(),
                lead: lead.group_size,
            });
        }
        Ok(())
    }

    fn announce(&self) -> ValidatorResult<()> {
        self.store.post_version(&VersionRecord {
            agent_index: self.identity.index(),
            group_size: self.identity.group_size(),
            version: self.version.clone(),
            instance: self.instance.clone(),
            posted_at: epoch_secs(),
        })?;
        Ok(())
    }

    fn log_skew(&self, row: &VersionRow) -> bool {
        let mut skew = false;
        for peer in row.peers_of(self.identity.index()) {
            if peer.version.version != self.version.version {
                warn!(
                    peer = peer.agent_index,
                    peer_version = %peer.version.version,
                    version = %self.version.version,
                    "version skew within group"
                );
                skew = true;
            }
        }
        skew
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regionsync_core::shutdown_channel;
    use semver::Version;

    fn timing() -> Timing {
        Timing {
            poll_interval: Duration::from_secs(1),
            aggregator_tick: Duration::from_secs(1),
            aggregator_timeout: Duration::from_secs(600),
            worker_ready_timeout: Duration::from_secs(30),
            dequeue_wait: Duration::from_secs(1),
            validator_interval: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(3600),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    fn validator(store: &StateStore, size: u32, index: u32) -> ConfigValidator {
        ConfigValidator::new(store.clone(), AgentIdentity::new(size, index).unwrap(), &timing())
    }

    #[tokio::test]
    async fn roles_follow_identity() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(validator(&store, 1, 0).role(), ValidatorRole::Disabled);
        assert_eq!(validator(&store, 3, 0).role(), ValidatorRole::LeadAtStartup);
        assert_eq!(validator(&store, 3, 2).role(), ValidatorRole::Member);
    }

    #[tokio::test]
    async fn solo_agent_never_waits() {
        let store = StateStore::open_in_memory().unwrap();
        let mut v = validator(&store, 1, 0);
        let report = v.validate_startup(&Shutdown::never()).await.unwrap();
        assert_eq!(report.role, ValidatorRole::Disabled);
        assert!(store.get_versions().unwrap().get(0).is_some());
        v.check_runtime().unwrap();
    }

    #[tokio::test]
    async fn lead_becomes_runtime_lead() {
        let store = StateStore::open_in_memory().unwrap();
        let mut lead = validator(&store, 3, 0);
        let report = lead.validate_startup(&Shutdown::never()).await.unwrap();
        assert_eq!(report.role, ValidatorRole::LeadAtRuntime);
        let row = store.get_versions().unwrap();
        assert_eq!(row.get(0).unwrap().instance, lead.instance());
        lead.check_runtime().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn member_blocks_until_lead_posts() {
        let store = StateStore::open_in_memory().unwrap();
        let mut member = validator(&store, 3, 1);
        let handle = tokio::spawn(async move {
            let report = member.validate_startup(&Shutdown::never()).await;
            (member, report)
        });

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(store.get_versions().unwrap().get(1).is_none());

        let mut lead = validator(&store, 3, 0);
        lead.validate_startup(&Shutdown::never()).await.unwrap();

        let (member, report) = handle.await.unwrap();
        let report = report.unwrap();
        assert_eq!(report.role, ValidatorRole::Member);
        assert!(report.waited >= Duration::from_secs(300));
        // Backoff is capped at 30s, so the member noticed within one step.
        assert!(report.waited <= Duration::from_secs(340));
        assert!(store.get_versions().unwrap().get(1).is_some());
        member.check_runtime().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn member_times_out_after_an_hour() {
        let store = StateStore::open_in_memory().unwrap();
        let mut member = validator(&store, 3, 1);
        let start = Instant::now();
        let err = member.validate_startup(&Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, ValidatorError::StartupTimeout { .. }));
        assert!(!err.is_misconfiguration());
        assert_eq!(start.elapsed(), Duration::from_secs(3600));
        assert!(store.get_versions().unwrap().get(1).is_none());
    }

    #[tokio::test]
    async fn group_size_mismatch_is_fatal() {
        let store = StateStore::open_in_memory().unwrap();
        validator(&store, 2, 0)
            .validate_startup(&Shutdown::never())
            .await
            .unwrap();

        let mut member = validator(&store, 3, 1);
        let err = member.validate_startup(&Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, ValidatorError::GroupSizeMismatch { ours: 3, lead: 2 }));
        assert!(err.is_misconfiguration());
        // The misconfigured member never announced itself.
        assert!(store.get_versions().unwrap().get(1).is_none());
    }

    #[tokio::test]
    async fn skew_is_logged_not_fatal() {
        let store = StateStore::open_in_memory().unwrap();
        validator(&store, 2, 0)
            .with_version(ProtocolVersion::new(Version::new(0, 2, 0), Version::new(0, 1, 0)))
            .validate_startup(&Shutdown::never())
            .await
            .unwrap();

        let mut member = validator(&store, 2, 1)
            .with_version(ProtocolVersion::new(Version::new(0, 3, 0), Version::new(0, 1, 0)));
        let report = member.validate_startup(&Shutdown::never()).await.unwrap();
        assert!(report.version_skew);
    }

    #[tokio::test]
    async fn second_lead_demotes_the_first() {
        let store = StateStore::open_in_memory().unwrap();
        let mut stale = validator(&store, 2, 0);
        stale.validate_startup(&Shutdown::never()).await.unwrap();

        let mut fresh = validator(&store, 2, 0);
        fresh.validate_startup(&Shutdown::never()).await.unwrap();

        let err = stale.check_runtime().unwrap_err();
        assert!(matches!(err, ValidatorError::LeadConflict { .. }));
        assert!(err.is_misconfiguration());
        fresh.check_runtime().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_on_conflict() {
        let store = StateStore::open_in_memory().unwrap();
        let mut stale = validator(&store, 2, 0);
        stale.validate_startup(&Shutdown::never()).await.unwrap();
        validator(&store, 2, 0)
            .validate_startup(&Shutdown::never())
            .await
            .unwrap();

        let err = stale.run(Shutdown::never()).await.unwrap_err();
        assert!(matches!(err, ValidatorError::LeadConflict { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_exits_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let mut lead = validator(&store, 2, 0);
        lead.validate_startup(&Shutdown::never()).await.unwrap();

        let (trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(lead.run(shutdown));
        tokio::time::sleep(Duration::from_secs(95)).await;
        trigger.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn member_startup_cancelled_by_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();
        let mut member = validator(&store, 2, 1);
        let err = member.validate_startup(&shutdown).await.unwrap_err();
        assert!(matches!(err, ValidatorError::Cancelled));
    }
}
