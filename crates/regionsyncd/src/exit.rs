//! Process exit status.

use regionsync_cluster::ValidatorError;
use regionsync_core::ConfigError;
use regionsync_request::EngineError;

/// Clean shutdown, by signal or by Shutdown request.
pub const EXIT_OK: u8 = 0;
/// Fatal error that is not a misconfiguration.
pub const EXIT_FAILURE: u8 = 1;
/// The agent or its group is misconfigured; restarting will not help.
pub const EXIT_MISCONFIGURED: u8 = 2;

/// Map a fatal agent error to an exit status by looking through its chain
/// for a misconfiguration.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_MISCONFIGURED;
        }
        if let Some(e) = cause.downcast_ref::<ValidatorError>() {
            if e.is_misconfiguration() {
                return EXIT_MISCONFIGURED;
            }
        }
        if let Some(e) = cause.downcast_ref::<EngineError>() {
            if e.is_misconfiguration() {
                return EXIT_MISCONFIGURED;
            }
        }
    }
    EXIT_FAILURE
}
