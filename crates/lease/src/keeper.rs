//! Credential maintenance loop. Run exactly one per pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::LeaseError;
use crate::issuer::CredentialIssuer;
use crate::pool::{CredentialLeasePool, RefreshOutcome};
use crate::switch::SyncSwitch;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Check the pool every `refresh_check` interval until `shutdown` fires.
///
/// Failures back off exponentially. After `max_refresh_failures` in a row the
/// sync subsystem is switched off and the loop returns the last error.
pub async fn run_token_keeper(
    pool: CredentialLeasePool,
    issuer: Arc<dyn CredentialIssuer>,
    switch: SyncSwitch,
    shutdown: Arc<Notify>,
    check_interval: Duration,
    max_failures: u32,
) -> Result<(), LeaseError> {
    info!(
        pool = %pool.pool_name(),
        interval_ms = check_interval.as_millis() as u64,
        "token keeper started"
    );
    let mut consecutive_errors: u32 = 0;

    loop {
        let wait = match pool.refresh(issuer.as_ref(), &switch).await {
            Ok(outcome) => {
                consecutive_errors = 0;
                match outcome {
                    RefreshOutcome::NotDue => {
                        debug!(pool = %pool.pool_name(), "credential still live")
                    }
                    RefreshOutcome::SyncHalted => {
                        warn!(pool = %pool.pool_name(), "pause_all set, sync halted")
                    }

                    RefreshOutcome::Created | RefreshOutcome::Rotated => {}
                }
                check_interval
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    pool = %pool.pool_name(),
                    error = %e,
                    consecutive_errors,
                    "credential refresh failed"
                );
                if consecutive_errors >= max_failures {
                    error!(
                        pool = %pool.pool_name(),
                        "token keeper stopping after {} consecutive failures",
                        consecutive_errors
                    );
                    if let Err(se) = switch.set_active(false).await {
                        error!(error = %se, "could not switch sync off");
                    }
                    return Err(e);
                }
                let backoff = check_interval.saturating_mul(2u32.pow(consecutive_errors.min(5)));
                backoff.min(MAX_BACKOFF)
            }
        };

        tokio::select! {
            _ = shutdown.notified() => {
                info!(pool = %pool.pool_name(), "token keeper shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
