// Background lifecycle tasks: a renewer that keeps one session's own lease
// alive, and a cleaner that reaps sessions whose lease has lapsed anywhere
// in the cluster. Both are spawned once per participant and run until their
// `CancellationToken` fires.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::ids::SessionId;

use super::{SessionCleanupHandler, SessionManager};

/// Sleeps for half the lease length, renews, repeats. Exits as soon as the
/// session is observed terminated (no point renewing after that) or the
/// token is cancelled.
pub async fn run_renewer(
    sessions: Arc<SessionManager>,
    session: SessionId,
    shutdown: CancellationToken,
) {
    let interval = sessions.lease_length() / 2;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match sessions.renew(&session).await {
            Ok(()) => {}
            Err(Error::SessionTerminated) => {
                tracing::info!(%session, "session terminated, stopping renewer");
                return;
            }
            Err(err) => {
                tracing::warn!(%session, %err, "lease renewal failed, will retry");
            }
        }
    }
}

/// Polls for expired sessions cluster-wide, cleans each one up via the
/// injected handler, then deletes its record.
pub async fn run_cleaner(
    sessions: Arc<SessionManager>,
    handler: Arc<dyn SessionCleanupHandler>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let expired = match sessions.expired_sessions().await {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(%err, "failed to scan for expired sessions");
                continue;
            }
        };

        for record in expired {
            if let Err(err) = handler
                .clean_up_session(&record.session, &record.entry_paths)
                .await
            {
                tracing::warn!(session = %record.session, %err, "session cleanup failed, will retry next pass");
                continue;
            }
            if let Err(err) = sessions.remove_session_record(record.clone()).await {
                tracing::warn!(session = %record.session, %err, "failed to remove cleaned-up session record");
            }
        }
    }
}
