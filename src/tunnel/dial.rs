//! Reachability probe for hosts on the mesh network.

use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use super::TunnelManager;
use crate::error::ProviderError;

/// Delay between dial attempts in [`TunnelManager::wait_for_dial`].
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

impl TunnelManager {
    /// Dials `hostname:port` through the session until a connection succeeds
    /// or `limit` elapses. The probe connection is dropped immediately.
    ///
    /// Failed attempts are retried at a fixed interval with no backoff. An
    /// attempt still in flight when the deadline passes is abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Tunnel`] if the session cannot be built and
    /// [`ProviderError::Timeout`] once `limit` elapses without a connection.
    pub async fn wait_for_dial(
        &self,
        hostname: &str,
        port: u16,
        limit: Duration,
    ) -> Result<(), ProviderError> {
        let session = self.session().await?;
        let started = Instant::now();
        let deadline = started + limit;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, session.dial(hostname, port)).await {
                Ok(Ok(_stream)) => {
                    debug!(hostname, port, attempt, "dial succeeded");
                    return Ok(());
                }
                Ok(Err(err)) => debug!(hostname, port, attempt, error = %err, "dial failed"),
                Err(_) => debug!(hostname, port, attempt, "dial attempt cut off by deadline"),
            }

            let now = Instant::now();
            if now + self.dial_retry_interval > deadline {
                sleep(deadline.saturating_duration_since(now)).await;
                return Err(ProviderError::timeout(
                    format!("dial {hostname}:{port}"),
                    started.elapsed(),
                ));
            }
            sleep(self.dial_retry_interval).await;
        }
    }
}
