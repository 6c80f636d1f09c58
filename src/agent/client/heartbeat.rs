use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::Store;
use crate::types::{Subnet, DEFAULT_SUBNET_TTL};

/// Retry cadence after a failed heartbeat write. Failures are never fatal;
/// the lease only lapses if they persist for the whole TTL.
const FAILURE_BACKOFF: Duration = Duration::from_secs(10);

/// Spawns the heartbeat task for one owned lease. Every tick writes the
/// lease back with a freshly advanced expiration; the in-memory copy only
/// advances once the store write succeeds.
pub(super) fn spawn_heartbeat(
    store: Arc<dyn Store>,
    mut subnet: Subnet,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // A third of the TTL leaves two more chances before the lease
        // lapses.
        let interval = DEFAULT_SUBNET_TTL / 3;
        let mut pause = interval;

        tracing::info!(
            network_name = %subnet.network_name,
            client_id = %subnet.client_id,
            interval_secs = interval.as_secs(),
            "starting subnet heartbeat",
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(
                        network_name = %subnet.network_name,
                        "shutting down subnet heartbeat",
                    );
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }

            let mut refreshed = subnet.clone();
            refreshed.refresh(DEFAULT_SUBNET_TTL);

            match store.set_subnet(&refreshed).await {
                Ok(()) => {
                    subnet = refreshed;
                    pause = interval;
                    tracing::debug!(
                        network_name = %subnet.network_name,
                        new_expiration = %subnet.expiration,
                        "updated subnet expiration",
                    );
                }
                Err(err) => {
                    pause = FAILURE_BACKOFF;
                    tracing::error!(
                        network_name = %subnet.network_name,
                        error = %err,
                        "failed to update subnet expiration",
                    );
                }
            }
        }
    })
}
