use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::agent::SHUTDOWN_TIMEOUT;
use crate::store::Store;
use crate::types::{Network, Subnet};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("timeout waiting for shutdown")]
    ShutdownTimeout,
}

/// The server role: a single periodic reaper that expires and eventually
/// deletes stale leases. Expiry flips the `expired` flag so peers tear down
/// routes; deletion after the grace threshold frees the block for
/// reallocation.
pub struct Server {
    store: Arc<dyn Store>,
    interval: Duration,
    threshold: Duration,

    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// What a reaper sweep should do with one lease.
#[derive(Debug, PartialEq, Eq)]
enum ReapAction {
    MarkExpired,
    Delete,
}

impl Server {
    pub fn new(store: Arc<dyn Store>, interval: Duration, threshold: Duration) -> Server {
        let (shutdown, _) = broadcast::channel(1);
        Server {
            store,
            interval,
            threshold,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "starting server",
        );

        self.tasks.push(tokio::spawn(run_reaper(
            Arc::clone(&self.store),
            self.interval,
            self.threshold,
            self.shutdown.subscribe(),
        )));
    }

    pub async fn stop(&mut self) -> Result<(), ServerError> {
        tracing::info!("shutting down server");
        let _ = self.shutdown.send(());

        let tasks = std::mem::take(&mut self.tasks);
        let barrier = async {
            for task in tasks {
                let _ = task.await;
            }
        };

        tokio::time::timeout(SHUTDOWN_TIMEOUT, barrier)
            .await
            .map_err(|_| ServerError::ShutdownTimeout)
    }
}

/// Sweeps immediately at startup, then on every tick until shutdown. Errors
/// inside a sweep are logged and naturally retried on the next interval.
async fn run_reaper(
    store: Arc<dyn Store>,
    interval: Duration,
    threshold: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    reap_networks(store.as_ref(), threshold).await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("shutting down network reaper");
                return;
            }
            _ = tokio::time::sleep(interval) => {
                reap_networks(store.as_ref(), threshold).await;
            }
        }
    }
}

async fn reap_networks(store: &dyn Store, threshold: Duration) {
    let networks = match store.list_networks().await {
        Ok(networks) => networks,
        Err(err) => {
            tracing::error!(error = %err, "failed to list networks");
            return;
        }
    };

    for network in networks {
        reap_network_subnets(store, &network, threshold).await;
    }
}

async fn reap_network_subnets(store: &dyn Store, network: &Network, threshold: Duration) {
    tracing::info!(network_name = %network.name, "running subnet reaper");

    let subnets = match store.list_subnets(&network.name).await {
        Ok(subnets) => subnets,
        Err(err) => {
            tracing::error!(
                network_name = %network.name,
                error = %err,
                "failed to list subnets for reaping",
            );
            return;
        }
    };

    tracing::info!(
        network_name = %network.name,
        num = subnets.len(),
        "successfully listed subnets for reaping",
    );

    let now = Utc::now();
    for subnet in subnets {
        match reap_action(&subnet, now, threshold) {
            Some(ReapAction::Delete) => delete_subnet(store, &subnet).await,
            Some(ReapAction::MarkExpired) => mark_expired(store, subnet).await,
            None => {}
        }
    }
}

/// The two-phase expiry decision. A lease is first flagged expired once its
/// expiration passes, and only deleted after the grace threshold has also
/// elapsed; it never skips the flagged state.
fn reap_action(subnet: &Subnet, now: DateTime<Utc>, threshold: Duration) -> Option<ReapAction> {
    if subnet.expired && subnet.expiration + threshold < now {
        return Some(ReapAction::Delete);
    }
    if subnet.expiration < now {
        return Some(ReapAction::MarkExpired);
    }
    None
}

/// Deletes a lease that has aged past the grace threshold. At this point
/// peers have already torn down routing for it, so a failure here is plain
/// cleanup debt for the next sweep.
async fn delete_subnet(store: &dyn Store, subnet: &Subnet) {
    match store
        .delete_subnet(&subnet.network_name, &subnet.client_id)
        .await
    {
        Ok(()) => tracing::info!(
            network_name = %subnet.network_name,
            client_id = %subnet.client_id,
            "successfully deleted expired subnet",
        ),
        Err(err) => tracing::error!(
            network_name = %subnet.network_name,
            client_id = %subnet.client_id,
            error = %err,
            "failed to delete expired subnet",
        ),
    }
}

async fn mark_expired(store: &dyn Store, mut subnet: Subnet) {
    subnet.expired = true;

    match store.set_subnet(&subnet).await {
        Ok(()) => tracing::info!(
            network_name = %subnet.network_name,
            client_id = %subnet.client_id,
            "successfully marked subnet as expired",
        ),
        Err(err) => tracing::error!(
            network_name = %subnet.network_name,
            client_id = %subnet.client_id,
            error = %err,
            "failed to mark subnet as expired",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(expired: bool, expiration: DateTime<Utc>) -> Subnet {
        Subnet {
            client_id: "client-1".to_string(),
            network_name: "v".to_string(),
            provider: "vxlan".to_string(),
            host_ipv4: Some("192.168.10.20".parse().unwrap()),
            config: None,
            expiration,
            expired,
            ipv4_network: Some("10.10.5.0/24".parse().unwrap()),
            mtu: 1450,
        }
    }

    #[test]
    fn live_lease_is_left_alone() {
        let now = Utc::now();
        let threshold = Duration::from_secs(300);

        let subnet = lease(false, now + Duration::from_secs(60));
        assert_eq!(reap_action(&subnet, now, threshold), None);
    }

    #[test]
    fn lapsed_lease_is_flagged_before_deletion() {
        let now = Utc::now();
        let threshold = Duration::from_secs(300);

        // Freshly lapsed and not yet flagged: flag it, never delete it.
        let subnet = lease(false, now - Duration::from_secs(1));
        assert_eq!(reap_action(&subnet, now, threshold), Some(ReapAction::MarkExpired));

        // Even long past the threshold, an unflagged lease is only flagged.
        let subnet = lease(false, now - Duration::from_secs(3600));
        assert_eq!(reap_action(&subnet, now, threshold), Some(ReapAction::MarkExpired));
    }

    #[test]
    fn flagged_lease_is_deleted_only_after_the_threshold() {
        let now = Utc::now();
        let threshold = Duration::from_secs(300);

        // Flagged but still inside the grace window.
        let subnet = lease(true, now - Duration::from_secs(299));
        assert_eq!(reap_action(&subnet, now, threshold), Some(ReapAction::MarkExpired));

        // Grace window elapsed: delete.
        let subnet = lease(true, now - Duration::from_secs(301));
        assert_eq!(reap_action(&subnet, now, threshold), Some(ReapAction::Delete));
    }
}
