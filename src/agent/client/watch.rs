use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::network::Manager;
use crate::store::SubnetWatch;
use crate::types::Subnet;

/// Spawns the dispatcher that applies one network's watch stream to the
/// kernel: modified peer leases are programmed, expired ones torn down.
/// Batches are applied strictly in the order the stream delivers them.
pub(super) fn spawn_dispatcher(
    network_name: String,
    client_id: String,
    manager: Arc<Manager>,
    mut stream: SubnetWatch,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(
                        network_name = %network_name,
                        "shutting down subnet update handler",
                    );
                    return;
                }
                batch = stream.modify.recv() => match batch {
                    Some(subnets) => handle_modify(&manager, &client_id, subnets).await,
                    None => return,
                },
                batch = stream.delete.recv() => match batch {
                    Some(subnets) => handle_delete(&manager, &client_id, subnets).await,
                    None => return,
                },
                err = stream.errors.recv() => match err {
                    Some(err) => tracing::error!(
                        network_name = %network_name,
                        error = %err,
                        "error received from subnet watcher",
                    ),
                    None => return,
                },
            }
        }
    })
}

async fn handle_modify(manager: &Manager, client_id: &str, subnets: Vec<Subnet>) {
    for subnet in subnets {
        // This host's own lease is realized by set_local at bootstrap;
        // programming it as a remote would break local routing.
        if subnet.client_id == client_id {
            continue;
        }

        tracing::debug!(
            network_name = %subnet.network_name,
            peer_id = %subnet.client_id,
            "setting up remote subnet networking",
        );

        match manager.set_remote(&subnet).await {
            Ok(()) => tracing::info!(
                network_name = %subnet.network_name,
                peer_id = %subnet.client_id,
                subnet = %subnet
                    .ipv4_network
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                "successfully set up remote subnet networking",
            ),
            Err(err) => tracing::error!(
                network_name = %subnet.network_name,
                peer_id = %subnet.client_id,
                error = %err,
                "failed to set up remote subnet networking",
            ),
        }
    }
}

async fn handle_delete(manager: &Manager, client_id: &str, subnets: Vec<Subnet>) {
    for subnet in subnets {
        // Nothing deletes a live host's lease under normal operation, so an
        // expiry notice for ourselves means the cluster is struggling; local
        // routing is left untouched either way.
        if subnet.client_id == client_id {
            tracing::warn!(
                network_name = %subnet.network_name,
                client_id = %subnet.client_id,
                "received subnet deletion for local client; skipping",
            );
            continue;
        }

        tracing::debug!(
            network_name = %subnet.network_name,
            peer_id = %subnet.client_id,
            "deleting remote subnet networking",
        );

        match manager.delete_remote(&subnet).await {
            Ok(()) => tracing::info!(
                network_name = %subnet.network_name,
                peer_id = %subnet.client_id,
                "successfully deleted remote subnet networking",
            ),
            Err(err) => tracing::error!(
                network_name = %subnet.network_name,
                peer_id = %subnet.client_id,
                error = %err,
                "failed to delete remote subnet networking",
            ),
        }
    }
}
