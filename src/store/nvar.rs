use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::store::{Store, StoreError, SubnetWatch, STORE_VERSION};
use crate::types::{Network, Subnet};

/// Item key under which each variable stores its JSON-encoded object.
const ITEM_KEY: &str = "data";

/// Wait window for blocking list queries. The server returns earlier when
/// any variable under the watched prefix changes.
const WATCH_WAIT: Duration = Duration::from_secs(5 * 60);

/// Pause between polls after a transient watch error.
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Buffer depth for the watch output channels.
const WATCH_CHANNEL_CAPACITY: usize = 8;

/// HTTP client for the Nomad variables API. Long polling uses the standard
/// blocking-query mechanics: an `index` plus `wait` query pair on list calls
/// and the `X-Nomad-Index` response header as the next wait index.
pub struct VarsClient {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Variable {
    #[serde(rename = "Path")]
    path: String,

    #[serde(rename = "Items")]
    items: HashMap<String, String>,

    #[serde(rename = "ModifyIndex", default)]
    modify_index: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct VariableMetadata {
    #[serde(rename = "Path")]
    path: String,

    #[serde(rename = "ModifyIndex", default)]
    modify_index: u64,
}

impl VarsClient {
    pub fn new(address: &str, token: Option<&str>) -> Result<VarsClient, StoreError> {
        let http = reqwest::Client::builder().build()?;
        Ok(VarsClient {
            http,
            address: address.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.token {
            req = req.header("X-Nomad-Token", token);
        }
        req
    }

    /// Lists variable metadata under a prefix. When `wait` is set the call
    /// blocks server-side until something under the prefix moves past
    /// `index` or the window elapses. Returns the metadata along with the
    /// last modify index reported by the server.
    async fn list(
        &self,
        prefix: &str,
        index: u64,
        wait: Option<Duration>,
    ) -> Result<(Vec<VariableMetadata>, u64), StoreError> {
        let mut req = self
            .request(reqwest::Method::GET, format!("{}/v1/vars", self.address))
            .query(&[("prefix", prefix)]);
        if let Some(wait) = wait {
            req = req.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", wait.as_secs())),
            ]);
        }

        let resp = check_status(req.send().await?).await?;

        let last_index = resp
            .headers()
            .get("X-Nomad-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let stubs: Vec<VariableMetadata> = resp.json().await?;
        Ok((stubs, last_index))
    }

    /// Reads a single variable. A missing path yields `None`.
    async fn read(&self, path: &str) -> Result<Option<Variable>, StoreError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                format!("{}/v1/var/{}", self.address, path),
            )
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        Ok(Some(resp.json().await?))
    }

    /// Upserts a variable. With `cas` set, the write only succeeds when the
    /// variable's current modify index matches; index 0 means create-only.
    async fn update(&self, variable: &Variable, cas: Option<u64>) -> Result<(), StoreError> {
        let mut req = self
            .request(
                reqwest::Method::PUT,
                format!("{}/v1/var/{}", self.address, variable.path),
            )
            .json(variable);
        if let Some(cas) = cas {
            req = req.query(&[("cas", cas.to_string())]);
        }

        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(StoreError::Conflict {
                path: variable.path.clone(),
            });
        }
        check_status(resp).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/v1/var/{}", self.address, path),
            )
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp).await?;
        Ok(())
    }

    /// Lightweight reachability probe. The leader endpoint needs no ACL and
    /// no payload handling, which makes it the cheapest health signal.
    pub async fn leader(&self) -> Result<(), StoreError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                format!("{}/v1/status/leader", self.address),
            )
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Variable-store backend. Networks live under
/// `<prefix>/networks/v1/<name>` and leases under
/// `<prefix>/subnets/v1/<network>/<client_id>`, each as a single JSON item.
pub struct NvarStore {
    client: Arc<VarsClient>,
    networks_path: String,
    subnets_path: String,
}

impl NvarStore {
    pub fn new(client: VarsClient, base_path: &str) -> NvarStore {
        let base = base_path.trim_end_matches('/');
        NvarStore {
            client: Arc::new(client),
            networks_path: format!("{base}/networks/{STORE_VERSION}"),
            subnets_path: format!("{base}/subnets/{STORE_VERSION}"),
        }
    }

    fn subnet_prefix(&self, network: &str) -> String {
        format!("{}/{}", self.subnets_path, network)
    }

    fn subnet_path(&self, network: &str, client_id: &str) -> String {
        format!("{}/{}/{}", self.subnets_path, network, client_id)
    }

    fn subnet_variable(&self, subnet: &Subnet) -> Result<Variable, StoreError> {
        let data = serde_json::to_string(subnet)?;
        Ok(Variable {
            path: self.subnet_path(&subnet.network_name, &subnet.client_id),
            items: HashMap::from([(ITEM_KEY.to_string(), data)]),
            modify_index: 0,
        })
    }
}

fn parse_item<T: serde::de::DeserializeOwned>(
    items: &HashMap<String, String>,
) -> Result<T, StoreError> {
    let data = items.get(ITEM_KEY).ok_or(StoreError::MissingItem(ITEM_KEY))?;
    Ok(serde_json::from_str(data)?)
}

/// Splits a batch of watched leases into live updates and expired records.
/// Expired leases are surfaced on the delete channel so observers tear down
/// their peer state before the record itself disappears.
fn partition_expired(subnets: Vec<Subnet>) -> (Vec<Subnet>, Vec<Subnet>) {
    subnets.into_iter().partition(|subnet| !subnet.expired)
}

#[async_trait]
impl Store for NvarStore {
    async fn list_networks(&self) -> Result<Vec<Network>, StoreError> {
        let (stubs, _) = self.client.list(&self.networks_path, 0, None).await?;

        let mut networks = Vec::with_capacity(stubs.len());
        for stub in stubs {
            match self.client.read(&stub.path).await? {
                Some(variable) => networks.push(parse_item(&variable.items)?),
                // Deleted between list and read; nothing to surface.
                None => continue,
            }
        }
        Ok(networks)
    }

    async fn list_subnets(&self, network: &str) -> Result<Vec<Subnet>, StoreError> {
        let prefix = self.subnet_prefix(network);
        let (stubs, _) = self.client.list(&prefix, 0, None).await?;

        let mut subnets = Vec::with_capacity(stubs.len());
        for stub in stubs {
            match self.client.read(&stub.path).await? {
                Some(variable) => subnets.push(parse_item(&variable.items)?),
                None => continue,
            }
        }
        Ok(subnets)
    }

    async fn get_subnet(
        &self,
        network: &str,
        client_id: &str,
    ) -> Result<Option<Subnet>, StoreError> {
        let path = self.subnet_path(network, client_id);
        match self.client.read(&path).await? {
            Some(variable) => Ok(Some(parse_item(&variable.items)?)),
            None => Ok(None),
        }
    }

    async fn set_subnet(&self, subnet: &Subnet) -> Result<(), StoreError> {
        let variable = self.subnet_variable(subnet)?;
        self.client.update(&variable, None).await
    }

    async fn create_subnet(&self, subnet: &Subnet) -> Result<(), StoreError> {
        let variable = self.subnet_variable(subnet)?;
        self.client.update(&variable, Some(0)).await
    }

    async fn delete_subnet(&self, network: &str, client_id: &str) -> Result<(), StoreError> {
        let path = self.subnet_path(network, client_id);
        self.client.delete(&path).await
    }

    async fn watch_subnets(
        &self,
        network: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SubnetWatch, StoreError> {
        let (modify_tx, modify_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (delete_tx, delete_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let client = Arc::clone(&self.client);
        let prefix = self.subnet_prefix(network);

        tokio::spawn(async move {
            // Index 0 makes the first list return immediately, delivering the
            // current population as the initial modify batch.
            let mut wait_index: u64 = 0;

            loop {
                let result = tokio::select! {
                    _ = shutdown.recv() => return,
                    result = client.list(&prefix, wait_index, Some(WATCH_WAIT)) => result,
                };

                let (stubs, last_index) = match result {
                    Ok(listed) => listed,
                    Err(err) => {
                        if error_tx.send(err).await.is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = tokio::time::sleep(WATCH_ERROR_BACKOFF) => {}
                        }
                        continue;
                    }
                };

                // The wait window elapsed without any change under the
                // prefix; nothing to emit.
                if last_index <= wait_index {
                    continue;
                }

                let mut subnets = Vec::new();
                for stub in stubs.iter().filter(|s| s.modify_index >= wait_index) {
                    match client.read(&stub.path).await {
                        Ok(Some(variable)) => match parse_item::<Subnet>(&variable.items) {
                            Ok(subnet) => subnets.push(subnet),
                            Err(err) => {
                                if error_tx.send(err).await.is_err() {
                                    return;
                                }
                            }
                        },
                        Ok(None) => continue,
                        Err(err) => {
                            if error_tx.send(err).await.is_err() {
                                return;
                            }
                        }
                    }
                }

                let (modified, expired) = partition_expired(subnets);
                if !expired.is_empty() && delete_tx.send(expired).await.is_err() {
                    return;
                }
                if !modified.is_empty() && modify_tx.send(modified).await.is_err() {
                    return;
                }

                wait_index = last_index;
            }
        });

        Ok(SubnetWatch {
            modify: modify_rx,
            delete: delete_rx,
            errors: error_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_subnet(client_id: &str, expired: bool) -> Subnet {
        Subnet {
            client_id: client_id.to_string(),
            network_name: "v".to_string(),
            provider: "vxlan".to_string(),
            host_ipv4: Some("192.168.10.20".parse().unwrap()),
            config: None,
            expiration: Utc::now(),
            expired,
            ipv4_network: Some("10.10.5.0/24".parse().unwrap()),
            mtu: 1450,
        }
    }

    fn test_store() -> NvarStore {
        let client = VarsClient::new("http://127.0.0.1:4646", None).unwrap();
        NvarStore::new(client, "weft/")
    }

    #[test]
    fn paths_are_versioned_and_prefix_scoped() {
        let store = test_store();
        assert_eq!(store.networks_path, "weft/networks/v1");
        assert_eq!(store.subnet_prefix("v"), "weft/subnets/v1/v");
        assert_eq!(store.subnet_path("v", "client-1"), "weft/subnets/v1/v/client-1");
    }

    #[test]
    fn subnet_variable_encodes_under_data_item() {
        let store = test_store();
        let variable = store.subnet_variable(&test_subnet("client-1", false)).unwrap();

        assert_eq!(variable.path, "weft/subnets/v1/v/client-1");
        let decoded: Subnet = serde_json::from_str(&variable.items[ITEM_KEY]).unwrap();
        assert_eq!(decoded.client_id, "client-1");
    }

    #[test]
    fn parse_item_requires_data_key() {
        let items = HashMap::from([("other".to_string(), "{}".to_string())]);
        assert!(matches!(
            parse_item::<Subnet>(&items),
            Err(StoreError::MissingItem(ITEM_KEY))
        ));
    }

    #[test]
    fn partition_routes_expired_to_delete() {
        let batch = vec![
            test_subnet("a", false),
            test_subnet("b", true),
            test_subnet("c", false),
        ];
        let (modified, expired) = partition_expired(batch);

        assert_eq!(
            modified.iter().map(|s| s.client_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(
            expired.iter().map(|s| s.client_id.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
    }

    #[test]
    fn variable_decodes_api_shape() {
        let raw = r#"{
            "Path": "weft/subnets/v1/v/client-1",
            "Items": {"data": "{}"},
            "CreateIndex": 41,
            "ModifyIndex": 44
        }"#;
        let variable: Variable = serde_json::from_str(raw).unwrap();
        assert_eq!(variable.modify_index, 44);
        assert_eq!(variable.items[ITEM_KEY], "{}");
    }
}
