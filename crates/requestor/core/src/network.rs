//! Virtual network overlay
//!
//! Addresses are handed out from a fixed IPv4 range; the network and
//! broadcast addresses and the gateway are never assigned. Asking for more
//! nodes than the range holds fails with `NetworkFull`.

use crate::error::{ApiError, RequestorError, RequestorResult};
use crate::session::Session;
use requestor_types::{LifecycleState, NetworkData, NetworkState, ResourceData, ResourceKind};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Node id under which the requestor's own address is recorded
pub const REQUESTOR_NODE: &str = "requestor";

resource_handle!(
    /// Virtual network joining the requestor and its providers
    Network,
    ResourceKind::Network,
    Network,
    NetworkData
);

/// Parse `a.b.c.d/len` into the network address and mask.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr), ApiError> {
    let invalid = || ApiError::Decode(format!("invalid network address: {}", cidr));
    let (ip, len) = cidr.split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = ip.trim().parse().map_err(|_| invalid())?;
    let len: u32 = len.trim().parse().map_err(|_| invalid())?;
    if len > 30 {
        return Err(invalid());
    }
    let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
    Ok((Ipv4Addr::from(u32::from(ip) & mask), Ipv4Addr::from(mask)))
}

fn host_range(ip: Ipv4Addr, mask: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let network = u32::from(ip) & u32::from(mask);
    let broadcast = network | !u32::from(mask);
    (network + 1..broadcast).map(Ipv4Addr::from)
}

impl Network {
    /// Create a network spanning `cidr`.
    pub async fn create(session: &Session, cidr: &str, gateway: Option<Ipv4Addr>) -> RequestorResult<Self> {
        session.ensure_open()?;
        let (ip, mask) = parse_cidr(cidr)?;
        let id = session.api().create_network(ip, mask, gateway).await?;
        let data = NetworkData {
            network_id: id.clone(),
            ip,
            mask,
            gateway,
            nodes: BTreeMap::new(),
        };
        let node = session.get_or_create(ResourceKind::Network, id, None, Some(ResourceData::Network(data)));
        info!(network_id = %node.resource().id, %cidr, "Network created");
        Ok(Self::from_node(node, session.clone()))
    }

    fn snapshot(&self) -> RequestorResult<NetworkData> {
        match self.node.cached_data().as_deref() {
            Some(ResourceData::Network(data)) => Ok(data.clone()),
            _ => Err(RequestorError::precondition(self.resource(), "network has no data")),
        }
    }

    fn ensure_active(&self) -> RequestorResult<()> {
        if self.state() == LifecycleState::Network(NetworkState::Removed) {
            return Err(RequestorError::precondition(self.resource(), "network removed"));
        }
        Ok(())
    }

    /// Addresses currently assigned, by node id
    pub fn nodes(&self) -> BTreeMap<String, Ipv4Addr> {
        self.snapshot().map(|d| d.nodes).unwrap_or_default()
    }

    async fn assign(&self, node_id: &str, requested: Option<Ipv4Addr>) -> RequestorResult<Ipv4Addr> {
        self.ensure_active()?;
        let _guard = self.node.lock().await;
        let data = self.snapshot()?;
        if let Some(ip) = data.nodes.get(node_id) {
            return Ok(*ip);
        }

        let taken = |ip: &Ipv4Addr| data.gateway == Some(*ip) || data.nodes.values().any(|n| n == ip);
        let ip = match requested {
            Some(ip) if taken(&ip) => {
                return Err(RequestorError::precondition(
                    self.resource(),
                    format!("address {} already assigned", ip),
                ))
            }
            Some(ip) => ip,
            None => host_range(data.ip, data.mask)
                .find(|ip| !taken(ip))
                .ok_or_else(|| RequestorError::NetworkFull {
                    network_id: self.id().clone(),
                })?,
        };

        if node_id == REQUESTOR_NODE {
            self.session.api().add_requestor_address(self.id(), ip).await?;
        } else {
            self.session.api().add_network_node(self.id(), node_id, ip).await?;
        }

        let key = node_id.to_string();
        self.node.modify_data(|d| match d {
            ResourceData::Network(net) => {
                net.nodes.insert(key, ip);
                true
            }
            _ => false,
        });
        debug!(network_id = %self.id(), node_id, %ip, "Network node added");
        Ok(ip)
    }

    /// Add a provider node at the next free address.
    pub async fn create_node(&self, provider_id: &str) -> RequestorResult<Ipv4Addr> {
        self.assign(provider_id, None).await
    }

    /// Give the requestor an address, the next free one unless `ip` is set.
    pub async fn add_requestor_ip(&self, ip: Option<Ipv4Addr>) -> RequestorResult<Ipv4Addr> {
        self.assign(REQUESTOR_NODE, ip).await
    }

    /// Deploy arguments connecting an activity at `ip` to this network.
    pub fn deploy_args(&self, ip: Ipv4Addr) -> RequestorResult<Value> {
        let data = self.snapshot()?;
        let nodes: BTreeMap<String, String> = data
            .nodes
            .iter()
            .map(|(id, addr)| (addr.to_string(), id.clone()))
            .collect();
        Ok(json!({
            "net": [{
                "id": data.network_id,
                "ip": data.ip.to_string(),
                "mask": data.mask.to_string(),
                "nodeIp": ip.to_string(),
                "nodes": nodes,
            }]
        }))
    }

    pub async fn remove(&self) -> RequestorResult<()> {
        self.ensure_active()?;
        match self.session.api().remove_network(self.id()).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.session.update_state(&self.node, |_| {
            Some(LifecycleState::Network(NetworkState::Removed))
        });
        info!(network_id = %self.id(), "Network removed");
        Ok(())
    }
}
