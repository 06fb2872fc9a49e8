//! Address synchronization: admin token, external DNS name, resolved IP
//! and the apiserver URL derived from the external Service's NodePort.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Service;

use kubermatic_common::crd::ClusterAddress;
use kubermatic_common::datacenter::{seed_dns_name, DatacenterMeta};
use kubermatic_common::{Error, Result};

use crate::client::{DnsResolver, ObjectStore};
use crate::pki;
use crate::resources::{ClusterData, APISERVER_EXTERNAL_SERVICE_NAME};

/// Compute the cluster's current address. Returns `Some` with the full new
/// address when any field changed, `None` when the stored address is
/// already up to date.
///
/// The admin token is generated exactly once. The external name and IP are
/// re-derived every sync so DNS moves propagate. The URL needs the external
/// Service's NodePort; before that Service exists the other fields still
/// sync and the URL stays empty.
pub async fn sync_address(
    data: &ClusterData,
    datacenters: &HashMap<String, DatacenterMeta>,
    resolver: &dyn DnsResolver,
    services: &dyn ObjectStore<Service>,
) -> Result<Option<ClusterAddress>> {
    let mut address = data.address();

    if address.admin_token.is_empty() {
        address.admin_token = pki::generate_admin_token();
    }

    address.external_name = external_name(data, datacenters);

    let ips = resolver.lookup_ipv4(&address.external_name).await?;
    match ips.first() {
        Some(ip) => address.ip = ip.to_string(),
        None => {
            return Err(Error::dns(
                address.external_name.clone(),
                "host resolves to no IPv4 address",
            ));
        }
    }

    if let Some(node_port) = external_node_port(data, services).await? {
        address.url = format!("https://{}:{}", address.external_name, node_port);
    }

    if address == data.address() {
        return Ok(None);
    }
    Ok(Some(address))
}

/// `<cluster>.<seed DNS name>.<external base URL>`, where the seed DNS name
/// honors the seed's `seed_dns_overwrite`.
fn external_name(data: &ClusterData, datacenters: &HashMap<String, DatacenterMeta>) -> String {
    let seed_name = data.seed_name.as_str();
    let dns = match datacenters.get(seed_name) {
        Some(seed) => seed_dns_name(seed_name, seed),
        None => seed_name,
    };
    format!(
        "{}.{}.{}",
        data.cluster_name(),
        dns,
        data.config.external_url
    )
}

async fn external_node_port(
    data: &ClusterData,
    services: &dyn ObjectStore<Service>,
) -> Result<Option<i32>> {
    let service = services
        .get(data.namespace(), APISERVER_EXTERNAL_SERVICE_NAME)
        .await?;
    Ok(service
        .and_then(|s| s.spec)
        .and_then(|spec| spec.ports)
        .and_then(|ports| ports.into_iter().next())
        .and_then(|port| port.node_port))
}
