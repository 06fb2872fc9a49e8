//! Cloud-config ConfigMap consumed by the control plane components that
//! talk to the cloud provider. Providers without an in-tree integration
//! (fake, bringyourown, digitalocean, hetzner) get an empty file.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use kubermatic_common::Result;

use crate::resources::{set_object_meta, ClusterData, CLOUD_CONFIG_CONFIG_MAP_NAME};

/// ConfigMap data key for the rendered cloud config.
pub const CLOUD_CONFIG_KEY: &str = "config";

fn cloud_config_content(data: &ClusterData) -> String {
    let cloud = &data.cluster.spec.cloud;
    if let Some(aws) = &cloud.aws {
        return format!(
            "[global]\n\
             Zone={}\n\
             VPC={}\n\
             SubnetID={}\n\
             RouteTableID={}\n\
             KubernetesClusterID={}\n\
             DisableSecurityGroupIngress=false\n\
             DisableStrictZoneCheck=true\n",
            aws.availability_zone,
            aws.vpc_id,
            aws.subnet_id,
            aws.route_table_id,
            data.cluster_name(),
        );
    }
    if let Some(openstack) = &cloud.openstack {
        return format!(
            "[Global]\n\
             username={}\n\
             password={}\n\
             tenant-name={}\n\
             domain-name={}\n\
             [LoadBalancer]\n\
             floating-network-id={}\n",
            openstack.username,
            openstack.password,
            openstack.tenant,
            openstack.domain,
            openstack.floating_ip_pool,
        );
    }
    String::new()
}

/// Build the cloud-config ConfigMap.
pub fn config_map(data: &ClusterData, existing: Option<&ConfigMap>) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut config_map.metadata,
        data,
        CLOUD_CONFIG_CONFIG_MAP_NAME,
        "cloud-config",
    );

    config_map.data = Some(BTreeMap::from([(
        CLOUD_CONFIG_KEY.to_string(),
        cloud_config_content(data),
    )]));
    Ok(config_map)
}
