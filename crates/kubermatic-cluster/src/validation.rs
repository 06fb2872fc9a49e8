//! Cluster spec validation run while a cluster is in the Validating phase.
//!
//! Failures here never move the phase. They surface through
//! `status.error_reason = InvalidConfiguration` and clear on their own once
//! the spec or the datacenter file is fixed.

use std::collections::HashMap;

use kubermatic_common::crd::Cluster;
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_common::{Error, Result};

use crate::provider::CloudRegistry;

/// Full validation: structural spec checks, datacenter topology checks and
/// the provider's own access data validation.
pub async fn validate_cluster(
    cluster: &Cluster,
    datacenters: &HashMap<String, DatacenterMeta>,
    providers: &CloudRegistry,
) -> Result<()> {
    let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
    cluster.spec.validate()?;

    let datacenter_name = &cluster.spec.cloud.datacenter_name;
    let datacenter = datacenters.get(datacenter_name).ok_or_else(|| {
        Error::validation_for_field(
            cluster_name,
            "cloud.dc",
            format!("unknown datacenter {datacenter_name:?}"),
        )
    })?;
    if datacenter.is_seed {
        return Err(Error::validation_for_field(
            cluster_name,
            "cloud.dc",
            format!("datacenter {datacenter_name:?} is a seed, not a node datacenter"),
        ));
    }

    let seed = datacenters.get(&datacenter.seed).ok_or_else(|| {
        Error::validation_for(
            cluster_name,
            format!(
                "datacenter {:?} references unknown seed {:?}",
                datacenter_name, datacenter.seed
            ),
        )
    })?;
    if !seed.is_seed {
        return Err(Error::validation_for(
            cluster_name,
            format!(
                "datacenter {:?} of {:?} is not marked as a seed",
                datacenter.seed, datacenter_name
            ),
        ));
    }

    let provider = providers.for_cluster(cluster)?;
    if let Some(dc_provider) = datacenter.provider_name() {
        if dc_provider != provider.name() {
            return Err(Error::validation_for(
                cluster_name,
                format!(
                    "cluster uses provider {:?} but datacenter {:?} is a {:?} datacenter",
                    provider.name(),
                    datacenter_name,
                    dc_provider
                ),
            ));
        }
    }

    provider.validate(&cluster.spec.cloud).await
}
