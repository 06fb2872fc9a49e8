//! DigitalOcean provider.
//!
//! Droplet provisioning is the machine-controller's job; the control plane
//! side only needs to check that the access token is present and that the
//! referenced datacenter actually is a DigitalOcean region.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use kubermatic_common::crd::{CloudSpec, Cluster};
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_common::{Error, Result};

use super::CloudProvider;

pub struct DigitaloceanProvider {
    datacenters: Arc<HashMap<String, DatacenterMeta>>,
}

impl DigitaloceanProvider {
    pub fn new(datacenters: Arc<HashMap<String, DatacenterMeta>>) -> Self {
        Self { datacenters }
    }
}

#[async_trait]
impl CloudProvider for DigitaloceanProvider {
    fn name(&self) -> &'static str {
        "digitalocean"
    }

    async fn validate(&self, spec: &CloudSpec) -> Result<()> {
        let Some(digitalocean) = &spec.digitalocean else {
            return Err(Error::validation("no digitalocean cloud spec set"));
        };
        if digitalocean.token.is_empty() {
            return Err(Error::validation("no digitalocean token set"));
        }

        let datacenter = self.datacenters.get(&spec.datacenter_name).ok_or_else(|| {
            Error::validation(format!(
                "unknown datacenter {:?}",
                spec.datacenter_name
            ))
        })?;
        let Some(region) = &datacenter.spec.digitalocean else {
            return Err(Error::validation(format!(
                "datacenter {:?} is not a digitalocean datacenter",
                spec.datacenter_name
            )));
        };
        if region.region.is_empty() {
            return Err(Error::validation(format!(
                "datacenter {:?} has no region configured",
                spec.datacenter_name
            )));
        }
        Ok(())
    }

    async fn initialize_cloud_provider(&self, _cluster: &Cluster) -> Result<Option<CloudSpec>> {
        Ok(None)
    }

    async fn cleanup_cloud_provider(&self, _cluster: &Cluster) -> Result<()> {
        Ok(())
    }

    fn validate_update(&self, old: &CloudSpec, new: &CloudSpec) -> Result<()> {
        if old.datacenter_name != new.datacenter_name {
            return Err(Error::validation(format!(
                "changing the datacenter is not supported ({} -> {})",
                old.datacenter_name, new.datacenter_name
            )));
        }
        // Token rotation is allowed, removal is not.
        match &new.digitalocean {
            Some(digitalocean) if !digitalocean.token.is_empty() => Ok(()),
            Some(_) => Err(Error::validation("digitalocean token cannot be removed")),
            None => Err(Error::validation(
                "changing the cloud provider is not supported",
            )),
        }
    }
}
