//! Cloud provider capability seam.
//!
//! The lifecycle controller never talks to a cloud SDK directly. Each
//! provider implements [`CloudProvider`] and the controller picks one per
//! cluster from the [`CloudRegistry`] based on which section of the
//! `CloudSpec` union is set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use kubermatic_common::crd::{CloudSpec, Cluster};
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_common::{Error, Result};

mod bringyourown;
mod digitalocean;
mod fake;

pub use bringyourown::BringYourOwnProvider;
pub use digitalocean::DigitaloceanProvider;
pub use fake::FakeProvider;

/// Provider-side operations the cluster lifecycle needs. Validation runs
/// before any resources are built, initialization once before launching,
/// cleanup during deletion while the cloud finalizer is present.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider key, matching the section name in `CloudSpec`.
    fn name(&self) -> &'static str;

    /// Check the access data in the spec.
    async fn validate(&self, spec: &CloudSpec) -> Result<()>;

    /// One-time provider-side setup. Returns the updated cloud spec when
    /// the provider wrote access data into it, for the caller to persist.
    async fn initialize_cloud_provider(&self, cluster: &Cluster) -> Result<Option<CloudSpec>>;

    /// Tear down whatever `initialize_cloud_provider` set up.
    async fn cleanup_cloud_provider(&self, cluster: &Cluster) -> Result<()>;

    /// Reject spec changes the controller refuses to act on.
    fn validate_update(&self, old: &CloudSpec, new: &CloudSpec) -> Result<()> {
        if old.datacenter_name != new.datacenter_name {
            return Err(Error::validation(format!(
                "changing the datacenter is not supported ({} -> {})",
                old.datacenter_name, new.datacenter_name
            )));
        }
        if old.provider_names() != new.provider_names() {
            return Err(Error::validation(
                "changing the cloud provider is not supported",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for dyn CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudProvider")
            .field("name", &self.name())
            .finish()
    }
}

/// All known providers, keyed by their `CloudSpec` section name.
pub struct CloudRegistry {
    providers: HashMap<&'static str, Arc<dyn CloudProvider>>,
}

impl CloudRegistry {
    /// Registry with the built-in providers.
    pub fn with_defaults(datacenters: Arc<HashMap<String, DatacenterMeta>>) -> Self {
        let all: Vec<Arc<dyn CloudProvider>> = vec![
            Arc::new(FakeProvider),
            Arc::new(BringYourOwnProvider),
            Arc::new(DigitaloceanProvider::new(datacenters)),
        ];
        Self {
            providers: all.into_iter().map(|p| (p.name(), p)).collect(),
        }
    }

    /// Empty registry, populated through [`CloudRegistry::register`].
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Add or replace a provider.
    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CloudProvider>> {
        self.providers.get(name).cloned()
    }

    /// Resolve the provider responsible for a cluster. Exactly one section
    /// of the cloud spec must be set and it must name a known provider.
    pub fn for_cluster(&self, cluster: &Cluster) -> Result<Arc<dyn CloudProvider>> {
        let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
        let name = cluster.spec.cloud.provider_name().ok_or_else(|| {
            Error::validation_for(cluster_name, "exactly one cloud provider section must be set")
        })?;
        self.get(name).ok_or_else(|| {
            Error::validation_for(cluster_name, format!("unsupported cloud provider {name:?}"))
        })
    }
}

impl Default for CloudRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubermatic_common::crd::{AwsCloudSpec, DigitaloceanCloudSpec};

    fn registry() -> CloudRegistry {
        CloudRegistry::with_defaults(Arc::new(HashMap::new()))
    }

    fn cluster_with_cloud(cloud: CloudSpec) -> Cluster {
        let mut cluster = Cluster::new("fqpcvnc6v", Default::default());
        cluster.spec.cloud = cloud;
        cluster
    }

    #[test]
    fn test_registry_resolves_by_spec_section() {
        let cluster = cluster_with_cloud(CloudSpec {
            datacenter_name: "do-ams2".to_string(),
            digitalocean: Some(DigitaloceanCloudSpec {
                token: "dop_v1_sample".to_string(),
            }),
            ..Default::default()
        });

        let provider = registry().for_cluster(&cluster).unwrap();
        assert_eq!(provider.name(), "digitalocean");
    }

    #[test]
    fn test_registry_rejects_unknown_providers() {
        let cluster = cluster_with_cloud(CloudSpec {
            datacenter_name: "aws-eu-west-1a".to_string(),
            aws: Some(AwsCloudSpec::default()),
            ..Default::default()
        });

        let err = registry().for_cluster(&cluster).unwrap_err();
        assert!(err.to_string().contains("unsupported cloud provider"));
    }

    #[test]
    fn test_registry_rejects_ambiguous_specs() {
        let cluster = cluster_with_cloud(CloudSpec {
            datacenter_name: "do-ams2".to_string(),
            digitalocean: Some(DigitaloceanCloudSpec {
                token: "dop_v1_sample".to_string(),
            }),
            bringyourown: Some(Default::default()),
            ..Default::default()
        });

        assert!(registry().for_cluster(&cluster).is_err());
    }

    #[test]
    fn test_update_validation_pins_datacenter_and_provider() {
        let provider = BringYourOwnProvider;
        let old = CloudSpec {
            datacenter_name: "byo-hamburg".to_string(),
            bringyourown: Some(Default::default()),
            ..Default::default()
        };

        let mut moved = old.clone();
        moved.datacenter_name = "byo-frankfurt".to_string();
        assert!(provider.validate_update(&old, &moved).is_err());

        let mut switched = old.clone();
        switched.bringyourown = None;
        switched.digitalocean = Some(DigitaloceanCloudSpec {
            token: "dop_v1_sample".to_string(),
        });
        assert!(provider.validate_update(&old, &switched).is_err());

        assert!(provider.validate_update(&old, &old.clone()).is_ok());
    }
}
