//! Synthetic provider for development and tests.

use async_trait::async_trait;

use kubermatic_common::crd::{CloudSpec, Cluster};
use kubermatic_common::{Error, Result};

use super::CloudProvider;

/// Provider that accepts any spec and hands out a synthetic token on first
/// contact, exercising the spec write-back path without a cloud API.
pub struct FakeProvider;

#[async_trait]
impl CloudProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn validate(&self, spec: &CloudSpec) -> Result<()> {
        if spec.fake.is_none() {
            return Err(Error::validation("no fake cloud spec set"));
        }
        Ok(())
    }

    async fn initialize_cloud_provider(&self, cluster: &Cluster) -> Result<Option<CloudSpec>> {
        let Some(fake) = &cluster.spec.cloud.fake else {
            return Err(Error::validation("no fake cloud spec set"));
        };
        if !fake.token.is_empty() {
            return Ok(None);
        }

        let mut updated = cluster.spec.cloud.clone();
        if let Some(fake) = updated.fake.as_mut() {
            fake.token = format!(
                "fake-token-{}",
                cluster.metadata.name.as_deref().unwrap_or_default()
            );
        }
        Ok(Some(updated))
    }

    async fn cleanup_cloud_provider(&self, _cluster: &Cluster) -> Result<()> {
        Ok(())
    }
}
