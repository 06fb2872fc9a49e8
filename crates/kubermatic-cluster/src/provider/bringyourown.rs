//! Provider for clusters whose nodes are provisioned by hand.

use async_trait::async_trait;

use kubermatic_common::crd::{CloudSpec, Cluster};
use kubermatic_common::{Error, Result};

use super::CloudProvider;

/// No cloud API involved. Validation only checks the section is present;
/// initialization and cleanup have nothing to do.
pub struct BringYourOwnProvider;

#[async_trait]
impl CloudProvider for BringYourOwnProvider {
    fn name(&self) -> &'static str {
        "bringyourown"
    }

    async fn validate(&self, spec: &CloudSpec) -> Result<()> {
        if spec.bringyourown.is_none() {
            return Err(Error::validation("no bringyourown cloud spec set"));
        }
        Ok(())
    }

    async fn initialize_cloud_provider(&self, _cluster: &Cluster) -> Result<Option<CloudSpec>> {
        Ok(None)
    }

    async fn cleanup_cloud_provider(&self, _cluster: &Cluster) -> Result<()> {
        Ok(())
    }
}
