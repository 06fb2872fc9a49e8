//! Master version updates.
//!
//! A version bump on a Running cluster moves it to UpdatingMaster. The
//! controller keeps re-ensuring the control plane at the new version until
//! the hyperkube Deployments completed their rollout, then records the
//! version as deployed and returns to Running. An update that does not
//! finish within the timeout is rolled back to the last deployed version;
//! if the rollback itself times out the cluster fails terminally.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::Deployment;

use kubermatic_common::crd::Cluster;
use kubermatic_common::Result;

use crate::client::ObjectStore;
use crate::resources::{
    ClusterData, APISERVER_DEPLOYMENT_NAME, CONTROLLER_MANAGER_DEPLOYMENT_NAME,
    SCHEDULER_DEPLOYMENT_NAME,
};

const UPDATE_TIMEOUT_MINUTES: i64 = 30;

/// Whether the spec asks for a different master version than the one that
/// last reached Running. False for clusters that never deployed.
pub fn pending_version_change(cluster: &Cluster) -> bool {
    let Some(status) = &cluster.status else {
        return false;
    };
    !status.last_deployed_master_version.is_empty()
        && status.last_deployed_master_version != cluster.spec.master_version
}

fn rollout_complete(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = &deployment.status else {
        return false;
    };
    if status.observed_generation < deployment.metadata.generation {
        return false;
    }
    status.updated_replicas.unwrap_or(0) >= desired && status.ready_replicas.unwrap_or(0) >= desired
}

fn at_version(deployment: &Deployment, version: &str) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref())
        .map(|image| image.ends_with(&format!(":v{version}")))
        .unwrap_or(false)
}

/// Whether every versioned control plane Deployment finished rolling out
/// the wanted master version.
pub async fn master_update_done(
    data: &ClusterData,
    deployments: &dyn ObjectStore<Deployment>,
) -> Result<bool> {
    for name in [
        APISERVER_DEPLOYMENT_NAME,
        CONTROLLER_MANAGER_DEPLOYMENT_NAME,
        SCHEDULER_DEPLOYMENT_NAME,
    ] {
        let Some(deployment) = deployments.get(data.namespace(), name).await? else {
            return Ok(false);
        };
        if !at_version(&deployment, data.version()) || !rollout_complete(&deployment) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether the update has been running longer than the timeout, measured
/// against the phase transition into UpdatingMaster.
pub fn update_timed_out(cluster: &Cluster, now: DateTime<Utc>) -> bool {
    let Some(started) = cluster.status.as_ref().and_then(|s| s.last_transition_time) else {
        return false;
    };
    now - started >= Duration::minutes(UPDATE_TIMEOUT_MINUTES)
}

/// Version to roll back to, `None` when the rollback already happened (the
/// spec matches the last deployed version) and the only option left is
/// failing the cluster.
pub fn rollback_target(cluster: &Cluster) -> Option<String> {
    let status = cluster.status.as_ref()?;
    if status.last_deployed_master_version.is_empty()
        || status.last_deployed_master_version == cluster.spec.master_version
    {
        return None;
    }
    Some(status.last_deployed_master_version.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kubermatic_common::crd::ClusterStatus;

    use crate::client::MockObjectStore;

    fn versioned_deployment(version: &str, ready: bool) -> Deployment {
        let mut deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            image: Some(format!("k8s.gcr.io/hyperkube-amd64:v{version}")),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        deployment.metadata.generation = Some(2);
        deployment.status = Some(DeploymentStatus {
            observed_generation: Some(2),
            updated_replicas: Some(if ready { 1 } else { 0 }),
            ready_replicas: Some(1),
            ..Default::default()
        });
        deployment
    }

    fn cluster_updating(spec_version: &str, deployed: &str) -> Cluster {
        let mut cluster = Cluster::new("fqpcvnc6v", Default::default());
        cluster.spec.master_version = spec_version.to_string();
        cluster.status = Some(ClusterStatus {
            last_deployed_master_version: deployed.to_string(),
            last_transition_time: Some(Utc::now()),
            ..Default::default()
        });
        cluster
    }

    #[test]
    fn test_version_change_needs_a_deployed_baseline() {
        assert!(pending_version_change(&cluster_updating("1.13.0", "1.12.3")));
        assert!(!pending_version_change(&cluster_updating("1.12.3", "1.12.3")));
        // First launch: nothing deployed yet, Launching handles it.
        assert!(!pending_version_change(&cluster_updating("1.13.0", "")));
    }

    #[tokio::test]
    async fn test_update_done_requires_new_version_rolled_out() {
        let mut data = ClusterData::for_testing();
        data.cluster.spec.master_version = "1.13.0".to_string();

        // Old version still serving.
        let mut stale = MockObjectStore::<Deployment>::new();
        stale
            .expect_get()
            .returning(|_, _| Ok(Some(versioned_deployment("1.12.3", true))));
        assert!(!master_update_done(&data, &stale).await.unwrap());

        // New version present but rollout unfinished.
        let mut rolling = MockObjectStore::<Deployment>::new();
        rolling
            .expect_get()
            .returning(|_, _| Ok(Some(versioned_deployment("1.13.0", false))));
        assert!(!master_update_done(&data, &rolling).await.unwrap());

        let mut done = MockObjectStore::<Deployment>::new();
        done.expect_get()
            .returning(|_, _| Ok(Some(versioned_deployment("1.13.0", true))));
        assert!(master_update_done(&data, &done).await.unwrap());
    }

    #[test]
    fn test_timeout_measured_from_phase_transition() {
        let mut cluster = cluster_updating("1.13.0", "1.12.3");
        let now = Utc::now();

        assert!(!update_timed_out(&cluster, now));
        if let Some(status) = cluster.status.as_mut() {
            status.last_transition_time = Some(now - Duration::minutes(31));
        }
        assert!(update_timed_out(&cluster, now));
    }

    #[test]
    fn test_rollback_happens_at_most_once() {
        let cluster = cluster_updating("1.13.0", "1.12.3");
        assert_eq!(rollback_target(&cluster), Some("1.12.3".to_string()));

        // Spec already rolled back: the next timeout is terminal.
        let rolled_back = cluster_updating("1.12.3", "1.12.3");
        assert_eq!(rollback_target(&rolled_back), None);
    }
}
