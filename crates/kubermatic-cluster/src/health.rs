//! Control plane health assessment.
//!
//! Health is read directly from the live Deployments and the etcd
//! StatefulSet on the seed. A component is healthy when its workload
//! reports at least the desired number of ready replicas; an absent
//! workload is unhealthy, never an error.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};

use kubermatic_common::crd::ClusterHealth;
use kubermatic_common::Result;

use crate::client::ObjectStore;
use crate::resources::{
    ClusterData, APISERVER_DEPLOYMENT_NAME, CONTROLLER_MANAGER_DEPLOYMENT_NAME,
    ETCD_STATEFUL_SET_NAME, MACHINE_CONTROLLER_DEPLOYMENT_NAME, SCHEDULER_DEPLOYMENT_NAME,
};

fn deployment_ready(deployment: Option<Deployment>) -> bool {
    let Some(deployment) = deployment else {
        return false;
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

fn stateful_set_ready(stateful_set: Option<StatefulSet>) -> bool {
    let Some(stateful_set) = stateful_set else {
        return false;
    };
    let desired = stateful_set
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = stateful_set
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

/// Read the current health of every control plane component.
///
/// `last_transition_time` is carried over from the previous health and only
/// bumped when any component flag flipped.
pub async fn cluster_health(
    data: &ClusterData,
    deployments: &dyn ObjectStore<Deployment>,
    stateful_sets: &dyn ObjectStore<StatefulSet>,
    now: DateTime<Utc>,
) -> Result<ClusterHealth> {
    let namespace = data.namespace();
    let previous = data
        .cluster
        .status
        .as_ref()
        .map(|s| s.health.clone())
        .unwrap_or_default();

    let mut health = ClusterHealth {
        apiserver: deployment_ready(deployments.get(namespace, APISERVER_DEPLOYMENT_NAME).await?),
        controller: deployment_ready(
            deployments
                .get(namespace, CONTROLLER_MANAGER_DEPLOYMENT_NAME)
                .await?,
        ),
        scheduler: deployment_ready(deployments.get(namespace, SCHEDULER_DEPLOYMENT_NAME).await?),
        machine_controller: deployment_ready(
            deployments
                .get(namespace, MACHINE_CONTROLLER_DEPLOYMENT_NAME)
                .await?,
        ),
        etcd: stateful_set_ready(stateful_sets.get(namespace, ETCD_STATEFUL_SET_NAME).await?),
        last_transition_time: previous.last_transition_time,
    };

    let flipped = health.apiserver != previous.apiserver
        || health.controller != previous.controller
        || health.scheduler != previous.scheduler
        || health.machine_controller != previous.machine_controller
        || health.etcd != previous.etcd;
    if flipped || health.last_transition_time.is_none() {
        health.last_transition_time = Some(now);
    }

    Ok(health)
}
