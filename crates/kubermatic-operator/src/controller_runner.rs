//! Controller runner - builds controller futures for each vertical slice
//!
//! Each `build_*` function returns a Vec of boxed futures that can be
//! composed by the caller. This keeps controller construction pure and
//! testable.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kubermatic_cluster::controller as cluster_ctrl;
use kubermatic_cluster::resources::ControllerConfig;
use kubermatic_common::crd::{Cluster, Project, User, UserProjectBinding, UserSSHKey};
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_monitoring::controller as monitoring_ctrl;
use kubermatic_rbac::project_controller as rbac_project;
use kubermatic_rbac::resource_controller as rbac_resource;
use kubermatic_rbac::{ClusterProvider, OrphanPolicy};

/// Watcher timeout (seconds) - must be less than the client read timeout
/// (30s) so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watch_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the cluster lifecycle controller future
pub fn build_cluster_controllers(
    client: Client,
    config: ControllerConfig,
    datacenters: Arc<HashMap<String, DatacenterMeta>>,
    worker_name: String,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(
        cluster_ctrl::Context::builder(&client, datacenters)
            .config(config)
            .worker_name(worker_name)
            .build(),
    );
    let clusters: Api<Cluster> = Api::all(client);

    tracing::info!("- Cluster controller");

    vec![Box::pin(
        Controller::new(clusters, watch_config())
            .shutdown_on_signal()
            .run(cluster_ctrl::reconcile, cluster_ctrl::error_policy, ctx)
            .for_each(log_reconcile_result("Cluster")),
    )]
}

/// Build the tenant monitoring controller future
pub fn build_monitoring_controllers(
    client: Client,
    config: ControllerConfig,
    datacenters: Arc<HashMap<String, DatacenterMeta>>,
    worker_name: String,
    health_check_period: Duration,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(
        monitoring_ctrl::Context::builder(&client, datacenters)
            .config(config)
            .worker_name(worker_name)
            .health_check_period(health_check_period)
            .build(),
    );
    let clusters: Api<Cluster> = Api::all(client);

    tracing::info!("- Monitoring controller");

    vec![Box::pin(
        Controller::new(clusters, watch_config())
            .shutdown_on_signal()
            .run(
                monitoring_ctrl::reconcile,
                monitoring_ctrl::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("Monitoring")),
    )]
}

/// Build the RBAC propagation controller futures
///
/// One client serves both the master and seed side here; deployments with
/// several seeds run one operator instance per seed. Seed names come from
/// the datacenter topology.
pub fn build_rbac_controllers(
    client: Client,
    secrets_namespace: &str,
    policy: OrphanPolicy,
    datacenters: &HashMap<String, DatacenterMeta>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let mut project_builder = rbac_project::Context::builder(&client);
    let mut seed_count = 0;
    for (name, datacenter) in datacenters {
        if datacenter.is_seed {
            project_builder = project_builder.seed(name, &client);
            seed_count += 1;
        }
    }
    if seed_count == 0 {
        tracing::warn!("no seed datacenters configured, cluster RBAC has nowhere to go");
    }
    let project_ctx = Arc::new(project_builder.build());

    let projects: Api<Project> = Api::all(client.clone());
    let project_ctrl = Controller::new(projects, watch_config())
        .shutdown_on_signal()
        .run(rbac_project::reconcile, rbac_project::error_policy, project_ctx)
        .for_each(log_reconcile_result("Project"));

    let resource_ctx = Arc::new(
        rbac_resource::Context::builder(ClusterProvider::from_client("master", &client))
            .orphan_policy(policy)
            .build(),
    );

    let clusters: Api<Cluster> = Api::all(client.clone());
    let cluster_rbac_ctrl = Controller::new(clusters, watch_config())
        .shutdown_on_signal()
        .run(
            rbac_resource::reconcile_cluster,
            rbac_resource::error_policy,
            resource_ctx.clone(),
        )
        .for_each(log_reconcile_result("ClusterRbac"));

    let ssh_keys: Api<UserSSHKey> = Api::all(client.clone());
    let key_ctrl = Controller::new(ssh_keys, watch_config())
        .shutdown_on_signal()
        .run(
            rbac_resource::reconcile_ssh_key,
            rbac_resource::error_policy,
            resource_ctx.clone(),
        )
        .for_each(log_reconcile_result("UserSshKeyRbac"));

    let bindings: Api<UserProjectBinding> = Api::all(client.clone());
    let binding_ctrl = Controller::new(bindings, watch_config())
        .shutdown_on_signal()
        .run(
            rbac_resource::reconcile_binding,
            rbac_resource::error_policy,
            resource_ctx.clone(),
        )
        .for_each(log_reconcile_result("UserProjectBindingRbac"));

    let users: Api<User> = Api::all(client.clone());
    let user_ctrl = Controller::new(users, watch_config())
        .shutdown_on_signal()
        .run(
            rbac_resource::reconcile_user,
            rbac_resource::error_policy,
            resource_ctx.clone(),
        )
        .for_each(log_reconcile_result("UserRbac"));

    let secrets: Api<Secret> = Api::namespaced(client, secrets_namespace);
    let secret_ctrl = Controller::new(secrets, watch_config())
        .shutdown_on_signal()
        .run(
            rbac_resource::reconcile_secret,
            rbac_resource::error_policy,
            resource_ctx,
        )
        .for_each(log_reconcile_result("SecretRbac"));

    tracing::info!("- Project RBAC controller");
    tracing::info!("- Resource RBAC controllers (Cluster, UserSSHKey, UserProjectBinding, User, Secret)");

    vec![
        Box::pin(project_ctrl),
        Box::pin(cluster_rbac_ctrl),
        Box::pin(key_ctrl),
        Box::pin(binding_ctrl),
        Box::pin(user_ctrl),
        Box::pin(secret_ctrl),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
