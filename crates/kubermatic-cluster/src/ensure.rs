//! The converge primitive behind every resource the controller manages.
//!
//! A creator builds the desired state of one object. When the object
//! already exists the creator starts from a deep copy of the live object,
//! so fields it does not touch survive the rebuild and an equality check
//! against the live object detects real drift only. Objects are never
//! deleted here.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ObjectMeta;
use serde::Serialize;
use tracing::info;

use kubermatic_common::{Error, Result, CHECKSUM_ANNOTATION};

use crate::client::{ClusterObjectStore, ObjectStore};
use crate::resources::ClusterData;

/// What a single ensure call did to the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Object did not exist and was created.
    Created,
    /// Object existed but drifted and was replaced.
    Updated,
    /// Object already matched the desired state. Zero writes.
    Unchanged,
}

impl EnsureOutcome {
    /// Label for metrics and logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EnsureOutcome::Created => "created",
            EnsureOutcome::Updated => "updated",
            EnsureOutcome::Unchanged => "unchanged",
        }
    }

    /// True when the call issued a write.
    pub fn wrote(&self) -> bool {
        !matches!(self, EnsureOutcome::Unchanged)
    }
}

/// Builds the desired state of one object. `existing` carries the live
/// object when there is one; the creator copies it and overwrites only the
/// fields it manages.
pub type CreatorFn<T> = fn(&ClusterData, Option<&T>) -> Result<T>;

/// A creator paired with the fixed name of the object it produces.
pub struct NamedCreator<T> {
    /// Object name within the cluster namespace.
    pub name: &'static str,
    /// Builder for the desired state.
    pub create: CreatorFn<T>,
}

/// Converge one namespaced object in the cluster namespace.
pub async fn ensure<T>(
    store: &dyn ObjectStore<T>,
    data: &ClusterData,
    creator: &NamedCreator<T>,
) -> Result<EnsureOutcome>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let namespace = data.namespace();
    match store.get(namespace, creator.name).await? {
        None => {
            let desired = (creator.create)(data, None)?;
            store.create(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let desired = (creator.create)(data, Some(&existing))?;
            if desired == existing {
                Ok(EnsureOutcome::Unchanged)
            } else {
                store.update(namespace, &desired).await?;
                Ok(EnsureOutcome::Updated)
            }
        }
    }
}

/// Converge one cluster-scoped object.
pub async fn ensure_cluster_scoped<T>(
    store: &dyn ClusterObjectStore<T>,
    data: &ClusterData,
    creator: &NamedCreator<T>,
) -> Result<EnsureOutcome>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    match store.get(creator.name).await? {
        None => {
            let desired = (creator.create)(data, None)?;
            store.create(&desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let desired = (creator.create)(data, Some(&existing))?;
            if desired == existing {
                Ok(EnsureOutcome::Unchanged)
            } else {
                store.update(&desired).await?;
                Ok(EnsureOutcome::Updated)
            }
        }
    }
}

/// Checksum of a data map: `key:value` entries sorted, concatenated and
/// CRC32-summed, rendered in decimal. Stored in the
/// `kubermatic.io/checksum` annotation so drift detection does not compare
/// secret payloads byte by byte.
pub fn data_checksum<'a>(entries: impl Iterator<Item = (&'a str, &'a [u8])>) -> String {
    let mut lines: Vec<Vec<u8>> = entries
        .map(|(key, value)| {
            let mut line = Vec::with_capacity(key.len() + 1 + value.len());
            line.extend_from_slice(key.as_bytes());
            line.push(b':');
            line.extend_from_slice(value);
            line
        })
        .collect();
    lines.sort();

    let mut hasher = crc32fast::Hasher::new();
    for line in &lines {
        hasher.update(line);
    }
    hasher.finalize().to_string()
}

pub(crate) fn secret_checksum(secret: &Secret) -> String {
    match secret.data.as_ref() {
        Some(data) => data_checksum(
            data.iter()
                .map(|(key, value)| (key.as_str(), value.0.as_slice())),
        ),
        None => data_checksum(std::iter::empty()),
    }
}

pub(crate) fn config_map_checksum(config_map: &ConfigMap) -> String {
    match config_map.data.as_ref() {
        Some(data) => data_checksum(
            data.iter()
                .map(|(key, value)| (key.as_str(), value.as_bytes())),
        ),
        None => data_checksum(std::iter::empty()),
    }
}

pub(crate) fn annotate_checksum(metadata: &mut ObjectMeta, checksum: String) {
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(CHECKSUM_ANNOTATION.to_string(), checksum);
}

pub(crate) fn existing_checksum(metadata: &ObjectMeta) -> Option<&String> {
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CHECKSUM_ANNOTATION))
}

/// Converge one Secret, comparing by the checksum annotation instead of
/// full equality.
pub async fn ensure_secret(
    store: &dyn ObjectStore<Secret>,
    data: &ClusterData,
    creator: &NamedCreator<Secret>,
) -> Result<EnsureOutcome> {
    let namespace = data.namespace();
    match store.get(namespace, creator.name).await? {
        None => {
            let mut desired = (creator.create)(data, None)?;
            let checksum = secret_checksum(&desired);
            annotate_checksum(&mut desired.metadata, checksum);
            store.create(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let mut desired = (creator.create)(data, Some(&existing))?;
            let checksum = secret_checksum(&desired);
            if existing_checksum(&existing.metadata) == Some(&checksum) {
                return Ok(EnsureOutcome::Unchanged);
            }
            info!(
                cluster = %data.cluster_name(),
                secret = creator.name,
                "secret drifted, updating"
            );
            annotate_checksum(&mut desired.metadata, checksum);
            store.update(namespace, &desired).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

fn spec_checksum<S: Serialize>(spec: &S) -> Result<String> {
    let raw = serde_json::to_vec(spec)
        .map_err(|e| Error::serialization_for_kind("WorkloadSpec", e.to_string()))?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw);
    Ok(hasher.finalize().to_string())
}

/// Converge one Deployment.
///
/// Workload specs are compared through a checksum of the generated spec
/// stored in the annotation: a byte comparison against the live object
/// would flag every field the apiserver defaulted as drift.
pub async fn ensure_deployment(
    store: &dyn ObjectStore<Deployment>,
    data: &ClusterData,
    creator: &NamedCreator<Deployment>,
) -> Result<EnsureOutcome> {
    let namespace = data.namespace();
    match store.get(namespace, creator.name).await? {
        None => {
            let mut desired = (creator.create)(data, None)?;
            annotate_checksum(&mut desired.metadata, spec_checksum(&desired.spec)?);
            store.create(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let mut desired = (creator.create)(data, Some(&existing))?;
            let checksum = spec_checksum(&desired.spec)?;
            if existing_checksum(&existing.metadata) == Some(&checksum) {
                return Ok(EnsureOutcome::Unchanged);
            }
            info!(
                cluster = %data.cluster_name(),
                deployment = creator.name,
                "deployment drifted, updating"
            );
            annotate_checksum(&mut desired.metadata, checksum);
            store.update(namespace, &desired).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

/// Converge one StatefulSet, with the same checksum comparison as
/// [`ensure_deployment`].
pub async fn ensure_stateful_set(
    store: &dyn ObjectStore<StatefulSet>,
    data: &ClusterData,
    creator: &NamedCreator<StatefulSet>,
) -> Result<EnsureOutcome> {
    let namespace = data.namespace();
    match store.get(namespace, creator.name).await? {
        None => {
            let mut desired = (creator.create)(data, None)?;
            annotate_checksum(&mut desired.metadata, spec_checksum(&desired.spec)?);
            store.create(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let mut desired = (creator.create)(data, Some(&existing))?;
            let checksum = spec_checksum(&desired.spec)?;
            if existing_checksum(&existing.metadata) == Some(&checksum) {
                return Ok(EnsureOutcome::Unchanged);
            }
            annotate_checksum(&mut desired.metadata, checksum);
            store.update(namespace, &desired).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

/// Converge one ConfigMap, comparing by the checksum annotation instead of
/// full equality.
pub async fn ensure_config_map(
    store: &dyn ObjectStore<ConfigMap>,
    data: &ClusterData,
    creator: &NamedCreator<ConfigMap>,
) -> Result<EnsureOutcome> {
    let namespace = data.namespace();
    match store.get(namespace, creator.name).await? {
        None => {
            let mut desired = (creator.create)(data, None)?;
            let checksum = config_map_checksum(&desired);
            annotate_checksum(&mut desired.metadata, checksum);
            store.create(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let mut desired = (creator.create)(data, Some(&existing))?;
            let checksum = config_map_checksum(&desired);
            if existing_checksum(&existing.metadata) == Some(&checksum) {
                return Ok(EnsureOutcome::Unchanged);
            }
            annotate_checksum(&mut desired.metadata, checksum);
            store.update(namespace, &desired).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockObjectStore;
    use k8s_openapi::ByteString;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    const NAMESPACE: &str = "cluster-fqpcvnc6v";

    fn cloud_config_creator(
        _data: &ClusterData,
        existing: Option<&ConfigMap>,
    ) -> Result<ConfigMap> {
        let mut config_map = existing.cloned().unwrap_or_default();
        config_map.metadata.name = Some("cloud-config".to_string());
        config_map.data = Some(BTreeMap::from([(
            "config".to_string(),
            "[global]\ntoken = redacted".to_string(),
        )]));
        Ok(config_map)
    }

    fn tokens_creator(_data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
        let mut secret = existing.cloned().unwrap_or_default();
        secret.metadata.name = Some("tokens".to_string());
        secret.data = Some(BTreeMap::from([(
            "tokens.csv".to_string(),
            ByteString(b"abc123.0123456789abcdef,admin,10000,system:masters".to_vec()),
        )]));
        Ok(secret)
    }

    // =========================================================================
    // Generic ensure
    // =========================================================================
    //
    // An absent object is created, a matching object causes zero writes,
    // and a drifted object is replaced while fields the creator does not
    // manage survive.

    #[tokio::test]
    async fn test_ensure_creates_absent_object() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "cloud-config",
            create: cloud_config_creator,
        };

        let mut store = MockObjectStore::<ConfigMap>::new();
        store
            .expect_get()
            .withf(|ns, name| ns == NAMESPACE && name == "cloud-config")
            .times(1)
            .returning(|_, _| Ok(None));
        store
            .expect_create()
            .withf(|ns, cm| {
                ns == NAMESPACE && cm.metadata.name.as_deref() == Some("cloud-config")
            })
            .times(1)
            .returning(|_, cm| Ok(cm.clone()));

        let outcome = ensure(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
        assert!(outcome.wrote());
    }

    #[tokio::test]
    async fn test_ensure_second_pass_causes_zero_writes() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "cloud-config",
            create: cloud_config_creator,
        };
        let live = cloud_config_creator(&data, None).unwrap();

        let mut store = MockObjectStore::<ConfigMap>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));
        // no create or update expectations: a write would panic the mock

        let outcome = ensure(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Unchanged);
        assert!(!outcome.wrote());
    }

    #[tokio::test]
    async fn test_ensure_update_preserves_unmanaged_fields() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "cloud-config",
            create: cloud_config_creator,
        };

        // Live object drifted in data but carries a label the creator
        // knows nothing about.
        let mut live = cloud_config_creator(&data, None).unwrap();
        live.data = Some(BTreeMap::from([(
            "config".to_string(),
            "manually edited".to_string(),
        )]));
        live.metadata.labels = Some(BTreeMap::from([(
            "added-by-operator".to_string(),
            "true".to_string(),
        )]));

        let mut store = MockObjectStore::<ConfigMap>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));
        store
            .expect_update()
            .withf(|_, cm| {
                let data_fixed = cm
                    .data
                    .as_ref()
                    .and_then(|d| d.get("config"))
                    .map(|v| v.starts_with("[global]"))
                    .unwrap_or(false);
                let label_kept = cm
                    .metadata
                    .labels
                    .as_ref()
                    .map(|l| l.contains_key("added-by-operator"))
                    .unwrap_or(false);
                data_fixed && label_kept
            })
            .times(1)
            .returning(|_, cm| Ok(cm.clone()));

        let outcome = ensure(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    // =========================================================================
    // Checksums
    // =========================================================================

    #[test]
    fn test_data_checksum_ignores_key_order() {
        let forward = [("a", b"1".as_slice()), ("b", b"2".as_slice())];
        let backward = [("b", b"2".as_slice()), ("a", b"1".as_slice())];

        let lhs = data_checksum(forward.iter().copied());
        let rhs = data_checksum(backward.iter().copied());
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_data_checksum_changes_with_content() {
        let original = [("tokens.csv", b"token-a".as_slice())];
        let rotated = [("tokens.csv", b"token-b".as_slice())];

        assert_ne!(
            data_checksum(original.iter().copied()),
            data_checksum(rotated.iter().copied())
        );
    }

    #[test]
    fn test_data_checksum_renders_decimal() {
        let entries = [("ca.crt", b"pem bytes".as_slice())];
        let checksum = data_checksum(entries.iter().copied());
        assert!(!checksum.is_empty());
        assert!(checksum.bytes().all(|b| b.is_ascii_digit()));
    }

    // =========================================================================
    // Secret ensure via checksum annotation
    // =========================================================================

    #[tokio::test]
    async fn test_ensure_secret_stamps_checksum_on_create() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "tokens",
            create: tokens_creator,
        };

        let mut store = MockObjectStore::<Secret>::new();
        store.expect_get().times(1).returning(|_, _| Ok(None));
        store
            .expect_create()
            .withf(|_, secret| {
                secret
                    .metadata
                    .annotations
                    .as_ref()
                    .map(|a| a.contains_key(CHECKSUM_ANNOTATION))
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_, secret| Ok(secret.clone()));

        let outcome = ensure_secret(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
    }

    #[tokio::test]
    async fn test_ensure_secret_skips_write_when_checksum_matches() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "tokens",
            create: tokens_creator,
        };

        let mut live = tokens_creator(&data, None).unwrap();
        let checksum = secret_checksum(&live);
        annotate_checksum(&mut live.metadata, checksum);

        let mut store = MockObjectStore::<Secret>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));

        let outcome = ensure_secret(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_ensure_secret_updates_when_payload_rotates() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "tokens",
            create: tokens_creator,
        };

        // Annotation from a previous payload no longer matches what the
        // creator produces now.
        let mut live = tokens_creator(&data, None).unwrap();
        live.data = Some(BTreeMap::from([(
            "tokens.csv".to_string(),
            ByteString(b"old-token,admin,10000,system:masters".to_vec()),
        )]));
        let stale = secret_checksum(&live);
        annotate_checksum(&mut live.metadata, stale);

        let mut store = MockObjectStore::<Secret>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));
        store
            .expect_update()
            .withf(|_, secret| {
                let fresh = secret_checksum(secret);
                secret
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(CHECKSUM_ANNOTATION))
                    == Some(&fresh)
            })
            .times(1)
            .returning(|_, secret| Ok(secret.clone()));

        let outcome = ensure_secret(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    // =========================================================================
    // Workload ensure via spec checksum
    // =========================================================================

    fn apiserver_deployment(
        data: &ClusterData,
        existing: Option<&Deployment>,
    ) -> Result<Deployment> {
        use k8s_openapi::api::apps::v1::DeploymentSpec;
        use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

        let mut deployment = existing.cloned().unwrap_or_default();
        deployment.metadata.name = Some("apiserver".to_string());
        deployment.spec = Some(DeploymentSpec {
            replicas: Some(1),
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "apiserver".to_string(),
                        image: Some(format!(
                            "k8s.gcr.io/hyperkube-amd64:v{}",
                            data.version()
                        )),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        Ok(deployment)
    }

    #[tokio::test]
    async fn test_ensure_deployment_ignores_apiserver_defaulting() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "apiserver",
            create: apiserver_deployment,
        };

        // Live object as it comes back from the apiserver: defaulted fields
        // the creator never set, but the spec checksum still matches.
        let mut live = apiserver_deployment(&data, None).unwrap();
        let checksum = spec_checksum(&live.spec).unwrap();
        annotate_checksum(&mut live.metadata, checksum);
        if let Some(spec) = live.spec.as_mut() {
            spec.revision_history_limit = Some(10);
            spec.progress_deadline_seconds = Some(600);
        }

        let mut store = MockObjectStore::<Deployment>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));

        let outcome = ensure_deployment(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_ensure_deployment_updates_on_version_bump() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "apiserver",
            create: apiserver_deployment,
        };

        let mut bumped = ClusterData::for_testing();
        bumped.cluster.spec.master_version = "1.13.0".to_string();

        let mut live = apiserver_deployment(&data, None).unwrap();
        let checksum = spec_checksum(&live.spec).unwrap();
        annotate_checksum(&mut live.metadata, checksum);

        let mut store = MockObjectStore::<Deployment>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));
        store
            .expect_update()
            .withf(|_, d| {
                let image = d
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .map(|p| p.containers[0].image.clone().unwrap_or_default())
                    .unwrap_or_default();
                image.ends_with("v1.13.0")
            })
            .times(1)
            .returning(|_, d| Ok(d.clone()));

        let outcome = ensure_deployment(&store, &bumped, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    #[tokio::test]
    async fn test_ensure_config_map_treats_missing_annotation_as_drift() {
        let data = ClusterData::for_testing();
        let creator = NamedCreator {
            name: "cloud-config",
            create: cloud_config_creator,
        };

        // Same payload but no checksum annotation, e.g. created by hand.
        let live = cloud_config_creator(&data, None).unwrap();

        let mut store = MockObjectStore::<ConfigMap>::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_, _| Ok(Some(live.clone())));
        store
            .expect_update()
            .times(1)
            .returning(|_, cm| Ok(cm.clone()));

        let outcome = ensure_config_map(&store, &data, &creator).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }
}
