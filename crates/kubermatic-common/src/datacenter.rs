//! Datacenter configuration loaded from a YAML file at startup
//!
//! Datacenters come in two flavors. Seed datacenters (`is_seed: true`) are
//! the Kubernetes clusters that host tenant control planes. Node datacenters
//! reference a seed via `seed` and carry the cloud provider settings used
//! when provisioning tenant nodes there. The file is read once and treated
//! as immutable for the lifetime of the process.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Top-level structure of the datacenters file
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatacentersFile {
    /// All datacenters keyed by name, seeds and node datacenters mixed
    #[serde(default)]
    pub datacenters: HashMap<String, DatacenterMeta>,
}

/// A single datacenter entry
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatacenterMeta {
    /// Detailed location, like "Hamburg" or "Datacenter 7". Informational.
    #[serde(default)]
    pub location: String,
    /// ISO-3166 two-letter country code. Informational.
    #[serde(default)]
    pub country: String,
    /// Name of the seed datacenter hosting control planes for this
    /// datacenter. Empty for seeds themselves.
    #[serde(default)]
    pub seed: String,
    /// Marks this datacenter as a seed
    #[serde(default)]
    pub is_seed: bool,
    /// Hidden from the public datacenter listing
    #[serde(default)]
    pub private: bool,
    /// Overrides the DNS name used for this seed. Defaults to the seed name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_dns_overwrite: Option<String>,
    /// Cloud provider settings. Exactly one provider section must be set
    /// on node datacenters.
    #[serde(default)]
    pub spec: DatacenterSpec,
}

/// Provider-specific datacenter settings, mutually exclusive
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatacenterSpec {
    /// Digitalocean region settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digitalocean: Option<DatacenterSpecDigitalocean>,
    /// Settings for clusters with manually provisioned nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bringyourown: Option<DatacenterSpecBringYourOwn>,
    /// Synthetic provider for tests and development
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake: Option<DatacenterSpecFake>,
}

/// Digitalocean datacenter settings
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatacenterSpecDigitalocean {
    /// Digitalocean region slug, e.g. "ams2" or "fra1"
    pub region: String,
}

/// BringYourOwn has no provider-level settings
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatacenterSpecBringYourOwn {}

/// Fake datacenter settings
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatacenterSpecFake {
    /// Arbitrary value echoed back by the fake provider
    #[serde(default)]
    pub fake_property: Option<String>,
}

impl DatacenterMeta {
    /// Name of the cloud provider configured for this datacenter
    pub fn provider_name(&self) -> Option<&'static str> {
        if self.spec.digitalocean.is_some() {
            Some("digitalocean")
        } else if self.spec.bringyourown.is_some() {
            Some("bringyourown")
        } else if self.spec.fake.is_some() {
            Some("fake")
        } else {
            None
        }
    }
}

/// Load and validate the datacenters file
pub fn load_datacenters(path: &Path) -> Result<HashMap<String, DatacenterMeta>, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::internal_with_context(
            "load_datacenters",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    parse_datacenters(&raw)
}

/// Parse and validate datacenters from YAML content
pub fn parse_datacenters(raw: &str) -> Result<HashMap<String, DatacenterMeta>, Error> {
    let file: DatacentersFile = serde_yaml::from_str(raw)
        .map_err(|e| Error::serialization(format!("invalid datacenters file: {}", e)))?;
    validate_datacenters(&file.datacenters)?;
    Ok(file.datacenters)
}

/// Validate cross-references between seeds and node datacenters
///
/// Every node datacenter must point at an existing datacenter that is
/// flagged as a seed.
pub fn validate_datacenters(datacenters: &HashMap<String, DatacenterMeta>) -> Result<(), Error> {
    for (name, dc) in datacenters {
        if dc.is_seed {
            continue;
        }
        if dc.seed.is_empty() {
            return Err(Error::validation(format!(
                "datacenter {} has no seed assigned",
                name
            )));
        }
        match datacenters.get(&dc.seed) {
            None => {
                return Err(Error::validation(format!(
                    "datacenter {} references unknown seed {}",
                    name, dc.seed
                )));
            }
            Some(seed) if !seed.is_seed => {
                return Err(Error::validation(format!(
                    "datacenter {} references {} as seed, which is not a seed",
                    name, dc.seed
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// DNS name to use for a seed: the overwrite when configured, else the name
pub fn seed_dns_name<'a>(seed_name: &'a str, seed: &'a DatacenterMeta) -> &'a str {
    match &seed.seed_dns_overwrite {
        Some(overwrite) if !overwrite.is_empty() => overwrite,
        _ => seed_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
datacenters:
  europe-west3-c:
    location: Frankfurt
    country: DE
    is_seed: true
  us-central1:
    location: Iowa
    country: US
    is_seed: true
    seed_dns_overwrite: alias-us
  do-ams2:
    location: Amsterdam
    country: NL
    seed: europe-west3-c
    spec:
      digitalocean:
        region: ams2
  byo-europe:
    location: Frankfurt
    country: DE
    seed: europe-west3-c
    spec:
      bringyourown: {}
"#;

    #[test]
    fn test_parse_sample_file() {
        let dcs = parse_datacenters(SAMPLE).unwrap();
        assert_eq!(dcs.len(), 4);
        assert!(dcs["europe-west3-c"].is_seed);
        assert_eq!(dcs["do-ams2"].seed, "europe-west3-c");
        assert_eq!(dcs["do-ams2"].provider_name(), Some("digitalocean"));
        assert_eq!(
            dcs["do-ams2"].spec.digitalocean.as_ref().unwrap().region,
            "ams2"
        );
        assert_eq!(dcs["byo-europe"].provider_name(), Some("bringyourown"));
    }

    #[test]
    fn test_node_datacenter_without_seed_is_rejected() {
        let raw = r#"
datacenters:
  lonely:
    country: DE
    spec:
      bringyourown: {}
"#;
        let err = parse_datacenters(raw).unwrap_err();
        assert!(err.to_string().contains("no seed assigned"));
    }

    #[test]
    fn test_unknown_seed_reference_is_rejected() {
        let raw = r#"
datacenters:
  do-ams2:
    seed: atlantis
    spec:
      digitalocean:
        region: ams2
"#;
        let err = parse_datacenters(raw).unwrap_err();
        assert!(err.to_string().contains("unknown seed"));
    }

    #[test]
    fn test_seed_reference_to_non_seed_is_rejected() {
        let raw = r#"
datacenters:
  do-ams2:
    seed: do-fra1
    spec:
      digitalocean:
        region: ams2
  do-fra1:
    seed: do-ams2
    spec:
      digitalocean:
        region: fra1
"#;
        let err = parse_datacenters(raw).unwrap_err();
        assert!(err.to_string().contains("is not a seed"));
    }

    #[test]
    fn test_seed_dns_name_prefers_overwrite() {
        let dcs = parse_datacenters(SAMPLE).unwrap();
        assert_eq!(
            seed_dns_name("europe-west3-c", &dcs["europe-west3-c"]),
            "europe-west3-c"
        );
        assert_eq!(seed_dns_name("us-central1", &dcs["us-central1"]), "alias-us");
    }
}
