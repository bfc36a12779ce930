use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Tags describing a cloud instance.
///
/// Shared between the cache and all metrics enriched with them.
pub type InstanceTags = Arc<[String]>;

/// Metadata of a cloud instance.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceMetadata {
    /// The provider's identifier of the instance.
    pub id: String,
    /// The region the instance runs in.
    pub region: String,
    /// Tags attached to the instance, in the form `key:value`.
    pub tags: Vec<String>,
}

impl InstanceMetadata {
    /// Returns the tags to attach to metrics of this instance.
    ///
    /// This contains the instance's own tags and a `region:<region>` tag if the region is known.
    pub fn into_tags(self) -> InstanceTags {
        let mut tags = self.tags;
        if !self.region.is_empty() {
            tags.push(format!("region:{}", self.region));
        }
        tags.into()
    }
}

/// An error returned by a [`CloudProvider`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider does not know an instance with this address.
    #[error("no instance found for {0}")]
    NotFound(IpAddr),
    /// The request to the provider failed.
    #[error("provider request failed: {0}")]
    Request(String),
}

/// A source of cloud instance metadata.
///
/// Providers are treated as slow and unreliable. They are never called on the ingestion path
/// directly, see [`CloudHandle`](crate::CloudHandle).
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the name under which the provider is configured.
    fn provider_name(&self) -> &str;

    /// Returns an example configuration block for this provider.
    fn sample_config(&self) -> &str;

    /// Looks up the instance with the given address.
    async fn instance(&self, ip: IpAddr) -> Result<InstanceMetadata, ProviderError>;
}

/// A provider serving a fixed list of instances from configuration.
#[derive(Debug, Default)]
pub struct StaticProvider {
    instances: BTreeMap<IpAddr, InstanceMetadata>,
}

impl StaticProvider {
    /// The name of this provider in configuration.
    pub const NAME: &'static str = "static";

    /// Creates a provider from a map of instances.
    pub fn new(instances: BTreeMap<IpAddr, InstanceMetadata>) -> Self {
        Self { instances }
    }
}

#[async_trait::async_trait]
impl CloudProvider for StaticProvider {
    fn provider_name(&self) -> &str {
        Self::NAME
    }

    fn sample_config(&self) -> &str {
        r#"cloud:
  provider: static
  instances:
    10.0.0.1:
      id: i-0123456789
      region: us-east-1
      tags: ["role:web"]
"#
    }

    async fn instance(&self, ip: IpAddr) -> Result<InstanceMetadata, ProviderError> {
        self.instances
            .get(&ip)
            .cloned()
            .ok_or(ProviderError::NotFound(ip))
    }
}
