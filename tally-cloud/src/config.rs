use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::InstanceMetadata;

/// Configuration for cloud enrichment.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudConfig {
    /// The name of the cloud provider, for instance `"static"`.
    ///
    /// Enrichment is disabled if this is not set.
    pub provider: Option<String>,

    /// The sustained number of lookups per second.
    ///
    /// Defaults to `10`.
    pub max_requests: u32,

    /// The number of lookups that can be made at once before the rate limit applies.
    ///
    /// Defaults to `15`.
    pub burst: u32,

    /// The time in seconds to cache the metadata of an instance.
    ///
    /// Defaults to one hour.
    pub cache_ttl: u64,

    /// The time in seconds to cache a failed lookup.
    ///
    /// Defaults to `60` seconds.
    pub negative_cache_ttl: u64,

    /// The maximum time in milliseconds for a single lookup.
    ///
    /// Defaults to `5000` milliseconds.
    pub lookup_timeout_ms: u64,

    /// The interval in seconds in which expired cache entries are removed.
    ///
    /// Defaults to `60` seconds.
    pub cache_eviction_interval: u64,

    /// The maximum number of packets held back while the tags of their sender are looked up.
    ///
    /// Packets beyond this limit are forwarded without instance tags. Defaults to `1000`.
    pub max_pending_packets: usize,

    /// Instances known to the `static` provider, keyed by their IP address.
    pub instances: BTreeMap<IpAddr, InstanceMetadata>,
}

impl CloudConfig {
    /// Returns the time to cache the metadata of an instance.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    /// Returns the time to cache a failed lookup.
    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl)
    }

    /// Returns the maximum time for a single lookup.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Returns the interval in which expired cache entries are removed.
    pub fn cache_eviction_interval(&self) -> Duration {
        Duration::from_secs(self.cache_eviction_interval.max(1))
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: None,
            max_requests: 10,
            burst: 15,
            cache_ttl: 3600, // 1 hour
            negative_cache_ttl: 60,
            lookup_timeout_ms: 5000,
            cache_eviction_interval: 60,
            max_pending_packets: 1000,
            instances: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_instances() {
        let yaml = r#"
provider: static
burst: 3
instances:
  10.0.0.1:
    id: i-123
    region: eu-west-1
    tags: ["role:web"]
"#;

        let config: CloudConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.provider.as_deref(), Some("static"));
        assert_eq!(config.burst, 3);
        assert_eq!(config.max_requests, 10);
        assert_eq!(config.max_pending_packets, 1000);

        let instance = &config.instances[&"10.0.0.1".parse::<IpAddr>().unwrap()];
        assert_eq!(instance.id, "i-123");
        assert_eq!(instance.region, "eu-west-1");
    }
}
