//! Flow agent configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to its
//! default. Command line flags override file values in `main`.

use serde::{Deserialize, Serialize};
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;
use vrouter_types::{IpPrefix, VrfId};

use crate::flow::FlowTableConfig;
use crate::redirect::{FloatingIp, FloatingIpTable, VrfAssignAcl, VrfAssignRule};
use crate::route::{ComponentKey, NextHop, Path, RouteTable};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid {field}: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        message: String,
    },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Flow agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowAgentConfig {
    /// Number of flow table partitions (one worker each).
    pub partitions: usize,
    /// Pairs with no traffic for this long are aged out.
    pub idle_timeout_secs: u64,
    /// Interval of the aging sweep.
    pub sweep_interval_ms: u64,
    /// Depth of each partition's packet queue.
    pub queue_depth: usize,
    /// Record limit of one partition (two records per pair).
    pub max_flows_per_partition: usize,
    /// Evict pairs that stop resolving after a route withdrawal.
    pub evict_on_withdraw: bool,
    /// Routes and redirect state installed at startup.
    pub bootstrap: BootstrapState,
}

impl Default for FlowAgentConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            idle_timeout_secs: 180,
            sweep_interval_ms: 1000,
            queue_depth: 1024,
            max_flows_per_partition: 65536,
            evict_on_withdraw: true,
            bootstrap: BootstrapState::default(),
        }
    }
}

impl FlowAgentConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<FsPath>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(invalid("partitions", "must be at least 1"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(invalid("idle_timeout_secs", "must be positive"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(invalid("sweep_interval_ms", "must be positive"));
        }
        if self.queue_depth == 0 {
            return Err(invalid("queue_depth", "must be at least 1"));
        }
        if self.max_flows_per_partition < 2 {
            return Err(invalid(
                "max_flows_per_partition",
                "must hold at least one pair",
            ));
        }
        for route in &self.bootstrap.routes {
            route.next_hop()?;
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Per-partition table settings.
    pub fn table_config(&self) -> FlowTableConfig {
        FlowTableConfig {
            max_flows: self.max_flows_per_partition,
            evict_on_withdraw: self.evict_on_withdraw,
        }
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

/// A route installed at startup. Exactly one of `path` and `members` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub vrf: VrfId,
    pub prefix: IpPrefix,
    #[serde(default)]
    pub path: Option<Path>,
    #[serde(default)]
    pub members: Vec<ComponentKey>,
}

impl StaticRoute {
    pub fn next_hop(&self) -> Result<NextHop> {
        match (&self.path, self.members.is_empty()) {
            (Some(path), true) => Ok(NextHop::Single(path.clone())),
            (None, false) => Ok(NextHop::group(self.members.iter().cloned())),
            (Some(_), false) => Err(ConfigError::Invalid {
                field: "bootstrap.routes",
                message: format!("vrf:{}/{} has both path and members", self.vrf, self.prefix),
            }),
            (None, true) => Err(ConfigError::Invalid {
                field: "bootstrap.routes",
                message: format!("vrf:{}/{} has no next hop", self.vrf, self.prefix),
            }),
        }
    }
}

/// Initial route, VRF-assign and floating-IP state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapState {
    pub routes: Vec<StaticRoute>,
    pub vrf_assign: Vec<VrfAssignRule>,
    pub floating_ips: Vec<FloatingIp>,
}

impl BootstrapState {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.vrf_assign.is_empty() && self.floating_ips.is_empty()
    }

    /// Installs the state into the in-memory tables.
    pub fn apply(
        &self,
        routes: &RouteTable,
        acl: &VrfAssignAcl,
        floating_ips: &FloatingIpTable,
    ) -> Result<()> {
        for route in &self.routes {
            routes
                .set_route(route.vrf, route.prefix, route.next_hop()?)
                .map_err(|e| ConfigError::Invalid {
                    field: "bootstrap.routes",
                    message: e.to_string(),
                })?;
        }
        for rule in &self.vrf_assign {
            acl.add_rule(rule.clone());
        }
        for fip in &self.floating_ips {
            floating_ips.add(fip.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redirect::{AddressTranslator, VrfClassifier};
    use crate::route::RouteSnapshotProvider;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = FlowAgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(180));
        assert_eq!(config.table_config(), FlowTableConfig::default());
        assert!(config.bootstrap.is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            FlowAgentConfig::from_json_str(r#"{"partitions": 8, "evict_on_withdraw": false}"#)
                .unwrap();
        assert_eq!(config.partitions, 8);
        assert!(!config.evict_on_withdraw);
        assert_eq!(config.queue_depth, 1024);
    }

    #[test]
    fn test_invalid_values() {
        let err = FlowAgentConfig::from_json_str(r#"{"partitions": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "partitions",
                ..
            }
        ));

        let err = FlowAgentConfig::from_json_str(r#"{"max_flows_per_partition": 1}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_flows_per_partition",
                ..
            }
        ));

        let err = FlowAgentConfig::from_json_str(r#"{"partitions": "many"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"idle_timeout_secs": 30, "sweep_interval_ms": 250}}"#).unwrap();

        let config = FlowAgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));

        let err = FlowAgentConfig::from_file("/nonexistent/flowagent.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_bootstrap() {
        let config = FlowAgentConfig::from_json_str(
            r#"{
                "bootstrap": {
                    "routes": [
                        {"vrf": 1, "prefix": "0.0.0.0/0",
                         "members": [{"endpoint": "100.1.1.1", "label": 16},
                                     {"endpoint": "100.1.1.2", "label": 17}]},
                        {"vrf": 1, "prefix": "1.1.1.1/32",
                         "path": {"type": "interface", "name": "vnet1"}}
                    ],
                    "vrf_assign": [{"id": 1, "vrf": 1, "src": "1.1.1.0/24", "target_vrf": 2}],
                    "floating_ips": [{"floating_vrf": 3, "floating_address": "2.1.1.1",
                                      "interface_vrf": 1, "fixed_address": "1.1.1.1"}]
                }
            }"#,
        )
        .unwrap();

        let routes = RouteTable::new();
        let acl = VrfAssignAcl::new();
        let fips = FloatingIpTable::new();
        config.bootstrap.apply(&routes, &acl, &fips).unwrap();

        assert_eq!(routes.route_count(), 2);
        let group = routes
            .lookup_decision(1, &"8.8.8.8".parse().unwrap())
            .unwrap();
        assert_eq!(group.next_hop.members().len(), 2);
        assert_eq!(acl.len(), 1);
        assert_eq!(
            fips.translate(3, &"2.1.1.1".parse().unwrap()),
            Some((1, "1.1.1.1".parse().unwrap()))
        );

        let key = crate::flow::FlowKey::new(
            1,
            "1.1.1.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            vrouter_types::IpProtocol::Icmp,
        );
        assert_eq!(
            acl.classify(&key, &crate::flow::IngressContext::default()),
            Some(2)
        );
    }

    #[test]
    fn test_bootstrap_route_without_next_hop() {
        let err = FlowAgentConfig::from_json_str(
            r#"{"bootstrap": {"routes": [{"vrf": 1, "prefix": "0.0.0.0/0"}]}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "bootstrap.routes",
                ..
            }
        ));
    }
}
