pub mod registry;
pub mod router;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::utils::{encode_base62, fnv1a64, fnv1a64_mixed};

/// Endpoint name that carries the dialable RESP address of an instance.
pub const REDIS_PORT_NAME: &str = "redis-port";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterLocation {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub node_name: String,
}

/// Stable logical identity of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub name: ClusterName,
    #[serde(default)]
    pub location: ClusterLocation,
}

impl ClusterKey {
    /// Canonical identity string, the hashing input for everything below.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.location.region,
            self.location.availability_zone,
            self.location.node_name,
            self.name.namespace,
            self.name.name
        )
    }

    /// Avalanched hash, used wherever keys index hash structures.
    pub fn hash(&self) -> u64 {
        fnv1a64_mixed(self.identity().as_bytes())
    }

    /// The tenant code clients embed (base62) in their AUTH username.
    pub fn tenant_code(&self) -> u64 {
        fnv1a64(self.identity().as_bytes())
    }

    /// Base62 rendering of the tenant code.
    pub fn tenant_key(&self) -> String {
        encode_base62(self.tenant_code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Ready,
    Online,
    Offline,
    Deleted,
}

impl ClusterStatus {
    /// Whether an instance in this state accepts traffic.
    pub fn is_serving(self) -> bool {
        matches!(self, ClusterStatus::Ready | ClusterStatus::Online)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
    pub name: String,
}

/// One serving instance of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInstance {
    pub key: ClusterKey,
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub endpoints: Vec<Endpoint>,
    pub status: ClusterStatus,
    #[serde(default)]
    pub owner: String,
}

impl ClusterInstance {
    /// The dialable `host:port` of the `redis-port` endpoint.
    pub fn addr(&self) -> Option<String> {
        self.endpoints
            .iter()
            .find(|ep| ep.name == REDIS_PORT_NAME)
            .map(|ep| format!("{}:{}", ep.addr, ep.port))
    }

    /// Instance used when the proxy runs against a single static backend.
    pub fn local(addr: &str, port: u16) -> ClusterInstance {
        ClusterInstance {
            key: ClusterKey {
                name: ClusterName {
                    namespace: "default".to_string(),
                    name: "default".to_string(),
                },
                location: ClusterLocation {
                    region: "local".to_string(),
                    availability_zone: "local".to_string(),
                    node_name: "local".to_string(),
                },
            },
            id: "local".to_string(),
            labels: HashMap::new(),
            endpoints: vec![Endpoint {
                addr: addr.to_string(),
                port,
                name: REDIS_PORT_NAME.to_string(),
            }],
            status: ClusterStatus::Ready,
            owner: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::decode_base62;

    #[test]
    fn identity_is_stable_and_order_sensitive() {
        let key = ClusterInstance::local("127.0.0.1", 6379).key;
        assert_eq!(key.identity(), "local:local:local:default:default");
        assert_eq!(key.hash(), key.hash());
    }

    #[test]
    fn tenant_key_decodes_back_to_tenant_code() {
        let key = ClusterInstance::local("127.0.0.1", 6379).key;
        let decoded = decode_base62(key.tenant_key().as_bytes()).unwrap();
        assert_eq!(decoded, key.tenant_code());
    }

    #[test]
    fn redis_port_endpoint_selects_the_address() {
        let mut instance = ClusterInstance::local("10.0.0.7", 6401);
        assert_eq!(instance.addr().as_deref(), Some("10.0.0.7:6401"));
        instance.endpoints[0].name = "admin-port".to_string();
        assert_eq!(instance.addr(), None);
    }

    #[test]
    fn serving_states() {
        assert!(ClusterStatus::Ready.is_serving());
        assert!(ClusterStatus::Online.is_serving());
        assert!(!ClusterStatus::Offline.is_serving());
        assert!(!ClusterStatus::Deleted.is_serving());
    }

    #[test]
    fn instance_serializes_for_the_admin_surface() {
        let instance = ClusterInstance::local("127.0.0.1", 6379);
        let json = serde_json::to_string(&instance).unwrap();
        let back: ClusterInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instance);
        assert!(json.contains("\"status\":\"ready\""));
    }
}
