//! Collaborator service interfaces.
//!
//! These are the narrow contracts the kernel uses to talk to the external
//! subsystems that live in modules: the embedded HTTP server, the database
//! pool manager, the MQTT connection manager, and the Redis manager. Their
//! internals are out of the kernel's hands; the kernel only registers,
//! looks up, and calls through these traits.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::kernel::descriptor::ModuleDescriptor;
use crate::kernel::framework::ModuleContext;
use crate::properties::Properties;
use crate::types::Result;

/// Embedded HTTP server integration.
///
/// Attached for modules flagged `require.httpd`; absence of the service is
/// logged and skipped, never fatal.
#[async_trait::async_trait]
pub trait HttpIntegration: Send + Sync {
    /// Mount a module's web context.
    async fn attach(&self, context: Arc<ModuleContext>, workdir: &Path) -> Result<()>;

    /// Unmount a module's web context.
    async fn detach(&self, descriptor: &ModuleDescriptor) -> Result<()>;
}

/// Database connection-pool manager.
pub trait DatabaseService: Send + Sync {
    /// Register a pool from a parsed configuration source.
    fn register_pool(&self, name: &str, config: &Properties) -> Result<()>;

    fn unregister_pool(&self, name: &str) -> Result<()>;

    fn contains(&self, name: &str) -> bool;

    /// Names of all registered pool configurations.
    fn pool_names(&self) -> Vec<String>;
}

/// MQTT broker endpoint parsed from a module's `mqtt.conf`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// MQTT connection manager.
pub trait MqttService: Send + Sync {
    fn register_broker(&self, name: &str, endpoint: MqttEndpoint) -> Result<()>;

    fn unregister_broker(&self, name: &str) -> Result<()>;

    fn contains(&self, name: &str) -> bool;
}

/// Redis connection-pool manager. Modules discover it by capability type;
/// the kernel itself never drives it.
pub trait RedisManager: Send + Sync {
    fn active_connections(&self) -> usize;
}

/// Read-only view of the host's global configuration, published at boot so
/// modules can consult framework-level settings.
pub trait SystemService: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn keys(&self) -> Vec<String>;
}

/// Default `SystemService` backed by a properties snapshot.
pub struct SystemProperties {
    properties: Properties,
}

impl SystemProperties {
    pub fn new(properties: Properties) -> Self {
        Self { properties }
    }
}

impl SystemService for SystemProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.properties.get(key).map(str::to_string)
    }

    fn keys(&self) -> Vec<String> {
        self.properties.keys().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_properties_view() {
        let props = Properties::parse("framework.name=modulith\nframework.tmp=../tmp");
        let system = SystemProperties::new(props);
        assert_eq!(system.get("framework.name").as_deref(), Some("modulith"));
        assert_eq!(system.get("absent"), None);
        assert_eq!(system.keys().len(), 2);
    }

    #[test]
    fn test_mqtt_endpoint_deserializes_partial() {
        let endpoint: MqttEndpoint =
            serde_json::from_str(r#"{"url":"tcp://broker:1883"}"#).unwrap();
        assert_eq!(endpoint.url, "tcp://broker:1883");
        assert!(endpoint.user.is_none());
    }
}
