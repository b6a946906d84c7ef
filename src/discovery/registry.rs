//! # Service Registries
//!
//! A [`ServiceRegistry`] answers one question: which instances are registered
//! under a service name right now. The gateway never registers anything itself;
//! services register on their own and the registry owns that data.
//!
//! - [`ConsulRegistry`] asks Consul's health API for passing instances, trying each
//!   configured endpoint in order until one answers
//! - [`StaticRegistry`] serves instances from configuration or test setup
//!
//! ## Rust Concepts Used
//!
//! - `async_trait` for async methods behind `Arc<dyn ServiceRegistry>`
//! - `DashMap` for a concurrently readable and writable in-memory registry
//! - `serde` derive with `rename` to map Consul's PascalCase JSON

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::config::{DiscoveryConfig, RegistryKind};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;

/// Failures talking to a registry
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("no registry endpoints configured")]
    NoEndpoints,

    #[error("registry request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("registry at {endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid registry response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// Source of service instances
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// All instances currently registered under `name`, in registry order
    async fn instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    fn kind(&self) -> &'static str;
}

/// Build the registry selected in the configuration
pub fn create_registry(
    config: &DiscoveryConfig,
    client: reqwest::Client,
) -> GatewayResult<Arc<dyn ServiceRegistry>> {
    match config.registry {
        RegistryKind::Consul => {
            if config.endpoints.is_empty() {
                return Err(GatewayError::config(
                    "consul registry requires at least one endpoint",
                ));
            }
            Ok(Arc::new(ConsulRegistry::new(
                client,
                config.endpoints.clone(),
                config.query_timeout,
            )))
        }
        RegistryKind::Static => Ok(Arc::new(StaticRegistry::from_instances(
            config.instances.clone(),
        ))),
    }
}

/// In-memory registry keyed by service name
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: DashMap<String, Vec<ServiceInstance>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instances(instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        let registry = Self::new();
        for instance in instances {
            registry.register(instance);
        }
        registry
    }

    /// Add an instance; re-registering the same address replaces it in place
    pub fn register(&self, instance: ServiceInstance) {
        let mut entry = self.services.entry(instance.name.clone()).or_default();
        if let Some(pos) = entry.iter().position(|i| i.address == instance.address) {
            entry[pos] = instance;
        } else {
            entry.push(instance);
        }
    }

    /// Remove one instance; returns whether it was registered
    pub fn deregister(&self, name: &str, address: &str) -> bool {
        let Some(mut entry) = self.services.get_mut(name) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|i| i.address != address);
        before != entry.len()
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self
            .services
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
}

#[derive(Debug, Deserialize)]
struct ConsulNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "Service")]
    name: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Weights", default)]
    weights: Option<ConsulWeights>,
}

#[derive(Debug, Deserialize)]
struct ConsulWeights {
    #[serde(rename = "Passing", default)]
    passing: u32,
}

impl From<ConsulHealthEntry> for ServiceInstance {
    fn from(entry: ConsulHealthEntry) -> Self {
        // Services registered without an address inherit the node's
        let host = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };
        let weight = entry.service.weights.map_or(1, |w| w.passing);

        ServiceInstance::new(entry.service.name, format!("{}:{}", host, entry.service.port))
            .with_weight(weight)
    }
}

/// Registry backed by Consul's `/v1/health/service/<name>` API
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    endpoints: Vec<String>,
    query_timeout: Duration,
}

impl ConsulRegistry {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>, query_timeout: Duration) -> Self {
        Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            query_timeout,
        }
    }

    async fn query(&self, endpoint: &str, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let url = format!("{}/v1/health/service/{}", endpoint, name);
        let response = self
            .client
            .get(&url)
            .query(&[("passing", "true")])
            .timeout(self.query_timeout)
            .send()
            .await
            .map_err(|e| RegistryError::Request {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let entries: Vec<ConsulHealthEntry> =
            response.json().await.map_err(|e| RegistryError::Decode {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        Ok(entries.into_iter().map(ServiceInstance::from).collect())
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let mut last_error = RegistryError::NoEndpoints;

        for endpoint in &self.endpoints {
            match self.query(endpoint, name).await {
                Ok(instances) => {
                    debug!(service = name, endpoint = %endpoint, count = instances.len(), "Registry lookup");
                    return Ok(instances);
                }
                Err(e) => {
                    warn!(service = name, error = %e, "Registry endpoint failed, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn kind(&self) -> &'static str {
        "consul"
    }
}
