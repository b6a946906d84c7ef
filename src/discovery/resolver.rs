//! # Service Resolver
//!
//! Turns a route target into a concrete base URL and probes it.
//!
//! - `service://<name>` targets are looked up in the registry; one instance is picked
//!   by the configured [`SelectionStrategy`] (the first entry unless configured otherwise)
//! - anything else must be an absolute `http(s)` URL and passes through unchanged
//!
//! A lookup that yields no instances, or a registry that cannot be reached, is a
//! resolution failure. There is no fallback to a cached or default address.
//!
//! Probes use their own short timeout, independent of the route timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::core::config::DiscoveryConfig;
use crate::core::error::GatewayResult;
use crate::core::types::normalize_address;
use crate::discovery::registry::{create_registry, RegistryError, ServiceRegistry};
use crate::load_balancing::strategies::{strategy_for, SelectionStrategy};

/// Scheme prefix of logical targets
pub const SERVICE_SCHEME: &str = "service://";

/// Liveness path probed on every resolved address
pub const HEALTH_PATH: &str = "/health";

/// A parsed route target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Logical service name, resolved through the registry
    Service(String),
    /// Literal base URL
    Address(String),
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let invalid = |reason: &str| ResolveError::InvalidTarget {
            target: raw.to_string(),
            reason: reason.to_string(),
        };

        if let Some(name) = raw.strip_prefix(SERVICE_SCHEME) {
            let name = name.trim_end_matches('/');
            if name.is_empty() {
                return Err(invalid("missing service name"));
            }
            if name.contains('/') {
                return Err(invalid("service name cannot contain '/'"));
            }
            return Ok(Self::Service(name.to_string()));
        }

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("literal targets must use http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("literal target has no host"));
        }
        Ok(Self::Address(raw.trim_end_matches('/').to_string()))
    }
}

/// Why a target could not be turned into an address
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("no instances registered for service '{service}'")]
    NoInstances { service: String },

    #[error("registry lookup for service '{service}' failed: {source}")]
    Registry {
        service: String,
        #[source]
        source: RegistryError,
    },
}

impl ResolveError {
    /// A malformed target is an operator mistake, not a fault of the target
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::InvalidTarget { .. })
    }
}

/// Resolves targets through a registry and probes resolved addresses
#[derive(Clone)]
pub struct ServiceResolver {
    registry: Arc<dyn ServiceRegistry>,
    strategy: Arc<dyn SelectionStrategy>,
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl std::fmt::Debug for ServiceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceResolver")
            .field("registry", &self.registry.kind())
            .field("strategy", &self.strategy.name())
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl ServiceResolver {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        strategy: Arc<dyn SelectionStrategy>,
        client: reqwest::Client,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            strategy,
            client,
            probe_timeout,
        }
    }

    /// Build the registry and strategy named in `config`
    pub fn from_config(config: &DiscoveryConfig, client: reqwest::Client) -> GatewayResult<Self> {
        let registry = create_registry(config, client.clone())?;
        Ok(Self::new(
            registry,
            strategy_for(config.selection),
            client,
            config.probe_timeout,
        ))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Resolve a route target to a base URL
    pub async fn resolve(&self, target: &str) -> Result<String, ResolveError> {
        let service = match Target::parse(target)? {
            Target::Address(address) => return Ok(address),
            Target::Service(service) => service,
        };

        let instances = self
            .registry
            .instances(&service)
            .await
            .map_err(|source| ResolveError::Registry {
                service: service.clone(),
                source,
            })?;

        let instance = self
            .strategy
            .select(&instances)
            .ok_or_else(|| ResolveError::NoInstances {
                service: service.clone(),
            })?;

        let address = instance.base_url();
        debug!(
            service = %service,
            address = %address,
            candidates = instances.len(),
            strategy = self.strategy.name(),
            "Resolved target"
        );
        Ok(address)
    }

    /// Probe `<address>/health`; any answer below 500 counts as alive
    pub async fn health(&self, address: &str) -> bool {
        let url = format!("{}{}", normalize_address(address), HEALTH_PATH);
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => {
                let healthy = !response.status().is_server_error();
                if !healthy {
                    debug!(url = %url, status = response.status().as_u16(), "Health probe failed");
                }
                healthy
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe transport failure");
                false
            }
        }
    }

    /// Time a single `HEAD` probe against the base address.
    ///
    /// The elapsed time is reported even when the probe fails; the value is only
    /// ever used for observability.
    pub async fn latency(&self, address: &str) -> Duration {
        let url = normalize_address(address);
        let started = Instant::now();
        let _ = self
            .client
            .head(&url)
            .timeout(self.probe_timeout)
            .send()
            .await;
        started.elapsed()
    }
}
