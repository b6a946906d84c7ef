//! # Configuration Management
//!
//! The gateway is configured from one YAML document. Durations are written in
//! human-readable form (`"3s"`, `"500ms"`) and parsed with `humantime-serde`.
//!
//! Loading happens in three steps, each of which can fail with a
//! [`GatewayError::Configuration`]:
//!
//! 1. read and parse the file ([`GatewayConfig::load_from_file`])
//! 2. apply `GATEWAY_*` environment overrides ([`GatewayConfig::apply_env_overrides`])
//! 3. validate the result, collecting every problem into one error ([`GatewayConfig::validate`])
//!
//! Secret fields (`redis.password`, `auth.jwt_secret`) may hold the *name* of an
//! environment variable; when that variable is set, its value replaces the field.
//!
//! [`ConfigManager`] watches the file with `notify` and broadcasts every successfully
//! validated reload so long-lived components (the route table) can pick it up.
//!
//! ## Example
//!
//! ```yaml
//! server:
//!   port: 8080
//!   admin_port: 9080
//! routes:
//!   - prefix: /api/user
//!     target: service://user-service
//!     timeout: 5s
//!     retries: 0
//! rate_limit:
//!   enabled: true
//!   requests_per_second: 100
//!   burst: 20
//! circuit_breaker:
//!   enabled: true
//!   failure_threshold: 5
//!   recovery_timeout: 30s
//! discovery:
//!   registry: consul
//!   endpoints: ["http://127.0.0.1:8500"]
//! ```

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;
use crate::discovery::resolver::Target;

/// Environment variable that points at the configuration file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

/// Locations searched, in order, when no explicit path is configured
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/opt/blog-system/configs/gateway.yaml",
    "../../configs/gateway.yaml",
    "configs/gateway.yaml",
];

const MAX_ROUTE_RETRIES: u32 = 10;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Routes in match order; the first matching prefix wins
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file, apply env overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without touching the environment
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Pick the configuration file to load.
    ///
    /// `GATEWAY_CONFIG_PATH` wins when set; otherwise the first existing entry of
    /// [`DEFAULT_CONFIG_PATHS`] is used.
    pub fn resolve_path() -> GatewayResult<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        Self::first_existing(DEFAULT_CONFIG_PATHS).ok_or_else(|| {
            GatewayError::config(format!(
                "No configuration file found; set {} or create one of: {}",
                CONFIG_PATH_ENV,
                DEFAULT_CONFIG_PATHS.join(", ")
            ))
        })
    }

    fn first_existing<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
        candidates
            .iter()
            .map(|p| p.as_ref())
            .find(|p| p.is_file())
            .map(Path::to_path_buf)
    }

    /// Apply `GATEWAY_*` environment variable overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production)
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> GatewayResult<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
        }

        fn duration(key: &str, value: &str) -> GatewayResult<Duration> {
            humantime::parse_duration(value.trim())
                .map_err(|e| GatewayError::config(format!("Invalid {}: {}", key, e)))
        }

        if let Some(v) = lookup("GATEWAY_SERVER_PORT") {
            self.server.port = parse("GATEWAY_SERVER_PORT", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_ADMIN_PORT") {
            self.server.admin_port = parse("GATEWAY_ADMIN_PORT", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_BIND_ADDRESS") {
            self.server.bind_address = v;
        }

        if let Some(v) = lookup("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = v;
        }
        if let Some(v) = lookup("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = v;
        }

        if let Some(v) = lookup("GATEWAY_REDIS_URL") {
            self.redis.url = v;
        }

        if let Some(v) = lookup("GATEWAY_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse("GATEWAY_RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_RATE_LIMIT_RPS") {
            self.rate_limit.requests_per_second = parse("GATEWAY_RATE_LIMIT_RPS", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_RATE_LIMIT_BURST") {
            self.rate_limit.burst = parse("GATEWAY_RATE_LIMIT_BURST", &v)?;
        }

        if let Some(v) = lookup("GATEWAY_CIRCUIT_BREAKER_ENABLED") {
            self.circuit_breaker.enabled = parse("GATEWAY_CIRCUIT_BREAKER_ENABLED", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_CIRCUIT_BREAKER_THRESHOLD") {
            self.circuit_breaker.failure_threshold =
                parse("GATEWAY_CIRCUIT_BREAKER_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_CIRCUIT_BREAKER_RECOVERY_TIMEOUT") {
            self.circuit_breaker.recovery_timeout =
                duration("GATEWAY_CIRCUIT_BREAKER_RECOVERY_TIMEOUT", &v)?;
        }

        if let Some(v) = lookup("GATEWAY_REGISTRY_ENDPOINTS") {
            self.discovery.endpoints = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        // Secret fields may name an environment variable holding the real value
        if let Some(password) = self.redis.password.as_mut() {
            if let Some(value) = lookup(password).filter(|v| !v.is_empty()) {
                *password = value;
            }
        }
        if let Some(secret) = self.auth.jwt_secret.as_mut() {
            if let Some(value) = lookup(secret).filter(|v| !v.is_empty()) {
                *secret = value;
            }
        }

        Ok(())
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }
        if self.server.port != 0 && self.server.port == self.server.admin_port {
            errors.push("server port and admin_port must differ".to_string());
        }

        for (index, route) in self.routes.iter().enumerate() {
            errors.extend(
                route
                    .problems()
                    .into_iter()
                    .map(|problem| format!("Route {} ('{}'): {}", index, route.prefix, problem)),
            );
        }

        let rl = &self.rate_limit;
        if rl.enabled && rl.requests_per_second.saturating_add(rl.burst) == 0 {
            errors.push("rate_limit requests_per_second + burst must be greater than 0".to_string());
        }
        if rl.window.is_zero() {
            errors.push("rate_limit window must be greater than 0".to_string());
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            errors.push("circuit_breaker failure_threshold must be greater than 0".to_string());
        }
        if cb.recovery_timeout.is_zero() {
            errors.push("circuit_breaker recovery_timeout must be greater than 0".to_string());
        }
        if cb.sweep_interval.is_zero() {
            errors.push("circuit_breaker sweep_interval must be greater than 0".to_string());
        }

        let discovery = &self.discovery;
        if discovery.registry == RegistryKind::Consul && discovery.endpoints.is_empty() {
            errors.push("discovery endpoints cannot be empty for the consul registry".to_string());
        }
        if discovery.probe_timeout.is_zero() || discovery.query_timeout.is_zero() {
            errors.push("discovery probe_timeout and query_timeout must be greater than 0".to_string());
        }

        if rl.enabled && rl.store == RateLimitStoreKind::Redis && self.redis.url.is_empty() {
            errors.push("redis url cannot be empty when the redis rate limit store is used".to_string());
        }

        if self.auth.enabled
            && self.auth.jwt_secret.as_deref().map_or(true, str::is_empty)
        {
            errors.push("auth jwt_secret is required when auth is enabled".to_string());
        }

        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!(
                "Invalid log level: {}",
                self.observability.logging.level
            )),
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!(
                "Invalid log format: {}",
                self.observability.logging.format
            )),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// Public port serving `/health` and `/api/*`
    pub port: u16,

    /// Admin port serving `/metrics` and `/admin/*` (0 disables the admin listener)
    pub admin_port: u16,

    /// How long in-flight requests may take to drain on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            admin_port: 9080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn admin_enabled(&self) -> bool {
        self.admin_port != 0
    }
}

/// One route as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Path prefix matched with a plain string-prefix test
    pub prefix: String,

    /// `service://<name>` or a literal base URL
    pub target: String,

    /// Deadline for the forward step
    #[serde(with = "humantime_serde", default = "default_route_timeout")]
    pub timeout: Duration,

    /// Retry budget; carried for operators, the forwarder makes a single attempt
    #[serde(default)]
    pub retries: u32,

    /// Replaces the matched prefix on the downstream path when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_prefix: Option<String>,
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(10)
}

impl RouteDefinition {
    pub fn new(prefix: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            target: target.into(),
            timeout: default_route_timeout(),
            retries: 0,
            rewrite_prefix: None,
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.prefix.is_empty() {
            problems.push("prefix cannot be empty".to_string());
        } else if !self.prefix.starts_with('/') {
            problems.push("prefix must start with '/'".to_string());
        }

        if self.target.is_empty() {
            problems.push("target cannot be empty".to_string());
        } else if let Err(e) = Target::parse(&self.target) {
            problems.push(e.to_string());
        }

        if self.timeout.is_zero() {
            problems.push("timeout must be greater than 0".to_string());
        }

        if self.retries > MAX_ROUTE_RETRIES {
            problems.push(format!("retries must be at most {}", MAX_ROUTE_RETRIES));
        }

        if let Some(rewrite) = &self.rewrite_prefix {
            if !rewrite.is_empty() && !rewrite.starts_with('/') {
                problems.push("rewrite_prefix must start with '/'".to_string());
            }
        }

        problems
    }
}

/// Where rate-limit windows are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStoreKind {
    /// Shared Redis sorted sets; limits hold across gateway instances
    Redis,
    /// Process-local store, for single-instance deployments and tests
    Memory,
}

/// Per-client sliding window rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    pub store: RateLimitStoreKind,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst: 20,
            window: Duration::from_secs(1),
            store: RateLimitStoreKind::Redis,
        }
    }
}

/// Per-target circuit breaking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// When disabled, outcomes are still recorded but the circuit never opens
    pub enabled: bool,

    pub failure_threshold: u32,

    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Admit a single trial request after the recovery timeout instead of closing outright
    pub half_open: bool,

    /// Entries idle for longer than this are dropped by the sweeper
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open: false,
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Which registry backs `service://` targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Consul,
    Static,
}

/// How one instance is picked among those the registry returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    #[default]
    First,
    RoundRobin,
    Weighted,
    Random,
}

/// Service discovery and probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub registry: RegistryKind,

    /// Registry endpoints, tried in order
    pub endpoints: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Timeout for health and latency probes
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    pub selection: SelectionKind,

    /// Instances served by the static registry
    pub instances: Vec<ServiceInstance>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry: RegistryKind::Static,
            endpoints: Vec::new(),
            query_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(3),
            selection: SelectionKind::First,
            instances: Vec::new(),
        }
    }
}

/// Connection settings for the rate-limit store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,

    /// Password, or the name of an environment variable holding it
    pub password: Option<String>,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for each store command; slower calls count as store failures
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// JWT authentication stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,

    /// HS256 secret, or the name of an environment variable holding it
    pub jwt_secret: Option<String>,

    /// Exact paths that skip authentication
    pub skip_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jwt_secret: None,
            skip_paths: vec!["/health".to_string(), "/api/user/login".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any origin
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Watches the configuration file and broadcasts validated reloads
pub struct ConfigManager {
    config_path: PathBuf,
    change_sender: broadcast::Sender<Arc<GatewayConfig>>,
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigManager {
    /// Create a manager for `config_path` without watching it
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        let (change_sender, _) = broadcast::channel(16);
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            change_sender,
            _watcher: None,
        }
    }

    /// Create a manager that reloads whenever the file changes on disk
    pub fn watch<P: AsRef<Path>>(config_path: P) -> GatewayResult<Self> {
        let mut manager = Self::new(config_path);
        manager.setup_file_watcher()?;
        Ok(manager)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayConfig>> {
        self.change_sender.subscribe()
    }

    /// Reload and broadcast the configuration; an invalid file leaves subscribers untouched
    pub async fn reload(&self) -> GatewayResult<Arc<GatewayConfig>> {
        Self::reload_and_broadcast(&self.config_path, &self.change_sender).await
    }

    async fn reload_and_broadcast(
        path: &Path,
        sender: &broadcast::Sender<Arc<GatewayConfig>>,
    ) -> GatewayResult<Arc<GatewayConfig>> {
        let config = Arc::new(GatewayConfig::load_from_file(path).await?);
        // No subscribers is not an error
        let _ = sender.send(Arc::clone(&config));
        tracing::info!(path = %path.display(), routes = config.routes.len(), "Configuration reloaded");
        Ok(config)
    }

    fn setup_file_watcher(&mut self) -> GatewayResult<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        // Editors often replace the file by rename, so watch the directory
        let watch_dir = match self.config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;
        self._watcher = Some(watcher);

        let file_name = self
            .config_path
            .file_name()
            .ok_or_else(|| GatewayError::config("Invalid config file path"))?
            .to_owned();
        let config_path = self.config_path.clone();
        let sender = self.change_sender.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if !touches_config {
                    continue;
                }

                if let EventKind::Modify(_) | EventKind::Create(_) = event.kind {
                    // Let the writer finish
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Err(e) = Self::reload_and_broadcast(&config_path, &sender).await {
                        tracing::error!(error = %e, "Configuration reload rejected, keeping previous routes");
                    }
                }
            }
        });

        tracing::info!(path = %self.config_path.display(), "Watching configuration for changes");
        Ok(())
    }
}
