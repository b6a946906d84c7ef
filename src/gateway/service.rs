//! # Gateway Service
//!
//! Runs the fixed dispatch pipeline for one request:
//!
//! 1. rate limit on the caller's key (429)
//! 2. first-match route lookup (404)
//! 3. circuit breaker admission for the route target (503)
//! 4. target resolution (500 when misconfigured, 503 plus a breaker failure otherwise)
//! 5. health probe of the resolved address (503 plus a breaker failure)
//! 6. forward downstream (502 plus a breaker failure on transport errors)
//!
//! Every stage turns its failure into a [`ProxyResponse`]; `handle` never fails.
//! Breaker state is always keyed by the route's target string, whatever address it
//! resolved to.

use humantime::format_duration;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{ProxyRequest, ProxyResponse};
use crate::discovery::ServiceResolver;
use crate::middleware::{create_window_store, RateLimitDecision, RateLimiter};
use crate::observability::metrics;
use crate::protocols::ProxyForwarder;
use crate::routing::{Route, RouteTable};

/// The dispatch pipeline and the components it owns
#[derive(Debug, Clone)]
pub struct GatewayService {
    rate_limiter: Arc<RateLimiter>,
    routes: Arc<RouteTable>,
    breaker: Arc<CircuitBreaker>,
    resolver: Arc<ServiceResolver>,
    forwarder: ProxyForwarder,
}

impl GatewayService {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        routes: Arc<RouteTable>,
        breaker: Arc<CircuitBreaker>,
        resolver: Arc<ServiceResolver>,
        forwarder: ProxyForwarder,
    ) -> Self {
        Self {
            rate_limiter,
            routes,
            breaker,
            resolver,
            forwarder,
        }
    }

    /// Wire every component from configuration with one shared HTTP client
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()?;

        let store = create_window_store(&config.rate_limit, &config.redis)
            .map_err(|e| GatewayError::config(format!("Rate limit store: {}", e)))?;
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), store));
        let routes = Arc::new(RouteTable::from_definitions(&config.routes));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let resolver = Arc::new(ServiceResolver::from_config(
            &config.discovery,
            client.clone(),
        )?);
        let forwarder = ProxyForwarder::new(client, Arc::clone(&breaker));

        info!(
            routes = routes.len(),
            rate_limit_store = ?config.rate_limit.store,
            registry = ?config.discovery.registry,
            selection = resolver.strategy_name(),
            "Gateway service initialized"
        );

        Ok(Self::new(rate_limiter, routes, breaker, resolver, forwarder))
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        &self.resolver
    }

    /// Run the pipeline and record the outcome
    #[instrument(
        name = "dispatch",
        skip(self, request),
        fields(request_id = %request.id, method = %request.method, path = %request.path)
    )]
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        let (route, result) = self.dispatch(&request).await;

        let response = match result {
            Ok(response) => response,
            Err(err) => err.into_proxy_response(),
        };

        let elapsed = started.elapsed();
        let route_label = route
            .as_ref()
            .map_or(metrics::UNMATCHED_ROUTE, |r| r.prefix.as_str());
        metrics::record_request(route_label, response.status.as_u16(), elapsed);

        info!(
            request_id = %request.id,
            method = %request.method,
            path = %request.path,
            route = route_label,
            status = response.status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        response
    }

    async fn dispatch(
        &self,
        request: &ProxyRequest,
    ) -> (Option<Arc<Route>>, GatewayResult<ProxyResponse>) {
        if let Err(err) = self.admit(request).await {
            return (None, Err(err));
        }

        let Some(route) = self.routes.match_route(&request.path) else {
            warn!(request_id = %request.id, path = %request.path, "No route matched");
            return (None, Err(GatewayError::route_not_found(&request.path)));
        };

        let result = self.dispatch_route(&route, request).await;
        (Some(route), result)
    }

    async fn admit(&self, request: &ProxyRequest) -> GatewayResult<()> {
        let client = request.client_key();
        match self.rate_limiter.check(&client).await {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => {
                metrics::record_rate_limited();
                warn!(
                    request_id = %request.id,
                    client = %client,
                    path = %request.path,
                    "Rate limit exceeded"
                );
                let config = self.rate_limiter.config();
                Err(GatewayError::RateLimitExceeded {
                    limit: self.rate_limiter.limit(),
                    window: format_duration(config.window).to_string(),
                })
            }
            RateLimitDecision::StoreUnavailable(e) => {
                metrics::record_rate_limiter_degraded();
                warn!(
                    request_id = %request.id,
                    client = %client,
                    error = %e,
                    "Rate limit store unavailable, admitting request"
                );
                Ok(())
            }
        }
    }

    async fn dispatch_route(
        &self,
        route: &Route,
        request: &ProxyRequest,
    ) -> GatewayResult<ProxyResponse> {
        let target = route.target.as_str();

        if !self.breaker.allow_request(target) {
            metrics::record_circuit_open(target);
            warn!(request_id = %request.id, target_key = %target, "Circuit open, rejecting request");
            return Err(GatewayError::circuit_open(target));
        }

        let address = match self.ready_address(target, request).await {
            Ok(address) => address,
            Err(e) => {
                self.breaker.record_error(target, &e);
                return Err(e);
            }
        };

        self.forwarder.forward(route, &address, request).await
    }

    /// Resolve `target` and check that the chosen address answers its health probe
    async fn ready_address(&self, target: &str, request: &ProxyRequest) -> GatewayResult<String> {
        let address = match self.resolver.resolve(target).await {
            Ok(address) => address,
            Err(e) if e.is_misconfiguration() => {
                error!(request_id = %request.id, target_key = %target, error = %e, "Route target is misconfigured");
                return Err(GatewayError::unresolved(target, e.to_string()));
            }
            Err(e) => {
                metrics::record_upstream_failure(target, "unresolved");
                warn!(request_id = %request.id, target_key = %target, error = %e, "Target could not be resolved");
                return Err(GatewayError::service_unavailable(target, e.to_string()));
            }
        };

        if !self.resolver.health(&address).await {
            metrics::record_upstream_failure(target, "unhealthy");
            warn!(
                request_id = %request.id,
                target_key = %target,
                address = %address,
                "Target failed its health probe"
            );
            return Err(GatewayError::service_unavailable(
                target,
                format!("{} failed its health probe", address),
            ));
        }

        Ok(address)
    }
}
