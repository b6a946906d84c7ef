//! # HTTP Integration Tests
//!
//! Runs the public and admin servers on ephemeral ports and talks to them over real
//! sockets, so peer addresses come from the connection itself.

use serde_json::Value;
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use blog_gateway::core::config::{RateLimitStoreKind, RouteDefinition};
use blog_gateway::core::error::GatewayResult;
use blog_gateway::{GatewayConfig, GatewayServer, GatewayService, ServiceInstance};

struct RunningGateway {
    gateway: SocketAddr,
    admin: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<GatewayResult<()>>,
}

impl RunningGateway {
    async fn start(config: GatewayConfig) -> Self {
        let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = gateway_listener.local_addr().unwrap();
        let admin = admin_listener.local_addr().unwrap();

        let service = GatewayService::from_config(&config).unwrap();
        let server = GatewayServer::new(config, service);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(gateway_listener, Some(admin_listener), async move {
            let _ = stopped.await;
        }));

        Self {
            gateway,
            admin,
            stop,
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.gateway, path)
    }

    fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin, path)
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

async fn user_service() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/user/info/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\":1}"))
        .mount(&server)
        .await;
    server
}

fn config_for(server: &MockServer) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.rate_limit.store = RateLimitStoreKind::Memory;
    config.server.shutdown_timeout = Duration::from_secs(2);
    config.routes = vec![RouteDefinition::new("/api/user", "service://user-service")];
    config.discovery.instances = vec![ServiceInstance::new("user-service", server.uri())];
    config
}

#[tokio::test]
async fn test_health_and_proxy_over_sockets() {
    let downstream = user_service().await;
    let gateway = RunningGateway::start(config_for(&downstream)).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(gateway.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "gateway");

    let response = client
        .get(gateway.url("/api/user/info/1"))
        .header("x-forwarded-for", "1.2.3.4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "{\"id\":1}");

    let received = downstream.received_requests().await.unwrap();
    let forwarded = received
        .iter()
        .find(|r| r.url.path() == "/api/user/info/1")
        .unwrap();
    assert_eq!(
        forwarded.headers.get("x-forwarded-for").unwrap(),
        "1.2.3.4, 127.0.0.1"
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_method_is_rejected() {
    let downstream = user_service().await;
    let gateway = RunningGateway::start(config_for(&downstream)).await;

    let response = reqwest::Client::new()
        .delete(gateway.url("/api/user/info/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_admin_endpoints_over_sockets() {
    let downstream = user_service().await;
    let gateway = RunningGateway::start(config_for(&downstream)).await;
    let client = reqwest::Client::new();

    let routes: Value = client
        .get(gateway.admin_url("/admin/routes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(routes[0]["target"], "service://user-service");

    let probe: Value = client
        .get(gateway.admin_url("/admin/targets/health?target=service://user-service"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(probe["healthy"], true);

    let reset = client
        .delete(gateway.admin_url("/admin/rate-limits?client=127.0.0.1"))
        .send()
        .await
        .unwrap();
    assert_eq!(reset.status(), 204);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_config_file_drives_the_gateway() {
    let downstream = user_service().await;
    let yaml = format!(
        r#"
routes:
  - prefix: /api/user
    target: service://user-service
    timeout: 2s
rate_limit:
  requests_per_second: 2
  burst: 0
  window: 5s
  store: memory
discovery:
  registry: static
  instances:
    - name: user-service
      address: "{}"
"#,
        downstream.uri()
    );
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = GatewayConfig::load_from_file(file.path()).await.unwrap();
    let gateway = RunningGateway::start(config).await;
    let client = reqwest::Client::new();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = client.get(gateway.url("/api/user/info/1")).send().await.unwrap();
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429]);

    gateway.shutdown().await;
}
