//! The dispatch pipeline and the HTTP servers in front of it.

pub mod server;
pub mod service;

pub use server::{shutdown_signal, spawn_route_reloader, GatewayServer, HEALTH_MESSAGE};
pub use service::GatewayService;
