//! Service discovery: registries that know where services live, and the resolver
//! that turns route targets into addresses and probes them.

pub mod registry;
pub mod resolver;

pub use registry::{create_registry, ConsulRegistry, RegistryError, ServiceRegistry, StaticRegistry};
pub use resolver::{ResolveError, ServiceResolver, Target, SERVICE_SCHEME};
