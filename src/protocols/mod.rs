pub mod http;

pub use http::{forward_headers, is_hop_by_hop, ProxyForwarder, HOP_BY_HOP_HEADERS};
