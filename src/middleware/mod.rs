pub mod cors;
pub mod rate_limiting;
pub mod request_id;

pub use cors::cors_layer;
pub use rate_limiting::{
    create_window_store, InMemoryWindowStore, RateLimitDecision, RateLimitError, RateLimiter,
    RedisWindowStore, WindowStore,
};
pub use request_id::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
