//! # Authentication
//!
//! Optional HS256 JWT stage in front of the proxy handler. A verified token sets
//! `X-User-ID` for downstream services and attaches an [`AuthContext`] that the
//! proxy handler uses as the rate-limit identity.

pub mod jwt;
pub mod middleware;

pub use jwt::{AuthContext, Authenticator, Claims, JwtAuthenticator};
pub use middleware::{auth_middleware, AuthGuard, USER_ID_HEADER};
