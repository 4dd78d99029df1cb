//! HTTP surface.
//!
//! A thin layer binding endpoints to components: handlers parse,
//! call one orchestration method, and return its result. The
//! middleware chain runs inbound audit, session validation (on
//! protected routes), and the rate limiter; PHI scrubbing happens at
//! the parse and emit boundaries inside handlers and the orchestrator.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::api_router;
pub use types::ApiContext;
