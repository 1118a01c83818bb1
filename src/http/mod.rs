//! HTTP surface: server listing, server creation, WebSocket entry point.

pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::build_router;
