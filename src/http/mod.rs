//! HTTP front end: the rate limit middleware and a small server around it.

mod middleware;
mod server;

pub use middleware::{rate_limit_middleware, RATE_LIMITED_BODY};
pub use server::HttpServer;
