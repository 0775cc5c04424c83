pub mod rate_limit;

// Re-export middleware functions
pub use rate_limit::{RouteLimit, client_key, rate_limit_middleware};
