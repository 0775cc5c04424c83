//! HTTP request handlers
//!
//! - `api` - Health check endpoint
//! - `realtime` - Credential issuance, session creation and SDP negotiation

pub mod api;
pub mod realtime;

pub use api::health_check;
