//! Realtime credential and signaling handlers
//!
//! # Endpoints
//!
//! - `POST /realtime/session` - issue an ephemeral credential (model and
//!   voice optional, configured defaults apply)
//! - `POST /realtime/sessions` - create an upstream session (`model` required)
//! - `POST /realtime/ws` - exchange an SDP offer for the provider's answer
//!   (`ephemeralKey`, `model` and `sdp` required; answered as `application/sdp`)
//!
//! Every endpoint sits behind its own fixed-window limiter; throttled callers
//! get `429` with a `Retry-After` header before the handler runs.

mod handler;

pub use handler::{create_credential, create_session, negotiate};
