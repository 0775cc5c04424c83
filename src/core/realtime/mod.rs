//! Realtime session client.
//!
//! Connects to a realtime speech model through the relay and exposes the
//! conversation as typed events.
//!
//! # Architecture
//!
//! - [`PeerSession`] drives the connection lifecycle (`Idle` → `Connecting`
//!   → `Active` → `Closed`/`Error`)
//! - [`Signaling`] fetches the ephemeral credential and exchanges SDP
//! - [`PeerConnector`] / [`PeerConnection`] abstract the media transport
//!   (WebRTC with the `webrtc` feature)
//! - [`EventBus`] decodes data-channel frames and fans them out by type
//! - [`FunctionCallDispatcher`] answers model tool calls
//!
//! # Example
//!
//! ```rust,ignore
//! use realtime_relay::core::realtime::{
//!     FunctionCallDispatcher, PeerSession, SessionConfig, ServerEventKind, WebRtcConnector,
//! };
//! use std::sync::Arc;
//!
//! let dispatcher = FunctionCallDispatcher::new();
//! dispatcher.register_fn("get_time", |_args| async { Ok(serde_json::json!({"time": "12:00"})) });
//!
//! let session = PeerSession::with_relay(SessionConfig::default(), Arc::new(WebRtcConnector::new()))?
//!     .with_dispatcher(dispatcher);
//! session.start().await?;
//!
//! if let Some(bus) = session.bus() {
//!     bus.on(ServerEventKind::AudioTranscriptDone, |event| println!("{event:?}"));
//! }
//! ```

mod base;
mod bus;
mod functions;
pub mod messages;
mod session;
mod signaling;
mod transport;
#[cfg(feature = "webrtc")]
mod webrtc;

pub use base::{RealtimeError, RealtimeResult, SessionStatus};
pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use functions::{
    FUNCTION_EXECUTION_FAILED, FunctionCallDispatcher, FunctionError, FunctionHandler,
    FunctionResult, PendingFunctionCall,
};
pub use messages::{
    ClientEvent, ConversationItem, ServerEvent, ServerEventKind, SessionUpdate, ToolDefinition,
};
pub use session::{PeerSession, SessionConfig};
pub use signaling::{RelayClient, SessionCredential, Signaling};
pub use transport::{DataChannel, EVENTS_CHANNEL_LABEL, PeerConnection, PeerConnector};
#[cfg(feature = "webrtc")]
pub use webrtc::{WebRtcConnector, WebRtcPeer};
