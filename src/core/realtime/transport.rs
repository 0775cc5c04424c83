//! Peer connection abstraction used by the session state machine.
//!
//! A [`PeerConnector`] creates one [`PeerConnection`] per connection attempt.
//! The connection owns local audio capture, the media transport and the
//! `oai-events` data channel that carries the JSON protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::base::RealtimeResult;

/// Label of the data channel carrying protocol events.
pub const EVENTS_CHANNEL_LABEL: &str = "oai-events";

/// An open data channel as a pair of text queues.
///
/// `inbound` yields `None` once the remote side closes the channel.
#[derive(Debug)]
pub struct DataChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// One peer connection attempt.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Build the local SDP offer.
    async fn create_offer(&self) -> RealtimeResult<String>;

    /// Apply the remote SDP answer.
    async fn apply_answer(&self, sdp_answer: &str) -> RealtimeResult<()>;

    /// Resolve once the events channel is open.
    async fn open_channel(&self) -> RealtimeResult<DataChannel>;

    /// Stop sending local audio and release the capture source, if any.
    async fn release_audio(&self);

    /// Close the data channel and the underlying connection.
    async fn close(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Acquire local audio and create a fresh peer connection.
    async fn connect(&self) -> RealtimeResult<Arc<dyn PeerConnection>>;
}
