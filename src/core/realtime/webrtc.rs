//! WebRTC-backed [`PeerConnector`].
//!
//! Builds a peer connection with one audio transceiver and the `oai-events`
//! data channel, then bridges the channel to the text queues of
//! [`DataChannel`]. The offer is produced after ICE gathering completes, so
//! no trickle ICE exchange is needed with the relay.
//!
//! Microphone capture is platform specific and lives outside this crate: the
//! caller hands in a [`TrackLocal`] fed from its capture device through
//! [`WebRtcConnector::with_local_track`]. Without one the audio transceiver is
//! receive-only and the model's voice is still delivered.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;

use super::base::{RealtimeError, RealtimeResult};
use super::transport::{DataChannel, EVENTS_CHANNEL_LABEL, PeerConnection, PeerConnector};

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

type InboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

fn rtc_error(context: &'static str) -> impl Fn(webrtc::Error) -> RealtimeError {
    move |e| RealtimeError::Negotiation(format!("{context}: {e}"))
}

/// Creates [`WebRtcPeer`]s.
#[derive(Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
    local_track: Option<Arc<dyn TrackLocal + Send + Sync>>,
}

impl std::fmt::Debug for WebRtcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcConnector")
            .field("ice_servers", &self.ice_servers)
            .field("local_track", &self.local_track.as_ref().map(|t| t.id().to_string()))
            .finish()
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            local_track: None,
        }
    }
}

impl WebRtcConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            local_track: None,
        }
    }

    /// Send `track` as the local audio of every peer this connector creates.
    pub fn with_local_track(mut self, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        self.local_track = Some(track);
        self
    }
}

enum LocalAudio {
    Sending(Arc<RTCRtpSender>),
    ReceiveOnly(Arc<RTCRtpTransceiver>),
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self) -> RealtimeResult<Arc<dyn PeerConnection>> {
        let id = Uuid::new_v4();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(rtc_error("Failed to register codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_error("Failed to register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let inner = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(rtc_error("Failed to create peer connection"))?,
        );

        let audio = match &self.local_track {
            Some(track) => {
                let sender = inner
                    .add_track(Arc::clone(track))
                    .await
                    .map_err(rtc_error("Failed to add local audio track"))?;
                // Drain RTCP so interceptors keep running
                let rtcp = Arc::clone(&sender);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while rtcp.read(&mut buf).await.is_ok() {}
                });
                LocalAudio::Sending(sender)
            }
            None => {
                let init = RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                };
                let transceiver = inner
                    .add_transceiver_from_kind(RTPCodecType::Audio, Some(init))
                    .await
                    .map_err(rtc_error("Failed to add audio transceiver"))?;
                LocalAudio::ReceiveOnly(transceiver)
            }
        };

        let channel = inner
            .create_data_channel(EVENTS_CHANNEL_LABEL, None)
            .await
            .map_err(rtc_error("Failed to create data channel"))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inbound: InboundSlot = Arc::new(Mutex::new(Some(inbound_tx)));
        let (open_tx, open_rx) = oneshot::channel();
        let open_tx = Arc::new(Mutex::new(Some(open_tx)));

        channel.on_open(Box::new(move || {
            if let Some(tx) = open_tx.lock().take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        let slot = inbound.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        if let Some(tx) = slot.lock().as_ref() {
                            let _ = tx.send(text);
                        }
                    }
                    Err(e) => debug!(error = %e, "Dropping non UTF-8 data channel frame"),
                }
            }
            Box::pin(async {})
        }));

        let slot = inbound.clone();
        channel.on_close(Box::new(move || {
            slot.lock().take();
            Box::pin(async {})
        }));

        let slot = inbound.clone();
        inner.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(peer_id = %id, ?state, "Peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                slot.lock().take();
            }
            Box::pin(async {})
        }));

        inner.on_track(Box::new(move |track, _, _| {
            debug!(peer_id = %id, kind = %track.kind(), "Remote track received");
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer {
            id,
            inner,
            audio,
            channel,
            opened: Mutex::new(Some(open_rx)),
            inbound: Mutex::new(Some(inbound_rx)),
            forwarder: Mutex::new(None),
        }))
    }
}

/// One WebRTC connection to the realtime provider.
pub struct WebRtcPeer {
    id: Uuid,
    inner: Arc<RTCPeerConnection>,
    audio: LocalAudio,
    channel: Arc<RTCDataChannel>,
    opened: Mutex<Option<oneshot::Receiver<()>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcPeer {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> RealtimeResult<String> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(rtc_error("Failed to create offer"))?;

        let mut gathered = self.inner.gathering_complete_promise().await;
        self.inner
            .set_local_description(offer)
            .await
            .map_err(rtc_error("Failed to set local description"))?;
        let _ = gathered.recv().await;

        let local = self
            .inner
            .local_description()
            .await
            .ok_or_else(|| RealtimeError::Negotiation("No local description".to_string()))?;
        Ok(local.sdp)
    }

    async fn apply_answer(&self, sdp_answer: &str) -> RealtimeResult<()> {
        let answer = RTCSessionDescription::answer(sdp_answer.to_string())
            .map_err(rtc_error("Invalid SDP answer"))?;
        self.inner
            .set_remote_description(answer)
            .await
            .map_err(rtc_error("Failed to set remote description"))
    }

    async fn open_channel(&self) -> RealtimeResult<DataChannel> {
        let opened = self
            .opened
            .lock()
            .take()
            .ok_or_else(|| RealtimeError::Channel("Channel already opened".to_string()))?;
        opened
            .await
            .map_err(|_| RealtimeError::Channel("Channel closed before opening".to_string()))?;

        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| RealtimeError::Channel("Channel already opened".to_string()))?;

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let channel = self.channel.clone();
        let id = self.id;
        let forwarder = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = channel.send_text(text).await {
                    warn!(peer_id = %id, error = %e, "Failed to send on data channel");
                    break;
                }
            }
        });
        *self.forwarder.lock() = Some(forwarder);

        Ok(DataChannel { outbound, inbound })
    }

    async fn release_audio(&self) {
        let result = match &self.audio {
            LocalAudio::Sending(sender) => self.inner.remove_track(sender).await,
            LocalAudio::ReceiveOnly(transceiver) => transceiver.stop().await,
        };
        if let Err(e) = result {
            debug!(peer_id = %self.id, error = %e, "Failed to release local audio");
        }
    }

    async fn close(&self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        if let Err(e) = self.channel.close().await {
            debug!(peer_id = %self.id, error = %e, "Failed to close data channel");
        }
        if let Err(e) = self.inner.close().await {
            warn!(peer_id = %self.id, error = %e, "Failed to close peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    fn offline_connector() -> WebRtcConnector {
        WebRtcConnector::with_ice_servers(Vec::new())
    }

    #[tokio::test]
    async fn test_without_local_track_audio_is_receive_only() {
        let peer = offline_connector().connect().await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("a=recvonly"));

        peer.release_audio().await;
        peer.close().await;
    }

    #[tokio::test]
    async fn test_local_track_is_sent() {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "microphone".to_owned(),
            "relay".to_owned(),
        ));
        let connector = offline_connector().with_local_track(track);

        let peer = connector.connect().await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("a=sendrecv"));

        peer.release_audio().await;
        peer.close().await;
    }
}
