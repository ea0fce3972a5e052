//! Production [`PeerLink`] on the `webrtc` crate.
//!
//! One `RTCPeerConnection` per remote peer with a single ordered reliable
//! data channel named `ledger`. Instead of pacing sends purely by timer, the
//! link watches the channel's buffered amount and waits for headroom,
//! failing with [`NetError::Congested`] if the channel stays saturated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use scrapyard_shared::constants::DATA_CHANNEL_LABEL;

use crate::error::{NetError, Result};
use crate::link::{LinkEvent, LinkFactory, PeerLink};

/// Stop queueing new frames while this much is still buffered.
const BUFFERED_HIGH_WATER: usize = 1024 * 1024;

/// How long a send may wait for channel headroom.
const CONGESTION_DEADLINE: Duration = Duration::from_secs(10);

/// Builds [`RtcLink`]s against a shared WebRTC API object.
pub struct RtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl LinkFactory for RtcFactory {
    async fn create_link(
        &self,
        peer_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<(String, LinkEvent)>,
    ) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        {
            let events = events.clone();
            let peer = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Ok(value) = serde_json::to_value(init) {
                                let _ = events.send((peer, LinkEvent::IceCandidate(value)));
                            }
                        }
                        Err(e) => debug!(error = %e, "dropping unserializable candidate"),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let peer = peer_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    debug!(peer = %peer, ?state, "peer connection state");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        let _ = events.send((peer, LinkEvent::Failed));
                    }
                })
            }));
        }

        if initiator {
            let dc = pc
                .create_data_channel(
                    DATA_CHANNEL_LABEL,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            wire_channel(&channel, dc, peer_id.to_string(), events.clone());
        } else {
            let slot = channel.clone();
            let events = events.clone();
            let peer = peer_id.to_string();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                if dc.label() != DATA_CHANNEL_LABEL {
                    debug!(label = %dc.label(), "ignoring unexpected data channel");
                    return Box::pin(async {});
                }
                wire_channel(&slot, dc, peer.clone(), events.clone());
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(RtcLink { pc, channel }))
    }
}

fn wire_channel(
    slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    dc: Arc<RTCDataChannel>,
    peer: String,
    events: mpsc::UnboundedSender<(String, LinkEvent)>,
) {
    *slot.lock().expect("channel slot lock") = Some(dc.clone());

    {
        let events = events.clone();
        let peer = peer.clone();
        dc.on_open(Box::new(move || {
            let _ = events.send((peer.clone(), LinkEvent::Open));
            Box::pin(async {})
        }));
    }
    {
        let events = events.clone();
        let peer = peer.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = events.send((peer.clone(), LinkEvent::Message(text)));
            Box::pin(async {})
        }));
    }
    dc.on_close(Box::new(move || {
        let _ = events.send((peer.clone(), LinkEvent::Closed));
        Box::pin(async {})
    }));
}

/// One peer connection plus its `ledger` channel.
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

impl RtcLink {
    fn open_channel(&self) -> Result<Arc<RTCDataChannel>> {
        self.channel
            .lock()
            .expect("channel slot lock")
            .clone()
            .ok_or(NetError::ChannelNotOpen)
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &serde_json::Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let dc = self.open_channel()?;

        // Wait for headroom instead of piling frames into the SCTP buffer.
        let deadline = Instant::now() + CONGESTION_DEADLINE;
        while dc.buffered_amount().await > BUFFERED_HIGH_WATER {
            if Instant::now() >= deadline {
                warn!("data channel congested, giving up on send");
                return Err(NetError::Congested);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "error closing peer connection");
        }
    }
}
