//! WebRTC data-channel transport (feature `webrtc`).
//!
//! Each link is one `RTCPeerConnection` with a single unordered,
//! zero-retransmit data channel. webrtc-rs callbacks are translated into
//! [`LinkEvent`](crate::transport::LinkEvent)s; writes go through a bounded
//! queue drained by a per-link writer task, so `send` never blocks and a full
//! queue drops the packet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::mpsc;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::PreviewConfig;
use crate::error::TransportError;
use crate::signaling::{IceCandidate, PeerId, SdpKind, SessionDescription};
use crate::transport::{ChannelOptions, LinkEventKind, LinkEventSender, PeerLink, Transport};

/// Transport backed by webrtc-rs.
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<String>,
    write_buffer: usize,
}

impl WebRtcTransport {
    pub fn new(config: &PreviewConfig) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_servers: config.ice_servers.clone(),
            write_buffer: config.packet_buffer(),
        }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn connect(
        &self,
        remote: &PeerId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_config())
            .await
            .map_err(|e| {
                warn!("peer connection to {} failed: {}", remote, e);
                TransportError::Connect(remote.clone())
            })?;
        let pc = Arc::new(pc);

        let (outbound, writer_rx) = mpsc::channel(self.write_buffer);
        let wiring = ChannelWiring {
            events: events.clone(),
            open: Arc::new(AtomicBool::new(false)),
            writer_rx: Arc::new(Mutex::new(Some(writer_rx))),
        };

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(LinkEventKind::LocalCandidate(from_init(init)));
                    }
                    Err(e) => debug!("unserializable local candidate: {}", e),
                }
            })
        }));

        let adopt = wiring.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let wiring = adopt.clone();
            Box::pin(async move {
                wiring.events.emit(LinkEventKind::ChannelAdopted);
                wiring.attach(&dc);
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                trace!("connection to {} is {}", events.peer_id(), state);
                if state == RTCPeerConnectionState::Failed {
                    events.emit(LinkEventKind::ChannelError("connection failed".into()));
                }
            })
        }));

        Ok(Arc::new(WebRtcLink {
            pc,
            wiring,
            outbound,
        }))
    }
}

/// Callback state shared by whichever data channel the link ends up with.
#[derive(Clone)]
struct ChannelWiring {
    events: LinkEventSender,
    open: Arc<AtomicBool>,
    writer_rx: Arc<Mutex<Option<mpsc::Receiver<Bytes>>>>,
}

impl ChannelWiring {
    fn take_writer(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.writer_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn attach(&self, dc: &Arc<RTCDataChannel>) {
        let on_open = self.clone();
        let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                on_open.open.store(true, Ordering::Release);
                if let (Some(dc), Some(rx)) = (weak.upgrade(), on_open.take_writer()) {
                    tokio::spawn(write_loop(dc, rx));
                }
                on_open.events.emit(LinkEventKind::ChannelOpen);
            })
        }));

        let on_message = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = on_message.clone();
            Box::pin(async move {
                events.emit(LinkEventKind::Message(msg.data.to_vec()));
            })
        }));

        let on_close = self.clone();
        dc.on_close(Box::new(move || {
            let wiring = on_close.clone();
            Box::pin(async move {
                wiring.open.store(false, Ordering::Release);
                wiring.events.emit(LinkEventKind::ChannelClosed);
            })
        }));

        let on_error = self.events.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let events = on_error.clone();
            Box::pin(async move {
                events.emit(LinkEventKind::ChannelError(err.to_string()));
            })
        }));
    }
}

async fn write_loop(dc: Arc<RTCDataChannel>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = dc.send(&data).await {
            trace!("data channel write failed: {}", e);
        }
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    wiring: ChannelWiring,
    outbound: mpsc::Sender<Bytes>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| TransportError::Description(e.to_string()))
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_data_channel(&self, options: &ChannelOptions) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&options.label, Some(init))
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        self.wiring.attach(&dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    fn send(&self, data: &[u8]) -> bool {
        self.wiring.open.load(Ordering::Acquire)
            && self.outbound.try_send(Bytes::copy_from_slice(data)).is_ok()
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        let stats = self.pc.get_stats().await;
        stats.reports.values().find_map(|report| match report {
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.current_round_trip_time > 0.0 =>
            {
                Some(Duration::from_secs_f64(pair.current_round_trip_time))
            }
            _ => None,
        })
    }

    async fn close(&self) {
        self.wiring.open.store(false, Ordering::Release);
        if let Err(e) = self.pc.close().await {
            debug!("closing peer connection: {}", e);
        }
    }
}
