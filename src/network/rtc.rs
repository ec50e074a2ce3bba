//! Preferred transport: receive-only WebRTC audio
//!
//! Signaling runs over its own WebSocket. Once the first remote track arrives
//! the media task decodes Opus RTP into f32 samples for the ingest task,
//! concealing sequence gaps with PLC. Loss and interarrival jitter are tracked
//! from the RTP headers and logged by the stats task; they do not drive the
//! buffer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::decoder::{OpusDecoder, OPUS_SAMPLE_RATE};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::network::manager::LossNotifier;
use crate::network::signaling::SignalingChannel;
use crate::protocol::{IngestMessage, Outbound, SignalingMessage, StreamFormat};

/// Decode everything as stereo; mono Opus streams upmix cleanly
const OPUS_CHANNELS: u16 = 2;

/// 20 ms Opus packets
const OPUS_PACKET_FRAMES: u32 = 960;

/// Longest gap concealed with PLC; beyond this the buffer underruns instead
const MAX_CONCEALED_PACKETS: u16 = 5;

/// How a packet relates to the sequence seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    InOrder,
    /// Packet follows a gap of this many missing packets
    Gap(u16),
    /// Duplicate or reordered behind the newest packet
    Stale,
}

/// RTP receive statistics (RFC 3550 loss and interarrival jitter)
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpStats {
    pub received: u64,
    pub lost: u64,
    pub stale: u64,
    /// Smoothed jitter in RTP clock units
    jitter: f64,
    last_seq: Option<u16>,
    last_timing: Option<(u32, u32)>,
}

impl RtpStats {
    /// Record one packet. `arrival` is the local receive time in RTP clock units.
    pub fn observe(&mut self, seq: u16, timestamp: u32, arrival: u32) -> PacketVerdict {
        let verdict = match self.last_seq {
            None => PacketVerdict::InOrder,
            Some(last) => match seq.wrapping_sub(last) {
                0 | 0x8000..=u16::MAX => {
                    self.stale += 1;
                    return PacketVerdict::Stale;
                }
                1 => PacketVerdict::InOrder,
                delta => {
                    self.lost += (delta - 1) as u64;
                    PacketVerdict::Gap(delta - 1)
                }
            },
        };
        self.last_seq = Some(seq);
        self.received += 1;

        if let Some((last_ts, last_arrival)) = self.last_timing {
            let d = arrival.wrapping_sub(last_arrival) as i32 as i64
                - timestamp.wrapping_sub(last_ts) as i32 as i64;
            self.jitter += (d.abs() as f64 - self.jitter) / 16.0;
        }
        self.last_timing = Some((timestamp, arrival));
        verdict
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1000.0 / OPUS_SAMPLE_RATE as f64
    }

    pub fn loss_rate(&self) -> f64 {
        let expected = self.received + self.lost;
        if expected == 0 {
            0.0
        } else {
            self.lost as f64 / expected as f64
        }
    }
}

/// Live WebRTC session
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    signaling: SignalingChannel,
    tasks: Vec<JoinHandle<()>>,
}

impl RtcSession {
    /// Negotiate a receive-only audio session.
    ///
    /// Signaling connect, offer and answer share the signaling bound; track
    /// arrival after the answer has its own. Any failure tears everything
    /// down before returning.
    pub async fn connect(
        config: &TransportConfig,
        ingest_tx: mpsc::Sender<IngestMessage>,
        notifier: LossNotifier,
    ) -> Result<Self, TransportError> {
        let signaling_timeout = config.signaling_timeout_ms;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(signaling_timeout);

        let connect = SignalingChannel::connect(&config.signaling_url);
        let mut signaling = match tokio::time::timeout_at(deadline, connect).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::SignalingTimeout(signaling_timeout)),
        };

        let pc = match new_peer_connection(config).await {
            Ok(pc) => pc,
            Err(e) => {
                signaling.close().await;
                return Err(e);
            }
        };

        let (mut track_rx, mut failed_rx) = install_handlers(&pc, &signaling);
        let result = negotiate(
            &pc,
            &mut signaling,
            &mut track_rx,
            &mut failed_rx,
            deadline,
            config,
        )
        .await;

        let track = match result {
            Ok(track) => track,
            Err(e) => {
                signaling.close().await;
                if let Err(close_err) = pc.close().await {
                    tracing::debug!(error = %close_err, "Peer connection close failed");
                }
                return Err(e);
            }
        };

        tracing::info!(ssrc = track.ssrc(), "WebRTC track received");

        let stats = Arc::new(Mutex::new(RtpStats::default()));
        let inbound = signaling.take_inbound();
        let tasks = vec![
            tokio::spawn(media_loop(track, ingest_tx, stats.clone(), notifier.clone())),
            tokio::spawn(supervise(pc.clone(), inbound, failed_rx, notifier)),
            tokio::spawn(stats_loop(
                stats,
                Duration::from_millis(config.stats_interval_ms.max(1)),
            )),
        ];

        Ok(Self {
            pc,
            signaling,
            tasks,
        })
    }

    /// Status reports ride on the signaling socket
    pub fn control_sender(&self) -> mpsc::Sender<Outbound> {
        self.signaling.sender()
    }

    /// Abort media and stats, send `close`, close signaling and the peer connection
    pub async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.signaling.close().await;
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "Peer connection close failed");
        }
    }
}

impl Drop for RtcSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn new_peer_connection(config: &TransportConfig) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    );

    pc.add_transceiver_from_kind(
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await?;
    Ok(pc)
}

type TrackReceiver = oneshot::Receiver<Arc<TrackRemote>>;
type FailureReceiver = mpsc::UnboundedReceiver<RTCPeerConnectionState>;

fn install_handlers(pc: &RTCPeerConnection, signaling: &SignalingChannel) -> (TrackReceiver, FailureReceiver) {
    let (track_tx, track_rx) = oneshot::channel();
    let track_tx = Arc::new(Mutex::new(Some(track_tx)));
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        if let Some(tx) = track_tx.lock().take() {
            let _ = tx.send(track);
        }
        Box::pin(async {})
    }));

    let outbound = signaling.sender();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let outbound = outbound.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let msg = SignalingMessage::Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    };
                    let _ = outbound.send(Outbound::Signal(msg)).await;
                }
                Err(e) => tracing::debug!(error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    let (failed_tx, failed_rx) = mpsc::unbounded_channel();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(%state, "Peer connection state");
        if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
            let _ = failed_tx.send(state);
        }
        Box::pin(async {})
    }));

    (track_rx, failed_rx)
}

fn candidate_init(candidate: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate,
        sdp_mid,
        sdp_mline_index,
        username_fragment: None,
    }
}

/// Offer/answer within the signaling deadline, then wait for the track
async fn negotiate(
    pc: &RTCPeerConnection,
    signaling: &mut SignalingChannel,
    track_rx: &mut TrackReceiver,
    failed_rx: &mut FailureReceiver,
    deadline: tokio::time::Instant,
    config: &TransportConfig,
) -> Result<Arc<TrackRemote>, TransportError> {
    let exchange = exchange_offer(pc, signaling, failed_rx);
    match tokio::time::timeout_at(deadline, exchange).await {
        Ok(result) => result?,
        Err(_) => return Err(TransportError::SignalingTimeout(config.signaling_timeout_ms)),
    }

    let track_timeout = config.track_timeout_ms;
    let arrival = await_track(pc, signaling, track_rx, failed_rx);
    match tokio::time::timeout(Duration::from_millis(track_timeout), arrival).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::TrackTimeout(track_timeout)),
    }
}

fn failure(state: Option<RTCPeerConnectionState>) -> TransportError {
    let state = state.map(|s| s.to_string()).unwrap_or_default();
    TransportError::ConnectionFailed(format!("peer connection {}", state))
}

/// Send the offer and wait for the answer.
///
/// Remote candidates are only valid once the answer is applied, so earlier
/// ones are queued and added right after it.
async fn exchange_offer(
    pc: &RTCPeerConnection,
    signaling: &mut SignalingChannel,
    failed_rx: &mut FailureReceiver,
) -> Result<(), TransportError> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;
    signaling.send(SignalingMessage::Offer { sdp: offer.sdp }).await?;

    let mut pending = Vec::new();
    loop {
        tokio::select! {
            state = failed_rx.recv() => return Err(failure(state)),
            msg = signaling.recv() => match msg {
                Some(SignalingMessage::Answer { sdp }) => {
                    pc.set_remote_description(RTCSessionDescription::answer(sdp)?).await?;
                    for init in pending.drain(..) {
                        pc.add_ice_candidate(init).await?;
                    }
                    return Ok(());
                }
                Some(SignalingMessage::Candidate { candidate, sdp_mid, sdp_mline_index }) => {
                    pending.push(candidate_init(candidate, sdp_mid, sdp_mline_index));
                }
                Some(SignalingMessage::Error { reason }) => return Err(TransportError::Rejected(reason)),
                Some(SignalingMessage::Close) | None => return Err(TransportError::Closed),
                Some(SignalingMessage::Offer { .. }) => {
                    tracing::debug!("Ignoring remote offer during negotiation");
                }
            }
        }
    }
}

/// Trickle candidates until the first remote track arrives
async fn await_track(
    pc: &RTCPeerConnection,
    signaling: &mut SignalingChannel,
    track_rx: &mut TrackReceiver,
    failed_rx: &mut FailureReceiver,
) -> Result<Arc<TrackRemote>, TransportError> {
    loop {
        tokio::select! {
            track = &mut *track_rx => {
                return track.map_err(|_| TransportError::Negotiation("track handler dropped".to_string()));
            }
            state = failed_rx.recv() => return Err(failure(state)),
            msg = signaling.recv() => match msg {
                Some(SignalingMessage::Candidate { candidate, sdp_mid, sdp_mline_index }) => {
                    pc.add_ice_candidate(candidate_init(candidate, sdp_mid, sdp_mline_index)).await?;
                }
                Some(SignalingMessage::Error { reason }) => return Err(TransportError::Rejected(reason)),
                Some(SignalingMessage::Close) | None => return Err(TransportError::Closed),
                Some(other) => tracing::debug!(?other, "Ignoring signaling message"),
            }
        }
    }
}

/// Keep trickling candidates after connect; report loss on any terminal signal
async fn supervise(
    pc: Arc<RTCPeerConnection>,
    mut inbound: mpsc::Receiver<SignalingMessage>,
    mut failed_rx: FailureReceiver,
    notifier: LossNotifier,
) {
    let reason = loop {
        tokio::select! {
            state = failed_rx.recv() => break failure(state).to_string(),
            msg = inbound.recv() => match msg {
                Some(SignalingMessage::Candidate { candidate, sdp_mid, sdp_mline_index }) => {
                    let init = candidate_init(candidate, sdp_mid, sdp_mline_index);
                    if let Err(e) = pc.add_ice_candidate(init).await {
                        tracing::debug!(error = %e, "Rejected late candidate");
                    }
                }
                Some(SignalingMessage::Error { reason }) => break reason,
                Some(SignalingMessage::Close) | None => break "signaling closed".to_string(),
                Some(other) => tracing::debug!(?other, "Ignoring signaling message"),
            }
        }
    };
    tracing::warn!(%reason, "WebRTC session lost");
    notifier.lost();
}

async fn media_loop(
    track: Arc<TrackRemote>,
    ingest_tx: mpsc::Sender<IngestMessage>,
    stats: Arc<Mutex<RtpStats>>,
    notifier: LossNotifier,
) {
    let mut decoder = match OpusDecoder::new(OPUS_CHANNELS) {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create Opus decoder");
            notifier.lost();
            return;
        }
    };

    let format = StreamFormat {
        sample_rate: OPUS_SAMPLE_RATE,
        channels: OPUS_CHANNELS,
        chunk_frames: Some(OPUS_PACKET_FRAMES),
    };
    if ingest_tx.send(IngestMessage::Config(format)).await.is_err() {
        return;
    }

    let epoch = Instant::now();
    loop {
        let (packet, _) = match track.read_rtp().await {
            Ok(read) => read,
            Err(e) => {
                tracing::warn!(error = %e, "Media track ended");
                break;
            }
        };
        let arrival = (epoch.elapsed().as_secs_f64() * OPUS_SAMPLE_RATE as f64) as u64 as u32;
        let verdict = stats
            .lock()
            .observe(packet.header.sequence_number, packet.header.timestamp, arrival);

        match verdict {
            PacketVerdict::Stale => continue,
            PacketVerdict::Gap(missing) => {
                for _ in 0..missing.min(MAX_CONCEALED_PACKETS) {
                    match decoder.decode_plc() {
                        Ok(samples) => {
                            if ingest_tx.send(IngestMessage::Samples(samples)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "PLC failed"),
                    }
                }
            }
            PacketVerdict::InOrder => {}
        }

        if packet.payload.is_empty() {
            continue;
        }
        match decoder.decode(&packet.payload) {
            Ok(samples) => {
                if ingest_tx.send(IngestMessage::Samples(samples)).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::debug!(error = %e, "Dropping undecodable packet"),
        }
    }
    notifier.lost();
}

async fn stats_loop(stats: Arc<Mutex<RtpStats>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = *stats.lock();
        tracing::info!(
            received = snapshot.received,
            lost = snapshot.lost,
            stale = snapshot.stale,
            loss_pct = snapshot.loss_rate() * 100.0,
            jitter_ms = snapshot.jitter_ms(),
            "WebRTC receive stats"
        );
    }
}
