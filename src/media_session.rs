//! One `RTCPeerConnection`, in either the publish or the subscribe role.
//!
//! Grounded on the teacher's `peer_manager.rs`/`track_handler.rs` (transceiver
//! setup, `on_track`, PLI monitoring), generalized to the publish/subscribe
//! split, and on `original_source/pkg/webrtc/signal_service.go` for the
//! ICE-candidate gating pattern (candidates withheld until the local
//! description they follow has actually been applied).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::broadcaster::ForwardedTrack;
use crate::codec::{SdpKind, ServerEvent, SignalEnvelope, SignalPayload};
use crate::id_types::UserId;
use crate::negotiation::NegotiationCoordinator;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EmitFn = Arc<dyn Fn(ServerEvent) -> BoxFuture + Send + Sync>;
type NewTrackFn = Arc<dyn Fn(UserId, Arc<ForwardedTrack>) -> BoxFuture + Send + Sync>;
type FatalFn = Arc<dyn Fn() -> BoxFuture + Send + Sync>;
type DataMessageFn = Arc<dyn Fn(Vec<u8>, bool) -> BoxFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Publish,
    Subscribe,
}

/// Callbacks the owning `ParticipantSession` supplies so `MediaSession`
/// doesn't need to know about rooms, registries or outbound queues.
#[derive(Clone)]
pub struct SessionHooks {
    pub emit: EmitFn,
    pub on_new_forwarded_track: NewTrackFn,
    pub on_fatal: FatalFn,
    pub on_data_message: DataMessageFn,
}

/// Gate for locally generated ICE candidates: held back until the local
/// description they belong to has been applied, then released in order.
struct IceGate {
    ready: AtomicBool,
    buffered: Mutex<Vec<RTCIceCandidateInit>>,
}

impl IceGate {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            buffered: Mutex::new(Vec::new()),
        }
    }

    /// Returns `Some(candidate)` to emit immediately, or buffers it and
    /// returns `None` if the local description hasn't been applied yet.
    async fn offer(&self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.ready.load(Ordering::Acquire) {
            Some(candidate)
        } else {
            self.buffered.lock().await.push(candidate);
            None
        }
    }

    /// Marks the gate open and returns whatever was buffered, in order.
    async fn open(&self) -> Vec<RTCIceCandidateInit> {
        self.ready.store(true, Ordering::Release);
        std::mem::take(&mut *self.buffered.lock().await)
    }
}

pub struct MediaSession {
    pub role: SessionRole,
    pub pc: Arc<RTCPeerConnection>,
    user_id: UserId,
    coordinator: NegotiationCoordinator,
    ice_gate: IceGate,
    emit: EmitFn,
    forwarded_tracks: DashMap<u32, Arc<ForwardedTrack>>,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaSession {
    pub fn new(role: SessionRole, pc: Arc<RTCPeerConnection>, user_id: UserId, hooks: SessionHooks) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let weak_for_coordinator = weak.clone();
            let coordinator = NegotiationCoordinator::new(move || {
                let weak = weak_for_coordinator.clone();
                async move {
                    if let Some(session) = weak.upgrade() {
                        session.create_and_send_offer().await;
                    }
                }
            });

            let session = MediaSession {
                role,
                pc,
                user_id,
                coordinator,
                ice_gate: IceGate::new(),
                emit: hooks.emit,
                forwarded_tracks: DashMap::new(),
                data_channel: Mutex::new(None),
                task_handles: Mutex::new(Vec::new()),
            };
            session.register_handlers(weak.clone(), hooks.on_new_forwarded_track, hooks.on_fatal, hooks.on_data_message);
            session
        })
    }

    fn register_handlers(
        &self,
        weak: std::sync::Weak<MediaSession>,
        on_new_forwarded_track: NewTrackFn,
        on_fatal: FatalFn,
        on_data_message: DataMessageFn,
    ) {
        let weak_ice = weak.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak_ice.clone();
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else { return };
                    let Some(candidate) = candidate else { return };
                    let Ok(init) = candidate.to_json() else { return };
                    if let Some(ready) = session.ice_gate.offer(init).await {
                        session.emit_candidate(ready).await;
                    }
                })
            }));

        let weak_sig = weak.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let weak = weak_sig.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.coordinator.on_signaling_state_change(state).await;
                    }
                })
            }));

        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let on_fatal = on_fatal.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCIceConnectionState::Closed
                            | RTCIceConnectionState::Disconnected
                            | RTCIceConnectionState::Failed
                    ) {
                        on_fatal().await;
                    }
                })
            }));

        if self.role == SessionRole::Publish {
            let weak_track = weak.clone();
            self.pc.on_track(Box::new(
                move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                    let weak = weak_track.clone();
                    let on_new_forwarded_track = on_new_forwarded_track.clone();
                    Box::pin(async move {
                        if let Some(session) = weak.upgrade() {
                            session.handle_remote_track(track, on_new_forwarded_track).await;
                        }
                    })
                },
            ));

            self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let on_data_message = on_data_message.clone();
                Box::pin(async move {
                    dc.on_message(Box::new(move |msg: DataChannelMessage| {
                        let on_data_message = on_data_message.clone();
                        Box::pin(async move {
                            on_data_message(msg.data.to_vec(), !msg.is_string).await;
                        })
                    }));
                })
            }));
        }
    }

    /// Builds the publish-side session: pre-adds one recvonly video and one
    /// recvonly audio transceiver before any offer is made, per spec.md §3.
    pub async fn new_publish(
        pc: Arc<RTCPeerConnection>,
        user_id: UserId,
        hooks: SessionHooks,
    ) -> Result<Arc<Self>, webrtc::Error> {
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;
        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;
        Ok(Self::new(SessionRole::Publish, pc, user_id, hooks))
    }

    /// Builds the subscribe-side session and pre-creates the outbound data
    /// channel used for relayed broadcast messages.
    pub async fn new_subscribe(
        pc: Arc<RTCPeerConnection>,
        user_id: UserId,
        hooks: SessionHooks,
    ) -> Result<Arc<Self>, webrtc::Error> {
        let session = Self::new(SessionRole::Subscribe, pc.clone(), user_id, hooks);
        let dc = pc.create_data_channel("sfu", None).await?;
        *session.data_channel.lock().await = Some(dc);
        Ok(session)
    }

    pub async fn negotiate(&self) {
        self.coordinator.negotiate().await;
    }

    pub async fn wait_negotiation_done(&self) {
        self.coordinator.wait_done().await;
    }

    async fn create_and_send_offer(&self) {
        let offer = match self.pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "failed to create offer");
                return;
            }
        };
        if let Err(e) = self.pc.set_local_description(offer.clone()).await {
            warn!(user_id = %self.user_id, error = %e, "failed to set local description");
            return;
        }
        self.emit_offer(offer).await;
        for candidate in self.ice_gate.open().await {
            self.emit_candidate(candidate).await;
        }
    }

    async fn emit_offer(&self, offer: RTCSessionDescription) {
        (self.emit)(ServerEvent::Signal(SignalEnvelope {
            client_id: self.user_id.clone(),
            renegotiate: self.role == SessionRole::Subscribe,
            signal: SignalPayload::Description {
                kind: SdpKind::Offer,
                sdp: offer.sdp,
            },
        }))
        .await;
    }

    async fn emit_candidate(&self, candidate: RTCIceCandidateInit) {
        (self.emit)(ServerEvent::Signal(SignalEnvelope {
            client_id: self.user_id.clone(),
            renegotiate: self.role == SessionRole::Subscribe,
            signal: SignalPayload::Candidate {
                candidate: candidate.candidate,
                sdp_mline_index: candidate.sdp_mline_index.unwrap_or(0),
                sdp_mid: candidate.sdp_mid,
            },
        }))
        .await;
    }

    /// Apply an inbound offer: set remote description, answer, send it.
    pub async fn apply_remote_offer(&self, sdp: String) -> Result<(), webrtc::Error> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        (self.emit)(ServerEvent::Signal(SignalEnvelope {
            client_id: self.user_id.clone(),
            renegotiate: self.role == SessionRole::Subscribe,
            signal: SignalPayload::Description {
                kind: SdpKind::Answer,
                sdp: answer.sdp,
            },
        }))
        .await;
        for candidate in self.ice_gate.open().await {
            self.emit_candidate(candidate).await;
        }
        Ok(())
    }

    /// Apply an inbound answer, completing an offer this session sent.
    pub async fn apply_remote_answer(&self, sdp: String) -> Result<(), webrtc::Error> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await
    }

    pub async fn add_ice_candidate(&self, init: RTCIceCandidateInit) -> Result<(), webrtc::Error> {
        self.pc.add_ice_candidate(init).await
    }

    /// True once this session has an applied local description (used by the
    /// participant's ICE-candidate routing decision).
    pub async fn has_local_description(&self) -> bool {
        self.pc.local_description().await.is_some()
    }

    async fn handle_remote_track(self: Arc<Self>, track: Arc<TrackRemote>, on_new_forwarded_track: NewTrackFn) {
        let kind: &'static str = if track.kind() == RTPCodecType::Video {
            "video"
        } else {
            "audio"
        };
        let capability = track.codec().capability.clone();
        let ssrc = track.ssrc();

        let forwarded = Arc::new(ForwardedTrack::new(kind, capability, self.pc.clone(), ssrc));
        self.forwarded_tracks.insert(ssrc, forwarded.clone());
        info!(user_id = %self.user_id, kind, ssrc, "publisher track opened");

        let forwarded_for_loop = forwarded.clone();
        let forward_handle = tokio::spawn(async move {
            loop {
                match track.read_rtp().await {
                    Ok((packet, _)) => forwarded_for_loop.broadcast(packet).await,
                    Err(_) => break,
                }
            }
        });

        let mut handles = vec![forward_handle];
        if kind == "video" {
            let forwarded_for_pli = forwarded.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(2));
                loop {
                    interval.tick().await;
                    forwarded_for_pli.request_keyframe().await;
                }
            }));
        }
        self.task_handles.lock().await.extend(handles);

        on_new_forwarded_track(self.user_id.clone(), forwarded).await;
    }

    /// The forwarded tracks currently produced by this (publish) session.
    pub fn forwarded_tracks(&self) -> Vec<Arc<ForwardedTrack>> {
        self.forwarded_tracks.iter().map(|e| e.value().clone()).collect()
    }

    /// Add one forwarded track's fan-out to this (subscribe) session. Does
    /// not trigger renegotiation itself — callers batch and negotiate once.
    pub async fn add_forwarded_track(
        &self,
        subscriber_stream: &str,
        forwarded: Arc<ForwardedTrack>,
    ) -> Result<Arc<RTCRtpSender>, webrtc::Error> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            forwarded.capability.clone(),
            format!("{}-{}", subscriber_stream, forwarded.kind()),
            subscriber_stream.to_string(),
        ));
        let sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        forwarded.add_writer(self.user_id.clone(), local).await;
        spawn_sender_pli_monitor(sender.clone(), forwarded.clone());
        forwarded.clone().schedule_keyframe_burst();
        Ok(sender)
    }

    pub async fn remove_sender(&self, sender: &Arc<RTCRtpSender>) -> Result<(), webrtc::Error> {
        self.pc.remove_track(sender).await
    }

    pub async fn send_data(&self, data: &[u8], is_binary: bool) {
        let guard = self.data_channel.lock().await;
        if let Some(dc) = guard.as_ref() {
            let result = if is_binary {
                dc.send(&bytes::Bytes::copy_from_slice(data)).await
            } else {
                dc.send_text(String::from_utf8_lossy(data).to_string()).await
            };
            if let Err(e) = result {
                warn!(error = %e, "failed to relay data channel message");
            }
        }
    }

    pub async fn close(&self) {
        for handle in self.task_handles.lock().await.drain(..) {
            handle.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!(user_id = %self.user_id, error = %e, "error closing peer connection");
        }
    }

    /// Register an already-built forwarded track without a real remote
    /// track arriving, so tests can simulate a publisher that was already
    /// forwarding before another participant joins.
    #[cfg(test)]
    pub fn insert_forwarded_track_for_test(&self, ssrc: u32, track: Arc<ForwardedTrack>) {
        self.forwarded_tracks.insert(ssrc, track);
    }
}

fn spawn_sender_pli_monitor(sender: Arc<RTCRtpSender>, forwarded: Arc<ForwardedTrack>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((packets, _)) = sender.read(&mut rtcp_buf).await {
            for packet in packets {
                if packet
                    .as_any()
                    .is::<webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                {
                    forwarded.request_keyframe().await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_setup::MediaSetup;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TokioMutex;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    fn noop_hooks() -> SessionHooks {
        SessionHooks {
            emit: Arc::new(|_event| Box::pin(async {})),
            on_new_forwarded_track: Arc::new(|_id, _track| Box::pin(async {})),
            on_fatal: Arc::new(|| Box::pin(async {})),
            on_data_message: Arc::new(|_data, _is_binary| Box::pin(async {})),
        }
    }

    async fn new_pc() -> Arc<RTCPeerConnection> {
        let api = MediaSetup::create_webrtc_api();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn publish_session_pre_adds_two_recvonly_transceivers() {
        let pc = new_pc().await;
        let session = MediaSession::new_publish(pc.clone(), UserId::from("u1"), noop_hooks())
            .await
            .unwrap();
        assert_eq!(session.role, SessionRole::Publish);
        assert_eq!(pc.get_transceivers().await.len(), 2);
    }

    #[tokio::test]
    async fn negotiate_emits_an_offer() {
        let pc = new_pc().await;
        let emitted = Arc::new(TokioMutex::new(Vec::new()));
        let emitted_clone = emitted.clone();
        let hooks = SessionHooks {
            emit: Arc::new(move |event| {
                let emitted = emitted_clone.clone();
                Box::pin(async move {
                    emitted.lock().await.push(event);
                })
            }),
            ..noop_hooks()
        };
        let session = MediaSession::new_publish(pc, UserId::from("u1"), hooks)
            .await
            .unwrap();
        session.negotiate().await;
        // create_offer/set_local_description involve await points inside the
        // coordinator's callback; give the spawned continuation a moment.
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!emitted.lock().await.is_empty());
    }

    /// S6 / invariant 4 — `IceGate` withholds locally-gathered ICE
    /// candidates until the local description they follow has been applied;
    /// the description must always be the first outbound event for a fresh
    /// negotiation, never a candidate.
    #[tokio::test]
    async fn ice_candidates_never_precede_the_local_description() {
        let pc = new_pc().await;
        let emitted = Arc::new(TokioMutex::new(Vec::new()));
        let emitted_clone = emitted.clone();
        let hooks = SessionHooks {
            emit: Arc::new(move |event| {
                let emitted = emitted_clone.clone();
                Box::pin(async move {
                    emitted.lock().await.push(event);
                })
            }),
            ..noop_hooks()
        };
        let session = MediaSession::new_publish(pc, UserId::from("u1"), hooks)
            .await
            .unwrap();
        session.negotiate().await;
        // Let ICE gathering (kicked off inside set_local_description) run
        // for a bit so any locally-produced candidates reach the hook.
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let events = emitted.lock().await;
        assert!(!events.is_empty(), "negotiate() must have emitted at least the offer");
        assert!(
            matches!(
                events[0],
                ServerEvent::Signal(SignalEnvelope { signal: SignalPayload::Description { .. }, .. })
            ),
            "the local description must be the first outbound event, not a buffered candidate"
        );
        for (i, event) in events.iter().enumerate().skip(1) {
            if let ServerEvent::Signal(SignalEnvelope {
                signal: SignalPayload::Candidate { .. }, ..
            }) = event
            {
                assert!(i > 0, "a candidate must never be emitted before the description at index 0");
            }
        }
    }

    #[tokio::test]
    async fn fatal_ice_state_triggers_hook() {
        let pc = new_pc().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let hooks = SessionHooks {
            on_fatal: Arc::new(move || {
                let fired = fired_clone.clone();
                Box::pin(async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            }),
            ..noop_hooks()
        };
        let _session = MediaSession::new_publish(pc.clone(), UserId::from("u1"), hooks)
            .await
            .unwrap();
        // Closing the peer connection drives its ICE state toward Closed.
        pc.close().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
