//! `ParticipantSession`: one per connected client. Owns the publish and
//! optional subscribe media sessions, the outbound signaling queue and the
//! sender registry. Grounded on the teacher's `peer_manager.rs::Peer`
//! (generalized from one `RTCPeerConnection` to the publish/subscribe pair)
//! and `original_source/pkg/models/ws/client.go` for the outbound-queue shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::broadcaster::ForwardedTrack;
use crate::codec::{ServerEvent, SignalEnvelope, SignalPayload};
use crate::id_types::{RoomId, UserId};
use crate::media_session::{MediaSession, SessionHooks};
use crate::media_setup::MediaSetup;
use crate::room::RoomRouter;

#[derive(Debug)]
pub enum SessionError {
    NoSubscribeSession,
    AlreadyConnected,
    SignalBeforeReady,
    Webrtc(webrtc::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NoSubscribeSession => write!(f, "no subscribe session for this participant"),
            SessionError::AlreadyConnected => write!(f, "session already connected"),
            SessionError::SignalBeforeReady => write!(f, "signal received before ready"),
            SessionError::Webrtc(e) => write!(f, "webrtc error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        SessionError::Webrtc(e)
    }
}

pub struct ParticipantSession {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub metadata: RwLock<String>,
    publish: Mutex<Option<Arc<MediaSession>>>,
    subscribe: Mutex<Option<Arc<MediaSession>>>,
    outbound_tx: mpsc::Sender<ServerEvent>,
    outbound_send_lock: Mutex<()>,
    /// Per remote publisher, the sender entries this session currently
    /// carries for that publisher's forwarded tracks.
    sender_registry: DashMap<UserId, Vec<Arc<RTCRtpSender>>>,
    room: Mutex<Option<Weak<RoomRouter>>>,
    closed: AtomicBool,
}

impl ParticipantSession {
    pub fn new(user_id: UserId, room_id: RoomId) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(128);
        let session = Arc::new(ParticipantSession {
            user_id,
            room_id,
            metadata: RwLock::new(String::new()),
            publish: Mutex::new(None),
            subscribe: Mutex::new(None),
            outbound_tx,
            outbound_send_lock: Mutex::new(()),
            sender_registry: DashMap::new(),
            room: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        (session, outbound_rx)
    }

    pub async fn attach_router(&self, router: Weak<RoomRouter>) {
        *self.room.lock().await = Some(router);
    }

    async fn router(&self) -> Option<Arc<RoomRouter>> {
        self.room.lock().await.as_ref().and_then(Weak::upgrade)
    }

    /// Serializes all outbound emits so concurrently-racing internal tasks
    /// (negotiation offers, ICE candidate release) can't interleave sends
    /// out of causal order.
    pub(crate) async fn emit_for_room(&self, event: ServerEvent) {
        self.emit(event).await
    }

    async fn emit(&self, event: ServerEvent) {
        let _guard = self.outbound_send_lock.lock().await;
        if self.outbound_tx.send(event).await.is_err() {
            warn!(user_id = %self.user_id, "outbound queue closed, dropping event");
        }
    }

    fn hooks(self: &Arc<Self>) -> SessionHooks {
        let session_for_emit = self.clone();
        let session_for_track = self.clone();
        let session_for_fatal = self.clone();
        let session_for_data = self.clone();
        SessionHooks {
            emit: Arc::new(move |event| {
                let session = session_for_emit.clone();
                Box::pin(async move { session.emit(event).await })
            }),
            on_new_forwarded_track: Arc::new(move |publisher, track| {
                let session = session_for_track.clone();
                Box::pin(async move {
                    if let Some(router) = session.router().await {
                        router.on_new_forwarded_track(&publisher, track).await;
                    }
                })
            }),
            on_fatal: Arc::new(move || {
                let session = session_for_fatal.clone();
                Box::pin(async move {
                    session.close().await;
                    if let Some(router) = session.router().await {
                        router.remove(&session.user_id).await;
                    }
                })
            }),
            on_data_message: Arc::new(move |data, is_binary| {
                let session = session_for_data.clone();
                Box::pin(async move {
                    if let Some(router) = session.router().await {
                        router.broadcast_data(&session.user_id, data, is_binary).await;
                    }
                })
            }),
        }
    }

    /// Creates the publish session, pre-adding its transceivers, and kicks
    /// off the initial offer. Called in response to a client's "ready".
    pub async fn open_publish(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut publish = self.publish.lock().await;
        if publish.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        let api = MediaSetup::create_webrtc_api();
        let pc = Arc::new(api.new_peer_connection(MediaSetup::get_rtc_config()).await?);
        let session = MediaSession::new_publish(pc, self.user_id.clone(), self.hooks()).await?;
        session.negotiate().await;
        *publish = Some(session);
        Ok(())
    }

    async fn ensure_subscribe(self: &Arc<Self>) -> Result<Arc<MediaSession>, SessionError> {
        let mut subscribe = self.subscribe.lock().await;
        if let Some(session) = subscribe.as_ref() {
            return Ok(session.clone());
        }
        let api = MediaSetup::create_webrtc_api();
        let pc = Arc::new(api.new_peer_connection(MediaSetup::get_rtc_config()).await?);
        let session = MediaSession::new_subscribe(pc, self.user_id.clone(), self.hooks()).await?;
        *subscribe = Some(session.clone());
        Ok(session)
    }

    /// Route an inbound signal payload to the correct media session.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), SessionError> {
        match envelope.signal {
            SignalPayload::Description { kind, sdp } => {
                let target = self.target_session(envelope.renegotiate).await?;
                match kind {
                    crate::codec::SdpKind::Offer => target.apply_remote_offer(sdp).await?,
                    crate::codec::SdpKind::Answer => target.apply_remote_answer(sdp).await?,
                }
            }
            SignalPayload::Candidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => {
                let target = self.target_session(envelope.renegotiate).await?;
                target
                    .add_ice_candidate(webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index: Some(sdp_mline_index),
                        username_fragment: None,
                    })
                    .await?;
            }
            SignalPayload::Renegotiate => {
                let target = self.target_session(envelope.renegotiate).await?;
                target.negotiate().await;
            }
        }
        Ok(())
    }

    /// `renegotiate == false` targets the publish session, `true` targets
    /// the subscribe session (see DESIGN.md's ICE-routing Open Question).
    async fn target_session(&self, renegotiate: bool) -> Result<Arc<MediaSession>, SessionError> {
        if renegotiate {
            self.subscribe
                .lock()
                .await
                .clone()
                .ok_or(SessionError::NoSubscribeSession)
        } else {
            self.publish
                .lock()
                .await
                .clone()
                .ok_or(SessionError::SignalBeforeReady)
        }
    }

    /// The tracks this participant's publish session is currently forwarding.
    pub async fn forwarded_tracks(&self) -> Vec<Arc<ForwardedTrack>> {
        match self.publish.lock().await.as_ref() {
            Some(session) => session.forwarded_tracks(),
            None => Vec::new(),
        }
    }

    /// Add one publisher's forwarded tracks to this participant's subscribe
    /// session, then trigger exactly one renegotiation for the batch.
    pub async fn add_subscriber_tracks(
        self: &Arc<Self>,
        publisher: UserId,
        tracks: Vec<Arc<ForwardedTrack>>,
    ) -> Result<(), SessionError> {
        if tracks.is_empty() {
            return Ok(());
        }
        let subscribe = self.ensure_subscribe().await?;
        let mut senders = Vec::with_capacity(tracks.len());
        for track in tracks {
            match subscribe.add_forwarded_track(self.user_id.as_ref(), track).await {
                Ok(sender) => senders.push(sender),
                Err(e) => warn!(user_id = %self.user_id, error = %e, "failed to add forwarded track"),
            }
        }
        self.sender_registry
            .entry(publisher)
            .or_default()
            .extend(senders);
        subscribe.negotiate().await;
        Ok(())
    }

    /// Remove a departed publisher's entries from this participant's
    /// subscribe session, then trigger one renegotiation.
    pub async fn remove_subscriber_tracks(&self, publisher: &UserId) {
        let Some((_, senders)) = self.sender_registry.remove(publisher) else {
            return;
        };
        let subscribe = self.subscribe.lock().await.clone();
        if let Some(subscribe) = subscribe {
            for sender in &senders {
                if let Err(e) = subscribe.remove_sender(sender).await {
                    warn!(user_id = %self.user_id, error = %e, "failed to remove forwarded-track sender");
                }
            }
            subscribe.negotiate().await;
        }
    }

    pub async fn send_data(&self, data: &[u8], is_binary: bool) {
        if let Some(subscribe) = self.subscribe.lock().await.as_ref() {
            subscribe.send_data(data, is_binary).await;
        }
    }

    /// Test-only: make this participant appear to already be forwarding
    /// `track`, opening a publish session first if one doesn't exist yet.
    #[cfg(test)]
    pub async fn inject_forwarded_track_for_test(self: &Arc<Self>, ssrc: u32, track: Arc<ForwardedTrack>) {
        if self.publish.lock().await.is_none() {
            self.open_publish().await.unwrap();
        }
        if let Some(publish) = self.publish.lock().await.as_ref() {
            publish.insert_forwarded_track_for_test(ssrc, track);
        }
    }

    /// Close-once: subscribe, then publish, then the outbound queue.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscribe) = self.subscribe.lock().await.take() {
            subscribe.close().await;
        }
        if let Some(publish) = self.publish.lock().await.take() {
            publish.close().await;
        }
        info!(user_id = %self.user_id, room_id = %self.room_id, "participant session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_signal_before_ready_is_an_error() {
        let (session, _rx) = ParticipantSession::new(UserId::from("u1"), RoomId::from("r1"));
        let envelope = SignalEnvelope {
            client_id: UserId::from("u1"),
            renegotiate: false,
            signal: SignalPayload::Renegotiate,
        };
        let result = session.handle_signal(envelope).await;
        assert!(matches!(result, Err(SessionError::SignalBeforeReady)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _rx) = ParticipantSession::new(UserId::from("u1"), RoomId::from("r1"));
        session.open_publish().await.unwrap();
        session.close().await;
        session.close().await; // must not panic or double-close
    }

    #[tokio::test]
    async fn open_publish_twice_errors() {
        let (session, _rx) = ParticipantSession::new(UserId::from("u1"), RoomId::from("r1"));
        session.open_publish().await.unwrap();
        let second = session.open_publish().await;
        assert!(matches!(second, Err(SessionError::AlreadyConnected)));
    }
}
