//! Forwarded tracks: one per inbound publisher track, fanning its raw RTP
//! payload out to every subscriber's dedicated `TrackLocalStaticRTP`.
//!
//! Grounded on the teacher's `broadcaster.rs` (keyframe burst/retry logic
//! on `request_keyframe`/`schedule_keyframe_burst`) and `tests/leak_repro.rs`
//! (each writer owns an mpsc channel; the writer's task exits on write
//! failure, which self-prunes the writer out of the broadcaster on the next
//! broadcast rather than requiring an explicit remove call).

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::Error as WebrtcError;

use crate::id_types::UserId;

const WRITER_CHANNEL_CAPACITY: usize = 256;

struct Writer {
    subscriber: UserId,
    tx: mpsc::Sender<Packet>,
}

/// Fan-out for one publisher track. Payload type and SSRC are fixed at
/// construction and never change for the life of the forwarded track.
pub struct ForwardedTrack {
    writers: Mutex<Vec<Writer>>,
    kind: &'static str, // "audio" | "video"
    pub capability: RTCRtpCodecCapability,
    source_pc: Arc<webrtc::peer_connection::RTCPeerConnection>,
    source_ssrc: u32,
}

impl ForwardedTrack {
    pub fn new(
        kind: &'static str,
        capability: RTCRtpCodecCapability,
        source_pc: Arc<webrtc::peer_connection::RTCPeerConnection>,
        source_ssrc: u32,
    ) -> Self {
        Self {
            writers: Mutex::new(Vec::new()),
            kind,
            capability,
            source_pc,
            source_ssrc,
        }
    }

    /// Register a subscriber's local track as a fan-out target. Spawns the
    /// task that owns the write side; returns once the writer is live.
    pub async fn add_writer(&self, subscriber: UserId, local_track: Arc<TrackLocalStaticRTP>) {
        let (tx, mut rx) = mpsc::channel::<Packet>(WRITER_CHANNEL_CAPACITY);
        {
            let mut writers = self.writers.lock().await;
            writers.push(Writer {
                subscriber: subscriber.clone(),
                tx,
            });
        }

        let kind = self.kind;
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                match local_track.write_rtp(&packet).await {
                    Ok(_) => {}
                    Err(WebrtcError::ErrClosedPipe) => {
                        // No bindings yet (subscriber hasn't finished
                        // negotiating); benign, keep the writer alive.
                    }
                    Err(e) => {
                        warn!(kind, error = %e, "forward write failed, dropping writer");
                        break;
                    }
                }
            }
        });

        info!(kind = self.kind, subscriber = %subscriber, "added forwarded-track writer");
    }

    /// Remove a subscriber's writer (e.g. on subscriber leave), distinct
    /// from self-pruning after a write failure.
    pub async fn remove_writer(&self, subscriber: &UserId) {
        let mut writers = self.writers.lock().await;
        writers.retain(|w| &w.subscriber != subscriber);
    }

    /// Push one packet to every live writer, pruning any whose task has
    /// exited (channel closed) since the last broadcast.
    pub async fn broadcast(&self, packet: Packet) {
        let mut writers = self.writers.lock().await;
        writers.retain(|w| w.tx.try_send(packet.clone()).is_ok());
    }

    pub async fn writer_count(&self) -> usize {
        self.writers.lock().await.len()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub async fn request_keyframe(&self) {
        if self.kind != "video" {
            return;
        }
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.source_ssrc,
        };
        if let Err(e) = self.source_pc.write_rtcp(&[Box::new(pli)]).await {
            warn!(source_ssrc = self.source_ssrc, error = %e, "failed to send PLI");
        } else {
            debug!(source_ssrc = self.source_ssrc, "sent PLI");
        }
    }

    /// Burst a few keyframe requests shortly after a new writer joins, so a
    /// late subscriber doesn't wait a full keyframe interval for its first
    /// renderable frame.
    pub fn schedule_keyframe_burst(self: Arc<Self>) {
        tokio::spawn(async move {
            for delay_secs in [1, 1, 1, 2] {
                tokio::time::sleep(tokio::time::Duration::from_secs(delay_secs)).await;
                self.request_keyframe().await;
            }
        });
    }
}
