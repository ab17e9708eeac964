//! Negotiation coordinator: serializes offer/answer cycles for one media
//! session. Grounded on `original_source/pkg/webrtc/negotiate_service.go`.
//!
//! States: `Stable`, `Negotiating`, `Queued`. A `negotiate()` call while
//! `Stable` starts an offer immediately; a call while already `Negotiating`
//! is coalesced into a single follow-up round once the session returns to
//! `Stable`, rather than stacking up one offer per call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::Notify;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stable,
    Negotiating,
    Queued,
}

/// Serializes offer creation for one `RTCPeerConnection`.
///
/// `on_negotiate` performs the actual "create offer, set local description,
/// emit it" work; the coordinator only decides *when* to call it.
pub struct NegotiationCoordinator {
    state: Mutex<State>,
    done: Notify,
    on_negotiate: Box<dyn Fn() -> BoxFuture + Send + Sync>,
}

impl NegotiationCoordinator {
    pub fn new<F, Fut>(on_negotiate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            state: Mutex::new(State::Stable),
            done: Notify::new(),
            on_negotiate: Box::new(move || Box::pin(on_negotiate())),
        }
    }

    /// Request a renegotiation. Coalesces with any negotiation already in
    /// flight instead of stacking offers.
    pub async fn negotiate(&self) {
        let should_start = {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Stable => {
                    *state = State::Negotiating;
                    true
                }
                State::Negotiating => {
                    *state = State::Queued;
                    false
                }
                State::Queued => false,
            }
        };
        if should_start {
            (self.on_negotiate)().await;
        }
    }

    /// Feed the peer connection's signaling state transitions through the
    /// coordinator so queued follow-ups fire once the channel goes stable.
    pub async fn on_signaling_state_change(&self, new_state: RTCSignalingState) {
        match new_state {
            RTCSignalingState::Stable => {
                let should_restart = {
                    let mut state = self.state.lock().unwrap();
                    match *state {
                        State::Queued => {
                            *state = State::Negotiating;
                            true
                        }
                        _ => {
                            *state = State::Stable;
                            false
                        }
                    }
                };
                if should_restart {
                    (self.on_negotiate)().await;
                } else {
                    self.done.notify_waiters();
                }
            }
            RTCSignalingState::Closed => {
                *self.state.lock().unwrap() = State::Stable;
                self.done.notify_waiters();
            }
            _ => {}
        }
    }

    /// Wait for the coordinator to next reach a resting (stable/closed)
    /// state. Intended for tests; nothing in the server's own control flow
    /// blocks on this.
    pub async fn wait_done(&self) {
        self.done.notified().await;
    }

    #[cfg(test)]
    fn current_state(&self) -> State {
        *self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_coordinator() -> (Arc<NegotiationCoordinator>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let coordinator = Arc::new(NegotiationCoordinator::new(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }));
        (coordinator, calls)
    }

    #[tokio::test]
    async fn first_negotiate_starts_immediately() {
        let (coordinator, calls) = counting_coordinator();
        coordinator.negotiate().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.current_state(), State::Negotiating);
    }

    #[tokio::test]
    async fn concurrent_negotiate_calls_coalesce_into_one_followup() {
        let (coordinator, calls) = counting_coordinator();
        coordinator.negotiate().await; // -> Negotiating, offer #1
        coordinator.negotiate().await; // -> Queued, no offer yet
        coordinator.negotiate().await; // already Queued, no-op
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Peer connection reports stable; queued follow-up fires exactly once.
        coordinator
            .on_signaling_state_change(RTCSignalingState::Stable)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.current_state(), State::Negotiating);
    }

    #[tokio::test]
    async fn stable_with_no_queue_returns_to_stable_without_new_offer() {
        let (coordinator, calls) = counting_coordinator();
        coordinator.negotiate().await;
        coordinator
            .on_signaling_state_change(RTCSignalingState::Stable)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.current_state(), State::Stable);
    }

    #[tokio::test]
    async fn closed_resets_to_stable() {
        let (coordinator, _calls) = counting_coordinator();
        coordinator.negotiate().await;
        coordinator
            .on_signaling_state_change(RTCSignalingState::Closed)
            .await;
        assert_eq!(coordinator.current_state(), State::Stable);
    }
}
