//! Authenticated party-to-party message bus.
//!
//! Each party runs one inbound HTTP endpoint (`server`) and sends outbound
//! point-to-point requests authenticated by a shared-secret header. Inbound
//! messages land in per-type FIFO buffers and sit there until a consumer
//! collects them, so a message that arrives before anyone is waiting is
//! buffered, never dropped. Consumers collect session-scoped: "the next N
//! messages of type T whose session id is one of S" with a timeout, where
//! callers pass the `S ± 1` window themselves to absorb clock skew.

pub mod server;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::session;

/// Header carrying the shared bus secret.
pub const AUTH_HEADER: &str = "x-bridge-auth";

/// Message types on the bus.
pub mod msg_type {
    /// Leader's deposit proposal; single-proposal guarded.
    pub const PROPOSAL: &str = "consensus_proposal";
    /// Acceptor's accept/reject reply.
    pub const RESPONSE: &str = "consensus_response";
    /// Leader's chosen signer set.
    pub const SIGNER_SET: &str = "signer_set";
    /// Completed threshold signature, broadcast to everyone.
    pub const SIGNATURE_RESULT: &str = "signature_result";
    /// Destination-chain finalization notice.
    pub const DEPOSIT_FINALIZED: &str = "deposit_finalized";
    /// Leader → co-signer unsigned asset-chain transaction blobs.
    pub const ASSET_TX_BLOBS: &str = "asset_tx_blobs";
    /// DKG round traffic.
    pub const TSS_KEYGEN: &str = "tss_keygen";
    /// Signing round traffic.
    pub const TSS_SIGN: &str = "tss_sign";
}

/// Wire envelope for every bus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: u16,
    pub session_id: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: serde_json::Value,
}

/// How many epochs of buffered traffic to retain before rolling cleanup.
const RETENTION_EPOCHS: u64 = 4;

struct BusState {
    /// Per-type FIFO buffers, arrival ordered.
    queues: HashMap<String, VecDeque<Envelope>>,
    /// First proposal sender per session (Byzantine equivocation guard).
    proposal_seen: HashMap<String, u16>,
}

/// Process-wide bus handle for one party.
pub struct MessageBus {
    party_id: u16,
    total_parties: u16,
    shared_secret: String,
    /// Inbound URL per party id.
    peer_urls: Vec<String>,
    client: reqwest::Client,
    state: Mutex<BusState>,
    notify: Notify,
}

impl MessageBus {
    pub fn new(party_id: u16, total_parties: u16, config: &BusConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| eyre!("Failed to build bus HTTP client: {e}"))?;

        let peer_urls = config
            .peer_hosts
            .iter()
            .enumerate()
            .map(|(id, host)| format!("http://{}:{}", host, config.base_port + id as u16))
            .collect();

        Ok(Self {
            party_id,
            total_parties,
            shared_secret: config.shared_secret.clone(),
            peer_urls,
            client,
            state: Mutex::new(BusState {
                queues: HashMap::new(),
                proposal_seen: HashMap::new(),
            }),
            notify: Notify::new(),
        })
    }

    pub fn party_id(&self) -> u16 {
        self.party_id
    }

    pub fn total_parties(&self) -> u16 {
        self.total_parties
    }

    pub fn shared_secret(&self) -> &str {
        &self.shared_secret
    }

    /// Accept one inbound message. Called by the server for every
    /// authenticated request; applies the single-proposal guard.
    pub fn deliver(&self, envelope: Envelope) {
        let mut state = self.state.lock().expect("bus state poisoned");

        if envelope.msg_type == msg_type::PROPOSAL {
            if let Some(first) = state.proposal_seen.get(&envelope.session_id) {
                warn!(
                    session = %envelope.session_id,
                    first_sender = first,
                    sender = envelope.sender_id,
                    "Dropping duplicate proposal for session"
                );
                return;
            }
            state
                .proposal_seen
                .insert(envelope.session_id.clone(), envelope.sender_id);
        }

        debug!(
            msg_type = %envelope.msg_type,
            session = %envelope.session_id,
            sender = envelope.sender_id,
            "Bus message buffered"
        );
        state
            .queues
            .entry(envelope.msg_type.clone())
            .or_default()
            .push_back(envelope);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Collect up to `count` messages of `msg_type` whose session id is in
    /// `sessions`, waiting at most `timeout`. Messages are removed from the
    /// buffer in arrival order; on timeout the partial batch is returned.
    pub async fn collect(
        &self,
        msg_type: &str,
        sessions: &[String],
        count: usize,
        timeout: Duration,
    ) -> Vec<Envelope> {
        self.collect_filtered(msg_type, Some(sessions), count, timeout)
            .await
    }

    async fn collect_filtered(
        &self,
        msg_type: &str,
        sessions: Option<&[String]>,
        count: usize,
        timeout: Duration,
    ) -> Vec<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();

        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("bus state poisoned");
                if let Some(queue) = state.queues.get_mut(msg_type) {
                    let mut remaining = VecDeque::with_capacity(queue.len());
                    while let Some(env) = queue.pop_front() {
                        let wanted = sessions.is_none_or(|s| s.contains(&env.session_id));
                        if collected.len() < count && wanted {
                            collected.push(env);
                        } else {
                            remaining.push_back(env);
                        }
                    }
                    *queue = remaining;
                }
            }
            if collected.len() >= count {
                return collected;
            }
            let now = Instant::now();
            if now >= deadline {
                return collected;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Wait for a single message of `msg_type` in the given session window.
    pub async fn wait_for(
        &self,
        msg_type: &str,
        sessions: &[String],
        timeout: Duration,
    ) -> Option<Envelope> {
        self.collect(msg_type, sessions, 1, timeout).await.pop()
    }

    /// Wait for the next message of `msg_type` regardless of session.
    pub async fn wait_any(&self, msg_type: &str, timeout: Duration) -> Option<Envelope> {
        self.collect_filtered(msg_type, None, 1, timeout).await.pop()
    }

    /// Send one message point-to-point.
    pub async fn send_to(&self, peer_id: u16, envelope: &Envelope) -> Result<()> {
        let url = self
            .peer_urls
            .get(peer_id as usize)
            .ok_or_else(|| eyre!("unknown peer id {peer_id}"))?;

        let response = self
            .client
            .post(format!("{url}/message"))
            .header(AUTH_HEADER, &self.shared_secret)
            .json(envelope)
            .send()
            .await
            .map_err(|e| eyre!("bus send to party {peer_id} failed: {e}"))?;

        if !response.status().is_success() {
            return Err(eyre!(
                "bus send to party {peer_id} rejected: {}",
                response.status()
            ));
        }
        Ok(())
    }

    /// Send one message to every other party. Individual peer failures are
    /// logged and tolerated; the consensus timeouts absorb missing peers.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let sends = (0..self.total_parties)
            .filter(|id| *id != self.party_id)
            .map(|id| async move {
                if let Err(e) = self.send_to(id, envelope).await {
                    warn!(peer = id, error = %e, "Broadcast delivery failed");
                }
            });
        futures::future::join_all(sends).await;
    }

    /// Discard buffered traffic and proposal-guard entries older than the
    /// retention window. Keyed by the epoch embedded in session ids.
    pub fn cleanup(&self, current_epoch: u64) {
        let horizon = current_epoch.saturating_sub(RETENTION_EPOCHS);
        let mut state = self.state.lock().expect("bus state poisoned");
        for queue in state.queues.values_mut() {
            queue.retain(|env| match session::epoch_of(&env.session_id) {
                Some(epoch) => epoch >= horizon,
                None => true,
            });
        }
        state.proposal_seen.retain(|session, _| {
            match session::epoch_of(session) {
                Some(epoch) => epoch >= horizon,
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> MessageBus {
        let config = BusConfig {
            peer_hosts: vec!["localhost".into(), "localhost".into(), "localhost".into()],
            base_port: 19000,
            shared_secret: "secret".into(),
        };
        MessageBus::new(0, 3, &config).unwrap()
    }

    fn envelope(sender: u16, session: &str, msg_type: &str) -> Envelope {
        Envelope {
            sender_id: sender,
            session_id: session.to_string(),
            msg_type: msg_type.to_string(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn messages_buffer_until_collected() {
        let bus = test_bus();
        // Delivered before anyone waits; must not be dropped.
        bus.deliver(envelope(1, "SIGN_evm_10", msg_type::RESPONSE));
        bus.deliver(envelope(2, "SIGN_evm_10", msg_type::RESPONSE));

        let got = bus
            .collect(
                msg_type::RESPONSE,
                &["SIGN_evm_10".to_string()],
                2,
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(got.len(), 2);
        // Arrival order preserved.
        assert_eq!(got[0].sender_id, 1);
        assert_eq!(got[1].sender_id, 2);
    }

    #[tokio::test]
    async fn collection_is_session_scoped() {
        let bus = test_bus();
        bus.deliver(envelope(1, "SIGN_evm_10", msg_type::RESPONSE));
        bus.deliver(envelope(2, "SIGN_evm_99", msg_type::RESPONSE));

        let got = bus
            .collect(
                msg_type::RESPONSE,
                &["SIGN_evm_10".to_string()],
                2,
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sender_id, 1);

        // The out-of-window message stays buffered for its own session.
        let other = bus
            .collect(
                msg_type::RESPONSE,
                &["SIGN_evm_99".to_string()],
                1,
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn adjacent_epoch_window_matches() {
        let bus = test_bus();
        bus.deliver(envelope(1, "SIGN_evm_11", msg_type::PROPOSAL));

        // An acceptor at epoch 10 listens on {9, 10, 11}.
        let window: Vec<String> = (9..=11).map(|e| format!("SIGN_evm_{e}")).collect();
        let got = bus
            .wait_for(msg_type::PROPOSAL, &window, Duration::from_millis(50))
            .await;
        assert_eq!(got.unwrap().session_id, "SIGN_evm_11");
    }

    #[tokio::test]
    async fn second_proposal_for_session_is_dropped() {
        let bus = test_bus();
        bus.deliver(envelope(1, "SIGN_evm_10", msg_type::PROPOSAL));
        bus.deliver(envelope(2, "SIGN_evm_10", msg_type::PROPOSAL));
        // Same sender equivocating is also dropped.
        bus.deliver(envelope(1, "SIGN_evm_10", msg_type::PROPOSAL));

        let got = bus
            .collect(
                msg_type::PROPOSAL,
                &["SIGN_evm_10".to_string()],
                3,
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sender_id, 1);
    }

    #[tokio::test]
    async fn timeout_returns_partial_batch() {
        let bus = test_bus();
        bus.deliver(envelope(1, "SIGN_asset_5", msg_type::RESPONSE));

        let start = std::time::Instant::now();
        let got = bus
            .collect(
                msg_type::RESPONSE,
                &["SIGN_asset_5".to_string()],
                2,
                Duration::from_millis(40),
            )
            .await;
        assert_eq!(got.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn waiter_sees_late_delivery() {
        let bus = std::sync::Arc::new(test_bus());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for(
                    msg_type::SIGNER_SET,
                    &["SIGN_evm_7".to_string()],
                    Duration::from_secs(2),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.deliver(envelope(2, "SIGN_evm_7", msg_type::SIGNER_SET));

        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().sender_id, 2);
    }

    #[tokio::test]
    async fn cleanup_discards_old_epochs() {
        let bus = test_bus();
        bus.deliver(envelope(1, "SIGN_evm_1", msg_type::RESPONSE));
        bus.deliver(envelope(1, "SIGN_evm_1", msg_type::PROPOSAL));
        bus.deliver(envelope(1, "SIGN_evm_100", msg_type::RESPONSE));

        bus.cleanup(100);

        let old = bus
            .collect(
                msg_type::RESPONSE,
                &["SIGN_evm_1".to_string()],
                1,
                Duration::from_millis(10),
            )
            .await;
        assert!(old.is_empty());

        let fresh = bus
            .collect(
                msg_type::RESPONSE,
                &["SIGN_evm_100".to_string()],
                1,
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(fresh.len(), 1);

        // The guard entry for the old session is also gone, so a proposal
        // for that session would be accepted again after retention.
        bus.deliver(envelope(2, "SIGN_evm_1", msg_type::PROPOSAL));
        let reopened = bus
            .collect(
                msg_type::PROPOSAL,
                &["SIGN_evm_1".to_string()],
                1,
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(reopened.len(), 1);
    }
}
