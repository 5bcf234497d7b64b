//! Single-round consensus over a proposed deposit.
//!
//! One session per (destination, epoch). The elected leader proposes the
//! oldest pending deposit; every other party re-fetches the deposit from
//! its own chain view and accepts only what the chain itself says. The
//! proposer's claim-bearing fields are discarded on arrival; the worst a
//! malicious leader can do is stall a session, never move funds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, WrapErr};
use multichain::{ChainTag, DepositId, DepositRecord, DepositStatus};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::bus::{msg_type, Envelope, MessageBus};
use crate::config::Config;
use crate::db;
use crate::metrics;
use crate::observers::Observers;
use crate::session::{leader_for, select_signers, session_window};
use crate::signing::evm_sign_hash_for;

/// Rejection reasons carried in proposal responses. The display strings
/// are the wire format peers log and act on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("chain verification failed")]
    ChainVerificationFailed,
    #[error("data mismatch")]
    DataMismatch,
    #[error("signHash mismatch")]
    SignHashMismatch,
    #[error("already {0}")]
    Already(String),
}

impl RejectReason {
    /// Bounded metric label (the `already` family collapses to one).
    fn label(&self) -> &'static str {
        match self {
            RejectReason::ChainVerificationFailed => "chain_verification_failed",
            RejectReason::DataMismatch => "data_mismatch",
            RejectReason::SignHashMismatch => "sign_hash_mismatch",
            RejectReason::Already(_) => "already_past_pending",
        }
    }
}

/// Leader's proposal: the identifying triple plus the claims every
/// acceptor will independently re-derive, and (for the deterministic EVM
/// destination) the exact sign-hash the leader computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub source_chain: ChainTag,
    pub tx_id: String,
    pub intra_index: u32,
    pub token_id: Option<String>,
    pub amount: String,
    pub receiver: String,
    pub dest_chain: ChainTag,
    /// Hex of the canonical sign-hash (pre-EIP-191), EVM destinations only.
    pub sign_hash: Option<String>,
}

impl Proposal {
    fn deposit_id(&self) -> DepositId {
        DepositId::new(self.source_chain, self.tx_id.clone(), self.intra_index)
    }
}

/// Acceptor's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalResponse {
    pub accept: bool,
    pub reason: Option<String>,
    pub tx_id: String,
    pub intra_index: u32,
}

/// Leader's signer-set announcement, carrying the full deposit record so
/// acceptors can cross-check it against what they accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerSetMsg {
    pub deposit: DepositRecord,
    pub signers: Vec<u16>,
}

/// How one party leaves a consensus session.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Nothing to do this epoch.
    Idle,
    /// This party led the session to agreement and now coordinates signing.
    Lead {
        deposit: DepositRecord,
        signers: Vec<u16>,
        session_id: String,
    },
    /// This party accepted and was selected as co-signer. `session_id` is
    /// the proposer's, which all signing traffic runs under.
    CoSign {
        deposit: DepositRecord,
        signers: Vec<u16>,
        proposer: u16,
        session_id: String,
    },
    /// This party accepted but is not in the signer set; it waits for the
    /// signature broadcast on the proposer's session.
    Observe {
        deposit: DepositRecord,
        session_id: String,
    },
    /// The session failed or was rejected; retried next epoch.
    Aborted,
}

pub struct ConsensusEngine {
    bus: Arc<MessageBus>,
    pool: SqlitePool,
    observers: Arc<Observers>,
    config: Arc<Config>,
}

impl ConsensusEngine {
    /// The engine receives its collaborators at construction; nothing is
    /// reached through globals.
    pub fn new(
        bus: Arc<MessageBus>,
        pool: SqlitePool,
        observers: Arc<Observers>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            bus,
            pool,
            observers,
            config,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timing.consensus_timeout_ms)
    }

    /// Staleness threshold for re-offering `signed` rows whose finalization
    /// broadcast never arrived.
    fn stale_signed_secs(&self) -> i64 {
        (self.config.timing.session_interval_ms as i64 / 1000).max(60)
    }

    /// Run one session for `dest_chain` at `epoch`, in whichever role the
    /// leader election assigns this party.
    pub async fn run_session(
        &self,
        dest_chain: ChainTag,
        epoch: u64,
        session_id: &str,
    ) -> Result<SessionOutcome> {
        let me = self.bus.party_id();
        let leader = leader_for(session_id, self.config.party.total_parties);

        if leader == me {
            metrics::SESSIONS_TOTAL
                .with_label_values(&[dest_chain.as_str(), "proposer"])
                .inc();
            self.run_proposer(dest_chain, session_id).await
        } else {
            metrics::SESSIONS_TOTAL
                .with_label_values(&[dest_chain.as_str(), "acceptor"])
                .inc();
            self.run_acceptor(dest_chain, epoch).await
        }
    }

    // ========================================================================
    // Proposer
    // ========================================================================

    async fn run_proposer(
        &self,
        dest_chain: ChainTag,
        session_id: &str,
    ) -> Result<SessionOutcome> {
        let Some(deposit) =
            db::pending_for(&self.pool, dest_chain, self.stale_signed_secs()).await?
        else {
            debug!(session = session_id, "No pending deposit; session ends silently");
            return Ok(SessionOutcome::Idle);
        };
        let deposit_id = deposit.id();

        if !db::status_update(&self.pool, &deposit_id, DepositStatus::Processing, None).await? {
            // Concurrently finalized between selection and pickup.
            return Ok(SessionOutcome::Idle);
        }

        let sign_hash = match deposit.dest_chain {
            ChainTag::Evm => Some(hex::encode(
                evm_sign_hash_for(&deposit, &self.config)
                    .wrap_err("proposer failed to compute sign hash")?,
            )),
            ChainTag::Asset => None,
        };

        let proposal = Proposal {
            source_chain: deposit.source_chain,
            tx_id: deposit.tx_id.clone(),
            intra_index: deposit.intra_index,
            token_id: deposit.token_id.clone(),
            amount: deposit.amount.clone(),
            receiver: deposit.receiver.clone(),
            dest_chain: deposit.dest_chain,
            sign_hash,
        };

        info!(session = session_id, deposit = %deposit_id, "Proposing deposit");
        self.bus
            .broadcast(&self.envelope(session_id, msg_type::PROPOSAL, &proposal)?)
            .await;

        let acceptors = self.collect_acceptances(session_id, &deposit_id).await;
        let needed = (self.config.party.threshold - 1) as usize;

        if acceptors.len() < needed {
            warn!(
                session = session_id,
                deposit = %deposit_id,
                accepted = acceptors.len(),
                needed,
                "Insufficient acceptances; resetting deposit"
            );
            db::reset_if_status(&self.pool, &deposit_id, DepositStatus::Processing).await?;
            return Ok(SessionOutcome::Aborted);
        }

        let acceptor_list: Vec<u16> = acceptors.into_iter().collect();
        let signers = select_signers(
            session_id,
            self.bus.party_id(),
            &acceptor_list,
            self.config.party.threshold,
        );

        let signer_set = SignerSetMsg {
            deposit: deposit.clone(),
            signers: signers.clone(),
        };
        info!(session = session_id, ?signers, "Consensus reached; announcing signer set");
        self.bus
            .broadcast(&self.envelope(session_id, msg_type::SIGNER_SET, &signer_set)?)
            .await;

        Ok(SessionOutcome::Lead {
            deposit,
            signers,
            session_id: session_id.to_string(),
        })
    }

    /// Collect proposal responses on our own session id until `threshold−1`
    /// distinct acceptors replied or the timeout fires. Responses for other
    /// deposits and duplicate senders are ignored; rejections are logged
    /// with their reason.
    async fn collect_acceptances(
        &self,
        session_id: &str,
        deposit_id: &DepositId,
    ) -> BTreeSet<u16> {
        let me = self.bus.party_id();
        let needed = (self.config.party.threshold - 1) as usize;
        let max_responses = (self.config.party.total_parties - 1) as usize;
        let deadline = tokio::time::Instant::now() + self.timeout();
        let sessions = [session_id.to_string()];

        let mut acceptors: BTreeSet<u16> = BTreeSet::new();
        let mut responded: BTreeSet<u16> = BTreeSet::new();

        while acceptors.len() < needed && responded.len() < max_responses {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                break;
            };
            let Some(envelope) = self
                .bus
                .wait_for(msg_type::RESPONSE, &sessions, remaining)
                .await
            else {
                break;
            };

            if envelope.sender_id == me || !responded.insert(envelope.sender_id) {
                continue;
            }
            let response: ProposalResponse = match serde_json::from_value(envelope.data) {
                Ok(r) => r,
                Err(e) => {
                    warn!(sender = envelope.sender_id, error = %e, "Malformed proposal response");
                    continue;
                }
            };
            if response.tx_id != deposit_id.tx_id || response.intra_index != deposit_id.intra_index
            {
                debug!(sender = envelope.sender_id, "Response for a different deposit; ignoring");
                continue;
            }
            if response.accept {
                acceptors.insert(envelope.sender_id);
            } else {
                let reason = response.reason.as_deref().unwrap_or("unspecified");
                metrics::PROPOSALS_REJECTED
                    .with_label_values(&[reason])
                    .inc();
                warn!(
                    sender = envelope.sender_id,
                    reason, "Acceptor rejected proposal"
                );
            }
        }
        acceptors
    }

    // ========================================================================
    // Acceptor
    // ========================================================================

    async fn run_acceptor(&self, dest_chain: ChainTag, epoch: u64) -> Result<SessionOutcome> {
        let window = session_window(dest_chain, epoch);
        let Some(envelope) = self
            .bus
            .wait_for(msg_type::PROPOSAL, &window, self.timeout())
            .await
        else {
            debug!(epoch, %dest_chain, "No proposal this epoch");
            return Ok(SessionOutcome::Idle);
        };

        // Authority check: the sender must be the elected leader of the
        // session the proposal names; leadership is never ambiguous even
        // across the skew window.
        let proposal_session = envelope.session_id.clone();
        let proposer = envelope.sender_id;
        if leader_for(&proposal_session, self.config.party.total_parties) != proposer {
            warn!(
                session = %proposal_session,
                sender = proposer,
                "Proposal from a non-leader; dropping session"
            );
            return Ok(SessionOutcome::Aborted);
        }

        let proposal: Proposal = serde_json::from_value(envelope.data)
            .wrap_err("malformed proposal payload")?;

        match self.evaluate_proposal(&proposal).await? {
            Err(reason) => {
                metrics::PROPOSALS_REJECTED
                    .with_label_values(&[reason.label()])
                    .inc();
                warn!(
                    session = %proposal_session,
                    deposit = %proposal.deposit_id(),
                    reason = %reason,
                    "Rejecting proposal"
                );
                self.respond(&proposal_session, proposer, &proposal, Some(reason))
                    .await;
                Ok(SessionOutcome::Aborted)
            }
            Ok(canonical) => {
                // Store what the chain said, not what the leader claimed.
                db::upsert_deposit(&self.pool, &canonical).await?;
                self.respond(&proposal_session, proposer, &proposal, None)
                    .await;
                self.await_signer_set(&proposal_session, proposer, canonical)
                    .await
            }
        }
    }

    /// Independent re-verification. Only the identifying triple is taken
    /// from the proposal; amount, receiver, token and sign-hash claims are
    /// checked against a fresh chain read. Returns the re-fetched record,
    /// or the rejection reason.
    async fn evaluate_proposal(
        &self,
        proposal: &Proposal,
    ) -> Result<std::result::Result<DepositRecord, RejectReason>> {
        // A locally known row past `pending` means this deposit is already
        // being worked on or done.
        if let Some(known) = db::lookup(&self.pool, &proposal.deposit_id()).await? {
            if known.status != DepositStatus::Pending {
                return Ok(Err(RejectReason::Already(known.status.as_str().to_string())));
            }
        }

        let canonical = match self
            .observers
            .fetch_canonical(proposal.source_chain, &proposal.tx_id, proposal.intra_index)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Err(RejectReason::ChainVerificationFailed)),
            Err(e) => {
                warn!(error = %e, "Chain re-verification errored");
                return Ok(Err(RejectReason::ChainVerificationFailed));
            }
        };

        if claims_disagree(&canonical, proposal) {
            return Ok(Err(RejectReason::DataMismatch));
        }

        if canonical.dest_chain == ChainTag::Evm {
            let ours = hex::encode(evm_sign_hash_for(&canonical, &self.config)?);
            if proposal.sign_hash.as_deref() != Some(ours.as_str()) {
                return Ok(Err(RejectReason::SignHashMismatch));
            }
        }

        Ok(Ok(canonical))
    }

    async fn respond(
        &self,
        proposal_session: &str,
        proposer: u16,
        proposal: &Proposal,
        reason: Option<RejectReason>,
    ) {
        let response = ProposalResponse {
            accept: reason.is_none(),
            reason: reason.map(|r| r.to_string()),
            tx_id: proposal.tx_id.clone(),
            intra_index: proposal.intra_index,
        };
        let envelope = match self.envelope(proposal_session, msg_type::RESPONSE, &response) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Failed to encode proposal response");
                return;
            }
        };
        if let Err(e) = self.bus.send_to(proposer, &envelope).await {
            warn!(proposer, error = %e, "Failed to deliver proposal response");
        }
    }

    /// Wait for the signer-set announcement on the proposer's session and
    /// cross-check its embedded deposit against the one we accepted.
    async fn await_signer_set(
        &self,
        proposal_session: &str,
        proposer: u16,
        accepted: DepositRecord,
    ) -> Result<SessionOutcome> {
        let sessions = [proposal_session.to_string()];
        let Some(envelope) = self
            .bus
            .wait_for(msg_type::SIGNER_SET, &sessions, self.timeout())
            .await
        else {
            debug!(session = proposal_session, "No signer set arrived; dropping session");
            return Ok(SessionOutcome::Aborted);
        };
        if envelope.sender_id != proposer {
            warn!(
                session = proposal_session,
                sender = envelope.sender_id,
                "Signer set from a non-proposer; dropping session"
            );
            return Ok(SessionOutcome::Aborted);
        }

        let signer_set: SignerSetMsg =
            serde_json::from_value(envelope.data).wrap_err("malformed signer set payload")?;

        if signer_set.deposit.id() != accepted.id() {
            warn!(
                session = proposal_session,
                "Signer set names a different deposit; dropping session"
            );
            return Ok(SessionOutcome::Aborted);
        }

        // Recompute the selection: the signer set is verifiable, not taken
        // on trust.
        let expected = select_signers(
            proposal_session,
            proposer,
            &signer_set
                .signers
                .iter()
                .copied()
                .filter(|id| *id != proposer)
                .collect::<Vec<_>>(),
            self.config.party.threshold,
        );
        if signer_set.signers != expected {
            warn!(session = proposal_session, "Signer set fails deterministic re-selection");
            return Ok(SessionOutcome::Aborted);
        }

        if signer_set.signers.contains(&self.bus.party_id()) {
            Ok(SessionOutcome::CoSign {
                deposit: accepted,
                signers: signer_set.signers,
                proposer,
                session_id: proposal_session.to_string(),
            })
        } else {
            Ok(SessionOutcome::Observe {
                deposit: accepted,
                session_id: proposal_session.to_string(),
            })
        }
    }

    fn envelope<T: Serialize>(
        &self,
        session_id: &str,
        msg_type: &str,
        payload: &T,
    ) -> Result<Envelope> {
        Ok(Envelope {
            sender_id: self.bus.party_id(),
            session_id: session_id.to_string(),
            msg_type: msg_type.to_string(),
            data: serde_json::to_value(payload)?,
        })
    }
}

/// Compare a re-fetched record against a proposal's claim-bearing fields.
/// Anything the proposer asserted that the chain does not confirm is a
/// mismatch; status, signature and sender never participate.
fn claims_disagree(canonical: &DepositRecord, proposal: &Proposal) -> bool {
    canonical.amount != proposal.amount
        || canonical.receiver != proposal.receiver
        || canonical.token_id != proposal.token_id
        || canonical.dest_chain != proposal.dest_chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical() -> DepositRecord {
        DepositRecord {
            source_chain: ChainTag::Asset,
            tx_id: "ab".repeat(32),
            intra_index: 0,
            token_id: Some("cd".repeat(32)),
            amount: "10000000000000".to_string(),
            sender: Some("Zx".to_string() + &"D".repeat(95)),
            receiver: format!("0x{}", "f3".repeat(20)),
            dest_chain: ChainTag::Evm,
            status: DepositStatus::Pending,
            signature: None,
        }
    }

    fn proposal_for(record: &DepositRecord) -> Proposal {
        Proposal {
            source_chain: record.source_chain,
            tx_id: record.tx_id.clone(),
            intra_index: record.intra_index,
            token_id: record.token_id.clone(),
            amount: record.amount.clone(),
            receiver: record.receiver.clone(),
            dest_chain: record.dest_chain,
            sign_hash: None,
        }
    }

    #[test]
    fn honest_proposal_matches_chain_data() {
        let record = canonical();
        let proposal = proposal_for(&record);
        assert!(!claims_disagree(&record, &proposal));
    }

    #[test]
    fn inflated_amount_is_a_mismatch() {
        let record = canonical();
        let mut proposal = proposal_for(&record);
        // The true on-chain event is 10e12; the leader claims 1000e12.
        proposal.amount = "1000000000000000".to_string();
        assert!(claims_disagree(&record, &proposal));
    }

    #[test]
    fn redirected_receiver_is_a_mismatch() {
        let record = canonical();
        let mut proposal = proposal_for(&record);
        proposal.receiver = format!("0x{}", "66".repeat(20));
        assert!(claims_disagree(&record, &proposal));
    }

    #[test]
    fn swapped_token_is_a_mismatch() {
        let record = canonical();
        let mut proposal = proposal_for(&record);
        proposal.token_id = Some("ef".repeat(32));
        assert!(claims_disagree(&record, &proposal));
    }

    #[test]
    fn sender_is_not_claim_bearing() {
        let mut record = canonical();
        record.sender = None;
        let proposal = proposal_for(&canonical());
        assert!(!claims_disagree(&record, &proposal));
    }

    #[test]
    fn reject_reasons_render_their_wire_strings() {
        assert_eq!(
            RejectReason::ChainVerificationFailed.to_string(),
            "chain verification failed"
        );
        assert_eq!(RejectReason::DataMismatch.to_string(), "data mismatch");
        assert_eq!(RejectReason::SignHashMismatch.to_string(), "signHash mismatch");
        assert_eq!(
            RejectReason::Already("finalized".to_string()).to_string(),
            "already finalized"
        );
    }
}
