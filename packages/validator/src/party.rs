//! The long-running validator loop.
//!
//! One epoch tick at a time: sleep to the epoch boundary, poll both
//! chains, then run one consensus-plus-signing session per direction.
//! Collaborators (bus, store, observers) are built once at boot and
//! threaded through by parameter.

use std::sync::Arc;

use eyre::{eyre, Result};
use multichain::asset::AssetWalletClient;
use multichain::{ChainTag, DepositStatus};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{msg_type, server, MessageBus};
use crate::config::Config;
use crate::consensus::{ConsensusEngine, SessionOutcome};
use crate::db;
use crate::finalizer::{self, DepositFinalizedMsg};
use crate::metrics;
use crate::observers::Observers;
use crate::session;
use crate::signing::SigningCoordinator;
use crate::tss::keyshare::StoredKeyshare;

pub struct Party {
    config: Arc<Config>,
    pool: SqlitePool,
    bus: Arc<MessageBus>,
    observers: Arc<Observers>,
    consensus: ConsensusEngine,
    coordinator: SigningCoordinator,
}

impl Party {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        // A party without a keyshare cannot participate in any session;
        // refusing to start beats failing every signing round.
        let keyshare = StoredKeyshare::load(&config.keyshare_path())?;
        if keyshare.party_id != config.party.party_id {
            return Err(eyre!(
                "keyshare belongs to party {} but PARTY_ID is {}",
                keyshare.party_id,
                config.party.party_id
            ));
        }
        info!(group_address = %keyshare.group_address, "Keyshare loaded");

        let pool = db::create_pool(&config.store_path()).await?;
        db::run_migrations(&pool).await?;

        let bus = Arc::new(MessageBus::new(
            config.party.party_id,
            config.party.total_parties,
            &config.bus,
        )?);
        let observers = Arc::new(Observers::from_config(&config)?);
        let wallet = AssetWalletClient::new(&config.asset.wallet_rpc_url)?;

        let consensus = ConsensusEngine::new(
            bus.clone(),
            pool.clone(),
            observers.clone(),
            config.clone(),
        );
        let coordinator =
            SigningCoordinator::new(bus.clone(), pool.clone(), config.clone(), wallet);

        Ok(Self {
            config,
            pool,
            bus,
            observers,
            consensus,
            coordinator,
        })
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let listen_port = self.config.bus.base_port + self.config.party.party_id;
        let server_bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = server::start_server(server_bus, listen_port).await {
                error!(error = %e, "Bus server error");
            }
        });

        // Finalization notices can arrive at any time, for any session.
        let notice_bus = self.bus.clone();
        let notice_pool = self.pool.clone();
        tokio::spawn(async move {
            finalized_notice_listener(notice_bus, notice_pool).await;
        });

        metrics::UP.set(1.0);
        let interval = self.config.timing.session_interval_ms;
        info!(
            party_id = self.config.party.party_id,
            session_interval_ms = interval,
            "Validator loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping validator loop");
                    metrics::UP.set(0.0);
                    return Ok(());
                }
                _ = tokio::time::sleep(session::until_next_epoch(interval)) => {
                    let epoch = session::epoch_now(interval);
                    metrics::CURRENT_EPOCH.set(epoch as f64);
                    self.bus.cleanup(epoch);
                    self.refresh_queue_gauges().await;

                    // Per-direction work runs concurrently within the tick.
                    tokio::join!(
                        self.run_direction(ChainTag::Evm, epoch),
                        self.run_direction(ChainTag::Asset, epoch),
                    );
                }
            }
        }
    }

    async fn refresh_queue_gauges(&self) {
        for status in [
            DepositStatus::Pending,
            DepositStatus::Processing,
            DepositStatus::Signed,
            DepositStatus::Finalized,
        ] {
            match db::count_status(&self.pool, status).await {
                Ok(count) => metrics::DEPOSITS_BY_STATUS
                    .with_label_values(&[status.as_str()])
                    .set(count as f64),
                Err(e) => warn!(error = %e, "Failed to count deposits for metrics"),
            }
        }
    }

    /// One direction of one epoch: poll the source chain, then run the
    /// session for deposits withdrawing on `dest_chain`.
    async fn run_direction(&self, dest_chain: ChainTag, epoch: u64) {
        let source_chain = dest_chain.opposite();
        if let Err(e) = self.observers.poll(source_chain, &self.pool).await {
            // Transient by definition; the cursor did not advance and the
            // next epoch re-polls.
            warn!(chain = %source_chain, error = %e, "Chain poll failed");
        }

        let session_id = session::session_id(dest_chain, epoch);
        let outcome = match self.consensus.run_session(dest_chain, epoch, &session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Consensus session errored");
                return;
            }
        };

        match outcome {
            SessionOutcome::Idle | SessionOutcome::Aborted => {}
            SessionOutcome::Lead {
                deposit,
                signers,
                session_id,
            } => {
                if let Err(e) = self
                    .coordinator
                    .lead(&session_id, &deposit, &signers)
                    .await
                {
                    warn!(
                        session = %session_id,
                        deposit = %deposit.id(),
                        error = %e,
                        "Signing failed; resetting deposit"
                    );
                    if let Err(e) =
                        db::status_update(&self.pool, &deposit.id(), DepositStatus::Pending, None)
                            .await
                    {
                        error!(error = %e, "Failed to reset deposit after signing failure");
                    }
                }
            }
            SessionOutcome::CoSign {
                deposit,
                signers,
                proposer,
                session_id,
            } => {
                if let Err(e) = self
                    .coordinator
                    .cosign(&session_id, &deposit, &signers, proposer)
                    .await
                {
                    warn!(
                        session = %session_id,
                        deposit = %deposit.id(),
                        error = %e,
                        "Co-signing failed; dropping session"
                    );
                }
            }
            SessionOutcome::Observe {
                deposit,
                session_id,
            } => {
                if let Err(e) = self.coordinator.observe(&session_id, &deposit).await {
                    warn!(
                        session = %session_id,
                        deposit = %deposit.id(),
                        error = %e,
                        "Observation failed"
                    );
                }
            }
        }
    }
}

/// Apply inbound finalization notices for as long as the process lives.
async fn finalized_notice_listener(bus: Arc<MessageBus>, pool: SqlitePool) {
    loop {
        let Some(envelope) = bus
            .wait_any(
                msg_type::DEPOSIT_FINALIZED,
                std::time::Duration::from_secs(60),
            )
            .await
        else {
            continue;
        };
        match serde_json::from_value::<DepositFinalizedMsg>(envelope.data) {
            Ok(notice) => {
                if let Err(e) = finalizer::apply_finalized_notice(&pool, &notice).await {
                    warn!(error = %e, "Failed to apply finalization notice");
                }
            }
            Err(e) => {
                warn!(sender = envelope.sender_id, error = %e, "Malformed finalization notice");
            }
        }
    }
}
