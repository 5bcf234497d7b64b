//! Chain observer composition and the poll operation.
//!
//! One observer per chain; polling advances a store-backed cursor from the
//! last fully scanned height to `head − required_confirmations` and upserts
//! every deposit found. Re-scans are harmless: the store upsert is
//! idempotent on the identifying triple.

use eyre::Result;
use multichain::asset::{AssetDaemonClient, AssetObserver, AssetWalletClient};
use multichain::evm::EvmObserver;
use multichain::{ChainTag, DepositRecord};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::metrics;

/// Upper bound on blocks scanned per poll, to stay RPC-friendly.
const MAX_SCAN_SPAN: u64 = 5_000;

pub struct Observers {
    pub evm: EvmObserver,
    pub asset: AssetObserver,
}

impl Observers {
    pub fn from_config(config: &Config) -> Result<Self> {
        let evm = EvmObserver::new(
            &config.evm.rpc_url,
            &config.evm.bridge_address,
            &config.evm.token_address,
            config.evm.chain_id,
            config.evm.required_confirmations,
        )?;
        let asset = AssetObserver::new(
            AssetDaemonClient::new(&config.asset.daemon_rpc_url)?,
            AssetWalletClient::new(&config.asset.wallet_rpc_url)?,
            &config.asset.asset_id,
            config.asset.required_confirmations,
        );
        Ok(Self { evm, asset })
    }

    /// Re-fetch a deposit from chain data alone. Used by acceptors to
    /// re-verify a proposer's claim without trusting any of it.
    pub async fn fetch_canonical(
        &self,
        chain: ChainTag,
        tx_id: &str,
        intra_index: u32,
    ) -> Result<Option<DepositRecord>> {
        match chain {
            ChainTag::Evm => self.evm.fetch_canonical(tx_id, intra_index).await,
            ChainTag::Asset => self.asset.fetch_canonical(tx_id, intra_index).await,
        }
    }

    /// Advance the poll cursor for `chain` and upsert every deposit found.
    pub async fn poll(&self, chain: ChainTag, pool: &SqlitePool) -> Result<()> {
        let head = match chain {
            ChainTag::Evm => self.evm.confirmed_head().await?,
            ChainTag::Asset => self.asset.confirmed_head().await?,
        };
        metrics::LAST_OBSERVED_HEIGHT
            .with_label_values(&[chain.as_str()])
            .set(head as f64);

        let Some(last) = db::get_cursor(pool, chain).await? else {
            // First run: start at the current confirmed head rather than
            // replaying the whole chain.
            info!(%chain, head, "Initializing poll cursor");
            db::set_cursor(pool, chain, head).await?;
            return Ok(());
        };

        if head <= last {
            return Ok(());
        }
        let from = last + 1;
        let to = head.min(last + MAX_SCAN_SPAN);

        let deposits = match chain {
            ChainTag::Evm => self.evm.scan_range(from, to).await?,
            ChainTag::Asset => self.asset.scan_range(from, to).await?,
        };

        for record in &deposits {
            match db::upsert_deposit(pool, record).await {
                Ok(true) => {
                    metrics::DEPOSITS_OBSERVED
                        .with_label_values(&[chain.as_str()])
                        .inc();
                    info!(
                        deposit = %record.id(),
                        amount = %record.amount,
                        receiver = %record.receiver,
                        dest = %record.dest_chain,
                        "New deposit observed"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(deposit = %record.id(), error = %e, "Failed to upsert observed deposit");
                }
            }
        }

        db::set_cursor(pool, chain, to).await?;
        Ok(())
    }
}
