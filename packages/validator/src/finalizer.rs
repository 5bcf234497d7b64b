//! Finalizer: submits authorized withdrawals on the destination chain.
//!
//! The EVM path is permissionless: any party holding the broadcast
//! signature may submit, and the contract's consumed-set makes duplicates
//! revert with "already processed", which maps to a local `finalized`
//! transition (the work is done). Any other revert is treated as transient
//! and the record returns to `pending` for a later epoch. The asset-chain
//! path can only be driven by the leader, which holds the unsigned
//! transaction blobs.

use std::str::FromStr;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use multichain::asset::rpc::UnsignedEmit;
use multichain::asset::AssetWalletClient;
use multichain::evm::contracts::Bridge;
use multichain::evm::sighash;
use multichain::{parse_amount, ChainTag, DepositId, DepositRecord, DepositStatus};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::bus::{msg_type, Envelope, MessageBus};
use crate::config::Config;
use crate::db;
use crate::metrics;

/// Finalization notice, broadcast so every party can close its row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositFinalizedMsg {
    pub source_chain: ChainTag,
    pub tx_id: String,
    pub intra_index: u32,
}

/// Submit the EVM withdrawal for a signed deposit.
pub async fn finalize_evm(
    bus: &Arc<MessageBus>,
    pool: &SqlitePool,
    config: &Config,
    deposit: &DepositRecord,
    signature: &str,
    session_id: &str,
) -> Result<()> {
    let deposit_id = deposit.id();

    match submit_evm_withdrawal(config, deposit, signature).await {
        Ok(tx_hash) => {
            info!(deposit = %deposit_id, tx_hash, "Withdrawal submitted on EVM chain");
            mark_finalized(bus, pool, &deposit_id, session_id).await
        }
        Err(e) => {
            if revert_is_already_processed(&format!("{e:#}")) {
                // Someone else consumed the replay key; the work is done.
                info!(deposit = %deposit_id, "Withdrawal already processed on chain");
                mark_finalized(bus, pool, &deposit_id, session_id).await
            } else {
                warn!(deposit = %deposit_id, error = %e, "Withdrawal submission failed; will retry");
                db::status_update(pool, &deposit_id, DepositStatus::Pending, None).await?;
                Ok(())
            }
        }
    }
}

/// The one revert that means success: the contract's replay ledger already
/// holds this (txHash, txNonce). Every other failure is transient.
fn revert_is_already_processed(rendered: &str) -> bool {
    rendered.to_lowercase().contains("already processed")
}

async fn submit_evm_withdrawal(
    config: &Config,
    deposit: &DepositRecord,
    signature: &str,
) -> Result<String> {
    let signer: PrivateKeySigner = config
        .evm
        .private_key
        .parse()
        .wrap_err("Invalid EVM private key")?;
    let provider = ProviderBuilder::new()
        .with_recommended_fillers()
        .wallet(EthereumWallet::from(signer))
        .on_http(config.evm.rpc_url.parse().wrap_err("Invalid EVM RPC URL")?);

    let bridge_address =
        Address::from_str(&config.evm.bridge_address).wrap_err("Invalid bridge address")?;
    let contract = Bridge::new(bridge_address, provider);

    let amount = parse_amount(&deposit.amount)?;
    let receiver = Address::from_str(&deposit.receiver)
        .map_err(|e| eyre!("receiver is not an EVM address: {e}"))?;
    let tx_hash_32 = sighash::tx_id_to_bytes32(&deposit.tx_id)?;
    let tx_nonce = U256::from(deposit.intra_index);

    let sig_hex = signature.strip_prefix("0x").unwrap_or(signature);
    let sig_bytes = Bytes::from(hex::decode(sig_hex).wrap_err("signature is not hex")?);
    let signatures = vec![sig_bytes];

    let asset_id = deposit
        .token_id
        .as_ref()
        .ok_or_else(|| eyre!("asset-origin deposit carries no asset id"))?;
    let token = config
        .token_map
        .get(asset_id)
        .ok_or_else(|| eyre!("no EVM token mapped for asset {asset_id}"))?;

    let pending = if token == crate::signing::NATIVE_TOKEN {
        contract
            .withdrawNative(amount, receiver, tx_hash_32, tx_nonce, signatures)
            .send()
            .await
            .wrap_err("withdrawNative submission failed")?
    } else {
        let token = Address::from_str(token)
            .map_err(|e| eyre!("token map entry is not an EVM address: {e}"))?;
        contract
            .withdrawERC20(token, amount, receiver, tx_hash_32, tx_nonce, false, signatures)
            .send()
            .await
            .wrap_err("withdrawERC20 submission failed")?
    };

    let tx_hash = pending
        .watch()
        .await
        .wrap_err("withdrawal transaction not confirmed")?;
    Ok(format!("{tx_hash:?}"))
}

/// Submit the asset-chain emission for a signed deposit. Leader only; the
/// blobs exist nowhere else.
pub async fn finalize_asset(
    bus: &Arc<MessageBus>,
    pool: &SqlitePool,
    wallet: &AssetWalletClient,
    deposit: &DepositRecord,
    emit: &UnsignedEmit,
    signature: &str,
    session_id: &str,
) -> Result<()> {
    let deposit_id = deposit.id();

    match wallet
        .send_ext_signed_asset_tx(
            signature,
            &emit.tx_id,
            &emit.unsigned_tx,
            &emit.finalized_tx,
        )
        .await
    {
        Ok(result) => {
            info!(
                deposit = %deposit_id,
                emit_tx = %emit.tx_id,
                status = %result.status,
                "Emission submitted on asset chain"
            );
            mark_finalized(bus, pool, &deposit_id, session_id).await
        }
        Err(e) => {
            warn!(deposit = %deposit_id, error = %e, "Emission submission failed; will retry");
            db::status_update(pool, &deposit_id, DepositStatus::Pending, None).await?;
            Ok(())
        }
    }
}

/// Transition the local row and notify peers. The update is idempotent:
/// `finalized` rows refuse further transitions, so replays are harmless.
async fn mark_finalized(
    bus: &Arc<MessageBus>,
    pool: &SqlitePool,
    deposit_id: &DepositId,
    session_id: &str,
) -> Result<()> {
    db::status_update(pool, deposit_id, DepositStatus::Finalized, None).await?;
    metrics::FINALIZED_TOTAL
        .with_label_values(&[deposit_id.source_chain.as_str()])
        .inc();

    let notice = DepositFinalizedMsg {
        source_chain: deposit_id.source_chain,
        tx_id: deposit_id.tx_id.clone(),
        intra_index: deposit_id.intra_index,
    };
    let envelope = Envelope {
        sender_id: bus.party_id(),
        session_id: session_id.to_string(),
        msg_type: msg_type::DEPOSIT_FINALIZED.to_string(),
        data: serde_json::to_value(&notice)?,
    };
    bus.broadcast(&envelope).await;
    info!(deposit = %deposit_id, "Deposit finalized");
    Ok(())
}

/// Apply an inbound finalization notice: any party still holding a
/// non-finalized row for the identifier transitions it.
pub async fn apply_finalized_notice(pool: &SqlitePool, notice: &DepositFinalizedMsg) -> Result<()> {
    let id = DepositId::new(notice.source_chain, notice.tx_id.clone(), notice.intra_index);
    if db::status_update(pool, &id, DepositStatus::Finalized, None).await? {
        info!(deposit = %id, "Deposit finalized via peer notice");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multichain::DepositStatus as Status;

    #[test]
    fn already_processed_revert_is_terminal() {
        assert!(revert_is_already_processed(
            "server returned an error response: execution reverted: Already processed"
        ));
        assert!(revert_is_already_processed("already processed"));
    }

    #[test]
    fn other_reverts_are_transient() {
        for rendered in [
            "execution reverted: not enough signatures",
            "execution reverted: invalid signature",
            "connection refused",
            "transaction underpriced",
        ] {
            assert!(!revert_is_already_processed(rendered), "{rendered}");
        }
    }

    #[tokio::test]
    async fn replayed_notice_is_idempotent() {
        let pool = crate::db::create_memory_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let record = multichain::DepositRecord {
            source_chain: ChainTag::Asset,
            tx_id: "ab".repeat(32),
            intra_index: 0,
            token_id: Some("cd".repeat(32)),
            amount: "5000000000000".to_string(),
            sender: None,
            receiver: format!("0x{}", "f3".repeat(20)),
            dest_chain: ChainTag::Evm,
            status: Status::Pending,
            signature: None,
        };
        crate::db::upsert_deposit(&pool, &record).await.unwrap();

        let notice = DepositFinalizedMsg {
            source_chain: ChainTag::Asset,
            tx_id: record.tx_id.clone(),
            intra_index: 0,
        };
        apply_finalized_notice(&pool, &notice).await.unwrap();
        // A rebroadcast of the same notice changes nothing.
        apply_finalized_notice(&pool, &notice).await.unwrap();

        let row = crate::db::lookup(&pool, &record.id()).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Finalized);
    }

    #[tokio::test]
    async fn notice_for_unknown_deposit_is_harmless() {
        let pool = crate::db::create_memory_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let notice = DepositFinalizedMsg {
            source_chain: ChainTag::Evm,
            tx_id: format!("0x{}", "99".repeat(32)),
            intra_index: 3,
        };
        assert!(apply_finalized_notice(&pool, &notice).await.is_ok());
    }
}
