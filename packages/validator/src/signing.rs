//! Signing coordinator.
//!
//! Turns an agreed deposit into the canonical 32-byte digest for its
//! destination chain, drives the threshold-signing primitive across the
//! selected signer pair, and broadcasts the finished signature to every
//! party, including non-signers, who record it and may finalize
//! themselves on the permissionless EVM path.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use multichain::asset::AssetWalletClient;
use multichain::evm::sighash;
use multichain::{parse_amount, ChainTag, DepositRecord, DepositStatus};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::bus::{msg_type, Envelope, MessageBus};
use crate::config::Config;
use crate::db;
use crate::finalizer;
use crate::metrics;
use crate::tss::keyshare::StoredKeyshare;
use crate::tss::sign::run_signing;

/// Sentinel in the token map routing a deposit to the native-coin
/// withdrawal encoding instead of the fungible one.
pub const NATIVE_TOKEN: &str = "native";

/// Completed signature, broadcast to all parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureResultMsg {
    /// Destination-chain encoding: 65-byte `r||s||v` hex for EVM, 64-byte
    /// `r||s` hex for the asset chain.
    pub signature: String,
    pub group_address: String,
    pub source_chain: ChainTag,
    pub tx_id: String,
    pub intra_index: u32,
    pub dest_chain: ChainTag,
}

/// Leader → co-signer hand-off of the unsigned asset-chain transaction.
/// The co-signer signs the `tx_id` digest these blobs pin down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetTxBlobsMsg {
    pub tx_id: String,
    pub unsigned_tx: String,
    pub finalized_tx: String,
    pub source_tx_id: String,
    pub intra_index: u32,
}

/// Canonical pre-EIP-191 sign-hash for an EVM-bound deposit. Pure function
/// of the record and static configuration; every party computes the same
/// bytes or consensus fails with a sign-hash mismatch.
pub fn evm_sign_hash_for(record: &DepositRecord, config: &Config) -> Result<[u8; 32]> {
    let amount = parse_amount(&record.amount)?;
    let receiver = Address::from_str(&record.receiver)
        .map_err(|e| eyre!("receiver is not an EVM address: {e}"))?;
    let source_tx_id = sighash::tx_id_to_bytes32(&record.tx_id)?;
    let chain_id = config.evm.chain_id;

    let token = match &record.token_id {
        Some(asset_id) => config
            .token_map
            .get(asset_id)
            .ok_or_else(|| eyre!("no EVM token mapped for asset {asset_id}"))?
            .clone(),
        None => return Err(eyre!("asset-origin deposit carries no asset id")),
    };

    let hash = if token == NATIVE_TOKEN {
        sighash::native_sign_hash(amount, receiver, source_tx_id, record.intra_index, chain_id)
    } else {
        let token = Address::from_str(&token)
            .map_err(|e| eyre!("token map entry is not an EVM address: {e}"))?;
        sighash::erc20_sign_hash(
            token,
            amount,
            receiver,
            source_tx_id,
            record.intra_index,
            chain_id,
            false,
        )
    };
    Ok(hash.0)
}

/// The digest handed to the TSS primitive for an EVM destination: the
/// canonical sign-hash under the EIP-191 prefix the contract verifies.
pub fn evm_digest_for(record: &DepositRecord, config: &Config) -> Result<[u8; 32]> {
    let hash = evm_sign_hash_for(record, config)?;
    Ok(sighash::eip191_digest(hash.into()).0)
}

pub struct SigningCoordinator {
    bus: Arc<MessageBus>,
    pool: SqlitePool,
    config: Arc<Config>,
    wallet: AssetWalletClient,
}

impl SigningCoordinator {
    pub fn new(
        bus: Arc<MessageBus>,
        pool: SqlitePool,
        config: Arc<Config>,
        wallet: AssetWalletClient,
    ) -> Self {
        Self {
            bus,
            pool,
            config,
            wallet,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timing.signing_timeout_ms)
    }

    /// Keyshares are reloaded from disk for every session.
    fn load_keyshare(&self) -> Result<StoredKeyshare> {
        StoredKeyshare::load(&self.config.keyshare_path())
    }

    /// Leader-side signing: produce the digest, drive the rounds with the
    /// co-signer, broadcast the result and hand off to the finalizer.
    pub async fn lead(
        &self,
        session_id: &str,
        deposit: &DepositRecord,
        signers: &[u16],
    ) -> Result<()> {
        let keyshare = self.load_keyshare()?;
        let mut protocol_signers = signers.to_vec();
        protocol_signers.sort();

        match deposit.dest_chain {
            ChainTag::Evm => {
                let digest = evm_digest_for(deposit, &self.config)?;
                let raw = run_signing(
                    self.bus.clone(),
                    &keyshare,
                    digest,
                    &protocol_signers,
                    session_id,
                    self.timeout(),
                )
                .await?;
                let signature = raw.to_evm_hex(&digest, &keyshare.group_address)?;
                metrics::SIGNATURES_TOTAL
                    .with_label_values(&[ChainTag::Evm.as_str()])
                    .inc();

                self.record_and_broadcast(session_id, deposit, &keyshare, &signature)
                    .await?;
                finalizer::finalize_evm(
                    &self.bus,
                    &self.pool,
                    &self.config,
                    deposit,
                    &signature,
                    session_id,
                )
                .await
            }
            ChainTag::Asset => {
                // Only the leader can create the unsigned emission; the
                // co-signer receives the exact blobs before any signing
                // round so both sign the same digest.
                let emit = self
                    .wallet
                    .emit_asset(
                        &self.config.asset.asset_id,
                        &deposit.receiver,
                        &deposit.amount,
                    )
                    .await
                    .wrap_err("create-unsigned-emit failed")?;

                let blobs = AssetTxBlobsMsg {
                    tx_id: emit.tx_id.clone(),
                    unsigned_tx: emit.unsigned_tx.clone(),
                    finalized_tx: emit.finalized_tx.clone(),
                    source_tx_id: deposit.tx_id.clone(),
                    intra_index: deposit.intra_index,
                };
                for signer in signers.iter().filter(|s| **s != self.bus.party_id()) {
                    self.bus
                        .send_to(*signer, &self.envelope(session_id, msg_type::ASSET_TX_BLOBS, &blobs)?)
                        .await?;
                }

                let digest = asset_digest(&emit.tx_id)?;
                let raw = run_signing(
                    self.bus.clone(),
                    &keyshare,
                    digest,
                    &protocol_signers,
                    session_id,
                    self.timeout(),
                )
                .await?;
                let signature = raw.to_asset_hex();
                metrics::SIGNATURES_TOTAL
                    .with_label_values(&[ChainTag::Asset.as_str()])
                    .inc();

                self.record_and_broadcast(session_id, deposit, &keyshare, &signature)
                    .await?;
                finalizer::finalize_asset(
                    &self.bus,
                    &self.pool,
                    &self.wallet,
                    deposit,
                    &emit,
                    &signature,
                    session_id,
                )
                .await
            }
        }
    }

    /// Co-signer side: derive (or receive) the same digest and run the
    /// rounds. The leader broadcasts the combined signature afterwards.
    pub async fn cosign(
        &self,
        session_id: &str,
        deposit: &DepositRecord,
        signers: &[u16],
        proposer: u16,
    ) -> Result<()> {
        let keyshare = self.load_keyshare()?;
        let mut protocol_signers = signers.to_vec();
        protocol_signers.sort();

        let digest = match deposit.dest_chain {
            // Deterministic destination: the digest was already verified
            // during consensus; recompute it locally.
            ChainTag::Evm => evm_digest_for(deposit, &self.config)?,
            // Opaque destination: wait for the leader's blobs and take the
            // digest from them.
            ChainTag::Asset => {
                let sessions = [session_id.to_string()];
                let envelope = self
                    .bus
                    .wait_for(msg_type::ASSET_TX_BLOBS, &sessions, self.timeout())
                    .await
                    .ok_or_else(|| eyre!("timed out waiting for asset tx blobs"))?;
                if envelope.sender_id != proposer {
                    return Err(eyre!("asset tx blobs from non-proposer {}", envelope.sender_id));
                }
                let blobs: AssetTxBlobsMsg = serde_json::from_value(envelope.data)
                    .wrap_err("malformed asset tx blobs")?;
                if blobs.source_tx_id != deposit.tx_id || blobs.intra_index != deposit.intra_index {
                    return Err(eyre!("asset tx blobs name a different deposit"));
                }
                asset_digest(&blobs.tx_id)?
            }
        };

        let raw = run_signing(
            self.bus.clone(),
            &keyshare,
            digest,
            &protocol_signers,
            session_id,
            self.timeout(),
        )
        .await?;

        let signature = match deposit.dest_chain {
            ChainTag::Evm => raw.to_evm_hex(&digest, &keyshare.group_address)?,
            ChainTag::Asset => raw.to_asset_hex(),
        };
        db::status_update(
            &self.pool,
            &deposit.id(),
            DepositStatus::Signed,
            Some(&signature),
        )
        .await?;
        info!(session = session_id, deposit = %deposit.id(), "Co-signing complete");
        Ok(())
    }

    async fn record_and_broadcast(
        &self,
        session_id: &str,
        deposit: &DepositRecord,
        keyshare: &StoredKeyshare,
        signature: &str,
    ) -> Result<()> {
        db::status_update(
            &self.pool,
            &deposit.id(),
            DepositStatus::Signed,
            Some(signature),
        )
        .await?;

        let result = SignatureResultMsg {
            signature: signature.to_string(),
            group_address: keyshare.group_address.clone(),
            source_chain: deposit.source_chain,
            tx_id: deposit.tx_id.clone(),
            intra_index: deposit.intra_index,
            dest_chain: deposit.dest_chain,
        };
        self.bus
            .broadcast(&self.envelope(session_id, msg_type::SIGNATURE_RESULT, &result)?)
            .await;
        info!(session = session_id, deposit = %deposit.id(), "Signature broadcast");
        Ok(())
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

    /// Non-signer path: wait for the broadcast signature on the proposer's
    /// session, record `signed`, and on the permissionless EVM path
    /// submit the withdrawal ourselves if no finalization notice arrives.
    pub async fn observe(
        &self,
        session_id: &str,
        deposit: &DepositRecord,
    ) -> Result<()> {
        let sessions = [session_id.to_string()];
        let Some(envelope) = self
            .bus
            .wait_for(msg_type::SIGNATURE_RESULT, &sessions, self.timeout())
            .await
        else {
            warn!(session = session_id, "No signature broadcast arrived; dropping session");
            return Ok(());
        };
        let result: SignatureResultMsg =
            serde_json::from_value(envelope.data).wrap_err("malformed signature result")?;
        if result.tx_id != deposit.tx_id || result.intra_index != deposit.intra_index {
            warn!(session = session_id, "Signature result names a different deposit; ignoring");
            return Ok(());
        }

        db::status_update(
            &self.pool,
            &deposit.id(),
            DepositStatus::Signed,
            Some(&result.signature),
        )
        .await?;

        if deposit.dest_chain == ChainTag::Evm {
            // Give the leader a head start, then check whether its
            // finalization notice transitioned the row. If not, anyone may
            // submit the withdrawal.
            tokio::time::sleep(self.timeout()).await;
            let still_signed = matches!(
                db::lookup(&self.pool, &deposit.id()).await?,
                Some(row) if row.status == DepositStatus::Signed
            );
            if still_signed {
                info!(
                    deposit = %deposit.id(),
                    "No finalization notice received; submitting withdrawal ourselves"
                );
                finalizer::finalize_evm(
                    &self.bus,
                    &self.pool,
                    &self.config,
                    deposit,
                    &result.signature,
                    session_id,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// The asset-chain digest is the unsigned transaction id itself; no
/// prefixing or extra hashing is applied.
pub fn asset_digest(tx_id: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(tx_id.strip_prefix("0x").unwrap_or(tx_id))
        .map_err(|e| eyre!("asset tx id is not hex: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| eyre!("asset tx id is not 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetConfig, BusConfig, EvmConfig, PartyConfig, TimingConfig};
    use multichain::DepositStatus;

    fn test_config(token_map_entry: &str) -> Config {
        let mut token_map = std::collections::HashMap::new();
        token_map.insert("aa".repeat(32), token_map_entry.to_string());
        Config {
            party: PartyConfig {
                party_id: 0,
                total_parties: 3,
                threshold: 2,
            },
            bus: BusConfig {
                peer_hosts: vec!["localhost".into(); 3],
                base_port: 9000,
                shared_secret: "s".into(),
            },
            evm: EvmConfig {
                rpc_url: "http://localhost:8545".into(),
                bridge_address: format!("0x{}", "11".repeat(20)),
                token_address: format!("0x{}", "22".repeat(20)),
                chain_id: 11155111,
                required_confirmations: 64,
                private_key: "00".repeat(32),
            },
            asset: AssetConfig {
                daemon_rpc_url: "http://localhost:11211".into(),
                wallet_rpc_url: "http://localhost:11212".into(),
                asset_id: "aa".repeat(32),
                required_confirmations: 10,
            },
            timing: TimingConfig {
                session_interval_ms: 30_000,
                consensus_timeout_ms: 1_000,
                signing_timeout_ms: 1_000,
            },
            token_map,
            data_dir: std::env::temp_dir(),
        }
    }

    fn asset_deposit() -> DepositRecord {
        DepositRecord {
            source_chain: ChainTag::Asset,
            tx_id: "ab".repeat(32),
            intra_index: 0,
            token_id: Some("aa".repeat(32)),
            amount: "5000000000000".to_string(),
            sender: None,
            receiver: format!("0x{}", "f3".repeat(20)),
            dest_chain: ChainTag::Evm,
            status: DepositStatus::Pending,
            signature: None,
        }
    }

    #[test]
    fn sign_hash_is_deterministic_across_parties() {
        let config = test_config("0x0000000000000000000000000000000000001234");
        let a = evm_sign_hash_for(&asset_deposit(), &config).unwrap();
        let b = evm_sign_hash_for(&asset_deposit(), &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sign_hash_depends_on_amount() {
        let config = test_config("0x0000000000000000000000000000000000001234");
        let a = evm_sign_hash_for(&asset_deposit(), &config).unwrap();
        let mut inflated = asset_deposit();
        inflated.amount = "1000000000000000".to_string();
        let b = evm_sign_hash_for(&inflated, &config).unwrap();
        assert_ne!(a, b, "an inflated amount must change the digest");
    }

    #[test]
    fn unmapped_asset_is_an_error() {
        let config = test_config("0x0000000000000000000000000000000000001234");
        let mut deposit = asset_deposit();
        deposit.token_id = Some("bb".repeat(32));
        assert!(evm_sign_hash_for(&deposit, &config).is_err());
    }

    #[test]
    fn native_sentinel_uses_native_encoding() {
        let erc20 = test_config("0x0000000000000000000000000000000000001234");
        let native = test_config(NATIVE_TOKEN);
        let a = evm_sign_hash_for(&asset_deposit(), &erc20).unwrap();
        let b = evm_sign_hash_for(&asset_deposit(), &native).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn digest_applies_eip191_over_sign_hash() {
        let config = test_config("0x0000000000000000000000000000000000001234");
        let hash = evm_sign_hash_for(&asset_deposit(), &config).unwrap();
        let digest = evm_digest_for(&asset_deposit(), &config).unwrap();
        assert_ne!(hash, digest);
        assert_eq!(
            digest,
            multichain::evm::sighash::eip191_digest(hash.into()).0
        );
    }

    #[test]
    fn asset_digest_is_the_tx_id_bytes() {
        let tx_id = "cd".repeat(32);
        let digest = asset_digest(&tx_id).unwrap();
        assert_eq!(hex::encode(digest), tx_id);
        assert!(asset_digest("cdcd").is_err());
        assert!(asset_digest("zz").is_err());
    }
}
