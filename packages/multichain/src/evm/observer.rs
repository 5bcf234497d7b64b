//! EVM-side deposit observer.
//!
//! Watches the bridge contract for `DepositedERC20` / `DepositedNative`
//! logs past the configured confirmation depth, and re-reads single
//! transactions on demand so acceptors can reconstruct a deposit from chain
//! data alone, independent of anything a proposer claimed.

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionReceipt};
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::evm::contracts::Bridge;
use crate::types::{ChainTag, DepositRecord, DepositStatus};

/// Observer over the EVM chain's bridge contract.
pub struct EvmObserver {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
    /// The single fungible token this bridge instance carries.
    token_address: Address,
    chain_id: u64,
    required_confirmations: u64,
}

impl EvmObserver {
    pub fn new(
        rpc_url: &str,
        bridge_address: &str,
        token_address: &str,
        chain_id: u64,
        required_confirmations: u64,
    ) -> Result<Self> {
        let url = rpc_url.parse().wrap_err("Failed to parse EVM RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        let bridge_address =
            Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;
        let token_address = Address::from_str(token_address).wrap_err("Invalid token address")?;

        Ok(Self {
            provider,
            bridge_address,
            token_address,
            chain_id,
            required_confirmations,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Highest block considered visible: `head − required_confirmations`.
    /// Events above this height are treated as not yet existing.
    pub async fn confirmed_head(&self) -> Result<u64> {
        let head = self
            .provider
            .get_block_number()
            .await
            .wrap_err("Failed to get EVM block number")?;
        Ok(head.saturating_sub(self.required_confirmations))
    }

    /// Extract all bridge deposits in `[from_block, to_block]`. Idempotent
    /// under re-scan; the caller owns the cursor and the store upsert.
    pub async fn scan_range(&self, from_block: u64, to_block: u64) -> Result<Vec<DepositRecord>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("Failed to get bridge logs")?;

        let mut deposits = Vec::new();
        let mut current_tx: Option<B256> = None;
        let mut intra_index: u32 = 0;

        // Logs arrive ordered by (block, log index); the intra-transaction
        // index counts bridge-contract logs only, which the address filter
        // already guarantees.
        for log in &logs {
            let tx_hash = match log.transaction_hash {
                Some(h) => h,
                None => continue,
            };
            if current_tx != Some(tx_hash) {
                current_tx = Some(tx_hash);
                intra_index = 0;
            } else {
                intra_index += 1;
            }

            match self.decode_deposit(log, tx_hash, intra_index) {
                Ok(Some(record)) => deposits.push(record),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        tx_hash = %format!("{tx_hash:?}"),
                        error = %e,
                        "Skipping undecodable bridge log"
                    );
                }
            }
        }

        Ok(deposits)
    }

    /// True only if the transaction exists, succeeded, carries a matching
    /// bridge deposit at the claimed index, and sits at least
    /// `required_confirmations` blocks below the head.
    pub async fn verify(&self, tx_id: &str, intra_index: u32) -> Result<bool> {
        Ok(self.fetch_canonical(tx_id, intra_index).await?.is_some())
    }

    /// Reconstruct the deposit record entirely from on-chain data.
    ///
    /// Returns `None` when the transaction is missing, reverted, still
    /// inside the confirmation zone, or has no matching bridge event at the
    /// claimed intra-transaction index.
    pub async fn fetch_canonical(
        &self,
        tx_id: &str,
        intra_index: u32,
    ) -> Result<Option<DepositRecord>> {
        let tx_hash = parse_tx_hash(tx_id)?;

        let receipt = match self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .wrap_err("Failed to get transaction receipt")?
        {
            Some(r) => r,
            None => {
                debug!(tx_id, "No receipt found on EVM chain");
                return Ok(None);
            }
        };

        if !receipt.status() {
            debug!(tx_id, "Transaction reverted on EVM chain");
            return Ok(None);
        }

        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        let confirmed_head = self.confirmed_head().await?;
        if block_number > confirmed_head {
            debug!(
                tx_id,
                block_number, confirmed_head, "Deposit still inside the confirmation zone"
            );
            return Ok(None);
        }

        let Some(log) = self.nth_bridge_log(&receipt, intra_index) else {
            debug!(tx_id, intra_index, "No bridge log at claimed index");
            return Ok(None);
        };

        let mut record = match self.decode_deposit(&log, tx_hash, intra_index)? {
            Some(r) => r,
            None => return Ok(None),
        };
        record.sender = Some(format!("{:?}", receipt.from));
        Ok(Some(record))
    }

    /// The `intra_index`-th log emitted by the bridge contract within the
    /// receipt, ignoring incidental logs such as ERC-20 transfers.
    fn nth_bridge_log(&self, receipt: &TransactionReceipt, intra_index: u32) -> Option<Log> {
        receipt
            .inner
            .logs()
            .iter()
            .filter(|l| l.inner.address == self.bridge_address)
            .nth(intra_index as usize)
            .cloned()
    }

    /// Decode a bridge log into a deposit record. Returns `Ok(None)` for
    /// bridge events that are not deposits of the configured token, or
    /// whose destination data fails validation.
    fn decode_deposit(
        &self,
        log: &Log,
        tx_hash: B256,
        intra_index: u32,
    ) -> Result<Option<DepositRecord>> {
        let topic0 = log
            .topics()
            .first()
            .copied()
            .ok_or_else(|| eyre!("log has no topics"))?;

        let (token_id, amount, receiver, network): (Option<String>, U256, String, String) =
            if topic0 == Bridge::DepositedERC20::SIGNATURE_HASH {
                let event = Bridge::DepositedERC20::decode_log(&log.inner, true)
                    .wrap_err("Failed to decode DepositedERC20")?
                    .data;
                if event.token != self.token_address {
                    debug!(
                        token = %format!("{:?}", event.token),
                        "Ignoring deposit of unconfigured token"
                    );
                    return Ok(None);
                }
                (
                    Some(format!("{:?}", event.token)),
                    event.amount,
                    event.receiver,
                    event.network,
                )
            } else if topic0 == Bridge::DepositedNative::SIGNATURE_HASH {
                let event = Bridge::DepositedNative::decode_log(&log.inner, true)
                    .wrap_err("Failed to decode DepositedNative")?
                    .data;
                (None, event.amount, event.receiver, event.network)
            } else {
                // Some other bridge event (e.g. Withdrawn); counted for the
                // intra index but not a deposit.
                return Ok(None);
            };

        let dest_chain = match ChainTag::parse(&network) {
            Ok(tag) if tag != ChainTag::Evm => tag,
            Ok(_) => {
                warn!(tx_hash = %format!("{tx_hash:?}"), "Deposit routed back to its own chain; ignoring");
                return Ok(None);
            }
            Err(_) => {
                warn!(network, "Deposit names an unknown destination network; ignoring");
                return Ok(None);
            }
        };

        let record = DepositRecord {
            source_chain: ChainTag::Evm,
            tx_id: format!("{tx_hash:?}"),
            intra_index,
            token_id,
            amount: amount.to_string(),
            sender: None,
            receiver,
            dest_chain,
            status: DepositStatus::Pending,
            signature: None,
        };

        if let Err(e) = record.validate() {
            warn!(tx_hash = %format!("{tx_hash:?}"), error = %e, "Rejecting malformed deposit event");
            return Ok(None);
        }

        Ok(Some(record))
    }
}

fn parse_tx_hash(tx_id: &str) -> Result<B256> {
    B256::from_str(tx_id).map_err(|e| eyre!("invalid EVM tx id {tx_id:?}: {e}"))
}
