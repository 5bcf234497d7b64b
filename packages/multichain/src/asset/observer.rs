//! Asset-chain deposit observer.
//!
//! Deposits on the asset chain are burn transactions. Two shapes are
//! accepted: a primary-operation burn (`operation_type = "burn"` with asset
//! id and amount attached), and a transfer carrying `asset_id_to_burn` /
//! `amount_to_burn`. In both shapes the transaction must carry a service
//! entry with `service_id = "X"` and `instruction = "D"` whose body is
//! hex-encoded JSON `{dst_add, dst_net_id, amt, asset_id}`.

use eyre::{eyre, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::address;
use crate::asset::rpc::{AssetDaemonClient, AssetWalletClient, ServiceEntry, TxDetails};
use crate::types::{ChainTag, DepositRecord, DepositStatus};

/// Service entry marker for bridge deposits.
pub const DEPOSIT_SERVICE_ID: &str = "X";
/// Instruction marker for bridge deposits.
pub const DEPOSIT_INSTRUCTION: &str = "D";

/// The decoded deposit memo carried in the service-entry body.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositMemo {
    pub dst_add: String,
    pub dst_net_id: String,
    pub amt: String,
    pub asset_id: String,
}

impl DepositMemo {
    /// Decode a hex-encoded JSON service-entry body.
    pub fn decode(body_hex: &str) -> Result<Self> {
        let raw = hex::decode(body_hex).map_err(|e| eyre!("memo body is not hex: {e}"))?;
        serde_json::from_slice(&raw).map_err(|e| eyre!("memo body is not deposit JSON: {e}"))
    }
}

/// Observer over the asset chain's burn transactions.
pub struct AssetObserver {
    daemon: AssetDaemonClient,
    wallet: AssetWalletClient,
    /// The single asset this bridge instance carries.
    asset_id: String,
    required_confirmations: u64,
}

impl AssetObserver {
    pub fn new(
        daemon: AssetDaemonClient,
        wallet: AssetWalletClient,
        asset_id: &str,
        required_confirmations: u64,
    ) -> Self {
        Self {
            daemon,
            wallet,
            asset_id: asset_id.to_string(),
            required_confirmations,
        }
    }

    /// Highest height considered visible: `head − required_confirmations`.
    pub async fn confirmed_head(&self) -> Result<u64> {
        let height = self.daemon.get_height().await?;
        Ok(height.saturating_sub(self.required_confirmations))
    }

    /// Extract all bridge burns in `[from_height, to_height]`. Idempotent
    /// under re-scan; the caller owns the cursor and the store upsert.
    pub async fn scan_range(&self, from_height: u64, to_height: u64) -> Result<Vec<DepositRecord>> {
        let search = self
            .wallet
            .search_for_transactions(None, from_height, to_height)
            .await?;

        let mut deposits = Vec::new();
        for transfer in search.incoming.iter().chain(search.outgoing.iter()) {
            let details = match self.daemon.decrypt_tx_details(&transfer.tx_hash).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(tx_id = %transfer.tx_hash, error = %e, "Failed to decrypt asset-chain tx");
                    continue;
                }
            };
            match extract_deposit(&details, &self.asset_id) {
                Ok(Some(record)) => deposits.push(record),
                Ok(None) => {}
                Err(e) => {
                    debug!(tx_id = %transfer.tx_hash, error = %e, "Rejecting malformed burn");
                }
            }
        }

        Ok(deposits)
    }

    /// True only if the transaction exists, is a well-formed bridge burn at
    /// the claimed index, and is buried `required_confirmations` deep.
    pub async fn verify(&self, tx_id: &str, intra_index: u32) -> Result<bool> {
        Ok(self.fetch_canonical(tx_id, intra_index).await?.is_some())
    }

    /// Reconstruct the deposit record entirely from on-chain data,
    /// independent of any external claim about its contents.
    pub async fn fetch_canonical(
        &self,
        tx_id: &str,
        intra_index: u32,
    ) -> Result<Option<DepositRecord>> {
        // Burn transactions carry exactly one deposit.
        if intra_index != 0 {
            return Ok(None);
        }

        let search = self
            .wallet
            .search_for_transactions(Some(tx_id), 0, 0)
            .await?;
        let found = search
            .incoming
            .iter()
            .chain(search.outgoing.iter())
            .any(|t| t.tx_hash == tx_id);
        if !found {
            debug!(tx_id, "Transaction not found on asset chain");
            return Ok(None);
        }

        let details = self.daemon.decrypt_tx_details(tx_id).await?;

        let Some(height) = details.keeper_block else {
            debug!(tx_id, "Transaction still in the pool");
            return Ok(None);
        };
        let confirmed_head = self.confirmed_head().await?;
        if height > confirmed_head {
            debug!(
                tx_id,
                height, confirmed_head, "Burn still inside the confirmation zone"
            );
            return Ok(None);
        }

        match extract_deposit(&details, &self.asset_id) {
            Ok(record) => Ok(record),
            Err(e) => {
                debug!(tx_id, error = %e, "Rejecting malformed burn");
                Ok(None)
            }
        }
    }
}

/// Find the deposit service entry on a transaction, if any.
fn deposit_entry(entries: &[ServiceEntry]) -> Option<&ServiceEntry> {
    entries
        .iter()
        .find(|e| e.service_id == DEPOSIT_SERVICE_ID && e.instruction == DEPOSIT_INSTRUCTION)
}

/// Decode a decrypted transaction into a deposit record.
///
/// Returns `Ok(None)` when the transaction carries no deposit service entry
/// at all; `Err` when it carries one that fails validation (wrong network,
/// bad receiver, asset mismatch, burned amount disagreeing with the memo).
pub fn extract_deposit(details: &TxDetails, configured_asset: &str) -> Result<Option<DepositRecord>> {
    let Some(entry) = deposit_entry(&details.service_entries) else {
        return Ok(None);
    };

    let memo = DepositMemo::decode(&entry.body)?;

    let dest_chain = ChainTag::parse(&memo.dst_net_id)
        .map_err(|_| eyre!("unexpected dst_net_id {:?}", memo.dst_net_id))?;
    if dest_chain != ChainTag::Evm {
        return Err(eyre!("dst_net_id {:?} is not the EVM destination", memo.dst_net_id));
    }
    if !address::is_valid_for(dest_chain, &memo.dst_add) {
        return Err(eyre!("dst_add {:?} is not a valid {dest_chain} address", memo.dst_add));
    }
    if memo.asset_id != configured_asset {
        return Err(eyre!("memo names unconfigured asset {}", memo.asset_id));
    }

    // Shape (a): primary-operation burn carries asset id and amount on the
    // operation itself. Shape (b): transfer-with-burn carries them in the
    // `*_to_burn` fields; the memo is authoritative for the amount.
    let burned = details.asset_operations.iter().find_map(|op| {
        if op.operation_type.eq_ignore_ascii_case("burn") {
            match (&op.asset_id, &op.amount) {
                (Some(asset), Some(amount)) => Some((asset.clone(), amount.clone())),
                _ => None,
            }
        } else {
            match (&op.asset_id_to_burn, &op.amount_to_burn) {
                (Some(asset), Some(amount)) => Some((asset.clone(), amount.clone())),
                _ => None,
            }
        }
    });

    let Some((burned_asset, burned_amount)) = burned else {
        return Err(eyre!("deposit memo present but no burn operation found"));
    };
    if burned_asset != configured_asset {
        return Err(eyre!("burn names unconfigured asset {burned_asset}"));
    }
    if burned_amount != memo.amt {
        return Err(eyre!(
            "burned amount {burned_amount} disagrees with memo amount {}",
            memo.amt
        ));
    }

    let record = DepositRecord {
        source_chain: ChainTag::Asset,
        tx_id: details.tx_id.clone(),
        intra_index: 0,
        token_id: Some(memo.asset_id),
        amount: memo.amt,
        sender: None,
        receiver: memo.dst_add,
        dest_chain,
        status: DepositStatus::Pending,
        signature: None,
    };
    record.validate()?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSET: &str = "cdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcdcd";
    const RECEIVER: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn memo_body(dst_add: &str, dst_net_id: &str, amt: &str, asset_id: &str) -> String {
        let json = serde_json::json!({
            "dst_add": dst_add,
            "dst_net_id": dst_net_id,
            "amt": amt,
            "asset_id": asset_id,
        });
        hex::encode(serde_json::to_vec(&json).unwrap())
    }

    fn burn_details(amount: &str) -> TxDetails {
        serde_json::from_value(serde_json::json!({
            "tx_id": "ef".repeat(32),
            "keeper_block": 1000,
            "asset_operations": [{
                "operation_type": "burn",
                "asset_id": ASSET,
                "amount": amount,
            }],
            "service_entries": [{
                "service_id": DEPOSIT_SERVICE_ID,
                "instruction": DEPOSIT_INSTRUCTION,
                "body": memo_body(RECEIVER, "evm", amount, ASSET),
            }],
        }))
        .unwrap()
    }

    #[test]
    fn primary_burn_shape_extracts() {
        let record = extract_deposit(&burn_details("5000000000000"), ASSET)
            .unwrap()
            .expect("deposit");
        assert_eq!(record.source_chain, ChainTag::Asset);
        assert_eq!(record.dest_chain, ChainTag::Evm);
        assert_eq!(record.amount, "5000000000000");
        assert_eq!(record.receiver, RECEIVER);
        assert_eq!(record.intra_index, 0);
        assert_eq!(record.token_id.as_deref(), Some(ASSET));
    }

    #[test]
    fn transfer_with_burn_shape_extracts() {
        let details: TxDetails = serde_json::from_value(serde_json::json!({
            "tx_id": "ab".repeat(32),
            "keeper_block": 1000,
            "asset_operations": [{
                "operation_type": "transfer",
                "asset_id_to_burn": ASSET,
                "amount_to_burn": "777",
            }],
            "service_entries": [{
                "service_id": DEPOSIT_SERVICE_ID,
                "instruction": DEPOSIT_INSTRUCTION,
                "body": memo_body(RECEIVER, "evm", "777", ASSET),
            }],
        }))
        .unwrap();

        let record = extract_deposit(&details, ASSET).unwrap().expect("deposit");
        assert_eq!(record.amount, "777");
    }

    #[test]
    fn transaction_without_service_entry_is_not_a_deposit() {
        let mut details = burn_details("100");
        details.service_entries.clear();
        assert!(extract_deposit(&details, ASSET).unwrap().is_none());
    }

    #[test]
    fn wrong_network_is_rejected() {
        let mut details = burn_details("100");
        details.service_entries[0].body = memo_body(RECEIVER, "asset", "100", ASSET);
        assert!(extract_deposit(&details, ASSET).is_err());
    }

    #[test]
    fn bad_receiver_format_is_rejected() {
        let mut details = burn_details("100");
        details.service_entries[0].body = memo_body("not-an-evm-address", "evm", "100", ASSET);
        assert!(extract_deposit(&details, ASSET).is_err());
    }

    #[test]
    fn unconfigured_asset_is_rejected() {
        let other = "ab".repeat(32);
        let mut details = burn_details("100");
        details.service_entries[0].body = memo_body(RECEIVER, "evm", "100", &other);
        assert!(extract_deposit(&details, ASSET).is_err());
    }

    #[test]
    fn burn_amount_must_match_memo() {
        let mut details = burn_details("100");
        details.asset_operations[0] = serde_json::from_value(serde_json::json!({
            "operation_type": "burn",
            "asset_id": ASSET,
            "amount": "999",
        }))
        .unwrap();
        assert!(extract_deposit(&details, ASSET).is_err());
    }

    #[test]
    fn memo_with_no_burn_is_rejected() {
        let mut details = burn_details("100");
        details.asset_operations.clear();
        assert!(extract_deposit(&details, ASSET).is_err());
    }

    #[test]
    fn undecodable_memo_is_rejected() {
        let mut details = burn_details("100");
        details.service_entries[0].body = "zz-not-hex".to_string();
        assert!(extract_deposit(&details, ASSET).is_err());

        details.service_entries[0].body = hex::encode(b"not json");
        assert!(extract_deposit(&details, ASSET).is_err());
    }

    #[test]
    fn memo_decode_roundtrip() {
        let memo = DepositMemo::decode(&memo_body(RECEIVER, "evm", "5000000000000", ASSET)).unwrap();
        assert_eq!(memo.dst_add, RECEIVER);
        assert_eq!(memo.dst_net_id, "evm");
        assert_eq!(memo.amt, "5000000000000");
        assert_eq!(memo.asset_id, ASSET);
    }
}
