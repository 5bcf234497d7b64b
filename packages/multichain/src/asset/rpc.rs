//! Asset-chain JSON-RPC clients.
//!
//! The asset chain exposes two JSON-RPC 2.0 endpoints: the wallet (asset
//! emission, burns, transfers, external-signature submission, transaction
//! search) and the daemon (height, transaction decryption). Both speak the
//! same envelope; responses carry either `result` or `error`.

use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Shared JSON-RPC plumbing.
#[derive(Clone)]
struct JsonRpc {
    url: String,
    client: Client,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl JsonRpc {
    fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to create HTTP client")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": method,
            "params": params,
        });

        debug!(method, url = %self.url, "Asset-chain RPC call");

        let response = self
            .client
            .post(format!("{}/json_rpc", self.url))
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("Asset-chain RPC {method} request failed"))?;

        if !response.status().is_success() {
            return Err(eyre!(
                "Asset-chain RPC {method} failed: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }

        let envelope: RpcEnvelope<T> = response
            .json()
            .await
            .wrap_err_with(|| format!("Malformed asset-chain RPC {method} response"))?;

        if let Some(err) = envelope.error {
            return Err(eyre!(
                "Asset-chain RPC {method} error {}: {}",
                err.code,
                err.message
            ));
        }
        envelope
            .result
            .ok_or_else(|| eyre!("Asset-chain RPC {method} returned neither result nor error"))
    }
}

// ============================================================================
// Wallet RPC
// ============================================================================

/// Response of `emit_asset`: the unsigned-emit transaction triple. The
/// `tx_id` is the exact 32-byte digest the threshold signature covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedEmit {
    pub tx_id: String,
    pub unsigned_tx: String,
    pub finalized_tx: String,
}

/// One service entry attached to an asset-chain transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service_id: String,
    pub instruction: String,
    /// Hex-encoded body; deposit memos carry JSON here.
    pub body: String,
    #[serde(default)]
    pub flags: u64,
}

/// A wallet-visible transfer returned by `search_for_transactions`.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletTransfer {
    pub tx_hash: String,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub is_income: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchResult {
    #[serde(default, rename = "in")]
    pub incoming: Vec<WalletTransfer>,
    #[serde(default, rename = "out")]
    pub outgoing: Vec<WalletTransfer>,
}

#[derive(Debug, Deserialize)]
pub struct TxSubmitResult {
    pub status: String,
}

/// Asset-chain wallet RPC client.
#[derive(Clone)]
pub struct AssetWalletClient {
    rpc: JsonRpc,
}

impl AssetWalletClient {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpc::new(url)?,
        })
    }

    /// Create the unsigned emission that releases `amount` of `asset_id` to
    /// `destination`. The returned `tx_id` is signed externally and the
    /// blobs are replayed through [`send_ext_signed_asset_tx`].
    ///
    /// [`send_ext_signed_asset_tx`]: Self::send_ext_signed_asset_tx
    pub async fn emit_asset(
        &self,
        asset_id: &str,
        destination: &str,
        amount: &str,
    ) -> Result<UnsignedEmit> {
        self.rpc
            .call(
                "emit_asset",
                json!({
                    "asset_id": asset_id,
                    "destinations": [{
                        "address": destination,
                        "amount": amount,
                        "asset_id": asset_id,
                    }],
                    "do_not_split_destinations": true,
                }),
            )
            .await
    }

    /// Submit an externally signed emission. `signature` is the 64-byte
    /// `r||s` hex with no recovery byte.
    pub async fn send_ext_signed_asset_tx(
        &self,
        signature: &str,
        expected_tx_id: &str,
        unsigned_tx: &str,
        finalized_tx: &str,
    ) -> Result<TxSubmitResult> {
        self.rpc
            .call(
                "send_ext_signed_asset_tx",
                json!({
                    "eth_sig": signature,
                    "expected_tx_id": expected_tx_id,
                    "unsigned_tx": unsigned_tx,
                    "finalized_tx": finalized_tx,
                    "unlock_transfers_on_fail": true,
                }),
            )
            .await
    }

    /// Search wallet transfers, either by transaction id or by height range.
    pub async fn search_for_transactions(
        &self,
        tx_id: Option<&str>,
        min_height: u64,
        max_height: u64,
    ) -> Result<SearchResult> {
        let mut params = json!({
            "in": true,
            "out": true,
            "pool": false,
            "filter_by_height": tx_id.is_none(),
            "min_height": min_height,
            "max_height": max_height,
        });
        if let Some(id) = tx_id {
            params["tx_id"] = json!(id);
        }
        self.rpc.call("search_for_transactions", params).await
    }

    /// Burn `amount` of `asset_id`, attaching the given service entries.
    pub async fn burn_asset(
        &self,
        asset_id: &str,
        amount: &str,
        service_entries: &[ServiceEntry],
    ) -> Result<serde_json::Value> {
        self.rpc
            .call(
                "burn_asset",
                json!({
                    "asset_id": asset_id,
                    "burn_amount": amount,
                    "service_entries": service_entries,
                }),
            )
            .await
    }

    /// Plain transfer carrying an embedded burn plus service entries, the
    /// second accepted deposit shape.
    pub async fn transfer_with_burn(
        &self,
        asset_id_to_burn: &str,
        amount_to_burn: &str,
        service_entries: &[ServiceEntry],
    ) -> Result<serde_json::Value> {
        self.rpc
            .call(
                "transfer",
                json!({
                    "destinations": [],
                    "asset_id_to_burn": asset_id_to_burn,
                    "amount_to_burn": amount_to_burn,
                    "service_entries": service_entries,
                }),
            )
            .await
    }

    /// Hand asset ownership to another public key (used once at setup to
    /// point the asset at the group key).
    pub async fn transfer_asset_ownership(
        &self,
        asset_id: &str,
        new_owner_eth_pub_key: &str,
    ) -> Result<serde_json::Value> {
        self.rpc
            .call(
                "transfer_asset_ownership",
                json!({
                    "asset_id": asset_id,
                    "new_owner_eth_pub_key": new_owner_eth_pub_key,
                }),
            )
            .await
    }
}

// ============================================================================
// Daemon RPC
// ============================================================================

/// Asset operation attached to a transaction (the primary-operation burn
/// shape carries the burned asset and amount here).
#[derive(Debug, Clone, Deserialize)]
pub struct AssetOperation {
    pub operation_type: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    /// Burn amount for the transfer-with-burn shape.
    #[serde(default)]
    pub amount_to_burn: Option<String>,
    #[serde(default)]
    pub asset_id_to_burn: Option<String>,
}

/// Decrypted transaction details returned by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct TxDetails {
    pub tx_id: String,
    /// Height of the including block; `None` while in the pool.
    #[serde(default)]
    pub keeper_block: Option<u64>,
    #[serde(default)]
    pub asset_operations: Vec<AssetOperation>,
    #[serde(default)]
    pub service_entries: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct HeightResult {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct DecryptResult {
    tx: TxDetails,
}

/// Asset-chain daemon RPC client.
#[derive(Clone)]
pub struct AssetDaemonClient {
    rpc: JsonRpc,
}

impl AssetDaemonClient {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpc::new(url)?,
        })
    }

    /// Current chain height.
    pub async fn get_height(&self) -> Result<u64> {
        let result: HeightResult = self.rpc.call("get_height", json!({})).await?;
        Ok(result.height)
    }

    /// Decrypt and decode a transaction's details, including asset
    /// operations and attached service entries.
    pub async fn decrypt_tx_details(&self, tx_id: &str) -> Result<TxDetails> {
        let result: DecryptResult = self
            .rpc
            .call("decrypt_tx_details", json!({ "tx_id": tx_id }))
            .await?;
        Ok(result.tx)
    }
}
