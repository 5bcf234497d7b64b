//! CLI surface: key generation, the validator loop, and the two deposit
//! helpers used to exercise a deployment end to end.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use multichain::asset::rpc::ServiceEntry;
use multichain::asset::AssetWalletClient;
use multichain::evm::contracts::Bridge;
use multichain::asset::observer::{DEPOSIT_INSTRUCTION, DEPOSIT_SERVICE_ID};
use multichain::{parse_amount, ChainTag};
use tracing::info;

use crate::bus::{server, MessageBus};
use crate::config::Config;
use crate::tss::keygen::run_keygen;

/// How long DKG may take end to end, including Paillier prime generation
/// on the slowest party.
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Parser)]
#[command(name = "tss-validator", about = "Federated TSS bridge validator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run distributed key generation against the other parties, persist
    /// the keyshare and print the group address.
    Keygen,
    /// Run the long-lived validator loop.
    Party,
    /// Helper: submit a deposit on the EVM chain.
    DepositEvm {
        /// Amount in base units (decimal string).
        #[arg(long)]
        amount: String,
        /// Receiver address on the asset chain.
        #[arg(long)]
        receiver: String,
        /// Deposit the native coin instead of the configured token.
        #[arg(long, default_value_t = false)]
        native: bool,
    },
    /// Helper: submit a burn deposit on the asset chain.
    DepositAsset {
        /// Amount in base units (decimal string).
        #[arg(long)]
        amount: String,
        /// Receiver address on the EVM chain (0x hex).
        #[arg(long)]
        receiver: String,
    },
}

/// Run DKG and persist the resulting keyshare.
pub async fn keygen(config: Config) -> Result<()> {
    let bus = Arc::new(MessageBus::new(
        config.party.party_id,
        config.party.total_parties,
        &config.bus,
    )?);

    let listen_port = config.bus.base_port + config.party.party_id;
    let server_bus = bus.clone();
    tokio::spawn(async move {
        if let Err(e) = server::start_server(server_bus, listen_port).await {
            tracing::error!(error = %e, "Bus server error");
        }
    });

    let keyshare = run_keygen(
        bus,
        config.party.party_id,
        config.party.total_parties,
        config.party.threshold,
        KEYGEN_TIMEOUT,
    )
    .await?;

    let path = config.keyshare_path();
    keyshare.save(&path)?;
    info!(path = %path.display(), "Keyshare persisted");
    println!("group address: {}", keyshare.group_address);
    Ok(())
}

/// Submit a test deposit on the EVM chain.
pub async fn deposit_evm(
    config: Config,
    amount: &str,
    receiver: &str,
    native: bool,
) -> Result<()> {
    if !multichain::address::is_valid_for(ChainTag::Asset, receiver) {
        return Err(eyre!("receiver {receiver:?} is not a valid asset-chain address"));
    }
    let amount = parse_amount(amount)?;

    let signer: PrivateKeySigner = config
        .evm
        .private_key
        .parse()
        .wrap_err("Invalid EVM private key")?;
    let provider = ProviderBuilder::new()
        .with_recommended_fillers()
        .wallet(EthereumWallet::from(signer))
        .on_http(config.evm.rpc_url.parse().wrap_err("Invalid EVM RPC URL")?);
    let bridge = Bridge::new(
        Address::from_str(&config.evm.bridge_address).wrap_err("Invalid bridge address")?,
        provider,
    );

    let pending = if native {
        bridge
            .depositNative(receiver.to_string())
            .value(amount)
            .send()
            .await
            .wrap_err("depositNative failed")?
    } else {
        let token =
            Address::from_str(&config.evm.token_address).wrap_err("Invalid token address")?;
        bridge
            .depositERC20(token, amount, receiver.to_string(), false)
            .send()
            .await
            .wrap_err("depositERC20 failed")?
    };
    let tx_hash = pending.watch().await.wrap_err("deposit not confirmed")?;
    println!("deposit tx: {tx_hash:?}");
    Ok(())
}

/// Submit a test burn deposit on the asset chain.
pub async fn deposit_asset(config: Config, amount: &str, receiver: &str) -> Result<()> {
    if !multichain::address::is_valid_for(ChainTag::Evm, receiver) {
        return Err(eyre!("receiver {receiver:?} is not a valid EVM address"));
    }
    parse_amount(amount)?;

    let wallet = AssetWalletClient::new(&config.asset.wallet_rpc_url)?;
    let memo = serde_json::json!({
        "dst_add": receiver,
        "dst_net_id": ChainTag::Evm.as_str(),
        "amt": amount,
        "asset_id": config.asset.asset_id,
    });
    let entry = ServiceEntry {
        service_id: DEPOSIT_SERVICE_ID.to_string(),
        instruction: DEPOSIT_INSTRUCTION.to_string(),
        body: hex::encode(serde_json::to_vec(&memo)?),
        flags: 0,
    };

    let result = wallet
        .burn_asset(&config.asset.asset_id, amount, &[entry])
        .await
        .wrap_err("burn_asset failed")?;
    println!(
        "burn tx: {}",
        result
            .get("tx_id")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
    );
    Ok(())
}
