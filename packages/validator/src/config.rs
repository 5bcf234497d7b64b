use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result, WrapErr};

/// Main configuration for a validator party.
#[derive(Debug, Clone)]
pub struct Config {
    pub party: PartyConfig,
    pub bus: BusConfig,
    pub evm: EvmConfig,
    pub asset: AssetConfig,
    pub timing: TimingConfig,
    /// Asset-chain asset id → EVM token address, applied before an
    /// asset-origin deposit enters an EVM sign-hash.
    pub token_map: HashMap<String, String>,
    /// Directory holding the state store and keyshare files.
    pub data_dir: PathBuf,
}

/// Identity of this party within the cohort.
#[derive(Debug, Clone)]
pub struct PartyConfig {
    pub party_id: u16,
    pub total_parties: u16,
    pub threshold: u16,
}

/// Party-to-party message bus configuration.
#[derive(Clone)]
pub struct BusConfig {
    /// Host per party id; this party listens on `base_port + party_id`.
    pub peer_hosts: Vec<String>,
    pub base_port: u16,
    pub shared_secret: String,
}

/// Custom Debug that redacts the shared secret.
impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("peer_hosts", &self.peer_hosts)
            .field("base_port", &self.base_port)
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

/// EVM chain configuration.
#[derive(Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub bridge_address: String,
    pub token_address: String,
    pub chain_id: u64,
    pub required_confirmations: u64,
    /// Key funding finalization submissions; not a bridge signer.
    pub private_key: String,
}

/// Custom Debug that redacts the private key.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url)
            .field("bridge_address", &self.bridge_address)
            .field("token_address", &self.token_address)
            .field("chain_id", &self.chain_id)
            .field("required_confirmations", &self.required_confirmations)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Asset-chain configuration.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub daemon_rpc_url: String,
    pub wallet_rpc_url: String,
    pub asset_id: String,
    pub required_confirmations: u64,
}

/// Session and protocol timing.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub session_interval_ms: u64,
    pub consensus_timeout_ms: u64,
    pub signing_timeout_ms: u64,
}

fn default_evm_confirmations() -> u64 {
    64
}

fn default_asset_confirmations() -> u64 {
    10
}

fn default_session_interval_ms() -> u64 {
    30_000
}

fn default_consensus_timeout_ms() -> u64 {
    10_000
}

fn default_signing_timeout_ms() -> u64 {
    20_000
}

impl Config {
    /// Load configuration: `.env` if present, then the environment.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("Failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let party = PartyConfig {
            party_id: required_parsed("PARTY_ID")?,
            total_parties: required_parsed("TOTAL_PARTIES")?,
            threshold: required_parsed("THRESHOLD")?,
        };

        if party.party_id >= party.total_parties {
            return Err(eyre!(
                "PARTY_ID {} out of range for TOTAL_PARTIES {}",
                party.party_id,
                party.total_parties
            ));
        }
        if party.threshold < 2 || party.threshold > party.total_parties {
            return Err(eyre!(
                "THRESHOLD {} must lie in [2, TOTAL_PARTIES]",
                party.threshold
            ));
        }

        let peer_hosts: Vec<String> = required("PEER_HOSTS")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if peer_hosts.len() != party.total_parties as usize {
            return Err(eyre!(
                "PEER_HOSTS names {} hosts but TOTAL_PARTIES is {}",
                peer_hosts.len(),
                party.total_parties
            ));
        }

        let bus = BusConfig {
            peer_hosts,
            base_port: required_parsed("BUS_BASE_PORT")?,
            shared_secret: required("BUS_SHARED_SECRET")?,
        };

        let evm = EvmConfig {
            rpc_url: required("EVM_RPC_URL")?,
            bridge_address: required("EVM_BRIDGE_ADDRESS")?,
            token_address: required("EVM_TOKEN_ADDRESS")?,
            chain_id: required_parsed("EVM_CHAIN_ID")?,
            required_confirmations: optional_parsed("EVM_CONFIRMATIONS")?
                .unwrap_or_else(default_evm_confirmations),
            private_key: required("EVM_PRIVATE_KEY")?,
        };

        let asset = AssetConfig {
            daemon_rpc_url: required("ASSET_DAEMON_RPC_URL")?,
            wallet_rpc_url: required("ASSET_WALLET_RPC_URL")?,
            asset_id: required("ASSET_ID")?,
            required_confirmations: optional_parsed("ASSET_CONFIRMATIONS")?
                .unwrap_or_else(default_asset_confirmations),
        };

        let timing = TimingConfig {
            session_interval_ms: optional_parsed("SESSION_INTERVAL_MS")?
                .unwrap_or_else(default_session_interval_ms),
            consensus_timeout_ms: optional_parsed("CONSENSUS_TIMEOUT_MS")?
                .unwrap_or_else(default_consensus_timeout_ms),
            signing_timeout_ms: optional_parsed("SIGNING_TIMEOUT_MS")?
                .unwrap_or_else(default_signing_timeout_ms),
        };

        let token_map = parse_token_map(&env::var("TOKEN_MAP").unwrap_or_default())?;

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        Ok(Config {
            party,
            bus,
            evm,
            asset,
            timing,
            token_map,
            data_dir,
        })
    }

    /// Path of this party's state store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("party{}.db", self.party.party_id))
    }

    /// Path of this party's keyshare file.
    pub fn keyshare_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("keyshare{}.json", self.party.party_id))
    }
}

/// Parse `asset_id=0xToken,asset_id2=0xToken2` into a map.
fn parse_token_map(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (asset, token) = pair
            .split_once('=')
            .ok_or_else(|| eyre!("TOKEN_MAP entry {pair:?} is not asset_id=token"))?;
        map.insert(asset.trim().to_string(), token.trim().to_string());
    }
    Ok(map)
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{key} environment variable is required"))
}

fn required_parsed<T: std::str::FromStr>(key: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    required(key)?
        .parse()
        .map_err(|e| eyre!("{key} is malformed: {e}"))
}

fn optional_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{key} is malformed: {e}")),
        Err(_) => Ok(None),
    }
}
