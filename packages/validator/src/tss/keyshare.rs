//! Keyshare persistence.
//!
//! DKG produces an incomplete key share plus auxiliary info; both are kept
//! serialized on disk and recombined into a usable key share freshly for
//! every signing session. The group public key, and hence the EVM-style
//! group address, is derivable by every party from its own share.

use std::fs;
use std::path::Path;

use alloy::primitives::keccak256;
use cggmp24::security_level::SecurityLevel128;
use cggmp24::supported_curves::Secp256k1;
use eyre::{eyre, Result, WrapErr};
use generic_ec::Point;
use serde::{Deserialize, Serialize};

/// Serialized keyshare file contents, one per party.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredKeyshare {
    pub party_id: u16,
    pub total_parties: u16,
    pub threshold: u16,
    /// Serialized `IncompleteKeyShare`.
    pub core_share: serde_json::Value,
    /// Serialized `AuxInfo`.
    pub aux_info: serde_json::Value,
    /// EVM-style address of the group public key, 0x hex.
    pub group_address: String,
}

impl StoredKeyshare {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).wrap_err("Failed to create keyshare directory")?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).wrap_err_with(|| format!("Failed to write keyshare {path:?}"))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).wrap_err_with(|| {
            format!("Failed to read keyshare {path:?} (run `keygen` first?)")
        })?;
        serde_json::from_slice(&raw).wrap_err("Keyshare file is malformed")
    }

    /// Recombine the serialized parts into a live key share. Called at the
    /// start of every signing session; shares are never kept hot in memory.
    pub fn to_key_share(&self) -> Result<cggmp24::KeyShare<Secp256k1, SecurityLevel128>> {
        let core: cggmp24::IncompleteKeyShare<Secp256k1> =
            serde_json::from_value(self.core_share.clone())
                .map_err(|e| eyre!("failed to deserialize core share: {e}"))?;
        let aux: cggmp24::key_share::AuxInfo<SecurityLevel128> =
            serde_json::from_value(self.aux_info.clone())
                .map_err(|e| eyre!("failed to deserialize aux info: {e}"))?;
        cggmp24::KeyShare::from_parts((core, aux))
            .map_err(|e| eyre!("failed to combine key share: {e}"))
    }
}

/// EVM-style address of a secp256k1 public key: the last 20 bytes of the
/// keccak256 of the uncompressed point without its 0x04 tag.
pub fn eth_address_of(point: &Point<Secp256k1>) -> Result<String> {
    let uncompressed = point.to_bytes(false);
    let bytes = uncompressed.as_ref();
    if bytes.len() != 65 || bytes[0] != 0x04 {
        return Err(eyre!("unexpected public key encoding ({} bytes)", bytes.len()));
    }
    let digest = keccak256(&bytes[1..]);
    Ok(format!("0x{}", hex::encode(&digest[12..])))
}

/// Address equality as the chain sees it: byte equality, case-insensitive
/// over the hex digits.
pub fn address_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
