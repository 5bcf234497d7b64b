//! Distributed signing and signature encoding.
//!
//! Exactly `threshold` parties run the signing protocol over a 32-byte
//! digest and produce a plain ECDSA `(r, s)` under the group key. The
//! recovery byte the EVM contract needs is not part of the protocol
//! output; it is reconstructed by trial address recovery against the known
//! group address.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::keccak256;
use cggmp24::signing::PrehashedDataToSign;
use cggmp24::supported_curves::Secp256k1;
use cggmp24::ExecutionId;
use eyre::{eyre, Result, WrapErr};
use generic_ec::Scalar;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use rand::rngs::OsRng;
use tracing::info;

use crate::bus::{msg_type, MessageBus};
use crate::tss::keyshare::{address_eq, StoredKeyshare};
use crate::tss::{drive, BusTransport};

/// A completed threshold signature: 32-byte big-endian `r` and `s`.
#[derive(Debug, Clone)]
pub struct RawSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl RawSignature {
    /// 64-byte `r||s` hex, the asset-chain form. No recovery byte.
    pub fn to_asset_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.r);
        bytes.extend_from_slice(&self.s);
        hex::encode(bytes)
    }

    /// 65-byte `r||s||v` hex, the EVM form. `v` is found by trial
    /// recovery of the EVM address under `digest`; it must land on the
    /// group address or the signature is rejected outright.
    pub fn to_evm_hex(&self, digest: &[u8; 32], group_address: &str) -> Result<String> {
        let v = self.recover_v(digest, group_address)?;
        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&self.r);
        bytes.extend_from_slice(&self.s);
        bytes.push(v);
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    /// Determine `v ∈ {27, 28}` by recovering an address for each recovery
    /// id and comparing against the group address.
    pub fn recover_v(&self, digest: &[u8; 32], group_address: &str) -> Result<u8> {
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&self.r);
        rs[32..].copy_from_slice(&self.s);
        let signature =
            Signature::from_slice(&rs).map_err(|e| eyre!("signature scalars invalid: {e}"))?;

        for rec_id in 0u8..=1 {
            let recovery_id =
                RecoveryId::try_from(rec_id).map_err(|e| eyre!("recovery id: {e}"))?;
            let Ok(verifying_key) =
                VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            else {
                continue;
            };
            if address_eq(&address_of_key(&verifying_key), group_address) {
                return Ok(27 + rec_id);
            }
        }
        Err(eyre!(
            "signature does not recover to group address {group_address}"
        ))
    }
}

/// EVM-style address of a verifying key.
fn address_of_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Run one two-party signing session over `digest`.
///
/// `signers` are the wire ids of both participants in ascending order; the
/// keyshare is reloaded from its serialized form for this session only.
pub async fn run_signing(
    bus: Arc<MessageBus>,
    stored: &StoredKeyshare,
    digest: [u8; 32],
    signers: &[u16],
    session_id: &str,
    timeout: Duration,
) -> Result<RawSignature> {
    let my_id = bus.party_id();
    let my_position = signers
        .iter()
        .position(|id| *id == my_id)
        .ok_or_else(|| eyre!("party {my_id} is not in the signer set {signers:?}"))?
        as u16;

    let key_share = stored.to_key_share()?;
    let data = PrehashedDataToSign::from_scalar(Scalar::<Secp256k1>::from_be_bytes_mod_order(
        &digest,
    ));

    info!(session = session_id, ?signers, "Starting signing session");

    let eid_bytes = session_id.as_bytes().to_vec();
    let eid = ExecutionId::new(&eid_bytes);
    let mut rng = OsRng;

    // The protocol speaks 0-based positions within the signer set; wire
    // messages carry the original party ids.
    let sm = cggmp24::signing(eid, my_position, signers, &key_share)
        .enforce_reliable_broadcast(true)
        .sign_sync(&mut rng, &data);

    let transport = BusTransport::new(&bus, msg_type::TSS_SIGN, session_id, timeout);
    let signature = drive(sm, &transport, my_position, signers)
        .await
        .wrap_err("signing rounds failed")?;

    // Low-s normalization: the EVM chain rejects malleable signatures.
    let signature = signature.normalize_s();
    let mut bytes = vec![0u8; cggmp24::signing::Signature::<Secp256k1>::serialized_len()];
    signature.write_to_slice(&mut bytes);

    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..64]);

    info!(session = session_id, "Signing session complete");
    Ok(RawSignature { r, s })
}
