//! Distributed key generation.
//!
//! Two protocol phases over the full party set: the threshold keygen
//! producing each party's incomplete key share, then auxiliary-info
//! generation over pregenerated Paillier primes. Both run as synchronous
//! state machines driven over the bus. At the end each party persists its
//! keyshare and every party derives the same group address.

use std::sync::Arc;
use std::time::Duration;

use cggmp24::security_level::SecurityLevel128;
use cggmp24::supported_curves::Secp256k1;
use cggmp24::ExecutionId;
use eyre::{eyre, Result, WrapErr};
use rand::rngs::OsRng;
use round_based::state_machine::wrap_protocol;
use tracing::info;

use crate::bus::{msg_type, MessageBus};
use crate::tss::keyshare::{eth_address_of, StoredKeyshare};
use crate::tss::{drive, BusTransport};

/// Domain separators for the two DKG phases. Also used as bus session ids
/// so round traffic of the phases cannot interleave.
const KEYGEN_EID: &[u8] = b"tss-bridge-keygen-v1";
const AUX_EID: &[u8] = b"tss-bridge-aux-v1";

/// Run DKG against the other parties and return the persistable keyshare.
pub async fn run_keygen(
    bus: Arc<MessageBus>,
    party_id: u16,
    total_parties: u16,
    threshold: u16,
    timeout: Duration,
) -> Result<StoredKeyshare> {
    // Protocol positions coincide with wire party ids for DKG: the whole
    // cohort participates in id order.
    let parties: Vec<u16> = (0..total_parties).collect();

    info!(party_id, total_parties, threshold, "Starting distributed key generation");

    // Phase 1: threshold keygen.
    let core_share = {
        let eid = ExecutionId::new(KEYGEN_EID);
        let mut rng = OsRng;
        let sm = wrap_protocol(|party| {
            cggmp24::keygen::<Secp256k1>(eid, party_id, total_parties)
                .set_threshold(threshold)
                .enforce_reliable_broadcast(true)
                .start(&mut rng, party)
        });
        let transport = BusTransport::new(&bus, msg_type::TSS_KEYGEN, "DKG_core", timeout);
        drive(sm, &transport, party_id, &parties)
            .await
            .wrap_err("keygen phase failed")?
    };

    info!(party_id, "Key share established; generating auxiliary info");

    // Paillier prime generation is CPU-bound and slow; keep it off the
    // async workers.
    let primes = tokio::task::spawn_blocking(|| {
        let mut rng = OsRng;
        cggmp24::PregeneratedPrimes::<SecurityLevel128>::generate(&mut rng)
    })
    .await
    .map_err(|e| eyre!("prime generation task failed: {e}"))?;

    // Phase 2: auxiliary info generation.
    let aux_info = {
        let eid = ExecutionId::new(AUX_EID);
        let mut rng = OsRng;
        let sm = wrap_protocol(|party| {
            cggmp24::aux_info_gen(eid, party_id, total_parties, primes)
                .enforce_reliable_broadcast(true)
                .start(&mut rng, party)
        });
        let transport = BusTransport::new(&bus, msg_type::TSS_KEYGEN, "DKG_aux", timeout);
        drive(sm, &transport, party_id, &parties)
            .await
            .wrap_err("aux info phase failed")?
    };

    let group_address = eth_address_of(&core_share.shared_public_key)?;
    info!(party_id, group_address, "Distributed key generation complete");

    Ok(StoredKeyshare {
        party_id,
        total_parties,
        threshold,
        core_share: serde_json::to_value(&core_share)
            .wrap_err("failed to serialize core share")?,
        aux_info: serde_json::to_value(&aux_info).wrap_err("failed to serialize aux info")?,
        group_address,
    })
}
