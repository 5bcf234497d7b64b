//! Session timing and deterministic elections.
//!
//! Sessions are derived from wall-clock time: `epoch = floor(now_ms /
//! interval_ms)`, session id `SIGN_{destChain}_{epoch}`. Nothing is
//! persisted or coordinated; every party reconstructs the same values from
//! its own clock, and the consensus layer's ±1-epoch window absorbs NTP
//! drift. The leader and the signer set are both pure functions of the
//! session id, so any party can verify another's claim to either role.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use multichain::ChainTag;
use sha2::{Digest, Sha256};

/// Current epoch for the given session interval.
pub fn epoch_now(interval_ms: u64) -> u64 {
    now_ms() / interval_ms
}

/// Milliseconds until the next epoch boundary.
pub fn until_next_epoch(interval_ms: u64) -> Duration {
    let now = now_ms();
    let next = (now / interval_ms + 1) * interval_ms;
    Duration::from_millis(next - now)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

/// Session identifier: `SIGN_{destChain}_{epoch}`.
pub fn session_id(dest_chain: ChainTag, epoch: u64) -> String {
    format!("SIGN_{}_{}", dest_chain, epoch)
}

/// Extract the epoch counter from a session id, if well formed.
pub fn epoch_of(session_id: &str) -> Option<u64> {
    session_id.rsplit_once('_')?.1.parse().ok()
}

/// The ±1 acceptance window around an epoch, in ascending epoch order.
pub fn session_window(dest_chain: ChainTag, epoch: u64) -> Vec<String> {
    let mut window = Vec::with_capacity(3);
    if let Some(prev) = epoch.checked_sub(1) {
        window.push(session_id(dest_chain, prev));
    }
    window.push(session_id(dest_chain, epoch));
    window.push(session_id(dest_chain, epoch + 1));
    window
}

/// Elected leader for a session:
/// `u32_be(sha256(session_id)[0..4]) mod total_parties`.
pub fn leader_for(session_id: &str, total_parties: u16) -> u16 {
    let digest = Sha256::digest(session_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % total_parties as u32) as u16
}

/// Deterministic signer-set selection: sort the accepting parties by
/// `sha256(session_id || ":signers" || id_hex)` ascending, take
/// `threshold − 1` of them, then append the proposer.
pub fn select_signers(
    session_id: &str,
    proposer: u16,
    acceptors: &[u16],
    threshold: u16,
) -> Vec<u16> {
    let mut ranked: Vec<u16> = acceptors.to_vec();
    ranked.sort();
    ranked.dedup();
    ranked.retain(|id| *id != proposer);
    ranked.sort_by_key(|id| {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update(b":signers");
        hasher.update(hex::encode(id.to_be_bytes()).as_bytes());
        let digest = hasher.finalize();
        <[u8; 32]>::from(digest)
    });

    let mut signers: Vec<u16> = ranked
        .into_iter()
        .take(threshold.saturating_sub(1) as usize)
        .collect();
    signers.push(proposer);
    signers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_format() {
        assert_eq!(session_id(ChainTag::Evm, 42), "SIGN_evm_42");
        assert_eq!(session_id(ChainTag::Asset, 0), "SIGN_asset_0");
    }

    #[test]
    fn epoch_of_roundtrips() {
        assert_eq!(epoch_of("SIGN_evm_42"), Some(42));
        assert_eq!(epoch_of("SIGN_asset_0"), Some(0));
        assert_eq!(epoch_of("garbage"), None);
    }

    #[test]
    fn window_spans_three_epochs() {
        assert_eq!(
            session_window(ChainTag::Evm, 10),
            vec!["SIGN_evm_9", "SIGN_evm_10", "SIGN_evm_11"]
        );
        // Epoch 0 has no predecessor.
        assert_eq!(
            session_window(ChainTag::Evm, 0),
            vec!["SIGN_evm_0", "SIGN_evm_1"]
        );
    }

    #[test]
    fn leader_is_deterministic() {
        // Property: three independent evaluations agree, for many sessions.
        for epoch in 0..1000u64 {
            let id = session_id(ChainTag::Evm, epoch);
            let a = leader_for(&id, 3);
            let b = leader_for(&id, 3);
            let c = leader_for(&id, 3);
            assert_eq!(a, b);
            assert_eq!(b, c);
            assert!(a < 3);
        }
    }

    #[test]
    fn leadership_rotates_across_epochs() {
        let leaders: std::collections::HashSet<u16> = (0..100u64)
            .map(|e| leader_for(&session_id(ChainTag::Evm, e), 3))
            .collect();
        // All three parties get elected somewhere in 100 epochs.
        assert_eq!(leaders.len(), 3);
    }

    #[test]
    fn signer_selection_is_deterministic() {
        for epoch in 0..200u64 {
            let id = session_id(ChainTag::Asset, epoch);
            let a = select_signers(&id, 1, &[0, 2], 2);
            let b = select_signers(&id, 1, &[2, 0], 2);
            assert_eq!(a, b, "order of acceptors must not matter");
            assert_eq!(a.len(), 2);
            assert_eq!(*a.last().unwrap(), 1, "proposer is always appended");
            assert!(a[0] == 0 || a[0] == 2);
        }
    }

    #[test]
    fn signer_selection_output_is_a_subset_of_candidates() {
        let id = session_id(ChainTag::Evm, 7);
        let signers = select_signers(&id, 0, &[1, 2], 2);
        for s in &signers {
            assert!(*s <= 2);
        }
        assert_eq!(signers.len(), 2);
    }

    #[test]
    fn signer_selection_caps_at_available_candidates() {
        let id = session_id(ChainTag::Evm, 3);
        // Only one acceptor available for a threshold of 3.
        let signers = select_signers(&id, 0, &[1], 3);
        assert_eq!(signers, vec![1, 0]);
    }

    #[test]
    fn signer_selection_ignores_duplicate_and_proposer_entries() {
        let id = session_id(ChainTag::Evm, 9);
        let signers = select_signers(&id, 1, &[0, 0, 1, 2, 2], 2);
        assert_eq!(signers.len(), 2);
        assert_eq!(*signers.last().unwrap(), 1);
        assert_ne!(signers[0], 1);
    }

    #[test]
    fn epoch_math_is_monotonic() {
        let interval = 30_000;
        let a = epoch_now(interval);
        let b = epoch_now(interval);
        assert!(b >= a);
        assert!(until_next_epoch(interval) <= Duration::from_millis(interval));
    }
}
