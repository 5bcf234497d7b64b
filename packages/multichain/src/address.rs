//! Destination-address format validation.
//!
//! Receivers are carried as strings in deposit events and re-validated by
//! every party before they enter a sign-hash: hex-40 for the EVM chain,
//! base58-ish opaque strings for the asset chain.

use crate::types::ChainTag;

/// Base58 alphabet (Bitcoin variant, no `0`, `O`, `I`, `l`).
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Check a receiver string against the address format of the given chain.
pub fn is_valid_for(chain: ChainTag, addr: &str) -> bool {
    match chain {
        ChainTag::Evm => is_hex40(addr),
        ChainTag::Asset => is_base58ish(addr),
    }
}

/// A 0x-prefixed 40-hex-digit EVM address.
pub fn is_hex40(addr: &str) -> bool {
    let Some(hex_part) = addr.strip_prefix("0x") else {
        return false;
    };
    hex_part.len() == 40 && hex_part.bytes().all(|b| b.is_ascii_hexdigit())
}

/// An asset-chain account string: opaque, base58 alphabet only. The exact
/// length depends on the address flavor (standard, integrated, auditable),
/// so only alphabet membership and a sane length band are enforced.
pub fn is_base58ish(addr: &str) -> bool {
    (16..=128).contains(&addr.len()) && addr.chars().all(|c| BASE58_ALPHABET.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex40_accepts_checksummed_and_lowercase() {
        assert!(is_hex40("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(is_hex40("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
    }

    #[test]
    fn hex40_rejects_wrong_shape() {
        assert!(!is_hex40("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_hex40("0xdead"));
        assert!(!is_hex40("0xZZZZd6e51aad88F6F4ce6aB8827279cffFb92266"));
        assert!(!is_hex40(""));
    }

    #[test]
    fn base58ish_accepts_asset_account() {
        assert!(is_base58ish(
            "ZxDNaMeZjwCjnHuU5gUNyrP1pM3U5vPbBBVY9gGrgsk5QD8NKhRCSLC8gqBNtvMA7bsgTopHt1qxEnmUoJtvmJJH2szQ5j2x"
        ));
    }

    #[test]
    fn base58ish_rejects_forbidden_chars_and_lengths() {
        assert!(!is_base58ish("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")); // 0 and x
        assert!(!is_base58ish("short"));
        assert!(!is_base58ish(""));
        assert!(!is_base58ish(&"A".repeat(200)));
        assert!(!is_base58ish("contains spaces and l0ts of invalid chars"));
    }

    #[test]
    fn validity_is_chain_specific() {
        let evm = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
        assert!(is_valid_for(ChainTag::Evm, evm));
        assert!(!is_valid_for(ChainTag::Asset, evm));
    }
}
