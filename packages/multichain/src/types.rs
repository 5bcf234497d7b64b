use std::fmt;

use alloy::primitives::U256;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

use crate::address;

/// Tag identifying one of the two bridged chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainTag {
    Evm,
    Asset,
}

impl ChainTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainTag::Evm => "evm",
            ChainTag::Asset => "asset",
        }
    }

    /// Parse a chain tag from its wire form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "evm" => Ok(ChainTag::Evm),
            "asset" => Ok(ChainTag::Asset),
            other => Err(eyre!("unknown chain tag: {other}")),
        }
    }

    /// The chain deposits from this chain withdraw on.
    pub fn opposite(&self) -> Self {
        match self {
            ChainTag::Evm => ChainTag::Asset,
            ChainTag::Asset => ChainTag::Evm,
        }
    }
}

impl fmt::Display for ChainTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deposit lifecycle status.
///
/// `finalized` is absorbing: no transition leaves it, not even a stale
/// reset back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Processing,
    Signed,
    Finalized,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Processing => "processing",
            DepositStatus::Signed => "signed",
            DepositStatus::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "processing" => Ok(DepositStatus::Processing),
            "signed" => Ok(DepositStatus::Signed),
            "finalized" => Ok(DepositStatus::Finalized),
            other => Err(eyre!("unknown deposit status: {other}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Finalized)
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Globally unique identifier of a deposit: the source chain, the source
/// transaction id and the index of the bridge event within that transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositId {
    pub source_chain: ChainTag,
    pub tx_id: String,
    pub intra_index: u32,
}

impl DepositId {
    pub fn new(source_chain: ChainTag, tx_id: impl Into<String>, intra_index: u32) -> Self {
        Self {
            source_chain,
            tx_id: tx_id.into(),
            intra_index,
        }
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source_chain, self.tx_id, self.intra_index)
    }
}

/// Canonical unit of work: one confirmed deposit event on a source chain,
/// to be consummated by a withdrawal on the destination chain.
///
/// Amounts are carried as decimal strings end to end; they are 256-bit
/// quantities and must never pass through floats or 64-bit integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub source_chain: ChainTag,
    pub tx_id: String,
    pub intra_index: u32,
    /// Token identifier on the source chain; `None` for the native asset.
    pub token_id: Option<String>,
    /// Decimal string, up to 256 bits.
    pub amount: String,
    pub sender: Option<String>,
    /// Receiver address on the destination chain, in that chain's format.
    pub receiver: String,
    pub dest_chain: ChainTag,
    pub status: DepositStatus,
    /// Collected signature, once signing completed. Opaque hex.
    pub signature: Option<String>,
}

impl DepositRecord {
    pub fn id(&self) -> DepositId {
        DepositId::new(self.source_chain, self.tx_id.clone(), self.intra_index)
    }

    /// Validate the claim-bearing fields: a parseable 256-bit amount and a
    /// receiver matching the destination chain's address format.
    pub fn validate(&self) -> Result<()> {
        parse_amount(&self.amount)?;
        if !address::is_valid_for(self.dest_chain, &self.receiver) {
            return Err(eyre!(
                "receiver {} is not a valid {} address",
                self.receiver,
                self.dest_chain
            ));
        }
        if self.source_chain == self.dest_chain {
            return Err(eyre!("source and destination chain are both {}", self.source_chain));
        }
        Ok(())
    }

    /// Compare the claim-bearing fields of another record against this one.
    /// Identity fields are assumed equal; status and signature are ignored.
    pub fn claims_match(&self, other: &DepositRecord) -> bool {
        self.amount == other.amount
            && self.receiver == other.receiver
            && self.token_id == other.token_id
            && self.dest_chain == other.dest_chain
    }
}

/// Parse a decimal amount string into a 256-bit integer.
pub fn parse_amount(s: &str) -> Result<U256> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(eyre!("amount is not a decimal string: {s:?}"));
    }
    U256::from_str_radix(s, 10).map_err(|e| eyre!("amount overflows 256 bits: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DepositRecord {
        DepositRecord {
            source_chain: ChainTag::Asset,
            tx_id: "ab".repeat(32),
            intra_index: 0,
            token_id: Some("cd".repeat(32)),
            amount: "5000000000000".to_string(),
            sender: None,
            receiver: format!("0x{}", "f3".repeat(20)),
            dest_chain: ChainTag::Evm,
            status: DepositStatus::Pending,
            signature: None,
        }
    }

    #[test]
    fn chain_tag_roundtrip() {
        assert_eq!(ChainTag::parse("evm").unwrap(), ChainTag::Evm);
        assert_eq!(ChainTag::parse("asset").unwrap(), ChainTag::Asset);
        assert!(ChainTag::parse("solana").is_err());
        assert_eq!(ChainTag::Evm.opposite(), ChainTag::Asset);
        assert_eq!(ChainTag::Asset.opposite(), ChainTag::Evm);
    }

    #[test]
    fn status_roundtrip() {
        for s in ["pending", "processing", "signed", "finalized"] {
            assert_eq!(DepositStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(DepositStatus::parse("confirmed").is_err());
        assert!(DepositStatus::Finalized.is_terminal());
        assert!(!DepositStatus::Signed.is_terminal());
    }

    #[test]
    fn amount_parsing() {
        assert!(parse_amount("0").is_ok());
        assert!(parse_amount("10000000000000").is_ok());
        // 2^256 - 1 is the largest representable amount
        let max = U256::MAX.to_string();
        assert!(parse_amount(&max).is_ok());
        assert!(parse_amount("").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("1.5").is_err());
        assert!(parse_amount("0x10").is_err());
    }

    #[test]
    fn validate_accepts_well_formed_record() {
        assert!(record().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_receiver() {
        let mut r = record();
        r.receiver = "not-an-address".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn validate_rejects_same_chain_routing() {
        let mut r = record();
        r.source_chain = ChainTag::Evm;
        assert!(r.validate().is_err());
    }

    #[test]
    fn claims_match_ignores_status_and_signature() {
        let a = record();
        let mut b = record();
        b.status = DepositStatus::Signed;
        b.signature = Some("feed".to_string());
        assert!(a.claims_match(&b));
    }

    #[test]
    fn claims_match_detects_amount_mismatch() {
        let a = record();
        let mut b = record();
        b.amount = "1000000000000000".to_string();
        assert!(!a.claims_match(&b));
    }
}
