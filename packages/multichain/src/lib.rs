//! Shared chain library for the TSS bridge validator.
//!
//! Contains everything both the validator loop and the CLI helpers need to
//! talk to the two bridged chains: the canonical deposit data model, address
//! format validation, EVM bridge contract bindings plus the EVM observer and
//! sign-hash encodings, and the asset-chain wallet/daemon RPC clients plus
//! the asset-chain observer.

pub mod address;
pub mod asset;
pub mod evm;
pub mod types;

pub use types::{parse_amount, ChainTag, DepositId, DepositRecord, DepositStatus};
