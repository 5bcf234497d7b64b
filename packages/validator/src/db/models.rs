#![allow(dead_code)]

use chrono::{DateTime, Utc};
use eyre::Result;
use multichain::{ChainTag, DepositRecord, DepositStatus};
use sqlx::FromRow;

/// Raw deposit row as stored. Statuses and chain tags are lowercase text;
/// amounts are decimal strings.
#[derive(Debug, Clone, FromRow)]
pub struct DepositRow {
    pub id: i64,
    pub source_chain: String,
    pub tx_id: String,
    pub intra_index: i64,
    pub token_id: Option<String>,
    pub amount: String,
    pub sender: Option<String>,
    pub receiver: String,
    pub dest_chain: String,
    pub status: String,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DepositRow {
    pub fn into_record(self) -> Result<DepositRecord> {
        Ok(DepositRecord {
            source_chain: ChainTag::parse(&self.source_chain)?,
            tx_id: self.tx_id,
            intra_index: self.intra_index as u32,
            token_id: self.token_id,
            amount: self.amount,
            sender: self.sender,
            receiver: self.receiver,
            dest_chain: ChainTag::parse(&self.dest_chain)?,
            status: DepositStatus::parse(&self.status)?,
            signature: self.signature,
        })
    }
}
