//! Local state store.
//!
//! One sqlite file per party, WAL journal. Holds the deposit lifecycle
//! rows and the per-chain poll cursors. All mutations are single-row
//! atomic updates; the `finalized` status is absorbing and enforced in the
//! UPDATE predicates themselves, never in read-then-write sequences.

use std::path::Path;
use std::str::FromStr;

use eyre::{Result, WrapErr};
use multichain::{ChainTag, DepositId, DepositRecord, DepositStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

pub mod models;

pub use models::DepositRow;

const DEPOSIT_SELECT: &str = "id, source_chain, tx_id, intra_index, token_id, amount, sender, \
     receiver, dest_chain, status, signature, created_at, updated_at";

/// Open (creating if missing) this party's store file.
pub async fn create_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).wrap_err("Failed to create data directory")?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .wrap_err("Failed to open state store")
}

/// In-memory store for tests.
#[cfg(test)]
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .wrap_err("Failed to parse in-memory sqlite URL")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .wrap_err("Failed to open in-memory store")
}

/// Run pending migrations (from `migrations/`).
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run store migrations")?;
    Ok(())
}

/// Insert a deposit if its identifying triple is new; otherwise a no-op.
/// Safe under repeated observation of the same event. Returns whether a
/// row was inserted.
pub async fn upsert_deposit(pool: &SqlitePool, record: &DepositRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO deposits (source_chain, tx_id, intra_index, token_id, amount,
            sender, receiver, dest_chain, status, signature)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (source_chain, tx_id, intra_index) DO NOTHING
        "#,
    )
    .bind(record.source_chain.as_str())
    .bind(&record.tx_id)
    .bind(record.intra_index as i64)
    .bind(&record.token_id)
    .bind(&record.amount)
    .bind(&record.sender)
    .bind(&record.receiver)
    .bind(record.dest_chain.as_str())
    .bind(record.status.as_str())
    .bind(&record.signature)
    .execute(pool)
    .await
    .wrap_err("Failed to upsert deposit")?;

    Ok(result.rows_affected() > 0)
}

/// The next deposit to work on for a destination chain: the oldest
/// `pending` row, or failing that a `signed` row older than
/// `stale_signed_secs`: a row whose finalization broadcast never arrived
/// (arrival would have transitioned it to `finalized`).
pub async fn pending_for(
    pool: &SqlitePool,
    dest_chain: ChainTag,
    stale_signed_secs: i64,
) -> Result<Option<DepositRecord>> {
    let query = format!(
        r#"SELECT {DEPOSIT_SELECT} FROM deposits
           WHERE dest_chain = ?
             AND (status = 'pending'
                  OR (status = 'signed'
                      AND updated_at < strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-' || ? || ' seconds')))
           ORDER BY CASE status WHEN 'pending' THEN 0 ELSE 1 END, created_at ASC, id ASC
           LIMIT 1"#
    );
    let row = sqlx::query_as::<_, DepositRow>(&query)
        .bind(dest_chain.as_str())
        .bind(stale_signed_secs)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to query next pending deposit")?;

    row.map(DepositRow::into_record).transpose()
}

/// Look up a deposit by its identifying triple.
pub async fn lookup(pool: &SqlitePool, id: &DepositId) -> Result<Option<DepositRecord>> {
    let query = format!(
        "SELECT {DEPOSIT_SELECT} FROM deposits \
         WHERE source_chain = ? AND tx_id = ? AND intra_index = ?"
    );
    let row = sqlx::query_as::<_, DepositRow>(&query)
        .bind(id.source_chain.as_str())
        .bind(&id.tx_id)
        .bind(id.intra_index as i64)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to look up deposit")?;

    row.map(DepositRow::into_record).transpose()
}

/// Transition a deposit's status, optionally recording a signature.
///
/// Refuses any transition when the row is already `finalized`; returns
/// whether the update applied. A single conditional UPDATE keeps the
/// terminal state absorbing even under concurrent callers.
pub async fn status_update(
    pool: &SqlitePool,
    id: &DepositId,
    new_status: DepositStatus,
    signature: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE deposits
        SET status = ?,
            signature = COALESCE(?, signature),
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE source_chain = ? AND tx_id = ? AND intra_index = ?
          AND status != 'finalized'
        "#,
    )
    .bind(new_status.as_str())
    .bind(signature)
    .bind(id.source_chain.as_str())
    .bind(&id.tx_id)
    .bind(id.intra_index as i64)
    .execute(pool)
    .await
    .wrap_err("Failed to update deposit status")?;

    let applied = result.rows_affected() > 0;
    if !applied {
        debug!(deposit = %id, status = %new_status, "Status update refused (row finalized or missing)");
    }
    Ok(applied)
}

/// Reset a deposit back to `pending`, but only if it is still in
/// `expected`. Used by a timed-out proposer so a concurrent `signed`
/// transition from the winning session is never downgraded.
pub async fn reset_if_status(
    pool: &SqlitePool,
    id: &DepositId,
    expected: DepositStatus,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE deposits
        SET status = 'pending', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE source_chain = ? AND tx_id = ? AND intra_index = ?
          AND status = ?
        "#,
    )
    .bind(id.source_chain.as_str())
    .bind(&id.tx_id)
    .bind(id.intra_index as i64)
    .bind(expected.as_str())
    .execute(pool)
    .await
    .wrap_err("Failed to reset deposit")?;

    Ok(result.rows_affected() > 0)
}

/// Last fully scanned height for a chain.
pub async fn get_cursor(pool: &SqlitePool, chain: ChainTag) -> Result<Option<u64>> {
    let row: Option<(i64,)> =
        sqlx::query_as(r#"SELECT last_height FROM cursors WHERE chain = ?"#)
            .bind(chain.as_str())
            .fetch_optional(pool)
            .await
            .wrap_err("Failed to get poll cursor")?;
    Ok(row.map(|r| r.0 as u64))
}

/// Advance a chain's poll cursor.
pub async fn set_cursor(pool: &SqlitePool, chain: ChainTag, height: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cursors (chain, last_height)
        VALUES (?, ?)
        ON CONFLICT (chain) DO UPDATE SET
            last_height = excluded.last_height,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .bind(chain.as_str())
    .bind(height as i64)
    .execute(pool)
    .await
    .wrap_err("Failed to set poll cursor")?;
    Ok(())
}

/// Count rows in a given status (metrics/status surface).
pub async fn count_status(pool: &SqlitePool, status: DepositStatus) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM deposits WHERE status = ?"#)
        .bind(status.as_str())
        .fetch_one(pool)
        .await
        .wrap_err("Failed to count deposits")?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn record(tx: &str, dest: ChainTag) -> DepositRecord {
        DepositRecord {
            source_chain: dest.opposite(),
            tx_id: tx.to_string(),
            intra_index: 0,
            token_id: None,
            amount: "10000000000000".to_string(),
            sender: None,
            receiver: match dest {
                ChainTag::Evm => format!("0x{}", "f3".repeat(20)),
                ChainTag::Asset => "Zx".to_string() + &"D".repeat(95),
            },
            dest_chain: dest,
            status: DepositStatus::Pending,
            signature: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let pool = test_pool().await;
        let r = record("0xaaa", ChainTag::Asset);

        assert!(upsert_deposit(&pool, &r).await.unwrap());
        assert!(!upsert_deposit(&pool, &r).await.unwrap());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM deposits")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn second_observation_does_not_clobber_status() {
        let pool = test_pool().await;
        let r = record("0xbbb", ChainTag::Asset);
        upsert_deposit(&pool, &r).await.unwrap();
        status_update(&pool, &r.id(), DepositStatus::Signed, Some("cafe"))
            .await
            .unwrap();

        // Re-observation of the same event must not reset the row.
        upsert_deposit(&pool, &r).await.unwrap();
        let row = lookup(&pool, &r.id()).await.unwrap().unwrap();
        assert_eq!(row.status, DepositStatus::Signed);
        assert_eq!(row.signature.as_deref(), Some("cafe"));
    }

    #[tokio::test]
    async fn finalized_is_absorbing() {
        let pool = test_pool().await;
        let r = record("0xccc", ChainTag::Evm);
        upsert_deposit(&pool, &r).await.unwrap();

        assert!(status_update(&pool, &r.id(), DepositStatus::Finalized, None)
            .await
            .unwrap());
        // No transition out, not even a stale reset to pending.
        assert!(!status_update(&pool, &r.id(), DepositStatus::Pending, None)
            .await
            .unwrap());
        assert!(!status_update(&pool, &r.id(), DepositStatus::Signed, None)
            .await
            .unwrap());
        assert!(!reset_if_status(&pool, &r.id(), DepositStatus::Processing)
            .await
            .unwrap());

        let row = lookup(&pool, &r.id()).await.unwrap().unwrap();
        assert_eq!(row.status, DepositStatus::Finalized);
    }

    #[tokio::test]
    async fn pending_for_returns_oldest_pending_first() {
        let pool = test_pool().await;
        upsert_deposit(&pool, &record("0x111", ChainTag::Asset))
            .await
            .unwrap();
        upsert_deposit(&pool, &record("0x222", ChainTag::Asset))
            .await
            .unwrap();

        let next = pending_for(&pool, ChainTag::Asset, 60).await.unwrap().unwrap();
        assert_eq!(next.tx_id, "0x111");
    }

    #[tokio::test]
    async fn pending_for_is_scoped_to_destination() {
        let pool = test_pool().await;
        upsert_deposit(&pool, &record("0x333", ChainTag::Asset))
            .await
            .unwrap();

        assert!(pending_for(&pool, ChainTag::Evm, 60).await.unwrap().is_none());
        assert!(pending_for(&pool, ChainTag::Asset, 60).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fresh_signed_rows_are_not_reoffered() {
        let pool = test_pool().await;
        let r = record("0x444", ChainTag::Asset);
        upsert_deposit(&pool, &r).await.unwrap();
        status_update(&pool, &r.id(), DepositStatus::Signed, None)
            .await
            .unwrap();

        // Just signed: not eligible under a 60 s staleness threshold.
        assert!(pending_for(&pool, ChainTag::Asset, 60).await.unwrap().is_none());
        // With a zero threshold the stuck row is re-offered.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let stale = pending_for(&pool, ChainTag::Asset, 0).await.unwrap();
        assert_eq!(stale.unwrap().tx_id, "0x444");
    }

    #[tokio::test]
    async fn reset_only_applies_from_expected_status() {
        let pool = test_pool().await;
        let r = record("0x555", ChainTag::Evm);
        upsert_deposit(&pool, &r).await.unwrap();
        status_update(&pool, &r.id(), DepositStatus::Processing, None)
            .await
            .unwrap();

        assert!(reset_if_status(&pool, &r.id(), DepositStatus::Processing)
            .await
            .unwrap());
        // Already pending now; a second loser's reset is a no-op.
        assert!(!reset_if_status(&pool, &r.id(), DepositStatus::Processing)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cursor_roundtrip() {
        let pool = test_pool().await;
        assert!(get_cursor(&pool, ChainTag::Evm).await.unwrap().is_none());
        set_cursor(&pool, ChainTag::Evm, 1234).await.unwrap();
        set_cursor(&pool, ChainTag::Evm, 1300).await.unwrap();
        assert_eq!(get_cursor(&pool, ChainTag::Evm).await.unwrap(), Some(1300));
        assert!(get_cursor(&pool, ChainTag::Asset).await.unwrap().is_none());
    }
}
