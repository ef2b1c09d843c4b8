//! SQLite-backed message store
//!
//! Every query is scoped to the chain id the store was created for. The
//! same statements run against the pool or inside a [`TxOrm`] transaction.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, QueryBuilder, Row, Transaction};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::models::{Msg, MsgState, MsgStats};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

const MSG_COLUMNS: &str =
    "id, cosmos_chain_id, contract_id, type, raw, state, tx_hash, created_at, updated_at";

/// Message store for one chain
#[derive(Clone)]
pub struct MsgOrm {
    chain_id: String,
    pool: SqlitePool,
}

impl MsgOrm {
    /// Open a pool for the configured database, creating the file if needed
    pub async fn connect(config: &DatabaseConfig, chain_id: impl Into<String>) -> RelayerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool, chain_id))
    }

    pub fn new(pool: SqlitePool, chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            pool,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Create the message table, its constraints and indexes
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cosmos_msgs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cosmos_chain_id TEXT NOT NULL,
                contract_id TEXT NOT NULL,
                type TEXT NOT NULL,
                raw BLOB NOT NULL,
                state TEXT NOT NULL CHECK (
                    state IN ('unstarted', 'started', 'broadcasted', 'confirmed', 'errored')
                ),
                tx_hash TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((state IN ('broadcasted', 'confirmed')) = (tx_hash IS NOT NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cosmos_msgs_chain_state
            ON cosmos_msgs (cosmos_chain_id, state, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS cosmos_msgs_state_transition
            BEFORE UPDATE OF state ON cosmos_msgs
            FOR EACH ROW
            WHEN NOT (
                (OLD.state = 'unstarted' AND NEW.state IN ('started', 'errored'))
                OR (OLD.state = 'started' AND NEW.state IN ('broadcasted', 'errored'))
                OR (OLD.state = 'broadcasted' AND NEW.state IN ('confirmed', 'errored'))
            )
            BEGIN
                SELECT RAISE(ABORT, 'invalid msg state transition');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Message store migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Store a new message as unstarted, returning its id
    pub async fn insert_msg(&self, contract_id: &str, type_url: &str, raw: &[u8]) -> RelayerResult<i64> {
        insert_msg(&self.pool, &self.chain_id, contract_id, type_url, raw).await
    }

    /// Oldest `limit` messages in `state`
    pub async fn get_msgs_state(&self, state: MsgState, limit: i64) -> RelayerResult<Vec<Msg>> {
        get_msgs_state(&self.pool, &self.chain_id, state, limit).await
    }

    pub async fn get_msgs(&self, ids: &[i64]) -> RelayerResult<Vec<Msg>> {
        get_msgs(&self.pool, &self.chain_id, ids).await
    }

    /// Move every id to `state`. Broadcasted requires a tx hash.
    pub async fn update_msgs(
        &self,
        ids: &[i64],
        state: MsgState,
        tx_hash: Option<&str>,
    ) -> RelayerResult<()> {
        update_msgs(&self.pool, &self.chain_id, ids, state, tx_hash).await
    }

    /// Move all of a contract's messages from one state to another,
    /// returning how many rows changed
    pub async fn update_msgs_contract(
        &self,
        contract_id: &str,
        from: MsgState,
        to: MsgState,
    ) -> RelayerResult<u64> {
        if to == MsgState::Broadcasted {
            return Err(RelayerError::MissingTxHash);
        }
        if !from.can_transition_to(to) {
            return Err(RelayerError::Internal(format!(
                "invalid msg state transition from {} to {}",
                from, to
            )));
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE cosmos_msgs SET state = ");
        qb.push_bind(to.as_str());
        qb.push(", updated_at = ");
        qb.push_bind(Utc::now());
        if !to.has_tx_hash() {
            qb.push(", tx_hash = NULL");
        }
        qb.push(" WHERE cosmos_chain_id = ");
        qb.push_bind(self.chain_id.as_str());
        qb.push(" AND contract_id = ");
        qb.push_bind(contract_id);
        qb.push(" AND state = ");
        qb.push_bind(from.as_str());

        let result = qb.build().execute(&self.pool).await?;
        debug!(
            "Moved {} msgs of contract {} from {} to {}",
            result.rows_affected(),
            contract_id,
            from,
            to
        );
        Ok(result.rows_affected())
    }

    /// Row counts per state for this chain
    pub async fn stats(&self) -> RelayerResult<MsgStats> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n
            FROM cosmos_msgs
            WHERE cosmos_chain_id = ?
            GROUP BY state
            "#,
        )
        .bind(&self.chain_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = MsgStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = row.try_get::<i64, _>("n")? as u64;
            match state.parse::<MsgState>()? {
                MsgState::Unstarted => stats.unstarted = n,
                MsgState::Started => stats.started = n,
                MsgState::Broadcasted => stats.broadcasted = n,
                MsgState::Confirmed => stats.confirmed = n,
                MsgState::Errored => stats.errored = n,
            }
        }
        Ok(stats)
    }

    /// Run `f` inside a database transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err`. A panic inside
    /// `f` rolls back and then resumes unwinding.
    pub async fn transaction<T, F>(&self, f: F) -> RelayerResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxOrm) -> BoxFuture<'c, RelayerResult<T>> + Send,
    {
        let tx = self.pool.begin().await?;
        let mut orm = TxOrm {
            chain_id: self.chain_id.clone(),
            tx,
        };

        let outcome = AssertUnwindSafe(f(&mut orm)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => {
                orm.tx.commit().await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                if let Err(rollback_err) = orm.tx.rollback().await {
                    warn!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(rollback_err) = orm.tx.rollback().await {
                    warn!("Failed to roll back transaction after panic: {}", rollback_err);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Message store bound to an open database transaction
pub struct TxOrm {
    chain_id: String,
    tx: Transaction<'static, Sqlite>,
}

impl TxOrm {
    pub async fn insert_msg(&mut self, contract_id: &str, type_url: &str, raw: &[u8]) -> RelayerResult<i64> {
        insert_msg(&mut *self.tx, &self.chain_id, contract_id, type_url, raw).await
    }

    pub async fn get_msgs_state(&mut self, state: MsgState, limit: i64) -> RelayerResult<Vec<Msg>> {
        get_msgs_state(&mut *self.tx, &self.chain_id, state, limit).await
    }

    pub async fn get_msgs(&mut self, ids: &[i64]) -> RelayerResult<Vec<Msg>> {
        get_msgs(&mut *self.tx, &self.chain_id, ids).await
    }

    pub async fn update_msgs(
        &mut self,
        ids: &[i64],
        state: MsgState,
        tx_hash: Option<&str>,
    ) -> RelayerResult<()> {
        update_msgs(&mut *self.tx, &self.chain_id, ids, state, tx_hash).await
    }
}

async fn insert_msg<'e, E>(
    executor: E,
    chain_id: &str,
    contract_id: &str,
    type_url: &str,
    raw: &[u8],
) -> RelayerResult<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO cosmos_msgs
            (cosmos_chain_id, contract_id, type, raw, state, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'unstarted', ?, ?)
        "#,
    )
    .bind(chain_id)
    .bind(contract_id)
    .bind(type_url)
    .bind(raw)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn get_msgs_state<'e, E>(
    executor: E,
    chain_id: &str,
    state: MsgState,
    limit: i64,
) -> RelayerResult<Vec<Msg>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if limit < 1 {
        return Err(RelayerError::InvalidLimit);
    }

    let sql = format!(
        "SELECT {} FROM cosmos_msgs WHERE cosmos_chain_id = ? AND state = ? ORDER BY id ASC LIMIT ?",
        MSG_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(chain_id)
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(executor)
        .await?;

    rows.iter().map(msg_from_row).collect()
}

async fn get_msgs<'e, E>(executor: E, chain_id: &str, ids: &[i64]) -> RelayerResult<Vec<Msg>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM cosmos_msgs WHERE cosmos_chain_id = ",
        MSG_COLUMNS
    ));
    qb.push_bind(chain_id);
    qb.push(" AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY id ASC");

    let rows = qb.build().fetch_all(executor).await?;
    rows.iter().map(msg_from_row).collect()
}

async fn update_msgs<'e, E>(
    executor: E,
    chain_id: &str,
    ids: &[i64],
    state: MsgState,
    tx_hash: Option<&str>,
) -> RelayerResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    if state == MsgState::Broadcasted && tx_hash.is_none() {
        return Err(RelayerError::MissingTxHash);
    }
    if ids.is_empty() {
        return Ok(());
    }

    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE cosmos_msgs SET state = ");
    qb.push_bind(state.as_str());
    qb.push(", updated_at = ");
    qb.push_bind(Utc::now());
    match state {
        MsgState::Broadcasted => {
            qb.push(", tx_hash = ");
            qb.push_bind(tx_hash);
        }
        // keeps the hash it was broadcast with
        MsgState::Confirmed => {}
        _ => {
            qb.push(", tx_hash = NULL");
        }
    }
    qb.push(" WHERE cosmos_chain_id = ");
    qb.push_bind(chain_id);
    qb.push(" AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    let result = qb.build().execute(executor).await?;
    if result.rows_affected() != ids.len() as u64 {
        return Err(RelayerError::RowCountMismatch {
            expected: ids.len(),
            got: result.rows_affected(),
        });
    }

    Ok(())
}

fn msg_from_row(row: &SqliteRow) -> RelayerResult<Msg> {
    let state: String = row.try_get("state")?;
    Ok(Msg {
        id: row.try_get("id")?,
        chain_id: row.try_get("cosmos_chain_id")?,
        contract_id: row.try_get("contract_id")?,
        state: state.parse()?,
        type_url: row.try_get("type")?,
        raw: row.try_get("raw")?,
        tx_hash: row.try_get("tx_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Single-connection in-memory store for tests
#[cfg(test)]
pub(crate) async fn test_orm(chain_id: &str) -> MsgOrm {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let orm = MsgOrm::new(pool, chain_id);
    orm.run_migrations().await.unwrap();
    orm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_id() -> String {
        format!("Chainlinktest-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_orm_lifecycle() {
        let orm = test_orm(&chain_id()).await;

        let mid1 = orm.insert_msg("0x123", "/cosmos.bank.v1beta1.MsgSend", &[0x01]).await.unwrap();
        let mid2 = orm.insert_msg("0x123", "/cosmos.bank.v1beta1.MsgSend", &[0x02]).await.unwrap();
        assert!(mid2 > mid1);

        let unstarted = orm.get_msgs_state(MsgState::Unstarted, 5).await.unwrap();
        assert_eq!(unstarted.len(), 2);
        assert_eq!(unstarted[0].id, mid1);
        assert_eq!(unstarted[0].raw, vec![0x01]);
        assert_eq!(unstarted[0].tx_hash, None);

        orm.update_msgs(&[mid1, mid2], MsgState::Started, None).await.unwrap();
        orm.update_msgs(&[mid1, mid2], MsgState::Broadcasted, Some("0xabc"))
            .await
            .unwrap();
        let broadcasted = orm.get_msgs_state(MsgState::Broadcasted, 5).await.unwrap();
        assert_eq!(broadcasted.len(), 2);
        assert_eq!(broadcasted[0].tx_hash.as_deref(), Some("0xabc"));

        orm.update_msgs(&[mid1, mid2], MsgState::Confirmed, None).await.unwrap();
        let confirmed = orm.get_msgs(&[mid1, mid2]).await.unwrap();
        assert_eq!(confirmed.len(), 2);
        assert!(confirmed.iter().all(|m| m.state == MsgState::Confirmed));
        assert!(confirmed.iter().all(|m| m.tx_hash.as_deref() == Some("0xabc")));

        let stats = orm.stats().await.unwrap();
        assert_eq!(stats.confirmed, 2);
        assert_eq!(stats.unstarted, 0);
    }

    #[tokio::test]
    async fn test_connect_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            max_connections: 2,
            min_connections: 0,
        };

        let orm = MsgOrm::connect(&config, chain_id()).await.unwrap();
        orm.run_migrations().await.unwrap();
        let id = orm.insert_msg("0x123", "/cosmos.bank.v1beta1.MsgSend", &[0x01]).await.unwrap();
        assert_eq!(orm.get_msgs(&[id]).await.unwrap().len(), 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_get_msgs_state_rejects_bad_limit() {
        let orm = test_orm(&chain_id()).await;
        orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();

        for limit in [0, -1] {
            let err = orm.get_msgs_state(MsgState::Unstarted, limit).await.unwrap_err();
            assert!(matches!(err, RelayerError::InvalidLimit));
            assert_eq!(err.to_string(), "limit must be greater than 0");
        }
    }

    #[tokio::test]
    async fn test_get_msgs_state_is_oldest_first_and_bounded() {
        let orm = test_orm(&chain_id()).await;
        let mut ids = Vec::new();
        for i in 0..5u8 {
            ids.push(orm.insert_msg("0x123", "t", &[i]).await.unwrap());
        }

        let msgs = orm.get_msgs_state(MsgState::Unstarted, 3).await.unwrap();
        assert_eq!(msgs.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..3].to_vec());
    }

    #[tokio::test]
    async fn test_broadcasted_requires_tx_hash() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();
        orm.update_msgs(&[id], MsgState::Started, None).await.unwrap();

        let err = orm
            .update_msgs(&[id], MsgState::Broadcasted, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::MissingTxHash));
    }

    #[tokio::test]
    async fn test_update_counts_rows() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();

        let err = orm
            .update_msgs(&[id, id + 100], MsgState::Started, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayerError::RowCountMismatch { expected: 2, got: 1 }
        ));
    }

    #[tokio::test]
    async fn test_rejects_illegal_transition() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();
        orm.update_msgs(&[id], MsgState::Errored, None).await.unwrap();

        assert!(orm.update_msgs(&[id], MsgState::Unstarted, None).await.is_err());
        assert!(orm.update_msgs(&[id], MsgState::Started, None).await.is_err());
        let msg = &orm.get_msgs(&[id]).await.unwrap()[0];
        assert_eq!(msg.state, MsgState::Errored);
    }

    #[tokio::test]
    async fn test_errored_after_broadcast_clears_hash() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();
        orm.update_msgs(&[id], MsgState::Started, None).await.unwrap();
        orm.update_msgs(&[id], MsgState::Broadcasted, Some("0xabc")).await.unwrap();
        orm.update_msgs(&[id], MsgState::Errored, None).await.unwrap();

        let msg = &orm.get_msgs(&[id]).await.unwrap()[0];
        assert_eq!(msg.state, MsgState::Errored);
        assert_eq!(msg.tx_hash, None);
    }

    #[tokio::test]
    async fn test_scoped_by_chain_id() {
        let pool = test_orm(&chain_id()).await.pool.clone();
        let a = MsgOrm::new(pool.clone(), "chain-a");
        let b = MsgOrm::new(pool, "chain-b");

        let id = a.insert_msg("0x123", "t", &[0x01]).await.unwrap();
        assert!(b.get_msgs_state(MsgState::Unstarted, 10).await.unwrap().is_empty());
        assert!(b.get_msgs(&[id]).await.unwrap().is_empty());
        assert!(b.update_msgs(&[id], MsgState::Started, None).await.is_err());
        assert_eq!(a.get_msgs_state(MsgState::Unstarted, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_msgs_contract() {
        let orm = test_orm(&chain_id()).await;
        orm.insert_msg("contract-a", "t", &[0x01]).await.unwrap();
        orm.insert_msg("contract-a", "t", &[0x02]).await.unwrap();
        let other = orm.insert_msg("contract-b", "t", &[0x03]).await.unwrap();

        let n = orm
            .update_msgs_contract("contract-a", MsgState::Unstarted, MsgState::Errored)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(orm.get_msgs(&[other]).await.unwrap()[0].state, MsgState::Unstarted);

        assert!(orm
            .update_msgs_contract("contract-b", MsgState::Started, MsgState::Broadcasted)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_transaction_commits_on_success() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();

        orm.transaction(move |tx| {
            Box::pin(async move {
                tx.update_msgs(&[id], MsgState::Started, None).await?;
                tx.update_msgs(&[id], MsgState::Broadcasted, Some("0xabc")).await
            })
        })
        .await
        .unwrap();

        let msg = &orm.get_msgs(&[id]).await.unwrap()[0];
        assert_eq!(msg.state, MsgState::Broadcasted);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();

        let result: RelayerResult<()> = orm
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.update_msgs(&[id], MsgState::Started, None).await?;
                    Err(RelayerError::Internal("boom".to_string()))
                })
            })
            .await;
        assert!(result.is_err());

        let msg = &orm.get_msgs(&[id]).await.unwrap()[0];
        assert_eq!(msg.state, MsgState::Unstarted);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_and_repanics() {
        let orm = test_orm(&chain_id()).await;
        let id = orm.insert_msg("0x123", "t", &[0x01]).await.unwrap();

        let panicked = AssertUnwindSafe(orm.transaction(move |tx| {
            Box::pin(async move {
                tx.update_msgs(&[id], MsgState::Started, None).await?;
                if id > 0 {
                    panic!("panic inside transaction");
                }
                Ok(())
            })
        }))
        .catch_unwind()
        .await;
        assert!(panicked.is_err());

        let msg = &orm.get_msgs(&[id]).await.unwrap()[0];
        assert_eq!(msg.state, MsgState::Unstarted);
    }
}
