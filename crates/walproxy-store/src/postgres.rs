//! Postgres-backed implementation of [`StoreAdapter`].
//!
//! Mirrors the connect/migrate/typed-query shape of the SQLite storage
//! driver in this crate, adapted to Postgres placeholders, `JSONB`
//! columns, and `SELECT ... FOR UPDATE SKIP LOCKED` for the WAL sync
//! claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use walproxy_types::{
    BackendName, CollectionMapping, Error, LedgerStatus, LedgerTransaction, Result,
    TargetInstance, WalEntry, WalStatus,
};

use crate::{parse_target_instance, LedgerUpdate, LogicalDocumentId, StoreAdapter, WalUpdate};

/// A persistent store backend using Postgres.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(crate::STORE_DEADLINE)
            .connect(database_url)
            .await
            .map_err(Error::from_store)?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool, running migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wal (
                write_id TEXT PRIMARY KEY,
                sequence BIGSERIAL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                body BYTEA NOT NULL,
                headers JSONB NOT NULL,
                target_instance TEXT NOT NULL,
                executed_on TEXT,
                status TEXT NOT NULL,
                collection_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                "timestamp" TIMESTAMPTZ NOT NULL DEFAULT now(),
                executed_at TIMESTAMPTZ,
                synced_at TIMESTAMPTZ,
                claimed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_wal_status_target ON wal(status, target_instance)",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_wal_collection_ts ON wal(collection_id, \"timestamp\")",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_mappings (
                name TEXT PRIMARY KEY,
                primary_uuid UUID,
                replica_uuid UUID,
                configuration JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logical_document_ids (
                collection_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                backend_document_id TEXT NOT NULL,
                logical_id TEXT NOT NULL,
                PRIMARY KEY (collection_id, backend, backend_document_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger (
                transaction_id UUID PRIMARY KEY,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                data JSONB,
                headers JSONB NOT NULL,
                status TEXT NOT NULL,
                is_timing_gap_failure BOOLEAN NOT NULL DEFAULT false,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_retry_at TIMESTAMPTZ,
                target_instance TEXT NOT NULL,
                client_session TEXT,
                client_ip TEXT,
                operation_type TEXT NOT NULL,
                response_status INTEGER,
                response_data JSONB,
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                claimed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status)")
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_created_at ON ledger(created_at)")
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_status_retry ON ledger(status, next_retry_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        Ok(())
    }

    fn row_to_wal(row: &sqlx::postgres::PgRow) -> Result<WalEntry> {
        let headers_json: serde_json::Value = row.try_get("headers").map_err(Error::from_store)?;
        let headers = headers_to_pairs(headers_json);
        let target_instance: String =
            row.try_get("target_instance").map_err(Error::from_store)?;
        let executed_on: Option<String> = row.try_get("executed_on").map_err(Error::from_store)?;
        let status: String = row.try_get("status").map_err(Error::from_store)?;

        Ok(WalEntry {
            write_id: row.try_get("write_id").map_err(Error::from_store)?,
            sequence: row.try_get("sequence").map_err(Error::from_store)?,
            method: row.try_get("method").map_err(Error::from_store)?,
            path: row.try_get("path").map_err(Error::from_store)?,
            body: row.try_get("body").map_err(Error::from_store)?,
            headers,
            target_instance: parse_target_instance(&target_instance),
            executed_on: executed_on.and_then(|s| s.parse().ok()),
            status: status.parse().unwrap_or(WalStatus::Pending),
            collection_id: row.try_get("collection_id").map_err(Error::from_store)?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(Error::from_store)? as u32,
            error_message: row.try_get("error_message").map_err(Error::from_store)?,
            timestamp: row.try_get("timestamp").map_err(Error::from_store)?,
            executed_at: row.try_get("executed_at").map_err(Error::from_store)?,
            synced_at: row.try_get("synced_at").map_err(Error::from_store)?,
        })
    }

    fn row_to_mapping(row: &sqlx::postgres::PgRow) -> Result<CollectionMapping> {
        Ok(CollectionMapping {
            name: row.try_get("name").map_err(Error::from_store)?,
            primary_uuid: row.try_get("primary_uuid").map_err(Error::from_store)?,
            replica_uuid: row.try_get("replica_uuid").map_err(Error::from_store)?,
            configuration: row.try_get("configuration").map_err(Error::from_store)?,
            created_at: row.try_get("created_at").map_err(Error::from_store)?,
            updated_at: row.try_get("updated_at").map_err(Error::from_store)?,
        })
    }

    fn row_to_ledger(row: &sqlx::postgres::PgRow) -> Result<LedgerTransaction> {
        let headers_json: serde_json::Value = row.try_get("headers").map_err(Error::from_store)?;
        let status: String = row.try_get("status").map_err(Error::from_store)?;
        let target_instance: String =
            row.try_get("target_instance").map_err(Error::from_store)?;

        Ok(LedgerTransaction {
            transaction_id: row.try_get("transaction_id").map_err(Error::from_store)?,
            method: row.try_get("method").map_err(Error::from_store)?,
            path: row.try_get("path").map_err(Error::from_store)?,
            data: row.try_get("data").map_err(Error::from_store)?,
            headers: headers_to_pairs(headers_json),
            status: status.parse().unwrap_or(LedgerStatus::Attempting),
            is_timing_gap_failure: row
                .try_get("is_timing_gap_failure")
                .map_err(Error::from_store)?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(Error::from_store)? as u32,
            max_retries: row.try_get::<i32, _>("max_retries").map_err(Error::from_store)? as u32,
            next_retry_at: row.try_get("next_retry_at").map_err(Error::from_store)?,
            target_instance: parse_target_instance(&target_instance),
            client_session: row.try_get("client_session").map_err(Error::from_store)?,
            client_ip: row.try_get("client_ip").map_err(Error::from_store)?,
            operation_type: row.try_get("operation_type").map_err(Error::from_store)?,
            response_status: row
                .try_get::<Option<i32>, _>("response_status")
                .map_err(Error::from_store)?
                .map(|v| v as u16),
            response_data: row.try_get("response_data").map_err(Error::from_store)?,
            failure_reason: row.try_get("failure_reason").map_err(Error::from_store)?,
            created_at: row.try_get("created_at").map_err(Error::from_store)?,
            updated_at: row.try_get("updated_at").map_err(Error::from_store)?,
        })
    }
}

fn pairs_to_headers(headers: &[(String, String)]) -> serde_json::Value {
    serde_json::Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

fn headers_to_pairs(value: serde_json::Value) -> Vec<(String, String)> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    async fn insert_wal(&self, entry: &WalEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wal
                (write_id, method, path, body, headers, target_instance, executed_on,
                 status, collection_id, retry_count, error_message, "timestamp",
                 executed_at, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (write_id) DO NOTHING
            "#,
        )
        .bind(&entry.write_id)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(&entry.body)
        .bind(pairs_to_headers(&entry.headers))
        .bind(entry.target_instance.as_str())
        .bind(entry.executed_on.map(|b| b.as_str()))
        .bind(entry.status.as_str())
        .bind(&entry.collection_id)
        .bind(entry.retry_count as i32)
        .bind(&entry.error_message)
        .bind(entry.timestamp)
        .bind(entry.executed_at)
        .bind(entry.synced_at)
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn get_wal(&self, write_id: &str) -> Result<Option<WalEntry>> {
        let row = sqlx::query("SELECT * FROM wal WHERE write_id = $1")
            .bind(write_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_wal).transpose()
    }

    async fn claim_next_unsynced(
        &self,
        target: BackendName,
        batch_size: usize,
    ) -> Result<Vec<WalEntry>> {
        let mut tx = self.pool.begin().await.map_err(Error::from_store)?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM wal
            WHERE (target_instance = 'both' OR target_instance = $1)
              AND (executed_on IS DISTINCT FROM $1 OR status = 'pending')
              AND status NOT IN ('synced', 'failed')
              AND retry_count < 3
              AND claimed_at IS NULL
            ORDER BY "timestamp" ASC, sequence ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(target.as_str())
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::from_store)?;

        for row in &rows {
            let write_id: &str = row.try_get("write_id").map_err(Error::from_store)?;
            sqlx::query("UPDATE wal SET claimed_at = now() WHERE write_id = $1")
                .bind(write_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::from_store)?;
        }

        tx.commit().await.map_err(Error::from_store)?;

        rows.iter().map(Self::row_to_wal).collect()
    }

    async fn mark_wal(&self, write_id: &str, update: WalUpdate) -> Result<()> {
        sqlx::query("UPDATE wal SET claimed_at = NULL WHERE write_id = $1")
            .bind(write_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        if let Some(status) = update.status {
            sqlx::query("UPDATE wal SET status = $1 WHERE write_id = $2")
                .bind(status.as_str())
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(executed_on) = update.executed_on {
            sqlx::query("UPDATE wal SET executed_on = $1 WHERE write_id = $2")
                .bind(executed_on.as_str())
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(retry_count) = update.retry_count {
            sqlx::query("UPDATE wal SET retry_count = $1 WHERE write_id = $2")
                .bind(retry_count as i32)
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(error_message) = update.error_message {
            sqlx::query("UPDATE wal SET error_message = $1 WHERE write_id = $2")
                .bind(error_message)
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(executed_at) = update.executed_at {
            sqlx::query("UPDATE wal SET executed_at = $1 WHERE write_id = $2")
                .bind(executed_at)
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(synced_at) = update.synced_at {
            sqlx::query("UPDATE wal SET synced_at = $1 WHERE write_id = $2")
                .bind(synced_at)
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        Ok(())
    }

    async fn release_wal_claim(&self, write_id: &str) -> Result<()> {
        sqlx::query("UPDATE wal SET claimed_at = NULL WHERE write_id = $1")
            .bind(write_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        Ok(())
    }

    async fn wal_status_counts(&self) -> Result<Vec<(WalStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM wal GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from_store)?;
        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(Error::from_store)?;
                let count: i64 = row.try_get("count").map_err(Error::from_store)?;
                Ok((status.parse().unwrap_or(WalStatus::Pending), count))
            })
            .collect()
    }

    async fn oldest_pending_wal_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(\"timestamp\") as oldest FROM wal WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::from_store)?;
        row.try_get("oldest").map_err(Error::from_store)
    }

    async fn upsert_mapping(&self, mapping: &CollectionMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_mappings
                (name, primary_uuid, replica_uuid, configuration, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                primary_uuid = COALESCE(collection_mappings.primary_uuid, EXCLUDED.primary_uuid),
                replica_uuid = COALESCE(collection_mappings.replica_uuid, EXCLUDED.replica_uuid),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&mapping.name)
        .bind(mapping.primary_uuid)
        .bind(mapping.replica_uuid)
        .bind(&mapping.configuration)
        .bind(mapping.created_at)
        .bind(mapping.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn get_mapping_by_name(&self, name: &str) -> Result<Option<CollectionMapping>> {
        let row = sqlx::query("SELECT * FROM collection_mappings WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn get_mapping_by_uuid(&self, uuid: Uuid) -> Result<Option<CollectionMapping>> {
        let row = sqlx::query(
            "SELECT * FROM collection_mappings WHERE primary_uuid = $1 OR replica_uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn delete_mapping(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM collection_mappings WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        Ok(())
    }

    async fn record_logical_document_id(&self, record: &LogicalDocumentId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO logical_document_ids
                (collection_id, backend, backend_document_id, logical_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (collection_id, backend, backend_document_id)
            DO UPDATE SET logical_id = EXCLUDED.logical_id
            "#,
        )
        .bind(&record.collection_id)
        .bind(record.backend.as_str())
        .bind(&record.backend_document_id)
        .bind(&record.logical_id)
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn logical_document_id(
        &self,
        collection_id: &str,
        backend: BackendName,
        backend_document_id: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT logical_id FROM logical_document_ids
            WHERE collection_id = $1 AND backend = $2 AND backend_document_id = $3
            "#,
        )
        .bind(collection_id)
        .bind(backend.as_str())
        .bind(backend_document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from_store)?;
        row.map(|r| r.try_get("logical_id").map_err(Error::from_store))
            .transpose()
    }

    async fn insert_ledger(&self, txn: &LedgerTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger
                (transaction_id, method, path, data, headers, status, is_timing_gap_failure,
                 retry_count, max_retries, next_retry_at, target_instance, client_session,
                 client_ip, operation_type, response_status, response_data, failure_reason,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(txn.transaction_id)
        .bind(&txn.method)
        .bind(&txn.path)
        .bind(&txn.data)
        .bind(pairs_to_headers(&txn.headers))
        .bind(txn.status.as_str())
        .bind(txn.is_timing_gap_failure)
        .bind(txn.retry_count as i32)
        .bind(txn.max_retries as i32)
        .bind(txn.next_retry_at)
        .bind(txn.target_instance.as_str())
        .bind(&txn.client_session)
        .bind(&txn.client_ip)
        .bind(&txn.operation_type)
        .bind(txn.response_status.map(|v| v as i32))
        .bind(&txn.response_data)
        .bind(&txn.failure_reason)
        .bind(txn.created_at)
        .bind(txn.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn get_ledger(&self, transaction_id: Uuid) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query("SELECT * FROM ledger WHERE transaction_id = $1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_ledger).transpose()
    }

    async fn update_ledger(&self, transaction_id: Uuid, update: LedgerUpdate) -> Result<()> {
        sqlx::query("UPDATE ledger SET claimed_at = NULL WHERE transaction_id = $1")
            .bind(transaction_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        if let Some(status) = update.status {
            sqlx::query("UPDATE ledger SET status = $1, updated_at = now() WHERE transaction_id = $2")
                .bind(status.as_str())
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(flag) = update.is_timing_gap_failure {
            sqlx::query("UPDATE ledger SET is_timing_gap_failure = $1 WHERE transaction_id = $2")
                .bind(flag)
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(retry_count) = update.retry_count {
            sqlx::query("UPDATE ledger SET retry_count = $1 WHERE transaction_id = $2")
                .bind(retry_count as i32)
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(next_retry_at) = update.next_retry_at {
            sqlx::query("UPDATE ledger SET next_retry_at = $1 WHERE transaction_id = $2")
                .bind(next_retry_at)
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(response_status) = update.response_status {
            sqlx::query("UPDATE ledger SET response_status = $1 WHERE transaction_id = $2")
                .bind(response_status.map(|v| v as i32))
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(response_data) = update.response_data {
            sqlx::query("UPDATE ledger SET response_data = $1 WHERE transaction_id = $2")
                .bind(response_data)
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(failure_reason) = update.failure_reason {
            sqlx::query("UPDATE ledger SET failure_reason = $1 WHERE transaction_id = $2")
                .bind(failure_reason)
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        Ok(())
    }

    async fn release_ledger_claim(&self, transaction_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE ledger SET claimed_at = NULL WHERE transaction_id = $1")
            .bind(transaction_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        Ok(())
    }

    async fn fetch_recoverable_ledger(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>> {
        let mut tx = self.pool.begin().await.map_err(Error::from_store)?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM ledger
            WHERE status = 'FAILED'
              AND retry_count < max_retries
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND claimed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::from_store)?;

        for row in &rows {
            let transaction_id: Uuid = row.try_get("transaction_id").map_err(Error::from_store)?;
            sqlx::query("UPDATE ledger SET claimed_at = $1 WHERE transaction_id = $2")
                .bind(now)
                .bind(transaction_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::from_store)?;
        }

        tx.commit().await.map_err(Error::from_store)?;
        rows.iter().map(Self::row_to_ledger).collect()
    }

    async fn ledger_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM ledger GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from_store)?;
        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(Error::from_store)?;
                let count: i64 = row.try_get("count").map_err(Error::from_store)?;
                Ok((status, count))
            })
            .collect()
    }

    async fn ledger_timing_gap_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM ledger WHERE is_timing_gap_failure")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.try_get("count").map_err(Error::from_store)
    }

    async fn cleanup(&self, table: &str, retention_days: u32, time_column: &str) -> Result<u64> {
        if !matches!(table, "wal" | "ledger") {
            return Err(Error::Config(format!("cleanup: unknown table {table}")));
        }
        if !matches!(time_column, "timestamp" | "synced_at" | "created_at" | "updated_at") {
            return Err(Error::Config(format!(
                "cleanup: unknown time column {time_column}"
            )));
        }
        let terminal_clause = if table == "wal" {
            "status IN ('synced', 'failed')"
        } else {
            "status IN ('COMPLETED', 'RECOVERED', 'ABANDONED')"
        };
        let sql = format!(
            r#"DELETE FROM {table} WHERE {terminal_clause} AND "{time_column}" < now() - ($1 || ' days')::interval"#
        );
        let result = sqlx::query(&sql)
            .bind(retention_days as i32)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        Ok(result.rows_affected())
    }
}
