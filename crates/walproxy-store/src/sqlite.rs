//! SQLite-backed implementation of [`StoreAdapter`], used by this
//! workspace's test suites in place of a real Postgres instance.
//!
//! Row locking has no SQLite equivalent to `FOR UPDATE SKIP LOCKED`, so
//! claims here rely on the single-connection pool to serialize access
//! and on a `claimed_at` marker, set inside the claim transaction, to
//! keep a row excluded from later claims past that transaction's end —
//! the same in-flight marking [`crate::postgres::PostgresStore`] pairs
//! with its row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use uuid::Uuid;

use walproxy_types::{
    BackendName, CollectionMapping, Error, LedgerStatus, LedgerTransaction, Result,
    TargetInstance, WalEntry, WalStatus,
};

use crate::{parse_target_instance, LedgerUpdate, LogicalDocumentId, StoreAdapter, WalUpdate};

/// A persistent store backend using SQLite, for tests only.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open an in-memory database, private to this pool.
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    /// Open (creating if absent) the database at `url`, e.g.
    /// `sqlite:///tmp/walproxy-test.db`.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(Error::from_store)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wal (
                write_id TEXT PRIMARY KEY,
                sequence INTEGER,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                body BLOB NOT NULL,
                headers TEXT NOT NULL,
                target_instance TEXT NOT NULL,
                executed_on TEXT,
                status TEXT NOT NULL,
                collection_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                timestamp TEXT NOT NULL,
                executed_at TEXT,
                synced_at TEXT,
                claimed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query("CREATE TABLE IF NOT EXISTS wal_sequence (seq INTEGER PRIMARY KEY AUTOINCREMENT, dummy INTEGER)")
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
            "CREATE INDEX IF NOT EXISTS idx_wal_collection_ts ON wal(collection_id, timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_mappings (
                name TEXT PRIMARY KEY,
                primary_uuid TEXT,
                replica_uuid TEXT,
                configuration TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
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
                transaction_id TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                data TEXT,
                headers TEXT NOT NULL,
                status TEXT NOT NULL,
                is_timing_gap_failure INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_retry_at TEXT,
                target_instance TEXT NOT NULL,
                client_session TEXT,
                client_ip TEXT,
                operation_type TEXT NOT NULL,
                response_status INTEGER,
                response_data TEXT,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                claimed_at TEXT
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
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_status_retry ON ledger(status, next_retry_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;

        Ok(())
    }

    async fn next_sequence(&self) -> Result<i64> {
        let row = sqlx::query("INSERT INTO wal_sequence (dummy) VALUES (0) RETURNING seq")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.try_get("seq").map_err(Error::from_store)
    }

    fn row_to_wal(row: &sqlx::sqlite::SqliteRow) -> Result<WalEntry> {
        let headers_text: String = row.try_get("headers").map_err(Error::from_store)?;
        let headers = headers_to_pairs(&headers_text);
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
            retry_count: row.try_get::<i64, _>("retry_count").map_err(Error::from_store)? as u32,
            error_message: row.try_get("error_message").map_err(Error::from_store)?,
            timestamp: parse_ts(row.try_get::<String, _>("timestamp").map_err(Error::from_store)?)?,
            executed_at: parse_opt_ts(row.try_get("executed_at").map_err(Error::from_store)?)?,
            synced_at: parse_opt_ts(row.try_get("synced_at").map_err(Error::from_store)?)?,
        })
    }

    fn row_to_mapping(row: &sqlx::sqlite::SqliteRow) -> Result<CollectionMapping> {
        let config_text: String = row.try_get("configuration").map_err(Error::from_store)?;
        Ok(CollectionMapping {
            name: row.try_get("name").map_err(Error::from_store)?,
            primary_uuid: parse_opt_uuid(row.try_get("primary_uuid").map_err(Error::from_store)?),
            replica_uuid: parse_opt_uuid(row.try_get("replica_uuid").map_err(Error::from_store)?),
            configuration: serde_json::from_str(&config_text).unwrap_or(serde_json::Value::Null),
            created_at: parse_ts(row.try_get::<String, _>("created_at").map_err(Error::from_store)?)?,
            updated_at: parse_ts(row.try_get::<String, _>("updated_at").map_err(Error::from_store)?)?,
        })
    }

    fn row_to_ledger(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerTransaction> {
        let headers_text: String = row.try_get("headers").map_err(Error::from_store)?;
        let status: String = row.try_get("status").map_err(Error::from_store)?;
        let target_instance: String =
            row.try_get("target_instance").map_err(Error::from_store)?;
        let data_text: Option<String> = row.try_get("data").map_err(Error::from_store)?;
        let response_data_text: Option<String> =
            row.try_get("response_data").map_err(Error::from_store)?;

        Ok(LedgerTransaction {
            transaction_id: Uuid::parse_str(
                &row.try_get::<String, _>("transaction_id")
                    .map_err(Error::from_store)?,
            )
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?,
            method: row.try_get("method").map_err(Error::from_store)?,
            path: row.try_get("path").map_err(Error::from_store)?,
            data: data_text.and_then(|t| serde_json::from_str(&t).ok()),
            headers: headers_to_pairs(&headers_text),
            status: status.parse().unwrap_or(LedgerStatus::Attempting),
            is_timing_gap_failure: row
                .try_get::<i64, _>("is_timing_gap_failure")
                .map_err(Error::from_store)?
                != 0,
            retry_count: row.try_get::<i64, _>("retry_count").map_err(Error::from_store)? as u32,
            max_retries: row.try_get::<i64, _>("max_retries").map_err(Error::from_store)? as u32,
            next_retry_at: parse_opt_ts(row.try_get("next_retry_at").map_err(Error::from_store)?)?,
            target_instance: parse_target_instance(&target_instance),
            client_session: row.try_get("client_session").map_err(Error::from_store)?,
            client_ip: row.try_get("client_ip").map_err(Error::from_store)?,
            operation_type: row.try_get("operation_type").map_err(Error::from_store)?,
            response_status: row
                .try_get::<Option<i64>, _>("response_status")
                .map_err(Error::from_store)?
                .map(|v| v as u16),
            response_data: response_data_text.and_then(|t| serde_json::from_str(&t).ok()),
            failure_reason: row.try_get("failure_reason").map_err(Error::from_store)?,
            created_at: parse_ts(row.try_get::<String, _>("created_at").map_err(Error::from_store)?)?,
            updated_at: parse_ts(row.try_get::<String, _>("updated_at").map_err(Error::from_store)?)?,
        })
    }
}

fn pairs_to_headers(headers: &[(String, String)]) -> String {
    let value = serde_json::Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    );
    value.to_string()
}

fn headers_to_pairs(text: &str) -> Vec<(String, String)> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_ts(text: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::StoreUnavailable(e.to_string()))
}

fn parse_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(parse_ts).transpose()
}

fn parse_opt_uuid(text: Option<String>) -> Option<Uuid> {
    text.and_then(|t| Uuid::parse_str(&t).ok())
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    async fn insert_wal(&self, entry: &WalEntry) -> Result<()> {
        let sequence = self.next_sequence().await?;
        sqlx::query(
            r#"
            INSERT INTO wal
                (write_id, sequence, method, path, body, headers, target_instance, executed_on,
                 status, collection_id, retry_count, error_message, timestamp,
                 executed_at, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (write_id) DO NOTHING
            "#,
        )
        .bind(&entry.write_id)
        .bind(sequence)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(&entry.body)
        .bind(pairs_to_headers(&entry.headers))
        .bind(entry.target_instance.as_str())
        .bind(entry.executed_on.map(|b| b.as_str()))
        .bind(entry.status.as_str())
        .bind(&entry.collection_id)
        .bind(entry.retry_count as i64)
        .bind(&entry.error_message)
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.executed_at.map(|t| t.to_rfc3339()))
        .bind(entry.synced_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn get_wal(&self, write_id: &str) -> Result<Option<WalEntry>> {
        let row = sqlx::query("SELECT * FROM wal WHERE write_id = ?")
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
            WHERE (target_instance = 'both' OR target_instance = ?)
              AND (executed_on IS NOT ? OR status = 'pending')
              AND status NOT IN ('synced', 'failed')
              AND retry_count < 3
              AND claimed_at IS NULL
            ORDER BY timestamp ASC, sequence ASC
            LIMIT ?
            "#,
        )
        .bind(target.as_str())
        .bind(target.as_str())
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::from_store)?;

        for row in &rows {
            let write_id: String = row.try_get("write_id").map_err(Error::from_store)?;
            sqlx::query("UPDATE wal SET claimed_at = ? WHERE write_id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(write_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::from_store)?;
        }

        tx.commit().await.map_err(Error::from_store)?;
        rows.iter().map(Self::row_to_wal).collect()
    }

    async fn mark_wal(&self, write_id: &str, update: WalUpdate) -> Result<()> {
        sqlx::query("UPDATE wal SET claimed_at = NULL WHERE write_id = ?")
            .bind(write_id)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        if let Some(status) = update.status {
            sqlx::query("UPDATE wal SET status = ? WHERE write_id = ?")
                .bind(status.as_str())
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(executed_on) = update.executed_on {
            sqlx::query("UPDATE wal SET executed_on = ? WHERE write_id = ?")
                .bind(executed_on.as_str())
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(retry_count) = update.retry_count {
            sqlx::query("UPDATE wal SET retry_count = ? WHERE write_id = ?")
                .bind(retry_count as i64)
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(error_message) = update.error_message {
            sqlx::query("UPDATE wal SET error_message = ? WHERE write_id = ?")
                .bind(error_message)
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(executed_at) = update.executed_at {
            sqlx::query("UPDATE wal SET executed_at = ? WHERE write_id = ?")
                .bind(executed_at.to_rfc3339())
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(synced_at) = update.synced_at {
            sqlx::query("UPDATE wal SET synced_at = ? WHERE write_id = ?")
                .bind(synced_at.to_rfc3339())
                .bind(write_id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        Ok(())
    }

    async fn release_wal_claim(&self, write_id: &str) -> Result<()> {
        sqlx::query("UPDATE wal SET claimed_at = NULL WHERE write_id = ?")
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
        let row = sqlx::query("SELECT MIN(timestamp) as oldest FROM wal WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::from_store)?;
        let oldest: Option<String> = row.try_get("oldest").map_err(Error::from_store)?;
        parse_opt_ts(oldest)
    }

    async fn upsert_mapping(&self, mapping: &CollectionMapping) -> Result<()> {
        let existing = self.get_mapping_by_name(&mapping.name).await?;
        let primary_uuid = existing
            .as_ref()
            .and_then(|m| m.primary_uuid)
            .or(mapping.primary_uuid);
        let replica_uuid = existing
            .as_ref()
            .and_then(|m| m.replica_uuid)
            .or(mapping.replica_uuid);

        sqlx::query(
            r#"
            INSERT INTO collection_mappings
                (name, primary_uuid, replica_uuid, configuration, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                primary_uuid = excluded.primary_uuid,
                replica_uuid = excluded.replica_uuid,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&mapping.name)
        .bind(primary_uuid.map(|u| u.to_string()))
        .bind(replica_uuid.map(|u| u.to_string()))
        .bind(mapping.configuration.to_string())
        .bind(mapping.created_at.to_rfc3339())
        .bind(mapping.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn get_mapping_by_name(&self, name: &str) -> Result<Option<CollectionMapping>> {
        let row = sqlx::query("SELECT * FROM collection_mappings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn get_mapping_by_uuid(&self, uuid: Uuid) -> Result<Option<CollectionMapping>> {
        let uuid_text = uuid.to_string();
        let row = sqlx::query(
            "SELECT * FROM collection_mappings WHERE primary_uuid = ? OR replica_uuid = ?",
        )
        .bind(&uuid_text)
        .bind(&uuid_text)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_mapping).transpose()
    }

    async fn delete_mapping(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM collection_mappings WHERE name = ?")
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
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection_id, backend, backend_document_id)
            DO UPDATE SET logical_id = excluded.logical_id
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
            WHERE collection_id = ? AND backend = ? AND backend_document_id = ?
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
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(txn.transaction_id.to_string())
        .bind(&txn.method)
        .bind(&txn.path)
        .bind(txn.data.as_ref().map(|v| v.to_string()))
        .bind(pairs_to_headers(&txn.headers))
        .bind(txn.status.as_str())
        .bind(txn.is_timing_gap_failure as i64)
        .bind(txn.retry_count as i64)
        .bind(txn.max_retries as i64)
        .bind(txn.next_retry_at.map(|t| t.to_rfc3339()))
        .bind(txn.target_instance.as_str())
        .bind(&txn.client_session)
        .bind(&txn.client_ip)
        .bind(&txn.operation_type)
        .bind(txn.response_status.map(|v| v as i64))
        .bind(txn.response_data.as_ref().map(|v| v.to_string()))
        .bind(&txn.failure_reason)
        .bind(txn.created_at.to_rfc3339())
        .bind(txn.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Error::from_store)?;
        Ok(())
    }

    async fn get_ledger(&self, transaction_id: Uuid) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query("SELECT * FROM ledger WHERE transaction_id = ?")
            .bind(transaction_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from_store)?;
        row.as_ref().map(Self::row_to_ledger).transpose()
    }

    async fn update_ledger(&self, transaction_id: Uuid, update: LedgerUpdate) -> Result<()> {
        let id = transaction_id.to_string();
        sqlx::query("UPDATE ledger SET claimed_at = NULL WHERE transaction_id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        if let Some(status) = update.status {
            sqlx::query("UPDATE ledger SET status = ?, updated_at = ? WHERE transaction_id = ?")
                .bind(status.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(flag) = update.is_timing_gap_failure {
            sqlx::query("UPDATE ledger SET is_timing_gap_failure = ? WHERE transaction_id = ?")
                .bind(flag as i64)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(retry_count) = update.retry_count {
            sqlx::query("UPDATE ledger SET retry_count = ? WHERE transaction_id = ?")
                .bind(retry_count as i64)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(next_retry_at) = update.next_retry_at {
            sqlx::query("UPDATE ledger SET next_retry_at = ? WHERE transaction_id = ?")
                .bind(next_retry_at.map(|t| t.to_rfc3339()))
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(response_status) = update.response_status {
            sqlx::query("UPDATE ledger SET response_status = ? WHERE transaction_id = ?")
                .bind(response_status.map(|v| v as i64))
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(response_data) = update.response_data {
            sqlx::query("UPDATE ledger SET response_data = ? WHERE transaction_id = ?")
                .bind(response_data.map(|v| v.to_string()))
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        if let Some(failure_reason) = update.failure_reason {
            sqlx::query("UPDATE ledger SET failure_reason = ? WHERE transaction_id = ?")
                .bind(failure_reason)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(Error::from_store)?;
        }
        Ok(())
    }

    async fn release_ledger_claim(&self, transaction_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE ledger SET claimed_at = NULL WHERE transaction_id = ?")
            .bind(transaction_id.to_string())
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
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
              AND claimed_at IS NULL
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::from_store)?;

        for row in &rows {
            let transaction_id: String =
                row.try_get("transaction_id").map_err(Error::from_store)?;
            sqlx::query("UPDATE ledger SET claimed_at = ? WHERE transaction_id = ?")
                .bind(now.to_rfc3339())
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
        let row =
            sqlx::query("SELECT COUNT(*) as count FROM ledger WHERE is_timing_gap_failure != 0")
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
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let sql = format!(
            "DELETE FROM {table} WHERE {terminal_clause} AND {time_column} < ?"
        );
        let result = sqlx::query(&sql)
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(Error::from_store)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walproxy_types::{Backend, CollectionMapping, LedgerTransaction, TargetInstance, WalEntry};

    fn sample_wal(write_id: &str) -> WalEntry {
        WalEntry {
            write_id: write_id.to_string(),
            sequence: 0,
            method: "POST".to_string(),
            path: "/api/v2/tenants/default/databases/default/collections/abc/add".to_string(),
            body: b"{}".to_vec(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            target_instance: TargetInstance::Both,
            executed_on: Some(BackendName::Primary),
            status: WalStatus::Pending,
            collection_id: Some("abc".to_string()),
            retry_count: 0,
            error_message: None,
            timestamp: Utc::now(),
            executed_at: None,
            synced_at: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_wal_roundtrips() {
        let store = SqliteStore::in_memory().await.unwrap();
        let entry = sample_wal("w-1");
        store.insert_wal(&entry).await.unwrap();

        let fetched = store.get_wal("w-1").await.unwrap().expect("row present");
        assert_eq!(fetched.write_id, "w-1");
        assert_eq!(fetched.collection_id.as_deref(), Some("abc"));
        assert_eq!(fetched.headers.len(), 1);
    }

    #[tokio::test]
    async fn insert_wal_is_idempotent_on_write_id() {
        let store = SqliteStore::in_memory().await.unwrap();
        let entry = sample_wal("w-dup");
        store.insert_wal(&entry).await.unwrap();
        store.insert_wal(&entry).await.unwrap();

        let counts = store.wal_status_counts().await.unwrap();
        let total: i64 = counts.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn claim_next_unsynced_respects_target_and_ordering() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..3 {
            let mut entry = sample_wal(&format!("w-{i}"));
            entry.executed_on = Some(BackendName::Primary);
            store.insert_wal(&entry).await.unwrap();
        }

        let claimed = store
            .claim_next_unsynced(BackendName::Replica, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.windows(2).all(|w| w[0].sequence <= w[1].sequence));
    }

    #[tokio::test]
    async fn mark_wal_updates_selected_fields_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        let entry = sample_wal("w-mark");
        store.insert_wal(&entry).await.unwrap();

        store
            .mark_wal(
                "w-mark",
                WalUpdate {
                    status: Some(WalStatus::Synced),
                    synced_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = store.get_wal("w-mark").await.unwrap().unwrap();
        assert_eq!(fetched.status, WalStatus::Synced);
        assert!(fetched.synced_at.is_some());
        assert_eq!(fetched.method, "POST");
    }

    #[tokio::test]
    async fn mapping_upsert_never_clobbers_existing_uuid() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut mapping = CollectionMapping {
            name: "docs".to_string(),
            primary_uuid: Some(Uuid::new_v4()),
            replica_uuid: None,
            configuration: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_mapping(&mapping).await.unwrap();

        let replica_uuid = Uuid::new_v4();
        mapping.primary_uuid = None;
        mapping.replica_uuid = Some(replica_uuid);
        store.upsert_mapping(&mapping).await.unwrap();

        let fetched = store.get_mapping_by_name("docs").await.unwrap().unwrap();
        assert!(fetched.primary_uuid.is_some());
        assert_eq!(fetched.replica_uuid, Some(replica_uuid));
    }

    #[tokio::test]
    async fn ledger_recovery_query_filters_by_retry_and_deadline() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let txn = LedgerTransaction {
            transaction_id: Uuid::new_v4(),
            method: "POST".to_string(),
            path: "/api/v2/.../add".to_string(),
            data: None,
            headers: vec![],
            status: LedgerStatus::Failed,
            is_timing_gap_failure: false,
            retry_count: 1,
            max_retries: LedgerTransaction::DEFAULT_MAX_RETRIES,
            next_retry_at: Some(now - chrono::Duration::seconds(5)),
            target_instance: TargetInstance::Both,
            client_session: None,
            client_ip: None,
            operation_type: "add".to_string(),
            response_status: None,
            response_data: None,
            failure_reason: Some("backend unavailable".to_string()),
            created_at: now,
            updated_at: now,
        };
        store.insert_ledger(&txn).await.unwrap();

        let recoverable = store.fetch_recoverable_ledger(10, now).await.unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].transaction_id, txn.transaction_id);
    }

    #[tokio::test]
    async fn cleanup_only_removes_terminal_rows_past_retention() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut old_entry = sample_wal("w-old");
        old_entry.status = WalStatus::Synced;
        old_entry.synced_at = Some(Utc::now() - chrono::Duration::days(30));
        store.insert_wal(&old_entry).await.unwrap();
        store
            .mark_wal(
                "w-old",
                WalUpdate {
                    status: Some(WalStatus::Synced),
                    synced_at: Some(Utc::now() - chrono::Duration::days(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut fresh_entry = sample_wal("w-fresh");
        fresh_entry.status = WalStatus::Synced;
        store.insert_wal(&fresh_entry).await.unwrap();
        store
            .mark_wal(
                "w-fresh",
                WalUpdate {
                    status: Some(WalStatus::Synced),
                    synced_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let removed = store.cleanup("wal", 7, "synced_at").await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_wal("w-fresh").await.unwrap().is_some());
        assert!(store.get_wal("w-old").await.unwrap().is_none());
    }

    #[test]
    fn backend_name_other_is_its_opposite() {
        let backend = Backend::new(BackendName::Primary, "http://primary:8000".to_string(), 0);
        assert_eq!(backend.name.other(), BackendName::Replica);
    }
}
