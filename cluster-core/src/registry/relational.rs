//! Relational registry adapter: any SQL database sqlx's `Any` driver can
//! reach (SQLite for tests, Postgres in production).
//!
//! Two tables: a singleton `cluster_version` row tracking which entry of a
//! fixed, forward-only migration table has been applied, and `cluster_node`
//! holding one row per live instance. `wait_for_change` has no server push
//! channel to lean on, so it emulates one by polling for a changed
//! fingerprint of the namespace's rows, bounded by
//! [`super::MAX_BALANCE_WAIT_SECONDS`].

use super::{Namespace, RegistryAdapter, BALANCE_SLEEP_SECONDS, MAX_BALANCE_WAIT_SECONDS};
use crate::error::{ClusterError, Result};
use crate::record::{MembershipRecord, TIMESTAMP_FORMAT};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Forward-only migration table: `(version, ddl)`. Applied in order from
/// the row read out of `cluster_version` up to the last entry.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS cluster_version (id INTEGER PRIMARY KEY, version BIGINT NOT NULL)",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS cluster_node (
            cluster_key TEXT NOT NULL,
            partition TEXT NOT NULL DEFAULT '',
            environment TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            worker_count BIGINT NOT NULL,
            updated_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            PRIMARY KEY (cluster_key, partition, environment, instance_id)
        )",
    ),
];

pub struct RelationalAdapter {
    pool: AnyPool,
    fingerprints: Arc<Mutex<HashMap<String, String>>>,
}

fn format_time(dt: DateTime<Utc>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

impl RelationalAdapter {
    /// Build a connection pool without connecting yet; the first real
    /// query (`open_namespace`, during `join`) surfaces connection errors.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| ClusterError::Adapter(e.to_string()))?;
        Ok(Self {
            pool,
            fingerprints: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn current_version(&self) -> Result<i64> {
        let row = sqlx::query("SELECT version FROM cluster_version WHERE id = 1")
            .fetch_optional(&self.pool)
            .await;
        match row {
            Ok(Some(row)) => Ok(row.try_get::<i64, _>("version").unwrap_or(0)),
            _ => Ok(0),
        }
    }

    fn row_to_record(row: &AnyRow) -> MembershipRecord {
        MembershipRecord {
            instance_id: row.try_get("instance_id").unwrap_or_default(),
            worker_count: row.try_get::<i64, _>("worker_count").unwrap_or(0),
            updated_at: parse_time(&row.try_get::<String, _>("updated_at").unwrap_or_default()),
            expires_at: parse_time(&row.try_get::<String, _>("expires_at").unwrap_or_default()),
        }
    }

    fn partition_key(namespace: &Namespace) -> &str {
        namespace.partition.as_deref().unwrap_or("")
    }
}

#[async_trait]
impl RegistryAdapter for RelationalAdapter {
    async fn open_namespace(&self, _namespace: &Namespace) -> Result<()> {
        // Migrations apply to the whole database, not per-namespace; every
        // namespace sharing this pool races here harmlessly since each
        // statement is `IF NOT EXISTS` and the version bump is idempotent.
        let current = self.current_version().await.unwrap_or(0);
        for (version, ddl) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        sqlx::query(
            "INSERT INTO cluster_version (id, version) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        )
        .bind(MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_with_ttl(
        &self,
        namespace: &Namespace,
        key: &str,
        value: i64,
        ttl_seconds: u64,
        must_exist: bool,
    ) -> Result<()> {
        let partition = Self::partition_key(namespace);
        let updated = sqlx::query(
            "UPDATE cluster_node SET worker_count = ?, updated_at = ?, expires_at = ?
             WHERE cluster_key = ? AND partition = ? AND environment = ? AND instance_id = ?",
        )
        .bind(value)
        .bind(format_time(Utc::now()))
        .bind(format_time(Utc::now() + chrono::Duration::seconds(ttl_seconds as i64)))
        .bind(&namespace.cluster_key)
        .bind(partition)
        .bind(&namespace.environment)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        if must_exist {
            return Err(ClusterError::Adapter(format!(
                "refresh for '{key}' found no existing row; instance was evicted"
            )));
        }

        sqlx::query(
            "INSERT INTO cluster_node
                (cluster_key, partition, environment, instance_id, worker_count, updated_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&namespace.cluster_key)
        .bind(partition)
        .bind(&namespace.environment)
        .bind(key)
        .bind(value)
        .bind(format_time(Utc::now()))
        .bind(format_time(Utc::now() + chrono::Duration::seconds(ttl_seconds as i64)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<()> {
        let partition = Self::partition_key(namespace);
        sqlx::query(
            "DELETE FROM cluster_node
             WHERE cluster_key = ? AND partition = ? AND environment = ? AND instance_id = ?",
        )
        .bind(&namespace.cluster_key)
        .bind(partition)
        .bind(&namespace.environment)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, namespace: &Namespace) -> Result<Vec<MembershipRecord>> {
        let partition = Self::partition_key(namespace);
        let rows = sqlx::query(
            "SELECT instance_id, worker_count, updated_at, expires_at FROM cluster_node
             WHERE cluster_key = ? AND partition = ? AND environment = ? AND expires_at > ?",
        )
        .bind(&namespace.cluster_key)
        .bind(partition)
        .bind(&namespace.environment)
        .bind(format_time(Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_record).collect())
    }

    async fn wait_for_change(&self, namespace: &Namespace) -> Result<()> {
        let path = namespace.path();
        let mut elapsed = Duration::from_secs(0);
        loop {
            let records = self.list(namespace).await?;
            let mut fingerprint_parts: Vec<String> = records
                .iter()
                .map(|r| format!("{}:{}:{}", r.instance_id, r.worker_count, format_time(r.updated_at)))
                .collect();
            fingerprint_parts.sort();
            let fingerprint = fingerprint_parts.join(",");

            let changed = {
                let mut fingerprints = self.fingerprints.lock().await;
                let previous = fingerprints.insert(path.clone(), fingerprint.clone());
                match previous {
                    Some(prev) => prev != fingerprint,
                    None => true,
                }
            };

            if changed || elapsed >= Duration::from_secs(MAX_BALANCE_WAIT_SECONDS) {
                return Ok(());
            }

            tokio::time::sleep(Duration::from_secs(BALANCE_SLEEP_SECONDS)).await;
            elapsed += Duration::from_secs(BALANCE_SLEEP_SECONDS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_adapter() -> RelationalAdapter {
        let adapter = RelationalAdapter::connect_lazy("sqlite::memory:").unwrap();
        let ns = Namespace::new("orders", None, "production");
        adapter.open_namespace(&ns).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn put_then_list_round_trips() {
        let adapter = memory_adapter().await;
        let ns = Namespace::new("orders", None, "production");
        adapter.put_with_ttl(&ns, "aaaa", 4, 120, false).await.unwrap();

        let records = adapter.list(&ns).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_id, "aaaa");
        assert_eq!(records[0].worker_count, 4);
    }

    #[tokio::test]
    async fn must_exist_refresh_fails_once_row_is_gone() {
        let adapter = memory_adapter().await;
        let ns = Namespace::new("orders", None, "production");
        adapter.put_with_ttl(&ns, "aaaa", 4, 120, false).await.unwrap();
        adapter.delete(&ns, "aaaa").await.unwrap();

        let result = adapter.put_with_ttl(&ns, "aaaa", 4, 120, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn expired_rows_are_excluded_from_list() {
        let adapter = memory_adapter().await;
        let ns = Namespace::new("orders", None, "production");
        adapter.put_with_ttl(&ns, "aaaa", 1, 0, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let records = adapter.list(&ns).await.unwrap();
        assert!(records.is_empty());
    }
}
