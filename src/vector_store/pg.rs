//! Postgres + pgvector backend.
//!
//! The public API is synchronous: the store owns a current-thread tokio
//! runtime and blocks on every call, so the connection task only makes
//! progress inside those calls. Scores are pgvector cosine distances (`<=>`).
//!
//! A session that drops is re-established when the next write transaction
//! opens; the transaction that was open on it is gone with it.

use anyhow::{Context, Result};
use pgvector::Vector;
use tokio::runtime::{Builder, Runtime};
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::record::{Modality, Record};

use super::{DistanceMetric, Neighbor, TableName, VectorStore};

/// Scoped handle to one Postgres session holding the records table.
///
/// Dropping the handle rolls back any open transaction and closes the session.
pub struct PgVectorStore {
    runtime: Runtime,
    client: Client,
    database_url: String,
    table: TableName,
    insert_sql: String,
    nearest_sql: String,
    count_sql: String,
    in_transaction: bool,
}

impl PgVectorStore {
    /// Opens a session against `database_url`.
    pub fn connect(database_url: &str, table: TableName) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start tokio runtime")?;
        let client =
            open_session(&runtime, database_url).context("failed to connect to Postgres")?;
        Ok(Self {
            runtime,
            client,
            database_url: database_url.to_string(),
            insert_sql: insert_sql(&table),
            nearest_sql: nearest_sql(&table),
            count_sql: format!("SELECT COUNT(*) FROM {}", table.qualified()),
            table,
            in_transaction: false,
        })
    }

    /// Table this handle reads and writes.
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Creates the extension, table and indexes when missing.
    pub fn prepare_schema(&mut self, dims: usize, hnsw_index: bool) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        let qualified = self.table.qualified();
        self.runtime
            .block_on(
                self.client
                    .batch_execute("CREATE EXTENSION IF NOT EXISTS vector"),
            )
            .context("failed to ensure pgvector extension")?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {qualified} (
                seq BIGSERIAL NOT NULL,
                content_hash TEXT PRIMARY KEY,
                patient_id TEXT NOT NULL,
                content_type TEXT NOT NULL,
                metadata JSONB NOT NULL,
                description TEXT NOT NULL,
                embedding VECTOR({dims}) NOT NULL
            )"
        );
        self.runtime
            .block_on(self.client.batch_execute(&ddl))
            .context("failed to create records table")?;

        let modality_index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {qualified} (content_type, seq)",
            self.table.modality_index_name()
        );
        self.runtime
            .block_on(self.client.batch_execute(&modality_index))
            .context("failed to ensure content_type index")?;

        if hnsw_index {
            let hnsw = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {qualified} USING hnsw (embedding vector_cosine_ops)",
                self.table.hnsw_index_name()
            );
            self.runtime
                .block_on(self.client.batch_execute(&hnsw))
                .context("failed to ensure HNSW index")?;
        }
        debug!(table = %qualified, dims, hnsw_index, "records schema ready");
        Ok(())
    }

    /// Replaces a closed session with a fresh one.
    fn reconnect_if_closed(&mut self) -> Result<(), StoreError> {
        if !self.client.is_closed() {
            return Ok(());
        }
        warn!(table = %self.table.qualified(), "postgres session closed; reconnecting");
        self.in_transaction = false;
        self.client = open_session(&self.runtime, &self.database_url)?;
        Ok(())
    }

    fn begin_if_needed(&mut self) -> Result<(), StoreError> {
        self.reconnect_if_closed()?;
        if !self.in_transaction {
            self.runtime
                .block_on(self.client.batch_execute("BEGIN"))
                .map_err(classify)?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn finish_transaction(&mut self, statement: &str) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        // COMMIT on an aborted transaction rolls it back server side, so the
        // transaction is over whichever way the call goes.
        self.in_transaction = false;
        if self.client.is_closed() {
            return closed_session_outcome(statement);
        }
        self.runtime
            .block_on(self.client.batch_execute(statement))
            .map_err(classify)
    }
}

impl VectorStore for PgVectorStore {
    fn insert_if_absent(&mut self, record: &Record) -> Result<bool, StoreError> {
        self.begin_if_needed()?;
        let vector = Vector::from(record.vector.clone());
        let metadata = Json(&record.metadata);
        let modality = record.modality.as_str();
        let affected = self
            .runtime
            .block_on(self.client.execute(
                self.insert_sql.as_str(),
                &[
                    &record.key,
                    &record.subject_id,
                    &modality,
                    &metadata,
                    &record.description,
                    &vector,
                ],
            ))
            .map_err(classify)?;
        Ok(affected == 1)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.finish_transaction("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.finish_transaction("ROLLBACK")
    }

    fn nearest(
        &self,
        query: &[f32],
        modality: Modality,
        k: usize,
    ) -> Result<Vec<Neighbor>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = Vector::from(query.to_vec());
        let content_type = modality.as_str();
        let limit = i64::try_from(k).unwrap_or(i64::MAX);
        let rows = self
            .runtime
            .block_on(self.client.query(
                self.nearest_sql.as_str(),
                &[&vector, &content_type, &limit],
            ))
            .map_err(classify)?;
        let ranked = rows
            .iter()
            .map(ranked_neighbor)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(order_by_distance_then_seq(ranked))
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }

    fn len(&self) -> Result<usize, StoreError> {
        let row = self
            .runtime
            .block_on(self.client.query_one(self.count_sql.as_str(), &[]))
            .map_err(classify)?;
        let count: i64 = row.get(0);
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl Drop for PgVectorStore {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!(table = %self.table.qualified(), "rolling back open transaction on release");
            if let Err(err) = self.rollback() {
                warn!(error = %err, "rollback on release failed");
            }
        }
    }
}

fn insert_sql(table: &TableName) -> String {
    format!(
        "INSERT INTO {} \
            (content_hash, patient_id, content_type, metadata, description, embedding) \
            VALUES ($1, $2, $3, $4, $5, $6) \
            ON CONFLICT (content_hash) DO NOTHING",
        table.qualified()
    )
}

fn nearest_sql(table: &TableName) -> String {
    // a single ORDER BY key keeps the HNSW index usable; ties are broken on seq afterwards
    format!(
        "SELECT \
            seq, \
            content_hash, \
            content_type, \
            description, \
            embedding <=> $1 AS distance \
        FROM {} \
        WHERE content_type = $2 \
        ORDER BY embedding <=> $1 \
        LIMIT $3",
        table.qualified()
    )
}

fn open_session(runtime: &Runtime, database_url: &str) -> Result<Client, StoreError> {
    let (client, connection) = runtime
        .block_on(tokio_postgres::connect(database_url, NoTls))
        .map_err(classify)?;
    runtime.spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "postgres connection error");
        }
    });
    Ok(client)
}

/// Outcome of ending a transaction whose session already dropped: the server
/// discarded it, so a rollback has nothing left to do and a commit is lost.
fn closed_session_outcome(statement: &str) -> Result<(), StoreError> {
    if statement.eq_ignore_ascii_case("ROLLBACK") {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!(
            "session closed before {statement}; transaction discarded"
        )))
    }
}

fn ranked_neighbor(row: &Row) -> Result<(i64, Neighbor), StoreError> {
    let raw_type: String = row.get("content_type");
    let modality = raw_type
        .parse::<Modality>()
        .map_err(|_| StoreError::Backend(format!("unknown content_type '{raw_type}' in store")))?;
    Ok((
        row.get("seq"),
        Neighbor {
            key: row.get("content_hash"),
            modality,
            description: row.get("description"),
            score: row.get("distance"),
        },
    ))
}

/// Ascending distance, equal distances in insertion order.
fn order_by_distance_then_seq(mut ranked: Vec<(i64, Neighbor)>) -> Vec<Neighbor> {
    ranked.sort_by(|(seq_a, a), (seq_b, b)| {
        a.score.total_cmp(&b.score).then_with(|| seq_a.cmp(seq_b))
    });
    ranked.into_iter().map(|(_, neighbor)| neighbor).collect()
}

/// Maps driver errors onto the retryable/non-retryable split.
fn classify(err: tokio_postgres::Error) -> StoreError {
    if err.is_closed() {
        return StoreError::Unavailable(err.to_string());
    }
    match err.code() {
        // no SQLSTATE means the failure happened below the protocol (io, tls)
        None => StoreError::Unavailable(err.to_string()),
        Some(state) if is_transient_state(state.code()) => {
            StoreError::Unavailable(err.to_string())
        }
        Some(_) => StoreError::Backend(err.to_string()),
    }
}

fn is_transient_state(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01" | "57P03")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_do_nothing_on_conflict() {
        let table = TableName::new("public", "patient_records").unwrap();
        let sql = insert_sql(&table);
        assert!(sql.contains("ON CONFLICT (content_hash) DO NOTHING"));
        assert!(sql.starts_with("INSERT INTO \"public\".\"patient_records\""));
    }

    fn neighbor(key: &str, score: f64) -> Neighbor {
        Neighbor {
            key: key.into(),
            modality: Modality::Image,
            description: key.into(),
            score,
        }
    }

    #[test]
    fn nearest_orders_by_distance_only() {
        let table = TableName::new("public", "patient_records").unwrap();
        let sql = nearest_sql(&table);
        assert!(sql.contains("ORDER BY embedding <=> $1 LIMIT $3"));
        assert!(!sql.contains("seq ASC"));
        assert!(sql.contains("SELECT seq,"));
        assert!(sql.contains("WHERE content_type = $2"));
    }

    #[test]
    fn equal_distances_fall_back_to_insertion_order() {
        let ranked = vec![
            (7, neighbor("late-tie", 0.1)),
            (9, neighbor("far", 0.4)),
            (3, neighbor("early-tie", 0.1)),
            (5, neighbor("nearest", 0.05)),
        ];
        let keys: Vec<_> = order_by_distance_then_seq(ranked)
            .into_iter()
            .map(|n| n.key)
            .collect();
        assert_eq!(keys, ["nearest", "early-tie", "late-tie", "far"]);
    }

    #[test]
    fn closed_session_discards_the_transaction() {
        assert!(closed_session_outcome("ROLLBACK").is_ok());
        match closed_session_outcome("COMMIT") {
            Err(err) => assert!(err.is_retryable()),
            Ok(()) => panic!("commit on a closed session cannot succeed"),
        }
    }

    #[test]
    fn unreachable_server_is_retryable() {
        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        // port 1 refuses connections, so this fails without a database
        let err = open_session(&runtime, "postgres://medvault@127.0.0.1:1/medvault")
            .err()
            .expect("connection refused");
        assert!(err.is_retryable(), "{err}");
    }

    #[test]
    fn connection_states_are_transient() {
        assert!(is_transient_state("08006"));
        assert!(is_transient_state("40001"));
        assert!(!is_transient_state("42P01"));
        assert!(!is_transient_state("23505"));
    }
}
