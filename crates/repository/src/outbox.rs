//! Shared outbox engine. Every service owns an identically-shaped outbox
//! table; the Postgres half is parameterized by table name, the memory half
//! backs the test stores.

use chrono::Utc;
use model::{OutboxMessage, OutboxStatus};
use tokio_postgres::{Client, Row, Transaction};

use crate::StoreError;

/// Postgres outbox operations against one named table.
pub(crate) struct PgOutboxTable {
    table: &'static str,
}

impl PgOutboxTable {
    pub(crate) const fn new(table: &'static str) -> Self {
        Self { table }
    }

    /// Inserts a PENDING row inside the caller's transaction.
    pub(crate) async fn insert(
        &self,
        tx: &Transaction<'_>,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let query = format!("INSERT INTO {} (content) VALUES ($1)", self.table);
        tx.execute(query.as_str(), &[&content]).await?;
        Ok(())
    }

    pub(crate) async fn pending(
        &self,
        client: &Client,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let query = format!(
            "SELECT id, content, status, created_at, updated_at
             FROM {} WHERE status = 'PENDING' ORDER BY id ASC LIMIT $1",
            self.table
        );
        let rows = client.query(query.as_str(), &[&limit]).await?;
        rows.iter().map(row_to_outbox).collect()
    }

    pub(crate) async fn mark_done(&self, client: &Client, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let query = format!(
            "UPDATE {} SET status = 'DONE', updated_at = now() WHERE id = ANY($1)",
            self.table
        );
        client.execute(query.as_str(), &[&ids]).await?;
        Ok(())
    }

    pub(crate) async fn count(&self, client: &Client) -> Result<i64, StoreError> {
        let query = format!("SELECT count(*) FROM {}", self.table);
        let row = client.query_one(query.as_str(), &[]).await?;
        Ok(row.get(0))
    }
}

fn row_to_outbox(row: &Row) -> Result<OutboxMessage, StoreError> {
    let status: String = row.get("status");
    Ok(OutboxMessage {
        id: row.get("id"),
        content: row.get("content"),
        status: status
            .parse::<OutboxStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Memory counterpart, embedded in each memory store's state.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemOutbox {
    next_id: i64,
    rows: Vec<OutboxMessage>,
}

impl MemOutbox {
    pub(crate) fn insert(&mut self, content: Vec<u8>) {
        self.next_id += 1;
        let now = Utc::now();
        self.rows.push(OutboxMessage {
            id: self.next_id,
            content,
            status: OutboxStatus::Pending,
            created_at: now,
            updated_at: now,
        });
    }

    pub(crate) fn pending(&self, limit: i64) -> Vec<OutboxMessage> {
        self.rows
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .take(limit.max(0) as usize)
            .cloned()
            .collect()
    }

    pub(crate) fn mark_done(&mut self, ids: &[i64]) {
        let now = Utc::now();
        for row in &mut self.rows {
            if ids.contains(&row.id) {
                row.status = OutboxStatus::Done;
                row.updated_at = now;
            }
        }
    }

    pub(crate) fn count(&self) -> i64 {
        self.rows.len() as i64
    }
}
