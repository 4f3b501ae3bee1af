//! LLM batch audit trail

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::params;

use super::{format_datetime, parse_datetime, uuid_column, Database};
use crate::error::Result;
use crate::models::{LlmBatch, NewLlmBatch, OrganizationId};
use crate::repository::LlmBatchRepository;

impl Database {
    pub fn insert_llm_batch(&self, batch: &NewLlmBatch) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO llm_batches (
                organization_id, transaction_count, input_tokens, output_tokens, total_cost,
                model, success_rate, avg_confidence, processing_time_ms, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                batch.organization_id.to_string(),
                batch.transaction_count,
                batch.input_tokens,
                batch.output_tokens,
                batch.total_cost,
                batch.model,
                batch.success_rate,
                batch.avg_confidence,
                batch.processing_time_ms,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent batches first
    pub fn get_llm_batches(
        &self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<LlmBatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, organization_id, transaction_count, input_tokens, output_tokens, total_cost,
                   model, success_rate, avg_confidence, processing_time_ms, created_at
            FROM llm_batches WHERE organization_id = ? ORDER BY id DESC LIMIT ?
            "#,
        )?;
        let batches = stmt
            .query_map(params![organization_id.to_string(), limit as i64], |row| {
                let created_at: String = row.get(10)?;
                Ok(LlmBatch {
                    id: row.get(0)?,
                    organization_id: uuid_column(row.get(1)?, 1)?,
                    transaction_count: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                    total_cost: row.get(5)?,
                    model: row.get(6)?,
                    success_rate: row.get(7)?,
                    avg_confidence: row.get(8)?,
                    processing_time_ms: row.get(9)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    /// Total LLM spend and call count for batches created on days in [start, end]
    pub fn llm_cost_summary(
        &self,
        organization_id: OrganizationId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(f64, i64)> {
        let conn = self.conn()?;
        let summary = conn.query_row(
            r#"
            SELECT COALESCE(SUM(total_cost), 0.0), COUNT(*)
            FROM llm_batches
            WHERE organization_id = ? AND date(created_at) >= ? AND date(created_at) <= ?
            "#,
            params![organization_id.to_string(), start.to_string(), end.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(summary)
    }
}

#[async_trait]
impl LlmBatchRepository for Database {
    async fn create_batch(&self, batch: &NewLlmBatch) -> Result<i64> {
        self.insert_llm_batch(batch)
    }

    async fn list_batches(
        &self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<LlmBatch>> {
        self.get_llm_batches(organization_id, limit)
    }
}
