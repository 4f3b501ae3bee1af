//! Categorization feedback operations

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Row};

use super::{format_datetime, parse_datetime, uuid_column, Database};
use crate::error::Result;
use crate::models::{
    CategorizationFeedback, FeedbackStats, FeedbackType, NewFeedback, OrganizationId,
    TransactionId,
};
use crate::repository::FeedbackRepository;

const FEEDBACK_COLUMNS: &str = "id, transaction_id, organization_id, old_category_id, \
                                new_category_id, feedback_type, confidence_before, method_used, created_at";

fn row_to_feedback(row: &Row) -> rusqlite::Result<CategorizationFeedback> {
    let feedback_type: String = row.get(5)?;
    let method_used: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(CategorizationFeedback {
        id: row.get(0)?,
        transaction_id: uuid_column(row.get(1)?, 1)?,
        organization_id: uuid_column(row.get(2)?, 2)?,
        old_category_id: row.get(3)?,
        new_category_id: row.get(4)?,
        feedback_type: feedback_type.parse().unwrap_or(FeedbackType::Correction),
        confidence_before: row.get(6)?,
        method_used: method_used.and_then(|m| m.parse().ok()),
        created_at: parse_datetime(&created_at),
    })
}

impl Database {
    /// Append a feedback record
    pub fn insert_feedback(&self, feedback: &NewFeedback) -> Result<CategorizationFeedback> {
        let conn = self.conn()?;
        let created_at = Utc::now();

        conn.execute(
            r#"
            INSERT INTO categorization_feedback (
                transaction_id, organization_id, old_category_id, new_category_id,
                feedback_type, confidence_before, method_used, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                feedback.transaction_id.to_string(),
                feedback.organization_id.to_string(),
                feedback.old_category_id,
                feedback.new_category_id,
                feedback.feedback_type.as_str(),
                feedback.confidence_before,
                feedback.method_used.map(|m| m.as_str()),
                format_datetime(&created_at),
            ],
        )?;

        Ok(CategorizationFeedback {
            id: conn.last_insert_rowid(),
            transaction_id: feedback.transaction_id,
            organization_id: feedback.organization_id,
            old_category_id: feedback.old_category_id,
            new_category_id: feedback.new_category_id,
            feedback_type: feedback.feedback_type,
            confidence_before: feedback.confidence_before,
            method_used: feedback.method_used,
            created_at,
        })
    }

    /// Most recent feedback first
    pub fn get_feedback_for_org(
        &self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<CategorizationFeedback>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM categorization_feedback WHERE organization_id = ? ORDER BY id DESC LIMIT ?",
            FEEDBACK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let feedback = stmt
            .query_map(
                params![organization_id.to_string(), limit as i64],
                row_to_feedback,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(feedback)
    }

    pub fn get_feedback_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<CategorizationFeedback>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM categorization_feedback WHERE transaction_id = ? ORDER BY id",
            FEEDBACK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let feedback = stmt
            .query_map(params![transaction_id.to_string()], row_to_feedback)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(feedback)
    }

    pub fn get_feedback_stats(&self, organization_id: OrganizationId) -> Result<FeedbackStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN feedback_type = 'correction' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN feedback_type = 'confirmation' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN feedback_type = 'rejection' THEN 1 ELSE 0 END), 0),
                AVG(confidence_before)
            FROM categorization_feedback
            WHERE organization_id = ?
            "#,
            params![organization_id.to_string()],
            |row| {
                Ok(FeedbackStats {
                    total: row.get(0)?,
                    corrections: row.get(1)?,
                    confirmations: row.get(2)?,
                    rejections: row.get(3)?,
                    avg_confidence_before: row.get(4)?,
                })
            },
        )?;
        Ok(stats)
    }
}

#[async_trait]
impl FeedbackRepository for Database {
    async fn create_feedback(&self, feedback: &NewFeedback) -> Result<CategorizationFeedback> {
        self.insert_feedback(feedback)
    }

    async fn list_feedback(
        &self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<CategorizationFeedback>> {
        self.get_feedback_for_org(organization_id, limit)
    }

    async fn list_feedback_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<CategorizationFeedback>> {
        self.get_feedback_for_transaction(transaction_id)
    }

    async fn feedback_stats(&self, organization_id: OrganizationId) -> Result<FeedbackStats> {
        self.get_feedback_stats(organization_id)
    }
}
