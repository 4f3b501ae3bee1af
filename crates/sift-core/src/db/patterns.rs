//! Merchant pattern cache operations

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_datetime, parse_datetime, uuid_column, Database};
use crate::error::Result;
use crate::models::{CategoryId, OrganizationId, PatternCacheEntry, SimilarPattern};
use crate::patterns::trigram_similarity;
use crate::repository::PatternRepository;

const PATTERN_COLUMNS: &str =
    "id, organization_id, merchant_pattern, category_id, confidence, usage_count, last_used_at, created_at";

fn row_to_pattern(row: &Row) -> rusqlite::Result<PatternCacheEntry> {
    let last_used_at: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(PatternCacheEntry {
        id: row.get(0)?,
        organization_id: uuid_column(row.get(1)?, 1)?,
        merchant_pattern: row.get(2)?,
        category_id: row.get(3)?,
        confidence: row.get(4)?,
        usage_count: row.get(5)?,
        last_used_at: parse_datetime(&last_used_at),
        created_at: parse_datetime(&created_at),
    })
}

/// Stored patterns are trimmed and uppercase
fn pattern_key(pattern: &str) -> String {
    pattern.trim().to_uppercase()
}

fn select_pattern(
    conn: &Connection,
    organization_id: OrganizationId,
    key: &str,
) -> rusqlite::Result<Option<PatternCacheEntry>> {
    let sql = format!(
        "SELECT {} FROM merchant_patterns WHERE organization_id = ? AND merchant_pattern = ?",
        PATTERN_COLUMNS
    );
    conn.query_row(&sql, params![organization_id.to_string(), key], row_to_pattern)
        .optional()
}

impl Database {
    pub fn get_patterns(&self, organization_id: OrganizationId) -> Result<Vec<PatternCacheEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM merchant_patterns WHERE organization_id = ? ORDER BY usage_count DESC, merchant_pattern",
            PATTERN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let patterns = stmt
            .query_map(params![organization_id.to_string()], row_to_pattern)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(patterns)
    }

    pub fn get_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
    ) -> Result<Option<PatternCacheEntry>> {
        let conn = self.conn()?;
        Ok(select_pattern(&conn, organization_id, &pattern_key(pattern))?)
    }

    /// Insert or merge a pattern.
    ///
    /// Existing rows get `usage_count + 1` and a fresh `last_used_at`. With `overwrite`
    /// the category and confidence are replaced, otherwise the category is kept and
    /// confidence only ever grows.
    pub fn merge_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
        category_id: CategoryId,
        confidence: f64,
        overwrite: bool,
    ) -> Result<PatternCacheEntry> {
        let key = pattern_key(pattern);
        let now = format_datetime(&Utc::now());
        let conn = self.conn()?;

        let on_conflict = if overwrite {
            "category_id = excluded.category_id, confidence = excluded.confidence"
        } else {
            "confidence = MAX(confidence, excluded.confidence)"
        };
        let sql = format!(
            r#"
            INSERT INTO merchant_patterns (organization_id, merchant_pattern, category_id, confidence, usage_count, last_used_at, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
            ON CONFLICT(organization_id, merchant_pattern) DO UPDATE SET
                usage_count = usage_count + 1,
                last_used_at = excluded.last_used_at,
                {}
            "#,
            on_conflict
        );
        conn.execute(
            &sql,
            params![organization_id.to_string(), key, category_id, confidence, now],
        )?;

        select_pattern(&conn, organization_id, &key)?.ok_or_else(|| {
            crate::error::Error::NotFound(format!("pattern {} after upsert", key))
        })
    }

    pub fn delete_patterns(&self, organization_id: OrganizationId) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM merchant_patterns WHERE organization_id = ?",
            params![organization_id.to_string()],
        )?;
        Ok(deleted)
    }
}

#[async_trait]
impl PatternRepository for Database {
    async fn list_patterns(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<PatternCacheEntry>> {
        self.get_patterns(organization_id)
    }

    async fn find_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
    ) -> Result<Option<PatternCacheEntry>> {
        self.get_pattern(organization_id, pattern)
    }

    async fn get_similar(
        &self,
        organization_id: OrganizationId,
        merchant: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarPattern>> {
        let mut similar: Vec<SimilarPattern> = self
            .get_patterns(organization_id)?
            .into_iter()
            .map(|entry| {
                let similarity = trigram_similarity(merchant, &entry.merchant_pattern);
                SimilarPattern { entry, similarity }
            })
            .filter(|p| p.similarity >= threshold)
            .collect();

        similar.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        similar.truncate(limit);
        Ok(similar)
    }

    async fn upsert_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
        category_id: CategoryId,
        confidence: f64,
    ) -> Result<PatternCacheEntry> {
        self.merge_pattern(organization_id, pattern, category_id, confidence, false)
    }

    async fn replace_pattern(
        &self,
        organization_id: OrganizationId,
        pattern: &str,
        category_id: CategoryId,
        confidence: f64,
    ) -> Result<PatternCacheEntry> {
        self.merge_pattern(organization_id, pattern, category_id, confidence, true)
    }

    async fn clear_patterns(&self, organization_id: OrganizationId) -> Result<usize> {
        self.delete_patterns(organization_id)
    }
}
