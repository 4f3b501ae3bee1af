//! Transaction embedding index (brute-force cosine scan)

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;

use super::{format_datetime, uuid_column, Database};
use crate::error::Result;
use crate::models::{CategoryId, OrganizationId, SimilarityMatch, TransactionId};
use crate::repository::EmbeddingIndex;
use crate::similarity::cosine_similarity;

fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl Database {
    pub fn save_embedding(
        &self,
        organization_id: OrganizationId,
        transaction_id: TransactionId,
        category_id: CategoryId,
        text: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO transaction_embeddings (transaction_id, organization_id, category_id, text, dimensions, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(transaction_id) DO UPDATE SET
                category_id = excluded.category_id,
                text = excluded.text,
                dimensions = excluded.dimensions,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
            params![
                transaction_id.to_string(),
                organization_id.to_string(),
                category_id,
                text,
                embedding.len() as i64,
                f32_vec_to_bytes(embedding),
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn search_embeddings(
        &self,
        organization_id: OrganizationId,
        query: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityMatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT transaction_id, category_id, text, embedding FROM transaction_embeddings \
             WHERE organization_id = ? AND dimensions = ?",
        )?;
        let rows = stmt
            .query_map(
                params![organization_id.to_string(), query.len() as i64],
                |row| {
                    let blob: Vec<u8> = row.get(3)?;
                    Ok((
                        uuid_column(row.get(0)?, 0)?,
                        row.get::<_, CategoryId>(1)?,
                        row.get::<_, String>(2)?,
                        bytes_to_f32_vec(&blob),
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut matches: Vec<SimilarityMatch> = rows
            .into_iter()
            .map(|(transaction_id, category_id, text, embedding)| SimilarityMatch {
                transaction_id,
                category_id,
                similarity: cosine_similarity(query, &embedding),
                text,
            })
            .filter(|m| m.similarity >= threshold)
            .collect();

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn delete_embeddings(&self, organization_id: OrganizationId) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM transaction_embeddings WHERE organization_id = ?",
            params![organization_id.to_string()],
        )?;
        Ok(deleted)
    }

    pub fn count_embeddings(&self, organization_id: OrganizationId) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transaction_embeddings WHERE organization_id = ?",
            params![organization_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl EmbeddingIndex for Database {
    async fn upsert_embedding(
        &self,
        organization_id: OrganizationId,
        transaction_id: TransactionId,
        category_id: CategoryId,
        text: &str,
        embedding: &[f32],
    ) -> Result<()> {
        self.save_embedding(organization_id, transaction_id, category_id, text, embedding)
    }

    async fn search(
        &self,
        organization_id: OrganizationId,
        embedding: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarityMatch>> {
        self.search_embeddings(organization_id, embedding, threshold, limit)
    }

    async fn clear_index(&self, organization_id: OrganizationId) -> Result<usize> {
        self.delete_embeddings(organization_id)
    }

    async fn index_size(&self, organization_id: OrganizationId) -> Result<usize> {
        self.count_embeddings(organization_id)
    }
}
