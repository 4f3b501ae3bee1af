//! Transaction operations

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{date_column, format_datetime, uuid_column, Database};
use crate::error::Result;
use crate::models::{
    CategorizationMetadata, CategorizationStats, CategoryId, NewTransaction, OrganizationId,
    Transaction, TransactionId,
};
use crate::repository::TransactionRepository;

const TX_COLUMNS: &str = "id, organization_id, account_name, amount, merchant_name, description, \
                          date, category_id, categorization_metadata";

fn row_to_transaction(row: &Row) -> rusqlite::Result<Transaction> {
    let metadata_json: Option<String> = row.get(8)?;
    let metadata = metadata_json
        .map(|json| {
            serde_json::from_str::<CategorizationMetadata>(&json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))
        })
        .transpose()?;

    Ok(Transaction {
        id: uuid_column(row.get(0)?, 0)?,
        organization_id: uuid_column(row.get(1)?, 1)?,
        account_name: row.get(2)?,
        amount: row.get(3)?,
        merchant_name: row.get(4)?,
        description: row.get(5)?,
        date: date_column(row.get(6)?, 6)?,
        category_id: row.get(7)?,
        metadata,
    })
}

impl Database {
    /// Insert a new transaction, returning it with its generated id
    pub fn insert_transaction(&self, tx: &NewTransaction) -> Result<Transaction> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();

        conn.execute(
            r#"
            INSERT INTO transactions (id, organization_id, account_name, amount, merchant_name, description, date)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                id.to_string(),
                tx.organization_id.to_string(),
                tx.account_name,
                tx.amount,
                tx.merchant_name,
                tx.description,
                tx.date.to_string(),
            ],
        )?;

        Ok(Transaction {
            id,
            organization_id: tx.organization_id,
            account_name: tx.account_name.clone(),
            amount: tx.amount,
            merchant_name: tx.merchant_name.clone(),
            description: tx.description.clone(),
            date: tx.date,
            category_id: None,
            metadata: None,
        })
    }

    pub fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM transactions WHERE id = ?", TX_COLUMNS);
        let tx = conn
            .query_row(&sql, params![id.to_string()], row_to_transaction)
            .optional()?;
        Ok(tx)
    }

    /// List an organization's transactions, newest first
    pub fn list_transactions(
        &self,
        organization_id: OrganizationId,
        uncategorized_only: bool,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let filter = if uncategorized_only {
            "AND category_id IS NULL"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM transactions WHERE organization_id = ? {} ORDER BY date DESC, rowid DESC LIMIT ?",
            TX_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![organization_id.to_string(), limit as i64],
                row_to_transaction,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_transactions(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM transactions WHERE {}", TX_COLUMNS, where_clause);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, row_to_transaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_transaction_category(
        &self,
        id: TransactionId,
        category_id: CategoryId,
        metadata: &CategorizationMetadata,
    ) -> Result<()> {
        let conn = self.conn()?;
        let metadata_json = serde_json::to_string(metadata)?;
        let updated = conn.execute(
            r#"
            UPDATE transactions
            SET category_id = ?, categorization_metadata = ?, categorized_at = ?
            WHERE id = ?
            "#,
            params![
                category_id,
                metadata_json,
                format_datetime(&Utc::now()),
                id.to_string()
            ],
        )?;
        if updated == 0 {
            return Err(crate::error::Error::NotFound(format!("transaction {}", id)));
        }
        Ok(())
    }

    /// Like [`Database::set_transaction_category`], but leaves a user-corrected
    /// transaction alone. Returns false when the correction won.
    pub fn set_transaction_category_unless_corrected(
        &self,
        id: TransactionId,
        category_id: CategoryId,
        metadata: &CategorizationMetadata,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let metadata_json = serde_json::to_string(metadata)?;
        let updated = conn.execute(
            r#"
            UPDATE transactions
            SET category_id = ?, categorization_metadata = ?, categorized_at = ?
            WHERE id = ?
              AND json_extract(categorization_metadata, '$.user_corrected') IS NOT 1
            "#,
            params![
                category_id,
                metadata_json,
                format_datetime(&Utc::now()),
                id.to_string()
            ],
        )?;
        if updated > 0 {
            return Ok(true);
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM transactions WHERE id = ?)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(crate::error::Error::NotFound(format!("transaction {}", id)));
        }
        Ok(false)
    }

    pub fn get_categorization_stats(
        &self,
        organization_id: OrganizationId,
    ) -> Result<CategorizationStats> {
        let transactions = self.query_transactions(
            "organization_id = ?",
            params![organization_id.to_string()],
        )?;

        let mut stats = CategorizationStats {
            total: transactions.len() as i64,
            ..Default::default()
        };
        let mut by_method: BTreeMap<String, i64> = BTreeMap::new();
        let mut confidence_sum = 0.0;
        let mut confidence_count = 0;

        for tx in &transactions {
            if !tx.is_categorized() {
                stats.uncategorized += 1;
                continue;
            }
            stats.categorized += 1;
            let Some(metadata) = &tx.metadata else {
                continue;
            };
            if metadata.user_corrected {
                stats.user_corrected += 1;
            }
            if metadata.needs_review {
                stats.needs_review += 1;
            }
            if let Some(method) = metadata.method {
                *by_method.entry(method.as_str().to_string()).or_default() += 1;
            }
            if let Some(confidence) = metadata.confidence_score {
                confidence_sum += confidence;
                confidence_count += 1;
            }
        }

        stats.by_method = by_method;
        if confidence_count > 0 {
            stats.avg_confidence = Some(confidence_sum / confidence_count as f64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl TransactionRepository for Database {
    async fn get_by_id(&self, id: TransactionId) -> Result<Option<Transaction>> {
        self.get_transaction(id)
    }

    async fn get_by_ids(&self, ids: &[TransactionId]) -> Result<Vec<Transaction>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tx) = self.get_transaction(*id)? {
                found.push(tx);
            }
        }
        Ok(found)
    }

    async fn get_by_date_range(
        &self,
        organization_id: OrganizationId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Transaction>> {
        self.query_transactions(
            "organization_id = ? AND date >= ? AND date <= ? ORDER BY date, rowid",
            params![organization_id.to_string(), start.to_string(), end.to_string()],
        )
    }

    async fn get_uncategorized(&self, organization_id: OrganizationId) -> Result<Vec<Transaction>> {
        self.query_transactions(
            "organization_id = ? AND category_id IS NULL ORDER BY date, rowid",
            params![organization_id.to_string()],
        )
    }

    async fn get_recently_categorized(
        &self,
        organization_id: OrganizationId,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.query_transactions(
            "organization_id = ? AND category_id IS NOT NULL AND date >= ? \
             ORDER BY date DESC, rowid DESC LIMIT ?",
            params![organization_id.to_string(), since.to_string(), limit as i64],
        )
    }

    async fn update_categorization(
        &self,
        id: TransactionId,
        category_id: CategoryId,
        metadata: &CategorizationMetadata,
        force: bool,
    ) -> Result<bool> {
        if force {
            self.set_transaction_category(id, category_id, metadata)?;
            return Ok(true);
        }
        self.set_transaction_category_unless_corrected(id, category_id, metadata)
    }

    async fn categorization_stats(
        &self,
        organization_id: OrganizationId,
    ) -> Result<CategorizationStats> {
        self.get_categorization_stats(organization_id)
    }
}
