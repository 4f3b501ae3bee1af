//! Category operations

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use super::{uuid_column, Database};
use crate::error::Result;
use crate::models::{Category, CategoryId, OrganizationId};
use crate::repository::CategoryRepository;

fn row_to_category(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        organization_id: uuid_column(row.get(1)?, 1)?,
        name: row.get(2)?,
        parent_id: row.get(3)?,
        color: row.get(4)?,
        icon: row.get(5)?,
    })
}

impl Database {
    /// Create a category (or return the existing one with the same name)
    pub fn create_category(
        &self,
        organization_id: OrganizationId,
        name: &str,
        parent_id: Option<CategoryId>,
    ) -> Result<Category> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO categories (organization_id, name, parent_id) VALUES (?, ?, ?)",
            params![organization_id.to_string(), name.trim(), parent_id],
        )?;
        let category = conn.query_row(
            "SELECT id, organization_id, name, parent_id, color, icon FROM categories WHERE organization_id = ? AND name = ?",
            params![organization_id.to_string(), name.trim()],
            row_to_category,
        )?;
        Ok(category)
    }

    pub fn get_categories(&self, organization_id: OrganizationId) -> Result<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, name, parent_id, color, icon FROM categories WHERE organization_id = ? ORDER BY name",
        )?;
        let categories = stmt
            .query_map(params![organization_id.to_string()], row_to_category)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }

    /// Case-insensitive lookup by name
    pub fn get_category_by_name(
        &self,
        organization_id: OrganizationId,
        name: &str,
    ) -> Result<Option<Category>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                "SELECT id, organization_id, name, parent_id, color, icon FROM categories WHERE organization_id = ? AND name = ? COLLATE NOCASE",
                params![organization_id.to_string(), name.trim()],
                row_to_category,
            )
            .optional()?;
        Ok(category)
    }
}

#[async_trait]
impl CategoryRepository for Database {
    async fn list_categories(&self, organization_id: OrganizationId) -> Result<Vec<Category>> {
        self.get_categories(organization_id)
    }
}
