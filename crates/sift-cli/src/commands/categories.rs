//! Category command implementations

use anyhow::Result;
use sift_core::db::Database;
use sift_core::models::OrganizationId;

use super::resolve_category;

pub fn cmd_categories_list(db: &Database, org: OrganizationId) -> Result<()> {
    let categories = db.get_categories(org)?;

    if categories.is_empty() {
        println!("No categories found. Run 'sift init' to seed default categories.");
        return Ok(());
    }

    println!();
    println!("🗂️  Categories");
    println!("   ─────────────────────────────────────────────────────────────");

    for category in categories.iter().filter(|c| c.parent_id.is_none()) {
        println!("   {:>4} │ {}", category.id, category.name);
        for child in categories.iter().filter(|c| c.parent_id == Some(category.id)) {
            println!("   {:>4} │   • {}", child.id, child.name);
        }
    }

    Ok(())
}

pub fn cmd_categories_add(
    db: &Database,
    org: OrganizationId,
    name: &str,
    parent: Option<&str>,
) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Category name cannot be empty");
    }
    let parent_id = parent
        .map(|p| resolve_category(db, org, p))
        .transpose()?;

    let category = db.create_category(org, name, parent_id)?;
    println!("✅ Category '{}' (id: {})", category.name, category.id);

    Ok(())
}
