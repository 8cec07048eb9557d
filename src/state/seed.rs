use anyhow::Result;
use mongodb::{
    Database,
    bson::{DateTime, doc},
};
use std::time::SystemTime;

use crate::models::{Branch, Setting};

use super::SettingKey;

const COLLECTIONS: &[&str] = &[
    "branches",
    "students",
    "classes",
    "promos",
    "installment_profiles",
    "scheduled_installments",
    "invoices",
    "invoice_line_items",
    "payments",
    "class_enrollments",
    "reservations",
    "settings",
    "outbox_tasks",
];

pub(super) async fn ensure_collections(db: &Database) -> Result<()> {
    let existing = db.list_collection_names().await?;
    for name in COLLECTIONS {
        if !existing.iter().any(|c| c == name) {
            db.create_collection(*name).await?;
        }
    }
    Ok(())
}

pub(super) async fn is_database_empty(db: &Database) -> Result<bool> {
    let branches = db.collection::<Branch>("branches");
    let count = branches.estimated_document_count().await?;
    Ok(count == 0)
}

/// Write the global tier of every known setting so administrators have a
/// row to edit. Resolution would fall back to the same code defaults
/// without these, so seeding is cosmetic but keeps the settings surface
/// populated.
pub(super) async fn seed_default_settings(db: &Database) -> Result<()> {
    let settings = db.collection::<Setting>("settings");
    for key in SettingKey::ALL {
        let existing = settings
            .find_one(doc! { "key": key.as_str(), "branch_id": null })
            .await?;
        if existing.is_some() {
            continue;
        }
        settings
            .insert_one(Setting {
                id: None,
                key: key.as_str().to_string(),
                value: key.default_value(),
                branch_id: None,
                updated_at: Some(DateTime::from_system_time(SystemTime::now())),
            })
            .await?;
    }
    Ok(())
}
