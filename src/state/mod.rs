// state module: AppState, initialization, and re-exports of submodules.

use anyhow::Result;
use mongodb::{Client, Collection};
use std::env;

use crate::models::{
    Branch, ClassEnrollment, ClassGroup, InstallmentProfile, Invoice, InvoiceLineItem, OutboxTask,
    Payment, Promo, Reservation, ScheduledInstallment, Setting, Student,
};

mod seed;
mod catalog;
mod settings;
mod ledger;
mod billing;
mod enrollment;
mod delinquency;
mod settlement;

pub use catalog::*;
pub use settings::*;
pub use ledger::*;
pub use billing::*;
pub use enrollment::*;
pub use delinquency::*;
pub use settlement::*;

/// Generated installment invoices fall due this many days after issue.
pub const DUE_DATE_OFFSET_DAYS: i64 = 7;

/// Actor recorded on system-driven enrollment removals.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Clone)]
pub struct AppState {
    pub client: Client,
    pub branches: Collection<Branch>,
    pub students: Collection<Student>,
    pub classes: Collection<ClassGroup>,
    pub promos: Collection<Promo>,
    pub installment_profiles: Collection<InstallmentProfile>,
    pub scheduled_installments: Collection<ScheduledInstallment>,
    pub invoices: Collection<Invoice>,
    pub invoice_line_items: Collection<InvoiceLineItem>,
    pub payments: Collection<Payment>,
    pub class_enrollments: Collection<ClassEnrollment>,
    pub reservations: Collection<Reservation>,
    pub settings: Collection<Setting>,
    pub outbox_tasks: Collection<OutboxTask>,
}

pub async fn init_state() -> Result<AppState> {
    let uri = env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let db_name = env::var("MONGODB_DB").unwrap_or_else(|_| "matricula".to_string());

    let client = Client::with_uri_str(uri).await?;
    let db = client.database(&db_name);

    seed::ensure_collections(&db).await?;

    // Only seed when the database is effectively empty (no branches).
    if seed::is_database_empty(&db).await? {
        seed::seed_default_settings(&db).await?;
    }

    Ok(AppState {
        client,
        branches: db.collection::<Branch>("branches"),
        students: db.collection::<Student>("students"),
        classes: db.collection::<ClassGroup>("classes"),
        promos: db.collection::<Promo>("promos"),
        installment_profiles: db.collection::<InstallmentProfile>("installment_profiles"),
        scheduled_installments: db.collection::<ScheduledInstallment>("scheduled_installments"),
        invoices: db.collection::<Invoice>("invoices"),
        invoice_line_items: db.collection::<InvoiceLineItem>("invoice_line_items"),
        payments: db.collection::<Payment>("payments"),
        class_enrollments: db.collection::<ClassEnrollment>("class_enrollments"),
        reservations: db.collection::<Reservation>("reservations"),
        settings: db.collection::<Setting>("settings"),
        outbox_tasks: db.collection::<OutboxTask>("outbox_tasks"),
    })
}
