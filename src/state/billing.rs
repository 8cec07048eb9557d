// Installment profiles, invoices, and the recurring generation engine.

use anyhow::{Context, Result, bail};
use chrono::{DateTime as ChronoDateTime, Datelike, Duration, Months, Utc};
use futures::stream::TryStreamExt;
use mongodb::ClientSession;
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use serde::Serialize;
use std::time::SystemTime;
use uuid::Uuid;

use crate::models::{
    InstallmentProfile, Invoice, InvoiceLineItem, InvoiceStatus, Promo, PromoScope, PromoType,
    ScheduleStatus, ScheduledInstallment, TaskStatus,
};

use super::{AppState, DUE_DATE_OFFSET_DAYS, LedgerTotals, round2};

/// One line of a new invoice, before it has an id.
#[derive(Debug, Clone)]
pub struct LineItemSpec {
    pub description: String,
    pub amount: f64,
    pub discount_amount: f64,
    pub penalty_amount: f64,
    pub tax_percentage: f64,
}

impl LineItemSpec {
    pub fn charge(description: &str, amount: f64) -> LineItemSpec {
        LineItemSpec {
            description: description.to_string(),
            amount,
            discount_amount: 0.0,
            penalty_amount: 0.0,
            tax_percentage: 0.0,
        }
    }

    pub fn discount(description: &str, discount_amount: f64) -> LineItemSpec {
        LineItemSpec {
            description: description.to_string(),
            amount: 0.0,
            discount_amount,
            penalty_amount: 0.0,
            tax_percentage: 0.0,
        }
    }

    pub fn merchandise(description: &str) -> LineItemSpec {
        LineItemSpec {
            description: description.to_string(),
            amount: 0.0,
            discount_amount: 0.0,
            penalty_amount: 0.0,
            tax_percentage: 0.0,
        }
    }
}

/// Discount and merchandise a promo grants against a base amount.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromoGrant {
    pub discount: f64,
    pub merchandise: Vec<String>,
}

impl PromoGrant {
    pub fn granted_anything(&self) -> bool {
        self.discount > 0.0 || !self.merchandise.is_empty()
    }
}

/// Compute what a promo yields on `base`. The discount is clamped to
/// 0..=base so an invoice amount can never go negative.
pub fn promo_grant(promo: &Promo, base: f64) -> PromoGrant {
    let percentage = promo.percentage.unwrap_or(0.0);
    let fixed = promo.fixed_amount.unwrap_or(0.0);

    let (raw_discount, merchandise) = match promo.promo_type {
        PromoType::PercentageDiscount => (base * percentage / 100.0, Vec::new()),
        PromoType::FixedDiscount => (fixed, Vec::new()),
        PromoType::Combined => (
            base * percentage / 100.0 + fixed,
            promo.merchandise_items.clone(),
        ),
        PromoType::FreeMerchandise => (0.0, promo.merchandise_items.clone()),
    };

    PromoGrant {
        discount: round2(raw_discount.clamp(0.0, base)),
        merchandise,
    }
}

/// Number of months in one billing cycle. Accepts the stored forms
/// "1 month(s)", "3 months", "monthly", "quarterly", "yearly"; anything
/// unrecognized falls back to one month.
pub fn frequency_months(frequency: &str) -> u32 {
    let lowered = frequency.trim().to_lowercase();
    match lowered.as_str() {
        "monthly" => return 1,
        "quarterly" => return 3,
        "yearly" | "annually" => return 12,
        _ => {}
    }
    let digits: String = lowered.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0).unwrap_or(1)
}

/// "YYYY-MM" of the cycle a generation date bills.
pub fn invoice_month(date: ChronoDateTime<Utc>) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

pub(super) fn add_months(date: ChronoDateTime<Utc>, months: u32) -> Result<ChronoDateTime<Utc>> {
    date.checked_add_months(Months::new(months))
        .context("date overflow while advancing the schedule")
}

fn next_invoice_number() -> String {
    format!("INV-{}", Uuid::new_v4().simple())
}

pub async fn get_installment_profile_by_id(
    state: &AppState,
    id: &ObjectId,
) -> Result<Option<InstallmentProfile>> {
    state
        .installment_profiles
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

pub async fn get_invoice_by_id(state: &AppState, id: &ObjectId) -> Result<Option<Invoice>> {
    state
        .invoices
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

pub async fn get_schedule_for_profile(
    state: &AppState,
    profile_id: &ObjectId,
) -> Result<Option<ScheduledInstallment>> {
    state
        .scheduled_installments
        .find_one(doc! { "profile_id": profile_id })
        .await
        .map_err(Into::into)
}

pub async fn list_invoice_line_items(
    state: &AppState,
    invoice_id: &ObjectId,
) -> Result<Vec<InvoiceLineItem>> {
    let mut cursor = state
        .invoice_line_items
        .find(doc! { "invoice_id": invoice_id })
        .await?;
    let mut items = Vec::new();
    while let Some(item) = cursor.try_next().await? {
        items.push(item);
    }
    Ok(items)
}

pub async fn list_invoices_for_profile(
    state: &AppState,
    profile_id: &ObjectId,
) -> Result<Vec<Invoice>> {
    let mut cursor = state
        .invoices
        .find(doc! { "installment_profile_id": profile_id })
        .await?;
    let mut items = Vec::new();
    while let Some(invoice) = cursor.try_next().await? {
        items.push(invoice);
    }
    Ok(items)
}

/// Insert an invoice and its line items; the stored amount starts at the
/// ledger-derived original.
pub(super) async fn insert_invoice(
    state: &AppState,
    mut session: Option<&mut ClientSession>,
    branch_id: &ObjectId,
    student_id: &ObjectId,
    description: &str,
    issue_date: DateTime,
    due_date: DateTime,
    installment_profile_id: Option<ObjectId>,
    reservation_id: Option<ObjectId>,
    remarks: Option<String>,
    items: &[LineItemSpec],
) -> Result<ObjectId> {
    let now = DateTime::from_system_time(SystemTime::now());
    let staged: Vec<InvoiceLineItem> = items
        .iter()
        .map(|spec| InvoiceLineItem {
            id: None,
            invoice_id: ObjectId::new(), // replaced below
            description: spec.description.clone(),
            amount: spec.amount,
            discount_amount: spec.discount_amount,
            penalty_amount: spec.penalty_amount,
            tax_percentage: spec.tax_percentage,
            created_at: Some(now),
        })
        .collect();
    let totals = LedgerTotals::from_parts(&staged, &[]);

    let invoice = Invoice {
        id: None,
        number: next_invoice_number(),
        branch_id: branch_id.clone(),
        student_id: student_id.clone(),
        description: description.to_string(),
        amount: totals.original,
        status: InvoiceStatus::Unpaid,
        issue_date,
        due_date,
        installment_profile_id,
        reservation_id,
        late_penalty_applied_for_due_date: None,
        remarks,
        created_at: Some(now),
        updated_at: None,
    };
    let res = match session.as_deref_mut() {
        Some(session) => state.invoices.insert_one(invoice).session(session).await?,
        None => state.invoices.insert_one(invoice).await?,
    };
    let invoice_id = res
        .inserted_id
        .as_object_id()
        .context("invoice insert missing _id")?;

    for mut item in staged {
        item.invoice_id = invoice_id.clone();
        match session.as_deref_mut() {
            Some(session) => {
                state
                    .invoice_line_items
                    .insert_one(item)
                    .session(session)
                    .await?
            }
            None => state.invoice_line_items.insert_one(item).await?,
        };
    }
    Ok(invoice_id)
}

pub async fn create_invoice(
    state: &AppState,
    branch_id: &ObjectId,
    student_id: &ObjectId,
    description: &str,
    issue_date: DateTime,
    due_date: DateTime,
    installment_profile_id: Option<ObjectId>,
    reservation_id: Option<ObjectId>,
    remarks: Option<String>,
    items: Vec<LineItemSpec>,
) -> Result<ObjectId> {
    insert_invoice(
        state,
        None,
        branch_id,
        student_id,
        description,
        issue_date,
        due_date,
        installment_profile_id,
        reservation_id,
        remarks,
        &items,
    )
    .await
}

/// Manual terminal transition; settlement leaves Cancelled invoices alone.
pub async fn cancel_invoice(state: &AppState, invoice_id: &ObjectId) -> Result<()> {
    state
        .invoices
        .update_one(
            doc! { "_id": invoice_id },
            doc! { "$set": {
                "status": InvoiceStatus::Cancelled.as_str(),
                "updated_at": DateTime::from_system_time(SystemTime::now()),
            } },
        )
        .await?;
    Ok(())
}

/// Subscribe a student to an installment package. With a downpayment the
/// schedule stays unseeded until that invoice settles; without one the
/// first Pending schedule row is created immediately.
pub async fn create_installment_profile(
    state: &AppState,
    student_id: &ObjectId,
    branch_id: &ObjectId,
    class_id: &ObjectId,
    package_id: Option<ObjectId>,
    amount: f64,
    frequency: &str,
    total_phases: Option<i32>,
    downpayment_amount: Option<f64>,
    promo_id: Option<ObjectId>,
    promo_apply_scope: Option<PromoScope>,
    promo_months_to_apply: i32,
) -> Result<ObjectId> {
    if amount <= 0.0 {
        bail!("installment amount must be positive");
    }
    if let Some(total) = total_phases {
        if total < 1 {
            bail!("total_phases must be at least 1");
        }
    }
    if promo_id.is_some() && promo_apply_scope.is_none() {
        bail!("promo_apply_scope is required when a promo is linked");
    }

    let now = DateTime::from_system_time(SystemTime::now());
    let res = state
        .installment_profiles
        .insert_one(InstallmentProfile {
            id: None,
            student_id: student_id.clone(),
            branch_id: branch_id.clone(),
            class_id: class_id.clone(),
            package_id,
            amount,
            frequency: frequency.to_string(),
            total_phases,
            generated_count: 0,
            is_active: true,
            downpayment_paid: false,
            downpayment_invoice_id: None,
            promo_id: promo_id.clone(),
            promo_apply_scope,
            promo_months_to_apply,
            promo_months_applied: 0,
            created_at: Some(now),
            updated_at: None,
        })
        .await?;
    let profile_id = res
        .inserted_id
        .as_object_id()
        .context("installment profile insert missing _id")?;

    match downpayment_amount {
        Some(downpayment) => {
            if downpayment <= 0.0 {
                bail!("downpayment amount must be positive");
            }
            let mut items = vec![LineItemSpec::charge("Downpayment", downpayment)];
            if let (Some(promo_id), Some(scope)) = (promo_id.as_ref(), promo_apply_scope) {
                if scope.covers_downpayment() {
                    if let Some(promo) = super::get_promo_by_id(state, promo_id).await? {
                        if promo.is_active {
                            let grant = promo_grant(&promo, downpayment);
                            if grant.discount > 0.0 {
                                items.push(LineItemSpec::discount(
                                    &format!("Promo discount ({})", promo.name),
                                    grant.discount,
                                ));
                            }
                            for merch in &grant.merchandise {
                                items.push(LineItemSpec::merchandise(&format!(
                                    "Free merchandise: {merch}"
                                )));
                            }
                        }
                    }
                }
            }
            let issue = Utc::now();
            let due = issue + Duration::days(DUE_DATE_OFFSET_DAYS);
            let invoice_id = insert_invoice(
                state,
                None,
                branch_id,
                student_id,
                "Downpayment",
                DateTime::from_chrono(issue),
                DateTime::from_chrono(due),
                Some(profile_id.clone()),
                None,
                None,
                &items,
            )
            .await?;
            state
                .installment_profiles
                .update_one(
                    doc! { "_id": &profile_id },
                    doc! { "$set": {
                        "downpayment_invoice_id": &invoice_id,
                        "updated_at": DateTime::from_system_time(SystemTime::now()),
                    } },
                )
                .await?;
        }
        None => {
            seed_schedule_row(state, None, &profile_id, amount).await?;
        }
    }

    Ok(profile_id)
}

/// First schedule row of a profile: immediately due, nothing generated yet.
pub(super) async fn seed_schedule_row(
    state: &AppState,
    mut session: Option<&mut ClientSession>,
    profile_id: &ObjectId,
    amount: f64,
) -> Result<ObjectId> {
    let today = Utc::now();
    let row = ScheduledInstallment {
        id: None,
        profile_id: profile_id.clone(),
        scheduled_date: DateTime::from_chrono(today),
        status: ScheduleStatus::Pending,
        next_generation_date: DateTime::from_chrono(today),
        next_invoice_month: Some(invoice_month(today)),
        amount,
        created_at: Some(DateTime::from_system_time(SystemTime::now())),
        updated_at: None,
    };
    let res = match session.as_deref_mut() {
        Some(session) => {
            state
                .scheduled_installments
                .insert_one(row)
                .session(session)
                .await?
        }
        None => state.scheduled_installments.insert_one(row).await?,
    };
    res.inserted_id
        .as_object_id()
        .context("scheduled installment insert missing _id")
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationDetail {
    pub schedule_id: ObjectId,
    pub profile_id: ObjectId,
    pub invoice_id: Option<ObjectId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRunSummary {
    pub total_due: usize,
    pub processed: usize,
    pub errors: usize,
    pub details: Vec<GenerationDetail>,
}

/// True when a schedule row and its profile satisfy the due predicate.
/// This predicate is the engine's only idempotency guard; the scan takes
/// no lock, so overlapping job runs can double-generate (single active
/// scheduler assumed).
pub(super) fn schedule_is_due(
    schedule: &ScheduledInstallment,
    profile: &InstallmentProfile,
    today: ChronoDateTime<Utc>,
) -> bool {
    if schedule.status == ScheduleStatus::Generated {
        return false;
    }
    if schedule.next_generation_date.to_chrono() > today {
        return false;
    }
    if !profile.is_active {
        return false;
    }
    if let Some(total) = profile.total_phases {
        if profile.generated_count >= total {
            return false;
        }
    }
    if profile.downpayment_invoice_id.is_some() && !profile.downpayment_paid {
        return false;
    }
    true
}

/// Scan due schedule rows and materialize one invoice per row. Row
/// failures are isolated: the transaction of the failing row rolls back
/// and the batch moves on.
pub async fn process_due_installment_invoices(state: &AppState) -> Result<GenerationRunSummary> {
    let today = Utc::now();
    sweep_stale_outbox_tasks(state).await;

    let mut candidates = Vec::new();
    let mut cursor = state
        .scheduled_installments
        .find(doc! {
            "status": { "$ne": ScheduleStatus::Generated.as_str() },
            "next_generation_date": { "$lte": DateTime::from_chrono(today) },
        })
        .await?;
    while let Some(schedule) = cursor.try_next().await? {
        candidates.push(schedule);
    }

    let mut details = Vec::new();
    for schedule in candidates {
        let schedule_id = match schedule.id.as_ref() {
            Some(id) => id.clone(),
            None => continue,
        };
        let profile = match get_installment_profile_by_id(state, &schedule.profile_id).await? {
            Some(profile) => profile,
            None => {
                tracing::warn!(%schedule_id, "schedule row references a missing profile");
                continue;
            }
        };
        if !schedule_is_due(&schedule, &profile, today) {
            continue;
        }

        match generate_installment_for_schedule(state, &schedule_id).await {
            Ok(invoice_id) => details.push(GenerationDetail {
                schedule_id,
                profile_id: schedule.profile_id.clone(),
                invoice_id: Some(invoice_id),
                error: None,
            }),
            Err(err) => {
                tracing::warn!(%schedule_id, error = %err, "installment generation failed");
                details.push(GenerationDetail {
                    schedule_id,
                    profile_id: schedule.profile_id.clone(),
                    invoice_id: None,
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }

    let total_due = details.len();
    let errors = details.iter().filter(|d| d.error.is_some()).count();
    Ok(GenerationRunSummary {
        total_due,
        processed: total_due - errors,
        errors,
        details,
    })
}

/// Generate one invoice for one due schedule row, inside its own
/// transaction.
pub(super) async fn generate_installment_for_schedule(
    state: &AppState,
    schedule_id: &ObjectId,
) -> Result<ObjectId> {
    let mut session = state.client.start_session().await?;
    session.start_transaction().await?;
    match generate_in_txn(state, &mut session, schedule_id).await {
        Ok(invoice_id) => {
            session.commit_transaction().await?;
            // Delivery (PDF render + email) is handled by an external
            // collaborator picking the invoice up from here.
            tracing::info!(%invoice_id, "installment invoice generated");
            Ok(invoice_id)
        }
        Err(err) => {
            let _ = session.abort_transaction().await;
            Err(err)
        }
    }
}

async fn generate_in_txn(
    state: &AppState,
    session: &mut ClientSession,
    schedule_id: &ObjectId,
) -> Result<ObjectId> {
    let schedule = state
        .scheduled_installments
        .find_one(doc! { "_id": schedule_id })
        .session(&mut *session)
        .await?
        .context("schedule row not found")?;
    let profile = state
        .installment_profiles
        .find_one(doc! { "_id": &schedule.profile_id })
        .session(&mut *session)
        .await?
        .context("installment profile not found")?;
    let profile_id = profile.id.clone().context("installment profile missing _id")?;

    // Promo eligibility for this cycle.
    let mut grant = PromoGrant::default();
    let mut promo_name = String::new();
    if let (Some(promo_id), Some(scope)) = (profile.promo_id.as_ref(), profile.promo_apply_scope) {
        if scope.covers_monthly() && profile.promo_months_applied < profile.promo_months_to_apply {
            if let Some(promo) = state
                .promos
                .find_one(doc! { "_id": promo_id })
                .session(&mut *session)
                .await?
            {
                if promo.is_active {
                    grant = promo_grant(&promo, schedule.amount);
                    promo_name = promo.name;
                }
            }
        }
    }

    let issue = schedule.next_generation_date.to_chrono();
    let due = issue + Duration::days(DUE_DATE_OFFSET_DAYS);
    let month = schedule
        .next_invoice_month
        .clone()
        .unwrap_or_else(|| invoice_month(issue));

    let mut items = vec![LineItemSpec::charge(
        &format!("Tuition installment {month}"),
        schedule.amount,
    )];
    if grant.discount > 0.0 {
        items.push(LineItemSpec::discount(
            &format!("Promo discount ({promo_name})"),
            grant.discount,
        ));
    }
    for merch in &grant.merchandise {
        items.push(LineItemSpec::merchandise(&format!(
            "Free merchandise: {merch}"
        )));
    }

    let invoice_id = insert_invoice(
        state,
        Some(&mut *session),
        &profile.branch_id,
        &profile.student_id,
        &format!("Tuition installment {month}"),
        DateTime::from_chrono(issue),
        DateTime::from_chrono(due),
        Some(profile_id.clone()),
        None,
        None,
        &items,
    )
    .await?;

    if grant.granted_anything() {
        state
            .installment_profiles
            .update_one(
                doc! { "_id": &profile_id },
                doc! { "$inc": { "promo_months_applied": 1 } },
            )
            .session(&mut *session)
            .await?;
    }

    // Contract safety net: even if generated_count under-reports, never
    // bill past the number of phases already paid for.
    if let Some(total) = profile.total_phases {
        let mut paid_filter = doc! {
            "installment_profile_id": &profile_id,
            "status": InvoiceStatus::Paid.as_str(),
        };
        if let Some(downpayment_id) = profile.downpayment_invoice_id.as_ref() {
            paid_filter.insert("_id", doc! { "$ne": downpayment_id });
        }
        let paid_phases = state
            .invoices
            .count_documents(paid_filter)
            .session(&mut *session)
            .await?;
        if paid_phases >= total as u64 {
            bail!(
                "profile {profile_id} already has {paid_phases} paid phases of {total}; refusing to generate"
            );
        }
    }

    let now = DateTime::from_system_time(SystemTime::now());
    let new_count = profile.generated_count + 1;
    let reached_limit = profile
        .total_phases
        .map(|total| new_count >= total)
        .unwrap_or(false);

    if reached_limit {
        state
            .installment_profiles
            .update_one(
                doc! { "_id": &profile_id },
                doc! { "$set": {
                    "generated_count": new_count,
                    "is_active": false,
                    "updated_at": now,
                } },
            )
            .session(&mut *session)
            .await?;
        state
            .scheduled_installments
            .update_one(
                doc! { "_id": schedule_id },
                doc! { "$set": {
                    "status": ScheduleStatus::Generated.as_str(),
                    "updated_at": now,
                } },
            )
            .session(&mut *session)
            .await?;
    } else {
        let next = add_months(issue, frequency_months(&profile.frequency))?;
        state
            .installment_profiles
            .update_one(
                doc! { "_id": &profile_id },
                doc! { "$set": { "generated_count": new_count, "updated_at": now } },
            )
            .session(&mut *session)
            .await?;
        state
            .scheduled_installments
            .update_one(
                doc! { "_id": schedule_id },
                doc! { "$set": {
                    "status": ScheduleStatus::Scheduled.as_str(),
                    "next_generation_date": DateTime::from_chrono(next),
                    "next_invoice_month": invoice_month(next),
                    "updated_at": now,
                } },
            )
            .session(&mut *session)
            .await?;
    }

    Ok(invoice_id)
}

/// Outbox rows left Pending by a crashed payment writer are already
/// covered by the due-row scan; close them out so they do not linger.
async fn sweep_stale_outbox_tasks(state: &AppState) {
    let res = state
        .outbox_tasks
        .update_many(
            doc! { "status": TaskStatus::Pending.as_str() },
            doc! { "$set": {
                "status": TaskStatus::Done.as_str(),
                "processed_at": DateTime::from_system_time(SystemTime::now()),
            } },
        )
        .await;
    match res {
        Ok(res) if res.modified_count > 0 => {
            tracing::info!(count = res.modified_count, "swept stale outbox tasks");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "outbox sweep failed"),
    }
}
