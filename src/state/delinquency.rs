// Delinquency engine: one-time late penalties and dropoff removals for
// overdue installment invoices.

use anyhow::{Context, Result};
use chrono::{DateTime as ChronoDateTime, Duration, NaiveDate, Utc};
use futures::stream::TryStreamExt;
use mongodb::ClientSession;
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use serde::Serialize;
use std::time::SystemTime;

use crate::models::{InvoiceLineItem, InvoiceStatus};

use super::{
    AppState, DelinquencyPolicy, SYSTEM_ACTOR, compute_ledger_in_session, delinquency_policy,
    derive_invoice_status, remove_active_enrollments, round2,
};

#[derive(Debug, Clone, Serialize)]
pub struct DelinquencyRunSummary {
    pub scanned: usize,
    pub penalties_applied: usize,
    pub removals_applied: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct DelinquencyAction {
    penalty_applied: bool,
    removal_applied: bool,
}

/// A penalty accrues strictly after the grace window ends.
pub(super) fn penalty_eligible(today: NaiveDate, due: NaiveDate, grace_days: i64) -> bool {
    today > due + Duration::days(grace_days)
}

/// Removal triggers on the dropoff day itself.
pub(super) fn dropoff_eligible(today: NaiveDate, due: NaiveDate, dropoff_days: i64) -> bool {
    today >= due + Duration::days(dropoff_days)
}

/// Penalty rate rendered for the line-item label: 0.10 -> "10",
/// 0.125 -> "12.5".
pub(super) fn format_rate(rate: f64) -> String {
    let pct = round2(rate * 100.0);
    if pct.fract() == 0.0 {
        format!("{pct:.0}")
    } else {
        format!("{pct}")
    }
}

/// Scan overdue installment-linked invoices, applying at most one penalty
/// per due date and removing enrollments past the dropoff threshold.
/// Failures are isolated per invoice.
pub async fn process_installment_delinquencies(
    state: &AppState,
) -> Result<DelinquencyRunSummary> {
    let today = Utc::now();

    let mut candidates = Vec::new();
    let mut cursor = state
        .invoices
        .find(doc! {
            "installment_profile_id": { "$ne": null },
            "status": { "$nin": [
                InvoiceStatus::Paid.as_str(),
                InvoiceStatus::Cancelled.as_str(),
            ] },
            "due_date": { "$lt": DateTime::from_chrono(today) },
        })
        .await?;
    while let Some(invoice) = cursor.try_next().await? {
        candidates.push(invoice);
    }

    let mut summary = DelinquencyRunSummary {
        scanned: 0,
        penalties_applied: 0,
        removals_applied: 0,
        errors: 0,
    };

    for invoice in candidates {
        // Overdue is day-granular; the coarse timestamp filter above can
        // include invoices that fell due earlier today.
        if invoice.due_date.to_chrono().date_naive() >= today.date_naive() {
            continue;
        }
        let invoice_id = match invoice.id.as_ref() {
            Some(id) => id.clone(),
            None => continue,
        };
        summary.scanned += 1;

        // The resolver is built fresh per candidate; penalty behavior is
        // branch-scoped with global/default fallback.
        let policy = match delinquency_policy(state, Some(&invoice.branch_id)).await {
            Ok(policy) => policy,
            Err(err) => {
                tracing::warn!(%invoice_id, error = %err, "settings resolution failed");
                summary.errors += 1;
                continue;
            }
        };

        match process_delinquent_invoice(state, &invoice_id, policy, today).await {
            Ok(action) => {
                if action.penalty_applied {
                    summary.penalties_applied += 1;
                }
                if action.removal_applied {
                    summary.removals_applied += 1;
                }
            }
            Err(err) => {
                tracing::warn!(%invoice_id, error = %err, "delinquency processing failed");
                summary.errors += 1;
            }
        }
    }

    Ok(summary)
}

async fn process_delinquent_invoice(
    state: &AppState,
    invoice_id: &ObjectId,
    policy: DelinquencyPolicy,
    today: ChronoDateTime<Utc>,
) -> Result<DelinquencyAction> {
    let mut session = state.client.start_session().await?;
    session.start_transaction().await?;
    match delinquency_in_txn(state, &mut session, invoice_id, policy, today).await {
        Ok(action) => {
            session.commit_transaction().await?;
            Ok(action)
        }
        Err(err) => {
            let _ = session.abort_transaction().await;
            Err(err)
        }
    }
}

async fn delinquency_in_txn(
    state: &AppState,
    session: &mut ClientSession,
    invoice_id: &ObjectId,
    policy: DelinquencyPolicy,
    today: ChronoDateTime<Utc>,
) -> Result<DelinquencyAction> {
    // Re-read inside the transaction so a payment landing between scan and
    // processing is respected.
    let invoice = state
        .invoices
        .find_one(doc! { "_id": invoice_id })
        .session(&mut *session)
        .await?
        .context("invoice not found")?;
    let mut action = DelinquencyAction::default();

    if matches!(invoice.status, InvoiceStatus::Paid | InvoiceStatus::Cancelled) {
        return Ok(action);
    }

    let totals = compute_ledger_in_session(state, session, invoice_id).await?;
    if totals.remaining <= 0.0 {
        return Ok(action);
    }

    let due = invoice.due_date;
    let due_day = due.to_chrono().date_naive();
    let today_day = today.date_naive();
    let mut remaining = totals.remaining;

    let already_penalized = invoice.late_penalty_applied_for_due_date == Some(due);
    if penalty_eligible(today_day, due_day, policy.grace_days) && !already_penalized {
        let penalty = round2(remaining * policy.penalty_rate);
        let now = DateTime::from_system_time(SystemTime::now());
        if penalty > 0.0 {
            state
                .invoice_line_items
                .insert_one(InvoiceLineItem {
                    id: None,
                    invoice_id: invoice_id.clone(),
                    description: format!(
                        "Late Payment Penalty ({}%)",
                        format_rate(policy.penalty_rate)
                    ),
                    amount: 0.0,
                    discount_amount: 0.0,
                    penalty_amount: penalty,
                    tax_percentage: 0.0,
                    created_at: Some(now),
                })
                .session(&mut *session)
                .await?;

            let totals = compute_ledger_in_session(state, session, invoice_id).await?;
            let status = derive_invoice_status(&totals);
            state
                .invoices
                .update_one(
                    doc! { "_id": invoice_id },
                    doc! { "$set": {
                        "amount": totals.remaining,
                        "status": status.as_str(),
                        "late_penalty_applied_for_due_date": due,
                        "updated_at": now,
                    } },
                )
                .session(&mut *session)
                .await?;
            remaining = totals.remaining;
            action.penalty_applied = true;
        } else {
            // A zero-rounded penalty still sets the guard so the invoice
            // is not recomputed on every run.
            state
                .invoices
                .update_one(
                    doc! { "_id": invoice_id },
                    doc! { "$set": {
                        "late_penalty_applied_for_due_date": due,
                        "updated_at": now,
                    } },
                )
                .session(&mut *session)
                .await?;
        }
    }

    if dropoff_eligible(today_day, due_day, policy.dropoff_days) && remaining > 0.0 {
        let profile_id = invoice
            .installment_profile_id
            .as_ref()
            .context("delinquency candidate lost its profile link")?;
        let profile = state
            .installment_profiles
            .find_one(doc! { "_id": profile_id })
            .session(&mut *session)
            .await?
            .context("installment profile not found")?;

        let removed = remove_active_enrollments(
            state,
            Some(&mut *session),
            &profile.student_id,
            &profile.class_id,
            &format!(
                "Installment delinquency (≥ {} days overdue)",
                policy.dropoff_days
            ),
            SYSTEM_ACTOR,
        )
        .await?;
        if removed > 0 {
            action.removal_applied = true;
        }
    }

    Ok(action)
}
