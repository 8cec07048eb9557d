// Payment writes and the settlement state machine that runs inside them.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::ClientSession;
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use std::time::SystemTime;
use uuid::Uuid;

use crate::models::{
    Invoice, InvoiceStatus, OutboxTask, Payment, PaymentStatus, ReservationStatus, ScheduleStatus,
    TaskKind, TaskStatus,
};

use super::{
    AppState, SYSTEM_ACTOR, active_enrollments, compute_ledger_in_session, derive_invoice_status,
    enroll_phase, generate_installment_for_schedule, get_installment_profile_by_id,
    highest_active_phase, next_phase, parse_remark_tags, remove_enrollments_by_source,
    schedule_is_due, seed_schedule_row,
};

/// Invoices whose description carries this marker are reservation fees and
/// never trigger full-payment enrollment.
pub const RESERVATION_FEE_MARKER: &str = "Reservation Fee";

/// What kind of payment write is settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementTrigger {
    PaymentCreated,
    PaymentUpdated,
    PaymentDeleted,
}

fn next_payment_number() -> String {
    format!("PAY-{}", Uuid::new_v4().simple())
}

pub async fn get_payment_by_id(state: &AppState, id: &ObjectId) -> Result<Option<Payment>> {
    state
        .payments
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

/// Record a payment and settle its invoice atomically. Any settlement
/// failure rolls back the payment itself.
pub async fn create_payment(
    state: &AppState,
    invoice_id: &ObjectId,
    payable_amount: f64,
    status: PaymentStatus,
    issue_date: DateTime,
) -> Result<ObjectId> {
    if payable_amount <= 0.0 {
        bail!("payment amount must be positive");
    }

    let mut session = state.client.start_session().await?;
    session.start_transaction().await?;
    let result = async {
        let res = state
            .payments
            .insert_one(Payment {
                id: None,
                number: next_payment_number(),
                invoice_id: invoice_id.clone(),
                payable_amount,
                status,
                issue_date,
                created_at: Some(DateTime::from_system_time(SystemTime::now())),
                updated_at: None,
            })
            .session(&mut session)
            .await?;
        let payment_id = res
            .inserted_id
            .as_object_id()
            .context("payment insert missing _id")?;
        apply_payment_settlement(
            state,
            &mut session,
            invoice_id,
            SettlementTrigger::PaymentCreated,
        )
        .await?;
        Ok::<ObjectId, anyhow::Error>(payment_id)
    }
    .await;

    match result {
        Ok(payment_id) => {
            session.commit_transaction().await?;
            drain_outbox_best_effort(state).await;
            Ok(payment_id)
        }
        Err(err) => {
            let _ = session.abort_transaction().await;
            Err(err)
        }
    }
}

pub async fn update_payment(
    state: &AppState,
    payment_id: &ObjectId,
    payable_amount: f64,
    status: PaymentStatus,
    issue_date: DateTime,
) -> Result<()> {
    if payable_amount <= 0.0 {
        bail!("payment amount must be positive");
    }
    let existing = get_payment_by_id(state, payment_id)
        .await?
        .context("payment not found")?;

    let mut session = state.client.start_session().await?;
    session.start_transaction().await?;
    let result = async {
        state
            .payments
            .update_one(
                doc! { "_id": payment_id },
                doc! { "$set": {
                    "payable_amount": payable_amount,
                    "status": status.as_str(),
                    "issue_date": issue_date,
                    "updated_at": DateTime::from_system_time(SystemTime::now()),
                } },
            )
            .session(&mut session)
            .await?;
        apply_payment_settlement(
            state,
            &mut session,
            &existing.invoice_id,
            SettlementTrigger::PaymentUpdated,
        )
        .await
    }
    .await;

    match result {
        Ok(()) => {
            session.commit_transaction().await?;
            drain_outbox_best_effort(state).await;
            Ok(())
        }
        Err(err) => {
            let _ = session.abort_transaction().await;
            Err(err)
        }
    }
}

pub async fn delete_payment(state: &AppState, payment_id: &ObjectId) -> Result<()> {
    let existing = get_payment_by_id(state, payment_id)
        .await?
        .context("payment not found")?;

    let mut session = state.client.start_session().await?;
    session.start_transaction().await?;
    let result = async {
        state
            .payments
            .delete_one(doc! { "_id": payment_id })
            .session(&mut session)
            .await?;
        apply_payment_settlement(
            state,
            &mut session,
            &existing.invoice_id,
            SettlementTrigger::PaymentDeleted,
        )
        .await
    }
    .await;

    match result {
        Ok(()) => {
            session.commit_transaction().await?;
            drain_outbox_best_effort(state).await;
            Ok(())
        }
        Err(err) => {
            let _ = session.abort_transaction().await;
            Err(err)
        }
    }
}

/// Recompute the invoice from its ledger and drive every side effect of
/// the resulting status transition. Runs inside the payment write's
/// transaction; any error here rolls the whole write back.
pub async fn apply_payment_settlement(
    state: &AppState,
    session: &mut ClientSession,
    invoice_id: &ObjectId,
    trigger: SettlementTrigger,
) -> Result<()> {
    let invoice = state
        .invoices
        .find_one(doc! { "_id": invoice_id })
        .session(&mut *session)
        .await?
        .context("invoice not found")?;

    // Cancelled is a manual terminal state; derived status never
    // resurrects it.
    if invoice.status == InvoiceStatus::Cancelled {
        return Ok(());
    }

    let totals = compute_ledger_in_session(state, session, invoice_id).await?;
    let new_status = derive_invoice_status(&totals);
    state
        .invoices
        .update_one(
            doc! { "_id": invoice_id },
            doc! { "$set": {
                "amount": totals.remaining,
                "status": new_status.as_str(),
                "updated_at": DateTime::from_system_time(SystemTime::now()),
            } },
        )
        .session(&mut *session)
        .await?;

    let was_paid = invoice.status == InvoiceStatus::Paid;
    if !was_paid && new_status == InvoiceStatus::Paid {
        on_invoice_paid(state, session, &invoice).await?;
    } else if was_paid && new_status != InvoiceStatus::Paid && totals.remaining > 0.0 {
        on_paid_revoked(state, session, &invoice, trigger).await?;
    }
    Ok(())
}

async fn on_invoice_paid(
    state: &AppState,
    session: &mut ClientSession,
    invoice: &Invoice,
) -> Result<()> {
    let invoice_id = invoice.id.clone().context("invoice missing _id")?;

    // A paid reservation fee only advances the reservation; enrollment
    // happens on explicit upgrade.
    if let Some(reservation_id) = invoice.reservation_id.as_ref() {
        let reservation = state
            .reservations
            .find_one(doc! { "_id": reservation_id })
            .session(&mut *session)
            .await?;
        if let Some(reservation) = reservation {
            if reservation.status == ReservationStatus::Reserved {
                state
                    .reservations
                    .update_one(
                        doc! { "_id": reservation_id },
                        doc! { "$set": {
                            "status": ReservationStatus::FeePaid.as_str(),
                            "updated_at": DateTime::from_system_time(SystemTime::now()),
                        } },
                    )
                    .session(&mut *session)
                    .await?;
            }
        }
    }

    if let Some(profile_id) = invoice.installment_profile_id.as_ref() {
        let profile = state
            .installment_profiles
            .find_one(doc! { "_id": profile_id })
            .session(&mut *session)
            .await?
            .context("installment profile not found")?;

        if profile.downpayment_invoice_id == invoice.id {
            if !profile.downpayment_paid {
                state
                    .installment_profiles
                    .update_one(
                        doc! { "_id": profile_id },
                        doc! { "$set": {
                            "downpayment_paid": true,
                            "updated_at": DateTime::from_system_time(SystemTime::now()),
                        } },
                    )
                    .session(&mut *session)
                    .await?;
                let schedule_id =
                    seed_schedule_row(state, Some(&mut *session), profile_id, profile.amount).await?;
                // The first installment generates right after this commit;
                // the outbox row makes that handoff durable.
                enqueue_outbox_task(
                    state,
                    session,
                    TaskKind::GenerateFirstInstallment,
                    &schedule_id,
                    profile_id,
                )
                .await?;
            }
        } else {
            // A paid recurring installment unlocks the next class phase.
            let class = state
                .classes
                .find_one(doc! { "_id": &profile.class_id })
                .session(&mut *session)
                .await?
                .context("class not found")?;
            let highest = highest_active_phase(
                state,
                Some(&mut *session),
                &profile.student_id,
                &profile.class_id,
            )
            .await?;
            if let Some(phase) = next_phase(highest, class.total_phases) {
                enroll_phase(
                    state,
                    Some(&mut *session),
                    &profile.student_id,
                    &profile.class_id,
                    phase,
                    Some(&invoice_id),
                )
                .await?;
            }
        }
        return Ok(());
    }

    // Full payment: enroll the remark-tagged phase range in one shot.
    if !invoice.description.contains(RESERVATION_FEE_MARKER) {
        let tags = parse_remark_tags(invoice.remarks.as_deref().unwrap_or(""));
        let Some(class_id) = tags.class_id else {
            return Ok(());
        };
        let class = state
            .classes
            .find_one(doc! { "_id": &class_id })
            .session(&mut *session)
            .await?
            .context("class referenced by invoice remarks not found")?;

        let already_enrolled =
            !active_enrollments(state, Some(&mut *session), &invoice.student_id, &class_id)
                .await?
                .is_empty();
        if already_enrolled {
            return Ok(());
        }

        let start = tags.phase_start.unwrap_or(1).max(1);
        let mut end = tags.phase_end.or(class.total_phases).unwrap_or(start);
        if let Some(total) = class.total_phases {
            end = end.min(total);
        }
        for phase in start..=end.max(start) {
            enroll_phase(
                state,
                Some(&mut *session),
                &invoice.student_id,
                &class_id,
                phase,
                Some(&invoice_id),
            )
            .await?;
        }
    }
    Ok(())
}

async fn on_paid_revoked(
    state: &AppState,
    session: &mut ClientSession,
    invoice: &Invoice,
    trigger: SettlementTrigger,
) -> Result<()> {
    let invoice_id = invoice.id.clone().context("invoice missing _id")?;

    if let Some(reservation_id) = invoice.reservation_id.as_ref() {
        let reservation = state
            .reservations
            .find_one(doc! { "_id": reservation_id })
            .session(&mut *session)
            .await?;
        if let Some(reservation) = reservation {
            if reservation.status == ReservationStatus::Upgraded {
                remove_enrollments_by_source(
                    state,
                    Some(&mut *session),
                    &invoice_id,
                    "Reservation payment revoked",
                    SYSTEM_ACTOR,
                )
                .await?;
            }
            let next_status = if reservation.due_date.to_chrono() < Utc::now() {
                ReservationStatus::Expired
            } else {
                ReservationStatus::Reserved
            };
            state
                .reservations
                .update_one(
                    doc! { "_id": reservation_id },
                    doc! { "$set": {
                        "status": next_status.as_str(),
                        "updated_at": DateTime::from_system_time(SystemTime::now()),
                    } },
                )
                .session(&mut *session)
                .await?;
        }
        return Ok(());
    }

    if let Some(profile_id) = invoice.installment_profile_id.as_ref() {
        let profile = state
            .installment_profiles
            .find_one(doc! { "_id": profile_id })
            .session(&mut *session)
            .await?
            .context("installment profile not found")?;
        // Deleting the downpayment's payment rewinds the schedule seeding,
        // but only while nothing has generated from it yet.
        if profile.downpayment_invoice_id == invoice.id
            && trigger == SettlementTrigger::PaymentDeleted
        {
            state
                .installment_profiles
                .update_one(
                    doc! { "_id": profile_id },
                    doc! { "$set": {
                        "downpayment_paid": false,
                        "updated_at": DateTime::from_system_time(SystemTime::now()),
                    } },
                )
                .session(&mut *session)
                .await?;
            state
                .scheduled_installments
                .delete_one(doc! {
                    "profile_id": profile_id,
                    "status": ScheduleStatus::Pending.as_str(),
                })
                .session(&mut *session)
                .await?;
        }
        return Ok(());
    }

    // Package-price / full-payment invoice: unwind exactly the rows its
    // settlement created.
    remove_enrollments_by_source(
        state,
        Some(&mut *session),
        &invoice_id,
        "Enrollment payment revoked",
        SYSTEM_ACTOR,
    )
    .await?;
    Ok(())
}

pub(super) async fn enqueue_outbox_task(
    state: &AppState,
    session: &mut ClientSession,
    kind: TaskKind,
    schedule_id: &ObjectId,
    profile_id: &ObjectId,
) -> Result<()> {
    state
        .outbox_tasks
        .insert_one(OutboxTask {
            id: None,
            kind,
            schedule_id: schedule_id.clone(),
            profile_id: profile_id.clone(),
            status: TaskStatus::Pending,
            created_at: DateTime::from_system_time(SystemTime::now()),
            processed_at: None,
            last_error: None,
        })
        .session(session)
        .await?;
    Ok(())
}

/// Consume pending outbox tasks. Each task gets one attempt; the recurring
/// generation job remains the retry path because an unserved schedule row
/// still satisfies the due predicate.
pub async fn process_outbox_tasks(state: &AppState) -> Result<usize> {
    let mut tasks = Vec::new();
    let mut cursor = state
        .outbox_tasks
        .find(doc! { "status": TaskStatus::Pending.as_str() })
        .await?;
    while let Some(task) = cursor.try_next().await? {
        tasks.push(task);
    }

    let today = Utc::now();
    let mut processed = 0;
    for task in tasks {
        let task_id = match task.id.as_ref() {
            Some(id) => id.clone(),
            None => continue,
        };

        let outcome = run_outbox_task(state, &task, today).await;
        let (status, error) = match outcome {
            Ok(()) => (TaskStatus::Done, None),
            Err(err) => (TaskStatus::Failed, Some(format!("{err:#}"))),
        };
        state
            .outbox_tasks
            .update_one(
                doc! { "_id": &task_id },
                doc! { "$set": {
                    "status": status.as_str(),
                    "processed_at": DateTime::from_system_time(SystemTime::now()),
                    "last_error": error,
                } },
            )
            .await?;
        processed += 1;
    }
    Ok(processed)
}

async fn run_outbox_task(
    state: &AppState,
    task: &OutboxTask,
    today: chrono::DateTime<Utc>,
) -> Result<()> {
    match task.kind {
        TaskKind::GenerateFirstInstallment => {
            let schedule = state
                .scheduled_installments
                .find_one(doc! { "_id": &task.schedule_id })
                .await?
                .context("schedule row no longer exists")?;
            let profile = get_installment_profile_by_id(state, &task.profile_id)
                .await?
                .context("installment profile no longer exists")?;
            if !schedule_is_due(&schedule, &profile, today) {
                return Ok(());
            }
            generate_installment_for_schedule(state, &task.schedule_id).await?;
            Ok(())
        }
    }
}

async fn drain_outbox_best_effort(state: &AppState) {
    if let Err(err) = process_outbox_tasks(state).await {
        tracing::warn!(error = %err, "outbox drain failed; next generation run will pick it up");
    }
}
