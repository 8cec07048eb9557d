use std::time::SystemTime;

use chrono::{Duration, Months, Utc};
use mongodb::bson::{DateTime, doc, oid::ObjectId};

use matricula::models::{
    EnrollmentStatus, InvoiceStatus, PaymentStatus, PromoScope, PromoType, ReservationStatus,
    ScheduleStatus,
};
use matricula::state::{
    AppState, LineItemSpec, active_enrollments, create_branch, create_class,
    create_installment_profile, create_invoice, create_payment, create_promo, create_reservation,
    create_student, delete_payment, get_installment_profile_by_id, get_invoice_by_id,
    get_reservation_by_id, get_schedule_for_profile, invoice_month, list_invoice_line_items,
    list_invoices_for_profile, process_due_installment_invoices, upgrade_reservation,
};

#[path = "common/mod.rs"]
mod common;

fn now() -> DateTime {
    DateTime::from_system_time(SystemTime::now())
}

async fn rewind_schedule(state: &AppState, profile_id: &ObjectId, days: i64) {
    let past = Utc::now() - Duration::days(days);
    state
        .scheduled_installments
        .update_one(
            doc! { "profile_id": profile_id },
            doc! { "$set": { "next_generation_date": DateTime::from_chrono(past) } },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn generation_creates_an_invoice_and_advances_a_month() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Centro").await.unwrap();
    let class = create_class(&state, &branch, "Guitar", None, 12000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Ana Torres", None)
        .await
        .unwrap();
    let profile_id = create_installment_profile(
        &state,
        &student,
        &branch,
        &class,
        None,
        1000.0,
        "1 month(s)",
        None,
        None,
        None,
        None,
        0,
    )
    .await
    .unwrap();

    let summary = process_due_installment_invoices(&state).await.unwrap();
    assert_eq!(summary.total_due, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.errors, 0);

    let today = Utc::now();
    let invoices = list_invoices_for_profile(&state, &profile_id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    assert_eq!(
        invoice.issue_date.to_chrono().date_naive(),
        today.date_naive()
    );
    assert_eq!(
        (invoice.due_date.to_chrono() - invoice.issue_date.to_chrono()).num_days(),
        7
    );
    assert_eq!(invoice.status, InvoiceStatus::Unpaid);
    assert_eq!(invoice.amount, 1000.0);

    let schedule = get_schedule_for_profile(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Scheduled);
    let next = today.checked_add_months(Months::new(1)).unwrap();
    assert_eq!(
        schedule.next_generation_date.to_chrono().date_naive(),
        next.date_naive()
    );
    assert_eq!(
        schedule.next_invoice_month.as_deref(),
        Some(invoice_month(next).as_str())
    );

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.generated_count, 1);
    assert!(profile.is_active);

    // The schedule advanced, so an immediate re-run finds nothing due.
    let summary = process_due_installment_invoices(&state).await.unwrap();
    assert_eq!(summary.total_due, 0);

    common::teardown(Some(ctx)).await;
}

#[tokio::test]
async fn downpayment_gates_seeding_and_phases_advance_per_paid_installment() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Norte").await.unwrap();
    let class = create_class(&state, &branch, "Piano", Some(6), 18000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Luis Vega", None)
        .await
        .unwrap();
    let profile_id = create_installment_profile(
        &state,
        &student,
        &branch,
        &class,
        None,
        1000.0,
        "1 month(s)",
        Some(6),
        Some(500.0),
        None,
        None,
        0,
    )
    .await
    .unwrap();

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    let downpayment_invoice = profile.downpayment_invoice_id.clone().unwrap();
    assert!(!profile.downpayment_paid);
    assert!(
        get_schedule_for_profile(&state, &profile_id)
            .await
            .unwrap()
            .is_none()
    );

    // Nothing is due while the downpayment is unpaid.
    let summary = process_due_installment_invoices(&state).await.unwrap();
    assert_eq!(summary.total_due, 0);

    create_payment(
        &state,
        &downpayment_invoice,
        500.0,
        PaymentStatus::Completed,
        now(),
    )
    .await
    .unwrap();

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert!(profile.downpayment_paid);
    assert!(
        get_schedule_for_profile(&state, &profile_id)
            .await
            .unwrap()
            .is_some()
    );

    // The post-commit outbox drain generated the first installment.
    let invoices = list_invoices_for_profile(&state, &profile_id).await.unwrap();
    assert_eq!(invoices.len(), 2);
    let first_installment = invoices
        .iter()
        .find(|i| i.id.as_ref() != Some(&downpayment_invoice))
        .unwrap();

    // Paying the downpayment alone enrolls nobody.
    assert!(
        active_enrollments(&state, None, &student, &class)
            .await
            .unwrap()
            .is_empty()
    );

    // The first paid installment unlocks phase 1.
    create_payment(
        &state,
        first_installment.id.as_ref().unwrap(),
        1000.0,
        PaymentStatus::Completed,
        now(),
    )
    .await
    .unwrap();
    let rows = active_enrollments(&state, None, &student, &class)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].phase_number, 1);

    // The next cycle's paid installment unlocks phase 2; phase 1 stays.
    rewind_schedule(&state, &profile_id, 1).await;
    process_due_installment_invoices(&state).await.unwrap();
    let second_installment = list_invoices_for_profile(&state, &profile_id)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.status == InvoiceStatus::Unpaid)
        .unwrap();
    create_payment(
        &state,
        second_installment.id.as_ref().unwrap(),
        1000.0,
        PaymentStatus::Completed,
        now(),
    )
    .await
    .unwrap();

    let mut phases: Vec<i32> = active_enrollments(&state, None, &student, &class)
        .await
        .unwrap()
        .iter()
        .map(|r| r.phase_number)
        .collect();
    phases.sort();
    assert_eq!(phases, vec![1, 2]);

    common::teardown(Some(ctx)).await;
}

#[tokio::test]
async fn bounded_profiles_stop_generating_at_the_phase_limit() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Sur").await.unwrap();
    let class = create_class(&state, &branch, "Violin", Some(2), 4000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Marta Ruiz", None)
        .await
        .unwrap();
    let profile_id = create_installment_profile(
        &state,
        &student,
        &branch,
        &class,
        None,
        2000.0,
        "1 month(s)",
        Some(2),
        None,
        None,
        None,
        0,
    )
    .await
    .unwrap();

    process_due_installment_invoices(&state).await.unwrap();
    rewind_schedule(&state, &profile_id, 1).await;
    process_due_installment_invoices(&state).await.unwrap();

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.generated_count, 2);
    assert!(!profile.is_active);
    let schedule = get_schedule_for_profile(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Generated);

    // A finalized profile never becomes due again.
    rewind_schedule(&state, &profile_id, 1).await;
    let summary = process_due_installment_invoices(&state).await.unwrap();
    assert_eq!(summary.total_due, 0);
    assert_eq!(
        list_invoices_for_profile(&state, &profile_id)
            .await
            .unwrap()
            .len(),
        2
    );

    common::teardown(Some(ctx)).await;
}

#[tokio::test]
async fn promo_discount_is_bounded_by_months_to_apply() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Centro").await.unwrap();
    let class = create_class(&state, &branch, "Drums", None, 9000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Pablo Lara", None)
        .await
        .unwrap();
    let promo = create_promo(
        &state,
        "Opening month",
        PromoType::PercentageDiscount,
        Some(10.0),
        None,
        Vec::new(),
    )
    .await
    .unwrap();
    let profile_id = create_installment_profile(
        &state,
        &student,
        &branch,
        &class,
        None,
        1000.0,
        "1 month(s)",
        None,
        None,
        Some(promo),
        Some(PromoScope::Monthly),
        1,
    )
    .await
    .unwrap();

    process_due_installment_invoices(&state).await.unwrap();
    let invoices = list_invoices_for_profile(&state, &profile_id).await.unwrap();
    let discounted = &invoices[0];
    assert_eq!(discounted.amount, 900.0);
    let items = list_invoice_line_items(&state, discounted.id.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().any(|i| i.discount_amount == 100.0));

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.promo_months_applied, 1);

    // The promo is exhausted; the second cycle bills full price.
    rewind_schedule(&state, &profile_id, 1).await;
    process_due_installment_invoices(&state).await.unwrap();
    let full_price = list_invoices_for_profile(&state, &profile_id)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.amount == 1000.0);
    assert!(full_price.is_some());

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.promo_months_applied, 1);
    assert!(profile.promo_months_applied <= profile.promo_months_to_apply);

    common::teardown(Some(ctx)).await;
}

#[tokio::test]
async fn full_payment_enrolls_remark_range_and_revocation_unwinds_it() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Centro").await.unwrap();
    let class = create_class(&state, &branch, "Singing", Some(4), 8000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Irene Soto", None)
        .await
        .unwrap();

    let issue = now();
    let due = DateTime::from_chrono(Utc::now() + Duration::days(7));
    let invoice_id = create_invoice(
        &state,
        &branch,
        &student,
        "Package full payment",
        issue,
        due,
        None,
        None,
        Some(format!("CLASS_ID:{class};PHASE_START:1;PHASE_END:2")),
        vec![LineItemSpec::charge("Singing package", 8000.0)],
    )
    .await
    .unwrap();

    let payment_id = create_payment(&state, &invoice_id, 8000.0, PaymentStatus::Completed, now())
        .await
        .unwrap();

    let mut phases: Vec<i32> = active_enrollments(&state, None, &student, &class)
        .await
        .unwrap()
        .iter()
        .map(|r| r.phase_number)
        .collect();
    phases.sort();
    assert_eq!(phases, vec![1, 2]);

    // Deleting the payment flips the invoice back and unenrolls exactly
    // the rows this invoice created.
    delete_payment(&state, &payment_id).await.unwrap();
    let invoice = get_invoice_by_id(&state, &invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Unpaid);
    assert_eq!(invoice.amount, 8000.0);
    assert!(
        active_enrollments(&state, None, &student, &class)
            .await
            .unwrap()
            .is_empty()
    );
    let removed = state
        .class_enrollments
        .find_one(doc! {
            "student_id": &student,
            "enrollment_status": EnrollmentStatus::Removed.as_str(),
        })
        .await
        .unwrap();
    assert!(removed.is_some());

    common::teardown(Some(ctx)).await;
}

#[tokio::test]
async fn deleting_the_downpayment_payment_reverts_the_gate() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Norte").await.unwrap();
    let class = create_class(&state, &branch, "Cello", Some(8), 24000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Hugo Prieto", None)
        .await
        .unwrap();
    let profile_id = create_installment_profile(
        &state,
        &student,
        &branch,
        &class,
        None,
        1500.0,
        "1 month(s)",
        Some(8),
        Some(800.0),
        None,
        None,
        0,
    )
    .await
    .unwrap();
    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    let downpayment_invoice = profile.downpayment_invoice_id.clone().unwrap();

    let payment_id = create_payment(
        &state,
        &downpayment_invoice,
        800.0,
        PaymentStatus::Completed,
        now(),
    )
    .await
    .unwrap();

    delete_payment(&state, &payment_id).await.unwrap();

    let profile = get_installment_profile_by_id(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!profile.downpayment_paid);
    let invoice = get_invoice_by_id(&state, &downpayment_invoice)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Unpaid);

    // The first installment already generated from the seeded row, so the
    // schedule row advanced past Pending and survives the revert; it will
    // not generate again until the downpayment is paid once more.
    let schedule = get_schedule_for_profile(&state, &profile_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Scheduled);
    rewind_schedule(&state, &profile_id, 1).await;
    let summary = process_due_installment_invoices(&state).await.unwrap();
    assert_eq!(summary.total_due, 0);

    common::teardown(Some(ctx)).await;
}

#[tokio::test]
async fn reservation_fee_payment_advances_and_revocation_rewinds() {
    let ctx = match common::setup_state().await {
        Some(s) => s,
        None => return,
    };
    let state = ctx.state.clone();

    let branch = create_branch(&state, "Centro").await.unwrap();
    let class = create_class(&state, &branch, "Saxophone", Some(4), 10000.0)
        .await
        .unwrap();
    let student = create_student(&state, &branch, "Elsa Mora", None)
        .await
        .unwrap();

    let issue = now();
    let reservation_due = DateTime::from_chrono(Utc::now() + Duration::days(14));
    let invoice_id = create_invoice(
        &state,
        &branch,
        &student,
        "Reservation Fee",
        issue,
        reservation_due,
        None,
        None,
        None,
        vec![LineItemSpec::charge("Reservation Fee", 300.0)],
    )
    .await
    .unwrap();
    let reservation_id = create_reservation(
        &state,
        &student,
        &class,
        Some(invoice_id.clone()),
        1,
        reservation_due,
    )
    .await
    .unwrap();
    state
        .invoices
        .update_one(
            doc! { "_id": &invoice_id },
            doc! { "$set": { "reservation_id": &reservation_id } },
        )
        .await
        .unwrap();

    let payment_id = create_payment(&state, &invoice_id, 300.0, PaymentStatus::Completed, now())
        .await
        .unwrap();

    // Fee paid does not enroll; that takes the explicit upgrade.
    let reservation = get_reservation_by_id(&state, &reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::FeePaid);
    assert!(
        active_enrollments(&state, None, &student, &class)
            .await
            .unwrap()
            .is_empty()
    );

    upgrade_reservation(&state, &reservation_id).await.unwrap();
    let rows = active_enrollments(&state, None, &student, &class)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].phase_number, 1);

    // Revoking the fee unenrolls the upgraded phase and rewinds the
    // reservation (due date still ahead, so back to Reserved).
    delete_payment(&state, &payment_id).await.unwrap();
    let reservation = get_reservation_by_id(&state, &reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Reserved);
    assert!(
        active_enrollments(&state, None, &student, &class)
            .await
            .unwrap()
            .is_empty()
    );

    common::teardown(Some(ctx)).await;
}
