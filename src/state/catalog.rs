// Catalog entities: branches, students, classes, promos, reservations.

use anyhow::{Context, Result, bail};
use futures::stream::TryStreamExt;
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use std::time::SystemTime;

use crate::models::{
    Branch, ClassGroup, Promo, PromoType, Reservation, ReservationStatus, Student,
};

use super::AppState;

pub async fn create_branch(state: &AppState, name: &str) -> Result<ObjectId> {
    let res = state
        .branches
        .insert_one(Branch {
            id: None,
            name: name.to_string(),
            created_at: Some(DateTime::from_system_time(SystemTime::now())),
            updated_at: None,
        })
        .await?;
    res.inserted_id
        .as_object_id()
        .context("branch insert missing _id")
}

pub async fn get_branch_by_id(state: &AppState, id: &ObjectId) -> Result<Option<Branch>> {
    state
        .branches
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

pub async fn list_branches(state: &AppState) -> Result<Vec<Branch>> {
    let mut cursor = state.branches.find(doc! {}).await?;
    let mut items = Vec::new();
    while let Some(branch) = cursor.try_next().await? {
        items.push(branch);
    }
    Ok(items)
}

pub async fn create_student(
    state: &AppState,
    branch_id: &ObjectId,
    name: &str,
    email: Option<String>,
) -> Result<ObjectId> {
    let res = state
        .students
        .insert_one(Student {
            id: None,
            branch_id: branch_id.clone(),
            name: name.to_string(),
            email,
            created_at: Some(DateTime::from_system_time(SystemTime::now())),
            updated_at: None,
        })
        .await?;
    res.inserted_id
        .as_object_id()
        .context("student insert missing _id")
}

pub async fn get_student_by_id(state: &AppState, id: &ObjectId) -> Result<Option<Student>> {
    state
        .students
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

pub async fn create_class(
    state: &AppState,
    branch_id: &ObjectId,
    name: &str,
    total_phases: Option<i32>,
    package_price: f64,
) -> Result<ObjectId> {
    if let Some(phases) = total_phases {
        if phases < 1 {
            bail!("class total_phases must be at least 1");
        }
    }
    let res = state
        .classes
        .insert_one(ClassGroup {
            id: None,
            branch_id: branch_id.clone(),
            name: name.to_string(),
            total_phases,
            package_price,
            created_at: Some(DateTime::from_system_time(SystemTime::now())),
            updated_at: None,
        })
        .await?;
    res.inserted_id
        .as_object_id()
        .context("class insert missing _id")
}

pub async fn get_class_by_id(state: &AppState, id: &ObjectId) -> Result<Option<ClassGroup>> {
    state
        .classes
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

pub async fn create_promo(
    state: &AppState,
    name: &str,
    promo_type: PromoType,
    percentage: Option<f64>,
    fixed_amount: Option<f64>,
    merchandise_items: Vec<String>,
) -> Result<ObjectId> {
    if let Some(pct) = percentage {
        if !(0.0..=100.0).contains(&pct) {
            bail!("promo percentage must be between 0 and 100");
        }
    }
    if let Some(fixed) = fixed_amount {
        if fixed < 0.0 {
            bail!("promo fixed_amount must not be negative");
        }
    }
    let res = state
        .promos
        .insert_one(Promo {
            id: None,
            name: name.to_string(),
            promo_type,
            percentage,
            fixed_amount,
            merchandise_items,
            is_active: true,
            created_at: Some(DateTime::from_system_time(SystemTime::now())),
            updated_at: None,
        })
        .await?;
    res.inserted_id
        .as_object_id()
        .context("promo insert missing _id")
}

pub async fn get_promo_by_id(state: &AppState, id: &ObjectId) -> Result<Option<Promo>> {
    state
        .promos
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

pub async fn create_reservation(
    state: &AppState,
    student_id: &ObjectId,
    class_id: &ObjectId,
    invoice_id: Option<ObjectId>,
    phase_number: i32,
    due_date: DateTime,
) -> Result<ObjectId> {
    let res = state
        .reservations
        .insert_one(Reservation {
            id: None,
            student_id: student_id.clone(),
            class_id: class_id.clone(),
            invoice_id,
            phase_number,
            status: ReservationStatus::Reserved,
            due_date,
            created_at: Some(DateTime::from_system_time(SystemTime::now())),
            updated_at: None,
        })
        .await?;
    res.inserted_id
        .as_object_id()
        .context("reservation insert missing _id")
}

pub async fn get_reservation_by_id(
    state: &AppState,
    id: &ObjectId,
) -> Result<Option<Reservation>> {
    state
        .reservations
        .find_one(doc! { "_id": id })
        .await
        .map_err(Into::into)
}

/// Administrative upgrade of a fee-paid reservation into a real enrollment.
/// The enrollment row records the reservation's invoice as its source so a
/// later payment revocation can unwind exactly this row.
pub async fn upgrade_reservation(state: &AppState, reservation_id: &ObjectId) -> Result<()> {
    let reservation = state
        .reservations
        .find_one(doc! { "_id": reservation_id })
        .await?
        .context("reservation not found")?;

    if reservation.status != ReservationStatus::FeePaid {
        bail!("only fee-paid reservations can be upgraded");
    }

    super::enroll_phase(
        state,
        None,
        &reservation.student_id,
        &reservation.class_id,
        reservation.phase_number,
        reservation.invoice_id.as_ref(),
    )
    .await?;

    state
        .reservations
        .update_one(
            doc! { "_id": reservation_id },
            doc! { "$set": {
                "status": ReservationStatus::Upgraded.as_str(),
                "updated_at": DateTime::from_system_time(SystemTime::now()),
            } },
        )
        .await?;
    Ok(())
}
