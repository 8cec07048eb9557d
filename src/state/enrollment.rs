// Phase enrollment: Active/Removed rows per (student, class, phase).

use anyhow::Result;
use futures::stream::TryStreamExt;
use mongodb::ClientSession;
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use std::str::FromStr;
use std::time::SystemTime;

use crate::models::{ClassEnrollment, EnrollmentStatus};

use super::AppState;

pub async fn active_enrollments(
    state: &AppState,
    mut session: Option<&mut ClientSession>,
    student_id: &ObjectId,
    class_id: &ObjectId,
) -> Result<Vec<ClassEnrollment>> {
    let filter = doc! {
        "student_id": student_id,
        "class_id": class_id,
        "enrollment_status": EnrollmentStatus::Active.as_str(),
    };
    let mut rows = Vec::new();
    match session.as_deref_mut() {
        Some(session) => {
            let mut cursor = state
                .class_enrollments
                .find(filter)
                .session(&mut *session)
                .await?;
            while let Some(row) = cursor.next(&mut *session).await.transpose()? {
                rows.push(row);
            }
        }
        None => {
            let mut cursor = state.class_enrollments.find(filter).await?;
            while let Some(row) = cursor.try_next().await? {
                rows.push(row);
            }
        }
    }
    Ok(rows)
}

pub async fn highest_active_phase(
    state: &AppState,
    session: Option<&mut ClientSession>,
    student_id: &ObjectId,
    class_id: &ObjectId,
) -> Result<Option<i32>> {
    let rows = active_enrollments(state, session, student_id, class_id).await?;
    Ok(rows.iter().map(|r| r.phase_number).max())
}

/// Next phase a paid installment unlocks. `None` when the student already
/// holds the class's final phase.
pub fn next_phase(highest_active: Option<i32>, total_phases: Option<i32>) -> Option<i32> {
    match highest_active {
        None => Some(1),
        Some(highest) => {
            let mut next = highest + 1;
            if let Some(total) = total_phases {
                next = next.min(total);
            }
            if next > highest { Some(next) } else { None }
        }
    }
}

/// Insert an Active row unless one already exists for the same
/// (student, class, phase). Returns whether a row was created.
pub async fn enroll_phase(
    state: &AppState,
    mut session: Option<&mut ClientSession>,
    student_id: &ObjectId,
    class_id: &ObjectId,
    phase_number: i32,
    source_invoice_id: Option<&ObjectId>,
) -> Result<bool> {
    let filter = doc! {
        "student_id": student_id,
        "class_id": class_id,
        "phase_number": phase_number,
        "enrollment_status": EnrollmentStatus::Active.as_str(),
    };
    let existing = match session.as_deref_mut() {
        Some(session) => {
            state
                .class_enrollments
                .find_one(filter)
                .session(session)
                .await?
        }
        None => state.class_enrollments.find_one(filter).await?,
    };
    if existing.is_some() {
        return Ok(false);
    }

    let row = ClassEnrollment {
        id: None,
        student_id: student_id.clone(),
        class_id: class_id.clone(),
        phase_number,
        enrollment_status: EnrollmentStatus::Active,
        source_invoice_id: source_invoice_id.cloned(),
        enrolled_at: DateTime::from_system_time(SystemTime::now()),
        removed_reason: None,
        removed_by: None,
        removed_at: None,
    };
    match session.as_deref_mut() {
        Some(session) => {
            state
                .class_enrollments
                .insert_one(row)
                .session(session)
                .await?
        }
        None => state.class_enrollments.insert_one(row).await?,
    };
    Ok(true)
}

/// Transition every Active row of (student, class) to Removed. Returns the
/// number of rows transitioned; zero is a legitimate no-op.
pub async fn remove_active_enrollments(
    state: &AppState,
    mut session: Option<&mut ClientSession>,
    student_id: &ObjectId,
    class_id: &ObjectId,
    reason: &str,
    actor: &str,
) -> Result<u64> {
    let filter = doc! {
        "student_id": student_id,
        "class_id": class_id,
        "enrollment_status": EnrollmentStatus::Active.as_str(),
    };
    let update = removal_update(reason, actor);
    let res = match session.as_deref_mut() {
        Some(session) => {
            state
                .class_enrollments
                .update_many(filter, update)
                .session(session)
                .await?
        }
        None => state.class_enrollments.update_many(filter, update).await?,
    };
    Ok(res.modified_count)
}

/// Unenroll the rows a specific invoice's settlement created.
pub async fn remove_enrollments_by_source(
    state: &AppState,
    mut session: Option<&mut ClientSession>,
    source_invoice_id: &ObjectId,
    reason: &str,
    actor: &str,
) -> Result<u64> {
    let filter = doc! {
        "source_invoice_id": source_invoice_id,
        "enrollment_status": EnrollmentStatus::Active.as_str(),
    };
    let update = removal_update(reason, actor);
    let res = match session.as_deref_mut() {
        Some(session) => {
            state
                .class_enrollments
                .update_many(filter, update)
                .session(session)
                .await?
        }
        None => state.class_enrollments.update_many(filter, update).await?,
    };
    Ok(res.modified_count)
}

fn removal_update(reason: &str, actor: &str) -> mongodb::bson::Document {
    doc! { "$set": {
        "enrollment_status": EnrollmentStatus::Removed.as_str(),
        "removed_reason": reason,
        "removed_by": actor,
        "removed_at": DateTime::from_system_time(SystemTime::now()),
    } }
}

/// Tags a full-payment invoice may carry in its free-text remarks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemarkTags {
    pub class_id: Option<ObjectId>,
    pub phase_start: Option<i32>,
    pub phase_end: Option<i32>,
}

/// Pull `CLASS_ID:` / `PHASE_START:` / `PHASE_END:` values out of free
/// text. Unparseable values are treated as absent.
pub fn parse_remark_tags(remarks: &str) -> RemarkTags {
    RemarkTags {
        class_id: tag_value(remarks, "CLASS_ID").and_then(|v| ObjectId::from_str(&v).ok()),
        phase_start: tag_value(remarks, "PHASE_START").and_then(|v| v.parse().ok()),
        phase_end: tag_value(remarks, "PHASE_END").and_then(|v| v.parse().ok()),
    }
}

fn tag_value(text: &str, tag: &str) -> Option<String> {
    let marker = format!("{tag}:");
    let start = text.find(&marker)? + marker.len();
    let rest = &text[start..];
    let value: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != ';' && *c != ',')
        .collect();
    if value.is_empty() { None } else { Some(value) }
}
