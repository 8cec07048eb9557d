// models.rs
// Domain documents for the MongoDB collections backing the billing core.

use mongodb::bson::{DateTime, oid::ObjectId};
use serde::{Deserialize, Serialize};

/// Branch (campus) a student, class or setting override belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub branch_id: ObjectId,
    pub name: String,
    pub email: Option<String>,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

/// A class students enroll into phase by phase. `total_phases` of `None`
/// means the class has no fixed phase count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassGroup {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub branch_id: ObjectId,
    pub name: String,
    pub total_phases: Option<i32>,
    pub package_price: f64,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoType {
    PercentageDiscount,
    FixedDiscount,
    Combined,
    FreeMerchandise,
}

impl PromoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromoType::PercentageDiscount => "percentage_discount",
            PromoType::FixedDiscount => "fixed_discount",
            PromoType::Combined => "combined",
            PromoType::FreeMerchandise => "free_merchandise",
        }
    }
}

/// Which invoices of an installment profile a promo applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromoScope {
    Downpayment,
    Monthly,
    Both,
}

impl PromoScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromoScope::Downpayment => "downpayment",
            PromoScope::Monthly => "monthly",
            PromoScope::Both => "both",
        }
    }

    pub fn covers_downpayment(&self) -> bool {
        matches!(self, PromoScope::Downpayment | PromoScope::Both)
    }

    pub fn covers_monthly(&self) -> bool {
        matches!(self, PromoScope::Monthly | PromoScope::Both)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promo {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub promo_type: PromoType,
    /// Percent of the base amount, 0–100. Used by percentage/combined promos.
    pub percentage: Option<f64>,
    /// Flat discount. Used by fixed/combined promos.
    pub fixed_amount: Option<f64>,
    /// Items granted as zero-amount line items.
    #[serde(default)]
    pub merchandise_items: Vec<String>,
    pub is_active: bool,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

/// A student's payment-plan contract. One profile drives one schedule row
/// and any number of generated invoices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallmentProfile {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub student_id: ObjectId,
    pub branch_id: ObjectId,
    pub class_id: ObjectId,
    pub package_id: Option<ObjectId>,
    /// Per-cycle price.
    pub amount: f64,
    /// Cycle length, e.g. "1 month(s)" or "monthly".
    pub frequency: String,
    /// None = unbounded plan.
    pub total_phases: Option<i32>,
    pub generated_count: i32,
    pub is_active: bool,
    pub downpayment_paid: bool,
    pub downpayment_invoice_id: Option<ObjectId>,
    pub promo_id: Option<ObjectId>,
    pub promo_apply_scope: Option<PromoScope>,
    pub promo_months_to_apply: i32,
    pub promo_months_applied: i32,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

/// Lifecycle of a profile's schedule row. `Pending` = seeded, nothing
/// generated yet; `Scheduled` = advanced, waiting for the next cycle;
/// `Generated` = finalized at the phase limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleStatus {
    Pending,
    Scheduled,
    Generated,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "Pending",
            ScheduleStatus::Scheduled => "Scheduled",
            ScheduleStatus::Generated => "Generated",
        }
    }
}

/// Next-due marker driving recurring invoice generation for a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledInstallment {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub profile_id: ObjectId,
    pub scheduled_date: DateTime,
    pub status: ScheduleStatus,
    pub next_generation_date: DateTime,
    /// "YYYY-MM" of the cycle the next generation will bill.
    pub next_invoice_month: Option<String>,
    /// Amount snapshot taken from the profile when the row was seeded.
    pub amount: f64,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Unpaid,
    #[serde(rename = "Partially Paid")]
    PartiallyPaid,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "Unpaid",
            InvoiceStatus::PartiallyPaid => "Partially Paid",
            InvoiceStatus::Paid => "Paid",
            InvoiceStatus::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub number: String,
    pub branch_id: ObjectId,
    pub student_id: ObjectId,
    pub description: String,
    /// Current remaining balance, kept in sync with the ledger on every
    /// payment or line-item mutation. The original amount is derived from
    /// the line items.
    pub amount: f64,
    pub status: InvoiceStatus,
    pub issue_date: DateTime,
    pub due_date: DateTime,
    pub installment_profile_id: Option<ObjectId>,
    pub reservation_id: Option<ObjectId>,
    /// Idempotency guard: a late penalty counts as already applied only
    /// while this equals the invoice's current due_date.
    pub late_penalty_applied_for_due_date: Option<DateTime>,
    /// Free text; full-payment enrollment reads CLASS_ID / PHASE_START /
    /// PHASE_END tags out of it.
    pub remarks: Option<String>,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

/// One charge, discount or penalty on an invoice. Original invoice amount
/// = sum(amount) - sum(discount_amount) + sum(penalty_amount)
/// + sum(amount * tax_percentage / 100).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub invoice_id: ObjectId,
    pub description: String,
    pub amount: f64,
    pub discount_amount: f64,
    pub penalty_amount: f64,
    pub tax_percentage: f64,
    pub created_at: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Completed => "Completed",
            PaymentStatus::Failed => "Failed",
        }
    }
}

/// Only Completed payments count toward an invoice's balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub number: String,
    pub invoice_id: ObjectId,
    pub payable_amount: f64,
    pub status: PaymentStatus,
    pub issue_date: DateTime,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentStatus {
    Active,
    Removed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "Active",
            EnrollmentStatus::Removed => "Removed",
        }
    }
}

/// One phase of one class held by one student. At most one Active row may
/// exist per (student, class, phase_number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassEnrollment {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub student_id: ObjectId,
    pub class_id: ObjectId,
    pub phase_number: i32,
    pub enrollment_status: EnrollmentStatus,
    /// Invoice whose settlement created this row; revoking that payment
    /// unenrolls exactly these rows.
    pub source_invoice_id: Option<ObjectId>,
    pub enrolled_at: DateTime,
    pub removed_reason: Option<String>,
    pub removed_by: Option<String>,
    pub removed_at: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Reserved,
    #[serde(rename = "Fee Paid")]
    FeePaid,
    Upgraded,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "Reserved",
            ReservationStatus::FeePaid => "Fee Paid",
            ReservationStatus::Upgraded => "Upgraded",
            ReservationStatus::Expired => "Expired",
        }
    }
}

/// A held seat in a class, paid for by a reservation-fee invoice and
/// upgraded to a real enrollment by an explicit administrative action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub student_id: ObjectId,
    pub class_id: ObjectId,
    pub invoice_id: Option<ObjectId>,
    pub phase_number: i32,
    pub status: ReservationStatus,
    pub due_date: DateTime,
    pub created_at: Option<DateTime>,
    pub updated_at: Option<DateTime>,
}

/// A configuration value; `branch_id` of `None` makes it the global row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub key: String,
    pub value: f64,
    pub branch_id: Option<ObjectId>,
    pub updated_at: Option<DateTime>,
}

/// Which tier supplied a resolved setting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingScope {
    Branch,
    Global,
    Default,
}

impl SettingScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingScope::Branch => "branch",
            SettingScope::Global => "global",
            SettingScope::Default => "default",
        }
    }
}

/// A resolved setting value together with the tier it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSetting {
    pub value: f64,
    pub scope: SettingScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    GenerateFirstInstallment,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::GenerateFirstInstallment => "generate_first_installment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Done => "Done",
            TaskStatus::Failed => "Failed",
        }
    }
}

/// Deferred work enqueued atomically with a settlement transaction and
/// drained best-effort after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxTask {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub kind: TaskKind,
    pub schedule_id: ObjectId,
    pub profile_id: ObjectId,
    pub status: TaskStatus,
    pub created_at: DateTime,
    pub processed_at: Option<DateTime>,
    pub last_error: Option<String>,
}
