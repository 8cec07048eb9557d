// Ledger derivation: an invoice's financial truth is its line items plus
// its completed payments, never the cached columns.

use anyhow::Result;
use futures::stream::TryStreamExt;
use mongodb::ClientSession;
use mongodb::bson::{doc, oid::ObjectId};

use crate::models::{InvoiceLineItem, InvoiceStatus, Payment, PaymentStatus};

use super::AppState;

/// Comparisons on derived money values tolerate float noise below a tenth
/// of a cent.
const MONEY_EPSILON: f64 = 1e-4;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerTotals {
    pub original: f64,
    pub total_paid: f64,
    pub remaining: f64,
}

impl LedgerTotals {
    /// Derive totals from raw rows. Only Completed payments count.
    pub fn from_parts(items: &[InvoiceLineItem], payments: &[Payment]) -> LedgerTotals {
        let mut original = 0.0;
        for item in items {
            original += item.amount - item.discount_amount + item.penalty_amount
                + item.amount * item.tax_percentage / 100.0;
        }
        let original = round2(original);

        let total_paid = round2(
            payments
                .iter()
                .filter(|p| p.status == PaymentStatus::Completed)
                .map(|p| p.payable_amount)
                .sum(),
        );

        LedgerTotals {
            original,
            total_paid,
            remaining: round2((original - total_paid).max(0.0)),
        }
    }
}

/// Paid iff paid >= original; Partially Paid iff 0 < paid < original;
/// otherwise Unpaid. Cancelled is never derived.
pub fn derive_invoice_status(totals: &LedgerTotals) -> InvoiceStatus {
    if totals.total_paid >= totals.original - MONEY_EPSILON {
        InvoiceStatus::Paid
    } else if totals.total_paid > MONEY_EPSILON {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Unpaid
    }
}

pub async fn compute_ledger(state: &AppState, invoice_id: &ObjectId) -> Result<LedgerTotals> {
    let mut items = Vec::new();
    let mut cursor = state
        .invoice_line_items
        .find(doc! { "invoice_id": invoice_id })
        .await?;
    while let Some(item) = cursor.try_next().await? {
        items.push(item);
    }

    let mut payments = Vec::new();
    let mut cursor = state
        .payments
        .find(doc! { "invoice_id": invoice_id })
        .await?;
    while let Some(payment) = cursor.try_next().await? {
        payments.push(payment);
    }

    Ok(LedgerTotals::from_parts(&items, &payments))
}

/// Same derivation, reading through the caller's transaction so the totals
/// see uncommitted payment/line-item writes.
pub async fn compute_ledger_in_session(
    state: &AppState,
    session: &mut ClientSession,
    invoice_id: &ObjectId,
) -> Result<LedgerTotals> {
    let mut items = Vec::new();
    let mut cursor = state
        .invoice_line_items
        .find(doc! { "invoice_id": invoice_id })
        .session(&mut *session)
        .await?;
    while let Some(item) = cursor.next(&mut *session).await.transpose()? {
        items.push(item);
    }

    let mut payments = Vec::new();
    let mut cursor = state
        .payments
        .find(doc! { "invoice_id": invoice_id })
        .session(&mut *session)
        .await?;
    while let Some(payment) = cursor.next(&mut *session).await.transpose()? {
        payments.push(payment);
    }

    Ok(LedgerTotals::from_parts(&items, &payments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::DateTime;
    use std::time::SystemTime;

    fn item(amount: f64, discount: f64, penalty: f64, tax: f64) -> InvoiceLineItem {
        InvoiceLineItem {
            id: None,
            invoice_id: ObjectId::new(),
            description: "line".to_string(),
            amount,
            discount_amount: discount,
            penalty_amount: penalty,
            tax_percentage: tax,
            created_at: None,
        }
    }

    fn payment(amount: f64, status: PaymentStatus) -> Payment {
        Payment {
            id: None,
            number: "P-1".to_string(),
            invoice_id: ObjectId::new(),
            payable_amount: amount,
            status,
            issue_date: DateTime::from_system_time(SystemTime::now()),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn original_sums_charges_discounts_penalties_and_tax() {
        let items = vec![item(1000.0, 100.0, 50.0, 10.0)];
        let totals = LedgerTotals::from_parts(&items, &[]);
        // 1000 - 100 + 50 + 1000 * 10% = 1050
        assert_eq!(totals.original, 1050.0);
        assert_eq!(totals.total_paid, 0.0);
        assert_eq!(totals.remaining, 1050.0);
    }

    #[test]
    fn only_completed_payments_count() {
        let items = vec![item(500.0, 0.0, 0.0, 0.0)];
        let payments = vec![
            payment(200.0, PaymentStatus::Completed),
            payment(300.0, PaymentStatus::Pending),
            payment(100.0, PaymentStatus::Failed),
        ];
        let totals = LedgerTotals::from_parts(&items, &payments);
        assert_eq!(totals.total_paid, 200.0);
        assert_eq!(totals.remaining, 300.0);
    }

    #[test]
    fn remaining_never_goes_negative() {
        let items = vec![item(100.0, 0.0, 0.0, 0.0)];
        let payments = vec![payment(150.0, PaymentStatus::Completed)];
        let totals = LedgerTotals::from_parts(&items, &payments);
        assert_eq!(totals.remaining, 0.0);
    }

    #[test]
    fn status_follows_paid_fraction() {
        let totals = |original: f64, paid: f64| LedgerTotals {
            original,
            total_paid: paid,
            remaining: (original - paid).max(0.0),
        };
        assert_eq!(derive_invoice_status(&totals(100.0, 0.0)), InvoiceStatus::Unpaid);
        assert_eq!(
            derive_invoice_status(&totals(100.0, 40.0)),
            InvoiceStatus::PartiallyPaid
        );
        assert_eq!(derive_invoice_status(&totals(100.0, 100.0)), InvoiceStatus::Paid);
        assert_eq!(derive_invoice_status(&totals(100.0, 120.0)), InvoiceStatus::Paid);
    }

    #[test]
    fn float_noise_does_not_flip_status() {
        // Three payments of a third each should settle a 100.00 invoice.
        let items = vec![item(100.0, 0.0, 0.0, 0.0)];
        let third = 100.0 / 3.0;
        let payments = vec![
            payment(round2(third), PaymentStatus::Completed),
            payment(round2(third), PaymentStatus::Completed),
            payment(round2(100.0 - 2.0 * round2(third)), PaymentStatus::Completed),
        ];
        let totals = LedgerTotals::from_parts(&items, &payments);
        assert_eq!(derive_invoice_status(&totals), InvoiceStatus::Paid);
    }

    #[test]
    fn round2_normalizes_to_cents() {
        assert_eq!(round2(99.999), 100.0);
        assert_eq!(round2(0.1 + 0.2), 0.3);
        assert_eq!(round2(100.0 * 0.10), 10.0);
    }
}
