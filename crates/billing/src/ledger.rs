//! Payment ledger writer
//!
//! Appends immutable per-student payment rows for a paid invoice. One invoice
//! covering several siblings produces one row per student; the unique
//! (student_id, stripe_invoice_id) constraint plus `ON CONFLICT DO NOTHING`
//! makes redelivered invoice events no-ops instead of duplicate charges.

use sqlx::{PgPool, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Per-student share of a paid invoice: integer floor of an even split.
///
/// Any remainder cents are dropped, not assigned. This matches the legacy
/// system's behavior and is deliberate: with monthly tuition amounts the
/// remainder is at most `count - 1` cents and the ledger is reporting, not
/// the source of truth for money.
pub fn split_amount(total_cents: i64, count: usize) -> i64 {
    if count == 0 {
        return 0;
    }
    total_cents / count as i64
}

pub struct PaymentLedgerWriter {
    pool: PgPool,
}

impl PaymentLedgerWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one ledger row per covered student for a paid invoice.
    ///
    /// Returns the number of rows actually inserted; on redelivery this is 0
    /// and the call is still a success.
    pub async fn record_invoice_payment(
        &self,
        invoice_id: &str,
        student_ids: &[Uuid],
        total_paid_cents: i64,
        period_start: OffsetDateTime,
        paid_at: OffsetDateTime,
    ) -> BillingResult<u64> {
        if student_ids.is_empty() {
            tracing::warn!(
                invoice_id = %invoice_id,
                "Invoice paid but no covered students in subscription metadata"
            );
            return Ok(0);
        }

        let per_student = split_amount(total_paid_cents, student_ids.len());
        let year = period_start.year();
        let month = u8::from(period_start.month()) as i32;

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO student_payments \
             (id, student_id, stripe_invoice_id, amount_cents, year, month, paid_at) ",
        );
        qb.push_values(student_ids, |mut row, student_id| {
            row.push_bind(Uuid::new_v4())
                .push_bind(student_id)
                .push_bind(invoice_id)
                .push_bind(per_student)
                .push_bind(year)
                .push_bind(month)
                .push_bind(paid_at);
        });
        qb.push(" ON CONFLICT (student_id, stripe_invoice_id) DO NOTHING");

        let result = qb.build().execute(&self.pool).await?;
        let inserted = result.rows_affected();

        tracing::info!(
            invoice_id = %invoice_id,
            students = student_ids.len(),
            per_student_cents = per_student,
            inserted = inserted,
            year = year,
            month = month,
            "Recorded invoice payment in student ledger"
        );

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_has_no_remainder() {
        // $290 invoice over two siblings: $145 each
        assert_eq!(split_amount(29000, 2), 14500);
    }

    #[test]
    fn uneven_split_floors_and_drops_remainder() {
        assert_eq!(split_amount(100, 3), 33);
        // 1 cent of remainder is dropped, by design
        assert_eq!(split_amount(100, 3) * 3, 99);
    }

    #[test]
    fn single_student_takes_full_amount() {
        assert_eq!(split_amount(25000, 1), 25000);
    }

    #[test]
    fn zero_students_yields_zero() {
        assert_eq!(split_amount(29000, 0), 0);
    }

    #[test]
    fn split_sum_never_exceeds_total() {
        for total in [0i64, 1, 99, 100, 29000, 29001] {
            for count in 1usize..=5 {
                let sum = split_amount(total, count) * count as i64;
                assert!(sum <= total, "split of {} over {} overshot", total, count);
                assert!(total - sum < count as i64, "dropped more than count-1 cents");
            }
        }
    }
}
