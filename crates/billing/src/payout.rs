//! Payout breakdown for the profit-share report
//!
//! Read-only: lists the balance transactions behind one payout and totals
//! gross, processing fees, and net. Downstream reporting splits the net; this
//! module only establishes the numbers.

use serde::Serialize;

use crate::client::StripeClient;
use crate::error::BillingResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutBreakdown {
    pub payout_id: String,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_cents: i64,
    pub transaction_count: usize,
}

fn accumulate(breakdown: &mut PayoutBreakdown, amount: i64, fee: i64, net: i64) {
    breakdown.gross_cents += amount;
    breakdown.fee_cents += fee;
    breakdown.net_cents += net;
    breakdown.transaction_count += 1;
}

pub struct PayoutReporter {
    stripe: StripeClient,
}

impl PayoutReporter {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Total the balance transactions that fed one payout. The payout row
    /// itself appears in its own transaction list with a negative amount;
    /// it is excluded so the totals describe the money collected, not the
    /// transfer out.
    pub async fn payout_breakdown(&self, payout_id: &str) -> BillingResult<PayoutBreakdown> {
        let transactions = self.stripe.list_payout_transactions(payout_id).await?;

        let mut breakdown = PayoutBreakdown {
            payout_id: payout_id.to_string(),
            ..Default::default()
        };

        for txn in &transactions {
            if txn.type_ == stripe::BalanceTransactionType::Payout {
                continue;
            }
            accumulate(&mut breakdown, txn.amount, txn.fee, txn.net);
        }

        tracing::info!(
            payout_id = %payout_id,
            gross_cents = breakdown.gross_cents,
            fee_cents = breakdown.fee_cents,
            net_cents = breakdown.net_cents,
            transactions = breakdown.transaction_count,
            "Computed payout breakdown"
        );
        Ok(breakdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_add_across_transactions() {
        let mut breakdown = PayoutBreakdown::default();
        accumulate(&mut breakdown, 29000, 870, 28130);
        accumulate(&mut breakdown, 14500, 450, 14050);

        assert_eq!(breakdown.gross_cents, 43500);
        assert_eq!(breakdown.fee_cents, 1320);
        assert_eq!(breakdown.net_cents, 42180);
        assert_eq!(breakdown.transaction_count, 2);
        assert_eq!(
            breakdown.gross_cents - breakdown.fee_cents,
            breakdown.net_cents
        );
    }
}
