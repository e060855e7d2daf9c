//! Status vocabularies for the internal billing tables
//!
//! Both enums are stored as TEXT; the engine binds `as_str()` when writing
//! and compares against the same strings when reading.

use serde::{Deserialize, Serialize};

/// Internal subscription status, a total function of Stripe's status vocabulary
///
/// Stored as TEXT; rows carry the string form and the engine binds `as_str()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Inactive,
    Incomplete,
    Trialing,
}

impl SubscriptionStatus {
    /// Deterministic mapping from the provider's status. Every provider
    /// status maps somewhere; unknown-to-us states degrade to Inactive.
    pub fn from_stripe(status: stripe::SubscriptionStatus) -> Self {
        use stripe::SubscriptionStatus as S;
        match status {
            S::Active => SubscriptionStatus::Active,
            S::PastDue => SubscriptionStatus::PastDue,
            S::Canceled | S::IncompleteExpired => SubscriptionStatus::Canceled,
            S::Incomplete => SubscriptionStatus::Incomplete,
            S::Trialing => SubscriptionStatus::Trialing,
            S::Unpaid | S::Paused => SubscriptionStatus::Inactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a student currently holds a billed seat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Registered,
    Enrolled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Registered => "registered",
            EnrollmentStatus::Enrolled => "enrolled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        use stripe::SubscriptionStatus as S;
        let all = [
            S::Active,
            S::PastDue,
            S::Canceled,
            S::IncompleteExpired,
            S::Incomplete,
            S::Trialing,
            S::Unpaid,
            S::Paused,
        ];
        for s in all {
            // Must not panic and must produce a stable string
            let mapped = SubscriptionStatus::from_stripe(s);
            assert!(!mapped.as_str().is_empty());
        }
    }

    #[test]
    fn canceled_like_states_map_to_canceled() {
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Canceled),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn active_maps_to_active() {
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(SubscriptionStatus::Active.to_string(), "active");
    }
}
