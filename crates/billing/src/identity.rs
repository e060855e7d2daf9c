//! Identity resolution
//!
//! Maps an external billing identity (customer email plus whatever hints are
//! available) to at most one internal student or payer. The cascade stops at
//! the first stage that yields exactly one candidate; a stage with several
//! candidates makes the whole resolution ambiguous, which is escalated to
//! manual review rather than guessed at.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Signals available for one resolution attempt
#[derive(Debug, Clone, Default)]
pub struct ExternalIdentity {
    /// Stripe customer id, when the caller has one
    pub customer_id: Option<String>,
    /// Stripe subscription id, when the caller has one (checkout flows)
    pub subscription_id: Option<String>,
    pub email: Option<String>,
    /// Free-text student name, e.g. from a checkout custom field
    pub name_hint: Option<String>,
    pub phone: Option<String>,
    /// Restrict every stage to students with no stored subscription link;
    /// payer records are excluded entirely. Link-establishing flows must
    /// never steal an already-linked student.
    pub unlinked_students_only: bool,
}

/// A single internal record the cascade found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchedParty {
    Student { id: Uuid, name: String },
    Payer { id: Uuid, name: String },
}

/// Outcome of one resolution attempt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    /// Exactly one candidate; safe to act on automatically
    Match {
        stage: &'static str,
        party: MatchedParty,
    },
    /// Several candidates at one stage; requires a human decision
    Ambiguous {
        stage: &'static str,
        candidates: Vec<MatchedParty>,
    },
    /// No stage produced a candidate
    Unmatched,
}

impl Resolution {
    pub fn matched(&self) -> Option<&MatchedParty> {
        match self {
            Resolution::Match { party, .. } => Some(party),
            _ => None,
        }
    }
}

/// One step of a resolution cascade. Each stage is skipped when its input
/// signal is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    StoredLinkage,
    ExactEmail,
    NormalizedEmail,
    PhoneDigits,
    NameHint,
}

/// Default precedence: stored linkage and email evidence outrank the softer
/// phone and name signals.
const GENERIC_STAGE_ORDER: [Stage; 5] = [
    Stage::StoredLinkage,
    Stage::ExactEmail,
    Stage::NormalizedEmail,
    Stage::PhoneDigits,
    Stage::NameHint,
];

/// Checkout precedence: the custom fields describe the student directly,
/// while the payer email only describes who paid.
const CHECKOUT_STAGE_ORDER: [Stage; 4] = [
    Stage::NameHint,
    Stage::PhoneDigits,
    Stage::ExactEmail,
    Stage::NormalizedEmail,
];

/// Lowercase, strip `.` from the local part, truncate the local part at the
/// first `+`. Catches provider plus-addressing and dot-variant duplicates.
pub fn normalize_email(email: &str) -> String {
    let lower = email.trim().to_lowercase();
    match lower.split_once('@') {
        Some((local, domain)) => {
            let local = local.split('+').next().unwrap_or("");
            let local: String = local.chars().filter(|c| *c != '.').collect();
            format!("{}@{}", local, domain)
        }
        None => lower,
    }
}

/// Keep only ascii digits, for phone comparison across formatting styles
pub fn phone_digits(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// One cascade stage's verdict: `None` means fall through to the next stage
fn decide(stage: &'static str, candidates: Vec<MatchedParty>) -> Option<Resolution> {
    match candidates.len() {
        0 => None,
        1 => candidates.into_iter().next().map(|party| Resolution::Match { stage, party }),
        _ => Some(Resolution::Ambiguous { stage, candidates }),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PartyRow {
    id: Uuid,
    name: String,
    email: Option<String>,
    phone: Option<String>,
}

pub struct IdentityResolver {
    pool: PgPool,
}

impl IdentityResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the default cascade. Stages, in order: stored linkage, exact
    /// email, normalized email, phone digits, name hint.
    pub async fn resolve(&self, identity: &ExternalIdentity) -> BillingResult<Resolution> {
        self.run_cascade(&GENERIC_STAGE_ORDER, identity).await
    }

    /// Checkout-flow cascade: find exactly one student with no stored
    /// subscription link, preferring the student-describing hints over the
    /// payer's email.
    pub async fn resolve_unlinked_student(
        &self,
        name_hint: Option<&str>,
        phone: Option<&str>,
        payer_email: Option<&str>,
    ) -> BillingResult<Resolution> {
        let identity = ExternalIdentity {
            email: payer_email.map(str::to_string),
            name_hint: name_hint.map(str::to_string),
            phone: phone.map(str::to_string),
            unlinked_students_only: true,
            ..Default::default()
        };
        self.run_cascade(&CHECKOUT_STAGE_ORDER, &identity).await
    }

    async fn run_cascade(
        &self,
        stages: &[Stage],
        identity: &ExternalIdentity,
    ) -> BillingResult<Resolution> {
        for stage in stages {
            if let Some(resolution) = self.run_stage(*stage, identity).await? {
                return Ok(resolution);
            }
        }
        Ok(Resolution::Unmatched)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        identity: &ExternalIdentity,
    ) -> BillingResult<Option<Resolution>> {
        let unlinked_only = identity.unlinked_students_only;
        match stage {
            Stage::StoredLinkage => self.stage_stored_linkage(identity).await,
            Stage::ExactEmail => match identity.email.as_deref() {
                Some(email) => self.stage_exact_email(email, unlinked_only).await,
                None => Ok(None),
            },
            Stage::NormalizedEmail => match identity.email.as_deref() {
                Some(email) => self.stage_normalized_email(email, unlinked_only).await,
                None => Ok(None),
            },
            Stage::PhoneDigits => match identity.phone.as_deref() {
                Some(phone) => self.stage_phone(phone, unlinked_only).await,
                None => Ok(None),
            },
            Stage::NameHint => match identity.name_hint.as_deref() {
                Some(name) => self.stage_name(name, unlinked_only).await,
                None => Ok(None),
            },
        }
    }

    /// A payer already carries this customer id, or a student already
    /// carries this subscription id
    async fn stage_stored_linkage(
        &self,
        identity: &ExternalIdentity,
    ) -> BillingResult<Option<Resolution>> {
        if let Some(customer_id) = identity.customer_id.as_deref() {
            let payer: Option<(Uuid, String)> =
                sqlx::query_as("SELECT id, name FROM payers WHERE stripe_customer_id = $1")
                    .bind(customer_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((id, name)) = payer {
                return Ok(Some(Resolution::Match {
                    stage: "stored_linkage",
                    party: MatchedParty::Payer { id, name },
                }));
            }
        }

        if let Some(subscription_id) = identity.subscription_id.as_deref() {
            let student: Option<(Uuid, String)> =
                sqlx::query_as("SELECT id, name FROM students WHERE stripe_subscription_id = $1")
                    .bind(subscription_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((id, name)) = student {
                return Ok(Some(Resolution::Match {
                    stage: "stored_linkage",
                    party: MatchedParty::Student { id, name },
                }));
            }
        }

        Ok(None)
    }

    /// Case-insensitive exact email. Searches students and payers, or only
    /// unlinked students when restricted.
    async fn stage_exact_email(
        &self,
        email: &str,
        unlinked_only: bool,
    ) -> BillingResult<Option<Resolution>> {
        let mut candidates: Vec<MatchedParty> = Vec::new();

        let student_query = if unlinked_only {
            "SELECT id, name FROM students \
             WHERE LOWER(email) = LOWER($1) AND stripe_subscription_id IS NULL"
        } else {
            "SELECT id, name FROM students WHERE LOWER(email) = LOWER($1)"
        };
        let students: Vec<(Uuid, String)> = sqlx::query_as(student_query)
            .bind(email)
            .fetch_all(&self.pool)
            .await?;
        candidates.extend(
            students
                .into_iter()
                .map(|(id, name)| MatchedParty::Student { id, name }),
        );

        if !unlinked_only {
            let payers: Vec<(Uuid, String)> =
                sqlx::query_as("SELECT id, name FROM payers WHERE LOWER(email) = LOWER($1)")
                    .bind(email)
                    .fetch_all(&self.pool)
                    .await?;
            candidates.extend(
                payers
                    .into_iter()
                    .map(|(id, name)| MatchedParty::Payer { id, name }),
            );
        }

        Ok(decide("exact_email", candidates))
    }

    /// Normalized email comparison, done in Rust because the normalization
    /// (strip dots, cut at `+`) is not expressible as an index
    async fn stage_normalized_email(
        &self,
        email: &str,
        unlinked_only: bool,
    ) -> BillingResult<Option<Resolution>> {
        let target = normalize_email(email);
        let mut candidates: Vec<MatchedParty> = Vec::new();

        let student_query = if unlinked_only {
            "SELECT id, name, email, phone FROM students \
             WHERE email IS NOT NULL AND stripe_subscription_id IS NULL"
        } else {
            "SELECT id, name, email, phone FROM students WHERE email IS NOT NULL"
        };
        let students: Vec<PartyRow> = sqlx::query_as(student_query)
            .fetch_all(&self.pool)
            .await?;
        candidates.extend(students.into_iter().filter_map(|row| {
            let email = row.email.as_deref()?;
            (normalize_email(email) == target)
                .then(|| MatchedParty::Student { id: row.id, name: row.name })
        }));

        if !unlinked_only {
            let payers: Vec<PartyRow> =
                sqlx::query_as("SELECT id, name, email, phone FROM payers")
                    .fetch_all(&self.pool)
                    .await?;
            candidates.extend(payers.into_iter().filter_map(|row| {
                let email = row.email.as_deref()?;
                (normalize_email(email) == target)
                    .then(|| MatchedParty::Payer { id: row.id, name: row.name })
            }));
        }

        Ok(decide("normalized_email", candidates))
    }

    /// Digits-only phone comparison against students
    async fn stage_phone(
        &self,
        phone: &str,
        unlinked_only: bool,
    ) -> BillingResult<Option<Resolution>> {
        let target = phone_digits(phone);
        if target.is_empty() {
            return Ok(None);
        }

        let query = if unlinked_only {
            "SELECT id, name, email, phone FROM students \
             WHERE phone IS NOT NULL AND stripe_subscription_id IS NULL"
        } else {
            "SELECT id, name, email, phone FROM students WHERE phone IS NOT NULL"
        };
        let students: Vec<PartyRow> = sqlx::query_as(query).fetch_all(&self.pool).await?;

        let candidates: Vec<MatchedParty> = students
            .into_iter()
            .filter_map(|row| {
                let phone = row.phone.as_deref()?;
                (phone_digits(phone) == target)
                    .then(|| MatchedParty::Student { id: row.id, name: row.name })
            })
            .collect();

        Ok(decide("phone_digits", candidates))
    }

    /// Case-insensitive exact name against the free-text hint.
    /// Best-effort heuristic; a single hit is still only as good as the name.
    async fn stage_name(
        &self,
        name: &str,
        unlinked_only: bool,
    ) -> BillingResult<Option<Resolution>> {
        let query = if unlinked_only {
            "SELECT id, name FROM students \
             WHERE LOWER(name) = LOWER(TRIM($1)) AND stripe_subscription_id IS NULL"
        } else {
            "SELECT id, name FROM students WHERE LOWER(name) = LOWER(TRIM($1))"
        };
        let students: Vec<(Uuid, String)> = sqlx::query_as(query)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;

        let candidates: Vec<MatchedParty> = students
            .into_iter()
            .map(|(id, name)| MatchedParty::Student { id, name })
            .collect();

        Ok(decide("name_hint", candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_lowercases_and_strips_dots() {
        assert_eq!(normalize_email("Jane.Doe@Example.COM"), "janedoe@example.com");
    }

    #[test]
    fn normalization_cuts_plus_addressing() {
        assert_eq!(
            normalize_email("jane+tuition@example.com"),
            "jane@example.com"
        );
        assert_eq!(
            normalize_email("j.a.n.e+x+y@example.com"),
            "jane@example.com"
        );
    }

    #[test]
    fn normalization_leaves_domain_dots_alone() {
        assert_eq!(normalize_email("jane@mail.example.com"), "jane@mail.example.com");
    }

    #[test]
    fn normalization_tolerates_missing_at() {
        assert_eq!(normalize_email("not-an-email"), "not-an-email");
    }

    #[test]
    fn phone_digits_strips_formatting() {
        assert_eq!(phone_digits("+1 (555) 010-2233"), "15550102233");
        assert_eq!(phone_digits("555.010.2233"), "5550102233");
        assert_eq!(phone_digits(""), "");
    }

    #[test]
    fn single_candidate_is_a_match() {
        let id = Uuid::new_v4();
        let r = decide(
            "exact_email",
            vec![MatchedParty::Student { id, name: "A".into() }],
        );
        match r {
            Some(Resolution::Match { stage, party }) => {
                assert_eq!(stage, "exact_email");
                assert_eq!(party, MatchedParty::Student { id, name: "A".into() });
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn several_candidates_are_ambiguous_not_first_wins() {
        let r = decide(
            "phone_digits",
            vec![
                MatchedParty::Student { id: Uuid::new_v4(), name: "A".into() },
                MatchedParty::Student { id: Uuid::new_v4(), name: "B".into() },
            ],
        );
        assert!(matches!(
            r,
            Some(Resolution::Ambiguous { stage: "phone_digits", ref candidates }) if candidates.len() == 2
        ));
    }

    #[test]
    fn no_candidates_fall_through() {
        assert!(decide("name_hint", vec![]).is_none());
    }

    fn position(order: &[Stage], stage: Stage) -> usize {
        order
            .iter()
            .position(|s| *s == stage)
            .unwrap_or_else(|| panic!("{:?} missing from cascade", stage))
    }

    #[test]
    fn generic_cascade_puts_email_evidence_before_hints() {
        let order = &GENERIC_STAGE_ORDER;
        assert_eq!(order[0], Stage::StoredLinkage);
        assert!(position(order, Stage::ExactEmail) < position(order, Stage::NormalizedEmail));
        assert!(position(order, Stage::NormalizedEmail) < position(order, Stage::PhoneDigits));
        assert!(position(order, Stage::PhoneDigits) < position(order, Stage::NameHint));
    }

    #[test]
    fn checkout_cascade_puts_student_hints_before_payer_email() {
        let order = &CHECKOUT_STAGE_ORDER;
        assert!(position(order, Stage::NameHint) < position(order, Stage::PhoneDigits));
        assert!(position(order, Stage::PhoneDigits) < position(order, Stage::ExactEmail));
        assert!(position(order, Stage::ExactEmail) < position(order, Stage::NormalizedEmail));
    }
}
