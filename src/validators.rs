//! Claim validators and the ordered chain that runs them.
//!
//! Validators are pure functions over claim state plus caller context; they
//! never perform I/O. A validator that needs fresher data reports
//! `should_refetch` and the caller obtains the value through a
//! [`ClaimSource`] before re-validating.
//!
//! Claim entries use a small freshness envelope, `{"v": <value>, "t":
//! <updated-at-seconds>}`, so a validator can apply a per-claim max age.

use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Wrap a claim value in its freshness envelope.
#[must_use]
pub fn entry(value: Value, updated_at_seconds: i64) -> Value {
    json!({ "v": value, "t": updated_at_seconds })
}

/// The value inside a claim envelope.
#[must_use]
pub fn entry_value(claim: &Value) -> Option<&Value> {
    claim.get("v")
}

/// When the claim value was last written.
#[must_use]
pub fn entry_updated_at(claim: &Value) -> Option<i64> {
    claim.get("t").and_then(Value::as_i64)
}

/// Caller context handed to every validator.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub session_handle: String,
    pub user_id: String,
    pub recipe_user_id: String,
    pub now_unix_seconds: i64,
}

/// Outcome of a single validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCheck {
    pub is_valid: bool,
    pub reason: Option<String>,
}

impl ClaimCheck {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            is_valid: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait ClaimValidator: Send + Sync {
    fn claim_key(&self) -> &str;

    fn validate(&self, value: Option<&Value>, ctx: &ValidationContext) -> ClaimCheck;

    /// Whether a fresh claim value should be obtained before validating.
    /// The chain itself never fetches; it only signals.
    fn should_refetch(&self, _value: Option<&Value>, _ctx: &ValidationContext) -> bool {
        false
    }
}

/// Supplies fresh claim values when a validator requests a refetch.
///
/// Implemented by the application over whatever owns the claim (a user
/// record, an MFA service). The default does nothing, so stale values are
/// validated as-is.
pub trait ClaimSource: Send + Sync {
    fn fetch_claim(&self, claim_key: &str, ctx: &ValidationContext) -> Option<Value>;
}

#[derive(Clone, Debug)]
pub struct NoopClaimSource;

impl ClaimSource for NoopClaimSource {
    fn fetch_claim(&self, _claim_key: &str, _ctx: &ValidationContext) -> Option<Value> {
        None
    }
}

/// Requires a boolean claim to be `true`.
pub struct BooleanClaimValidator {
    claim_key: String,
    max_age_seconds: Option<i64>,
}

impl BooleanClaimValidator {
    #[must_use]
    pub fn is_true(claim_key: impl Into<String>) -> Self {
        Self {
            claim_key: claim_key.into(),
            max_age_seconds: None,
        }
    }

    #[must_use]
    pub fn with_max_age_seconds(mut self, seconds: i64) -> Self {
        self.max_age_seconds = Some(seconds);
        self
    }
}

impl ClaimValidator for BooleanClaimValidator {
    fn claim_key(&self) -> &str {
        &self.claim_key
    }

    fn validate(&self, value: Option<&Value>, _ctx: &ValidationContext) -> ClaimCheck {
        match value.and_then(entry_value).and_then(Value::as_bool) {
            Some(true) => ClaimCheck::pass(),
            Some(false) => ClaimCheck::fail("expected true, found false"),
            None => ClaimCheck::fail("claim is missing"),
        }
    }

    fn should_refetch(&self, value: Option<&Value>, ctx: &ValidationContext) -> bool {
        stale_or_missing(value, self.max_age_seconds, ctx.now_unix_seconds)
    }
}

/// Requires a claim to equal an expected primitive value.
pub struct PrimitiveClaimValidator {
    claim_key: String,
    expected: Value,
    max_age_seconds: Option<i64>,
}

impl PrimitiveClaimValidator {
    #[must_use]
    pub fn equals(claim_key: impl Into<String>, expected: Value) -> Self {
        Self {
            claim_key: claim_key.into(),
            expected,
            max_age_seconds: None,
        }
    }

    #[must_use]
    pub fn with_max_age_seconds(mut self, seconds: i64) -> Self {
        self.max_age_seconds = Some(seconds);
        self
    }
}

impl ClaimValidator for PrimitiveClaimValidator {
    fn claim_key(&self) -> &str {
        &self.claim_key
    }

    fn validate(&self, value: Option<&Value>, _ctx: &ValidationContext) -> ClaimCheck {
        match value.and_then(entry_value) {
            Some(found) if *found == self.expected => ClaimCheck::pass(),
            Some(found) => ClaimCheck::fail(format!(
                "expected {}, found {found}",
                self.expected
            )),
            None => ClaimCheck::fail("claim is missing"),
        }
    }

    fn should_refetch(&self, value: Option<&Value>, ctx: &ValidationContext) -> bool {
        stale_or_missing(value, self.max_age_seconds, ctx.now_unix_seconds)
    }
}

fn stale_or_missing(value: Option<&Value>, max_age_seconds: Option<i64>, now: i64) -> bool {
    let Some(claim) = value else {
        return true;
    };
    match (max_age_seconds, entry_updated_at(claim)) {
        (Some(max_age), Some(updated_at)) => now - updated_at > max_age,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Result of running the chain once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Ok,
    /// A fresh value for `claim_key` should be obtained, then the chain
    /// re-run with the key marked as refetched.
    RefetchRequired { claim_key: String },
    Failed {
        claim_key: String,
        reason: String,
    },
}

/// Run validators in caller-specified order, short-circuiting on the first
/// failure. Keys in `already_refetched` no longer signal a refetch, which
/// bounds the refetch loop for the caller.
#[must_use]
pub fn run_validators(
    claims: &Map<String, Value>,
    validators: &[Arc<dyn ClaimValidator>],
    ctx: &ValidationContext,
    already_refetched: &HashSet<String>,
) -> ChainOutcome {
    for validator in validators {
        let key = validator.claim_key();
        let value = claims.get(key);
        if !already_refetched.contains(key) && validator.should_refetch(value, ctx) {
            return ChainOutcome::RefetchRequired {
                claim_key: key.to_string(),
            };
        }
        let check = validator.validate(value, ctx);
        if !check.is_valid {
            return ChainOutcome::Failed {
                claim_key: key.to_string(),
                reason: check.reason.unwrap_or_else(|| "invalid claim".to_string()),
            };
        }
    }
    ChainOutcome::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: i64 = 1_700_000_000;

    fn ctx() -> ValidationContext {
        ValidationContext {
            session_handle: "h1".to_string(),
            user_id: "u1".to_string(),
            recipe_user_id: "ru1".to_string(),
            now_unix_seconds: NOW,
        }
    }

    struct CountingValidator {
        key: String,
        pass: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ClaimValidator for CountingValidator {
        fn claim_key(&self) -> &str {
            &self.key
        }

        fn validate(&self, _value: Option<&Value>, _ctx: &ValidationContext) -> ClaimCheck {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.pass {
                ClaimCheck::pass()
            } else {
                ClaimCheck::fail("forced failure")
            }
        }
    }

    #[test]
    fn chain_short_circuits_on_first_failure() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let validators: Vec<Arc<dyn ClaimValidator>> = vec![
            Arc::new(CountingValidator {
                key: "a".to_string(),
                pass: false,
                calls: Arc::clone(&a_calls),
            }),
            Arc::new(CountingValidator {
                key: "b".to_string(),
                pass: true,
                calls: Arc::clone(&b_calls),
            }),
        ];

        let outcome = run_validators(&Map::new(), &validators, &ctx(), &HashSet::new());
        assert_eq!(
            outcome,
            ChainOutcome::Failed {
                claim_key: "a".to_string(),
                reason: "forced failure".to_string(),
            }
        );
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn boolean_validator_checks_envelope_value() {
        let validator = BooleanClaimValidator::is_true("emailVerified");
        let mut claims = Map::new();
        claims.insert("emailVerified".to_string(), entry(json!(false), NOW));

        let check = validator.validate(claims.get("emailVerified"), &ctx());
        assert!(!check.is_valid);

        claims.insert("emailVerified".to_string(), entry(json!(true), NOW));
        let check = validator.validate(claims.get("emailVerified"), &ctx());
        assert!(check.is_valid);
    }

    #[test]
    fn missing_claim_requests_refetch_then_fails() {
        let validators: Vec<Arc<dyn ClaimValidator>> =
            vec![Arc::new(BooleanClaimValidator::is_true("mfaDone"))];
        let claims = Map::new();

        let outcome = run_validators(&claims, &validators, &ctx(), &HashSet::new());
        assert_eq!(
            outcome,
            ChainOutcome::RefetchRequired {
                claim_key: "mfaDone".to_string(),
            }
        );

        // Once the caller has tried (and failed) to refetch, validation runs
        // against the missing value and fails.
        let refetched: HashSet<String> = ["mfaDone".to_string()].into_iter().collect();
        let outcome = run_validators(&claims, &validators, &ctx(), &refetched);
        assert!(matches!(outcome, ChainOutcome::Failed { claim_key, .. } if claim_key == "mfaDone"));
    }

    #[test]
    fn max_age_triggers_refetch_for_stale_entries() {
        let validator = BooleanClaimValidator::is_true("emailVerified").with_max_age_seconds(300);
        let mut claims = Map::new();
        claims.insert("emailVerified".to_string(), entry(json!(true), NOW - 600));

        assert!(validator.should_refetch(claims.get("emailVerified"), &ctx()));

        claims.insert("emailVerified".to_string(), entry(json!(true), NOW - 60));
        assert!(!validator.should_refetch(claims.get("emailVerified"), &ctx()));
    }

    #[test]
    fn primitive_validator_compares_expected_value() {
        let validator = PrimitiveClaimValidator::equals("plan", json!("pro"));
        let mut claims = Map::new();
        claims.insert("plan".to_string(), entry(json!("free"), NOW));

        let check = validator.validate(claims.get("plan"), &ctx());
        assert!(!check.is_valid);
        assert!(check.reason.unwrap().contains("pro"));

        claims.insert("plan".to_string(), entry(json!("pro"), NOW));
        assert!(validator.validate(claims.get("plan"), &ctx()).is_valid);
    }
}
