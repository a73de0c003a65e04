//! Renewal-specific opportunity data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use custos_core::{EntityId, UserId};

/// How likely a renewal is to close won. Ordered from least to most likely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenewalLikelihood {
    Zero,
    Low,
    Medium,
    High,
}

impl RenewalLikelihood {
    /// Order used by the organization renewal summary. Zero means "no likelihood".
    pub fn order(likelihood: Option<Self>) -> i64 {
        match likelihood {
            Some(RenewalLikelihood::High) => 1,
            Some(RenewalLikelihood::Medium) => 2,
            Some(RenewalLikelihood::Low) => 3,
            Some(RenewalLikelihood::Zero) => 4,
            None => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RenewalLikelihood::Zero => "ZERO",
            RenewalLikelihood::Low => "LOW",
            RenewalLikelihood::Medium => "MEDIUM",
            RenewalLikelihood::High => "HIGH",
        }
    }
}

/// Adjusted renewal rate as a percentage in `0..=100`.
pub fn clamp_rate(rate: i64) -> i64 {
    rate.clamp(0, 100)
}

/// Renewal state held on a renewal opportunity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalDetails {
    pub contract_id: Option<EntityId>,
    pub likelihood: Option<RenewalLikelihood>,
    pub approved: bool,
    pub renewed_at: Option<DateTime<Utc>>,
    pub adjusted_rate: i64,
    pub comments: String,
    pub updated_by: Option<UserId>,
}

impl RenewalDetails {
    /// Likelihood and rate for a new renewal. Missing likelihood means HIGH, and a
    /// HIGH renewal without an explicit rate renews at 100%.
    pub fn normalized_for_create(likelihood: Option<RenewalLikelihood>, rate: i64) -> (RenewalLikelihood, i64) {
        let likelihood = likelihood.unwrap_or(RenewalLikelihood::High);
        let rate = if likelihood == RenewalLikelihood::High && rate == 0 {
            100
        } else {
            rate
        };
        (likelihood, clamp_rate(rate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalField {
    Likelihood,
    AdjustedRate,
    Amount,
    MaxAmount,
    Comments,
    Approved,
    Owner,
    RenewedAt,
}

/// Payload of a renewal update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalUpdate {
    pub likelihood: Option<RenewalLikelihood>,
    pub adjusted_rate: i64,
    pub amount: f64,
    pub max_amount: f64,
    pub comments: String,
    pub approved: bool,
    pub owner_user_id: Option<UserId>,
    pub renewed_at: Option<DateTime<Utc>>,
}

impl RenewalUpdate {
    /// An update without a likelihood resets to HIGH at 100%. The rate is always clamped.
    pub fn normalized(mut self) -> Self {
        if self.likelihood.is_none() {
            self.likelihood = Some(RenewalLikelihood::High);
            self.adjusted_rate = 100;
        }
        self.adjusted_rate = clamp_rate(self.adjusted_rate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn summary_order_ranks_high_first_and_none_last() {
        assert_eq!(RenewalLikelihood::order(Some(RenewalLikelihood::High)), 1);
        assert_eq!(RenewalLikelihood::order(Some(RenewalLikelihood::Zero)), 4);
        assert_eq!(RenewalLikelihood::order(None), 0);
        assert!(RenewalLikelihood::Low < RenewalLikelihood::Medium);
    }

    #[test]
    fn create_defaults_to_high_at_full_rate() {
        assert_eq!(
            RenewalDetails::normalized_for_create(None, 0),
            (RenewalLikelihood::High, 100)
        );
        assert_eq!(
            RenewalDetails::normalized_for_create(Some(RenewalLikelihood::Low), 0),
            (RenewalLikelihood::Low, 0)
        );
        assert_eq!(
            RenewalDetails::normalized_for_create(Some(RenewalLikelihood::Medium), 140),
            (RenewalLikelihood::Medium, 100)
        );
    }

    #[test]
    fn update_without_likelihood_resets_to_high() {
        let update = RenewalUpdate {
            adjusted_rate: 20,
            ..Default::default()
        }
        .normalized();
        assert_eq!(update.likelihood, Some(RenewalLikelihood::High));
        assert_eq!(update.adjusted_rate, 100);
    }

    proptest! {
        #[test]
        fn rate_is_always_a_percentage(rate in any::<i64>()) {
            let clamped = clamp_rate(rate);
            prop_assert!((0..=100).contains(&clamped));

            let update = RenewalUpdate {
                likelihood: Some(RenewalLikelihood::Low),
                adjusted_rate: rate,
                ..Default::default()
            }
            .normalized();
            prop_assert_eq!(update.adjusted_rate, clamped);
        }
    }
}
