//! Contract lifecycle status, derived from dates and approval rather than stored as input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    #[default]
    Draft,
    Scheduled,
    Live,
    OutOfContract,
    Ended,
}

impl ContractStatus {
    /// Whether the contract currently makes its organization a customer.
    pub fn is_active(self) -> bool {
        !matches!(self, ContractStatus::Draft | ContractStatus::Ended)
    }

    /// Timeline message for reaching this status, if the transition is worth announcing.
    pub fn change_message(self, contract_name: &str) -> Option<String> {
        let name = if contract_name.trim().is_empty() {
            "Unnamed contract"
        } else {
            contract_name
        };
        match self {
            ContractStatus::Live => Some(format!("{name} is now live")),
            ContractStatus::Ended => Some(format!("{name} has ended")),
            ContractStatus::OutOfContract => Some(format!("{name} is now out of contract")),
            ContractStatus::Draft | ContractStatus::Scheduled => None,
        }
    }
}

/// Everything status derivation looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInputs {
    pub approved: bool,
    pub auto_renew: bool,
    pub service_started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `renewed_at` of the contract's active renewal opportunity, if any.
    pub active_renewal_renewed_at: Option<DateTime<Utc>>,
}

/// Derive the status at `now`. Rules apply in order, first match wins.
pub fn derive_status(inputs: &StatusInputs, now: DateTime<Utc>) -> ContractStatus {
    if inputs.ended_at.is_some_and(|ended| ended < now) {
        return ContractStatus::Ended;
    }
    if !inputs.approved {
        return ContractStatus::Draft;
    }
    match inputs.service_started_at {
        None => return ContractStatus::Scheduled,
        Some(started) if started > now => return ContractStatus::Scheduled,
        Some(_) => {}
    }
    if !inputs.auto_renew && inputs.active_renewal_renewed_at.is_some_and(|renewed| renewed < now) {
        return ContractStatus::OutOfContract;
    }
    ContractStatus::Live
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn live_inputs(now: DateTime<Utc>) -> StatusInputs {
        StatusInputs {
            approved: true,
            auto_renew: true,
            service_started_at: Some(now - Duration::days(30)),
            ended_at: None,
            active_renewal_renewed_at: Some(now + Duration::days(300)),
        }
    }

    #[test]
    fn approved_started_contract_is_live() {
        let now = Utc::now();
        assert_eq!(derive_status(&live_inputs(now), now), ContractStatus::Live);
    }

    #[test]
    fn past_end_date_wins_over_everything() {
        let now = Utc::now();
        let inputs = StatusInputs {
            approved: false,
            ended_at: Some(now - Duration::days(1)),
            ..live_inputs(now)
        };
        assert_eq!(derive_status(&inputs, now), ContractStatus::Ended);
    }

    #[test]
    fn future_end_date_keeps_contract_live() {
        let now = Utc::now();
        let inputs = StatusInputs {
            ended_at: Some(now + Duration::days(10)),
            ..live_inputs(now)
        };
        assert_eq!(derive_status(&inputs, now), ContractStatus::Live);
    }

    #[test]
    fn unapproved_is_draft_and_unstarted_is_scheduled() {
        let now = Utc::now();
        let draft = StatusInputs {
            approved: false,
            ..live_inputs(now)
        };
        assert_eq!(derive_status(&draft, now), ContractStatus::Draft);

        let scheduled = StatusInputs {
            service_started_at: Some(now + Duration::days(3)),
            ..live_inputs(now)
        };
        assert_eq!(derive_status(&scheduled, now), ContractStatus::Scheduled);

        let no_start = StatusInputs {
            service_started_at: None,
            ..live_inputs(now)
        };
        assert_eq!(derive_status(&no_start, now), ContractStatus::Scheduled);
    }

    #[test]
    fn lapsed_renewal_without_auto_renew_is_out_of_contract() {
        let now = Utc::now();
        let inputs = StatusInputs {
            auto_renew: false,
            active_renewal_renewed_at: Some(now - Duration::days(1)),
            ..live_inputs(now)
        };
        assert_eq!(derive_status(&inputs, now), ContractStatus::OutOfContract);

        let auto = StatusInputs {
            auto_renew: true,
            ..inputs
        };
        assert_eq!(derive_status(&auto, now), ContractStatus::Live);
    }

    #[test]
    fn change_messages_default_the_name() {
        assert_eq!(
            ContractStatus::Live.change_message(""),
            Some("Unnamed contract is now live".to_string())
        );
        assert_eq!(
            ContractStatus::OutOfContract.change_message("MSA"),
            Some("MSA is now out of contract".to_string())
        );
        assert_eq!(ContractStatus::Scheduled.change_message("MSA"), None);
    }

    proptest! {
        #[test]
        fn past_end_is_always_ended(
            approved in any::<bool>(),
            auto_renew in any::<bool>(),
            ended_days_ago in 1i64..2000,
            started_offset in -2000i64..2000,
        ) {
            let now = Utc::now();
            let inputs = StatusInputs {
                approved,
                auto_renew,
                service_started_at: Some(now + Duration::days(started_offset)),
                ended_at: Some(now - Duration::days(ended_days_ago)),
                active_renewal_renewed_at: None,
            };
            prop_assert_eq!(derive_status(&inputs, now), ContractStatus::Ended);
        }

        #[test]
        fn unapproved_open_contract_is_never_active(started_offset in -2000i64..2000) {
            let now = Utc::now();
            let inputs = StatusInputs {
                service_started_at: Some(now + Duration::days(started_offset)),
                ..StatusInputs::default()
            };
            prop_assert!(!derive_status(&inputs, now).is_active());
        }
    }
}
