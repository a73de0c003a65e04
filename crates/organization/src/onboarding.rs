use serde::{Deserialize, Serialize};

/// Customer onboarding progress for an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnboardingStatus {
    #[default]
    NotApplicable,
    NotStarted,
    OnTrack,
    Late,
    Stuck,
    Done,
    Successful,
}

impl OnboardingStatus {
    /// Label used in timeline messages.
    pub fn display_name(self) -> &'static str {
        match self {
            OnboardingStatus::NotApplicable => "Not applicable",
            OnboardingStatus::NotStarted => "Not started",
            OnboardingStatus::OnTrack => "On track",
            OnboardingStatus::Late => "Late",
            OnboardingStatus::Stuck => "Stuck",
            OnboardingStatus::Done => "Done",
            OnboardingStatus::Successful => "Successful",
        }
    }

    /// Timeline message for a status change. `user` is the acting user's display name.
    pub fn change_message(self, user: Option<&str>) -> String {
        match user {
            Some(user) if !user.trim().is_empty() => {
                format!("{user} changed the onboarding status to {}", self.display_name())
            }
            _ => format!(
                "The onboarding status was automatically set to {}",
                self.display_name()
            ),
        }
    }
}
