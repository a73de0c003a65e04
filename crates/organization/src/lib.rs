//! Organization domain module (event-sourced).
//!
//! Business rules for organizations: profile data under the source-of-truth rule,
//! parent/subsidiary links, onboarding status, and the refresh requests that the
//! projection side answers by recomputing derived renewal figures.

pub mod onboarding;
pub mod organization;

pub use onboarding::OnboardingStatus;
pub use organization::{
    AddParent, ArrRefreshed, CreateOrganization, OnboardingStatusUpdated, Organization,
    OrganizationCommand, OrganizationCreated, OrganizationEvent, OrganizationField,
    OrganizationFields, OrganizationUpdated, ParentAdded, ParentRemoved, RefreshArr,
    RefreshRenewalSummary, Relationship, RemoveParent, RenewalSummaryRefreshed, Stage,
    UpdateOnboardingStatus, UpdateOrganization,
};
