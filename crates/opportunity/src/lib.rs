//! Opportunity domain module (event-sourced).
//!
//! New-business and renewal opportunities share one aggregate. Renewals additionally
//! carry a likelihood, an adjusted rate and the next cycle date.

pub mod opportunity;
pub mod renewal;

pub use opportunity::{
    CloseLostOpportunity, CloseWonOpportunity, CreateOpportunity, CreateRenewalOpportunity,
    InternalStage, InternalType, Opportunity, OpportunityClosedLost, OpportunityClosedWon,
    OpportunityCommand, OpportunityCreated, OpportunityEvent, OpportunityField,
    OpportunityFields, OpportunityUpdated, RenewalCreated, RenewalNextCycleDateUpdated,
    RenewalUpdated, UpdateOpportunity, UpdateRenewalNextCycleDate, UpdateRenewalOpportunity,
};
pub use renewal::{RenewalDetails, RenewalField, RenewalLikelihood, RenewalUpdate, clamp_rate};
