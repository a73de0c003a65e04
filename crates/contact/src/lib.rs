//! Contact domain module (event-sourced).
//!
//! People at customer organizations: their profile under the source-of-truth rule
//! and the job roles that tie them to organizations.

pub mod contact;

pub use contact::{
    Contact, ContactCommand, ContactCreated, ContactEvent, ContactField, ContactFields, ContactUpdated,
    CreateContact, JobRole, LinkOrganization, OrganizationLinked, UpdateContact,
};
