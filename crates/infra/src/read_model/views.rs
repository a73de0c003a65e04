//! Typed views over read-model records.
//!
//! A view is the record's field map deserialized into a struct. Missing fields take
//! their defaults, so placeholders deserialize to empty views.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use custos_contract::{BilledType, ContractStatus};
use custos_core::{EntityId, UserId};
use custos_invoice::InvoiceStatus;
use custos_opportunity::{InternalStage, InternalType, RenewalLikelihood};
use custos_organization::{OnboardingStatus, Relationship, Stage};

use super::model::EntityRecord;
use super::store::ReadModelError;

/// Deserialize a record's fields into `T`.
pub fn view<T: DeserializeOwned>(record: &EntityRecord) -> Result<T, ReadModelError> {
    serde_json::from_value(Value::Object(record.fields.clone())).map_err(|e| ReadModelError::Malformed {
        label: record.label.clone(),
        id: record.id,
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrganizationView {
    pub name: String,
    pub description: String,
    pub website: String,
    pub industry: String,
    pub employees: i64,
    pub relationship: Option<Relationship>,
    pub stage: Option<Stage>,
    pub hide: bool,
    pub onboarding_status: OnboardingStatus,
    pub onboarding_comments: String,
    pub onboarding_updated_at: Option<DateTime<Utc>>,
    pub renewal_forecast_arr: Option<f64>,
    pub renewal_forecast_max_arr: Option<f64>,
    pub next_renewal_at: Option<DateTime<Utc>>,
    pub renewal_likelihood: Option<RenewalLikelihood>,
    pub renewal_likelihood_order: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContactView {
    pub first_name: String,
    pub last_name: String,
    pub name: String,
    pub prefix: String,
    pub description: String,
    pub timezone: String,
    pub profile_photo_url: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContractView {
    pub organization_id: Option<EntityId>,
    pub name: String,
    pub contract_url: String,
    pub service_started_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub length_in_months: i64,
    pub billing_cycle_in_months: i64,
    pub currency: String,
    pub approved: bool,
    pub auto_renew: bool,
    pub invoicing_enabled: bool,
    pub status: ContractStatus,
    pub created_by: Option<UserId>,
}

impl ContractView {
    pub fn renews(&self) -> bool {
        self.length_in_months > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OpportunityView {
    pub organization_id: Option<EntityId>,
    pub contract_id: Option<EntityId>,
    pub name: String,
    pub amount: f64,
    pub max_amount: f64,
    pub internal_type: InternalType,
    pub internal_stage: InternalStage,
    pub external_type: String,
    pub external_stage: String,
    pub estimated_closed_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<UserId>,
    pub general_notes: String,
    pub next_steps: String,
    pub closed_at: Option<DateTime<Utc>>,
    pub renewal_likelihood: Option<RenewalLikelihood>,
    pub renewal_adjusted_rate: i64,
    pub renewal_approved: bool,
    pub renewed_at: Option<DateTime<Utc>>,
    pub renewal_comments: String,
    pub renewal_updated_by: Option<UserId>,
    pub renewal_updated_at: Option<DateTime<Utc>>,
}

impl OpportunityView {
    pub fn is_open_renewal(&self) -> bool {
        self.internal_type == InternalType::Renewal && self.internal_stage == InternalStage::Open
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceLineItemView {
    pub contract_id: Option<EntityId>,
    pub parent_id: Option<EntityId>,
    pub name: String,
    pub billed: BilledType,
    pub price: f64,
    pub quantity: i64,
    pub comments: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub canceled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InvoiceView {
    pub contract_id: Option<EntityId>,
    pub currency: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub number: String,
    pub status: InvoiceStatus,
    pub amount: f64,
    pub vat: f64,
    pub total_amount: f64,
    pub note: String,
    pub payment_link: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InvoiceLineView {
    pub name: String,
    pub price: f64,
    pub quantity: i64,
    pub amount: f64,
    pub vat: f64,
    pub total_amount: f64,
    pub service_line_item_id: Option<EntityId>,
    pub billed_type: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::read_model::model::labels;

    #[test]
    fn placeholders_read_as_defaults() {
        let record = EntityRecord::placeholder(labels::CONTRACT, EntityId::new(), Utc::now());
        let contract: ContractView = view(&record).unwrap();
        assert_eq!(contract, ContractView::default());
        assert!(!contract.renews());
    }

    #[test]
    fn enum_fields_use_their_wire_names() {
        let mut record = EntityRecord::new(labels::OPPORTUNITY, EntityId::new(), Utc::now());
        record.fields.insert("internal_type".into(), json!("RENEWAL"));
        record.fields.insert("internal_stage".into(), json!("OPEN"));
        record.fields.insert("renewal_likelihood".into(), json!("LOW"));

        let opportunity: OpportunityView = view(&record).unwrap();
        assert!(opportunity.is_open_renewal());
        assert_eq!(opportunity.renewal_likelihood, Some(RenewalLikelihood::Low));
    }

    #[test]
    fn wrong_types_are_malformed() {
        let mut record = EntityRecord::new(labels::INVOICE, EntityId::new(), Utc::now());
        record.fields.insert("amount".into(), json!("lots"));
        let err = view::<InvoiceView>(&record).unwrap_err();
        assert!(matches!(err, ReadModelError::Malformed { .. }));
    }
}
