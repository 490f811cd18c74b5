//! Snapshots of remote resource data
//!
//! These mirror what the daemon reports for each resource kind. A node of the
//! resource tree caches one immutable [`ResourceData`] snapshot at a time.

use crate::batch::CommandStatus;
use crate::ids::ResourceId;
use crate::resource::{ProposalState, ResourceKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Flat property map as exchanged during negotiation
pub type Properties = BTreeMap<String, Value>;

pub const PRICING_COEFFS_PROPERTY: &str = "golem.com.pricing.model.linear.coeffs";
pub const USAGE_VECTOR_PROPERTY: &str = "golem.com.usage.vector";
pub const USAGE_CPU_SEC: &str = "golem.usage.cpu_sec";
pub const USAGE_DURATION_SEC: &str = "golem.usage.duration_sec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandData {
    pub properties: Properties,
    pub constraints: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalData {
    pub proposal_id: ResourceId,
    pub issuer_id: String,
    pub state: ProposalState,
    /// Set for counter-offers: the proposal this one responds to
    pub prev_proposal_id: Option<ResourceId>,
    pub properties: Properties,
    pub constraints: String,
    pub timestamp: DateTime<Utc>,
}

/// Linear pricing model advertised by a provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearPricing {
    pub start: f64,
    pub per_cpu_sec: f64,
    pub per_duration_sec: f64,
}

impl LinearPricing {
    /// Price of an hour of full-CPU usage, start fee included.
    pub fn hourly_estimate(&self) -> f64 {
        self.start + 3600.0 * (self.per_cpu_sec + self.per_duration_sec)
    }
}

impl ProposalData {
    /// Decode the linear pricing model, if the offer carries one.
    ///
    /// The coefficient list follows the usage vector order with the fixed
    /// start price as its last element.
    pub fn pricing(&self) -> Option<LinearPricing> {
        let coeffs: Vec<f64> = self
            .properties
            .get(PRICING_COEFFS_PROPERTY)?
            .as_array()?
            .iter()
            .map(Value::as_f64)
            .collect::<Option<_>>()?;
        let usage: Vec<&str> = self
            .properties
            .get(USAGE_VECTOR_PROPERTY)?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect::<Option<_>>()?;

        if coeffs.len() != usage.len() + 1 {
            return None;
        }

        let mut pricing = LinearPricing {
            start: coeffs[usage.len()],
            per_cpu_sec: 0.0,
            per_duration_sec: 0.0,
        };
        for (name, coeff) in usage.iter().zip(coeffs.iter()) {
            match *name {
                USAGE_CPU_SEC => pricing.per_cpu_sec = *coeff,
                USAGE_DURATION_SEC => pricing.per_duration_sec = *coeff,
                _ => {}
            }
        }
        Some(pricing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementData {
    pub agreement_id: ResourceId,
    pub proposal_id: ResourceId,
    pub provider_id: String,
    pub valid_to: DateTime<Utc>,
    /// State as reported by the daemon
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    pub activity_id: ResourceId,
    pub agreement_id: ResourceId,
    /// State as reported by the daemon
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchData {
    pub batch_id: ResourceId,
    pub activity_id: ResourceId,
    /// One entry per submitted command, in command order
    pub commands: Vec<CommandStatus>,
    /// Why the batch failed when no single command is to blame
    #[serde(default)]
    pub failure: Option<String>,
}

impl BatchData {
    pub fn new(batch_id: ResourceId, activity_id: ResourceId, size: usize) -> Self {
        Self {
            batch_id,
            activity_id,
            commands: vec![CommandStatus::Pending; size],
            failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationData {
    pub allocation_id: ResourceId,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub remaining_amount: Decimal,
    pub payment_platform: String,
    pub address: String,
    pub timeout: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitNoteData {
    pub debit_note_id: ResourceId,
    pub activity_id: ResourceId,
    pub agreement_id: ResourceId,
    /// Running total due for the activity, including earlier notes
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount_due: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceData {
    pub invoice_id: ResourceId,
    pub agreement_id: ResourceId,
    pub activity_ids: Vec<ResourceId>,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkData {
    pub network_id: ResourceId,
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    /// Member node id to assigned address
    pub nodes: BTreeMap<String, Ipv4Addr>,
}

/// Cached remote snapshot, tagged by resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceData {
    Demand(DemandData),
    Proposal(ProposalData),
    Agreement(AgreementData),
    Activity(ActivityData),
    PoolingBatch(BatchData),
    Allocation(AllocationData),
    DebitNote(DebitNoteData),
    Invoice(InvoiceData),
    Network(NetworkData),
}

impl ResourceData {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceData::Demand(_) => ResourceKind::Demand,
            ResourceData::Proposal(_) => ResourceKind::Proposal,
            ResourceData::Agreement(_) => ResourceKind::Agreement,
            ResourceData::Activity(_) => ResourceKind::Activity,
            ResourceData::PoolingBatch(_) => ResourceKind::PoolingBatch,
            ResourceData::Allocation(_) => ResourceKind::Allocation,
            ResourceData::DebitNote(_) => ResourceKind::DebitNote,
            ResourceData::Invoice(_) => ResourceKind::Invoice,
            ResourceData::Network(_) => ResourceKind::Network,
        }
    }
}

/// Event reported by the market offer stream of a demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent {
    Proposal(ProposalData),
    ProposalRejected {
        proposal_id: ResourceId,
        reason: Option<String>,
    },
}

/// Event reported by the payment event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PaymentEvent {
    DebitNoteReceived {
        debit_note_id: ResourceId,
        event_date: DateTime<Utc>,
    },
    InvoiceReceived {
        invoice_id: ResourceId,
        event_date: DateTime<Utc>,
    },
}

impl PaymentEvent {
    pub fn event_date(&self) -> DateTime<Utc> {
        match self {
            PaymentEvent::DebitNoteReceived { event_date, .. }
            | PaymentEvent::InvoiceReceived { event_date, .. } => *event_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn proposal(props: Properties) -> ProposalData {
        ProposalData {
            proposal_id: ResourceId::new("p1"),
            issuer_id: "provider-1".into(),
            state: ProposalState::Initial,
            prev_proposal_id: None,
            properties: props,
            constraints: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_pricing_follows_usage_vector_order() {
        let mut props = Properties::new();
        props.insert(
            USAGE_VECTOR_PROPERTY.into(),
            json!([USAGE_DURATION_SEC, USAGE_CPU_SEC]),
        );
        props.insert(PRICING_COEFFS_PROPERTY.into(), json!([0.0001, 0.0002, 0.05]));

        let pricing = proposal(props).pricing().unwrap();
        assert_eq!(pricing.start, 0.05);
        assert_eq!(pricing.per_duration_sec, 0.0001);
        assert_eq!(pricing.per_cpu_sec, 0.0002);
    }

    #[test]
    fn test_pricing_missing_or_malformed() {
        assert!(proposal(Properties::new()).pricing().is_none());

        let mut props = Properties::new();
        props.insert(USAGE_VECTOR_PROPERTY.into(), json!([USAGE_CPU_SEC]));
        props.insert(PRICING_COEFFS_PROPERTY.into(), json!([0.1]));
        assert!(proposal(props).pricing().is_none());
    }
}
