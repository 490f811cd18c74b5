//! Resource kinds and their lifecycle states
//!
//! Every marketplace entity is a node of one closed set of kinds. Local
//! lifecycle state is tracked per kind and validated on every transition.

use crate::ids::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of resource kinds making up the resource tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Demand,
    Proposal,
    Agreement,
    Activity,
    PoolingBatch,
    Allocation,
    DebitNote,
    Invoice,
    Network,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Demand => "demand",
            ResourceKind::Proposal => "proposal",
            ResourceKind::Agreement => "agreement",
            ResourceKind::Activity => "activity",
            ResourceKind::PoolingBatch => "batch",
            ResourceKind::Allocation => "allocation",
            ResourceKind::DebitNote => "debit_note",
            ResourceKind::Invoice => "invoice",
            ResourceKind::Network => "network",
        }
    }

    /// Lifecycle state a freshly created node of this kind starts in.
    pub fn initial_state(&self) -> LifecycleState {
        match self {
            ResourceKind::Demand => LifecycleState::Demand(DemandState::Subscribed),
            ResourceKind::Proposal => LifecycleState::Proposal(ProposalState::Initial),
            ResourceKind::Agreement => LifecycleState::Agreement(AgreementState::Pending),
            ResourceKind::Activity => LifecycleState::Activity(ActivityState::New),
            ResourceKind::PoolingBatch => LifecycleState::Batch(BatchState::Running),
            ResourceKind::Allocation => LifecycleState::Allocation(AllocationState::Active),
            ResourceKind::DebitNote | ResourceKind::Invoice => {
                LifecycleState::Document(DocumentStatus::Received)
            }
            ResourceKind::Network => LifecycleState::Network(NetworkState::Active),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, id) pair naming one node of the resource tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: ResourceId,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<ResourceId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DemandState {
    Subscribed,
    Unsubscribed,
}

/// Negotiation state of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalState {
    /// First offer received from a provider in response to a demand
    Initial,
    /// Counter-offer, either ours or the provider's reply to ours
    Draft,
    /// Terminal
    Rejected,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgreementState {
    Pending,
    Approved,
    Terminated,
}

impl AgreementState {
    pub fn can_transition_to(&self, next: AgreementState) -> bool {
        use AgreementState::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Terminated) | (Approved, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementState::Pending => "pending",
            AgreementState::Approved => "approved",
            AgreementState::Terminated => "terminated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(AgreementState::Pending),
            "approved" => Some(AgreementState::Approved),
            "terminated" => Some(AgreementState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityState {
    New,
    Idle,
    Busy,
    Destroyed,
}

impl ActivityState {
    pub fn can_transition_to(&self, next: ActivityState) -> bool {
        use ActivityState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (New, Idle) | (New, Busy) | (Idle, Busy) | (Busy, Idle) => true,
            (a, b) => *a == b,
        }
    }
}

/// State of a submitted batch. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    Running,
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Running => "running",
            BatchState::Success => "success",
            BatchState::Failed => "failed",
            BatchState::TimedOut => "timed_out",
            BatchState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationState {
    Active,
    Released,
}

/// Acceptance decision of a payment document. Final once not `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    Received,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkState {
    Active,
    Removed,
}

/// Local lifecycle state of a node, one variant per kind family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Demand(DemandState),
    Proposal(ProposalState),
    Agreement(AgreementState),
    Activity(ActivityState),
    Batch(BatchState),
    Allocation(AllocationState),
    Document(DocumentStatus),
    Network(NetworkState),
}

impl LifecycleState {
    pub fn proposal(&self) -> Option<ProposalState> {
        match self {
            LifecycleState::Proposal(s) => Some(*s),
            _ => None,
        }
    }

    pub fn agreement(&self) -> Option<AgreementState> {
        match self {
            LifecycleState::Agreement(s) => Some(*s),
            _ => None,
        }
    }

    pub fn activity(&self) -> Option<ActivityState> {
        match self {
            LifecycleState::Activity(s) => Some(*s),
            _ => None,
        }
    }

    pub fn batch(&self) -> Option<BatchState> {
        match self {
            LifecycleState::Batch(s) => Some(*s),
            _ => None,
        }
    }

    pub fn document(&self) -> Option<DocumentStatus> {
        match self {
            LifecycleState::Document(s) => Some(*s),
            _ => None,
        }
    }
}
