//! Lifecycle events published on the event bus

use crate::ids::ResourceId;
use crate::resource::{BatchState, LifecycleState, ResourceKind, ResourceRef};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an activity was (or should be) stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopReason {
    TooExpensive,
    BudgetExhausted,
    TooManyFailures,
    AppClosing,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TooExpensive => "too expensive",
            StopReason::BudgetExhausted => "budget exhausted",
            StopReason::TooManyFailures => "too many failures",
            StopReason::AppClosing => "app closing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "too expensive" => Some(StopReason::TooExpensive),
            "budget exhausted" => Some(StopReason::BudgetExhausted),
            "too many failures" => Some(StopReason::TooManyFailures),
            "app closing" => Some(StopReason::AppClosing),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events flowing between requestor components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestorEvent {
    /// A node was added to the resource tree
    NewResource {
        resource: ResourceRef,
        parent: Option<ResourceRef>,
    },

    /// A child was linked under `parent`
    ChildAdded {
        parent: ResourceRef,
        child: ResourceRef,
    },

    /// The cached remote snapshot changed
    ResourceDataChanged { resource: ResourceRef },

    /// The local lifecycle state changed
    StateChanged {
        resource: ResourceRef,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// A node was explicitly removed from the tree
    ResourceClosed { resource: ResourceRef },

    /// A batch reached a terminal state
    BatchFinished {
        resource: ResourceRef,
        activity_id: ResourceId,
        state: BatchState,
    },

    /// A collector gave up; no further children or events will arrive.
    /// Session-wide collectors (payments) carry no resource.
    CollectorFailed {
        collector: String,
        resource: Option<ResourceRef>,
        reason: String,
    },

    DebitNoteAccepted {
        resource: ResourceRef,
        activity_id: ResourceId,
        agreement_id: ResourceId,
        /// Accepted on top of the activity's earlier notes
        amount: Decimal,
        /// Running total of the activity after this note
        total: Decimal,
    },

    InvoiceAccepted {
        resource: ResourceRef,
        agreement_id: ResourceId,
        amount: Decimal,
    },

    PaymentRejected { resource: ResourceRef, reason: String },

    /// The payment monitor asks for this activity to be stopped
    ActivityFlagged {
        resource: ResourceRef,
        reason: StopReason,
        cost_per_result: Option<Decimal>,
    },

    /// The rolling budget was exhausted; the run must stop
    BudgetExceeded { spent: Decimal, budget: Decimal },
}

impl RequestorEvent {
    /// Resource this event is about, if any. Delivery is FIFO per resource.
    pub fn resource(&self) -> Option<&ResourceRef> {
        match self {
            RequestorEvent::NewResource { resource, .. }
            | RequestorEvent::ResourceDataChanged { resource }
            | RequestorEvent::StateChanged { resource, .. }
            | RequestorEvent::ResourceClosed { resource }
            | RequestorEvent::BatchFinished { resource, .. }
            | RequestorEvent::DebitNoteAccepted { resource, .. }
            | RequestorEvent::InvoiceAccepted { resource, .. }
            | RequestorEvent::PaymentRejected { resource, .. }
            | RequestorEvent::ActivityFlagged { resource, .. } => Some(resource),
            RequestorEvent::ChildAdded { parent, .. } => Some(parent),
            RequestorEvent::CollectorFailed { resource, .. } => resource.as_ref(),
            RequestorEvent::BudgetExceeded { .. } => None,
        }
    }

    pub fn resource_kind(&self) -> Option<ResourceKind> {
        self.resource().map(|r| r.kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestorEvent::NewResource { .. } => "new_resource",
            RequestorEvent::ChildAdded { .. } => "child_added",
            RequestorEvent::ResourceDataChanged { .. } => "resource_data_changed",
            RequestorEvent::StateChanged { .. } => "state_changed",
            RequestorEvent::ResourceClosed { .. } => "resource_closed",
            RequestorEvent::BatchFinished { .. } => "batch_finished",
            RequestorEvent::CollectorFailed { .. } => "collector_failed",
            RequestorEvent::DebitNoteAccepted { .. } => "debit_note_accepted",
            RequestorEvent::InvoiceAccepted { .. } => "invoice_accepted",
            RequestorEvent::PaymentRejected { .. } => "payment_rejected",
            RequestorEvent::ActivityFlagged { .. } => "activity_flagged",
            RequestorEvent::BudgetExceeded { .. } => "budget_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_roundtrip() {
        for reason in [
            StopReason::TooExpensive,
            StopReason::BudgetExhausted,
            StopReason::TooManyFailures,
            StopReason::AppClosing,
        ] {
            assert_eq!(StopReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(StopReason::parse("bored"), None);
    }

    #[test]
    fn test_child_added_is_keyed_by_parent() {
        let parent = ResourceRef::new(ResourceKind::Demand, "d1");
        let event = RequestorEvent::ChildAdded {
            parent: parent.clone(),
            child: ResourceRef::new(ResourceKind::Proposal, "p1"),
        };
        assert_eq!(event.resource(), Some(&parent));
        assert_eq!(event.resource_kind(), Some(ResourceKind::Demand));
    }
}
