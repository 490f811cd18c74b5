//! Requestor - Core types
//!
//! Shared vocabulary of the requestor crates: identifiers, the closed set of
//! marketplace resource kinds with their lifecycle states, cached remote data
//! snapshots, bus events and exe-unit commands.

pub mod batch;
pub mod command;
pub mod data;
pub mod event;
pub mod ids;
pub mod resource;

pub use batch::{CancelReason, CommandOutcome, CommandResult, CommandStatus};
pub use command::{prepare_script, Command, CommandError, Script};
pub use data::{
    ActivityData, AgreementData, AllocationData, BatchData, DebitNoteData, DemandData,
    InvoiceData, LinearPricing, MarketEvent, NetworkData, PaymentEvent, Properties,
    ProposalData, ResourceData,
};
pub use event::{RequestorEvent, StopReason};
pub use ids::{ResourceId, RunId, TaskId};
pub use resource::{
    ActivityState, AgreementState, AllocationState, BatchState, DemandState, DocumentStatus,
    LifecycleState, NetworkState, ProposalState, ResourceKind, ResourceRef,
};
