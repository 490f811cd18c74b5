//! Daemon API seam
//!
//! Every call the requestor makes to the marketplace daemon goes through
//! [`DaemonApi`]. Failures are classified by [`ApiError`] so collectors can
//! absorb transient ones.

pub mod http;
pub mod mock;

use crate::error::ApiResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requestor_types::{
    ActivityData, AgreementData, AllocationData, CommandResult, DebitNoteData, DemandData,
    InvoiceData, MarketEvent, PaymentEvent, ProposalData, ResourceId, Script,
};
use rust_decimal::Decimal;
use std::net::Ipv4Addr;
use std::time::Duration;

pub use http::{HttpApiConfig, HttpDaemonApi};
pub use mock::{ApprovalBehaviour, CommandReply, MockDaemon, MockProvider, ProviderReaction};

/// Remote marketplace daemon
#[async_trait]
pub trait DaemonApi: Send + Sync {
    // Market

    async fn subscribe_demand(&self, demand: &DemandData) -> ApiResult<ResourceId>;

    async fn unsubscribe_demand(&self, demand_id: &ResourceId) -> ApiResult<()>;

    async fn get_demand(&self, demand_id: &ResourceId) -> ApiResult<DemandData>;

    /// Wait up to `timeout` for at most `max_events` offer events of a demand.
    async fn collect_offers(
        &self,
        demand_id: &ResourceId,
        timeout: Duration,
        max_events: usize,
    ) -> ApiResult<Vec<MarketEvent>>;

    async fn get_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
    ) -> ApiResult<ProposalData>;

    /// Send a counter-offer; returns the id of the new proposal.
    async fn counter_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
        counter: &DemandData,
    ) -> ApiResult<ResourceId>;

    async fn reject_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
        reason: &str,
    ) -> ApiResult<()>;

    async fn create_agreement(
        &self,
        proposal_id: &ResourceId,
        valid_to: DateTime<Utc>,
    ) -> ApiResult<ResourceId>;

    async fn get_agreement(&self, agreement_id: &ResourceId) -> ApiResult<AgreementData>;

    async fn confirm_agreement(&self, agreement_id: &ResourceId) -> ApiResult<()>;

    /// `Ok` once approved, `Gone` if the provider rejected it, `Timeout` if
    /// nothing happened within `timeout`.
    async fn wait_for_approval(&self, agreement_id: &ResourceId, timeout: Duration)
        -> ApiResult<()>;

    async fn terminate_agreement(&self, agreement_id: &ResourceId, reason: &str) -> ApiResult<()>;

    // Activity

    async fn create_activity(&self, agreement_id: &ResourceId) -> ApiResult<ResourceId>;

    async fn get_activity(&self, activity_id: &ResourceId) -> ApiResult<ActivityData>;

    async fn destroy_activity(&self, activity_id: &ResourceId) -> ApiResult<()>;

    /// Submit a script; returns the batch id.
    async fn exec(&self, activity_id: &ResourceId, script: &Script) -> ApiResult<ResourceId>;

    /// All results reported so far for a batch, waiting up to `timeout` for news.
    async fn get_exec_batch_results(
        &self,
        activity_id: &ResourceId,
        batch_id: &ResourceId,
        timeout: Duration,
    ) -> ApiResult<Vec<CommandResult>>;

    // Payment

    async fn create_allocation(
        &self,
        amount: Decimal,
        payment_platform: &str,
        expires: Option<DateTime<Utc>>,
    ) -> ApiResult<AllocationData>;

    async fn get_allocation(&self, allocation_id: &ResourceId) -> ApiResult<AllocationData>;

    async fn release_allocation(&self, allocation_id: &ResourceId) -> ApiResult<()>;

    /// Debit note and invoice events strictly after `after`.
    async fn collect_payment_events(
        &self,
        after: Option<DateTime<Utc>>,
        timeout: Duration,
        max_events: usize,
    ) -> ApiResult<Vec<PaymentEvent>>;

    async fn get_debit_note(&self, debit_note_id: &ResourceId) -> ApiResult<DebitNoteData>;

    async fn accept_debit_note(
        &self,
        debit_note_id: &ResourceId,
        amount: Decimal,
        allocation_id: &ResourceId,
    ) -> ApiResult<()>;

    async fn reject_debit_note(&self, debit_note_id: &ResourceId, reason: &str) -> ApiResult<()>;

    async fn get_invoice(&self, invoice_id: &ResourceId) -> ApiResult<InvoiceData>;

    async fn accept_invoice(
        &self,
        invoice_id: &ResourceId,
        amount: Decimal,
        allocation_id: &ResourceId,
    ) -> ApiResult<()>;

    async fn reject_invoice(&self, invoice_id: &ResourceId, reason: &str) -> ApiResult<()>;

    // Network

    async fn create_network(
        &self,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> ApiResult<ResourceId>;

    async fn add_network_node(
        &self,
        network_id: &ResourceId,
        node_id: &str,
        ip: Ipv4Addr,
    ) -> ApiResult<()>;

    async fn add_requestor_address(&self, network_id: &ResourceId, ip: Ipv4Addr) -> ApiResult<()>;

    async fn remove_network(&self, network_id: &ResourceId) -> ApiResult<()>;
}
