//! In-memory daemon simulation
//!
//! Used by tests across the workspace. Providers answer demands with offers,
//! react to counter-offers and approve agreements according to their
//! configured behaviour; command outcomes are scripted per command.

use super::DaemonApi;
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use requestor_types::{
    ActivityData, AgreementData, AllocationData, Command, CommandResult, DebitNoteData,
    DemandData, DocumentStatus, InvoiceData, MarketEvent, PaymentEvent, Properties,
    ProposalData, ProposalState, ResourceId, Script,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How a provider answers our counter-offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderReaction {
    /// Reply with a Draft proposal
    AcceptCounter,
    /// Reject the counter-offer
    RejectCounter,
    /// Never answer
    Ignore,
}

/// How a provider answers a confirmed agreement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalBehaviour {
    Approve,
    Reject,
    Never,
}

/// Simulated provider
#[derive(Debug, Clone)]
pub struct MockProvider {
    pub provider_id: String,
    pub properties: Properties,
    pub reaction: ProviderReaction,
    pub approval: ApprovalBehaviour,
}

impl MockProvider {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            properties: Properties::new(),
            reaction: ProviderReaction::AcceptCounter,
            approval: ApprovalBehaviour::Approve,
        }
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn with_reaction(mut self, reaction: ProviderReaction) -> Self {
        self.reaction = reaction;
        self
    }

    pub fn with_approval(mut self, approval: ApprovalBehaviour) -> Self {
        self.approval = approval;
        self
    }
}

/// Scripted outcome of a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Ok(String),
    Fail(String),
    /// The command never reports
    Hang,
}

type CommandRule = Arc<dyn Fn(&Command) -> CommandReply + Send + Sync>;

/// Agreement state as seen by the simulated daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockAgreementState {
    Proposal,
    Pending,
    Approved,
    Rejected,
    Terminated,
}

struct MockDemand {
    data: DemandData,
    active: bool,
    offered: bool,
    queue: VecDeque<MarketEvent>,
}

struct MockProposal {
    demand_id: ResourceId,
    data: ProposalData,
    provider: usize,
    rejected: bool,
}

struct MockAgreement {
    proposal_id: ResourceId,
    provider: usize,
    valid_to: DateTime<Utc>,
    state: MockAgreementState,
    confirmed: bool,
}

struct MockActivity {
    agreement_id: ResourceId,
    destroyed: bool,
}

struct MockBatch {
    results: Vec<CommandResult>,
}

struct MockDocument<T> {
    data: T,
    status: DocumentStatus,
    accepted_amount: Option<Decimal>,
}

#[derive(Default)]
struct MockState {
    providers: Vec<MockProvider>,
    demands: HashMap<ResourceId, MockDemand>,
    proposals: HashMap<ResourceId, MockProposal>,
    agreements: HashMap<ResourceId, MockAgreement>,
    activities: HashMap<ResourceId, MockActivity>,
    batches: HashMap<ResourceId, MockBatch>,
    executed: HashMap<ResourceId, Vec<Command>>,
    allocations: HashMap<ResourceId, (AllocationData, bool)>,
    debit_notes: HashMap<ResourceId, MockDocument<DebitNoteData>>,
    /// Running total issued per activity
    debit_totals: HashMap<ResourceId, Decimal>,
    /// Highest total accepted per activity
    accepted_totals: HashMap<ResourceId, Decimal>,
    invoices: HashMap<ResourceId, MockDocument<InvoiceData>>,
    payment_events: Vec<PaymentEvent>,
    last_event_date: Option<DateTime<Utc>>,
    networks: HashMap<ResourceId, HashSet<Ipv4Addr>>,
    rule: Option<CommandRule>,
}

impl MockState {
    fn next_event_date(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_event_date {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_event_date = Some(now);
        now
    }

    fn reply_for(&self, command: &Command) -> CommandReply {
        match &self.rule {
            Some(rule) => rule(command),
            None => CommandReply::Ok(String::new()),
        }
    }
}

/// In-memory [`DaemonApi`] implementation for tests
pub struct MockDaemon {
    state: Mutex<MockState>,
    calls: DashMap<&'static str, usize>,
    failures: DashMap<&'static str, VecDeque<ApiError>>,
    poll_delay: Duration,
}

impl Default for MockDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDaemon {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            calls: DashMap::new(),
            failures: DashMap::new(),
            poll_delay: Duration::from_millis(5),
        }
    }

    /// Mock with `count` cooperative providers
    pub fn with_providers(count: usize) -> Self {
        let mock = Self::new();
        if let Ok(mut state) = mock.state.try_lock() {
            state.providers = (0..count)
                .map(|i| MockProvider::new(format!("provider-{}", i)))
                .collect();
        }
        mock
    }

    pub async fn add_provider(&self, provider: MockProvider) {
        self.state.lock().await.providers.push(provider);
    }

    /// Decide the outcome of every executed command.
    pub async fn set_command_rule<F>(&self, rule: F)
    where
        F: Fn(&Command) -> CommandReply + Send + Sync + 'static,
    {
        self.state.lock().await.rule = Some(Arc::new(rule));
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ApiError) {
        self.failures.entry(operation).or_default().push_back(error);
    }

    /// Number of calls made to `operation` so far
    pub fn calls(&self, operation: &'static str) -> usize {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    /// Commands actually executed on an activity, in order
    pub async fn executed_commands(&self, activity_id: &ResourceId) -> Vec<Command> {
        self.state
            .lock()
            .await
            .executed
            .get(activity_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn agreement_state(&self, agreement_id: &ResourceId) -> Option<MockAgreementState> {
        self.state
            .lock()
            .await
            .agreements
            .get(agreement_id)
            .map(|a| a.state)
    }

    pub async fn activity_destroyed(&self, activity_id: &ResourceId) -> Option<bool> {
        self.state
            .lock()
            .await
            .activities
            .get(activity_id)
            .map(|a| a.destroyed)
    }

    pub async fn debit_note_status(&self, debit_note_id: &ResourceId) -> Option<DocumentStatus> {
        self.state
            .lock()
            .await
            .debit_notes
            .get(debit_note_id)
            .map(|d| d.status)
    }

    pub async fn invoice_status(&self, invoice_id: &ResourceId) -> Option<DocumentStatus> {
        self.state
            .lock()
            .await
            .invoices
            .get(invoice_id)
            .map(|d| d.status)
    }

    /// Sum of everything accepted so far. Debit notes count with the highest
    /// running total accepted per activity.
    pub async fn total_accepted(&self) -> Decimal {
        let state = self.state.lock().await;
        let notes: Decimal = state.accepted_totals.values().sum();
        let invoices: Decimal = state
            .invoices
            .values()
            .filter_map(|d| d.accepted_amount)
            .sum();
        notes + invoices
    }

    /// Allocations created so far with their released flag
    pub async fn allocations(&self) -> Vec<(AllocationData, bool)> {
        self.state.lock().await.allocations.values().cloned().collect()
    }

    /// Agreement ids known to the daemon
    pub async fn agreement_ids(&self) -> Vec<ResourceId> {
        self.state.lock().await.agreements.keys().cloned().collect()
    }

    /// Activity ids created under an agreement
    pub async fn activities_of(&self, agreement_id: &ResourceId) -> Vec<ResourceId> {
        self.state
            .lock()
            .await
            .activities
            .iter()
            .filter(|(_, a)| &a.agreement_id == agreement_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Seed an approved agreement with a live activity, as left behind by a
    /// previous process.
    pub async fn seed_live_activity(&self, provider_id: &str) -> (ResourceId, ResourceId) {
        let mut state = self.state.lock().await;
        let provider = match state
            .providers
            .iter()
            .position(|p| p.provider_id == provider_id)
        {
            Some(index) => index,
            None => {
                state.providers.push(MockProvider::new(provider_id));
                state.providers.len() - 1
            }
        };
        let agreement_id = ResourceId::generate();
        let activity_id = ResourceId::generate();
        state.agreements.insert(
            agreement_id.clone(),
            MockAgreement {
                proposal_id: ResourceId::generate(),
                provider,
                valid_to: Utc::now() + ChronoDuration::hours(1),
                state: MockAgreementState::Approved,
                confirmed: true,
            },
        );
        state.activities.insert(
            activity_id.clone(),
            MockActivity {
                agreement_id: agreement_id.clone(),
                destroyed: false,
            },
        );
        (agreement_id, activity_id)
    }

    /// Charge `amount` more for an activity. The issued note carries the
    /// activity's new running total; returns its id.
    pub async fn issue_debit_note(&self, activity_id: &ResourceId, amount: Decimal) -> ApiResult<ResourceId> {
        let mut state = self.state.lock().await;
        let agreement_id = state
            .activities
            .get(activity_id)
            .map(|a| a.agreement_id.clone())
            .ok_or_else(|| ApiError::NotFound(format!("activity {}", activity_id)))?;
        let total_amount_due = {
            let total = state.debit_totals.entry(activity_id.clone()).or_default();
            *total += amount;
            *total
        };
        let id = ResourceId::generate();
        let event_date = state.next_event_date();
        state.debit_notes.insert(
            id.clone(),
            MockDocument {
                data: DebitNoteData {
                    debit_note_id: id.clone(),
                    activity_id: activity_id.clone(),
                    agreement_id,
                    total_amount_due,
                    timestamp: event_date,
                },
                status: DocumentStatus::Received,
                accepted_amount: None,
            },
        );
        state.payment_events.push(PaymentEvent::DebitNoteReceived {
            debit_note_id: id.clone(),
            event_date,
        });
        Ok(id)
    }

    /// Issue an invoice for an agreement; returns its id.
    pub async fn issue_invoice(&self, agreement_id: &ResourceId, amount: Decimal) -> ApiResult<ResourceId> {
        let mut state = self.state.lock().await;
        if !state.agreements.contains_key(agreement_id) {
            return Err(ApiError::NotFound(format!("agreement {}", agreement_id)));
        }
        let activity_ids = state
            .activities
            .iter()
            .filter(|(_, a)| &a.agreement_id == agreement_id)
            .map(|(id, _)| id.clone())
            .collect();
        let id = ResourceId::generate();
        let event_date = state.next_event_date();
        state.invoices.insert(
            id.clone(),
            MockDocument {
                data: InvoiceData {
                    invoice_id: id.clone(),
                    agreement_id: agreement_id.clone(),
                    activity_ids,
                    amount,
                    timestamp: event_date,
                },
                status: DocumentStatus::Received,
                accepted_amount: None,
            },
        );
        state.payment_events.push(PaymentEvent::InvoiceReceived {
            invoice_id: id.clone(),
            event_date,
        });
        Ok(id)
    }

    /// Count the call and surface an injected failure, if any.
    fn enter(&self, operation: &'static str) -> ApiResult<()> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if let Some(mut queue) = self.failures.get_mut(operation) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn idle(&self, timeout: Duration) {
        tokio::time::sleep(timeout.min(self.poll_delay)).await;
    }

    fn provider_offer(demand_id: &ResourceId, provider: &MockProvider) -> MarketEvent {
        let _ = demand_id;
        MarketEvent::Proposal(ProposalData {
            proposal_id: ResourceId::generate(),
            issuer_id: provider.provider_id.clone(),
            state: ProposalState::Initial,
            prev_proposal_id: None,
            properties: provider.properties.clone(),
            constraints: "()".to_string(),
            timestamp: Utc::now(),
        })
    }
}

fn not_found(kind: &str, id: &ResourceId) -> ApiError {
    ApiError::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl DaemonApi for MockDaemon {
    async fn subscribe_demand(&self, demand: &DemandData) -> ApiResult<ResourceId> {
        self.enter("subscribe_demand")?;
        let id = ResourceId::generate();
        self.state.lock().await.demands.insert(
            id.clone(),
            MockDemand {
                data: demand.clone(),
                active: true,
                offered: false,
                queue: VecDeque::new(),
            },
        );
        Ok(id)
    }

    async fn unsubscribe_demand(&self, demand_id: &ResourceId) -> ApiResult<()> {
        self.enter("unsubscribe_demand")?;
        let mut state = self.state.lock().await;
        let demand = state
            .demands
            .get_mut(demand_id)
            .ok_or_else(|| not_found("demand", demand_id))?;
        demand.active = false;
        Ok(())
    }

    async fn get_demand(&self, demand_id: &ResourceId) -> ApiResult<DemandData> {
        self.enter("get_demand")?;
        self.state
            .lock()
            .await
            .demands
            .get(demand_id)
            .map(|d| d.data.clone())
            .ok_or_else(|| not_found("demand", demand_id))
    }

    async fn collect_offers(
        &self,
        demand_id: &ResourceId,
        timeout: Duration,
        max_events: usize,
    ) -> ApiResult<Vec<MarketEvent>> {
        self.enter("collect_offers")?;
        let events = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let demand = state
                .demands
                .get_mut(demand_id)
                .ok_or_else(|| not_found("demand", demand_id))?;
            if !demand.active {
                return Err(ApiError::Gone(format!("demand {} unsubscribed", demand_id)));
            }

            if !demand.offered {
                demand.offered = true;
                for (index, provider) in state.providers.iter().enumerate() {
                    let offer = Self::provider_offer(demand_id, provider);
                    if let MarketEvent::Proposal(data) = &offer {
                        state.proposals.insert(
                            data.proposal_id.clone(),
                            MockProposal {
                                demand_id: demand_id.clone(),
                                data: data.clone(),
                                provider: index,
                                rejected: false,
                            },
                        );
                    }
                    demand.queue.push_back(offer);
                }
            }

            let take = demand.queue.len().min(max_events);
            demand.queue.drain(..take).collect::<Vec<_>>()
        };

        if events.is_empty() {
            self.idle(timeout).await;
        }
        Ok(events)
    }

    async fn get_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
    ) -> ApiResult<ProposalData> {
        self.enter("get_proposal")?;
        self.state
            .lock()
            .await
            .proposals
            .get(proposal_id)
            .filter(|p| &p.demand_id == demand_id)
            .map(|p| p.data.clone())
            .ok_or_else(|| not_found("proposal", proposal_id))
    }

    async fn counter_proposal(
        &self,
        demand_id: &ResourceId,
        proposal_id: &ResourceId,
        counter: &DemandData,
    ) -> ApiResult<ResourceId> {
        self.enter("counter_proposal")?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let (provider, rejected) = state
            .proposals
            .get(proposal_id)
            .map(|p| (p.provider, p.rejected))
            .ok_or_else(|| not_found("proposal", proposal_id))?;
        if rejected {
            return Err(ApiError::Gone(format!("proposal {} rejected", proposal_id)));
        }

        let ours = ResourceId::generate();
        state.proposals.insert(
            ours.clone(),
            MockProposal {
                demand_id: demand_id.clone(),
                data: ProposalData {
                    proposal_id: ours.clone(),
                    issuer_id: "requestor".to_string(),
                    state: ProposalState::Draft,
                    prev_proposal_id: Some(proposal_id.clone()),
                    properties: counter.properties.clone(),
                    constraints: counter.constraints.clone(),
                    timestamp: Utc::now(),
                },
                provider,
                rejected: false,
            },
        );

        let reaction = state
            .providers
            .get(provider)
            .map(|p| p.reaction)
            .unwrap_or(ProviderReaction::Ignore);
        let reply = match reaction {
            ProviderReaction::AcceptCounter => {
                let data = ProposalData {
                    proposal_id: ResourceId::generate(),
                    issuer_id: state.providers[provider].provider_id.clone(),
                    state: ProposalState::Draft,
                    prev_proposal_id: Some(ours.clone()),
                    properties: state.providers[provider].properties.clone(),
                    constraints: "()".to_string(),
                    timestamp: Utc::now(),
                };
                state.proposals.insert(
                    data.proposal_id.clone(),
                    MockProposal {
                        demand_id: demand_id.clone(),
                        data: data.clone(),
                        provider,
                        rejected: false,
                    },
                );
                Some(MarketEvent::Proposal(data))
            }
            ProviderReaction::RejectCounter => Some(MarketEvent::ProposalRejected {
                proposal_id: ours.clone(),
                reason: Some("counter-offer not acceptable".to_string()),
            }),
            ProviderReaction::Ignore => None,
        };

        if let (Some(event), Some(demand)) = (reply, state.demands.get_mut(demand_id)) {
            demand.queue.push_back(event);
        }
        Ok(ours)
    }

    async fn reject_proposal(
        &self,
        _demand_id: &ResourceId,
        proposal_id: &ResourceId,
        _reason: &str,
    ) -> ApiResult<()> {
        self.enter("reject_proposal")?;
        let mut state = self.state.lock().await;
        let proposal = state
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| not_found("proposal", proposal_id))?;
        proposal.rejected = true;
        Ok(())
    }

    async fn create_agreement(
        &self,
        proposal_id: &ResourceId,
        valid_to: DateTime<Utc>,
    ) -> ApiResult<ResourceId> {
        self.enter("create_agreement")?;
        let mut state = self.state.lock().await;
        let provider = state
            .proposals
            .get(proposal_id)
            .map(|p| p.provider)
            .ok_or_else(|| not_found("proposal", proposal_id))?;
        let id = ResourceId::generate();
        state.agreements.insert(
            id.clone(),
            MockAgreement {
                proposal_id: proposal_id.clone(),
                provider,
                valid_to,
                state: MockAgreementState::Proposal,
                confirmed: false,
            },
        );
        Ok(id)
    }

    async fn get_agreement(&self, agreement_id: &ResourceId) -> ApiResult<AgreementData> {
        self.enter("get_agreement")?;
        let state = self.state.lock().await;
        let agreement = state
            .agreements
            .get(agreement_id)
            .ok_or_else(|| not_found("agreement", agreement_id))?;
        Ok(AgreementData {
            agreement_id: agreement_id.clone(),
            proposal_id: agreement.proposal_id.clone(),
            provider_id: state
                .providers
                .get(agreement.provider)
                .map(|p| p.provider_id.clone())
                .unwrap_or_default(),
            valid_to: agreement.valid_to,
            state: format!("{:?}", agreement.state),
        })
    }

    async fn confirm_agreement(&self, agreement_id: &ResourceId) -> ApiResult<()> {
        self.enter("confirm_agreement")?;
        let mut state = self.state.lock().await;
        let agreement = state
            .agreements
            .get_mut(agreement_id)
            .ok_or_else(|| not_found("agreement", agreement_id))?;
        if agreement.state != MockAgreementState::Proposal {
            return Err(ApiError::Conflict(format!(
                "agreement {} is {:?}",
                agreement_id, agreement.state
            )));
        }
        agreement.confirmed = true;
        agreement.state = MockAgreementState::Pending;
        Ok(())
    }

    async fn wait_for_approval(
        &self,
        agreement_id: &ResourceId,
        timeout: Duration,
    ) -> ApiResult<()> {
        self.enter("wait_for_approval")?;
        let behaviour = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let agreement = state
                .agreements
                .get_mut(agreement_id)
                .ok_or_else(|| not_found("agreement", agreement_id))?;
            match agreement.state {
                MockAgreementState::Approved => return Ok(()),
                MockAgreementState::Rejected | MockAgreementState::Terminated => {
                    return Err(ApiError::Gone(format!("agreement {}", agreement_id)))
                }
                MockAgreementState::Proposal => {
                    return Err(ApiError::Conflict(format!(
                        "agreement {} not confirmed",
                        agreement_id
                    )))
                }
                MockAgreementState::Pending => {}
            }
            let behaviour = state
                .providers
                .get(agreement.provider)
                .map(|p| p.approval)
                .unwrap_or(ApprovalBehaviour::Never);
            match behaviour {
                ApprovalBehaviour::Approve => agreement.state = MockAgreementState::Approved,
                ApprovalBehaviour::Reject => agreement.state = MockAgreementState::Rejected,
                ApprovalBehaviour::Never => {}
            }
            behaviour
        };

        match behaviour {
            ApprovalBehaviour::Approve => Ok(()),
            ApprovalBehaviour::Reject => {
                Err(ApiError::Gone(format!("agreement {} rejected", agreement_id)))
            }
            ApprovalBehaviour::Never => {
                self.idle(timeout).await;
                Err(ApiError::Timeout(format!("agreement {}", agreement_id)))
            }
        }
    }

    async fn terminate_agreement(&self, agreement_id: &ResourceId, _reason: &str) -> ApiResult<()> {
        self.enter("terminate_agreement")?;
        let mut state = self.state.lock().await;
        let agreement = state
            .agreements
            .get_mut(agreement_id)
            .ok_or_else(|| not_found("agreement", agreement_id))?;
        match agreement.state {
            MockAgreementState::Terminated | MockAgreementState::Rejected => {
                Err(ApiError::Gone(format!("agreement {}", agreement_id)))
            }
            _ => {
                agreement.state = MockAgreementState::Terminated;
                Ok(())
            }
        }
    }

    async fn create_activity(&self, agreement_id: &ResourceId) -> ApiResult<ResourceId> {
        self.enter("create_activity")?;
        let mut state = self.state.lock().await;
        let agreement = state
            .agreements
            .get(agreement_id)
            .ok_or_else(|| not_found("agreement", agreement_id))?;
        if agreement.state != MockAgreementState::Approved {
            return Err(ApiError::Conflict(format!(
                "agreement {} is {:?}",
                agreement_id, agreement.state
            )));
        }
        let id = ResourceId::generate();
        state.activities.insert(
            id.clone(),
            MockActivity {
                agreement_id: agreement_id.clone(),
                destroyed: false,
            },
        );
        Ok(id)
    }

    async fn get_activity(&self, activity_id: &ResourceId) -> ApiResult<ActivityData> {
        self.enter("get_activity")?;
        let state = self.state.lock().await;
        let activity = state
            .activities
            .get(activity_id)
            .ok_or_else(|| not_found("activity", activity_id))?;
        Ok(ActivityData {
            activity_id: activity_id.clone(),
            agreement_id: activity.agreement_id.clone(),
            state: if activity.destroyed {
                "Terminated".to_string()
            } else {
                "Ready".to_string()
            },
        })
    }

    async fn destroy_activity(&self, activity_id: &ResourceId) -> ApiResult<()> {
        self.enter("destroy_activity")?;
        let mut state = self.state.lock().await;
        let activity = state
            .activities
            .get_mut(activity_id)
            .ok_or_else(|| not_found("activity", activity_id))?;
        if activity.destroyed {
            return Err(ApiError::Gone(format!("activity {}", activity_id)));
        }
        activity.destroyed = true;
        Ok(())
    }

    async fn exec(&self, activity_id: &ResourceId, script: &Script) -> ApiResult<ResourceId> {
        self.enter("exec")?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match state.activities.get(activity_id) {
            None => return Err(not_found("activity", activity_id)),
            Some(a) if a.destroyed => {
                return Err(ApiError::Gone(format!("activity {}", activity_id)))
            }
            Some(_) => {}
        }

        let mut results = Vec::new();
        let last = script.len().saturating_sub(1);
        for (index, command) in script.commands().iter().enumerate() {
            let reply = state.reply_for(command);
            if reply == CommandReply::Hang {
                break;
            }
            state
                .executed
                .entry(activity_id.clone())
                .or_default()
                .push(command.clone());
            match reply {
                CommandReply::Ok(stdout) => {
                    results.push(CommandResult::ok(index, stdout, index == last))
                }
                CommandReply::Fail(message) => {
                    results.push(CommandResult::error(index, message.clone(), Some(message)));
                    break;
                }
                CommandReply::Hang => break,
            }
        }

        let id = ResourceId::generate();
        state.batches.insert(id.clone(), MockBatch { results });
        Ok(id)
    }

    async fn get_exec_batch_results(
        &self,
        activity_id: &ResourceId,
        batch_id: &ResourceId,
        timeout: Duration,
    ) -> ApiResult<Vec<CommandResult>> {
        self.enter("get_exec_batch_results")?;
        let (results, finished) = {
            let state = self.state.lock().await;
            if !state.activities.contains_key(activity_id) {
                return Err(not_found("activity", activity_id));
            }
            let batch = state
                .batches
                .get(batch_id)
                .ok_or_else(|| not_found("batch", batch_id))?;
            let finished = batch.results.iter().any(|r| r.is_batch_finished);
            (batch.results.clone(), finished)
        };
        if !finished {
            self.idle(timeout).await;
        }
        Ok(results)
    }

    async fn create_allocation(
        &self,
        amount: Decimal,
        payment_platform: &str,
        expires: Option<DateTime<Utc>>,
    ) -> ApiResult<AllocationData> {
        self.enter("create_allocation")?;
        let data = AllocationData {
            allocation_id: ResourceId::generate(),
            total_amount: amount,
            remaining_amount: amount,
            payment_platform: payment_platform.to_string(),
            address: "0xrequestor".to_string(),
            timeout: expires,
        };
        self.state
            .lock()
            .await
            .allocations
            .insert(data.allocation_id.clone(), (data.clone(), false));
        Ok(data)
    }

    async fn get_allocation(&self, allocation_id: &ResourceId) -> ApiResult<AllocationData> {
        self.enter("get_allocation")?;
        self.state
            .lock()
            .await
            .allocations
            .get(allocation_id)
            .filter(|(_, released)| !released)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| not_found("allocation", allocation_id))
    }

    async fn release_allocation(&self, allocation_id: &ResourceId) -> ApiResult<()> {
        self.enter("release_allocation")?;
        let mut state = self.state.lock().await;
        match state.allocations.get_mut(allocation_id) {
            Some((_, released)) if !*released => {
                *released = true;
                Ok(())
            }
            _ => Err(not_found("allocation", allocation_id)),
        }
    }

    async fn collect_payment_events(
        &self,
        after: Option<DateTime<Utc>>,
        timeout: Duration,
        max_events: usize,
    ) -> ApiResult<Vec<PaymentEvent>> {
        self.enter("collect_payment_events")?;
        let events: Vec<PaymentEvent> = {
            let state = self.state.lock().await;
            state
                .payment_events
                .iter()
                .filter(|e| after.map_or(true, |after| e.event_date() > after))
                .take(max_events)
                .cloned()
                .collect()
        };
        if events.is_empty() {
            self.idle(timeout).await;
        }
        Ok(events)
    }

    async fn get_debit_note(&self, debit_note_id: &ResourceId) -> ApiResult<DebitNoteData> {
        self.enter("get_debit_note")?;
        self.state
            .lock()
            .await
            .debit_notes
            .get(debit_note_id)
            .map(|d| d.data.clone())
            .ok_or_else(|| not_found("debit note", debit_note_id))
    }

    async fn accept_debit_note(
        &self,
        debit_note_id: &ResourceId,
        amount: Decimal,
        allocation_id: &ResourceId,
    ) -> ApiResult<()> {
        self.enter("accept_debit_note")?;
        let mut state = self.state.lock().await;
        if !matches!(state.allocations.get(allocation_id), Some((_, false))) {
            return Err(not_found("allocation", allocation_id));
        }
        let note = state
            .debit_notes
            .get_mut(debit_note_id)
            .ok_or_else(|| not_found("debit note", debit_note_id))?;
        if note.status != DocumentStatus::Received {
            return Err(ApiError::Conflict(format!(
                "debit note {} already {:?}",
                debit_note_id, note.status
            )));
        }
        note.status = DocumentStatus::Accepted;
        note.accepted_amount = Some(amount);
        let activity_id = note.data.activity_id.clone();

        // Only the increase over the previous total draws on the allocation
        let accepted = state.accepted_totals.entry(activity_id).or_default();
        let increase = (amount - *accepted).max(Decimal::ZERO);
        *accepted = (*accepted).max(amount);
        if let Some((allocation, _)) = state.allocations.get_mut(allocation_id) {
            allocation.remaining_amount -= increase;
        }
        Ok(())
    }

    async fn reject_debit_note(&self, debit_note_id: &ResourceId, _reason: &str) -> ApiResult<()> {
        self.enter("reject_debit_note")?;
        let mut state = self.state.lock().await;
        let note = state
            .debit_notes
            .get_mut(debit_note_id)
            .ok_or_else(|| not_found("debit note", debit_note_id))?;
        if note.status != DocumentStatus::Received {
            return Err(ApiError::Conflict(format!(
                "debit note {} already {:?}",
                debit_note_id, note.status
            )));
        }
        note.status = DocumentStatus::Rejected;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: &ResourceId) -> ApiResult<InvoiceData> {
        self.enter("get_invoice")?;
        self.state
            .lock()
            .await
            .invoices
            .get(invoice_id)
            .map(|d| d.data.clone())
            .ok_or_else(|| not_found("invoice", invoice_id))
    }

    async fn accept_invoice(
        &self,
        invoice_id: &ResourceId,
        amount: Decimal,
        allocation_id: &ResourceId,
    ) -> ApiResult<()> {
        self.enter("accept_invoice")?;
        let mut state = self.state.lock().await;
        if !matches!(state.allocations.get(allocation_id), Some((_, false))) {
            return Err(not_found("allocation", allocation_id));
        }
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;
        if invoice.status != DocumentStatus::Received {
            return Err(ApiError::Conflict(format!(
                "invoice {} already {:?}",
                invoice_id, invoice.status
            )));
        }
        invoice.status = DocumentStatus::Accepted;
        invoice.accepted_amount = Some(amount);
        Ok(())
    }

    async fn reject_invoice(&self, invoice_id: &ResourceId, _reason: &str) -> ApiResult<()> {
        self.enter("reject_invoice")?;
        let mut state = self.state.lock().await;
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;
        if invoice.status != DocumentStatus::Received {
            return Err(ApiError::Conflict(format!(
                "invoice {} already {:?}",
                invoice_id, invoice.status
            )));
        }
        invoice.status = DocumentStatus::Rejected;
        Ok(())
    }

    async fn create_network(
        &self,
        _ip: Ipv4Addr,
        _mask: Ipv4Addr,
        _gateway: Option<Ipv4Addr>,
    ) -> ApiResult<ResourceId> {
        self.enter("create_network")?;
        let id = ResourceId::generate();
        self.state
            .lock()
            .await
            .networks
            .insert(id.clone(), HashSet::new());
        Ok(id)
    }

    async fn add_network_node(
        &self,
        network_id: &ResourceId,
        _node_id: &str,
        ip: Ipv4Addr,
    ) -> ApiResult<()> {
        self.enter("add_network_node")?;
        let mut state = self.state.lock().await;
        let network = state
            .networks
            .get_mut(network_id)
            .ok_or_else(|| not_found("network", network_id))?;
        if !network.insert(ip) {
            return Err(ApiError::Conflict(format!("address {} taken", ip)));
        }
        Ok(())
    }

    async fn add_requestor_address(&self, network_id: &ResourceId, ip: Ipv4Addr) -> ApiResult<()> {
        self.enter("add_requestor_address")?;
        let mut state = self.state.lock().await;
        let network = state
            .networks
            .get_mut(network_id)
            .ok_or_else(|| not_found("network", network_id))?;
        network.insert(ip);
        Ok(())
    }

    async fn remove_network(&self, network_id: &ResourceId) -> ApiResult<()> {
        self.enter("remove_network")?;
        self.state
            .lock()
            .await
            .networks
            .remove(network_id)
            .map(|_| ())
            .ok_or_else(|| not_found("network", network_id))
    }
}
