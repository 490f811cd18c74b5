//! Demand, Proposal and Agreement handles
//!
//! A demand's offer collector turns market events into proposal nodes.
//! Provider offers hang under the demand; every counter-offer hangs under the
//! proposal it answers, so each negotiation forms a chain.

use crate::activity::Activity;
use crate::collector::EventSource;
use crate::error::{ApiError, ApiResult, RequestorError, RequestorResult};
use crate::resource::ResourceNode;
use crate::session::{collector_key, Session};
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use requestor_types::{
    AgreementData, AgreementState, DemandData, DemandState, LifecycleState, MarketEvent,
    Properties, ProposalData, ProposalState, ResourceData, ResourceId, ResourceKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

resource_handle!(
    /// Published requirements; root of a negotiation subtree
    Demand,
    ResourceKind::Demand,
    Demand,
    DemandData
);

resource_handle!(
    /// One round of negotiation, offered by a provider or countered by us
    Proposal,
    ResourceKind::Proposal,
    Proposal,
    ProposalData
);

resource_handle!(
    /// Contract with one provider
    Agreement,
    ResourceKind::Agreement,
    Agreement,
    AgreementData
);

impl Demand {
    /// Publish `demand` on the market and start collecting offers.
    #[instrument(skip_all)]
    pub async fn subscribe(session: &Session, demand: DemandData) -> RequestorResult<Self> {
        session.ensure_open()?;
        let id = session.api().subscribe_demand(&demand).await?;
        let node = session.get_or_create(ResourceKind::Demand, id, None, Some(ResourceData::Demand(demand)));
        info!(demand_id = %node.resource().id, "Demand subscribed");

        let handle = Self::from_node(node.clone(), session.clone());
        session.spawn_collector(
            collector_key(node.resource()),
            Some(node.resource().clone()),
            OfferSource {
                session: session.clone(),
                demand: node,
            },
        );
        Ok(handle)
    }

    pub fn is_subscribed(&self) -> bool {
        self.state() == LifecycleState::Demand(DemandState::Subscribed)
    }

    /// Stop collecting offers and withdraw the demand from the market.
    pub async fn unsubscribe(&self) -> RequestorResult<()> {
        let changed = self.session.update_state(&self.node, |s| match s {
            LifecycleState::Demand(DemandState::Subscribed) => {
                Some(LifecycleState::Demand(DemandState::Unsubscribed))
            }
            _ => None,
        });
        if !changed {
            return Ok(());
        }

        self.session.stop_collector(&collector_key(self.resource()));
        self.node.close_children();
        match self.session.api().unsubscribe_demand(self.id()).await {
            Ok(()) | Err(ApiError::Gone(_)) | Err(ApiError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(demand_id = %self.id(), "Demand unsubscribed");
        Ok(())
    }

    /// Live sequence of provider offers; ends once the demand stops
    /// collecting. Restarting yields every offer seen so far again.
    pub fn initial_proposals(&self) -> impl Stream<Item = Proposal> + Send + 'static {
        let session = self.session.clone();
        self.node.children_stream().filter_map(move |node| {
            let proposal = (node.resource().kind == ResourceKind::Proposal
                && node.state() == LifecycleState::Proposal(ProposalState::Initial))
                .then(|| Proposal::from_node(node, session.clone()));
            async move { proposal }
        })
    }
}

/// Feeds market events of one demand into the tree
struct OfferSource {
    session: Session,
    demand: Arc<ResourceNode>,
}

#[async_trait]
impl EventSource for OfferSource {
    type Event = MarketEvent;

    fn name(&self) -> String {
        collector_key(self.demand.resource())
    }

    async fn poll(&mut self) -> ApiResult<Vec<MarketEvent>> {
        let config = self.session.config();
        self.session
            .api()
            .collect_offers(
                &self.demand.resource().id,
                config.offer_poll_timeout,
                config.offer_poll_max_events,
            )
            .await
    }

    async fn process(&mut self, event: MarketEvent) -> RequestorResult<()> {
        match event {
            MarketEvent::Proposal(data) => {
                // Counter-offers register under this lock before the reply can be linked
                let _guard = self.demand.lock().await;
                let parent = data
                    .prev_proposal_id
                    .as_ref()
                    .and_then(|prev| self.session.node(ResourceKind::Proposal, prev))
                    .unwrap_or_else(|| self.demand.clone());
                debug!(
                    proposal_id = %data.proposal_id,
                    issuer = %data.issuer_id,
                    parent = %parent.resource(),
                    "Proposal received"
                );
                self.session.get_or_create(
                    ResourceKind::Proposal,
                    data.proposal_id.clone(),
                    Some(&parent),
                    Some(ResourceData::Proposal(data)),
                );
            }
            MarketEvent::ProposalRejected { proposal_id, reason } => {
                debug!(%proposal_id, ?reason, "Proposal rejected by provider");
                if let Some(node) = self.session.node(ResourceKind::Proposal, &proposal_id) {
                    mark_rejected(&self.session, &node);
                }
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.demand.state() != LifecycleState::Demand(DemandState::Subscribed)
    }

    async fn on_failure(&mut self, _error: &RequestorError) {
        self.demand.close_children();
    }
}

fn mark_rejected(session: &Session, node: &ResourceNode) -> bool {
    let changed = session.update_state(node, |s| match s.proposal() {
        Some(state) if !state.is_terminal() => Some(LifecycleState::Proposal(ProposalState::Rejected)),
        _ => None,
    });
    node.close_children();
    changed
}

/// What became of a counter-offer
#[derive(Debug)]
pub enum ProposalResponse {
    /// The provider answered with a draft of its own
    Counter(Proposal),
    Rejected,
    TimedOut,
}

impl Proposal {
    pub fn proposal_state(&self) -> ProposalState {
        self.state().proposal().unwrap_or(ProposalState::Rejected)
    }

    pub fn is_rejected(&self) -> bool {
        self.proposal_state() == ProposalState::Rejected
    }

    /// Demand this negotiation chain belongs to
    pub fn demand(&self) -> RequestorResult<Demand> {
        let mut current = self.node.parent();
        while let Some(node) = current {
            if node.resource().kind == ResourceKind::Demand {
                return Ok(Demand::from_node(node, self.session.clone()));
            }
            current = node.parent();
        }
        Err(RequestorError::precondition(self.resource(), "proposal is not under a demand"))
    }

    fn has_counter(&self) -> bool {
        self.node
            .children()
            .iter()
            .any(|child| child.resource().kind == ResourceKind::Proposal)
    }

    /// Previous proposal in the chain, if this is a counter-offer
    pub fn parent_proposal(&self) -> Option<Proposal> {
        self.node
            .parent()
            .filter(|p| p.resource().kind == ResourceKind::Proposal)
            .map(|p| Proposal::from_node(p, self.session.clone()))
    }

    /// Send a counter-offer. The returned draft is our counter, linked as the
    /// single child of this proposal.
    #[instrument(skip(self, properties, constraints), fields(proposal_id = %self.id()))]
    pub async fn respond(&self, properties: Properties, constraints: String) -> RequestorResult<Proposal> {
        self.session.ensure_open()?;
        match self.proposal_state() {
            ProposalState::Rejected => {
                return Err(RequestorError::precondition(self.resource(), "proposal was rejected"))
            }
            ProposalState::Draft => {
                return Err(RequestorError::precondition(self.resource(), "drafts are not countered"))
            }
            ProposalState::Initial => {}
        }
        let demand = self.demand()?;
        let counter = DemandData {
            properties,
            constraints,
        };
        let _guard = demand.node().lock().await;
        if self.has_counter() {
            return Err(RequestorError::precondition(self.resource(), "proposal was already countered"));
        }
        let id = self
            .session
            .api()
            .counter_proposal(demand.id(), self.id(), &counter)
            .await?;

        let data = ProposalData {
            proposal_id: id.clone(),
            issuer_id: String::new(),
            state: ProposalState::Draft,
            prev_proposal_id: Some(self.id().clone()),
            properties: counter.properties,
            constraints: counter.constraints,
            timestamp: Utc::now(),
        };
        let node = self.session.get_or_create(
            ResourceKind::Proposal,
            id,
            Some(&self.node),
            Some(ResourceData::Proposal(data)),
        );
        debug!(counter_id = %node.resource().id, "Counter-offer sent");
        Ok(Proposal::from_node(node, self.session.clone()))
    }

    /// Reject the proposal. Any later response attempt fails.
    pub async fn reject(&self, reason: &str) -> RequestorResult<()> {
        if self.is_rejected() {
            return Err(RequestorError::precondition(self.resource(), "proposal already rejected"));
        }
        let demand = self.demand()?;
        self.session
            .api()
            .reject_proposal(demand.id(), self.id(), reason)
            .await?;
        mark_rejected(&self.session, &self.node);
        debug!(proposal_id = %self.id(), reason, "Proposal rejected");
        Ok(())
    }

    /// Wait for the provider's answer to this counter-offer.
    pub async fn next_response(&self, timeout: Duration) -> ProposalResponse {
        let mut children = self.node.children_watch();
        let mut state = self.node.state_watch();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let first = children.borrow_and_update().nodes.first().cloned();
            if let Some(node) = first {
                return ProposalResponse::Counter(Proposal::from_node(node, self.session.clone()));
            }
            if state.borrow_and_update().proposal() == Some(ProposalState::Rejected) {
                return ProposalResponse::Rejected;
            }
            tokio::select! {
                changed = children.changed() => {
                    if changed.is_err() {
                        return ProposalResponse::Rejected;
                    }
                }
                _ = state.changed() => {}
                _ = &mut deadline => return ProposalResponse::TimedOut,
            }
        }
    }

    /// Turn this proposal into an agreement valid for `valid_for`.
    #[instrument(skip(self), fields(proposal_id = %self.id()))]
    pub async fn create_agreement(&self, valid_for: Duration) -> RequestorResult<Agreement> {
        self.session.ensure_open()?;
        if self.is_rejected() {
            return Err(RequestorError::precondition(self.resource(), "proposal was rejected"));
        }
        let valid_to = Utc::now()
            + chrono::Duration::from_std(valid_for).unwrap_or_else(|_| chrono::Duration::hours(1));
        let id = self.session.api().create_agreement(self.id(), valid_to).await?;
        let node = self
            .session
            .get_or_create(ResourceKind::Agreement, id, Some(&self.node), None);
        info!(agreement_id = %node.resource().id, "Agreement created");
        Ok(Agreement::from_node(node, self.session.clone()))
    }
}

impl Agreement {
    pub fn agreement_state(&self) -> AgreementState {
        self.state().agreement().unwrap_or(AgreementState::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.agreement_state() == AgreementState::Terminated
    }

    fn transition(&self, next: AgreementState) -> bool {
        self.session.update_state(&self.node, |s| match s.agreement() {
            Some(current) if current.can_transition_to(next) => Some(LifecycleState::Agreement(next)),
            _ => None,
        })
    }

    /// Adopt an agreement made by an earlier process, taking its state
    /// from the daemon.
    #[instrument(skip(session))]
    pub async fn recover(session: &Session, id: &ResourceId) -> RequestorResult<Self> {
        session.ensure_open()?;
        let node = session.get_or_create(ResourceKind::Agreement, id.clone(), None, None);
        let agreement = Self::from_node(node, session.clone());
        let data = agreement.data(true).await?;
        match data.state.as_str() {
            "Approved" => {
                agreement.transition(AgreementState::Approved);
            }
            "Proposal" | "Pending" => {}
            _ => {
                agreement.transition(AgreementState::Terminated);
            }
        }
        debug!(agreement_id = %id, remote_state = %data.state, "Agreement recovered");
        Ok(agreement)
    }

    /// Send the agreement to the provider.
    pub async fn confirm(&self) -> RequestorResult<()> {
        self.session.ensure_open()?;
        if self.agreement_state() != AgreementState::Pending {
            return Err(RequestorError::precondition(
                self.resource(),
                format!("cannot confirm a {} agreement", self.agreement_state().as_str()),
            ));
        }
        self.session.api().confirm_agreement(self.id()).await?;
        debug!(agreement_id = %self.id(), "Agreement confirmed");
        Ok(())
    }

    /// Poll until the provider decides. `Ok(true)` once approved,
    /// `Ok(false)` if rejected, `ApprovalTimeout` if `timeout` elapses first.
    /// A timed out agreement is left for the caller to terminate.
    #[instrument(skip(self), fields(agreement_id = %self.id()))]
    pub async fn wait_for_approval(&self, timeout: Duration) -> RequestorResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = self.session.config().approval_poll_interval;

        loop {
            match self.agreement_state() {
                AgreementState::Approved => return Ok(true),
                AgreementState::Terminated => return Ok(false),
                AgreementState::Pending => {}
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RequestorError::ApprovalTimeout {
                    agreement_id: self.id().clone(),
                    timeout,
                });
            }

            match self
                .session
                .api()
                .wait_for_approval(self.id(), remaining.min(interval))
                .await
            {
                Ok(()) => {
                    self.transition(AgreementState::Approved);
                    info!("Agreement approved");
                    return Ok(true);
                }
                Err(ApiError::Gone(reason)) => {
                    self.transition(AgreementState::Terminated);
                    info!(%reason, "Agreement rejected by provider");
                    return Ok(false);
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Agreement not decided yet");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Start an activity under this agreement. Requires approval.
    #[instrument(skip(self), fields(agreement_id = %self.id()))]
    pub async fn create_activity(&self) -> RequestorResult<Activity> {
        self.session.ensure_open()?;
        if self.agreement_state() != AgreementState::Approved {
            return Err(RequestorError::precondition(
                self.resource(),
                format!(
                    "activity needs an approved agreement, this one is {}",
                    self.agreement_state().as_str()
                ),
            ));
        }
        let id = self.session.api().create_activity(self.id()).await?;
        let node = self
            .session
            .get_or_create(ResourceKind::Activity, id, Some(&self.node), None);
        info!(activity_id = %node.resource().id, "Activity created");
        Ok(Activity::from_node(node, self.session.clone()))
    }

    /// Activities created under this agreement
    pub fn activities(&self) -> Vec<Activity> {
        self.node
            .children()
            .into_iter()
            .filter(|n| n.resource().kind == ResourceKind::Activity)
            .map(|n| Activity::from_node(n, self.session.clone()))
            .collect()
    }

    /// Terminate the agreement. Terminating an already terminated agreement
    /// succeeds.
    pub async fn terminate(&self, reason: &str) -> RequestorResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        match self.session.api().terminate_agreement(self.id(), reason).await {
            Ok(()) | Err(ApiError::Gone(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.transition(AgreementState::Terminated);
        info!(agreement_id = %self.id(), reason, "Agreement terminated");
        Ok(())
    }

    /// Terminate with retries, then destroy every activity. Never fails;
    /// problems are logged.
    pub async fn close_all(&self) {
        let config = self.session.config();
        let attempts = config.terminate_attempts.max(1);

        for attempt in 0..attempts {
            match self.terminate("Terminated by requestor").await {
                Ok(()) => break,
                Err(e) => {
                    warn!(agreement_id = %self.id(), attempt = attempt + 1, error = %e, "Failed to terminate agreement");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(config.terminate_backoff * 2u32.saturating_pow(attempt)).await;
                    }
                }
            }
        }

        for activity in self.activities() {
            if activity.is_destroyed() {
                continue;
            }
            if let Err(e) = activity.destroy().await {
                warn!(activity_id = %activity.id(), error = %e, "Failed to destroy activity");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApprovalBehaviour, MockDaemon, MockProvider, ProviderReaction};
    use crate::session::SessionConfig;
    use requestor_types::AgreementState;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            offer_poll_timeout: Duration::from_millis(20),
            approval_poll_interval: Duration::from_millis(20),
            terminate_backoff: Duration::from_millis(1),
            ..SessionConfig::default()
        }
    }

    async fn setup(provider: MockProvider) -> (Arc<MockDaemon>, Session, Demand) {
        let mock = Arc::new(MockDaemon::new());
        mock.add_provider(provider).await;
        let session = Session::new(mock.clone(), fast_config());
        let demand = Demand::subscribe(
            &session,
            DemandData {
                properties: Properties::new(),
                constraints: "()".into(),
            },
        )
        .await
        .unwrap();
        (mock, session, demand)
    }

    async fn first_offer(demand: &Demand) -> Proposal {
        let mut offers = Box::pin(demand.initial_proposals());
        tokio::time::timeout(Duration::from_secs(2), offers.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_counter_offer_is_single_draft_child() {
        let (_, _, demand) = setup(MockProvider::new("p1")).await;
        let offer = first_offer(&demand).await;

        let counter = offer.respond(Properties::new(), "()".into()).await.unwrap();
        assert_eq!(counter.proposal_state(), ProposalState::Draft);
        assert_eq!(offer.node().children().len(), 1);
        assert_eq!(counter.parent_proposal().unwrap().id(), offer.id());

        match counter.next_response(Duration::from_secs(2)).await {
            ProposalResponse::Counter(reply) => {
                assert_eq!(reply.proposal_state(), ProposalState::Draft);
                assert_eq!(reply.parent_proposal().unwrap().id(), counter.id());
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_only_one_counter_per_offer() {
        let (mock, _, demand) = setup(MockProvider::new("p1")).await;
        let offer = first_offer(&demand).await;

        let counter = offer.respond(Properties::new(), "()".into()).await.unwrap();
        let again = offer.respond(Properties::new(), "()".into()).await.unwrap_err();
        assert!(matches!(again, RequestorError::StatePrecondition { .. }));
        assert_eq!(offer.node().children().len(), 1);

        let on_draft = counter.respond(Properties::new(), "()".into()).await.unwrap_err();
        assert!(matches!(on_draft, RequestorError::StatePrecondition { .. }));
        assert_eq!(mock.calls("counter_proposal"), 1);
    }

    #[tokio::test]
    async fn test_rejected_proposal_refuses_responses() {
        let (_, _, demand) = setup(MockProvider::new("p1")).await;
        let offer = first_offer(&demand).await;

        offer.reject("too expensive").await.unwrap();
        let err = offer.respond(Properties::new(), "()".into()).await.unwrap_err();
        assert!(matches!(err, RequestorError::StatePrecondition { .. }));
        assert!(offer.reject("again").await.is_err());
    }

    #[tokio::test]
    async fn test_provider_rejection_marks_counter_rejected() {
        let provider = MockProvider::new("p1").with_reaction(ProviderReaction::RejectCounter);
        let (_, _, demand) = setup(provider).await;
        let offer = first_offer(&demand).await;

        let counter = offer.respond(Properties::new(), "()".into()).await.unwrap();
        assert!(matches!(
            counter.next_response(Duration::from_secs(2)).await,
            ProposalResponse::Rejected
        ));
        assert!(counter.is_rejected());
    }

    #[tokio::test]
    async fn test_agreement_approval_and_activity() {
        let (_, _, demand) = setup(MockProvider::new("p1")).await;
        let offer = first_offer(&demand).await;
        let agreement = offer.create_agreement(Duration::from_secs(3600)).await.unwrap();

        let early = agreement.create_activity().await.unwrap_err();
        assert!(matches!(early, RequestorError::StatePrecondition { .. }));

        agreement.confirm().await.unwrap();
        assert!(agreement.wait_for_approval(Duration::from_secs(1)).await.unwrap());
        assert_eq!(agreement.agreement_state(), AgreementState::Approved);

        let activity = agreement.create_activity().await.unwrap();
        assert_eq!(agreement.activities().len(), 1);
        assert_eq!(activity.agreement().unwrap().id(), agreement.id());
    }

    #[tokio::test]
    async fn test_approval_timeout_leaves_agreement_pending() {
        let provider = MockProvider::new("p1").with_approval(ApprovalBehaviour::Never);
        let (_, _, demand) = setup(provider).await;
        let agreement = first_offer(&demand)
            .await
            .create_agreement(Duration::from_secs(60))
            .await
            .unwrap();
        agreement.confirm().await.unwrap();

        let err = agreement.wait_for_approval(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, RequestorError::ApprovalTimeout { .. }));
        assert!(err.is_timeout());
        assert_eq!(agreement.agreement_state(), AgreementState::Pending);
    }

    #[tokio::test]
    async fn test_provider_rejection_terminates_agreement() {
        let provider = MockProvider::new("p1").with_approval(ApprovalBehaviour::Reject);
        let (_, _, demand) = setup(provider).await;
        let agreement = first_offer(&demand)
            .await
            .create_agreement(Duration::from_secs(60))
            .await
            .unwrap();
        agreement.confirm().await.unwrap();

        assert!(!agreement.wait_for_approval(Duration::from_secs(1)).await.unwrap());
        assert!(agreement.is_terminated());
        assert!(agreement.create_activity().await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_retries_terminate_and_destroys_activities() {
        let (mock, _, demand) = setup(MockProvider::new("p1")).await;
        let agreement = first_offer(&demand)
            .await
            .create_agreement(Duration::from_secs(60))
            .await
            .unwrap();
        agreement.confirm().await.unwrap();
        agreement.wait_for_approval(Duration::from_secs(1)).await.unwrap();
        let activity = agreement.create_activity().await.unwrap();

        mock.fail_next("terminate_agreement", ApiError::Transient("reset".into()));
        agreement.close_all().await;

        assert_eq!(mock.calls("terminate_agreement"), 2);
        assert!(agreement.is_terminated());
        assert!(activity.is_destroyed());
        assert_eq!(mock.activity_destroyed(activity.id()).await, Some(true));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_offer_stream() {
        let (mock, session, demand) = setup(MockProvider::new("p1")).await;
        first_offer(&demand).await;

        demand.unsubscribe().await.unwrap();
        let offers: Vec<_> = demand.initial_proposals().collect().await;
        assert_eq!(offers.len(), 1);
        assert!(!session.has_collector(&collector_key(demand.resource())));
        assert_eq!(mock.calls("unsubscribe_demand"), 1);
    }

    #[tokio::test]
    async fn test_recover_adopts_live_agreement_and_activity() {
        let mock = Arc::new(MockDaemon::new());
        let (agreement_id, activity_id) = mock.seed_live_activity("p1").await;
        let session = Session::new(mock.clone(), fast_config());

        let agreement = Agreement::recover(&session, &agreement_id).await.unwrap();
        assert_eq!(agreement.agreement_state(), AgreementState::Approved);

        let activity = Activity::recover(&agreement, &activity_id).await.unwrap();
        assert_eq!(activity.activity_state(), requestor_types::ActivityState::Idle);
        assert_eq!(agreement.activities().len(), 1);

        agreement.terminate("done").await.unwrap();
        let again = Agreement::recover(&session, &agreement_id).await.unwrap();
        assert!(again.is_terminated());
        assert_eq!(mock.calls("create_activity"), 0);
    }
}
