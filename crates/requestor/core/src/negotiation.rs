//! Negotiation pipeline
//!
//! Offers from a demand are scored; scored-out offers are rejected at once
//! and the rest go through a negotiation step. Proposals that come out of it
//! are handed to the consumer best score first, and [`Negotiator::agree`]
//! turns one into an approved agreement.

use crate::error::{RequestorError, RequestorResult};
use crate::market::{Agreement, Demand, Proposal, ProposalResponse};
use async_trait::async_trait;
use futures::StreamExt;
use requestor_types::{DemandData, ProposalData};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Score of an offer; `None` rejects it
pub type ProposalScorer = Arc<dyn Fn(&ProposalData) -> Option<f64> + Send + Sync>;

/// Every offer scores the same
pub fn accept_all() -> ProposalScorer {
    Arc::new(|_| Some(0.0))
}

/// Cheaper offers score higher; offers without linear pricing or above
/// `max_hourly` are rejected.
pub fn price_scorer(max_hourly: Option<f64>) -> ProposalScorer {
    Arc::new(move |proposal| {
        let hourly = proposal.pricing()?.hourly_estimate();
        match max_hourly {
            Some(max) if hourly > max => None,
            _ => Some(-hourly),
        }
    })
}

/// Price limits an offer must satisfy to be accepted as is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConstraints {
    pub max_start_price: Option<f64>,
    pub max_cpu_sec_price: Option<f64>,
    pub max_duration_sec_price: Option<f64>,
}

impl PricingConstraints {
    pub fn is_empty(&self) -> bool {
        self.max_start_price.is_none()
            && self.max_cpu_sec_price.is_none()
            && self.max_duration_sec_price.is_none()
    }

    pub fn satisfied(&self, proposal: &ProposalData) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(pricing) = proposal.pricing() else {
            return false;
        };
        let within = |limit: Option<f64>, value: f64| limit.map_or(true, |max| value <= max);
        within(self.max_start_price, pricing.start)
            && within(self.max_cpu_sec_price, pricing.per_cpu_sec)
            && within(self.max_duration_sec_price, pricing.per_duration_sec)
    }
}

/// Turns an offer into a proposal ready for an agreement, or gives up
#[async_trait]
pub trait NegotiationStep: Send + Sync {
    async fn negotiate(&self, offer: Proposal) -> RequestorResult<Option<Proposal>>;
}

/// Accept an offer that satisfies the constraints; otherwise counter once
/// and take the provider's answer if that satisfies them.
pub struct DefaultNegotiation {
    pub demand: DemandData,
    pub constraints: PricingConstraints,
    pub response_timeout: Duration,
}

#[async_trait]
impl NegotiationStep for DefaultNegotiation {
    async fn negotiate(&self, offer: Proposal) -> RequestorResult<Option<Proposal>> {
        let data = offer.data(false).await?;
        if self.constraints.satisfied(&data) {
            return Ok(Some(offer));
        }

        let counter = offer
            .respond(self.demand.properties.clone(), self.demand.constraints.clone())
            .await?;
        match counter.next_response(self.response_timeout).await {
            ProposalResponse::Counter(reply) => {
                let reply_data = reply.data(false).await?;
                if self.constraints.satisfied(&reply_data) {
                    Ok(Some(reply))
                } else {
                    reply.reject("price too high").await?;
                    Ok(None)
                }
            }
            ProposalResponse::Rejected => Ok(None),
            ProposalResponse::TimedOut => {
                debug!(proposal_id = %counter.id(), "No answer to counter-offer");
                Ok(None)
            }
        }
    }
}

/// Negotiation timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub agreement_validity: Duration,
    pub approval_timeout: Duration,
    /// Negotiated proposals buffered ahead of the consumer
    pub buffer: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            agreement_validity: Duration::from_secs(3600),
            approval_timeout: Duration::from_secs(60),
            buffer: 16,
        }
    }
}

struct Scored {
    score: f64,
    proposal: Proposal,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}

/// Negotiated proposals, best score first among those already available
pub struct NegotiatedProposals {
    rx: mpsc::Receiver<Scored>,
    ready: BinaryHeap<Scored>,
}

impl NegotiatedProposals {
    /// Next proposal, or `None` once the offer stream has ended and
    /// everything was handed out.
    pub async fn next(&mut self) -> Option<Proposal> {
        if self.ready.is_empty() {
            let first = self.rx.recv().await?;
            self.ready.push(first);
        }
        while let Ok(more) = self.rx.try_recv() {
            self.ready.push(more);
        }
        self.ready.pop().map(|s| s.proposal)
    }
}

pub struct Negotiator {
    scorer: ProposalScorer,
    step: Arc<dyn NegotiationStep>,
    config: NegotiationConfig,
}

impl Negotiator {
    pub fn new(scorer: ProposalScorer, step: Arc<dyn NegotiationStep>, config: NegotiationConfig) -> Self {
        Self {
            scorer,
            step,
            config,
        }
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    /// Negotiate every offer of `demand` in the background.
    pub fn start(&self, demand: &Demand) -> NegotiatedProposals {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let scorer = self.scorer.clone();
        let step = self.step.clone();
        let offers = demand.initial_proposals();
        let demand_id = demand.id().clone();

        tokio::spawn(async move {
            let mut offers = Box::pin(offers);
            while let Some(offer) = offers.next().await {
                if tx.is_closed() {
                    break;
                }
                let data = match offer.data(false).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(proposal_id = %offer.id(), error = %e, "Offer without data");
                        continue;
                    }
                };
                let Some(score) = scorer(&data) else {
                    debug!(proposal_id = %offer.id(), issuer = %data.issuer_id, "Offer scored out");
                    if let Err(e) = offer.reject("not acceptable").await {
                        warn!(proposal_id = %offer.id(), error = %e, "Failed to reject offer");
                    }
                    continue;
                };

                let step = step.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let offer_id = offer.id().clone();
                    match step.negotiate(offer).await {
                        Ok(Some(proposal)) => {
                            let _ = tx.send(Scored { score, proposal }).await;
                        }
                        Ok(None) => debug!(proposal_id = %offer_id, "Negotiation gave up"),
                        Err(e) => warn!(proposal_id = %offer_id, error = %e, "Negotiation failed"),
                    }
                });
            }
            debug!(%demand_id, "Offer stream ended");
        });

        NegotiatedProposals {
            rx,
            ready: BinaryHeap::new(),
        }
    }

    /// Create, confirm and await approval of an agreement from `proposal`.
    ///
    /// An agreement that is not approved in time is terminated before the
    /// timeout is returned.
    #[instrument(skip_all, fields(proposal_id = %proposal.id()))]
    pub async fn agree(&self, proposal: &Proposal) -> RequestorResult<Agreement> {
        let agreement = proposal.create_agreement(self.config.agreement_validity).await?;
        let outcome = async {
            agreement.confirm().await?;
            agreement.wait_for_approval(self.config.approval_timeout).await
        }
        .await;

        match outcome {
            Ok(true) => {
                info!(agreement_id = %agreement.id(), "Agreement approved");
                Ok(agreement)
            }
            Ok(false) => Err(RequestorError::precondition(
                agreement.resource(),
                "provider rejected the agreement",
            )),
            Err(e) => {
                if let Err(term) = agreement.terminate("Not approved in time").await {
                    warn!(agreement_id = %agreement.id(), error = %term, "Failed to terminate agreement");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApprovalBehaviour, MockDaemon, MockProvider};
    use crate::session::{Session, SessionConfig};
    use chrono::Utc;
    use requestor_types::{
        data::{PRICING_COEFFS_PROPERTY, USAGE_CPU_SEC, USAGE_DURATION_SEC, USAGE_VECTOR_PROPERTY},
        AgreementState, ProposalState, Properties, ResourceId,
    };
    use serde_json::json;

    fn priced(provider: &str, cpu: f64, dur: f64, start: f64) -> MockProvider {
        MockProvider::new(provider)
            .with_property(USAGE_VECTOR_PROPERTY, json!([USAGE_CPU_SEC, USAGE_DURATION_SEC]))
            .with_property(PRICING_COEFFS_PROPERTY, json!([cpu, dur, start]))
    }

    fn offer(cpu: f64) -> ProposalData {
        let mut properties = Properties::new();
        properties.insert(USAGE_VECTOR_PROPERTY.into(), json!([USAGE_CPU_SEC, USAGE_DURATION_SEC]));
        properties.insert(PRICING_COEFFS_PROPERTY.into(), json!([cpu, 0.0, 0.0]));
        ProposalData {
            proposal_id: ResourceId::generate(),
            issuer_id: "p".into(),
            state: ProposalState::Initial,
            prev_proposal_id: None,
            properties,
            constraints: "()".into(),
            timestamp: Utc::now(),
        }
    }

    fn session(mock: Arc<MockDaemon>) -> Session {
        Session::new(
            mock,
            SessionConfig {
                offer_poll_timeout: Duration::from_millis(10),
                approval_poll_interval: Duration::from_millis(10),
                ..SessionConfig::default()
            },
        )
    }

    fn demand_data() -> DemandData {
        DemandData {
            properties: Properties::new(),
            constraints: "()".into(),
        }
    }

    #[test]
    fn test_price_scorer() {
        let scorer = price_scorer(Some(10.0));
        assert!(scorer(&offer(0.001)).unwrap() > scorer(&offer(0.002)).unwrap());
        assert!(scorer(&offer(0.01)).is_none());

        let mut unpriced = offer(0.0);
        unpriced.properties.clear();
        assert!(scorer(&unpriced).is_none());
        assert!(accept_all()(&unpriced).is_some());
    }

    #[test]
    fn test_constraints() {
        let constraints = PricingConstraints {
            max_cpu_sec_price: Some(0.001),
            ..Default::default()
        };
        assert!(constraints.satisfied(&offer(0.0005)));
        assert!(!constraints.satisfied(&offer(0.002)));
        assert!(PricingConstraints::default().satisfied(&offer(5.0)));
    }

    #[tokio::test]
    async fn test_best_offer_first_and_expensive_rejected() {
        let mock = Arc::new(MockDaemon::new());
        mock.add_provider(priced("cheap", 0.0001, 0.0, 0.0)).await;
        mock.add_provider(priced("mid", 0.0002, 0.0, 0.0)).await;
        mock.add_provider(priced("pricey", 1.0, 0.0, 0.0)).await;
        let session = session(mock.clone());
        let demand = Demand::subscribe(&session, demand_data()).await.unwrap();

        let negotiator = Negotiator::new(
            price_scorer(Some(5.0)),
            Arc::new(DefaultNegotiation {
                demand: demand_data(),
                constraints: PricingConstraints::default(),
                response_timeout: Duration::from_secs(1),
            }),
            NegotiationConfig::default(),
        );
        let mut proposals = negotiator.start(&demand);

        // Let every offer get negotiated before taking the best one
        tokio::time::sleep(Duration::from_millis(200)).await;
        let best = proposals.next().await.unwrap();
        assert_eq!(best.data(false).await.unwrap().issuer_id, "cheap");
        let second = proposals.next().await.unwrap();
        assert_eq!(second.data(false).await.unwrap().issuer_id, "mid");

        assert_eq!(mock.calls("reject_proposal"), 1);
    }

    #[tokio::test]
    async fn test_counter_when_constraints_unmet() {
        let mock = Arc::new(MockDaemon::new());
        mock.add_provider(priced("p1", 0.01, 0.0, 0.0)).await;
        let session = session(mock.clone());
        let demand = Demand::subscribe(&session, demand_data()).await.unwrap();

        let step = DefaultNegotiation {
            demand: demand_data(),
            constraints: PricingConstraints {
                max_cpu_sec_price: Some(0.1),
                max_start_price: Some(0.0),
                ..Default::default()
            },
            response_timeout: Duration::from_secs(1),
        };
        let mut offers = Box::pin(demand.initial_proposals());
        let first = offers.next().await.unwrap();

        let accepted = step.negotiate(first.clone()).await.unwrap().unwrap();
        assert_eq!(accepted.id(), first.id());
        assert_eq!(mock.calls("counter_proposal"), 0);

        let strict = DefaultNegotiation {
            constraints: PricingConstraints {
                max_cpu_sec_price: Some(0.001),
                ..Default::default()
            },
            ..step
        };
        assert!(strict.negotiate(first.clone()).await.unwrap().is_none());
        assert_eq!(mock.calls("counter_proposal"), 1);
        assert_eq!(mock.calls("reject_proposal"), 1);
    }

    #[tokio::test]
    async fn test_agree_terminates_unapproved_agreement() {
        let mock = Arc::new(MockDaemon::new());
        mock.add_provider(MockProvider::new("slow").with_approval(ApprovalBehaviour::Never))
            .await;
        let session = session(mock.clone());
        let demand = Demand::subscribe(&session, demand_data()).await.unwrap();
        let offer = Box::pin(demand.initial_proposals()).next().await.unwrap();

        let negotiator = Negotiator::new(
            accept_all(),
            Arc::new(DefaultNegotiation {
                demand: demand_data(),
                constraints: PricingConstraints::default(),
                response_timeout: Duration::from_secs(1),
            }),
            NegotiationConfig {
                approval_timeout: Duration::from_millis(50),
                ..NegotiationConfig::default()
            },
        );

        let err = negotiator.agree(&offer).await.unwrap_err();
        assert!(err.is_timeout());
        let agreement = offer.node().children().pop().unwrap();
        assert_eq!(agreement.state().agreement(), Some(AgreementState::Terminated));
        assert_eq!(mock.calls("terminate_agreement"), 1);
    }
}
