//! Requestor - Core
//!
//! The in-memory model of one requestor session: a tree of marketplace
//! resources mirrored from the daemon, the event bus that reports every change
//! to it, the collectors that keep it up to date, and the negotiation and
//! batch execution pipelines built on top.
//!
//! ```text
//! Demand ─┬─ Proposal (offer) ── Proposal (our counter) ── Proposal (reply)
//!         └─ Proposal (offer) ── Agreement ─┬─ Activity ── PoolingBatch
//!                                           └─ Invoice      └─ DebitNote
//! ```

/// Declare a typed handle over one resource node.
///
/// Handles are cheap to clone; all clones refer to the same node of the
/// session registry.
macro_rules! resource_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $variant:ident, $data:ty) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            pub(crate) node: ::std::sync::Arc<$crate::resource::ResourceNode>,
            pub(crate) session: $crate::session::Session,
        }

        impl $name {
            pub const KIND: ::requestor_types::ResourceKind = $kind;

            pub fn from_node(
                node: ::std::sync::Arc<$crate::resource::ResourceNode>,
                session: $crate::session::Session,
            ) -> Self {
                Self { node, session }
            }

            /// Handle for an already known resource
            pub fn lookup(
                session: &$crate::session::Session,
                id: &::requestor_types::ResourceId,
            ) -> $crate::error::RequestorResult<Self> {
                let node = session.require(Self::KIND, id)?;
                Ok(Self::from_node(node, session.clone()))
            }

            pub fn id(&self) -> &::requestor_types::ResourceId {
                &self.node.resource().id
            }

            pub fn resource(&self) -> &::requestor_types::ResourceRef {
                self.node.resource()
            }

            pub fn node(&self) -> &::std::sync::Arc<$crate::resource::ResourceNode> {
                &self.node
            }

            pub fn session(&self) -> &$crate::session::Session {
                &self.session
            }

            pub fn state(&self) -> ::requestor_types::LifecycleState {
                self.node.state()
            }

            /// Cached data, fetched from the daemon when missing or `force`d.
            pub async fn data(&self, force: bool) -> $crate::error::RequestorResult<$data> {
                let data = self.session.get_data(&self.node, force).await?;
                match &*data {
                    ::requestor_types::ResourceData::$variant(inner) => Ok(inner.clone()),
                    other => Err($crate::error::ApiError::Decode(format!(
                        "{} holds {} data",
                        self.resource(),
                        other.kind().as_str()
                    ))
                    .into()),
                }
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("id", self.id())
                    .field("state", &self.state())
                    .finish()
            }
        }
    };
}

pub mod activity;
pub mod api;
pub mod batch;
pub mod collector;
pub mod error;
pub mod events;
pub mod market;
pub mod negotiation;
pub mod network;
pub mod payment;
pub mod resource;
pub mod session;

pub use activity::Activity;
pub use api::{DaemonApi, HttpApiConfig, HttpDaemonApi, MockDaemon, MockProvider};
pub use batch::PoolingBatch;
pub use collector::{EventSource, RetryPolicy};
pub use error::{ApiError, ApiResult, RequestorError, RequestorResult};
pub use events::{EventBus, EventSubscription, ListenerId};
pub use market::{Agreement, Demand, Proposal, ProposalResponse};
pub use negotiation::{
    accept_all, price_scorer, DefaultNegotiation, NegotiatedProposals, NegotiationConfig,
    NegotiationStep, Negotiator, PricingConstraints, ProposalScorer,
};
pub use network::Network;
pub use payment::{collect_payments, Allocation, DebitNote, Invoice};
pub use resource::ResourceNode;
pub use session::{Session, SessionConfig};
