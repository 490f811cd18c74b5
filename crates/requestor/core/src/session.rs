//! Session: registry of resource nodes, collectors and the event bus
//!
//! A session owns everything tied to one requestor run. Resources are
//! singletons per (kind, id) within it, and its event bus lives and dies
//! with it.

use crate::api::DaemonApi;
use crate::collector::{run_collector, EventSource, RetryPolicy};
use crate::error::{ApiError, RequestorError, RequestorResult};
use crate::events::EventBus;
use crate::resource::ResourceNode;
use dashmap::DashMap;
use requestor_types::{
    LifecycleState, RequestorEvent, ResourceData, ResourceId, ResourceKind, ResourceRef,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timing knobs of daemon interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub collector_retry: RetryPolicy,
    /// Long-poll window of the offer collector
    pub offer_poll_timeout: Duration,
    pub offer_poll_max_events: usize,
    pub batch_poll_timeout: Duration,
    pub payment_poll_timeout: Duration,
    pub payment_poll_max_events: usize,
    /// Longest single approval poll inside `wait_for_approval`
    pub approval_poll_interval: Duration,
    pub terminate_attempts: u32,
    /// Base of the exponential backoff between terminate attempts
    pub terminate_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collector_retry: RetryPolicy::default(),
            offer_poll_timeout: Duration::from_secs(5),
            offer_poll_max_events: 10,
            batch_poll_timeout: Duration::from_secs(5),
            payment_poll_timeout: Duration::from_secs(5),
            payment_poll_max_events: 100,
            approval_poll_interval: Duration::from_secs(5),
            terminate_attempts: 4,
            terminate_backoff: Duration::from_secs(1),
        }
    }
}

struct SessionInner {
    api: Arc<dyn DaemonApi>,
    bus: EventBus,
    config: SessionConfig,
    nodes: DashMap<ResourceRef, Arc<ResourceNode>>,
    collectors: DashMap<String, JoinHandle<()>>,
    closed: AtomicBool,
}

/// Shared handle to one requestor session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(api: Arc<dyn DaemonApi>, config: SessionConfig) -> Self {
        Self::with_bus(api, config, EventBus::new())
    }

    pub fn with_bus(api: Arc<dyn DaemonApi>, config: SessionConfig, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                api,
                bus,
                config,
                nodes: DashMap::new(),
                collectors: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn api(&self) -> &Arc<dyn DaemonApi> {
        &self.inner.api
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> RequestorResult<()> {
        if self.is_closed() {
            Err(RequestorError::SessionClosed)
        } else {
            Ok(())
        }
    }

    pub fn publish(&self, event: RequestorEvent) {
        self.inner.bus.publish(event);
    }

    // Registry

    /// The node for (kind, id), created on first sight.
    ///
    /// A new node is announced with `NewResource` and linked under `parent`
    /// with `ChildAdded`. An existing node keeps its original parent; `data`
    /// only refreshes its cached snapshot.
    pub fn get_or_create(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        parent: Option<&Arc<ResourceNode>>,
        data: Option<ResourceData>,
    ) -> Arc<ResourceNode> {
        let key = ResourceRef::new(kind, id);
        let mut created = false;
        let mut pending = data;

        let node = self
            .inner
            .nodes
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                let state = initial_state(kind, pending.as_ref());
                Arc::new(ResourceNode::new(key.clone(), parent, state, pending.take()))
            })
            .clone();

        if created {
            debug!(resource = %key, "New resource");
            self.publish(RequestorEvent::NewResource {
                resource: key.clone(),
                parent: parent.map(|p| p.resource().clone()),
            });
        } else if let Some(data) = pending {
            if node.set_data(Arc::new(data)) {
                self.publish(RequestorEvent::ResourceDataChanged { resource: key.clone() });
            }
        }

        if let Some(parent) = parent {
            if node.parent_ref() == Some(parent.resource()) && parent.add_child(node.clone()) {
                self.publish(RequestorEvent::ChildAdded {
                    parent: parent.resource().clone(),
                    child: key,
                });
            }
        }
        node
    }

    pub fn node(&self, kind: ResourceKind, id: &ResourceId) -> Option<Arc<ResourceNode>> {
        self.inner
            .nodes
            .get(&ResourceRef::new(kind, id.clone()))
            .map(|n| n.value().clone())
    }

    pub fn require(&self, kind: ResourceKind, id: &ResourceId) -> RequestorResult<Arc<ResourceNode>> {
        self.node(kind, id).ok_or_else(|| RequestorError::ResourceNotFound {
            kind,
            id: id.clone(),
        })
    }

    /// Every registered node of a kind
    pub fn nodes_of(&self, kind: ResourceKind) -> Vec<Arc<ResourceNode>> {
        self.inner
            .nodes
            .iter()
            .filter(|n| n.key().kind == kind)
            .map(|n| n.value().clone())
            .collect()
    }

    /// Drop a node from the tree. Its children stay registered.
    pub fn remove(&self, resource: &ResourceRef) -> RequestorResult<()> {
        let (_, node) = self.inner.nodes.remove(resource).ok_or_else(|| {
            RequestorError::ResourceNotFound {
                kind: resource.kind,
                id: resource.id.clone(),
            }
        })?;

        self.stop_collector(&collector_key(resource));
        if let Some(parent) = node.parent() {
            parent.remove_child(resource);
        }
        node.close_children();
        self.publish(RequestorEvent::ResourceClosed {
            resource: resource.clone(),
        });
        Ok(())
    }

    /// Drop a node together with all of its descendants, leaves first.
    pub fn remove_subtree(&self, resource: &ResourceRef) -> RequestorResult<()> {
        let node = self.require(resource.kind, &resource.id)?;
        for child in node.children() {
            if self.node(child.resource().kind, &child.resource().id).is_some() {
                self.remove_subtree(child.resource())?;
            }
        }
        self.remove(resource)
    }

    // Data and state

    /// Cached data of `node`, read from the daemon when forced or absent.
    pub async fn get_data(&self, node: &Arc<ResourceNode>, force: bool) -> RequestorResult<Arc<ResourceData>> {
        let (data, changed) = node
            .get_data_with(force, || self.fetch_remote(node))
            .await?;
        if changed {
            self.publish(RequestorEvent::ResourceDataChanged {
                resource: node.resource().clone(),
            });
        }
        Ok(data)
    }

    async fn fetch_remote(&self, node: &Arc<ResourceNode>) -> RequestorResult<ResourceData> {
        let api = &self.inner.api;
        let id = &node.resource().id;
        let data = match node.resource().kind {
            ResourceKind::Demand => ResourceData::Demand(api.get_demand(id).await?),
            ResourceKind::Proposal => {
                let demand = owning_demand(node).ok_or_else(|| {
                    RequestorError::precondition(node.resource(), "proposal has no demand")
                })?;
                ResourceData::Proposal(api.get_proposal(&demand, id).await?)
            }
            ResourceKind::Agreement => ResourceData::Agreement(api.get_agreement(id).await?),
            ResourceKind::Activity => ResourceData::Activity(api.get_activity(id).await?),
            ResourceKind::Allocation => ResourceData::Allocation(api.get_allocation(id).await?),
            ResourceKind::DebitNote => ResourceData::DebitNote(api.get_debit_note(id).await?),
            ResourceKind::Invoice => ResourceData::Invoice(api.get_invoice(id).await?),
            // Maintained locally from collected results and node assignments
            ResourceKind::PoolingBatch | ResourceKind::Network => {
                return node
                    .cached_data()
                    .map(|d| (*d).clone())
                    .ok_or_else(|| ApiError::NotFound(node.resource().to_string()).into())
            }
        };
        Ok(data)
    }

    /// Apply a state transition decided by `next` and announce it.
    pub(crate) fn update_state<F>(&self, node: &ResourceNode, next: F) -> bool
    where
        F: FnOnce(LifecycleState) -> Option<LifecycleState>,
    {
        match node.update_state(next) {
            Some((from, to)) => {
                debug!(resource = %node.resource(), ?from, ?to, "State changed");
                self.publish(RequestorEvent::StateChanged {
                    resource: node.resource().clone(),
                    from,
                    to,
                });
                true
            }
            None => false,
        }
    }

    // Collectors

    /// Run `source` in the background under `key` until it finishes, fails
    /// or is stopped.
    pub(crate) fn spawn_collector<S: EventSource>(&self, key: String, resource: Option<ResourceRef>, mut source: S) {
        let bus = self.inner.bus.clone();
        let policy = self.inner.config.collector_retry;
        let name = key.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_collector(&mut source, policy).await {
                error!(collector = %name, error = %e, "Collector failed");
                source.on_failure(&e).await;
                bus.publish(RequestorEvent::CollectorFailed {
                    collector: name,
                    resource,
                    reason: e.to_string(),
                });
            }
        });

        if let Some(previous) = self.inner.collectors.insert(key, handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop_collector(&self, key: &str) {
        if let Some((_, handle)) = self.inner.collectors.remove(key) {
            handle.abort();
        }
    }

    pub fn has_collector(&self, key: &str) -> bool {
        self.inner
            .collectors
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    // Shutdown

    /// Close the session: stop every collector, optionally terminate every
    /// live agreement (destroying its activities), then drain the bus.
    pub async fn close(&self, terminate_agreements: bool) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(terminate_agreements, "Closing session");

        let keys: Vec<String> = self.inner.collectors.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop_collector(&key);
        }

        for node in self.nodes_of(ResourceKind::Demand) {
            let demand = crate::market::Demand::from_node(node, self.clone());
            if let Err(e) = demand.unsubscribe().await {
                warn!(demand_id = %demand.id(), error = %e, "Failed to unsubscribe demand");
            }
        }

        if terminate_agreements {
            for node in self.nodes_of(ResourceKind::Agreement) {
                let agreement = crate::market::Agreement::from_node(node, self.clone());
                if !agreement.is_terminated() {
                    agreement.close_all().await;
                }
            }
        }

        self.inner.bus.shutdown().await;
        info!("Session closed");
    }
}

/// Collector registry key of a resource
pub(crate) fn collector_key(resource: &ResourceRef) -> String {
    resource.to_string()
}

fn initial_state(kind: ResourceKind, data: Option<&ResourceData>) -> LifecycleState {
    match data {
        Some(ResourceData::Proposal(p)) => LifecycleState::Proposal(p.state),
        _ => kind.initial_state(),
    }
}

fn owning_demand(node: &Arc<ResourceNode>) -> Option<ResourceId> {
    let mut current = node.parent();
    while let Some(n) = current {
        if n.resource().kind == ResourceKind::Demand {
            return Some(n.resource().id.clone());
        }
        current = n.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockDaemon;
    use requestor_types::{DemandData, Properties};

    fn session() -> (Arc<MockDaemon>, Session) {
        let mock = Arc::new(MockDaemon::with_providers(1));
        let session = Session::new(mock.clone(), SessionConfig::default());
        (mock, session)
    }

    #[tokio::test]
    async fn test_resources_are_singletons() {
        let (_, session) = session();
        let mut sub = session.bus().subscribe(|e| matches!(e, RequestorEvent::NewResource { .. }));

        let a = session.get_or_create(ResourceKind::Agreement, "a1".into(), None, None);
        let b = session.get_or_create(ResourceKind::Agreement, "a1".into(), None, None);
        assert!(Arc::ptr_eq(&a, &b));

        assert!(sub.recv().await.is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_parent_is_never_reassigned() {
        let (_, session) = session();
        let first = session.get_or_create(ResourceKind::Agreement, "a1".into(), None, None);
        let second = session.get_or_create(ResourceKind::Agreement, "a2".into(), None, None);

        let activity = session.get_or_create(ResourceKind::Activity, "x".into(), Some(&first), None);
        session.get_or_create(ResourceKind::Activity, "x".into(), Some(&second), None);

        assert_eq!(activity.parent_ref(), Some(first.resource()));
        assert_eq!(first.children().len(), 1);
        assert!(second.children().is_empty());
    }

    #[tokio::test]
    async fn test_get_data_is_cached() {
        let (mock, session) = session();
        let demand = DemandData {
            properties: Properties::new(),
            constraints: "()".into(),
        };
        let id = mock.subscribe_demand(&demand).await.unwrap();
        let node = session.get_or_create(ResourceKind::Demand, id, None, None);

        session.get_data(&node, false).await.unwrap();
        session.get_data(&node, false).await.unwrap();
        assert_eq!(mock.calls("get_demand"), 1);

        session.get_data(&node, true).await.unwrap();
        assert_eq!(mock.calls("get_demand"), 2);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let (_, session) = session();
        let err = session.require(ResourceKind::Activity, &"nope".into()).unwrap_err();
        assert!(matches!(err, RequestorError::ResourceNotFound { kind: ResourceKind::Activity, .. }));
        assert!(session.remove(&ResourceRef::new(ResourceKind::Activity, "nope")).is_err());
    }

    #[tokio::test]
    async fn test_remove_keeps_children_registered() {
        let (_, session) = session();
        let mut sub = session.bus().subscribe(|e| matches!(e, RequestorEvent::ResourceClosed { .. }));
        let agreement = session.get_or_create(ResourceKind::Agreement, "a".into(), None, None);
        session.get_or_create(ResourceKind::Activity, "x".into(), Some(&agreement), None);

        session.remove(agreement.resource()).unwrap();
        assert!(session.node(ResourceKind::Agreement, &"a".into()).is_none());
        assert!(session.node(ResourceKind::Activity, &"x".into()).is_some());
        assert!(sub.recv().await.is_some());

        let agreement = session.get_or_create(ResourceKind::Agreement, "b".into(), None, None);
        session.get_or_create(ResourceKind::Activity, "y".into(), Some(&agreement), None);
        session.remove_subtree(agreement.resource()).unwrap();
        assert!(session.node(ResourceKind::Activity, &"y".into()).is_none());
    }
}
