//! Resource tree nodes
//!
//! A [`ResourceNode`] is the shared representation of every marketplace
//! entity: a weak link to its parent, the ordered set of owned children, the
//! last remote snapshot and the local lifecycle state. Readers never block;
//! refreshes of one node serialize on that node's lock only.

use crate::error::RequestorResult;
use chrono::{DateTime, Utc};
use futures::Stream;
use requestor_types::{LifecycleState, ResourceData, ResourceRef};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, MutexGuard};

/// Children of a node plus whether more can still arrive
#[derive(Clone, Default)]
pub struct ChildSet {
    pub nodes: Vec<Arc<ResourceNode>>,
    /// Set once no collector will add further children
    pub closed: bool,
}

pub struct ResourceNode {
    resource: ResourceRef,
    parent: Option<Weak<ResourceNode>>,
    parent_ref: Option<ResourceRef>,
    children: watch::Sender<ChildSet>,
    data: watch::Sender<Option<Arc<ResourceData>>>,
    state: watch::Sender<LifecycleState>,
    lock: Mutex<()>,
    generation: AtomicU64,
    running_batches: AtomicUsize,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("resource", &self.resource)
            .field("parent", &self.parent_ref)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ResourceNode {
    pub(crate) fn new(
        resource: ResourceRef,
        parent: Option<&Arc<ResourceNode>>,
        state: LifecycleState,
        data: Option<ResourceData>,
    ) -> Self {
        Self {
            resource,
            parent: parent.map(Arc::downgrade),
            parent_ref: parent.map(|p| p.resource.clone()),
            children: watch::channel(ChildSet::default()).0,
            data: watch::channel(data.map(Arc::new)).0,
            state: watch::channel(state).0,
            lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            running_batches: AtomicUsize::new(0),
            created_at: Utc::now(),
        }
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    /// Parent node, if it is still alive
    pub fn parent(&self) -> Option<Arc<ResourceNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Parent reference, kept even when the parent node has been dropped
    pub fn parent_ref(&self) -> Option<&ResourceRef> {
        self.parent_ref.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // Children

    /// Link a child. Returns `false` if it was already linked.
    pub(crate) fn add_child(&self, child: Arc<ResourceNode>) -> bool {
        self.children.send_if_modified(|set| {
            if set.nodes.iter().any(|c| c.resource == child.resource) {
                false
            } else {
                set.nodes.push(child.clone());
                true
            }
        })
    }

    pub(crate) fn remove_child(&self, child: &ResourceRef) -> bool {
        self.children.send_if_modified(|set| {
            let before = set.nodes.len();
            set.nodes.retain(|c| &c.resource != child);
            set.nodes.len() != before
        })
    }

    /// Mark the children sequence as complete; iterators end once drained.
    pub fn close_children(&self) {
        self.children.send_if_modified(|set| !std::mem::replace(&mut set.closed, true));
    }

    pub fn children_closed(&self) -> bool {
        self.children.borrow().closed
    }

    pub fn children(&self) -> Vec<Arc<ResourceNode>> {
        self.children.borrow().nodes.clone()
    }

    pub fn children_watch(&self) -> watch::Receiver<ChildSet> {
        self.children.subscribe()
    }

    /// Every child, existing and future, each exactly once.
    ///
    /// The stream ends once the children sequence is closed and drained.
    /// Calling it again restarts from the first child.
    pub fn children_stream(&self) -> impl Stream<Item = Arc<ResourceNode>> + Send + 'static {
        let rx = self.children.subscribe();
        futures::stream::unfold((rx, HashSet::new()), |(mut rx, mut seen)| async move {
            loop {
                let (next, closed) = {
                    let set = rx.borrow_and_update();
                    let next = set
                        .nodes
                        .iter()
                        .find(|c| !seen.contains(&c.resource))
                        .cloned();
                    (next, set.closed)
                };
                if let Some(child) = next {
                    seen.insert(child.resource.clone());
                    return Some((child, (rx, seen)));
                }
                if closed || rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    // Data

    pub fn cached_data(&self) -> Option<Arc<ResourceData>> {
        self.data.borrow().clone()
    }

    pub fn data_watch(&self) -> watch::Receiver<Option<Arc<ResourceData>>> {
        self.data.subscribe()
    }

    /// Replace the cached snapshot. Returns whether it changed.
    pub(crate) fn set_data(&self, data: Arc<ResourceData>) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.data.send_if_modified(|current| {
            if current.as_deref() == Some(&*data) {
                false
            } else {
                *current = Some(data.clone());
                true
            }
        })
    }

    /// Edit the cached snapshot in place.
    pub(crate) fn modify_data<F>(&self, edit: F) -> bool
    where
        F: FnOnce(&mut ResourceData) -> bool,
    {
        self.data.send_if_modified(|current| match current {
            Some(data) => edit(Arc::make_mut(data)),
            None => false,
        })
    }

    /// Cached snapshot, refreshed through `fetch` when forced or absent.
    ///
    /// Concurrent refreshes coalesce: callers that queued behind an in-flight
    /// refresh reuse its result instead of issuing their own read. Returns
    /// the snapshot and whether it changed.
    pub(crate) async fn get_data_with<F, Fut>(
        &self,
        force: bool,
        fetch: F,
    ) -> RequestorResult<(Arc<ResourceData>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RequestorResult<ResourceData>>,
    {
        let observed = self.generation.load(Ordering::SeqCst);
        if !force {
            if let Some(data) = self.cached_data() {
                return Ok((data, false));
            }
        }

        let _guard = self.lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed {
            if let Some(data) = self.cached_data() {
                return Ok((data, false));
            }
        }

        let data = Arc::new(fetch().await?);
        let changed = self.set_data(data.clone());
        Ok((data, changed))
    }

    /// Per-node lock serializing mutations of this node only.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    // State

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Compare-and-set on the lifecycle state. `next` decides the new state
    /// from the current one, or refuses with `None`.
    pub(crate) fn update_state<F>(&self, next: F) -> Option<(LifecycleState, LifecycleState)>
    where
        F: FnOnce(LifecycleState) -> Option<LifecycleState>,
    {
        let mut change = None;
        self.state.send_if_modified(|current| match next(*current) {
            Some(to) if to != *current => {
                change = Some((*current, to));
                *current = to;
                true
            }
            _ => false,
        });
        change
    }

    // Batches

    pub(crate) fn begin_batch(&self) -> usize {
        self.running_batches.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn end_batch(&self) -> usize {
        let previous = self
            .running_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn running_batches(&self) -> usize {
        self.running_batches.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use requestor_types::{DemandData, ProposalState, Properties, ResourceKind};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{timeout, Duration};

    fn node(kind: ResourceKind, id: &str, parent: Option<&Arc<ResourceNode>>) -> Arc<ResourceNode> {
        Arc::new(ResourceNode::new(
            ResourceRef::new(kind, id),
            parent,
            kind.initial_state(),
            None,
        ))
    }

    fn demand_data(constraints: &str) -> ResourceData {
        ResourceData::Demand(DemandData {
            properties: Properties::new(),
            constraints: constraints.into(),
        })
    }

    #[test]
    fn test_parent_link_is_weak() {
        let parent = node(ResourceKind::Demand, "d", None);
        let child = node(ResourceKind::Proposal, "p", Some(&parent));
        assert!(parent.add_child(child.clone()));
        assert!(!parent.add_child(child.clone()));
        assert_eq!(child.parent().map(|p| p.resource().clone()), Some(parent.resource().clone()));

        drop(parent);
        assert!(child.parent().is_none());
        assert_eq!(child.parent_ref().map(|r| r.kind), Some(ResourceKind::Demand));
    }

    #[tokio::test]
    async fn test_children_stream_is_restartable() {
        let parent = node(ResourceKind::Demand, "d", None);
        parent.add_child(node(ResourceKind::Proposal, "p1", Some(&parent)));

        let mut stream = Box::pin(parent.children_stream());
        let first = stream.next().await.unwrap();
        assert_eq!(first.resource().id.as_str(), "p1");

        let adder = parent.clone();
        tokio::spawn(async move {
            adder.add_child(node(ResourceKind::Proposal, "p2", Some(&adder)));
            adder.close_children();
        });
        let second = timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap();
        assert_eq!(second.resource().id.as_str(), "p2");
        assert!(stream.next().await.is_none());

        let again: Vec<_> = parent.children_stream().collect().await;
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_cached_read_skips_fetch() {
        let n = node(ResourceKind::Demand, "d", None);
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let (data, _) = n
                .get_data_with(false, || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(demand_data("()"))
                })
                .await
                .unwrap();
            assert_eq!(*data, demand_data("()"));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let (_, changed) = n
            .get_data_with(true, || async { Ok(demand_data("(x=1)")) })
            .await
            .unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn test_concurrent_forced_refreshes_coalesce() {
        let n = node(ResourceKind::Demand, "d", None);
        let fetches = Arc::new(AtomicUsize::new(0));

        let guard = n.lock().await;
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let n = n.clone();
            let fetches = fetches.clone();
            waiters.push(tokio::spawn(async move {
                n.get_data_with(true, || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(demand_data("()"))
                })
                .await
                .map(|_| ())
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_state_is_compare_and_set() {
        let n = node(ResourceKind::Proposal, "p", None);
        let change = n.update_state(|s| match s.proposal() {
            Some(ProposalState::Initial) => Some(LifecycleState::Proposal(ProposalState::Rejected)),
            _ => None,
        });
        assert!(change.is_some());

        let again = n.update_state(|s| match s.proposal() {
            Some(ProposalState::Initial) => Some(LifecycleState::Proposal(ProposalState::Rejected)),
            _ => None,
        });
        assert!(again.is_none());
    }

    #[test]
    fn test_batch_counter_never_underflows() {
        let n = node(ResourceKind::Activity, "a", None);
        assert_eq!(n.begin_batch(), 1);
        assert_eq!(n.end_batch(), 0);
        assert_eq!(n.end_batch(), 0);
    }
}
