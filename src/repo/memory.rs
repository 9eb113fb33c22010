//! In-memory repository implementations. Used for tests and as the
//! default backend; a durable implementation can be swapped in behind
//! the same traits with no change to subsystem code.

use super::{
    AssignmentRepository, AuthFailureRepository, GroupRepository, HealthRepository,
    NodeRepository, TrafficRepository,
};
use crate::error::{GroupError, NodeError};
use crate::model::{
    AuthFailureRecord, GroupId, HealthCheck, Node, NodeGroup, NodeId, NodeStatus, TrafficRecord,
    UserAssignment, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

/// Node store keeps every uniqueness invariant (name, address:port, token)
/// behind one write lock so inserts/updates can check-and-commit atomically.
struct NodeInner {
    by_id: HashMap<NodeId, Node>,
    name_index: HashMap<String, NodeId>,
    addr_index: HashMap<(String, u16), NodeId>,
    token_index: HashMap<String, NodeId>,
    next_id: NodeId,
}

pub struct InMemoryNodeRepository {
    inner: RwLock<NodeInner>,
}

impl Default for InMemoryNodeRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(NodeInner {
                by_id: HashMap::new(),
                name_index: HashMap::new(),
                addr_index: HashMap::new(),
                token_index: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn dedupe_check(
        inner: &NodeInner,
        node: &Node,
        exclude: Option<NodeId>,
    ) -> Result<(), NodeError> {
        let name_key = node.name.to_lowercase();
        if let Some(&id) = inner.name_index.get(&name_key) {
            if Some(id) != exclude {
                return Err(NodeError::DuplicateNode(format!(
                    "name '{}' already in use",
                    node.name
                )));
            }
        }
        let addr_key = (node.address.to_lowercase(), node.port);
        if let Some(&id) = inner.addr_index.get(&addr_key) {
            if Some(id) != exclude {
                return Err(NodeError::DuplicateNode(format!(
                    "address {}:{} already in use",
                    node.address, node.port
                )));
            }
        }
        if !node.token.is_empty() {
            if let Some(&id) = inner.token_index.get(&node.token) {
                if Some(id) != exclude {
                    return Err(NodeError::DuplicateNode("token collision".to_string()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn create(&self, mut node: Node) -> Result<Node, NodeError> {
        let mut inner = self.inner.write();
        Self::dedupe_check(&inner, &node, None)?;
        node.id = inner.next_id;
        inner.next_id += 1;
        inner.name_index.insert(node.name.to_lowercase(), node.id);
        inner
            .addr_index
            .insert((node.address.to_lowercase(), node.port), node.id);
        if !node.token.is_empty() {
            inner.token_index.insert(node.token.clone(), node.id);
        }
        inner.by_id.insert(node.id, node.clone());
        Ok(node)
    }

    async fn get(&self, id: NodeId) -> Option<Node> {
        self.inner.read().by_id.get(&id).cloned()
    }

    async fn get_by_token(&self, token: &str) -> Option<Node> {
        if token.is_empty() {
            return None;
        }
        let inner = self.inner.read();
        inner
            .token_index
            .get(token)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    async fn get_by_name(&self, name: &str) -> Option<Node> {
        let key = name.to_lowercase();
        let inner = self.inner.read();
        inner
            .name_index
            .get(&key)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    async fn find_by_address_port(&self, address: &str, port: u16) -> Option<Node> {
        let key = (address.to_lowercase(), port);
        let inner = self.inner.read();
        inner
            .addr_index
            .get(&key)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    async fn update(&self, node: Node) -> Result<(), NodeError> {
        let mut inner = self.inner.write();
        if !inner.by_id.contains_key(&node.id) {
            return Err(NodeError::NodeNotFound);
        }
        Self::dedupe_check(&inner, &node, Some(node.id))?;

        let old = inner.by_id.get(&node.id).cloned().unwrap();
        inner.name_index.remove(&old.name.to_lowercase());
        inner.addr_index.remove(&(old.address.to_lowercase(), old.port));
        if !old.token.is_empty() {
            inner.token_index.remove(&old.token);
        }

        inner.name_index.insert(node.name.to_lowercase(), node.id);
        inner
            .addr_index
            .insert((node.address.to_lowercase(), node.port), node.id);
        if !node.token.is_empty() {
            inner.token_index.insert(node.token.clone(), node.id);
        }
        inner.by_id.insert(node.id, node);
        Ok(())
    }

    async fn delete(&self, id: NodeId) -> Result<(), NodeError> {
        let mut inner = self.inner.write();
        let Some(node) = inner.by_id.remove(&id) else {
            return Err(NodeError::NodeNotFound);
        };
        inner.name_index.remove(&node.name.to_lowercase());
        inner.addr_index.remove(&(node.address.to_lowercase(), node.port));
        if !node.token.is_empty() {
            inner.token_index.remove(&node.token);
        }
        Ok(())
    }

    async fn list(&self) -> Vec<Node> {
        self.inner.read().by_id.values().cloned().collect()
    }

    async fn list_by_group(&self, group_id: GroupId) -> Vec<Node> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|n| n.group_id == Some(group_id))
            .cloned()
            .collect()
    }

    async fn list_available(&self) -> Vec<Node> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .cloned()
            .collect()
    }
}

/// Group store: groups plus an N:M junction table, guarded by one lock
/// since membership edits touch two sides of the relation at once.
struct GroupInner {
    groups: HashMap<GroupId, NodeGroup>,
    memberships: HashSet<(GroupId, NodeId)>,
    next_id: GroupId,
}

pub struct InMemoryGroupRepository {
    inner: RwLock<GroupInner>,
}

impl Default for InMemoryGroupRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGroupRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GroupInner {
                groups: HashMap::new(),
                memberships: HashSet::new(),
                next_id: 1,
            }),
        }
    }
}

#[async_trait]
impl GroupRepository for InMemoryGroupRepository {
    async fn create(&self, mut group: NodeGroup) -> Result<NodeGroup, GroupError> {
        let mut inner = self.inner.write();
        group.id = inner.next_id;
        inner.next_id += 1;
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn get(&self, id: GroupId) -> Option<NodeGroup> {
        self.inner.read().groups.get(&id).cloned()
    }

    async fn update(&self, group: NodeGroup) -> Result<(), GroupError> {
        let mut inner = self.inner.write();
        if !inner.groups.contains_key(&group.id) {
            return Err(GroupError::GroupNotFound);
        }
        inner.groups.insert(group.id, group);
        Ok(())
    }

    async fn delete(&self, id: GroupId) -> Result<(), GroupError> {
        let mut inner = self.inner.write();
        if inner.groups.remove(&id).is_none() {
            return Err(GroupError::GroupNotFound);
        }
        inner.memberships.retain(|(g, _)| *g != id);
        Ok(())
    }

    async fn list(&self) -> Vec<NodeGroup> {
        self.inner.read().groups.values().cloned().collect()
    }

    async fn add_member(&self, group_id: GroupId, node_id: NodeId) {
        self.inner.write().memberships.insert((group_id, node_id));
    }

    async fn remove_member(&self, group_id: GroupId, node_id: NodeId) {
        self.inner
            .write()
            .memberships
            .remove(&(group_id, node_id));
    }

    async fn members(&self, group_id: GroupId) -> Vec<NodeId> {
        self.inner
            .read()
            .memberships
            .iter()
            .filter(|(g, _)| *g == group_id)
            .map(|(_, n)| *n)
            .collect()
    }

    async fn groups_for_node(&self, node_id: NodeId) -> Vec<GroupId> {
        self.inner
            .read()
            .memberships
            .iter()
            .filter(|(_, n)| *n == node_id)
            .map(|(g, _)| *g)
            .collect()
    }
}

/// Assignment store: one entry per user, keyed for O(1) lookup/replace.
pub struct InMemoryAssignmentRepository {
    assignments: DashMap<UserId, UserAssignment>,
}

impl Default for InMemoryAssignmentRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAssignmentRepository {
    pub fn new() -> Self {
        Self {
            assignments: DashMap::new(),
        }
    }
}

#[async_trait]
impl AssignmentRepository for InMemoryAssignmentRepository {
    async fn get(&self, user_id: UserId) -> Option<UserAssignment> {
        self.assignments.get(&user_id).map(|r| r.clone())
    }

    async fn assign(&self, user_id: UserId, node_id: NodeId) -> UserAssignment {
        let assignment = UserAssignment {
            user_id,
            node_id,
            assigned_at: Utc::now(),
        };
        self.assignments.insert(user_id, assignment.clone());
        assignment
    }

    async fn unassign(&self, user_id: UserId) {
        self.assignments.remove(&user_id);
    }

    async fn list_by_node(&self, node_id: NodeId) -> Vec<UserAssignment> {
        self.assignments
            .iter()
            .filter(|e| e.node_id == node_id)
            .map(|e| e.clone())
            .collect()
    }

    async fn list_all(&self) -> Vec<UserAssignment> {
        self.assignments.iter().map(|e| e.clone()).collect()
    }
}

/// Health-check record store, append-only with periodic GC.
pub struct InMemoryHealthRepository {
    records: RwLock<Vec<HealthCheck>>,
}

impl Default for InMemoryHealthRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHealthRepository {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HealthRepository for InMemoryHealthRepository {
    async fn record(&self, check: HealthCheck) {
        self.records.write().push(check);
    }

    async fn list_by_node(&self, node_id: NodeId) -> Vec<HealthCheck> {
        self.records
            .read()
            .iter()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect()
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|c| c.checked_at >= cutoff);
        before - records.len()
    }
}

/// Traffic record store, append-only with range queries for aggregation.
pub struct InMemoryTrafficRepository {
    records: RwLock<Vec<TrafficRecord>>,
}

impl Default for InMemoryTrafficRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTrafficRepository {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TrafficRepository for InMemoryTrafficRepository {
    async fn record(&self, rec: TrafficRecord) {
        self.records.write().push(rec);
    }

    async fn record_batch(&self, recs: Vec<TrafficRecord>) {
        self.records.write().extend(recs);
    }

    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TrafficRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.recorded_at >= start && r.recorded_at <= end)
            .cloned()
            .collect()
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        before - records.len()
    }
}

pub struct InMemoryAuthFailureRepository {
    failures: RwLock<HashMap<IpAddr, AuthFailureRecord>>,
    window: Duration,
}

impl InMemoryAuthFailureRepository {
    pub fn new(window: Duration) -> Self {
        Self {
            failures: RwLock::new(HashMap::new()),
            window,
        }
    }

    fn is_live(&self, record: &AuthFailureRecord, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        now - record.first_attempt_at <= window
    }
}

#[async_trait]
impl AuthFailureRepository for InMemoryAuthFailureRepository {
    async fn get_failures(&self, ip: IpAddr) -> Option<AuthFailureRecord> {
        let now = Utc::now();
        let failures = self.failures.read();
        failures.get(&ip).filter(|r| self.is_live(r, now)).cloned()
    }

    async fn record_failure(&self, ip: IpAddr) -> AuthFailureRecord {
        let now = Utc::now();
        let mut failures = self.failures.write();
        let live = failures.get(&ip).map(|r| self.is_live(r, now)).unwrap_or(false);
        if live {
            let record = failures.get_mut(&ip).unwrap();
            record.attempts += 1;
            record.clone()
        } else {
            let record = AuthFailureRecord {
                ip,
                attempts: 1,
                first_attempt_at: now,
                blocked_until: None,
            };
            failures.insert(ip, record.clone());
            record
        }
    }

    async fn clear_failures(&self, ip: IpAddr) {
        self.failures.write().remove(&ip);
    }

    async fn is_blocked(&self, ip: IpAddr) -> (bool, Option<DateTime<Utc>>) {
        let now = Utc::now();
        let failures = self.failures.read();
        match failures.get(&ip).and_then(|r| r.blocked_until) {
            Some(until) if until > now => (true, Some(until)),
            _ => (false, None),
        }
    }

    async fn block_ip(&self, ip: IpAddr, until: DateTime<Utc>) {
        let mut failures = self.failures.write();
        failures
            .entry(ip)
            .and_modify(|r| r.blocked_until = Some(until))
            .or_insert(AuthFailureRecord {
                ip,
                attempts: 0,
                first_attempt_at: Utc::now(),
                blocked_until: Some(until),
            });
    }

    async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut failures = self.failures.write();
        let before = failures.len();
        failures.retain(|_, r| {
            let window_live = self.is_live(r, now);
            let blocked_live = r.blocked_until.map(|u| u > now).unwrap_or(false);
            window_live || blocked_live
        });
        before - failures.len()
    }
}
