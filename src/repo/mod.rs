//! Abstract repository interfaces (component A). Everything above this
//! layer talks to traits only, so a durable backend can replace the
//! in-memory implementations here without touching subsystem logic.

mod memory;

pub use memory::{
    InMemoryAssignmentRepository, InMemoryAuthFailureRepository, InMemoryGroupRepository,
    InMemoryHealthRepository, InMemoryNodeRepository, InMemoryTrafficRepository,
};

use crate::error::{GroupError, NodeError};
use crate::model::{
    AuthFailureRecord, GroupId, HealthCheck, Node, NodeGroup, NodeId, TrafficRecord,
    UserAssignment, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn create(&self, node: Node) -> Result<Node, NodeError>;
    async fn get(&self, id: NodeId) -> Option<Node>;
    async fn get_by_token(&self, token: &str) -> Option<Node>;
    async fn get_by_name(&self, name: &str) -> Option<Node>;
    async fn find_by_address_port(&self, address: &str, port: u16) -> Option<Node>;
    async fn update(&self, node: Node) -> Result<(), NodeError>;
    async fn delete(&self, id: NodeId) -> Result<(), NodeError>;
    async fn list(&self) -> Vec<Node>;
    async fn list_by_group(&self, group_id: GroupId) -> Vec<Node>;
    /// Nodes currently eligible to serve traffic: `status == online`.
    async fn list_available(&self) -> Vec<Node>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create(&self, group: NodeGroup) -> Result<NodeGroup, GroupError>;
    async fn get(&self, id: GroupId) -> Option<NodeGroup>;
    async fn update(&self, group: NodeGroup) -> Result<(), GroupError>;
    async fn delete(&self, id: GroupId) -> Result<(), GroupError>;
    async fn list(&self) -> Vec<NodeGroup>;
    async fn add_member(&self, group_id: GroupId, node_id: NodeId);
    async fn remove_member(&self, group_id: GroupId, node_id: NodeId);
    async fn members(&self, group_id: GroupId) -> Vec<NodeId>;
    async fn groups_for_node(&self, node_id: NodeId) -> Vec<GroupId>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn get(&self, user_id: UserId) -> Option<UserAssignment>;
    async fn assign(&self, user_id: UserId, node_id: NodeId) -> UserAssignment;
    async fn unassign(&self, user_id: UserId);
    async fn list_by_node(&self, node_id: NodeId) -> Vec<UserAssignment>;
    async fn list_all(&self) -> Vec<UserAssignment>;
}

#[async_trait]
pub trait HealthRepository: Send + Sync {
    async fn record(&self, check: HealthCheck);
    async fn list_by_node(&self, node_id: NodeId) -> Vec<HealthCheck>;
    /// Deletes records older than `retention_days`. Returns the count removed.
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> usize;
}

#[async_trait]
pub trait TrafficRepository: Send + Sync {
    async fn record(&self, rec: TrafficRecord);
    async fn record_batch(&self, recs: Vec<TrafficRecord>);
    /// All records whose `recorded_at` falls in `[start, end]`.
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TrafficRecord>;
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> usize;
}

/// Sliding-window per-IP auth-failure counter, kept behind the same
/// pluggable-repository discipline as every other entity in this layer.
#[async_trait]
pub trait AuthFailureRepository: Send + Sync {
    /// The live record for `ip`, or `None` if absent or its window expired.
    async fn get_failures(&self, ip: IpAddr) -> Option<AuthFailureRecord>;
    /// Increments the failure count for `ip`, starting a fresh window if
    /// the previous record (if any) has expired.
    async fn record_failure(&self, ip: IpAddr) -> AuthFailureRecord;
    async fn clear_failures(&self, ip: IpAddr);
    /// True iff a record exists with a `blocked_until` still in the future.
    async fn is_blocked(&self, ip: IpAddr) -> (bool, Option<DateTime<Utc>>);
    async fn block_ip(&self, ip: IpAddr, until: DateTime<Utc>);
    /// Removes records whose window and block (if any) have both expired.
    async fn cleanup(&self) -> usize;
}
