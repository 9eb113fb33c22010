//! Load Balancer (component E): strategy registry, availability
//! filtering, sticky sessions, and group rebalancing.

use super::strategies::{
    GeoLocator, GeographicStrategy, LbStrategy, LeastConnectionsStrategy, RoundRobinStrategy,
    SelectContext, WeightedStrategy,
};
use crate::error::LbError;
use crate::model::{GroupId, Node, NodeId, NodeStatus, UserId};
use crate::repo::{AssignmentRepository, GroupRepository, NodeRepository};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct SelectOptions {
    pub strategy: String,
    pub group_id: Option<GroupId>,
    pub exclude_ids: Vec<NodeId>,
    pub user_ip: Option<IpAddr>,
    pub sticky: bool,
}

pub struct LoadBalancer {
    nodes: Arc<dyn NodeRepository>,
    groups: Arc<dyn GroupRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    strategies: parking_lot::RwLock<HashMap<String, Arc<dyn LbStrategy>>>,
    geo: Option<Arc<dyn GeoLocator>>,
}

impl LoadBalancer {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        groups: Arc<dyn GroupRepository>,
        assignments: Arc<dyn AssignmentRepository>,
        geo: Option<Arc<dyn GeoLocator>>,
    ) -> Self {
        let mut strategies: HashMap<String, Arc<dyn LbStrategy>> = HashMap::new();
        strategies.insert("round-robin".to_string(), Arc::new(RoundRobinStrategy::new()));
        strategies.insert(
            "least-connections".to_string(),
            Arc::new(LeastConnectionsStrategy),
        );
        strategies.insert("weighted".to_string(), Arc::new(WeightedStrategy::new()));
        strategies.insert("geographic".to_string(), Arc::new(GeographicStrategy));

        Self {
            nodes,
            groups,
            assignments,
            strategies: parking_lot::RwLock::new(strategies),
            geo,
        }
    }

    pub fn register_strategy(&self, name: impl Into<String>, strategy: Arc<dyn LbStrategy>) {
        self.strategies.write().insert(name.into(), strategy);
    }

    async fn candidate_pool(&self, opts: &SelectOptions) -> Vec<Node> {
        let base = match opts.group_id {
            Some(group_id) => self.nodes.list_by_group(group_id).await,
            None => self.nodes.list_available().await,
        };
        base.into_iter()
            .filter(|n| n.status == NodeStatus::Online)
            .filter(|n| n.under_capacity())
            .filter(|n| !opts.exclude_ids.contains(&n.id))
            .collect()
    }

    async fn dispatch(&self, candidates: &[Node], opts: &SelectOptions) -> Option<NodeId> {
        let strategies = self.strategies.read();
        let strategy = strategies
            .get(&opts.strategy)
            .or_else(|| strategies.get("round-robin"))
            .cloned()?;
        drop(strategies);

        let ctx = SelectContext {
            user_ip: opts.user_ip,
            geo: self.geo.as_deref(),
        };
        strategy.select(candidates, &ctx).await
    }

    pub async fn select_node(&self, user_id: UserId, opts: &SelectOptions) -> Result<Node, LbError> {
        if opts.sticky {
            if let Some(assignment) = self.assignments.get(user_id).await {
                if let Some(node) = self.nodes.get(assignment.node_id).await {
                    if node.status == NodeStatus::Online && node.under_capacity() {
                        return Ok(node);
                    }
                }
            }
        }

        let candidates = self.candidate_pool(opts).await;
        if candidates.is_empty() {
            return Err(LbError::NoAvailableNodes);
        }

        let chosen_id = self
            .dispatch(&candidates, opts)
            .await
            .ok_or(LbError::NoAvailableNodes)?;
        candidates
            .into_iter()
            .find(|n| n.id == chosen_id)
            .ok_or(LbError::NoAvailableNodes)
    }

    /// Picks up to `n` distinct nodes, disabling sticky and growing the
    /// exclusion set with each pick.
    pub async fn select_nodes(
        &self,
        user_id: UserId,
        n: usize,
        opts: &SelectOptions,
    ) -> Vec<Node> {
        let mut picked = Vec::with_capacity(n);
        let mut opts = opts.clone();
        opts.sticky = false;
        for _ in 0..n {
            match self.select_node(user_id, &opts).await {
                Ok(node) => {
                    opts.exclude_ids.push(node.id);
                    picked.push(node);
                }
                Err(_) => break,
            }
        }
        picked
    }

    pub async fn assign_user(&self, user_id: UserId, node_id: NodeId) -> Result<(), LbError> {
        let mut node = self.nodes.get(node_id).await.ok_or(LbError::NoAvailableNodes)?;
        if node.at_capacity() {
            return Err(LbError::NoAvailableNodes);
        }
        self.assignments.assign(user_id, node_id).await;
        node.current_users += 1;
        let _ = self.nodes.update(node).await;
        Ok(())
    }

    pub async fn unassign_user(&self, user_id: UserId) -> Result<(), LbError> {
        let assignment = self
            .assignments
            .get(user_id)
            .await
            .ok_or(LbError::UserNotAssigned)?;
        self.assignments.unassign(user_id).await;
        if let Some(mut node) = self.nodes.get(assignment.node_id).await {
            node.current_users = node.current_users.saturating_sub(1);
            let _ = self.nodes.update(node).await;
        }
        Ok(())
    }

    pub async fn get_user_node(&self, user_id: UserId) -> Option<Node> {
        let assignment = self.assignments.get(user_id).await?;
        self.nodes.get(assignment.node_id).await
    }

    /// Reassigns every user currently on a node in `group_id` across the
    /// group's online, under-capacity nodes using round-robin.
    pub async fn rebalance(&self, group_id: GroupId) -> Result<usize, LbError> {
        let members = self.groups.members(group_id).await;
        let mut users = Vec::new();
        for node_id in &members {
            for assignment in self.assignments.list_by_node(*node_id).await {
                users.push(assignment.user_id);
            }
        }

        let targets: Vec<Node> = self
            .nodes
            .list_by_group(group_id)
            .await
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online && n.under_capacity())
            .collect();
        if targets.is_empty() {
            return Err(LbError::NoAvailableNodes);
        }

        for (i, user_id) in users.iter().enumerate() {
            let target = &targets[i % targets.len()];
            let _ = self.unassign_user(*user_id).await;
            self.assign_user(*user_id, target.id).await?;
        }
        Ok(users.len())
    }
}
