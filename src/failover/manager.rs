//! Failover Manager (component F): migrates a node's users to other
//! healthy nodes under a concurrency cap, preferring same-group targets.

use crate::error::FailoverError;
use crate::health::checker::FailoverTrigger;
use crate::model::{GroupId, NodeId, NodeStatus, UserId};
use crate::node::service::DeleteLock;
use crate::notify::{NodeStatusChange, Notifier};
use crate::repo::{AssignmentRepository, GroupRepository, NodeRepository};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct FailoverConfig {
    pub max_concurrent_migrations: usize,
    pub migration_timeout: Duration,
    pub prefer_same_group: bool,
    pub allow_cross_group_failover: bool,
}

#[derive(Debug, Clone)]
pub struct FailoverEvent {
    pub node_id: NodeId,
    pub affected: usize,
    pub migrated: usize,
    pub failed_users: Vec<UserId>,
    pub targets: Vec<NodeId>,
    pub cross_group_used: bool,
}

pub struct FailoverManager {
    nodes: Arc<dyn NodeRepository>,
    groups: Arc<dyn GroupRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    notifier: Arc<dyn Notifier>,
    config: FailoverConfig,
    in_progress: RwLock<HashSet<NodeId>>,
    current_migrations: AtomicUsize,
}

impl FailoverManager {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        groups: Arc<dyn GroupRepository>,
        assignments: Arc<dyn AssignmentRepository>,
        notifier: Arc<dyn Notifier>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            nodes,
            groups,
            assignments,
            notifier,
            config,
            in_progress: RwLock::new(HashSet::new()),
            current_migrations: AtomicUsize::new(0),
        }
    }

    /// Claims the per-node in-progress flag. Returns `false` if another
    /// failover (or a racing `NodeService::delete`) already holds it.
    pub fn try_claim(&self, node_id: NodeId) -> bool {
        self.in_progress.write().insert(node_id)
    }

    pub fn release_claim(&self, node_id: NodeId) {
        self.in_progress.write().remove(&node_id);
    }

    /// CAS-based slot acquisition against `max_concurrent_migrations`.
    pub fn try_acquire_migration_slot(&self) -> bool {
        loop {
            let current = self.current_migrations.load(Ordering::SeqCst);
            if current >= self.config.max_concurrent_migrations {
                return false;
            }
            if self
                .current_migrations
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_migration_slot(&self) {
        self.current_migrations.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight_migrations(&self) -> usize {
        self.current_migrations.load(Ordering::SeqCst)
    }

    /// Polls for a free slot until one is acquired or `cancel` fires.
    pub async fn wait_for_migration_slot(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.try_acquire_migration_slot() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    pub async fn trigger_failover(&self, node_id: NodeId) -> Result<FailoverEvent, FailoverError> {
        self.run_failover(node_id, false).await
    }

    pub async fn trigger_cross_group_failover(
        &self,
        node_id: NodeId,
    ) -> Result<FailoverEvent, FailoverError> {
        self.run_failover(node_id, true).await
    }

    async fn run_failover(
        &self,
        node_id: NodeId,
        skip_same_group: bool,
    ) -> Result<FailoverEvent, FailoverError> {
        if !self.try_claim(node_id) {
            return Err(FailoverError::FailoverInProgress);
        }
        let result = self.run_failover_inner(node_id, skip_same_group).await;
        self.release_claim(node_id);
        result
    }

    async fn run_failover_inner(
        &self,
        node_id: NodeId,
        skip_same_group: bool,
    ) -> Result<FailoverEvent, FailoverError> {
        let node = self.nodes.get(node_id).await.ok_or(FailoverError::NodeNotFound)?;
        if node.status != NodeStatus::Unhealthy {
            return Err(FailoverError::NodeNotUnhealthy);
        }

        let assignments = self.assignments.list_by_node(node_id).await;
        if assignments.is_empty() {
            return Ok(FailoverEvent {
                node_id,
                affected: 0,
                migrated: 0,
                failed_users: Vec::new(),
                targets: Vec::new(),
                cross_group_used: false,
            });
        }
        let users: Vec<UserId> = assignments.iter().map(|a| a.user_id).collect();

        let (targets, cross_group_used) = self.select_targets(node_id, skip_same_group).await?;
        if targets.is_empty() {
            return Err(FailoverError::NoTargetNodes);
        }

        let mut failed_users = Vec::new();
        let mut migrated = 0usize;
        for (i, user_id) in users.iter().enumerate() {
            let target = targets[i % targets.len()];
            if !self.try_acquire_migration_slot() {
                failed_users.push(*user_id);
                continue;
            }
            let outcome = tokio::time::timeout(
                self.config.migration_timeout,
                self.migrate_user(*user_id, node_id, target),
            )
            .await;
            self.release_migration_slot();

            match outcome {
                Ok(Ok(())) => migrated += 1,
                _ => failed_users.push(*user_id),
            }
        }

        let event = FailoverEvent {
            node_id,
            affected: users.len(),
            migrated,
            failed_users,
            targets,
            cross_group_used,
        };

        self.notifier
            .notify_node_status_change(NodeStatusChange {
                node_id,
                node_name: node.name.clone(),
                old_status: NodeStatus::Unhealthy,
                new_status: NodeStatus::Unhealthy,
                reason: format!(
                    "failover: {} migrated, {} failed",
                    event.migrated,
                    event.failed_users.len()
                ),
                timestamp: Utc::now(),
            })
            .await;

        Ok(event)
    }

    async fn migrate_user(&self, user_id: UserId, source: NodeId, target: NodeId) -> Result<(), FailoverError> {
        self.assignments.unassign(user_id).await;
        self.assignments.assign(user_id, target).await;
        if let Some(mut source_node) = self.nodes.get(source).await {
            source_node.current_users = source_node.current_users.saturating_sub(1);
            let _ = self.nodes.update(source_node).await;
        }
        if let Some(mut target_node) = self.nodes.get(target).await {
            target_node.current_users += 1;
            let _ = self.nodes.update(target_node).await;
        }
        Ok(())
    }

    async fn select_targets(
        &self,
        source_id: NodeId,
        skip_same_group: bool,
    ) -> Result<(Vec<NodeId>, bool), FailoverError> {
        if !skip_same_group && self.config.prefer_same_group {
            let groups = self.groups.groups_for_node(source_id).await;
            let mut same_group = Vec::new();
            for group_id in groups {
                for node in self.nodes.list_by_group(group_id).await {
                    if node.id == source_id {
                        continue;
                    }
                    if node.status == NodeStatus::Online && node.under_capacity() {
                        same_group.push(node.id);
                    }
                }
            }
            same_group.sort_unstable();
            same_group.dedup();
            if !same_group.is_empty() {
                return Ok((same_group, false));
            }
        }

        if self.config.allow_cross_group_failover {
            let all: Vec<NodeId> = self
                .nodes
                .list_available()
                .await
                .into_iter()
                .filter(|n| n.id != source_id && n.under_capacity())
                .map(|n| n.id)
                .collect();
            if !all.is_empty() {
                return Ok((all, true));
            }
        }

        Ok((Vec::new(), false))
    }

    pub async fn group_ids_for(&self, node_id: NodeId) -> Vec<GroupId> {
        self.groups.groups_for_node(node_id).await
    }
}

impl DeleteLock for FailoverManager {
    fn try_claim(&self, node_id: NodeId) -> bool {
        FailoverManager::try_claim(self, node_id)
    }

    fn release_claim(&self, node_id: NodeId) {
        FailoverManager::release_claim(self, node_id)
    }
}

#[async_trait]
impl FailoverTrigger for FailoverManager {
    async fn on_node_unhealthy(&self, node_id: NodeId) {
        match self.trigger_failover(node_id).await {
            Ok(event) => {
                tracing::info!(
                    node_id,
                    migrated = event.migrated,
                    failed = event.failed_users.len(),
                    "failover completed"
                );
            }
            Err(e) => {
                tracing::warn!(node_id, error = %e, "failover did not run");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, SyncStatus};
    use crate::notify::LoggingNotifier;
    use crate::repo::{InMemoryAssignmentRepository, InMemoryGroupRepository, InMemoryNodeRepository};

    fn raw_node(name: &str, status: NodeStatus) -> Node {
        Node {
            id: 0,
            name: name.into(),
            address: "1.2.3.4".into(),
            port: 1,
            panel_url: None,
            token: format!("tok-{name}"),
            status,
            last_seen_at: None,
            sync_status: SyncStatus::Synced,
            synced_at: None,
            weight: 1,
            max_users: 0,
            current_users: 0,
            ip_whitelist: vec![],
            tags: vec![],
            region: None,
            group_id: None,
            protocols: vec![],
            tls_enabled: false,
            tls_domain: None,
            alert_cpu_threshold: 90,
            alert_mem_threshold: 90,
            latitude: None,
            longitude: None,
        }
    }

    fn config() -> FailoverConfig {
        FailoverConfig {
            max_concurrent_migrations: 10,
            migration_timeout: Duration::from_secs(5),
            prefer_same_group: true,
            allow_cross_group_failover: true,
        }
    }

    async fn setup() -> (
        FailoverManager,
        Arc<InMemoryNodeRepository>,
        Arc<InMemoryAssignmentRepository>,
    ) {
        let nodes = Arc::new(InMemoryNodeRepository::new());
        let groups = Arc::new(InMemoryGroupRepository::new());
        let assignments = Arc::new(InMemoryAssignmentRepository::new());
        let fm = FailoverManager::new(
            nodes.clone(),
            groups,
            assignments.clone(),
            Arc::new(LoggingNotifier),
            config(),
        );
        (fm, nodes, assignments)
    }

    #[tokio::test]
    async fn failover_migrates_all_users_round_robin() {
        let (fm, nodes, assignments) = setup().await;
        let n1 = nodes.create(raw_node("n1", NodeStatus::Unhealthy)).await.unwrap();
        let n2 = nodes.create(raw_node("n2", NodeStatus::Online)).await.unwrap();
        let n3 = nodes.create(raw_node("n3", NodeStatus::Online)).await.unwrap();

        for uid in [1, 2, 3, 4] {
            assignments.assign(uid, n1.id).await;
        }

        let event = fm.trigger_failover(n1.id).await.unwrap();
        assert_eq!(event.affected, 4);
        assert_eq!(event.migrated, 4);
        assert!(event.failed_users.is_empty());

        assert_eq!(assignments.get(1).await.unwrap().node_id, n2.id);
        assert_eq!(assignments.get(2).await.unwrap().node_id, n3.id);
        assert_eq!(assignments.get(3).await.unwrap().node_id, n2.id);
        assert_eq!(assignments.get(4).await.unwrap().node_id, n3.id);

        for uid in [1, 2, 3, 4] {
            assert_ne!(assignments.get(uid).await.unwrap().node_id, n1.id);
        }
    }

    #[tokio::test]
    async fn failover_decrements_source_and_increments_target_current_users() {
        let (fm, nodes, assignments) = setup().await;
        let mut source = raw_node("n1", NodeStatus::Unhealthy);
        source.current_users = 4;
        let n1 = nodes.create(source).await.unwrap();
        let n2 = nodes.create(raw_node("n2", NodeStatus::Online)).await.unwrap();
        let n3 = nodes.create(raw_node("n3", NodeStatus::Online)).await.unwrap();

        for uid in [1, 2, 3, 4] {
            assignments.assign(uid, n1.id).await;
        }

        let event = fm.trigger_failover(n1.id).await.unwrap();
        assert_eq!(event.migrated, 4);

        let n1_after = nodes.get(n1.id).await.unwrap();
        assert_eq!(n1_after.current_users, 0);
        let n2_after = nodes.get(n2.id).await.unwrap();
        let n3_after = nodes.get(n3.id).await.unwrap();
        assert_eq!(n2_after.current_users + n3_after.current_users, 4);
    }

    #[tokio::test]
    async fn requires_unhealthy_status() {
        let (fm, nodes, _) = setup().await;
        let n1 = nodes.create(raw_node("n1", NodeStatus::Online)).await.unwrap();
        let err = fm.trigger_failover(n1.id).await.unwrap_err();
        assert_eq!(err, FailoverError::NodeNotUnhealthy);
    }

    #[tokio::test]
    async fn no_targets_when_all_others_unavailable() {
        let (fm, nodes, assignments) = setup().await;
        let n1 = nodes.create(raw_node("n1", NodeStatus::Unhealthy)).await.unwrap();
        assignments.assign(1, n1.id).await;
        let err = fm.trigger_failover(n1.id).await.unwrap_err();
        assert_eq!(err, FailoverError::NoTargetNodes);
    }

    #[tokio::test]
    async fn concurrent_failover_is_serialized_by_flag() {
        let (fm, nodes, _assignments) = setup().await;
        let n1 = nodes.create(raw_node("n1", NodeStatus::Unhealthy)).await.unwrap();
        assert!(fm.try_claim(n1.id));
        assert!(!fm.try_claim(n1.id));
        fm.release_claim(n1.id);
        assert!(fm.try_claim(n1.id));
    }

    #[tokio::test]
    async fn migration_slot_respects_cap() {
        let (fm, _nodes, _assignments) = setup().await;
        for _ in 0..10 {
            assert!(fm.try_acquire_migration_slot());
        }
        assert!(!fm.try_acquire_migration_slot());
        fm.release_migration_slot();
        assert!(fm.try_acquire_migration_slot());
    }
}
