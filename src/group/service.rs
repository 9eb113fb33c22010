//! Group Service (component J): group CRUD, N:M node membership, and
//! aggregate stats delegated to the Traffic Service.

use crate::error::GroupError;
use crate::model::{GroupId, NodeGroup, NodeId};
use crate::repo::GroupRepository;
use crate::traffic::{TrafficService, TrafficStats};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct NewGroupParams {
    pub name: String,
    pub region: Option<String>,
    pub strategy: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct UpdateGroupParams {
    pub name: Option<String>,
    pub region: Option<String>,
    pub strategy: Option<String>,
}

pub struct GroupService {
    groups: Arc<dyn GroupRepository>,
    traffic: Arc<TrafficService>,
}

impl GroupService {
    pub fn new(groups: Arc<dyn GroupRepository>, traffic: Arc<TrafficService>) -> Self {
        Self { groups, traffic }
    }

    pub async fn create(&self, params: NewGroupParams) -> Result<NodeGroup, GroupError> {
        if params.name.trim().is_empty() {
            return Err(GroupError::InvalidGroup("name must not be empty".into()));
        }
        let group = NodeGroup {
            id: 0,
            name: params.name,
            region: params.region,
            strategy: params.strategy.unwrap_or_else(|| "round-robin".to_string()),
        };
        self.groups.create(group).await
    }

    pub async fn update(&self, id: GroupId, params: UpdateGroupParams) -> Result<NodeGroup, GroupError> {
        let mut group = self.groups.get(id).await.ok_or(GroupError::GroupNotFound)?;
        if let Some(name) = params.name {
            if name.trim().is_empty() {
                return Err(GroupError::InvalidGroup("name must not be empty".into()));
            }
            group.name = name;
        }
        if params.region.is_some() {
            group.region = params.region;
        }
        if let Some(strategy) = params.strategy {
            group.strategy = strategy;
        }
        self.groups.update(group.clone()).await?;
        Ok(group)
    }

    /// Deletes the group and its memberships. Member nodes are left
    /// untouched and simply lose their group assignment.
    pub async fn delete(&self, id: GroupId) -> Result<(), GroupError> {
        self.groups.delete(id).await
    }

    pub async fn get(&self, id: GroupId) -> Option<NodeGroup> {
        self.groups.get(id).await
    }

    pub async fn list(&self) -> Vec<NodeGroup> {
        self.groups.list().await
    }

    pub async fn add_member(&self, group_id: GroupId, node_id: NodeId) -> Result<(), GroupError> {
        self.groups.get(group_id).await.ok_or(GroupError::GroupNotFound)?;
        self.groups.add_member(group_id, node_id).await;
        Ok(())
    }

    pub async fn remove_member(&self, group_id: GroupId, node_id: NodeId) -> Result<(), GroupError> {
        self.groups.get(group_id).await.ok_or(GroupError::GroupNotFound)?;
        self.groups.remove_member(group_id, node_id).await;
        Ok(())
    }

    pub async fn members(&self, group_id: GroupId) -> Vec<NodeId> {
        self.groups.members(group_id).await
    }

    pub async fn groups_for_node(&self, node_id: NodeId) -> Vec<GroupId> {
        self.groups.groups_for_node(node_id).await
    }

    pub async fn traffic_stats(
        &self,
        group_id: GroupId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TrafficStats {
        self.traffic.get_traffic_by_group(group_id, start, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryGroupRepository, InMemoryNodeRepository, InMemoryTrafficRepository};

    fn setup() -> GroupService {
        let groups = Arc::new(InMemoryGroupRepository::new());
        let nodes = Arc::new(InMemoryNodeRepository::new());
        let traffic_repo = Arc::new(InMemoryTrafficRepository::new());
        let traffic = Arc::new(TrafficService::new(traffic_repo, nodes, groups.clone()));
        GroupService::new(groups, traffic)
    }

    #[tokio::test]
    async fn create_rejects_empty_name() {
        let service = setup();
        let err = service
            .create(NewGroupParams {
                name: "  ".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::InvalidGroup(_)));
    }

    #[tokio::test]
    async fn membership_add_remove_round_trip() {
        let service = setup();
        let group = service
            .create(NewGroupParams {
                name: "eu".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        service.add_member(group.id, 1).await.unwrap();
        service.add_member(group.id, 2).await.unwrap();
        let mut members = service.members(group.id).await;
        members.sort_unstable();
        assert_eq!(members, vec![1, 2]);

        service.remove_member(group.id, 1).await.unwrap();
        assert_eq!(service.members(group.id).await, vec![2]);
        assert_eq!(service.groups_for_node(2).await, vec![group.id]);
    }

    #[tokio::test]
    async fn delete_unknown_group_errors() {
        let service = setup();
        let err = service.delete(999).await.unwrap_err();
        assert_eq!(err, GroupError::GroupNotFound);
    }
}
