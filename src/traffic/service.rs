//! Traffic Service (component H): batched ingest and consistent
//! roll-ups by node, user, group, and proxy.

use crate::model::{GroupId, NodeId, TrafficRecord, UserId};
use crate::repo::{GroupRepository, NodeRepository, TrafficRepository};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub upload: u64,
    pub download: u64,
}

impl TrafficStats {
    pub fn total(&self) -> u64 {
        self.upload + self.download
    }

    fn add(&mut self, rec: &TrafficRecord) {
        self.upload += rec.upload_bytes;
        self.download += rec.download_bytes;
    }
}

pub struct TrafficService {
    traffic: Arc<dyn TrafficRepository>,
    nodes: Arc<dyn NodeRepository>,
    groups: Arc<dyn GroupRepository>,
}

impl TrafficService {
    pub fn new(
        traffic: Arc<dyn TrafficRepository>,
        nodes: Arc<dyn NodeRepository>,
        groups: Arc<dyn GroupRepository>,
    ) -> Self {
        Self {
            traffic,
            nodes,
            groups,
        }
    }

    pub async fn record_traffic(&self, record: TrafficRecord) {
        self.traffic.record(record).await;
    }

    pub async fn record_traffic_batch(&self, records: Vec<TrafficRecord>) {
        self.traffic.record_batch(records).await;
    }

    pub async fn get_total_traffic(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TrafficStats {
        let records = self.traffic.query_range(start, end).await;
        let mut stats = TrafficStats::default();
        for rec in &records {
            stats.add(rec);
        }
        stats
    }

    pub async fn get_traffic_by_node(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HashMap<NodeId, TrafficStats> {
        let records = self.traffic.query_range(start, end).await;
        let mut by_node: HashMap<NodeId, TrafficStats> = HashMap::new();
        for rec in &records {
            by_node.entry(rec.node_id).or_default().add(rec);
        }
        by_node
    }

    pub async fn get_traffic_by_user(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HashMap<UserId, TrafficStats> {
        let records = self.traffic.query_range(start, end).await;
        let mut by_user: HashMap<UserId, TrafficStats> = HashMap::new();
        for rec in &records {
            by_user.entry(rec.user_id).or_default().add(rec);
        }
        by_user
    }

    pub async fn get_user_traffic_on_node(
        &self,
        user_id: UserId,
        node_id: NodeId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TrafficStats {
        let records = self.traffic.query_range(start, end).await;
        let mut stats = TrafficStats::default();
        for rec in records
            .iter()
            .filter(|r| r.user_id == user_id && r.node_id == node_id)
        {
            stats.add(rec);
        }
        stats
    }

    pub async fn get_traffic_by_group(
        &self,
        group_id: GroupId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TrafficStats {
        if self.groups.get(group_id).await.is_none() {
            return TrafficStats::default();
        }
        let members: std::collections::HashSet<NodeId> =
            self.nodes.list_by_group(group_id).await.into_iter().map(|n| n.id).collect();
        let records = self.traffic.query_range(start, end).await;
        let mut stats = TrafficStats::default();
        for rec in records.iter().filter(|r| members.contains(&r.node_id)) {
            stats.add(rec);
        }
        stats
    }

    pub async fn top_users_on_node(
        &self,
        node_id: NodeId,
        n: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(UserId, TrafficStats)> {
        let records = self.traffic.query_range(start, end).await;
        let mut by_user: HashMap<UserId, TrafficStats> = HashMap::new();
        for rec in records.iter().filter(|r| r.node_id == node_id) {
            by_user.entry(rec.user_id).or_default().add(rec);
        }
        let mut ranked: Vec<_> = by_user.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total().cmp(&a.1.total()));
        ranked.truncate(n);
        ranked
    }

    pub async fn user_breakdown_by_node(
        &self,
        user_id: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HashMap<NodeId, TrafficStats> {
        let records = self.traffic.query_range(start, end).await;
        let mut by_node: HashMap<NodeId, TrafficStats> = HashMap::new();
        for rec in records.iter().filter(|r| r.user_id == user_id) {
            by_node.entry(rec.node_id).or_default().add(rec);
        }
        by_node
    }

    pub async fn get_traffic_by_proxy(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HashMap<u64, TrafficStats> {
        let records = self.traffic.query_range(start, end).await;
        let mut by_proxy: HashMap<u64, TrafficStats> = HashMap::new();
        for rec in records.iter().filter_map(|r| r.proxy_id.map(|p| (p, r))) {
            by_proxy.entry(rec.0).or_default().add(rec.1);
        }
        by_proxy
    }

    pub async fn get_traffic_by_user_proxy(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HashMap<(UserId, u64), TrafficStats> {
        let records = self.traffic.query_range(start, end).await;
        let mut by_pair: HashMap<(UserId, u64), TrafficStats> = HashMap::new();
        for rec in records.iter() {
            if let Some(proxy_id) = rec.proxy_id {
                by_pair.entry((rec.user_id, proxy_id)).or_default().add(rec);
            }
        }
        by_pair
    }

    pub async fn cleanup_old_records(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        self.traffic.cleanup(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryGroupRepository, InMemoryNodeRepository, InMemoryTrafficRepository};

    fn rec(node_id: NodeId, user_id: UserId, up: u64, down: u64) -> TrafficRecord {
        TrafficRecord {
            node_id,
            user_id,
            proxy_id: None,
            upload_bytes: up,
            download_bytes: down,
            recorded_at: Utc::now(),
        }
    }

    async fn setup() -> TrafficService {
        TrafficService::new(
            Arc::new(InMemoryTrafficRepository::new()),
            Arc::new(InMemoryNodeRepository::new()),
            Arc::new(InMemoryGroupRepository::new()),
        )
    }

    #[tokio::test]
    async fn total_equals_sum_of_by_node() {
        let service = setup().await;
        service
            .record_traffic_batch(vec![
                rec(1, 10, 100, 50),
                rec(2, 10, 200, 100),
                rec(1, 11, 30, 10),
            ])
            .await;

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);

        let total = service.get_total_traffic(start, end).await;
        let by_node = service.get_traffic_by_node(start, end).await;
        let sum: u64 = by_node.values().map(|s| s.total()).sum();
        assert_eq!(total.total(), sum);
        assert_eq!(total.total(), total.upload + total.download);
    }

    #[tokio::test]
    async fn by_user_node_sums_to_by_user() {
        let service = setup().await;
        service
            .record_traffic_batch(vec![
                rec(1, 10, 100, 50),
                rec(2, 10, 200, 100),
                rec(1, 11, 30, 10),
            ])
            .await;

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);

        let by_user = service.get_traffic_by_user(start, end).await;
        let breakdown = service.user_breakdown_by_node(10, start, end).await;
        let sum: u64 = breakdown.values().map(|s| s.total()).sum();
        assert_eq!(by_user[&10].total(), sum);
    }

    #[tokio::test]
    async fn bytes_never_negative_by_construction() {
        let service = setup().await;
        service.record_traffic(rec(1, 1, 0, 0)).await;
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let stats = service.get_total_traffic(start, end).await;
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn unknown_group_yields_empty_stats() {
        let service = setup().await;
        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let stats = service.get_traffic_by_group(999, start, end).await;
        assert_eq!(stats.total(), 0);
    }
}
