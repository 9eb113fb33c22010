//! Selection strategies dispatched by the Load Balancer's strategy
//! registry. Each strategy must tolerate equal-weight and single-node
//! candidate sets.

use crate::model::{Node, NodeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Resolves a client IP to a (lat, lon) pair. The geolocation database
/// itself is an external collaborator; this crate only consumes it.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Option<(f64, f64)>;
}

pub struct SelectContext<'a> {
    pub user_ip: Option<IpAddr>,
    pub geo: Option<&'a (dyn GeoLocator + Send + Sync)>,
}

#[async_trait]
pub trait LbStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn select(&self, candidates: &[Node], ctx: &SelectContext<'_>) -> Option<NodeId>;
}

/// Monotonic atomic counter, thread-safe under concurrent selection.
pub struct RoundRobinStrategy {
    next_index: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            next_index: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LbStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    async fn select(&self, candidates: &[Node], _ctx: &SelectContext<'_>) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next_index.fetch_add(1, Ordering::SeqCst) % candidates.len();
        Some(candidates[idx].id)
    }
}

/// Node with the fewest current users; ties broken by first occurrence
/// in the candidate slice.
pub struct LeastConnectionsStrategy;

#[async_trait]
impl LbStrategy for LeastConnectionsStrategy {
    fn name(&self) -> &'static str {
        "least-connections"
    }

    async fn select(&self, candidates: &[Node], _ctx: &SelectContext<'_>) -> Option<NodeId> {
        candidates
            .iter()
            .min_by_key(|n| n.current_users)
            .map(|n| n.id)
    }
}

/// Smooth weighted round-robin, nginx-style: each candidate accrues its
/// static weight every call, the current maximum is picked, and that
/// node's accumulator is discounted by the sum of all weights. Entries
/// persist across calls keyed by node id; stale entries (nodes no longer
/// selected) are harmless but pruned opportunistically.
pub struct WeightedStrategy {
    current_weight: Mutex<HashMap<NodeId, i64>>,
}

impl Default for WeightedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedStrategy {
    pub fn new() -> Self {
        Self {
            current_weight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LbStrategy for WeightedStrategy {
    fn name(&self) -> &'static str {
        "weighted"
    }

    async fn select(&self, candidates: &[Node], _ctx: &SelectContext<'_>) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let total_weight: i64 = candidates.iter().map(|n| n.weight as i64).sum();
        if total_weight == 0 {
            return Some(candidates[0].id);
        }

        let mut state = self.current_weight.lock();
        let live_ids: std::collections::HashSet<NodeId> = candidates.iter().map(|n| n.id).collect();
        state.retain(|id, _| live_ids.contains(id));

        for node in candidates {
            *state.entry(node.id).or_insert(0) += node.weight as i64;
        }

        let chosen = candidates
            .iter()
            .max_by_key(|n| state.get(&n.id).copied().unwrap_or(0))
            .map(|n| n.id)?;

        if let Some(w) = state.get_mut(&chosen) {
            *w -= total_weight;
        }
        Some(chosen)
    }
}

/// Earth radius in km, matching the constant the spec pins down.
const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// Picks the candidate nearest the user's resolved location. Falls back
/// to the first candidate when there is no user IP, no geolocation
/// service, or no node carries a location.
pub struct GeographicStrategy;

#[async_trait]
impl LbStrategy for GeographicStrategy {
    fn name(&self) -> &'static str {
        "geographic"
    }

    async fn select(&self, candidates: &[Node], ctx: &SelectContext<'_>) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let (Some(ip), Some(geo)) = (ctx.user_ip, ctx.geo) else {
            return Some(candidates[0].id);
        };
        let Some((ulat, ulon)) = geo.locate(ip).await else {
            return Some(candidates[0].id);
        };

        let mut best: Option<(NodeId, f64)> = None;
        for node in candidates {
            let (Some(nlat), Some(nlon)) = (node.latitude, node.longitude) else {
                continue;
            };
            let d = haversine_km(ulat, ulon, nlat, nlon);
            if best.map(|(_, best_d)| d < best_d).unwrap_or(true) {
                best = Some((node.id, d));
            }
        }
        best.map(|(id, _)| id).or(Some(candidates[0].id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeStatus, SyncStatus};

    fn node(id: NodeId, weight: u8, current_users: u32) -> Node {
        Node {
            id,
            name: format!("n{id}"),
            address: "1.1.1.1".into(),
            port: 1,
            panel_url: None,
            token: "t".into(),
            status: NodeStatus::Online,
            last_seen_at: None,
            sync_status: SyncStatus::Synced,
            synced_at: None,
            weight,
            max_users: 0,
            current_users,
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

    fn ctx() -> SelectContext<'static> {
        SelectContext {
            user_ip: None,
            geo: None,
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let strategy = RoundRobinStrategy::new();
        let candidates = vec![node(1, 1, 0), node(2, 1, 0), node(3, 1, 0)];
        let picks: Vec<_> = {
            let mut v = Vec::new();
            for _ in 0..6 {
                v.push(strategy.select(&candidates, &ctx()).await.unwrap());
            }
            v
        };
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn least_connections_picks_minimum() {
        let strategy = LeastConnectionsStrategy;
        let candidates = vec![node(1, 1, 5), node(2, 1, 1), node(3, 1, 9)];
        assert_eq!(strategy.select(&candidates, &ctx()).await, Some(2));
    }

    #[tokio::test]
    async fn weighted_distribution_matches_ratios() {
        let strategy = WeightedStrategy::new();
        let candidates = vec![node(1, 1, 0), node(2, 2, 0), node(3, 7, 0)];
        let mut counts = HashMap::new();
        for _ in 0..1000 {
            let pick = strategy.select(&candidates, &ctx()).await.unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        assert!((counts[&1] as i64 - 100).abs() <= 100);
        assert!((counts[&2] as i64 - 200).abs() <= 100);
        assert!((counts[&3] as i64 - 700).abs() <= 100);
    }

    #[test]
    fn haversine_is_symmetric_and_zero_at_same_point() {
        let d1 = haversine_km(40.0, -73.0, 51.0, 0.0);
        let d2 = haversine_km(51.0, 0.0, 40.0, -73.0);
        assert!((d1 - d2).abs() < 1e-9);
        assert_eq!(haversine_km(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn haversine_triangle_inequality() {
        let a = (40.0, -73.0);
        let b = (51.0, 0.0);
        let c = (35.0, 139.0);
        let ab = haversine_km(a.0, a.1, b.0, b.1);
        let bc = haversine_km(b.0, b.1, c.0, c.1);
        let ac = haversine_km(a.0, a.1, c.0, c.1);
        assert!(ac <= ab + bc + 1e-6);
    }
}
