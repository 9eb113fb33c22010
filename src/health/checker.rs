//! Health Checker (component D): periodic worker-pool probing with a
//! hysteresis-damped per-node state machine.

use crate::model::{HealthCheck, Node, NodeId, NodeStatus, ProbeOutcome};
use crate::notify::{NodeStatusChange, Notifier};
use crate::repo::{HealthRepository, NodeRepository};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Invoked whenever a node transitions into `unhealthy`. Implemented by
/// the Failover Manager; kept as a trait here so this module never has
/// to import failover internals.
#[async_trait]
pub trait FailoverTrigger: Send + Sync {
    async fn on_node_unhealthy(&self, node_id: NodeId);
}

pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_concurrent_checks: usize,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub retention_days: i64,
}

#[derive(Default, Clone, Copy)]
struct Counters {
    consec_success: u32,
    consec_failure: u32,
}

pub struct HealthChecker {
    nodes: Arc<dyn NodeRepository>,
    health_repo: Arc<dyn HealthRepository>,
    notifier: Arc<dyn Notifier>,
    trigger: Option<Arc<dyn FailoverTrigger>>,
    client: reqwest::Client,
    config: HealthConfig,
    counters: RwLock<HashMap<NodeId, Counters>>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        health_repo: Arc<dyn HealthRepository>,
        notifier: Arc<dyn Notifier>,
        trigger: Option<Arc<dyn FailoverTrigger>>,
        config: HealthConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build health-check http client");
        Self {
            nodes,
            health_repo,
            notifier,
            trigger,
            client,
            config,
            counters: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn get_consecutive_failures(&self, node_id: NodeId) -> u32 {
        self.counters
            .read()
            .get(&node_id)
            .map(|c| c.consec_failure)
            .unwrap_or(0)
    }

    pub fn get_consecutive_successes(&self, node_id: NodeId) -> u32 {
        self.counters
            .read()
            .get(&node_id)
            .map(|c| c.consec_success)
            .unwrap_or(0)
    }

    /// Runs the periodic probe loop until the root context is cancelled.
    /// Intended to be spawned as a background task.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    Self::tick(&self).await;
                }
                _ = self.cancel.cancelled() => {
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Cancels the root context and waits (up to `timeout`) for the
    /// current tick's outstanding probes to drain.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(timeout, async {
            while self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn tick(self_: &Arc<Self>) {
        let nodes = self_.nodes.list().await;
        let semaphore = Arc::new(Semaphore::new(self_.config.max_concurrent_checks.max(1)));
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let semaphore = semaphore.clone();
            let checker = self_.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                checker.probe_and_transition(node).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "health probe task panicked");
            }
        }

        let cutoff = Utc::now() - chrono::Duration::days(self_.config.retention_days);
        let removed = self_.health_repo.cleanup(cutoff).await;
        if removed > 0 {
            tracing::debug!(removed, "garbage-collected stale health records");
        }
    }

    async fn probe_and_transition(&self, node: Node) {
        let check = self.probe(&node).await;
        self.health_repo.record(check.clone()).await;

        let old_status = node.status;
        let new_status = self.apply_outcome(node.id, old_status, check.status);

        if new_status != old_status {
            let mut updated = node.clone();
            updated.status = new_status;
            if check.status == ProbeOutcome::Success {
                updated.last_seen_at = Some(check.checked_at);
            }
            if let Err(e) = self.nodes.update(updated).await {
                tracing::error!(node_id = node.id, error = %e, "failed to persist health transition");
            }

            self.notifier
                .notify_node_status_change(NodeStatusChange {
                    node_id: node.id,
                    node_name: node.name.clone(),
                    old_status,
                    new_status,
                    reason: check.message.clone(),
                    timestamp: check.checked_at,
                })
                .await;

            if new_status == NodeStatus::Unhealthy {
                if let Some(trigger) = &self.trigger {
                    trigger.on_node_unhealthy(node.id).await;
                }
            }
        } else if check.status == ProbeOutcome::Success && old_status != NodeStatus::Unhealthy {
            // last_seen_at ticks forward on every success even without a transition.
            let mut updated = node.clone();
            updated.last_seen_at = Some(check.checked_at);
            if let Err(e) = self.nodes.update(updated).await {
                tracing::error!(node_id = node.id, error = %e, "failed to persist last_seen_at");
            }
        }
    }

    /// Advances the hysteresis state machine for one probe outcome and
    /// returns the node's status after the update.
    fn apply_outcome(&self, node_id: NodeId, current: NodeStatus, outcome: ProbeOutcome) -> NodeStatus {
        let mut counters = self.counters.write();
        let entry = counters.entry(node_id).or_default();

        match outcome {
            ProbeOutcome::Success => {
                entry.consec_failure = 0;
                entry.consec_success += 1;
                match current {
                    NodeStatus::Offline => NodeStatus::Online,
                    NodeStatus::Unhealthy if entry.consec_success >= self.config.healthy_threshold => {
                        NodeStatus::Online
                    }
                    other => other,
                }
            }
            ProbeOutcome::Failed => {
                entry.consec_success = 0;
                entry.consec_failure += 1;
                match current {
                    NodeStatus::Online if entry.consec_failure >= self.config.unhealthy_threshold => {
                        NodeStatus::Unhealthy
                    }
                    other => other,
                }
            }
        }
    }

    async fn probe(&self, node: &Node) -> HealthCheck {
        let started = Instant::now();
        let mut tcp_ok = false;
        let mut api_ok = false;
        let mut xray_ok = false;
        let mut failures = Vec::new();

        match tokio::time::timeout(
            self.config.timeout,
            tokio::net::TcpStream::connect((node.address.as_str(), node.port)),
        )
        .await
        {
            Ok(Ok(_)) => tcp_ok = true,
            Ok(Err(e)) => failures.push(format!("tcp: {e}")),
            Err(_) => failures.push("tcp: timeout".to_string()),
        }

        if tcp_ok {
            let health_url = format!("http://{}:{}/health", node.address, node.port);
            match self.client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => api_ok = true,
                Ok(resp) => failures.push(format!("api: status {}", resp.status())),
                Err(e) => failures.push(format!("api: {e}")),
            }
        }

        if api_ok {
            let xray_url = format!("http://{}:{}/xray/status", node.address, node.port);
            match self.client.get(&xray_url).send().await {
                Ok(resp) if resp.status().is_success() => xray_ok = true,
                Ok(resp) => failures.push(format!("xray: status {}", resp.status())),
                Err(e) => failures.push(format!("xray: {e}")),
            }
        }

        let status = if tcp_ok && api_ok && xray_ok {
            ProbeOutcome::Success
        } else {
            ProbeOutcome::Failed
        };
        let message = if failures.is_empty() {
            "ok".to_string()
        } else {
            failures.join("; ")
        };

        HealthCheck {
            node_id: node.id,
            status,
            tcp_ok,
            api_ok,
            xray_ok,
            latency_ms: started.elapsed().as_millis() as u64,
            message,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeStatus, SyncStatus};
    use crate::notify::LoggingNotifier;
    use crate::repo::{InMemoryHealthRepository, InMemoryNodeRepository};

    fn config() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_millis(200),
            max_concurrent_checks: 10,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            retention_days: 7,
        }
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(
            Arc::new(InMemoryNodeRepository::new()),
            Arc::new(InMemoryHealthRepository::new()),
            Arc::new(LoggingNotifier),
            None,
            config(),
        )
    }

    #[test]
    fn hysteresis_requires_threshold_consecutive_failures() {
        let checker = checker();
        let mut status = NodeStatus::Online;
        status = checker.apply_outcome(1, status, ProbeOutcome::Failed);
        assert_eq!(status, NodeStatus::Online);
        status = checker.apply_outcome(1, status, ProbeOutcome::Failed);
        assert_eq!(status, NodeStatus::Online);
        status = checker.apply_outcome(1, status, ProbeOutcome::Failed);
        assert_eq!(status, NodeStatus::Unhealthy);
    }

    #[test]
    fn hysteresis_requires_threshold_consecutive_successes_to_recover() {
        let checker = checker();
        let mut status = NodeStatus::Unhealthy;
        status = checker.apply_outcome(2, status, ProbeOutcome::Success);
        assert_eq!(status, NodeStatus::Unhealthy);
        status = checker.apply_outcome(2, status, ProbeOutcome::Success);
        assert_eq!(status, NodeStatus::Online);
    }

    #[test]
    fn offline_recovers_on_single_success() {
        let checker = checker();
        let status = checker.apply_outcome(3, NodeStatus::Offline, ProbeOutcome::Success);
        assert_eq!(status, NodeStatus::Online);
    }

    #[test]
    fn counters_never_simultaneously_positive() {
        let checker = checker();
        checker.apply_outcome(4, NodeStatus::Online, ProbeOutcome::Failed);
        checker.apply_outcome(4, NodeStatus::Online, ProbeOutcome::Success);
        assert_eq!(checker.get_consecutive_failures(4), 0);
        assert_eq!(checker.get_consecutive_successes(4), 1);
    }
}
