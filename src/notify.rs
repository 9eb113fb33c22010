//! Notification interface consumed by the Health Checker and Failover
//! Manager. The delivery backends themselves (email, webhook, etc.) are
//! out of scope; this crate ships a logging-only default implementation.

use crate::model::{NodeId, NodeStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct NodeStatusChange {
    pub node_id: NodeId,
    pub node_name: String,
    pub old_status: NodeStatus,
    pub new_status: NodeStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_node_status_change(&self, event: NodeStatusChange);
}

/// Default notifier: logs the event via `tracing` and does nothing else.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_node_status_change(&self, event: NodeStatusChange) {
        tracing::info!(
            node_id = event.node_id,
            node = %event.node_name,
            old = event.old_status.as_str(),
            new = event.new_status.as_str(),
            reason = %event.reason,
            "node status change"
        );
    }
}
