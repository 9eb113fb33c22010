//! Node Service (component I): CRUD, validation, token lifecycle, and
//! reassignment-on-delete.

use super::validation::{
    normalize_address, validate_address, validate_ip_whitelist, validate_port, validate_protocols,
    validate_threshold, validate_tls_domain, validate_weight,
};
use crate::auth::Authenticator;
use crate::balancer::{LoadBalancer, SelectOptions};
use crate::error::NodeError;
use crate::model::{GroupId, Node, NodeId, NodeStatus, SyncStatus};
use crate::repo::{AssignmentRepository, NodeRepository};
use std::sync::Arc;

/// Lets `delete` serialize with a concurrent `TriggerFailover` on the
/// same node via the Failover Manager's in-progress flag (see the
/// delete-vs-failover race note in the design doc).
pub trait DeleteLock: Send + Sync {
    fn try_claim(&self, node_id: NodeId) -> bool;
    fn release_claim(&self, node_id: NodeId);
}

#[derive(Debug, Default, Clone)]
pub struct NewNodeParams {
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    pub weight: Option<u8>,
    pub max_users: u32,
    pub ip_whitelist: Vec<String>,
    pub tags: Vec<String>,
    pub region: Option<String>,
    pub group_id: Option<GroupId>,
    pub protocols: Vec<String>,
    pub tls_enabled: bool,
    pub tls_domain: Option<String>,
    pub alert_cpu_threshold: Option<u8>,
    pub alert_mem_threshold: Option<u8>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct UpdateNodeParams {
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub weight: Option<u8>,
    pub max_users: Option<u32>,
    pub ip_whitelist: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub region: Option<String>,
    pub group_id: Option<GroupId>,
    pub protocols: Option<Vec<String>>,
    pub tls_enabled: Option<bool>,
    pub tls_domain: Option<String>,
    pub alert_cpu_threshold: Option<u8>,
    pub alert_mem_threshold: Option<u8>,
}

pub struct NodeServiceConfig {
    pub default_port: u16,
    pub default_weight: u8,
}

pub struct NodeService {
    nodes: Arc<dyn NodeRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    lb: Arc<LoadBalancer>,
    authenticator: Arc<Authenticator>,
    delete_lock: Option<Arc<dyn DeleteLock>>,
    config: NodeServiceConfig,
}

impl NodeService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        assignments: Arc<dyn AssignmentRepository>,
        lb: Arc<LoadBalancer>,
        authenticator: Arc<Authenticator>,
        delete_lock: Option<Arc<dyn DeleteLock>>,
        config: NodeServiceConfig,
    ) -> Self {
        Self {
            nodes,
            assignments,
            lb,
            authenticator,
            delete_lock,
            config,
        }
    }

    fn validate_common(
        address: &str,
        port: u16,
        weight: u8,
        ip_whitelist: &[String],
        protocols: &[String],
        tls_enabled: bool,
        tls_domain: Option<&str>,
        alert_cpu: u8,
        alert_mem: u8,
    ) -> Result<(), NodeError> {
        validate_address(address)?;
        validate_port(port)?;
        validate_weight(weight)?;
        validate_ip_whitelist(ip_whitelist)?;
        validate_protocols(protocols)?;
        validate_tls_domain(tls_enabled, tls_domain)?;
        validate_threshold(alert_cpu, "alert_cpu_threshold")?;
        validate_threshold(alert_mem, "alert_mem_threshold")?;
        Ok(())
    }

    pub async fn create(&self, params: NewNodeParams) -> Result<Node, NodeError> {
        if params.name.trim().is_empty() {
            return Err(NodeError::InvalidNode("name must not be empty".into()));
        }
        let address = normalize_address(&params.address);
        let port = params.port.unwrap_or(self.config.default_port);
        let weight = params.weight.unwrap_or(self.config.default_weight);
        let alert_cpu = params.alert_cpu_threshold.unwrap_or(90);
        let alert_mem = params.alert_mem_threshold.unwrap_or(90);

        Self::validate_common(
            &address,
            port,
            weight,
            &params.ip_whitelist,
            &params.protocols,
            params.tls_enabled,
            params.tls_domain.as_deref(),
            alert_cpu,
            alert_mem,
        )?;

        if self.nodes.get_by_name(&params.name).await.is_some() {
            return Err(NodeError::DuplicateNode(format!(
                "name '{}' already in use",
                params.name
            )));
        }
        if self.nodes.find_by_address_port(&address, port).await.is_some() {
            return Err(NodeError::DuplicateNode(format!(
                "address {address}:{port} already in use"
            )));
        }

        let token = self
            .authenticator
            .generate_unique_token()
            .await
            .map_err(|_| NodeError::InvalidNode("token generation failed".into()))?;

        let node = Node {
            id: 0,
            name: params.name,
            address,
            port,
            panel_url: None,
            token,
            status: NodeStatus::Offline,
            last_seen_at: None,
            sync_status: SyncStatus::Pending,
            synced_at: None,
            weight,
            max_users: params.max_users,
            current_users: 0,
            ip_whitelist: params.ip_whitelist,
            tags: params.tags,
            region: params.region,
            group_id: params.group_id,
            protocols: params.protocols,
            tls_enabled: params.tls_enabled,
            tls_domain: params.tls_domain,
            alert_cpu_threshold: alert_cpu,
            alert_mem_threshold: alert_mem,
            latitude: params.latitude,
            longitude: params.longitude,
        };
        self.nodes.create(node).await
    }

    pub async fn update(&self, id: NodeId, params: UpdateNodeParams) -> Result<Node, NodeError> {
        let mut node = self.nodes.get(id).await.ok_or(NodeError::NodeNotFound)?;
        let name_changed = params.name.is_some();
        let addr_changed = params.address.is_some() || params.port.is_some();

        if let Some(name) = params.name {
            if name.trim().is_empty() {
                return Err(NodeError::InvalidNode("name must not be empty".into()));
            }
            node.name = name;
        }
        if let Some(address) = params.address {
            node.address = normalize_address(&address);
        }
        if let Some(port) = params.port {
            node.port = port;
        }
        if let Some(weight) = params.weight {
            node.weight = weight;
        }
        if let Some(max_users) = params.max_users {
            if max_users > 0 && node.current_users > max_users {
                return Err(NodeError::InvalidNode(
                    "max_users cannot be lower than current_users".into(),
                ));
            }
            node.max_users = max_users;
        }
        if let Some(whitelist) = params.ip_whitelist {
            node.ip_whitelist = whitelist;
        }
        if let Some(tags) = params.tags {
            node.tags = tags;
        }
        if params.region.is_some() {
            node.region = params.region;
        }
        if params.group_id.is_some() {
            node.group_id = params.group_id;
        }
        if let Some(protocols) = params.protocols {
            node.protocols = protocols;
        }
        if let Some(tls_enabled) = params.tls_enabled {
            node.tls_enabled = tls_enabled;
        }
        if params.tls_domain.is_some() {
            node.tls_domain = params.tls_domain;
        }
        if let Some(cpu) = params.alert_cpu_threshold {
            node.alert_cpu_threshold = cpu;
        }
        if let Some(mem) = params.alert_mem_threshold {
            node.alert_mem_threshold = mem;
        }

        Self::validate_common(
            &node.address,
            node.port,
            node.weight,
            &node.ip_whitelist,
            &node.protocols,
            node.tls_enabled,
            node.tls_domain.as_deref(),
            node.alert_cpu_threshold,
            node.alert_mem_threshold,
        )?;

        if name_changed {
            if let Some(existing) = self.nodes.get_by_name(&node.name).await {
                if existing.id != node.id {
                    return Err(NodeError::DuplicateNode(format!(
                        "name '{}' already in use",
                        node.name
                    )));
                }
            }
        }
        if addr_changed {
            if let Some(existing) = self.nodes.find_by_address_port(&node.address, node.port).await {
                if existing.id != node.id {
                    return Err(NodeError::DuplicateNode(format!(
                        "address {}:{} already in use",
                        node.address, node.port
                    )));
                }
            }
        }

        self.nodes.update(node.clone()).await?;
        Ok(node)
    }

    /// Reassigns every user on the node via round-robin across the
    /// remaining available nodes, refusing to proceed (no silent user
    /// loss) if none are available, then deletes the node row.
    pub async fn delete(&self, id: NodeId) -> Result<(), NodeError> {
        if let Some(lock) = &self.delete_lock {
            if !lock.try_claim(id) {
                return Err(NodeError::InvalidNode(
                    "a failover is already in progress for this node".into(),
                ));
            }
        }
        let result = self.delete_inner(id).await;
        if let Some(lock) = &self.delete_lock {
            lock.release_claim(id);
        }
        result
    }

    async fn delete_inner(&self, id: NodeId) -> Result<(), NodeError> {
        let _node = self.nodes.get(id).await.ok_or(NodeError::NodeNotFound)?;

        let assigned_users: Vec<_> = self
            .assignments
            .list_by_node(id)
            .await
            .into_iter()
            .map(|a| a.user_id)
            .collect();
        if !assigned_users.is_empty() {
            let opts = SelectOptions {
                strategy: "round-robin".to_string(),
                exclude_ids: vec![id],
                ..Default::default()
            };
            for user_id in assigned_users {
                let target = self
                    .lb
                    .select_node(user_id, &opts)
                    .await
                    .map_err(|_| NodeError::InvalidNode(
                        "no available nodes to reassign users to; delete aborted".into(),
                    ))?;
                let _ = self.lb.unassign_user(user_id).await;
                self.lb
                    .assign_user(user_id, target.id)
                    .await
                    .map_err(|_| NodeError::NodeAtCapacity)?;
            }
        }

        self.nodes.delete(id).await
    }

    pub async fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(id).await
    }

    pub async fn list(&self) -> Vec<Node> {
        self.nodes.list().await
    }

    pub async fn rotate_token(&self, id: NodeId) -> Result<String, NodeError> {
        self.authenticator
            .rotate_token(id)
            .await
            .map_err(|_| NodeError::NodeNotFound)
    }

    pub async fn revoke_token(&self, id: NodeId) -> Result<(), NodeError> {
        self.authenticator
            .revoke_token(id)
            .await
            .map_err(|_| NodeError::NodeNotFound)
    }
}
