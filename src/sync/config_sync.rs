//! Config Sync (component G): validates and pushes the authoritative
//! proxy configuration to online nodes over an authenticated HTTP
//! channel, with bounded retry.

use crate::error::SyncError;
use crate::model::{GroupId, Node, NodeConfig, NodeId, NodeStatus, Protocol, ProxyConfig, SyncStatus};
use crate::repo::{GroupRepository, NodeRepository};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct SyncConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub sync_timeout: Duration,
    pub validate: bool,
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub node_id: NodeId,
    pub ok: bool,
    pub error: Option<String>,
}

pub struct ConfigSync {
    nodes: Arc<dyn NodeRepository>,
    groups: Arc<dyn GroupRepository>,
    client: reqwest::Client,
    config: SyncConfig,
    retry_tracker: RwLock<HashMap<NodeId, u32>>,
}

impl ConfigSync {
    pub fn new(nodes: Arc<dyn NodeRepository>, groups: Arc<dyn GroupRepository>, config: SyncConfig) -> Self {
        Self {
            nodes,
            groups,
            client: reqwest::Client::new(),
            config,
            retry_tracker: RwLock::new(HashMap::new()),
        }
    }

    /// Rejects a config that is structurally invalid per the protocol
    /// constraints or that has two proxies sharing a port.
    pub fn validate_config(cfg: &NodeConfig) -> Result<(), SyncError> {
        if cfg.version.is_empty() {
            return Err(SyncError::InvalidConfig("version must not be empty".into()));
        }
        if cfg.timestamp.timestamp() == 0 {
            return Err(SyncError::InvalidConfig("timestamp must be set".into()));
        }

        let mut seen_ports = std::collections::HashSet::new();
        for proxy in &cfg.proxies {
            if proxy.id == 0 {
                return Err(SyncError::InvalidConfig("proxy id must be > 0".into()));
            }
            if proxy.name.is_empty() {
                return Err(SyncError::InvalidConfig("proxy name must not be empty".into()));
            }
            if proxy.port == 0 {
                return Err(SyncError::InvalidConfig("proxy port must be in [1,65535]".into()));
            }
            if !seen_ports.insert(proxy.port) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate port {}",
                    proxy.port
                )));
            }
            Self::validate_protocol_settings(proxy)?;
        }
        Ok(())
    }

    fn validate_protocol_settings(proxy: &ProxyConfig) -> Result<(), SyncError> {
        match proxy.protocol {
            Protocol::Vmess | Protocol::Vless => {
                if let Some(uuid) = proxy.settings.get("uuid") {
                    if uuid.is_empty() {
                        return Err(SyncError::InvalidConfig("uuid must not be empty".into()));
                    }
                }
            }
            Protocol::Trojan => {
                if let Some(password) = proxy.settings.get("password") {
                    if password.is_empty() {
                        return Err(SyncError::InvalidConfig("password must not be empty".into()));
                    }
                }
            }
            Protocol::Shadowsocks => {
                if let Some(method) = proxy.settings.get("method") {
                    if method.is_empty() {
                        return Err(SyncError::InvalidConfig("method must not be empty".into()));
                    }
                }
                if let Some(password) = proxy.settings.get("password") {
                    if password.is_empty() {
                        return Err(SyncError::InvalidConfig("password must not be empty".into()));
                    }
                }
            }
        }
        Ok(())
    }

    fn build_config(proxies: Vec<ProxyConfig>) -> NodeConfig {
        NodeConfig {
            version: "1.0".to_string(),
            timestamp: Utc::now(),
            proxies: proxies.into_iter().filter(|p| p.enabled).collect(),
        }
    }

    pub async fn sync_to_node(&self, node_id: NodeId, proxies: Vec<ProxyConfig>) -> Result<SyncResult, SyncError> {
        let mut node = self.nodes.get(node_id).await.ok_or(SyncError::NodeNotFound)?;
        if node.status != NodeStatus::Online {
            return Err(SyncError::NodeNotOnline);
        }

        let cfg = Self::build_config(proxies);
        if self.config.validate {
            if let Err(e) = Self::validate_config(&cfg) {
                node.sync_status = SyncStatus::Failed;
                let _ = self.nodes.update(node).await;
                return Err(e);
            }
        }

        let attempts = self.config.max_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self.push(&node, &cfg).await {
                Ok(()) => {
                    node.sync_status = SyncStatus::Synced;
                    node.synced_at = Some(Utc::now());
                    let _ = self.nodes.update(node).await;
                    self.retry_tracker.write().remove(&node_id);
                    return Ok(SyncResult {
                        node_id,
                        ok: true,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(node_id, attempt, error = %e, "config sync attempt failed");
                }
            }
        }

        self.retry_tracker
            .write()
            .entry(node_id)
            .and_modify(|c| *c += 1)
            .or_insert(1);
        node.sync_status = SyncStatus::Failed;
        let _ = self.nodes.update(node).await;
        Err(SyncError::SyncFailed)
    }

    async fn push(&self, node: &Node, cfg: &NodeConfig) -> Result<(), String> {
        let url = format!("http://{}:{}/config/sync", node.address, node.port);
        let response = tokio::time::timeout(
            self.config.sync_timeout,
            self.client
                .post(&url)
                .bearer_auth(&node.token)
                .json(cfg)
                .send(),
        )
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status()))
        }
    }

    pub async fn sync_to_group(
        &self,
        group_id: GroupId,
        proxies: Vec<ProxyConfig>,
    ) -> Result<Vec<SyncResult>, SyncError> {
        let members = self.groups.members(group_id).await;
        if members.is_empty() {
            return Err(SyncError::NoNodesToSync);
        }
        self.fan_out(members, proxies).await
    }

    pub async fn sync_to_all(&self, proxies: Vec<ProxyConfig>) -> Result<Vec<SyncResult>, SyncError> {
        let online: Vec<NodeId> = self
            .nodes
            .list_available()
            .await
            .into_iter()
            .map(|n| n.id)
            .collect();
        if online.is_empty() {
            return Err(SyncError::NoNodesToSync);
        }
        self.fan_out(online, proxies).await
    }

    async fn fan_out(
        &self,
        node_ids: Vec<NodeId>,
        proxies: Vec<ProxyConfig>,
    ) -> Result<Vec<SyncResult>, SyncError> {
        let futures = node_ids.into_iter().map(|node_id| {
            let proxies = proxies.clone();
            async move {
                match self.sync_to_node(node_id, proxies).await {
                    Ok(result) => result,
                    Err(e) => SyncResult {
                        node_id,
                        ok: false,
                        error: Some(e.to_string()),
                    },
                }
            }
        });
        Ok(futures::future::join_all(futures).await)
    }

    pub fn retry_count(&self, node_id: NodeId) -> u32 {
        self.retry_tracker.read().get(&node_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;

    fn proxy(id: u64, name: &str, port: u16, protocol: Protocol) -> ProxyConfig {
        ProxyConfig {
            id,
            user_id: 1,
            name: name.to_string(),
            protocol,
            port,
            host: None,
            settings: HashMap::new(),
            enabled: true,
        }
    }

    #[test]
    fn rejects_empty_version() {
        let cfg = NodeConfig {
            version: "".into(),
            timestamp: Utc::now(),
            proxies: vec![],
        };
        assert!(ConfigSync::validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_ports() {
        let cfg = NodeConfig {
            version: "1.0".into(),
            timestamp: Utc::now(),
            proxies: vec![
                proxy(1, "a", 10000, Protocol::Vmess),
                proxy(2, "b", 10000, Protocol::Vless),
            ],
        };
        assert!(matches!(
            ConfigSync::validate_config(&cfg),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn accepts_unique_ports() {
        let cfg = NodeConfig {
            version: "1.0".into(),
            timestamp: Utc::now(),
            proxies: vec![
                proxy(1, "a", 10000, Protocol::Vmess),
                proxy(2, "b", 10001, Protocol::Vless),
            ],
        };
        assert!(ConfigSync::validate_config(&cfg).is_ok());
    }

    #[test]
    fn rejects_zero_proxy_id() {
        let cfg = NodeConfig {
            version: "1.0".into(),
            timestamp: Utc::now(),
            proxies: vec![proxy(0, "a", 10000, Protocol::Vmess)],
        };
        assert!(ConfigSync::validate_config(&cfg).is_err());
    }

    #[test]
    fn shadowsocks_requires_method_and_password_if_present() {
        let mut p = proxy(1, "a", 10000, Protocol::Shadowsocks);
        p.settings.insert("method".to_string(), "".to_string());
        let cfg = NodeConfig {
            version: "1.0".into(),
            timestamp: Utc::now(),
            proxies: vec![p],
        };
        assert!(ConfigSync::validate_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn sync_requires_node_online() {
        use crate::repo::{InMemoryGroupRepository, InMemoryNodeRepository};
        use crate::model::{Node, NodeStatus};

        let nodes = Arc::new(InMemoryNodeRepository::new());
        let groups = Arc::new(InMemoryGroupRepository::new());
        let node = Node {
            id: 0,
            name: "n1".into(),
            address: "127.0.0.1".into(),
            port: 1,
            panel_url: None,
            token: "t".into(),
            status: NodeStatus::Offline,
            last_seen_at: None,
            sync_status: SyncStatus::Pending,
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
        };
        let created = nodes.create(node).await.unwrap();
        let sync = ConfigSync::new(
            nodes,
            groups,
            SyncConfig {
                max_retries: 0,
                retry_delay: Duration::from_millis(1),
                sync_timeout: Duration::from_millis(50),
                validate: true,
            },
        );
        let err = sync.sync_to_node(created.id, vec![]).await.unwrap_err();
        assert_eq!(err, SyncError::NodeNotOnline);
    }
}
