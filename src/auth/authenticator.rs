//! Authenticator (component C): token validation, IP allowlist, and
//! failure-rate enforcement, built on top of the Auth Failure Store (B)
//! and the Node Repository (A).

use super::token::generate_token;
use crate::error::{AuthError, TokenError};
use crate::model::{Node, NodeId, NodeStatus};
use crate::repo::{AuthFailureRepository, NodeRepository};
use chrono::Utc;
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct AuthConfig {
    pub max_failures: u32,
    pub failure_window: Duration,
    pub block_duration: Duration,
}

pub struct Authenticator {
    nodes: Arc<dyn NodeRepository>,
    failures: Arc<dyn AuthFailureRepository>,
    config: AuthConfig,
    /// Tokens that used to belong to a node but were rotated/revoked away,
    /// kept only so a stale presented token can be told apart from one
    /// that was never valid (`TOKEN_REVOKED` vs `INVALID_TOKEN`).
    revoked_tokens: RwLock<HashMap<String, NodeId>>,
}

impl Authenticator {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        failures: Arc<dyn AuthFailureRepository>,
        config: AuthConfig,
    ) -> Self {
        Self {
            nodes,
            failures,
            config,
            revoked_tokens: RwLock::new(HashMap::new()),
        }
    }

    fn record_revoked(&self, old_token: &str, node_id: NodeId) {
        if !old_token.is_empty() {
            self.revoked_tokens
                .write()
                .insert(old_token.to_string(), node_id);
        }
    }

    async fn record_failure_and_maybe_block(&self, ip: IpAddr) {
        let record = self.failures.record_failure(ip).await;
        if record.attempts >= self.config.max_failures {
            let until = Utc::now()
                + chrono::Duration::from_std(self.config.block_duration).unwrap_or_default();
            self.failures.block_ip(ip, until).await;
        }
    }

    /// Authenticate a presented token from `client_ip` against the node
    /// registry, enforcing the IP block list and the per-node whitelist.
    pub async fn authenticate(&self, token: &str, client_ip: IpAddr) -> Result<Node, AuthError> {
        if self.failures.is_blocked(client_ip).await.0 {
            return Err(AuthError::IpBlocked);
        }

        if token.is_empty() {
            self.record_failure_and_maybe_block(client_ip).await;
            return Err(AuthError::InvalidToken);
        }

        let node = match self.nodes.get_by_token(token).await {
            Some(node) => node,
            None => {
                self.record_failure_and_maybe_block(client_ip).await;
                if self.revoked_tokens.read().contains_key(token) {
                    return Err(AuthError::TokenRevoked);
                }
                return Err(AuthError::InvalidToken);
            }
        };

        if !node.ip_whitelist.is_empty() && !ip_allowed(&node.ip_whitelist, client_ip) {
            self.record_failure_and_maybe_block(client_ip).await;
            return Err(AuthError::IpNotWhitelisted);
        }

        self.failures.clear_failures(client_ip).await;
        Ok(node)
    }

    /// Atomically swaps the node's token and forces it offline, so the
    /// node must reconnect with the new credential.
    pub async fn rotate_token(&self, node_id: NodeId) -> Result<String, TokenError> {
        let mut node = self.nodes.get(node_id).await.ok_or(TokenError::Collision)?;
        let old_token = node.token.clone();
        let new_token = self.generate_unique_token().await?;
        node.token = new_token.clone();
        node.status = NodeStatus::Offline;
        let _ = self.nodes.update(node).await;
        self.record_revoked(&old_token, node_id);
        Ok(new_token)
    }

    /// Sets the stored token to empty and forces the node offline.
    pub async fn revoke_token(&self, node_id: NodeId) -> Result<(), TokenError> {
        let mut node = self.nodes.get(node_id).await.ok_or(TokenError::Collision)?;
        let old_token = node.token.clone();
        node.token = String::new();
        node.status = NodeStatus::Offline;
        let _ = self.nodes.update(node).await;
        self.record_revoked(&old_token, node_id);
        Ok(())
    }

    pub async fn generate_unique_token(&self) -> Result<String, TokenError> {
        for _ in 0..8 {
            let candidate = generate_token();
            if self.nodes.get_by_token(&candidate).await.is_none() {
                return Ok(candidate);
            }
        }
        Err(TokenError::Collision)
    }

    pub async fn cleanup_failures(&self) -> usize {
        self.failures.cleanup().await
    }
}

/// Empty whitelist means "allow all"; callers must check emptiness
/// themselves (matches the Node Service validation path).
fn ip_allowed(whitelist: &[String], ip: IpAddr) -> bool {
    whitelist.iter().any(|entry| {
        if let Ok(network) = entry.parse::<IpNetwork>() {
            network.contains(ip)
        } else if let Ok(literal) = entry.parse::<IpAddr>() {
            literal == ip
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeStatus, SyncStatus};
    use crate::repo::InMemoryNodeRepository;
    use std::net::Ipv4Addr;

    fn base_node(token: &str) -> Node {
        Node {
            id: 0,
            name: "n1".into(),
            address: "1.2.3.4".into(),
            port: 18443,
            panel_url: None,
            token: token.to_string(),
            status: NodeStatus::Online,
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
            protocols: vec!["vmess".into()],
            tls_enabled: false,
            tls_domain: None,
            alert_cpu_threshold: 90,
            alert_mem_threshold: 90,
            latitude: None,
            longitude: None,
        }
    }

    fn setup() -> (Authenticator, Arc<InMemoryNodeRepository>) {
        let repo = Arc::new(InMemoryNodeRepository::new());
        let failures = Arc::new(crate::repo::InMemoryAuthFailureRepository::new(
            Duration::from_secs(300),
        ));
        let auth = Authenticator::new(
            repo.clone(),
            failures,
            AuthConfig {
                max_failures: 5,
                failure_window: Duration::from_secs(300),
                block_duration: Duration::from_secs(900),
            },
        );
        (auth, repo)
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let (auth, _repo) = setup();
        let err = auth.authenticate("", ip()).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (auth, _repo) = setup();
        let err = auth.authenticate("deadbeef", ip()).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    #[tokio::test]
    async fn valid_token_succeeds() {
        let (auth, repo) = setup();
        let created = repo.create(base_node("abc123")).await.unwrap();
        let node = auth.authenticate("abc123", ip()).await.unwrap();
        assert_eq!(node.id, created.id);
    }

    #[tokio::test]
    async fn whitelist_blocks_other_ips() {
        let (auth, repo) = setup();
        let mut node = base_node("abc123");
        node.ip_whitelist = vec!["10.0.0.2".to_string()];
        repo.create(node).await.unwrap();
        let err = auth.authenticate("abc123", ip()).await.unwrap_err();
        assert_eq!(err, AuthError::IpNotWhitelisted);
    }

    #[tokio::test]
    async fn whitelist_cidr_matches() {
        let (auth, repo) = setup();
        let mut node = base_node("abc123");
        node.ip_whitelist = vec!["10.0.0.0/24".to_string()];
        repo.create(node).await.unwrap();
        assert!(auth.authenticate("abc123", ip()).await.is_ok());
    }

    #[tokio::test]
    async fn five_failures_then_block() {
        let (auth, repo) = setup();
        repo.create(base_node("abc123")).await.unwrap();
        for _ in 0..5 {
            let err = auth.authenticate("wrong", ip()).await.unwrap_err();
            assert_eq!(err, AuthError::InvalidToken);
        }
        let err = auth.authenticate("abc123", ip()).await.unwrap_err();
        assert_eq!(err, AuthError::IpBlocked);
    }

    #[tokio::test]
    async fn rotation_invalidates_old_token() {
        let (auth, repo) = setup();
        let created = repo.create(base_node("abc123")).await.unwrap();
        let new_token = auth.rotate_token(created.id).await.unwrap();
        assert_ne!(new_token, "abc123");

        let err = auth.authenticate("abc123", ip()).await.unwrap_err();
        assert_eq!(err, AuthError::TokenRevoked);

        let node = auth.authenticate(&new_token, ip()).await.unwrap();
        assert_eq!(node.id, created.id);
    }

    #[tokio::test]
    async fn revoke_marks_token_revoked() {
        let (auth, repo) = setup();
        let created = repo.create(base_node("abc123")).await.unwrap();
        auth.revoke_token(created.id).await.unwrap();
        let err = auth.authenticate("abc123", ip()).await.unwrap_err();
        assert_eq!(err, AuthError::TokenRevoked);
    }
}
