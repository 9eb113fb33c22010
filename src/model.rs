//! Shared data model for the panel store.
//!
//! These types are owned by the repository layer (`crate::repo`); values
//! handed to callers are short-lived projections, never live references
//! into shared state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

pub type NodeId = u64;
pub type GroupId = u64;
pub type UserId = u64;

/// Node lifecycle status. Driven by the Health Checker and Config Sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Offline,
    Online,
    Unhealthy,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Offline => "offline",
            NodeStatus::Online => "online",
            NodeStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Config-sync status for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

/// A worker node that terminates proxy traffic for users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub panel_url: Option<String>,
    pub token: String,
    pub status: NodeStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
    pub weight: u8,
    pub max_users: u32,
    pub current_users: u32,
    pub ip_whitelist: Vec<String>,
    pub tags: Vec<String>,
    pub region: Option<String>,
    pub group_id: Option<GroupId>,
    pub protocols: Vec<String>,
    pub tls_enabled: bool,
    pub tls_domain: Option<String>,
    pub alert_cpu_threshold: u8,
    pub alert_mem_threshold: u8,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Node {
    /// A node is at capacity iff `max_users` is bounded and already reached.
    pub fn at_capacity(&self) -> bool {
        self.max_users > 0 && self.current_users >= self.max_users
    }

    pub fn under_capacity(&self) -> bool {
        !self.at_capacity()
    }
}

/// A tag set over nodes used for failover locality and aggregate stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub id: GroupId,
    pub name: String,
    pub region: Option<String>,
    pub strategy: String,
}

/// Immutable probe result recorded by the Health Checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node_id: NodeId,
    pub status: ProbeOutcome,
    pub tcp_ok: bool,
    pub api_ok: bool,
    pub xray_ok: bool,
    pub latency_ms: u64,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Success,
    Failed,
}

/// Immutable per-(node, user, proxy) traffic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub node_id: NodeId,
    pub user_id: UserId,
    pub proxy_id: Option<u64>,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Sliding-window per-IP failure counter used by the Authenticator.
#[derive(Debug, Clone)]
pub struct AuthFailureRecord {
    pub ip: IpAddr,
    pub attempts: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// The mapping from a user to the single node that currently serves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAssignment {
    pub user_id: UserId,
    pub node_id: NodeId,
    pub assigned_at: DateTime<Utc>,
}

/// A single proxy inlet configured on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub id: u64,
    pub user_id: UserId,
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub host: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

/// The authoritative proxy configuration pushed to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub proxies: Vec<ProxyConfig>,
}
