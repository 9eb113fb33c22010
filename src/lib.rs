//! Panel: a control plane for a fleet of proxy worker nodes. Wires the
//! repository layer, authenticator, health checker, load balancer,
//! failover manager, config sync, and traffic/group services together
//! behind a single handle.

pub mod auth;
pub mod balancer;
pub mod config;
pub mod error;
pub mod failover;
pub mod group;
pub mod health;
pub mod http;
pub mod model;
pub mod node;
pub mod notify;
pub mod repo;
pub mod sync;
pub mod traffic;

use auth::{AuthConfig, Authenticator};
use balancer::LoadBalancer;
use config::PanelConfig;
use failover::{FailoverConfig, FailoverManager};
use group::GroupService;
use health::{HealthChecker, HealthConfig};
use node::{NodeService, NodeServiceConfig};
use notify::{LoggingNotifier, Notifier};
use repo::{
    InMemoryAssignmentRepository, InMemoryAuthFailureRepository, InMemoryGroupRepository,
    InMemoryHealthRepository, InMemoryNodeRepository, InMemoryTrafficRepository,
};
use std::sync::Arc;
use sync::{ConfigSync, SyncConfig};
use traffic::TrafficService;

/// Every subsystem the admin surface and background tasks operate on,
/// held behind `Arc` so it can be cloned into spawned tasks and request
/// handlers alike.
pub struct Panel {
    pub config: PanelConfig,
    pub authenticator: Arc<Authenticator>,
    pub load_balancer: Arc<LoadBalancer>,
    pub failover: Arc<FailoverManager>,
    pub health_checker: Arc<HealthChecker>,
    pub config_sync: Arc<ConfigSync>,
    pub traffic: Arc<TrafficService>,
    pub node_service: Arc<NodeService>,
    pub group_service: Arc<GroupService>,
}

impl Panel {
    /// Builds the full in-memory Panel from a loaded config. The health
    /// checker is wired to the failover manager as its `FailoverTrigger`
    /// so an `unhealthy` transition kicks off migration automatically.
    pub fn new(config: PanelConfig) -> Arc<Self> {
        let nodes = Arc::new(InMemoryNodeRepository::new());
        let groups = Arc::new(InMemoryGroupRepository::new());
        let assignments = Arc::new(InMemoryAssignmentRepository::new());
        let health_repo = Arc::new(InMemoryHealthRepository::new());
        let traffic_repo = Arc::new(InMemoryTrafficRepository::new());
        let auth_failures = Arc::new(InMemoryAuthFailureRepository::new(config.auth_failure_window()));
        let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);

        let authenticator = Arc::new(Authenticator::new(
            nodes.clone(),
            auth_failures,
            AuthConfig {
                max_failures: config.auth_max_failures,
                failure_window: config.auth_failure_window(),
                block_duration: config.auth_block_duration(),
            },
        ));

        let load_balancer = Arc::new(LoadBalancer::new(
            nodes.clone(),
            groups.clone(),
            assignments.clone(),
            None,
        ));

        let failover = Arc::new(FailoverManager::new(
            nodes.clone(),
            groups.clone(),
            assignments.clone(),
            notifier.clone(),
            FailoverConfig {
                max_concurrent_migrations: config.failover_max_concurrent_migrations,
                migration_timeout: config.failover_migration_timeout(),
                prefer_same_group: config.failover_prefer_same_group,
                allow_cross_group_failover: config.failover_allow_cross_group,
            },
        ));

        let health_checker = Arc::new(HealthChecker::new(
            nodes.clone(),
            health_repo,
            notifier,
            Some(failover.clone() as Arc<dyn health::FailoverTrigger>),
            HealthConfig {
                interval: config.health_interval(),
                timeout: config.health_timeout(),
                max_concurrent_checks: config.health_max_concurrent_checks,
                unhealthy_threshold: config.health_unhealthy_threshold,
                healthy_threshold: config.health_healthy_threshold,
                retention_days: config.health_retention_days,
            },
        ));

        let config_sync = Arc::new(ConfigSync::new(
            nodes.clone(),
            groups.clone(),
            SyncConfig {
                max_retries: config.sync_max_retries,
                retry_delay: config.sync_retry_delay(),
                sync_timeout: config.sync_timeout(),
                validate: config.sync_validate,
            },
        ));

        let traffic = Arc::new(TrafficService::new(traffic_repo, nodes.clone(), groups.clone()));
        let group_service = Arc::new(GroupService::new(groups, traffic.clone()));

        let node_service = Arc::new(NodeService::new(
            nodes,
            assignments,
            load_balancer.clone(),
            authenticator.clone(),
            Some(failover.clone() as Arc<dyn node::DeleteLock>),
            NodeServiceConfig {
                default_port: config.default_node_port,
                default_weight: config.default_node_weight,
            },
        ));

        Arc::new(Self {
            config,
            authenticator,
            load_balancer,
            failover,
            health_checker,
            config_sync,
            traffic,
            node_service,
            group_service,
        })
    }

    /// Spawns the background health-check loop, returning its handle so
    /// the caller can await it on shutdown.
    pub fn spawn_health_checker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let checker = self.health_checker.clone();
        tokio::spawn(async move { checker.run().await })
    }
}
