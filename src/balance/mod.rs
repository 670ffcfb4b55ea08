//! Host selection across address groups with blacklist feedback
//!
//! A `LoadBalancer` owns the blacklist of one service. Each `connect` call walks
//! the groups in group-strategy order, asks the group's balance strategy for an
//! ordered candidate list and tries each candidate until one accepts. When every
//! normal attempt fails, a fall-through pass ignores the blacklist for up to
//! `retry_all_downs` rounds.

pub mod group;
pub mod info;
pub mod strategy;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::core::HostAddress;
use crate::error::{ConfigError, DriverError, DriverResult};
use crate::health::Blacklist;
pub use group::GroupBalanceStrategy;
pub use info::{FallThroughPolicy, LoadBalanceAddressList, LoadBalanceInfo, LoadBalanceInfoCache};
pub use strategy::BalanceStrategy;

/// Opens one physical connection to a given host
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    async fn connect(&self, host: &HostAddress) -> DriverResult<Self::Connection>;
}

pub struct LoadBalancer<C> {
    info: Arc<LoadBalanceInfo>,
    blacklist: Arc<Blacklist>,
    rotations: Vec<AtomicUsize>,
    connector: C,
}

impl<C: Connector> LoadBalancer<C> {
    pub fn new(info: Arc<LoadBalanceInfo>, connector: C) -> Result<Self, ConfigError> {
        let blacklist = Arc::new(Blacklist::new(&info.blacklist)?);
        Self::with_blacklist(info, blacklist, connector)
    }

    pub fn with_blacklist(
        info: Arc<LoadBalanceInfo>,
        blacklist: Arc<Blacklist>,
        connector: C,
    ) -> Result<Self, ConfigError> {
        info.validate()?;
        let rotations = info.groups.iter().map(|_| AtomicUsize::new(0)).collect();
        Ok(Self {
            info,
            blacklist,
            rotations,
            connector,
        })
    }

    pub fn info(&self) -> &LoadBalanceInfo {
        &self.info
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connect to the first host that accepts, returning it with the connection
    pub async fn connect(&self) -> DriverResult<(HostAddress, C::Connection)> {
        let mut last_error = None;

        for index in self.info.group_strategy.order(self.info.groups.len()) {
            let group = &self.info.groups[index];
            let candidates = match group.strategy.order(
                &group.hosts,
                &self.blacklist,
                &self.rotations[index],
                Instant::now(),
            )? {
                Some(candidates) => candidates,
                None => {
                    debug!(
                        "All hosts of group {} of service {} are blacklisted",
                        index, self.info.service_name
                    );
                    continue;
                }
            };

            for host in candidates {
                match self.attempt(&host, &mut last_error).await? {
                    Some(connection) => {
                        self.blacklist.notify_success(&host);
                        return Ok((host, connection));
                    }
                    None => continue,
                }
            }
        }

        if let Some(found) = self.fall_through(&mut last_error).await? {
            return Ok(found);
        }

        Err(DriverError::no_active_connection(
            self.info.service_name.clone(),
            last_error,
        ))
    }

    /// Last resort: try every configured host regardless of blacklist state
    async fn fall_through(
        &self,
        last_error: &mut Option<DriverError>,
    ) -> DriverResult<Option<(HostAddress, C::Connection)>> {
        for round in 0..self.info.retry_all_downs {
            debug!(
                "Fall-through round {} of {} for service {}",
                round + 1,
                self.info.retry_all_downs,
                self.info.service_name
            );
            for index in self.info.group_strategy.order(self.info.groups.len()) {
                for weighted in &self.info.groups[index].hosts {
                    let host = &weighted.address;
                    if let Some(connection) = self.attempt(host, last_error).await? {
                        match self.info.fall_through {
                            FallThroughPolicy::Keep => self.blacklist.notify_success(host),
                            FallThroughPolicy::Reset => self.blacklist.reset(host),
                        }
                        info!(
                            "Fall-through connection to {} succeeded ({} policy)",
                            host, self.info.fall_through
                        );
                        return Ok(Some((host.clone(), connection)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// One connection attempt. Recoverable failures are recorded and kept in
    /// `last_error`; anything else aborts the whole selection.
    async fn attempt(
        &self,
        host: &HostAddress,
        last_error: &mut Option<DriverError>,
    ) -> DriverResult<Option<C::Connection>> {
        debug!("Connecting to {}", host);
        match self.connector.connect(host).await {
            Ok(connection) => Ok(Some(connection)),
            Err(e) if e.is_recoverable() => {
                let state = self.blacklist.record_failure(host, Instant::now());
                warn!(host = %host, state = %state, error = %e, "Connection attempt failed");
                *last_error = Some(e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LoadBalanceHostAddress;
    use crate::error::AuthError;
    use crate::health::HostState;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::io;

    #[derive(Default)]
    struct FakeConnector {
        down: HashSet<String>,
        denied: HashSet<String>,
        attempts: Mutex<Vec<String>>,
    }

    impl FakeConnector {
        fn down(hosts: &[&str]) -> Self {
            Self {
                down: hosts.iter().map(|h| h.to_string()).collect(),
                ..Default::default()
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Connection = String;

        async fn connect(&self, host: &HostAddress) -> DriverResult<String> {
            self.attempts.lock().push(host.host.clone());
            if self.denied.contains(&host.host) {
                return Err(AuthError::UnsupportedPlugin("dialog".into()).into());
            }
            if self.down.contains(&host.host) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into());
            }
            Ok(format!("conn-{}", host.host))
        }
    }

    fn group(names: &[&str], strategy: BalanceStrategy) -> LoadBalanceAddressList {
        LoadBalanceAddressList::new(
            names
                .iter()
                .map(|n| LoadBalanceHostAddress::from(HostAddress::new(*n, 3306)))
                .collect(),
            strategy,
        )
    }

    fn info(groups: Vec<LoadBalanceAddressList>, retry_all_downs: u32) -> Arc<LoadBalanceInfo> {
        let mut info = LoadBalanceInfo::single("svc", Vec::new(), BalanceStrategy::Rotation);
        info.groups = groups;
        info.retry_all_downs = retry_all_downs;
        Arc::new(info)
    }

    fn host(name: &str) -> HostAddress {
        HostAddress::new(name, 3306)
    }

    #[tokio::test]
    async fn test_rotation_skips_black_hosts_and_reports_failure() {
        let balancer = LoadBalancer::new(
            info(vec![group(&["a", "b", "c"], BalanceStrategy::Rotation)], 0),
            FakeConnector::down(&["c"]),
        )
        .unwrap();
        let now = Instant::now();
        balancer.blacklist().record_failure(&host("a"), now);
        balancer.blacklist().record_failure(&host("b"), now);

        let err = balancer.connect().await.unwrap_err();
        assert_eq!(balancer.connector().attempts(), vec!["c"]);
        match err {
            DriverError::NoActiveConnection {
                service, last_error, ..
            } => {
                assert_eq!(service, "svc");
                assert!(matches!(last_error.as_deref(), Some(DriverError::Network(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(balancer.blacklist().is_black(&host("c"), Instant::now()));
    }

    #[tokio::test]
    async fn test_failed_host_blacklisted_next_host_used() {
        let balancer = LoadBalancer::new(
            info(vec![group(&["a", "b"], BalanceStrategy::Rotation)], 0),
            FakeConnector::down(&["a"]),
        )
        .unwrap();

        let (chosen, connection) = balancer.connect().await.unwrap();
        assert_eq!(chosen, host("b"));
        assert_eq!(connection, "conn-b");
        assert_eq!(
            balancer.blacklist().state_of(&host("a"), Instant::now()),
            Some(HostState::Black)
        );

        // a is now excluded, so the next call starts at b without touching a
        let (chosen, _) = balancer.connect().await.unwrap();
        assert_eq!(chosen, host("b"));
        assert_eq!(balancer.connector().attempts(), vec!["a", "b", "b"]);
    }

    #[tokio::test]
    async fn test_groups_tried_in_order() {
        let balancer = LoadBalancer::new(
            info(
                vec![
                    group(&["east1", "east2"], BalanceStrategy::Random),
                    group(&["west1"], BalanceStrategy::Random),
                ],
                0,
            ),
            FakeConnector::down(&["east1", "east2"]),
        )
        .unwrap();

        let (chosen, _) = balancer.connect().await.unwrap();
        assert_eq!(chosen, host("west1"));
        let attempts = balancer.connector().attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2], "west1");

        // the blacklisted group is skipped without any attempt
        let (chosen, _) = balancer.connect().await.unwrap();
        assert_eq!(chosen, host("west1"));
        assert_eq!(balancer.connector().attempts().len(), 4);
    }

    #[tokio::test]
    async fn test_no_fall_through_without_budget() {
        let balancer = LoadBalancer::new(
            info(vec![group(&["a", "b"], BalanceStrategy::Rotation)], 0),
            FakeConnector::default(),
        )
        .unwrap();
        let now = Instant::now();
        balancer.blacklist().record_failure(&host("a"), now);
        balancer.blacklist().record_failure(&host("b"), now);

        let err = balancer.connect().await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::NoActiveConnection {
                last_error: None,
                ..
            }
        ));
        assert!(balancer.connector().attempts().is_empty());
    }

    async fn fall_through_with(policy: FallThroughPolicy) -> LoadBalancer<FakeConnector> {
        let mut info = (*info(vec![group(&["a", "b"], BalanceStrategy::Rotation)], 1)).clone();
        info.fall_through = policy;
        let balancer =
            LoadBalancer::new(Arc::new(info), FakeConnector::down(&["a"])).unwrap();
        let now = Instant::now();
        balancer.blacklist().record_failure(&host("a"), now);
        balancer.blacklist().record_failure(&host("b"), now);

        let (chosen, _) = balancer.connect().await.unwrap();
        assert_eq!(chosen, host("b"));
        assert_eq!(balancer.connector().attempts(), vec!["a", "b"]);
        balancer
    }

    #[tokio::test]
    async fn test_fall_through_keep_leaves_host_black() {
        let balancer = fall_through_with(FallThroughPolicy::Keep).await;
        assert!(balancer.blacklist().is_black(&host("b"), Instant::now()));
    }

    #[tokio::test]
    async fn test_fall_through_reset_clears_host() {
        let balancer = fall_through_with(FallThroughPolicy::Reset).await;
        assert_eq!(balancer.blacklist().state_of(&host("b"), Instant::now()), None);
        assert!(balancer.blacklist().is_black(&host("a"), Instant::now()));
    }

    #[tokio::test]
    async fn test_fall_through_rounds_bounded() {
        let balancer = LoadBalancer::new(
            info(vec![group(&["a", "b"], BalanceStrategy::Rotation)], 2),
            FakeConnector::down(&["a", "b"]),
        )
        .unwrap();

        assert!(balancer.connect().await.is_err());
        // one normal pass plus two fall-through rounds
        assert_eq!(balancer.connector().attempts().len(), 2 + 2 * 2);
    }

    #[tokio::test]
    async fn test_non_recoverable_error_stops_selection() {
        let connector = FakeConnector {
            denied: ["a".to_string(), "b".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let balancer = LoadBalancer::new(
            info(vec![group(&["a", "b"], BalanceStrategy::Rotation)], 3),
            connector,
        )
        .unwrap();

        let err = balancer.connect().await.unwrap_err();
        assert!(matches!(err, DriverError::Auth(_)));
        assert_eq!(balancer.connector().attempts(), vec!["a"]);
        assert!(balancer.blacklist().is_empty());
    }

    #[test]
    fn test_invalid_info_rejected() {
        assert!(LoadBalancer::new(info(Vec::new(), 0), FakeConnector::default()).is_err());
    }
}
