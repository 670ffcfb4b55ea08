/// Host blacklist and failover decisions
pub mod strategy;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::HostAddress;
use crate::error::ConfigError;
pub use strategy::{AppendStrategy, BlackListConfig, RemoveStrategy};

/// Blacklist state of a failing host. Healthy hosts have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostState {
    /// Soft-flagged, still eligible for selection
    Grey,
    /// Excluded from normal selection, still tried by fall-through
    Black,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Grey => write!(f, "GREY"),
            HostState::Black => write!(f, "BLACK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStateInfo {
    pub state: HostState,
    pub timestamp: Instant,
}

/// Per-load-balancer blacklist. Owns its strategies and failure records.
#[derive(Debug)]
pub struct Blacklist {
    entries: DashMap<HostAddress, HostStateInfo>,
    failures: DashMap<HostAddress, VecDeque<Instant>>,
    append: AppendStrategy,
    remove: RemoveStrategy,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::with_strategies(AppendStrategy::default(), RemoveStrategy::default())
    }
}

impl Blacklist {
    pub fn new(config: &BlackListConfig) -> Result<Self, ConfigError> {
        let (append, remove) = config.build()?;
        Ok(Self::with_strategies(append, remove))
    }

    pub fn with_strategies(append: AppendStrategy, remove: RemoveStrategy) -> Self {
        Self {
            entries: DashMap::new(),
            failures: DashMap::new(),
            append,
            remove,
        }
    }

    pub fn append_strategy(&self) -> AppendStrategy {
        self.append
    }

    pub fn remove_strategy(&self) -> RemoveStrategy {
        self.remove
    }

    /// Current state of `host`, dropping the entry first if it has recovered
    pub fn state_of(&self, host: &HostAddress, now: Instant) -> Option<HostState> {
        let remove = self.remove;
        if self
            .entries
            .remove_if(host, |_, info| remove.should_remove(info, now))
            .is_some()
        {
            info!("Host {} recovered from blacklist", host);
        }
        self.entries.get(host).map(|info| info.state)
    }

    pub fn is_black(&self, host: &HostAddress, now: Instant) -> bool {
        self.state_of(host, now) == Some(HostState::Black)
    }

    /// True iff every host is present and BLACK
    pub fn all_black<'a, I>(&self, hosts: I, now: Instant) -> bool
    where
        I: IntoIterator<Item = &'a HostAddress>,
    {
        hosts.into_iter().all(|host| self.is_black(host, now))
    }

    /// Failure feedback: apply the append strategy and return the host's new state.
    ///
    /// Every failure refreshes the entry's timestamp, including on a host that
    /// is already BLACK, so TimeoutRecover counts from the most recent failure.
    /// Repeated fall-through attempts on a dead host keep it blacklisted.
    pub fn record_failure(&self, host: &HostAddress, now: Instant) -> HostState {
        let target = match self.append {
            AppendStrategy::Normal => HostState::Black,
            AppendStrategy::RetryDuration {
                retry_times,
                duration,
            } => {
                let mut records = self.failures.entry(host.clone()).or_default();
                records.push_back(now);
                while let Some(oldest) = records.front() {
                    if now.saturating_duration_since(*oldest) > duration {
                        records.pop_front();
                    } else {
                        break;
                    }
                }
                if records.len() >= retry_times {
                    records.clear();
                    HostState::Black
                } else {
                    HostState::Grey
                }
            }
        };

        // never downgrade an existing BLACK entry
        let state = {
            let mut entry = self.entries.entry(host.clone()).or_insert(HostStateInfo {
                state: target,
                timestamp: now,
            });
            entry.state = entry.state.max(target);
            entry.timestamp = now;
            entry.state
        };

        match state {
            HostState::Black => info!("Host {} blacklisted ({})", host, self.append.name()),
            HostState::Grey => debug!("Host {} greylisted", host),
        }
        state
    }

    /// Success feedback: forget the host's failure history
    pub fn notify_success(&self, host: &HostAddress) {
        self.failures.remove(host);
    }

    /// Drop the entry of `host` regardless of the remove strategy
    pub fn reset(&self, host: &HostAddress) {
        if self.entries.remove(host).is_some() {
            info!("Host {} removed from blacklist after successful connection", host);
        }
        self.failures.remove(host);
    }

    /// Apply the remove strategy to every entry, returning how many left
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        let remove = self.remove;
        self.entries.retain(|host, info| {
            let keep = !remove.should_remove(info, now);
            if !keep {
                info!("Host {} recovered from blacklist", host);
            }
            keep
        });
        if let AppendStrategy::RetryDuration { duration, .. } = self.append {
            self.failures.retain(|_, records| {
                records.retain(|t| now.saturating_duration_since(*t) <= duration);
                !records.is_empty()
            });
        }
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, for diagnostics
    pub fn snapshot(&self) -> Vec<(HostAddress, HostStateInfo)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Periodically apply the remove strategy in the background
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let blacklist = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let recovered = blacklist.sweep(Instant::now());
                if recovered > 0 {
                    debug!("Blacklist sweep recovered {} hosts", recovered);
                }
            }
        })
    }
}
