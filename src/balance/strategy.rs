/// Host ordering strategies inside one address group
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{HostAddress, LoadBalanceHostAddress};
use crate::error::{ConfigError, DriverResult};
use crate::health::{Blacklist, HostState};

/// Algorithm ordering the hosts of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BalanceStrategy {
    /// Uniform shuffle
    #[default]
    Random,
    /// Configured order, starting one host further on each call
    Rotation,
    /// Weighted random permutation
    ServerAffinity,
}

impl BalanceStrategy {
    pub fn name(self) -> &'static str {
        match self {
            BalanceStrategy::Random => "Random",
            BalanceStrategy::Rotation => "Rotation",
            BalanceStrategy::ServerAffinity => "ServerAffinity",
        }
    }

    /// Candidate hosts in the order they should be tried.
    ///
    /// `None` when every host is BLACK. Otherwise BLACK hosts are dropped and
    /// GREY ones kept. `rotation` is the group's call counter.
    pub fn order(
        self,
        hosts: &[LoadBalanceHostAddress],
        blacklist: &Blacklist,
        rotation: &AtomicUsize,
        now: Instant,
    ) -> DriverResult<Option<Vec<HostAddress>>> {
        if blacklist.all_black(hosts.iter().map(|h| &h.address), now) {
            return Ok(None);
        }

        let ordered: Vec<&LoadBalanceHostAddress> = match self {
            BalanceStrategy::Random => {
                let mut list: Vec<_> = hosts.iter().collect();
                list.shuffle(&mut rand::thread_rng());
                list
            }
            BalanceStrategy::Rotation => {
                let mut list: Vec<_> = hosts.iter().collect();
                if !list.is_empty() {
                    let start = rotation.fetch_add(1, Ordering::Relaxed) % list.len();
                    list.rotate_left(start);
                }
                list
            }
            BalanceStrategy::ServerAffinity => weighted_permutation(hosts, &mut rand::thread_rng())?,
        };

        Ok(Some(
            ordered
                .into_iter()
                .filter(|h| blacklist.state_of(&h.address, now) != Some(HostState::Black))
                .map(|h| h.address.clone())
                .collect(),
        ))
    }
}

/// Weighted sampling without replacement
pub fn weighted_permutation<'a, R: Rng>(
    hosts: &'a [LoadBalanceHostAddress],
    rng: &mut R,
) -> DriverResult<Vec<&'a LoadBalanceHostAddress>> {
    let total: u64 = hosts.iter().map(|h| u64::from(h.weight)).sum();
    if total == 0 {
        return Err(ConfigError::ValidationError(
            "ServerAffinity requires a positive total weight".to_string(),
        )
        .into());
    }

    let mut remaining: Vec<&LoadBalanceHostAddress> = hosts.iter().collect();
    let mut remaining_weight = total;
    let mut ordered = Vec::with_capacity(hosts.len());

    while remaining_weight > 0 {
        let mut point = rng.gen_range(0..remaining_weight);
        let index = remaining
            .iter()
            .position(|h| {
                let weight = u64::from(h.weight);
                if point < weight {
                    true
                } else {
                    point -= weight;
                    false
                }
            })
            .unwrap_or(remaining.len() - 1);
        let chosen = remaining.remove(index);
        remaining_weight -= u64::from(chosen.weight);
        ordered.push(chosen);
    }
    // zero-weight hosts go last, in configured order
    ordered.extend(remaining);
    Ok(ordered)
}

impl fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BalanceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Random" | "random" => Ok(BalanceStrategy::Random),
            "Rotation" | "rotation" => Ok(BalanceStrategy::Rotation),
            "ServerAffinity" | "serverAffinity" | "server_affinity" => {
                Ok(BalanceStrategy::ServerAffinity)
            }
            other => Err(ConfigError::ValidationError(format!(
                "unknown load balance strategy '{other}'"
            ))),
        }
    }
}
