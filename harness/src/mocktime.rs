//! Cluster-wide logical clock pushed to every node through `setmocktime`.

use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::error::{HarnessError, HarnessResult};

/// Default starting point: after the regtest genesis block, well before now.
pub const DEFAULT_MOCK_TIME: i64 = 1_580_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicalClock {
    now: i64,
    engaged: bool,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self {
            now: DEFAULT_MOCK_TIME,
            engaged: false,
        }
    }
}

impl LogicalClock {
    pub fn now(&self) -> i64 {
        self.now
    }

    /// True once any value was pushed; newly started nodes then receive it too.
    pub fn engaged(&self) -> bool {
        self.engaged
    }
}

impl Cluster {
    pub fn time(&self) -> i64 {
        self.clock.now()
    }

    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    pub fn advance_by(&mut self, delta: u64) -> HarnessResult<i64> {
        let current = self.clock.now();
        let target = i64::try_from(delta)
            .ok()
            .and_then(|delta| current.checked_add(delta))
            .ok_or(HarnessError::ClockOverflow { current, delta })?;
        self.set_absolute(target)?;
        Ok(target)
    }

    /// Sets the cluster time and pushes it to every present node.
    ///
    /// A node that cannot be reached is treated as crashed and evicted, so
    /// that every node left in the cluster agrees on the time. A node that
    /// rejects the call fails the whole operation after the others were
    /// updated.
    pub fn set_absolute(&mut self, timestamp: i64) -> HarnessResult<()> {
        if self.clock.engaged && timestamp < self.clock.now {
            return Err(HarnessError::ClockRegression {
                current: self.clock.now,
                requested: timestamp,
            });
        }
        self.clock = LogicalClock {
            now: timestamp,
            engaged: true,
        };
        self.push_time(&self.present_indices())
    }

    fn push_time(&mut self, indices: &[usize]) -> HarnessResult<()> {
        let timestamp = self.clock.now;
        let mut crashed = Vec::new();
        let mut rejected = None;
        for node in self.present_nodes(indices) {
            match node.rpc().set_mock_time(timestamp) {
                Ok(()) => {}
                Err(err @ HarnessError::Unreachable { .. }) => {
                    warn!(node = node.index(), %err, "node missed time update");
                    crashed.push(node.index());
                }
                Err(err) => {
                    rejected.get_or_insert(err);
                }
            }
        }
        for index in crashed {
            self.evict(index);
        }
        info!(time = timestamp, "mock time propagated");
        rejected.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    #[test]
    fn clock_starts_disengaged_at_default() {
        let cluster = Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"));
        assert_eq!(cluster.time(), DEFAULT_MOCK_TIME);
        assert!(!cluster.clock().engaged());
    }

    #[test]
    fn advancing_an_empty_cluster_composes() {
        let mut cluster = Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"));
        cluster.advance_by(10).unwrap();
        cluster.advance_by(20).unwrap();
        assert_eq!(cluster.time(), DEFAULT_MOCK_TIME + 30);
        assert!(cluster.clock().engaged());
    }

    #[test]
    fn overflowing_advance_leaves_the_clock_alone() {
        let mut cluster = Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"));
        let err = cluster.advance_by(u64::MAX).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ClockOverflow {
                current: DEFAULT_MOCK_TIME,
                delta: u64::MAX
            }
        ));
        assert!(matches!(
            cluster.advance_by(i64::MAX as u64),
            Err(HarnessError::ClockOverflow { .. })
        ));
        assert_eq!(cluster.time(), DEFAULT_MOCK_TIME);
        assert!(!cluster.clock().engaged());

        cluster.advance_by(5).unwrap();
        assert_eq!(cluster.time(), DEFAULT_MOCK_TIME + 5);
    }

    #[test]
    fn engaged_clock_refuses_to_go_back() {
        let mut cluster = Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"));
        cluster.set_absolute(2_000_000_000).unwrap();
        let err = cluster.set_absolute(1_900_000_000).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ClockRegression {
                current: 2_000_000_000,
                requested: 1_900_000_000
            }
        ));
        assert_eq!(cluster.time(), 2_000_000_000);
    }
}
