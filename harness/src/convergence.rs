//! Polling loops that block until a predicate holds across a node set.
//!
//! Relay between daemons is asynchronous, so cross-node assertions go through
//! one of these waits first. Every wait takes an explicit [`Poll`]: the
//! interval between rounds and an optional deadline. Without a deadline the
//! wait blocks until the predicate holds.

use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cluster::Cluster;
use crate::error::{HarnessError, HarnessResult};
use crate::process::NodeHandle;
use crate::rpc::MasternodeEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poll {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Poll {
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    pub fn within(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Runs `round(n)` for n = 0, 1, ... until it yields `true` (returns `true`)
/// or the deadline passes (returns `false`).
pub(crate) fn poll_loop<F>(poll: Poll, mut round: F) -> HarnessResult<bool>
where
    F: FnMut(u32) -> HarnessResult<bool>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        if round(attempt)? {
            return Ok(true);
        }
        if poll.timeout.is_some_and(|limit| started.elapsed() >= limit) {
            return Ok(false);
        }
        thread::sleep(poll.interval);
        attempt = attempt.saturating_add(1);
    }
}

/// Transient failures count as "not converged"; anything else aborts the wait.
fn settle(result: HarnessResult<bool>) -> HarnessResult<bool> {
    match result {
        Err(err) if err.is_transient() => {
            debug!(%err, "poll round inconclusive");
            Ok(false)
        }
        other => other,
    }
}

pub fn all_equal<T: PartialEq>(values: &[T]) -> bool {
    values.windows(2).all(|pair| pair[0] == pair[1])
}

impl Cluster {
    /// Polls `predicate` over the present nodes among `indices`.
    pub fn wait_for_predicate<P>(
        &self,
        indices: &[usize],
        poll: Poll,
        mut predicate: P,
    ) -> HarnessResult<bool>
    where
        P: FnMut(&[&NodeHandle]) -> HarnessResult<bool>,
    {
        poll_loop(poll, |_| {
            let nodes = self.present_nodes(indices);
            settle(predicate(&nodes))
        })
    }

    /// Like [`Cluster::wait_for_predicate`], calling `on_stall(cluster, attempt)`
    /// between unsuccessful rounds so the caller can push the cluster forward,
    /// e.g. by advancing the logical clock.
    pub fn wait_for_predicate_with_stall<P, S>(
        &mut self,
        indices: &[usize],
        poll: Poll,
        mut predicate: P,
        mut on_stall: S,
    ) -> HarnessResult<bool>
    where
        P: FnMut(&[&NodeHandle]) -> HarnessResult<bool>,
        S: FnMut(&mut Cluster, u32) -> HarnessResult<()>,
    {
        poll_loop(poll, |attempt| {
            if attempt > 0 {
                on_stall(&mut *self, attempt)?;
            }
            let nodes = self.present_nodes(indices);
            settle(predicate(&nodes))
        })
    }

    pub fn wait_for_equal_height(&self, indices: &[usize], poll: Poll) -> HarnessResult<bool> {
        self.wait_for_predicate(indices, poll, |nodes| {
            let heights = nodes
                .iter()
                .map(|node| node.rpc().get_block_count())
                .collect::<HarnessResult<Vec<_>>>()?;
            debug!(?heights, "heights");
            Ok(all_equal(&heights))
        })
    }

    pub fn wait_for_equal_mempool(&self, indices: &[usize], poll: Poll) -> HarnessResult<bool> {
        self.wait_for_predicate(indices, poll, |nodes| {
            let pools = nodes
                .iter()
                .map(|node| {
                    node.rpc()
                        .get_raw_mempool()
                        .map(|txids| txids.into_iter().collect::<BTreeSet<_>>())
                })
                .collect::<HarnessResult<Vec<_>>>()?;
            Ok(all_equal(&pools))
        })
    }

    pub fn wait_for_equal_masternode_list(
        &self,
        indices: &[usize],
        poll: Poll,
    ) -> HarnessResult<bool> {
        self.wait_for_predicate(indices, poll, |nodes| {
            let lists = nodes
                .iter()
                .map(|node| {
                    node.rpc()
                        .list_masternodes()
                        .map(|list| list.into_iter().collect::<BTreeSet<MasternodeEntry>>())
                })
                .collect::<HarnessResult<Vec<_>>>()?;
            Ok(all_equal(&lists))
        })
    }

    /// Default poll for this cluster: configured interval, no deadline.
    pub fn poll(&self) -> Poll {
        Poll::forever(self.config().poll_interval)
    }

    /// Bounded height sync; a missed deadline is an error.
    pub fn sync_blocks(&self, indices: &[usize]) -> HarnessResult<()> {
        let timeout = self.config().effective_sync_timeout();
        let poll = self.poll().with_timeout(Some(timeout));
        if self.wait_for_equal_height(indices, poll)? {
            Ok(())
        } else {
            Err(HarnessError::ConvergenceTimeout {
                what: format!("equal height on nodes {indices:?}"),
                waited: timeout,
            })
        }
    }

    pub fn sync_mempools(&self, indices: &[usize]) -> HarnessResult<()> {
        let timeout = self.config().effective_sync_timeout();
        let poll = self.poll().with_timeout(Some(timeout));
        if self.wait_for_equal_mempool(indices, poll)? {
            Ok(())
        } else {
            Err(HarnessError::ConvergenceTimeout {
                what: format!("equal mempool on nodes {indices:?}"),
                waited: timeout,
            })
        }
    }

    /// Syncs the whole cluster, or each half separately while split.
    pub fn sync_all(&self) -> HarnessResult<()> {
        let groups: Vec<Vec<usize>> = match &self.partition {
            Some((left, right)) => vec![left.clone(), right.clone()],
            None => vec![self.present_indices()],
        };
        for group in &groups {
            self.sync_blocks(group)?;
        }
        for group in &groups {
            self.sync_mempools(group)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use std::cell::{Cell, RefCell};

    #[test]
    fn all_equal_handles_short_inputs() {
        assert!(all_equal::<u64>(&[]));
        assert!(all_equal(&[7]));
        assert!(all_equal(&[3, 3, 3]));
        assert!(!all_equal(&[3, 4, 3]));
    }

    #[test]
    fn poll_loop_stops_at_deadline() {
        let rounds = Cell::new(0);
        let converged = poll_loop(
            Poll::within(Duration::from_millis(5), Duration::from_millis(40)),
            |_| {
                rounds.set(rounds.get() + 1);
                Ok(false)
            },
        )
        .unwrap();
        assert!(!converged);
        assert!(rounds.get() >= 2);
    }

    #[test]
    fn poll_loop_without_deadline_waits_for_success() {
        let converged = poll_loop(Poll::forever(Duration::from_millis(1)), |attempt| {
            Ok(attempt == 25)
        })
        .unwrap();
        assert!(converged);
    }

    #[test]
    fn transient_errors_keep_polling_and_fatal_errors_abort() {
        let cluster = Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"));
        let calls = Cell::new(0);
        let converged = cluster
            .wait_for_predicate(&[0, 1], Poll::forever(Duration::from_millis(1)), |nodes| {
                assert!(nodes.is_empty());
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(HarnessError::Unreachable {
                        endpoint: "http://127.0.0.1:1/".into(),
                        reason: "refused".into(),
                    })
                } else {
                    Ok(true)
                }
            })
            .unwrap();
        assert!(converged);
        assert_eq!(calls.get(), 3);

        let err = cluster
            .wait_for_predicate(&[0], Poll::forever(Duration::from_millis(1)), |_| {
                Err(HarnessError::Assertion("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, HarnessError::Assertion(_)));
    }

    #[test]
    fn stall_callback_runs_between_rounds() {
        let mut cluster = Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"));
        let start = cluster.time();
        let stalls = RefCell::new(Vec::new());
        let converged = cluster
            .wait_for_predicate_with_stall(
                &[],
                Poll::forever(Duration::from_millis(1)),
                |_| Ok(stalls.borrow().len() >= 3),
                |cluster, attempt| {
                    stalls.borrow_mut().push(attempt);
                    cluster.advance_by(1).map(|_| ())
                },
            )
            .unwrap();
        assert!(converged);
        assert_eq!(*stalls.borrow(), vec![1, 2, 3]);
        assert_eq!(cluster.time(), start + 3);
    }
}
