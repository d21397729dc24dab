//! Peer links between cluster nodes.
//!
//! A link is only usable once the version handshake finished, so `connect`
//! polls `getpeerinfo` until the peer reports a non-zero protocol version.
//! Partitions are produced by restarting nodes and reconnecting only the
//! declared links that stay inside a group; the daemon does not remember
//! peers across restarts.

use std::time::Duration;

use tracing::info;

use crate::cluster::Cluster;
use crate::convergence::poll_loop;
use crate::error::{HarnessError, HarnessResult};
use crate::rpc::AddNodeCommand;

fn link(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl Cluster {
    /// Makes `from` add `to` as a peer and blocks until the handshake completed.
    pub fn connect(&mut self, from: usize, to: usize) -> HarnessResult<()> {
        self.connect_within(from, to, None)
    }

    pub fn connect_within(
        &mut self,
        from: usize,
        to: usize,
        timeout: Option<Duration>,
    ) -> HarnessResult<()> {
        let target = self.node(to)?.p2p_address();
        let source = self.node(from)?;
        source.rpc().add_node(&target, AddNodeCommand::OneTry)?;
        let poll = self.poll().with_timeout(timeout);
        let done = poll_loop(poll, |_| {
            let peers = match source.rpc().get_peer_info() {
                Ok(peers) => peers,
                Err(err) if err.is_transient() => return Ok(false),
                Err(err) => return Err(err),
            };
            Ok(peers
                .iter()
                .any(|peer| peer.addr == target && peer.version != 0))
        })?;
        if !done {
            return Err(HarnessError::ConvergenceTimeout {
                what: format!("handshake from node {from} to node {to}"),
                waited: timeout.unwrap_or_default(),
            });
        }
        self.links.insert(link(from, to));
        info!(from, to, "peer handshake complete");
        Ok(())
    }

    pub fn connect_bidirectional(&mut self, a: usize, b: usize) -> HarnessResult<()> {
        self.connect(a, b)?;
        self.connect(b, a)
    }

    /// Links declared so far, as unordered pairs.
    pub fn declared_links(&self) -> Vec<(usize, usize)> {
        self.links.iter().copied().collect()
    }

    /// Default four node chain `0-1-2-3`. Unless `split`, the joint `1-2` is
    /// connected and synced first so that the halves reorganise from the
    /// middle outward.
    pub fn setup_network(&mut self, split: bool) -> HarnessResult<()> {
        if !split {
            self.connect_bidirectional(1, 2)?;
            self.sync_blocks(&[1, 2])?;
            self.sync_mempools(&[1, 2])?;
        }
        self.connect_bidirectional(0, 1)?;
        self.connect_bidirectional(2, 3)?;
        if split {
            self.links.insert(link(1, 2));
            self.partition = Some((vec![0, 1], vec![2, 3]));
        } else {
            self.partition = None;
        }
        self.sync_all()
    }

    /// Splits the cluster so no declared link crosses between the two groups.
    ///
    /// Every present node is restarted with its original arguments, the
    /// logical time is pushed again and only intra-group links are restored.
    pub fn partition(&mut self, group_a: &[usize], group_b: &[usize]) -> HarnessResult<()> {
        for index in group_a.iter().chain(group_b) {
            self.node(*index)?;
        }
        self.restart_present()?;
        let inside = |(a, b): &(usize, usize)| {
            (group_a.contains(a) && group_a.contains(b))
                || (group_b.contains(a) && group_b.contains(b))
        };
        let keep: Vec<(usize, usize)> = self.links.iter().copied().filter(inside).collect();
        self.reconnect(&keep)?;
        self.partition = Some((group_a.to_vec(), group_b.to_vec()));
        info!(?group_a, ?group_b, "cluster partitioned");
        Ok(())
    }

    /// Restores every declared link. Links across the former boundary come
    /// first so both halves reorganise onto the same tip.
    pub fn heal(&mut self) -> HarnessResult<()> {
        let Some((group_a, group_b)) = self.partition.clone() else {
            return Ok(());
        };
        self.restart_present()?;
        let crosses = |(a, b): &(usize, usize)| group_a.contains(a) != group_a.contains(b);
        let (mut ordered, rest): (Vec<_>, Vec<_>) = self.links.iter().copied().partition(crosses);
        ordered.extend(rest);
        self.reconnect(&ordered)?;
        self.partition = None;
        info!(?group_a, ?group_b, "cluster healed");
        Ok(())
    }

    fn restart_present(&mut self) -> HarnessResult<()> {
        let present = self.present_indices();
        let mut launches = Vec::with_capacity(present.len());
        for index in &present {
            launches.push((*index, self.node(*index)?.launch().clone()));
        }
        for index in &present {
            self.stop_node(*index)?;
        }
        for (index, launch) in launches {
            self.launch(index, launch)?;
        }
        Ok(())
    }

    fn reconnect(&mut self, links: &[(usize, usize)]) -> HarnessResult<()> {
        for (a, b) in links {
            if self.is_present(*a) && self.is_present(*b) {
                self.connect_bidirectional(*a, *b)?;
            }
        }
        Ok(())
    }
}
