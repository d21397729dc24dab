//! Masternode activation state machine.
//!
//! `Funded -> BroadcastPrepared -> Activating -> LocallyActive -> ClusterVisible`
//!
//! Each transition is one method on [`MasternodeActivation`]; an operation
//! issued in the wrong phase fails with [`HarnessError::InvalidPhase`]. The
//! two waits are [`Cluster::wait_for_predicate_with_stall`] with the logical
//! clock as the stall action.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::convergence::Poll;
use crate::error::{HarnessError, HarnessResult};
use crate::process::NodeHandle;
use crate::rpc::{FundsAllocation, MasternodeSetup, MasternodeStatus, MASTERNODE_STARTED};

pub const STARTED_MESSAGE: &str = "Masternode successfully started";
pub const ENABLED: &str = "ENABLED";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivationPhase {
    Funded,
    BroadcastPrepared,
    Activating,
    LocallyActive,
    ClusterVisible,
}

/// One `masternode.conf` line: `alias ip:port privkey txid vout`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasternodeConfigLine {
    pub alias: String,
    pub address: String,
    pub privkey: String,
    pub txid: String,
    pub vout: u32,
}

impl FromStr for MasternodeConfigLine {
    type Err = HarnessError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = line.split(' ').collect();
        let [alias, address, privkey, txid, vout] = parts.as_slice() else {
            return Err(HarnessError::InvalidConfigLine(line.to_string()));
        };
        let vout = vout
            .parse()
            .map_err(|_| HarnessError::InvalidConfigLine(line.to_string()))?;
        Ok(Self {
            alias: alias.to_string(),
            address: address.to_string(),
            privkey: privkey.to_string(),
            txid: txid.to_string(),
            vout,
        })
    }
}

impl fmt::Display for MasternodeConfigLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.alias, self.address, self.privkey, self.txid, self.vout
        )
    }
}

/// How the waits drive a stuck activation forward.
#[derive(Clone, Copy, Debug)]
pub struct ActivationPolicy {
    pub poll: Poll,
    /// Seconds the logical clock advances per stalled round.
    pub tick: u64,
    /// Stalled rounds between `mnsync reset` calls on lagging observers.
    pub reset_after: u32,
    /// Resets allowed before giving up with `StallDetected`; `None` never gives up.
    pub max_resets: Option<u32>,
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        Self {
            poll: Poll::forever(Duration::from_millis(50)),
            tick: 1,
            reset_after: 10,
            max_resets: Some(10),
        }
    }
}

/// Where the signed activation message goes out from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastOrigin {
    Control,
    Host,
}

#[derive(Clone, Debug)]
enum PreparedBroadcast {
    /// Unsigned payload plus the control node's signature over `message_to_sign`.
    Signed { data: String, signature: String },
    /// Fully signed payload produced by `startmasternode <alias> true`.
    Stored { data: String },
}

#[derive(Clone, Debug)]
pub struct MasternodeActivation {
    alias: String,
    tier: String,
    control: usize,
    host: usize,
    collateral: FundsAllocation,
    collateral_address: String,
    setup: Option<MasternodeSetup>,
    config: Option<MasternodeConfigLine>,
    broadcast: Option<PreparedBroadcast>,
    phase: ActivationPhase,
}

impl MasternodeActivation {
    /// Allocates collateral on `control` and waits for it to reach every mempool.
    pub fn fund(
        cluster: &mut Cluster,
        control: usize,
        host: usize,
        alias: &str,
        tier: &str,
    ) -> HarnessResult<Self> {
        let collateral = cluster.rpc(control)?.allocate_funds(alias, tier)?;
        let activation = Self::from_collateral(cluster, control, host, alias, tier, collateral)?;
        cluster.sync_mempools(&cluster.present_indices())?;
        Ok(activation)
    }

    /// Tracks collateral the caller already holds; no mempool sync is needed.
    pub fn from_collateral(
        cluster: &Cluster,
        control: usize,
        host: usize,
        alias: &str,
        tier: &str,
        collateral: FundsAllocation,
    ) -> HarnessResult<Self> {
        cluster.node(host)?;
        let tx = cluster.rpc(control)?.get_raw_transaction(&collateral.txhash)?;
        let output = tx
            .vout
            .iter()
            .find(|out| out.n == collateral.vout)
            .ok_or_else(|| {
                HarnessError::Protocol(format!(
                    "collateral {}:{} has no such output",
                    collateral.txhash, collateral.vout
                ))
            })?;
        let [address] = output.script_pub_key.addresses.as_slice() else {
            return Err(HarnessError::Protocol(format!(
                "collateral {}:{} should pay exactly one address",
                collateral.txhash, collateral.vout
            )));
        };
        info!(alias, tier, txhash = %collateral.txhash, vout = collateral.vout, "collateral funded");
        Ok(Self {
            alias: alias.to_string(),
            tier: tier.to_string(),
            control,
            host,
            collateral_address: address.clone(),
            collateral,
            setup: None,
            config: None,
            broadcast: None,
            phase: ActivationPhase::Funded,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn phase(&self) -> ActivationPhase {
        self.phase
    }

    pub fn host(&self) -> usize {
        self.host
    }

    pub fn control(&self) -> usize {
        self.control
    }

    pub fn collateral(&self) -> &FundsAllocation {
        &self.collateral
    }

    pub fn config_line(&self) -> Option<&MasternodeConfigLine> {
        self.config.as_ref()
    }

    pub fn setup(&self) -> Option<&MasternodeSetup> {
        self.setup.as_ref()
    }

    /// Arguments a host node needs to run this masternode.
    pub fn host_args(&self) -> Vec<String> {
        vec![format!("-masternode={}", self.alias)]
    }

    /// Builds the activation message on the host and signs it on the control node.
    pub fn prepare(&mut self, cluster: &Cluster) -> HarnessResult<&MasternodeConfigLine> {
        self.expect_phase(ActivationPhase::Funded)?;
        let control = cluster.rpc(self.control)?;
        let host = cluster.node(self.host)?;
        let pubkey = control
            .validate_address(&self.collateral_address)?
            .pubkey
            .ok_or_else(|| {
                HarnessError::Protocol(format!(
                    "no pubkey for collateral address {}",
                    self.collateral_address
                ))
            })?;
        let setup = host.rpc().setup_masternode(
            &self.alias,
            &self.collateral.txhash,
            self.collateral.vout,
            &pubkey,
            &host.p2p_address(),
        )?;
        let config: MasternodeConfigLine = setup.config_line.parse()?;
        let signature = control.sign_message(&self.collateral_address, &setup.message_to_sign)?;
        self.broadcast = Some(PreparedBroadcast::Signed {
            data: setup.broadcast_data.clone(),
            signature,
        });
        self.setup = Some(setup);
        self.phase = ActivationPhase::BroadcastPrepared;
        info!(alias = %self.alias, host = self.host, "broadcast prepared");
        Ok(&*self.config.insert(config))
    }

    /// Cold/hot preparation: the control node, which must run with this
    /// masternode's line in its `masternode.conf`, signs the broadcast without
    /// relaying it.
    pub fn prepare_stored(
        &mut self,
        cluster: &Cluster,
        config: MasternodeConfigLine,
    ) -> HarnessResult<()> {
        self.expect_phase(ActivationPhase::Funded)?;
        let outcome = cluster.rpc(self.control)?.start_masternode(&self.alias, true)?;
        let data = outcome.broadcast_data.filter(|_| outcome.status == "success");
        let Some(data) = data else {
            return Err(HarnessError::Protocol(format!(
                "startmasternode {} returned status {}",
                self.alias, outcome.status
            )));
        };
        self.broadcast = Some(PreparedBroadcast::Stored { data });
        self.config = Some(config);
        self.phase = ActivationPhase::BroadcastPrepared;
        info!(alias = %self.alias, "stored broadcast prepared");
        Ok(())
    }

    /// Signed payload as produced by `signmnbroadcast`, ready for import.
    pub fn signed_broadcast(&self, cluster: &Cluster) -> HarnessResult<String> {
        match &self.broadcast {
            Some(PreparedBroadcast::Stored { data }) => Ok(data.clone()),
            Some(PreparedBroadcast::Signed { data, .. }) => Ok(cluster
                .rpc(self.control)?
                .sign_mn_broadcast(data)?
                .broadcast_data),
            None => Err(self.phase_error(ActivationPhase::BroadcastPrepared)),
        }
    }

    /// Persists the signed broadcast on `node` so it survives restarts.
    pub fn import_on(&self, cluster: &Cluster, node: usize) -> HarnessResult<()> {
        let data = self.signed_broadcast(cluster)?;
        if !cluster.rpc(node)?.import_mn_broadcast(&data)? {
            return Err(HarnessError::Protocol(format!(
                "node {node} refused broadcast for {}",
                self.alias
            )));
        }
        Ok(())
    }

    pub fn broadcast(&mut self, cluster: &Cluster, origin: BroadcastOrigin) -> HarnessResult<()> {
        self.expect_phase(ActivationPhase::BroadcastPrepared)?;
        let sender = match origin {
            BroadcastOrigin::Control => self.control,
            BroadcastOrigin::Host => self.host,
        };
        let rpc = cluster.rpc(sender)?;
        let outcome = match &self.broadcast {
            Some(PreparedBroadcast::Signed { data, signature }) => {
                rpc.broadcast_start_masternode(data, Some(signature))?
            }
            Some(PreparedBroadcast::Stored { data }) => rpc.broadcast_start_masternode(data, None)?,
            None => return Err(self.phase_error(ActivationPhase::BroadcastPrepared)),
        };
        self.expect_success("broadcaststartmasternode", &outcome.status)?;
        self.phase = ActivationPhase::Activating;
        info!(alias = %self.alias, node = sender, "activation broadcast sent");
        Ok(())
    }

    /// Hot node relays the broadcast it imported earlier.
    pub fn start_stored(&mut self, cluster: &Cluster) -> HarnessResult<()> {
        self.expect_phase(ActivationPhase::BroadcastPrepared)?;
        let outcome = cluster.rpc(self.host)?.start_masternode(&self.alias, false)?;
        self.expect_success("startmasternode", &outcome.status)?;
        self.phase = ActivationPhase::Activating;
        info!(alias = %self.alias, host = self.host, "stored broadcast started");
        Ok(())
    }

    /// Host's own view; anything short of "started" with our collateral is
    /// `NotYetActive`.
    pub fn status(&self, cluster: &Cluster) -> HarnessResult<MasternodeStatus> {
        self.host_status(cluster.node(self.host)?)
    }

    fn host_status(&self, host: &NodeHandle) -> HarnessResult<MasternodeStatus> {
        let status = match host.rpc().get_masternode_status() {
            Ok(status) => status,
            Err(HarnessError::RemoteCall { message, .. }) => {
                return Err(self.not_active(message));
            }
            Err(err) => return Err(err),
        };
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| self.phase_error(ActivationPhase::BroadcastPrepared))?;
        if status.status != MASTERNODE_STARTED {
            return Err(self.not_active(format!("status {}: {}", status.status, status.message)));
        }
        if status.txhash != config.txid || status.outputidx != config.vout {
            return Err(self.not_active(format!(
                "host runs collateral {}:{}",
                status.txhash, status.outputidx
            )));
        }
        Ok(status)
    }

    pub fn wait_locally_active(
        &mut self,
        cluster: &mut Cluster,
        policy: &ActivationPolicy,
    ) -> HarnessResult<()> {
        if self.phase >= ActivationPhase::LocallyActive {
            return Ok(());
        }
        self.expect_phase(ActivationPhase::Activating)?;
        let host = self.host;
        require_nodes(cluster, &[host], "local activation")?;
        let this = &*self;
        let budget = policy
            .reset_after
            .saturating_mul(policy.max_resets.unwrap_or(u32::MAX).saturating_add(1));
        let converged = cluster.wait_for_predicate_with_stall(
            &[host],
            policy.poll,
            |nodes| match nodes {
                [node] => this.host_status(node).map(|_| true),
                _ => Err(HarnessError::InvalidNodeReference(host)),
            },
            |cluster, attempt| {
                if attempt >= budget {
                    return Err(HarnessError::StallDetected {
                        alias: this.alias.clone(),
                        attempts: attempt,
                    });
                }
                cluster.advance_by(policy.tick).map(|_| ())
            },
        )?;
        self.finish_wait(converged, policy, "local activation")?;
        self.phase = ActivationPhase::LocallyActive;
        info!(alias = %self.alias, "masternode locally active");
        Ok(())
    }

    /// Waits until every observer lists this masternode as enabled.
    ///
    /// Observers that still miss it after each `reset_after` stalled rounds get
    /// `mnsync reset`. Nothing proves the reset always unsticks a sync, so the
    /// number of resets is bounded by the policy.
    pub fn wait_cluster_visible(
        &mut self,
        cluster: &mut Cluster,
        observers: &[usize],
        policy: &ActivationPolicy,
    ) -> HarnessResult<()> {
        if self.phase == ActivationPhase::ClusterVisible {
            return Ok(());
        }
        self.expect_phase(ActivationPhase::LocallyActive)?;
        require_nodes(cluster, observers, "cluster visibility")?;
        let this = &*self;
        let mut resets = 0u32;
        let converged = cluster.wait_for_predicate_with_stall(
            observers,
            policy.poll,
            |nodes| {
                all_present(observers, nodes)?;
                for node in nodes {
                    if !this.is_enabled_on(node)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            },
            |cluster, attempt| {
                cluster.advance_by(policy.tick)?;
                if policy.reset_after == 0 || attempt % policy.reset_after != 0 {
                    return Ok(());
                }
                if policy.max_resets.is_some_and(|max| resets >= max) {
                    return Err(HarnessError::StallDetected {
                        alias: this.alias.clone(),
                        attempts: attempt,
                    });
                }
                resets += 1;
                for node in cluster.present_nodes(observers) {
                    match this.is_enabled_on(node) {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(err) => {
                            debug!(alias = %this.alias, node = node.index(), %err, "masternode list unreadable");
                        }
                    }
                    warn!(alias = %this.alias, node = node.index(), attempt, "masternode list stalled, resetting sync");
                    node.rpc().mnsync_reset()?;
                }
                Ok(())
            },
        )?;
        self.finish_wait(converged, policy, "cluster visibility")?;
        self.phase = ActivationPhase::ClusterVisible;
        info!(alias = %self.alias, ?observers, "masternode enabled across observers");
        Ok(())
    }

    /// The host stopped: its in-memory list is gone. A prepared broadcast can
    /// be sent again, otherwise the activation restarts from its collateral.
    pub fn host_restarted(&mut self) {
        self.phase = if self.broadcast.is_some() {
            ActivationPhase::BroadcastPrepared
        } else {
            ActivationPhase::Funded
        };
    }

    fn is_enabled_on(&self, node: &NodeHandle) -> HarnessResult<bool> {
        let list = node.rpc().list_masternodes()?;
        Ok(list.iter().any(|entry| {
            entry.txhash == self.collateral.txhash
                && entry.outidx == self.collateral.vout
                && entry.status == ENABLED
        }))
    }

    fn finish_wait(
        &self,
        converged: bool,
        policy: &ActivationPolicy,
        what: &str,
    ) -> HarnessResult<()> {
        if converged {
            return Ok(());
        }
        Err(HarnessError::ConvergenceTimeout {
            what: format!("{what} of masternode {}", self.alias),
            waited: policy.poll.timeout.unwrap_or_default(),
        })
    }

    fn expect_phase(&self, expected: ActivationPhase) -> HarnessResult<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(self.phase_error(expected))
        }
    }

    fn expect_success(&self, call: &str, status: &str) -> HarnessResult<()> {
        if status == "success" {
            Ok(())
        } else {
            Err(HarnessError::Protocol(format!(
                "{call} for {} returned status {status}",
                self.alias
            )))
        }
    }

    fn phase_error(&self, expected: ActivationPhase) -> HarnessError {
        HarnessError::InvalidPhase {
            alias: self.alias.clone(),
            expected,
            actual: self.phase,
        }
    }

    fn not_active(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::NotYetActive {
            alias: self.alias.clone(),
            reason: reason.into(),
        }
    }
}

/// Blocks until `mnsync status` reports a finished sync on every node,
/// ticking the logical clock between rounds.
pub fn wait_for_mnsync(
    cluster: &mut Cluster,
    nodes: &[usize],
    policy: &ActivationPolicy,
) -> HarnessResult<()> {
    require_nodes(cluster, nodes, "masternode sync")?;
    let converged = cluster.wait_for_predicate_with_stall(
        nodes,
        policy.poll,
        |handles| {
            all_present(nodes, handles)?;
            for node in handles {
                if !node.rpc().mnsync_status()?.is_finished() {
                    return Ok(false);
                }
            }
            Ok(true)
        },
        |cluster, _| cluster.advance_by(policy.tick).map(|_| ()),
    )?;
    if converged {
        Ok(())
    } else {
        Err(HarnessError::ConvergenceTimeout {
            what: format!("masternode sync on nodes {nodes:?}"),
            waited: policy.poll.timeout.unwrap_or_default(),
        })
    }
}

/// A wait over nodes that are not running would pass without checking anything.
fn require_nodes(cluster: &Cluster, indices: &[usize], what: &str) -> HarnessResult<()> {
    if indices.is_empty() {
        return Err(HarnessError::EmptyNodeSet(what.to_string()));
    }
    for &index in indices {
        cluster.node(index)?;
    }
    Ok(())
}

/// Fails with the first of `indices` that left the cluster since the wait began.
fn all_present(indices: &[usize], nodes: &[&NodeHandle]) -> HarnessResult<()> {
    match indices
        .iter()
        .find(|&&index| !nodes.iter().any(|node| node.index() == index))
    {
        Some(&missing) => Err(HarnessError::InvalidNodeReference(missing)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    fn activation(phase: ActivationPhase) -> MasternodeActivation {
        MasternodeActivation {
            alias: "mn1".to_string(),
            tier: "COPPER".to_string(),
            control: 0,
            host: 1,
            collateral: FundsAllocation {
                txhash: "3f2a9c".to_string(),
                vout: 0,
            },
            collateral_address: "yCollateral".to_string(),
            setup: None,
            config: None,
            broadcast: None,
            phase,
        }
    }

    fn empty_cluster() -> Cluster {
        Cluster::new(HarnessConfig::with_tmpdir("/tmp/unused"))
    }

    #[test]
    fn visibility_needs_running_observers() {
        let mut cluster = empty_cluster();
        let mut mn = activation(ActivationPhase::LocallyActive);
        let err = mn
            .wait_cluster_visible(&mut cluster, &[2, 3], &ActivationPolicy::default())
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidNodeReference(2)));
        assert_eq!(mn.phase(), ActivationPhase::LocallyActive);
    }

    #[test]
    fn visibility_needs_at_least_one_observer() {
        let mut cluster = empty_cluster();
        let mut mn = activation(ActivationPhase::LocallyActive);
        let err = mn
            .wait_cluster_visible(&mut cluster, &[], &ActivationPolicy::default())
            .unwrap_err();
        assert!(matches!(err, HarnessError::EmptyNodeSet(_)));
        assert_eq!(mn.phase(), ActivationPhase::LocallyActive);
    }

    #[test]
    fn local_activation_needs_a_running_host() {
        let mut cluster = empty_cluster();
        let mut mn = activation(ActivationPhase::Activating);
        let err = mn
            .wait_locally_active(&mut cluster, &ActivationPolicy::default())
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidNodeReference(1)));
        assert_eq!(mn.phase(), ActivationPhase::Activating);
        assert!(!cluster.clock().engaged());
    }

    #[test]
    fn mnsync_wait_rejects_absent_and_empty_sets() {
        let mut cluster = empty_cluster();
        let policy = ActivationPolicy::default();
        assert!(matches!(
            wait_for_mnsync(&mut cluster, &[0], &policy),
            Err(HarnessError::InvalidNodeReference(0))
        ));
        assert!(matches!(
            wait_for_mnsync(&mut cluster, &[], &policy),
            Err(HarnessError::EmptyNodeSet(_))
        ));
    }

    #[test]
    fn membership_check_names_the_missing_index() {
        assert!(all_present(&[], &[]).is_ok());
        assert!(matches!(
            all_present(&[4, 5], &[]),
            Err(HarnessError::InvalidNodeReference(4))
        ));
    }

    #[test]
    fn config_line_round_trips_through_display() {
        let line = "mn1 127.0.0.1:11005 cTfc2pQm5v 3f2a9c 1";
        let parsed: MasternodeConfigLine = line.parse().unwrap();
        assert_eq!(parsed.alias, "mn1");
        assert_eq!(parsed.address, "127.0.0.1:11005");
        assert_eq!(parsed.vout, 1);
        assert_eq!(parsed.to_string(), line);
    }

    #[test]
    fn config_line_needs_five_fields() {
        assert!(matches!(
            "mn1 127.0.0.1:11005 key txid".parse::<MasternodeConfigLine>(),
            Err(HarnessError::InvalidConfigLine(_))
        ));
        assert!(matches!(
            "mn1 127.0.0.1:11005 key txid one".parse::<MasternodeConfigLine>(),
            Err(HarnessError::InvalidConfigLine(_))
        ));
    }

    #[test]
    fn phases_are_ordered() {
        assert!(ActivationPhase::Funded < ActivationPhase::BroadcastPrepared);
        assert!(ActivationPhase::Activating < ActivationPhase::LocallyActive);
        assert!(ActivationPhase::LocallyActive < ActivationPhase::ClusterVisible);
    }

    #[test]
    fn restart_falls_back_to_prepared_broadcast() {
        let mut activation = MasternodeActivation {
            alias: "mn1".into(),
            tier: "copper".into(),
            control: 0,
            host: 1,
            collateral: FundsAllocation {
                txhash: "ab".repeat(32),
                vout: 1,
            },
            collateral_address: "yCollateral".into(),
            setup: None,
            config: None,
            broadcast: None,
            phase: ActivationPhase::Activating,
        };
        activation.host_restarted();
        assert_eq!(activation.phase(), ActivationPhase::Funded);
        activation.broadcast = Some(PreparedBroadcast::Stored {
            data: "00".into(),
        });
        activation.phase = ActivationPhase::ClusterVisible;
        activation.host_restarted();
        assert_eq!(activation.phase(), ActivationPhase::BroadcastPrepared);
    }
}
