use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::mocktime::LogicalClock;
use crate::ports::PortAllocator;
use crate::process::{self, NodeHandle, NodeLaunch};
use crate::rpc::RpcClient;

/// A set of daemon nodes addressed by stable index.
///
/// Slots stay in place when a node stops, so indices remain valid for
/// the lifetime of the cluster. There is no process registry outside of this
/// value, which lets several clusters coexist in one process.
pub struct Cluster {
    config: HarnessConfig,
    ports: PortAllocator,
    slots: Vec<Option<NodeHandle>>,
    pub(crate) clock: LogicalClock,
    /// The two groups of the current partition, if any.
    pub(crate) partition: Option<(Vec<usize>, Vec<usize>)>,
    /// Undirected links declared through `connect*`, stored as `(low, high)`.
    pub(crate) links: BTreeSet<(usize, usize)>,
}

impl Cluster {
    pub fn new(config: HarnessConfig) -> Self {
        let ports = PortAllocator::new(config.port_seed);
        Self {
            config,
            ports,
            slots: Vec::new(),
            clock: LogicalClock::default(),
            partition: None,
            links: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn port_allocator(&self) -> PortAllocator {
        self.ports
    }

    pub fn start_node(
        &mut self,
        index: usize,
        extra_args: &[String],
        mn_config_lines: &[String],
    ) -> HarnessResult<&NodeHandle> {
        let launch = NodeLaunch {
            extra_args: extra_args.to_vec(),
            mn_config_lines: mn_config_lines.to_vec(),
        };
        self.launch(index, launch)
    }

    /// Starts nodes `0..count` with no extra arguments.
    pub fn start_nodes(&mut self, count: usize) -> HarnessResult<()> {
        for index in 0..count {
            self.start_node(index, &[], &[])?;
        }
        Ok(())
    }

    pub(crate) fn launch(&mut self, index: usize, launch: NodeLaunch) -> HarnessResult<&NodeHandle> {
        if self.is_present(index) {
            return Err(HarnessError::NodeAlreadyRunning(index));
        }
        let ports = self.ports.ports(index)?;
        let handle = process::spawn_node(&self.config, index, ports, launch)?;
        if self.clock.engaged() {
            handle.rpc().set_mock_time(self.clock.now())?;
        }
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        let handle = self.slots[index].insert(handle);
        Ok(&*handle)
    }

    /// Stops the node and leaves its slot empty. Stopping an empty slot is a no-op.
    pub fn stop_node(&mut self, index: usize) -> HarnessResult<()> {
        let Some(handle) = self.take(index) else {
            return Ok(());
        };
        process::shutdown_node(handle, self.config.shutdown_timeout)
    }

    /// Stops every present node, reporting the first failure after trying all.
    pub fn stop_all(&mut self) -> HarnessResult<()> {
        let mut first_error = None;
        for index in self.present_indices() {
            if let Err(err) = self.stop_node(index) {
                warn!(node = index, %err, "stop failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops the node and starts it again with the arguments it was started with.
    pub fn restart_node(&mut self, index: usize) -> HarnessResult<&NodeHandle> {
        let launch = self.node(index)?.launch().clone();
        self.stop_node(index)?;
        self.launch(index, launch)
    }

    /// Removes the node's data directory. The node must be stopped.
    pub fn erase_datadir(&mut self, index: usize) -> HarnessResult<()> {
        if self.is_present(index) {
            return Err(HarnessError::NodeAlreadyRunning(index));
        }
        let datadir = self.config.datadir(index);
        if datadir.exists() {
            fs::remove_dir_all(&datadir)?;
            info!(node = index, path = %datadir.display(), "data directory erased");
        }
        Ok(())
    }

    /// Drops a node believed to have crashed; its process is killed, not stopped.
    pub(crate) fn evict(&mut self, index: usize) {
        if let Some(handle) = self.take(index) {
            warn!(node = index, "evicting unresponsive node");
            process::kill_node(handle);
        }
    }

    pub fn node(&self, index: usize) -> HarnessResult<&NodeHandle> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(HarnessError::InvalidNodeReference(index))
    }

    pub fn rpc(&self, index: usize) -> HarnessResult<&RpcClient> {
        Ok(self.node(index)?.rpc())
    }

    pub fn is_present(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    pub fn present_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| index))
            .collect()
    }

    /// Present handles among `indices`, in the order given; absent slots are skipped.
    pub fn present_nodes(&self, indices: &[usize]) -> Vec<&NodeHandle> {
        indices
            .iter()
            .filter_map(|index| self.slots.get(*index).and_then(Option::as_ref))
            .collect()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_split(&self) -> bool {
        self.partition.is_some()
    }

    pub fn datadir(&self, index: usize) -> PathBuf {
        self.config.datadir(index)
    }

    fn take(&mut self, index: usize) -> Option<NodeHandle> {
        self.slots.get_mut(index).and_then(Option::take)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !self.present_indices().is_empty() {
            let _ = self.stop_all();
        }
    }
}
