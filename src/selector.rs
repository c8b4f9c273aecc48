//! Socket/NUMA-aware core selection.
//!
//! Builds a socket → NUMA-node → core ownership graph from a ledger
//! snapshot and allocates cores one at a time. The placement policy picks
//! the socket (then node) hosting the fewest *other* processes, with a
//! strong boost for sockets and nodes already hosting the caller's PID, so
//! repeat acquisitions cluster near each other instead of scattering.
//!
//! Weight at the socket level, with `H` = distinct other PIDs on the host
//! and `S` = distinct other PIDs on the socket: `H - S`, plus `H + 1` when
//! the caller already owns a core there; `-1` (ineligible) when the socket
//! has no free core. The node level mirrors the formula with the socket
//! total taking the host's place. Verify mode cross-checks every pick
//! against all remaining free cores and fails fast if a strictly better
//! candidate exists.

use std::collections::HashSet;

use crate::numa::NumaTopology;
use crate::sockets::SocketTopology;

/// Selection failures.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("no available core at the socket level")]
    SocketsExhausted,
    #[error("no available core inside the chosen NUMA node")]
    NodeExhausted,
    #[error("core count mismatch: topology has {topology} cores, ledger has {ledger}")]
    CoreCountMismatch { topology: u32, ledger: u32 },
    #[error(
        "verify failed: core {better} strictly beats chosen core {chosen}"
    )]
    VerifyFailed { chosen: u32, better: u32 },
}

#[derive(Clone, Debug)]
struct CoreSlot {
    core_id: u32,
    in_use: bool,
    pid: u64,
}

#[derive(Clone, Debug)]
struct NodeSlot {
    node_id: u32,
    cores: Vec<CoreSlot>,
    weight: i64,
}

#[derive(Clone, Debug)]
struct SocketSlot {
    socket_id: u32,
    nodes: Vec<NodeSlot>,
    weight: i64,
}

/// Pick context for the verify-mode core comparison.
#[derive(Clone, Copy, Debug)]
struct CoreCondition {
    socket_has_me: bool,
    socket_other_pids: i64,
    node_has_me: bool,
    node_other_pids: i64,
}

/// Rebuildable selection graph over a ledger snapshot.
pub struct Selector {
    my_pid: u64,
    sockets: Vec<SocketSlot>,
}

impl Selector {
    /// Shape the graph from the host topology. Core occupancy starts empty;
    /// load a ledger snapshot with [`Selector::load`].
    pub fn new(sockets: &SocketTopology, numa: &NumaTopology, my_pid: u64) -> Self {
        let mut socket_slots = Vec::with_capacity(sockets.total_sockets());
        for socket in sockets.sockets() {
            // Nodes touched by this socket's CPUs, ascending; each node slot
            // owns the intersection of its CPUs with the socket's.
            let node_ids = numa.active_node_ids(socket.cpu_ids());
            let nodes = node_ids
                .into_iter()
                .map(|node_id| {
                    let node = numa.node(node_id).expect("node from active set");
                    let cores = socket
                        .cpu_ids()
                        .iter()
                        .filter(|&&c| node.contains_cpu(c))
                        .map(|&core_id| CoreSlot {
                            core_id,
                            in_use: false,
                            pid: 0,
                        })
                        .collect();
                    NodeSlot {
                        node_id,
                        cores,
                        weight: -1,
                    }
                })
                .collect();
            socket_slots.push(SocketSlot {
                socket_id: socket.socket_id(),
                nodes,
                weight: -1,
            });
        }
        Self {
            my_pid,
            sockets: socket_slots,
        }
    }

    pub fn my_pid(&self) -> u64 {
        self.my_pid
    }

    /// Pid override for allocation tests exercising multi-process behavior
    /// from one process.
    pub fn set_my_pid(&mut self, pid: u64) {
        self.my_pid = pid;
    }

    fn total_cores(&self) -> u32 {
        self.sockets
            .iter()
            .flat_map(|s| &s.nodes)
            .map(|n| n.cores.len() as u32)
            .sum()
    }

    /// Overwrite every core slot from a ledger snapshot (`occupancy(core_id)
    /// -> (occupied, pid)`).
    pub fn load(
        &mut self,
        ledger_cores: u32,
        occupancy: impl Fn(u32) -> (bool, u64),
    ) -> Result<(), SelectorError> {
        let topology = self.total_cores();
        if topology != ledger_cores {
            return Err(SelectorError::CoreCountMismatch {
                topology,
                ledger: ledger_cores,
            });
        }
        for socket in &mut self.sockets {
            for node in &mut socket.nodes {
                for core in &mut node.cores {
                    let (in_use, pid) = occupancy(core.core_id);
                    core.in_use = in_use;
                    core.pid = if in_use { pid } else { 0 };
                }
            }
        }
        Ok(())
    }

    pub fn available_count(&self) -> u32 {
        self.sockets
            .iter()
            .flat_map(|s| &s.nodes)
            .flat_map(|n| &n.cores)
            .filter(|c| !c.in_use)
            .count() as u32
    }

    /// Allocate `n` cores greedily, marking them in-use under the caller's
    /// PID as it goes. The returned list is in allocation order. With
    /// `verify` every pick is cross-checked against the remaining free
    /// cores.
    pub fn allocate(&mut self, n: u32, verify: bool) -> Result<Vec<u32>, SelectorError> {
        let mut picked = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let core_id = self.allocate_one()?;
            if verify {
                self.verify_pick(core_id)?;
            }
            picked.push(core_id);
        }
        Ok(picked)
    }

    fn allocate_one(&mut self) -> Result<u32, SelectorError> {
        let host_other = self.distinct_other_pids_host();
        let my_pid = self.my_pid;
        for socket in &mut self.sockets {
            socket.weight = socket_weight(socket, my_pid, host_other);
        }

        // Highest weight wins; ties keep the first (lowest-id) candidate.
        let mut best_socket: Option<usize> = None;
        for (i, socket) in self.sockets.iter().enumerate() {
            if socket.weight < 0 {
                continue;
            }
            match best_socket {
                Some(b) if self.sockets[b].weight >= socket.weight => {}
                _ => best_socket = Some(i),
            }
        }
        let socket = &mut self.sockets[best_socket.ok_or(SelectorError::SocketsExhausted)?];

        let socket_other =
            distinct_other_pids(socket.nodes.iter().flat_map(|n| &n.cores), my_pid).0;
        for node in &mut socket.nodes {
            node.weight = node_weight(node, my_pid, socket_other);
        }
        let mut best_node: Option<usize> = None;
        for (i, node) in socket.nodes.iter().enumerate() {
            if node.weight < 0 {
                continue;
            }
            match best_node {
                Some(b) if socket.nodes[b].weight >= node.weight => {}
                _ => best_node = Some(i),
            }
        }
        let node = &mut socket.nodes[best_node.ok_or(SelectorError::NodeExhausted)?];

        // Lowest-id free core of the chosen node.
        let core = node
            .cores
            .iter_mut()
            .find(|c| !c.in_use)
            .ok_or(SelectorError::NodeExhausted)?;
        core.in_use = true;
        core.pid = my_pid;
        Ok(core.core_id)
    }

    fn distinct_other_pids_host(&self) -> i64 {
        distinct_other_pids(
            self.sockets
                .iter()
                .flat_map(|s| &s.nodes)
                .flat_map(|n| &n.cores),
            self.my_pid,
        )
        .0
    }

    fn condition_of(&self, core_id: u32) -> CoreCondition {
        let socket = self
            .sockets
            .iter()
            .find(|s| s.nodes.iter().any(|n| n.cores.iter().any(|c| c.core_id == core_id)))
            .expect("core in graph");
        let node = socket
            .nodes
            .iter()
            .find(|n| n.cores.iter().any(|c| c.core_id == core_id))
            .expect("node in socket");

        let (socket_other_pids, socket_has_me) =
            distinct_other_pids(socket.nodes.iter().flat_map(|n| &n.cores), self.my_pid);
        let (node_other_pids, node_has_me) = distinct_other_pids(node.cores.iter(), self.my_pid);
        CoreCondition {
            socket_has_me,
            socket_other_pids,
            node_has_me,
            node_other_pids,
        }
    }

    // Fail when any remaining free core strictly beats the chosen one.
    fn verify_pick(&self, chosen: u32) -> Result<(), SelectorError> {
        let target = self.condition_of(chosen);
        for socket in &self.sockets {
            for node in &socket.nodes {
                for core in &node.cores {
                    if core.in_use || core.core_id == chosen {
                        continue;
                    }
                    let trial = self.condition_of(core.core_id);
                    if prefer_trial_over_target(target, trial) {
                        return Err(SelectorError::VerifyFailed {
                            chosen,
                            better: core.core_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn distinct_other_pids<'a>(
    cores: impl Iterator<Item = &'a CoreSlot>,
    my_pid: u64,
) -> (i64, bool) {
    let mut pids = HashSet::new();
    let mut has_me = false;
    for core in cores {
        if !core.in_use {
            continue;
        }
        if core.pid == my_pid {
            has_me = true;
        } else {
            pids.insert(core.pid);
        }
    }
    (pids.len() as i64, has_me)
}

fn socket_weight(socket: &SocketSlot, my_pid: u64, host_other: i64) -> i64 {
    let free = socket
        .nodes
        .iter()
        .flat_map(|n| &n.cores)
        .any(|c| !c.in_use);
    if !free {
        return -1;
    }
    let (socket_other, has_me) =
        distinct_other_pids(socket.nodes.iter().flat_map(|n| &n.cores), my_pid);
    let mut weight = host_other - socket_other;
    if has_me {
        weight += host_other + 1;
    }
    weight
}

fn node_weight(node: &NodeSlot, my_pid: u64, socket_other: i64) -> i64 {
    if !node.cores.iter().any(|c| !c.in_use) {
        return -1;
    }
    let (node_other, has_me) = distinct_other_pids(node.cores.iter(), my_pid);
    let mut weight = socket_other - node_other;
    if has_me {
        weight += socket_other + 1;
    }
    weight
}

// Two-level comparison ladder: the node that hosts my PID wins, then fewer
// other PIDs; inconclusive node comparisons fall through to the same logic
// at the socket level, and when my PID appears at neither level the socket
// totals are compared before the node totals. Equal standings keep the
// original pick.
fn prefer_trial_over_target(target: CoreCondition, trial: CoreCondition) -> bool {
    if target.node_has_me {
        if !trial.node_has_me {
            return false;
        }
        if trial.node_other_pids != target.node_other_pids {
            return trial.node_other_pids < target.node_other_pids;
        }
        return false;
    }
    if trial.node_has_me {
        return true;
    }

    if target.socket_has_me {
        if !trial.socket_has_me {
            return false;
        }
        if trial.socket_other_pids != target.socket_other_pids {
            return trial.socket_other_pids < target.socket_other_pids;
        }
        return false;
    }
    if trial.socket_has_me {
        return true;
    }

    if trial.socket_other_pids != target.socket_other_pids {
        return trial.socket_other_pids < target.socket_other_pids;
    }
    if trial.node_other_pids != target.node_other_pids {
        return trial.node_other_pids < target.node_other_pids;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn farm96_selector(my_pid: u64) -> Selector {
        let sockets = SocketTopology::probe("farm96").unwrap();
        let numa = NumaTopology::probe("farm96").unwrap();
        Selector::new(&sockets, &numa, my_pid)
    }

    fn small_selector(my_pid: u64) -> Selector {
        // 4 cores, 2 sockets, one node per socket.
        let sockets = SocketTopology::from_tables(&[0, 1, 2, 3], &[0, 0, 1, 1]);
        let numa = NumaTopology::from_nodes(vec![
            crate::numa::NumaNodeInfo::new(0, vec![0, 1], 1 << 30, vec![10, 20]),
            crate::numa::NumaNodeInfo::new(1, vec![2, 3], 1 << 30, vec![20, 10]),
        ]);
        Selector::new(&sockets, &numa, my_pid)
    }

    #[test]
    fn empty_graph_prefers_lowest_ids() {
        let mut sel = small_selector(100);
        sel.load(4, |_| (false, 0)).unwrap();
        let ids = sel.allocate(2, true).unwrap();
        // First pick lands on core 0; the second stays on the same node
        // thanks to the own-PID boost.
        assert_eq!(ids, [0, 1]);
    }

    #[test]
    fn two_pids_get_disjoint_sets() {
        let mut sel = small_selector(1000);
        sel.load(4, |_| (false, 0)).unwrap();
        let first = sel.allocate(2, true).unwrap();

        sel.set_my_pid(2000);
        let second = sel.allocate(2, true).unwrap();

        let mut all: Vec<u32> = first.iter().chain(&second).copied().collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4, "sets overlap: {first:?} vs {second:?}");
        // The second process lands on the socket the first one left alone.
        assert!(second.iter().all(|id| *id >= 2), "{second:?}");
    }

    #[test]
    fn repeat_acquire_sticks_to_own_node() {
        let mut sel = farm96_selector(4242);
        // A stranger occupies one core of node 1; my earlier core sits on
        // node 0.
        sel.load(96, |core| match core {
            24 => (true, 7777),
            5 => (true, 4242),
            _ => (false, 0),
        })
        .unwrap();
        let ids = sel.allocate(1, true).unwrap();
        assert_eq!(ids.len(), 1);
        // Node 0 owns cpus 0-23,48-71; the boost keeps me there.
        let id = ids[0];
        assert!((id <= 23) || (48..=71).contains(&id), "got {id}");
    }

    #[test]
    fn busy_socket_is_avoided() {
        let mut sel = small_selector(1);
        // Cores 0,1 (socket 0) used by two different strangers; socket 1
        // empty.
        sel.load(4, |core| match core {
            0 => (true, 100),
            1 => (true, 200),
            _ => (false, 0),
        })
        .unwrap();
        let ids = sel.allocate(2, true).unwrap();
        assert_eq!(ids, [2, 3]);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut sel = small_selector(1);
        sel.load(4, |_| (true, 99)).unwrap();
        assert_eq!(sel.available_count(), 0);
        assert!(matches!(
            sel.allocate(1, false),
            Err(SelectorError::SocketsExhausted)
        ));
    }

    #[test]
    fn core_count_mismatch_is_detected() {
        let mut sel = small_selector(1);
        assert!(matches!(
            sel.load(8, |_| (false, 0)),
            Err(SelectorError::CoreCountMismatch { topology: 4, ledger: 8 })
        ));
    }

    #[test]
    fn comparison_ladder() {
        let base = CoreCondition {
            socket_has_me: false,
            socket_other_pids: 2,
            node_has_me: false,
            node_other_pids: 1,
        };
        // A node with my pid beats one without.
        assert!(prefer_trial_over_target(
            base,
            CoreCondition {
                node_has_me: true,
                ..base
            }
        ));
        // Fewer socket strangers wins when my pid is nowhere.
        assert!(prefer_trial_over_target(
            base,
            CoreCondition {
                socket_other_pids: 1,
                ..base
            }
        ));
        // Equal standings keep the original pick.
        assert!(!prefer_trial_over_target(base, base));
        // When the target node hosts me, only a my-pid node with fewer
        // strangers beats it.
        let mine = CoreCondition {
            node_has_me: true,
            node_other_pids: 1,
            socket_has_me: true,
            socket_other_pids: 1,
        };
        assert!(!prefer_trial_over_target(mine, base));
        assert!(prefer_trial_over_target(
            mine,
            CoreCondition {
                node_has_me: true,
                node_other_pids: 0,
                ..mine
            }
        ));
    }
}
