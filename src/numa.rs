//! NUMA topology probe and node-bound memory arenas.
//!
//! Enumerates per-node CPU lists, memory sizes, and inter-node distance
//! vectors from `/sys/devices/system/node` (or a deterministic emulation
//! profile), and provides page-aligned arenas whose backing pages are bound
//! to a specific node: `mmap` the region, then `mbind` it with MPOL_BIND.
//! A failed bind unmaps the region and surfaces as an error.

use std::fs;
use std::ptr;

use crate::core_ids::parse_id_spec;
use crate::sockets::TopologyError;

const MPOL_BIND: libc::c_int = 2;

/// One NUMA node: CPUs, memory size, and the distance vector to every node
/// (including itself; the self entry is the smallest in the row).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaNodeInfo {
    node_id: u32,
    cpu_ids: Vec<u32>,
    mem_bytes: u64,
    distances: Vec<u32>,
}

impl NumaNodeInfo {
    pub fn new(node_id: u32, mut cpu_ids: Vec<u32>, mem_bytes: u64, distances: Vec<u32>) -> Self {
        cpu_ids.sort_unstable();
        Self {
            node_id,
            cpu_ids,
            mem_bytes,
            distances,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn cpu_ids(&self) -> &[u32] {
        &self.cpu_ids
    }

    pub fn mem_bytes(&self) -> u64 {
        self.mem_bytes
    }

    pub fn distances(&self) -> &[u32] {
        &self.distances
    }

    pub fn contains_cpu(&self, cpu_id: u32) -> bool {
        self.cpu_ids.binary_search(&cpu_id).is_ok()
    }

    /// Allocate `size` bytes of anonymous memory bound to this node.
    pub fn alloc_arena(&self, size: usize) -> Result<NumaArena, TopologyError> {
        NumaArena::bind(self.node_id, size)
    }
}

/// All NUMA nodes of the host or an emulation profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaTopology {
    nodes: Vec<NumaNodeInfo>,
}

impl NumaTopology {
    /// Probe the named profile; `"localhost"` reads `/sys`, the `farm*`
    /// profiles mirror [`crate::sockets::SocketTopology::probe`].
    pub fn probe(profile: &str) -> Result<Self, TopologyError> {
        let nodes = match profile {
            "localhost" => probe_localhost()?,
            "farm384" => emulated_farm384(),
            "farm96" => emulated_farm96(),
            "farm128" => emulated_farm128(),
            other => return Err(TopologyError::UnknownProfile(other.to_string())),
        };
        Ok(Self { nodes })
    }

    /// Build directly from node tables (tests).
    pub fn from_nodes(nodes: Vec<NumaNodeInfo>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[NumaNodeInfo] {
        &self.nodes
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, node_id: u32) -> Option<&NumaNodeInfo> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_of_cpu(&self, cpu_id: u32) -> Option<&NumaNodeInfo> {
        self.nodes.iter().find(|n| n.contains_cpu(cpu_id))
    }

    /// Node ids touched by the given CPU set, sorted ascending.
    pub fn active_node_ids(&self, cpu_ids: &[u32]) -> Vec<u32> {
        let mut ids: Vec<u32> = cpu_ids
            .iter()
            .filter_map(|&c| self.node_of_cpu(c).map(NumaNodeInfo::node_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Human-readable dump for operator tooling.
    pub fn describe(&self) -> String {
        let mut out = format!("numa nodes: {}\n", self.total_nodes());
        for n in &self.nodes {
            out.push_str(&format!(
                "  node {}: {} cores [{}] mem {} MiB distance {:?}\n",
                n.node_id,
                n.cpu_ids.len(),
                crate::core_ids::format_id_spec(&n.cpu_ids),
                n.mem_bytes >> 20,
                n.distances,
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// localhost probing
// ---------------------------------------------------------------------------

fn sys_node_file(node_id: u32, leaf: &str) -> String {
    format!("/sys/devices/system/node/node{node_id}/{leaf}")
}

fn read_line(path: &str) -> Result<String, TopologyError> {
    let text = fs::read_to_string(path)
        .map_err(|e| TopologyError::Probe(format!("read {path}: {e}")))?;
    Ok(text.lines().next().unwrap_or("").to_string())
}

fn probe_localhost() -> Result<Vec<NumaNodeInfo>, TopologyError> {
    let online = read_line("/sys/devices/system/node/online")?;
    let node_ids = parse_id_spec(&online)
        .map_err(|e| TopologyError::Probe(format!("parse node list: {e}")))?;

    let mut nodes = Vec::with_capacity(node_ids.len());
    for node_id in node_ids {
        let cpulist = read_line(&sys_node_file(node_id, "cpulist"))?;
        let cpu_ids = parse_id_spec(&cpulist)
            .map_err(|e| TopologyError::Probe(format!("parse node{node_id} cpulist: {e}")))?;
        let mem_bytes = parse_meminfo_total(&fs::read_to_string(sys_node_file(
            node_id, "meminfo",
        ))
        .map_err(|e| TopologyError::Probe(format!("read node{node_id} meminfo: {e}")))?);
        let distance_line = read_line(&sys_node_file(node_id, "distance"))?;
        let distances = distance_line
            .split_whitespace()
            .map(|v| {
                v.parse()
                    .map_err(|_| TopologyError::Probe(format!("bad distance {v:?}")))
            })
            .collect::<Result<Vec<u32>, _>>()?;
        nodes.push(NumaNodeInfo {
            node_id,
            cpu_ids,
            mem_bytes,
            distances,
        });
    }
    Ok(nodes)
}

fn parse_meminfo_total(text: &str) -> u64 {
    for line in text.lines() {
        if line.contains("MemTotal") {
            // "Node 0 MemTotal:  98989108 kB"
            let kb = line
                .split_whitespace()
                .rev()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

// ---------------------------------------------------------------------------
// emulation profiles
// ---------------------------------------------------------------------------

fn node(node_id: u32, cpus: &str, mem_gib: u64, distances: &[u32]) -> NumaNodeInfo {
    NumaNodeInfo {
        node_id,
        cpu_ids: parse_id_spec(cpus).expect("profile cpu list"),
        mem_bytes: mem_gib << 30,
        distances: distances.to_vec(),
    }
}

// Eight nodes over two sockets; far half at distance 32.
fn emulated_farm384() -> Vec<NumaNodeInfo> {
    vec![
        node(0, "0-23,192-215", 96, &[10, 12, 12, 12, 32, 32, 32, 32]),
        node(1, "24-47,216-239", 96, &[12, 10, 12, 12, 32, 32, 32, 32]),
        node(2, "48-71,240-263", 96, &[12, 12, 10, 12, 32, 32, 32, 32]),
        node(3, "72-95,264-287", 96, &[12, 12, 12, 10, 32, 32, 32, 32]),
        node(4, "96-119,288-311", 96, &[32, 32, 32, 32, 10, 12, 12, 12]),
        node(5, "120-143,312-335", 96, &[32, 32, 32, 32, 12, 10, 12, 12]),
        node(6, "144-167,336-359", 96, &[32, 32, 32, 32, 12, 12, 10, 12]),
        node(7, "168-191,360-383", 96, &[32, 32, 32, 32, 12, 12, 12, 10]),
    ]
}

// One node per socket.
fn emulated_farm96() -> Vec<NumaNodeInfo> {
    vec![
        node(0, "0-23,48-71", 96, &[10, 21]),
        node(1, "24-47,72-95", 96, &[21, 10]),
    ]
}

// UMA host.
fn emulated_farm128() -> Vec<NumaNodeInfo> {
    vec![node(0, "0-127", 256, &[10])]
}

// ---------------------------------------------------------------------------
// node-bound memory arenas
// ---------------------------------------------------------------------------

/// Anonymous memory region whose pages are bound to one NUMA node.
#[derive(Debug)]
pub struct NumaArena {
    addr: *mut libc::c_void,
    len: usize,
    node_id: u32,
}

// The region is exclusively owned; the raw pointer is only aliased through
// the accessors below.
unsafe impl Send for NumaArena {}

impl NumaArena {
    fn bind(node_id: u32, size: usize) -> Result<Self, TopologyError> {
        if size == 0 {
            return Err(TopologyError::Probe("zero-sized arena".into()));
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(TopologyError::Probe(format!(
                "mmap of {size} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // One bit per node id, u64 lanes; sized to hold node_id.
        let lanes = (node_id as usize / 64) + 1;
        let mut node_mask = vec![0u64; lanes];
        node_mask[node_id as usize / 64] = 1u64 << (node_id % 64);

        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr,
                size,
                MPOL_BIND,
                node_mask.as_ptr(),
                (lanes * 64 + 1) as libc::c_ulong,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(addr, size);
            }
            return Err(TopologyError::Probe(format!(
                "mbind to node {node_id} failed: {err}"
            )));
        }

        Ok(Self {
            addr,
            len: size,
            node_id,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) }
    }

    /// Ask the kernel which node each touched page landed on and check they
    /// all match the bind target. Pages never faulted in report ENOENT and
    /// are skipped.
    pub fn is_bound(&self) -> Result<bool, TopologyError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            return Err(TopologyError::Probe("sysconf(_SC_PAGESIZE) failed".into()));
        }
        let page = page as usize;
        let pages = self.len.div_ceil(page);

        let ptrs: Vec<*mut libc::c_void> = (0..pages)
            .map(|i| unsafe { (self.addr as *mut u8).add(i * page) } as *mut libc::c_void)
            .collect();
        let mut status = vec![-1i32; pages];

        // With a null nodes argument move_pages only reports placement.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0 as libc::c_int,
                pages as libc::c_ulong,
                ptrs.as_ptr(),
                ptr::null::<libc::c_int>(),
                status.as_mut_ptr(),
                0 as libc::c_int,
            )
        };
        if rc != 0 {
            return Err(TopologyError::Probe(format!(
                "move_pages failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(status
            .iter()
            .all(|&s| s < 0 || s == self.node_id as i32))
    }
}

impl Drop for NumaArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_cover_every_cpu_once() {
        for (profile, cpus, nodes) in
            [("farm384", 384u32, 8usize), ("farm96", 96, 2), ("farm128", 128, 1)]
        {
            let t = NumaTopology::probe(profile).unwrap();
            assert_eq!(t.total_nodes(), nodes, "{profile}");
            for cpu in 0..cpus {
                let owners = t.nodes().iter().filter(|n| n.contains_cpu(cpu)).count();
                assert_eq!(owners, 1, "{profile} cpu {cpu}");
            }
        }
    }

    #[test]
    fn distance_self_entry_is_row_minimum() {
        for profile in ["farm384", "farm96", "farm128"] {
            let t = NumaTopology::probe(profile).unwrap();
            for n in t.nodes() {
                let own = n.distances()[n.node_id() as usize];
                assert_eq!(own, *n.distances().iter().min().unwrap(), "{profile}");
                assert_eq!(n.distances().len(), t.total_nodes());
            }
        }
    }

    #[test]
    fn node_lookup_by_cpu() {
        let t = NumaTopology::probe("farm384").unwrap();
        assert_eq!(t.node_of_cpu(0).unwrap().node_id(), 0);
        assert_eq!(t.node_of_cpu(215).unwrap().node_id(), 0);
        assert_eq!(t.node_of_cpu(24).unwrap().node_id(), 1);
        assert_eq!(t.node_of_cpu(383).unwrap().node_id(), 7);
        assert!(t.node_of_cpu(384).is_none());

        assert_eq!(t.active_node_ids(&[0, 24, 25, 383]), [0, 1, 7]);
    }

    #[test]
    fn meminfo_parsing() {
        let text = "Node 0 MemTotal:       98989108 kB\nNode 0 MemFree: 123 kB\n";
        assert_eq!(parse_meminfo_total(text), 98_989_108 * 1024);
        assert_eq!(parse_meminfo_total("nothing here"), 0);
    }
}
