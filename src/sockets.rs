//! CPU-socket topology probe.
//!
//! Enumerates which CPU ids live on which physical package, either from the
//! running host (`/proc/cpuinfo`) or from a named emulation profile with a
//! deterministic shape for tests. Socket ids are dense starting at 0 and
//! every CPU belongs to exactly one socket.

use std::fs;

/// Topology probe failures.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("unknown topology profile {0:?}")]
    UnknownProfile(String),
    #[error("topology probe failed: {0}")]
    Probe(String),
}

/// CPU ids of one physical socket, sorted ascending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketInfo {
    socket_id: u32,
    cpu_ids: Vec<u32>,
}

impl SocketInfo {
    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn cpu_ids(&self) -> &[u32] {
        &self.cpu_ids
    }

    pub fn total_cores(&self) -> usize {
        self.cpu_ids.len()
    }

    pub fn contains_cpu(&self, cpu_id: u32) -> bool {
        self.cpu_ids.binary_search(&cpu_id).is_ok()
    }
}

/// Per-socket CPU lists for the host or an emulation profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketTopology {
    sockets: Vec<SocketInfo>,
}

impl SocketTopology {
    /// Probe the named profile. `"localhost"` reads the running host;
    /// `farm384`, `farm96` and `farm128` are deterministic farm-host shapes
    /// used by tests and tooling.
    pub fn probe(profile: &str) -> Result<Self, TopologyError> {
        let (cpu_ids, socket_ids) = match profile {
            "localhost" => probe_localhost()?,
            "farm384" => emulated_farm384(),
            "farm96" => emulated_farm96(),
            "farm128" => emulated_farm128(),
            other => return Err(TopologyError::UnknownProfile(other.to_string())),
        };
        Ok(Self::from_tables(&cpu_ids, &socket_ids))
    }

    /// Build from parallel per-CPU tables (cpu id, owning socket id).
    pub fn from_tables(cpu_ids: &[u32], socket_ids: &[u32]) -> Self {
        debug_assert_eq!(cpu_ids.len(), socket_ids.len());
        let mut ids: Vec<u32> = socket_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let sockets = ids
            .into_iter()
            .map(|socket_id| {
                let mut cpus: Vec<u32> = cpu_ids
                    .iter()
                    .zip(socket_ids)
                    .filter(|(_, &s)| s == socket_id)
                    .map(|(&c, _)| c)
                    .collect();
                cpus.sort_unstable();
                SocketInfo { socket_id, cpu_ids: cpus }
            })
            .collect();
        Self { sockets }
    }

    pub fn sockets(&self) -> &[SocketInfo] {
        &self.sockets
    }

    pub fn total_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn total_cores(&self) -> usize {
        self.sockets.iter().map(SocketInfo::total_cores).sum()
    }

    pub fn socket(&self, socket_id: u32) -> Option<&SocketInfo> {
        self.sockets.iter().find(|s| s.socket_id == socket_id)
    }

    pub fn socket_of_cpu(&self, cpu_id: u32) -> Option<&SocketInfo> {
        self.sockets.iter().find(|s| s.contains_cpu(cpu_id))
    }

    /// Socket owning the majority of the given CPU set (a NUMA node's CPU
    /// list, typically). Ties go to the lower socket id.
    pub fn socket_of_cpu_set(&self, cpu_ids: &[u32]) -> Option<&SocketInfo> {
        self.sockets
            .iter()
            .map(|s| (s, cpu_ids.iter().filter(|&&c| s.contains_cpu(c)).count()))
            .filter(|&(_, n)| n > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.socket_id.cmp(&a.0.socket_id)))
            .map(|(s, _)| s)
    }

    /// Human-readable dump for operator tooling.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "sockets: {} (cores: {})\n",
            self.total_sockets(),
            self.total_cores()
        );
        for s in &self.sockets {
            out.push_str(&format!(
                "  socket {}: {} cores [{}]\n",
                s.socket_id,
                s.total_cores(),
                crate::core_ids::format_id_spec(&s.cpu_ids),
            ));
        }
        out
    }
}

fn probe_localhost() -> Result<(Vec<u32>, Vec<u32>), TopologyError> {
    let text = fs::read_to_string("/proc/cpuinfo")
        .map_err(|e| TopologyError::Probe(format!("read /proc/cpuinfo: {e}")))?;
    parse_cpuinfo(&text)
}

fn parse_cpuinfo(text: &str) -> Result<(Vec<u32>, Vec<u32>), TopologyError> {
    let mut cpu_ids = Vec::new();
    let mut socket_ids = Vec::new();
    let mut cur_cpu: Option<u32> = None;
    let mut cur_socket: u32 = 0;

    let mut flush = |cpu: &mut Option<u32>, socket: &mut u32| {
        if let Some(id) = cpu.take() {
            cpu_ids.push(id);
            socket_ids.push(*socket);
            *socket = 0;
        }
    };

    for line in text.lines() {
        if line.trim().is_empty() {
            flush(&mut cur_cpu, &mut cur_socket);
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key == "processor" {
            cur_cpu = Some(
                value
                    .parse()
                    .map_err(|_| TopologyError::Probe(format!("bad processor id {value:?}")))?,
            );
        } else if key == "physical id" {
            cur_socket = value
                .parse()
                .map_err(|_| TopologyError::Probe(format!("bad physical id {value:?}")))?;
        }
    }
    flush(&mut cur_cpu, &mut cur_socket);

    if cpu_ids.is_empty() {
        return Err(TopologyError::Probe("no processors in /proc/cpuinfo".into()));
    }
    Ok((cpu_ids, socket_ids))
}

// Dual-socket, 384-way host: hyperthread halves interleave the sockets.
fn emulated_farm384() -> (Vec<u32>, Vec<u32>) {
    let cpu_ids: Vec<u32> = (0..384).collect();
    let mut socket_ids = vec![0u32; 384];
    for id in 96..192 {
        socket_ids[id] = 1;
    }
    for id in 288..384 {
        socket_ids[id] = 1;
    }
    (cpu_ids, socket_ids)
}

// Dual-socket, 96-way host.
fn emulated_farm96() -> (Vec<u32>, Vec<u32>) {
    let cpu_ids: Vec<u32> = (0..96).collect();
    let mut socket_ids = vec![0u32; 96];
    for id in 24..48 {
        socket_ids[id] = 1;
    }
    for id in 72..96 {
        socket_ids[id] = 1;
    }
    (cpu_ids, socket_ids)
}

// Single-socket, 128-way host.
fn emulated_farm128() -> (Vec<u32>, Vec<u32>) {
    ((0..128).collect(), vec![0u32; 128])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulated_profiles_have_expected_shapes() {
        let t = SocketTopology::probe("farm384").unwrap();
        assert_eq!(t.total_sockets(), 2);
        assert_eq!(t.total_cores(), 384);
        assert_eq!(t.socket(0).unwrap().total_cores(), 192);
        assert_eq!(t.socket_of_cpu(100).unwrap().socket_id(), 1);
        assert_eq!(t.socket_of_cpu(200).unwrap().socket_id(), 0);

        let t = SocketTopology::probe("farm96").unwrap();
        assert_eq!(t.total_sockets(), 2);
        assert_eq!(t.socket(1).unwrap().cpu_ids()[0], 24);

        let t = SocketTopology::probe("farm128").unwrap();
        assert_eq!(t.total_sockets(), 1);
        assert_eq!(t.total_cores(), 128);
    }

    #[test]
    fn unknown_profile_is_rejected() {
        assert!(matches!(
            SocketTopology::probe("mystery-host"),
            Err(TopologyError::UnknownProfile(_))
        ));
    }

    #[test]
    fn cpuinfo_parsing() {
        let text = "\
processor\t: 0
physical id\t: 0
model name\t: Example CPU

processor\t: 1
physical id\t: 1

processor\t: 2
physical id\t: 0
";
        let (cpus, sockets) = parse_cpuinfo(text).unwrap();
        assert_eq!(cpus, [0, 1, 2]);
        assert_eq!(sockets, [0, 1, 0]);

        let t = SocketTopology::from_tables(&cpus, &sockets);
        assert_eq!(t.total_sockets(), 2);
        assert_eq!(t.socket(0).unwrap().cpu_ids(), [0, 2]);
    }

    #[test]
    fn node_to_socket_by_majority() {
        let t = SocketTopology::probe("farm384").unwrap();
        // A node split 3:1 across sockets resolves to the majority owner.
        assert_eq!(t.socket_of_cpu_set(&[0, 1, 2, 100]).unwrap().socket_id(), 0);
        assert_eq!(t.socket_of_cpu_set(&[100, 101, 2]).unwrap().socket_id(), 1);
        // Ties resolve to the lower socket id.
        assert_eq!(t.socket_of_cpu_set(&[0, 100]).unwrap().socket_id(), 0);
        assert!(t.socket_of_cpu_set(&[9999]).is_none());
    }

    #[test]
    fn every_cpu_in_exactly_one_socket() {
        let t = SocketTopology::probe("farm384").unwrap();
        for cpu in 0..384 {
            let owners = t
                .sockets()
                .iter()
                .filter(|s| s.contains_cpu(cpu))
                .count();
            assert_eq!(owners, 1, "cpu {cpu}");
        }
    }
}
