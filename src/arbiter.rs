//! External acquire/release surface of the affinity arbitrator.
//!
//! Each process holds one [`AffinityManager`]. Construction attaches the
//! shared ledger (creating and initializing it when this process is first
//! on the host) and resolves the semaphore initialization race through the
//! ledger's init-completion hash. `acquire` and `release` run fully under
//! the gate: snapshot the ledger, select or free cores, write records back.
//! A timed-out gate mutates nothing, and `acquire` either returns a
//! complete core set or fails; never a partial one.
//!
//! Core sets cross the API boundary as compact id strings ("0-3,8").

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core_ids::{format_id_spec, parse_id_spec};
use crate::gate::{Gate, GateError, GATE_KEY, GATE_TEST_KEY};
use crate::ledger::{ledger_size, Ledger, LedgerError, ShmRegion};
use crate::numa::NumaTopology;
use crate::selector::{Selector, SelectorError};
use crate::sockets::{SocketTopology, TopologyError};

const SHM_KEY: &str = "AffinityInfoSharedMemoryKey";
const SHM_TEST_KEY: &str = "AffinityInfoSharedMemoryTestKey";

const OPEN_TIMEOUT_SEC: f32 = 10.0;
const OPEN_RETRY_MAX: u32 = 3;
const INIT_HASH_POLL: Duration = Duration::from_millis(50);

/// Arbitrator failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("semaphore race could not be resolved: {0}")]
    SemaphoreRace(String),
    #[error("timed out waiting for the affinity gate")]
    Timeout,
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Selection(#[from] SelectorError),
    #[error("bad core id spec: {0}")]
    BadIdSpec(String),
    #[error("gate failure: {0}")]
    Gate(String),
}

impl From<GateError> for ArbiterError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::PermissionDenied => {
                ArbiterError::Ledger(LedgerError::PermissionDenied)
            }
            other => ArbiterError::Gate(other.to_string()),
        }
    }
}

/// Per-process handle on the host's shared affinity state.
pub struct AffinityManager {
    test_mode: bool,
    gate: Gate,
    shm: ShmRegion,
    sockets: SocketTopology,
    numa: NumaTopology,
    my_pid: u64,
}

impl AffinityManager {
    /// Attach to (or initialize) the host's affinity state using the live
    /// host topology.
    pub fn new(test_mode: bool) -> Result<Self, ArbiterError> {
        Self::with_profile("localhost", test_mode)
    }

    /// Same, against a named topology profile (tests and tooling).
    pub fn with_profile(profile: &str, test_mode: bool) -> Result<Self, ArbiterError> {
        let sockets = SocketTopology::probe(profile)?;
        let numa = NumaTopology::probe(profile)?;
        let num_cores = sockets.total_cores() as u32;

        let mut last_race = String::new();
        for attempt in 0..OPEN_RETRY_MAX {
            match Self::open_once(test_mode, num_cores) {
                Ok((gate, shm)) => {
                    debug!(attempt, "affinity state attached");
                    return Ok(Self {
                        test_mode,
                        gate,
                        shm,
                        sockets,
                        numa,
                        my_pid: std::process::id() as u64,
                    });
                }
                Err(OpenRace::Fatal(e)) => return Err(e),
                Err(OpenRace::Retry(reason)) => {
                    warn!(attempt, reason = %reason, "affinity open raced; retrying");
                    last_race = reason;
                }
            }
        }
        Err(ArbiterError::SemaphoreRace(last_race))
    }

    fn open_once(test_mode: bool, num_cores: u32) -> Result<(Gate, ShmRegion), OpenRace> {
        let gate_key = if test_mode { GATE_TEST_KEY } else { GATE_KEY };
        let shm_key = if test_mode { SHM_TEST_KEY } else { SHM_KEY };

        let (gate, created) = Gate::open(gate_key).map_err(fatal_gate)?;
        let expected_hash = Gate::init_hash(gate.sem_id());

        if created {
            // We own initialization: take the gate, shape the ledger, then
            // publish the init hash so attachers start trusting it.
            if !gate.lock_timeout(OPEN_TIMEOUT_SEC).map_err(fatal_gate)? {
                let _ = gate.remove();
                return Err(OpenRace::Retry("fresh semaphore stuck locked".into()));
            }
            let result = (|| -> Result<ShmRegion, ArbiterError> {
                let (shm, existed) =
                    ShmRegion::create_or_attach(shm_key, ledger_size(num_cores))?;
                let mut ledger = Ledger::over_shm(&shm);
                if existed {
                    // Ledger survived a previous semaphore generation; keep
                    // its records but re-stamp the hash below.
                    ledger.verify()?;
                } else {
                    ledger.init(num_cores)?;
                }
                ledger.set_sem_init_hash(&expected_hash);
                info!(existed, num_cores, "affinity ledger initialized");
                Ok(shm)
            })();
            let unlock = gate.unlock();
            let shm = result.map_err(OpenRace::Fatal)?;
            unlock.map_err(fatal_gate)?;
            return Ok((gate, shm));
        }

        // Someone else created the semaphore; wait for their init hash.
        let (shm, _) =
            ShmRegion::create_or_attach(shm_key, ledger_size(num_cores)).map_err(|e| {
                OpenRace::Fatal(ArbiterError::Ledger(e))
            })?;
        let deadline = Instant::now() + Duration::from_secs_f32(OPEN_TIMEOUT_SEC);
        loop {
            let ledger = Ledger::over_shm(&shm);
            if ledger.sem_init_hash() == expected_hash {
                ledger.verify().map_err(|e| OpenRace::Fatal(e.into()))?;
                return Ok((gate, shm));
            }
            if Instant::now() >= deadline {
                // Creator likely died before publishing; recreate.
                match gate.remove() {
                    Ok(()) => {
                        return Err(OpenRace::Retry(
                            "init hash never appeared; semaphore recreated".into(),
                        ))
                    }
                    Err(GateError::PermissionDenied) => {
                        return Err(OpenRace::Fatal(ArbiterError::Ledger(
                            LedgerError::PermissionDenied,
                        )))
                    }
                    Err(e) => return Err(OpenRace::Fatal(e.into())),
                }
            }
            thread::sleep(INIT_HASH_POLL);
        }
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn my_pid(&self) -> u64 {
        self.my_pid
    }

    /// Pid override for allocation tests exercising multi-process behavior
    /// from one process.
    pub fn set_my_pid_for_tests(&mut self, pid: u64) {
        self.my_pid = pid;
    }

    /// Claim up to `requested` cores. Returns the claimed set as a compact
    /// id string; fewer cores than requested when the host is busy, an
    /// empty string when nothing is free. [`ArbiterError::Timeout`] when
    /// the gate cannot be taken in time; the ledger is untouched then.
    pub fn acquire(
        &mut self,
        requested: u32,
        timeout_sec: f32,
        verify: bool,
    ) -> Result<String, ArbiterError> {
        if !self.gate.lock_timeout(timeout_sec)? {
            return Err(ArbiterError::Timeout);
        }
        let result = self.acquire_locked(requested, verify);
        self.gate.unlock()?;
        let ids = result?;
        info!(requested, granted = ids.len(), pid = self.my_pid, "cores acquired");
        Ok(format_id_spec(&ids))
    }

    fn acquire_locked(&mut self, requested: u32, verify: bool) -> Result<Vec<u32>, ArbiterError> {
        self.release_dead_owners()?;

        let mut ledger = Ledger::over_shm(&self.shm);
        ledger.verify()?;

        let mut selector = Selector::new(&self.sockets, &self.numa, self.my_pid);
        let num_cores = ledger.num_cores();
        let snapshot: Vec<(bool, u64)> = (0..num_cores)
            .map(|id| ledger.core(id))
            .collect::<Result<_, _>>()?;
        selector.load(num_cores, |id| snapshot[id as usize])?;

        // Grant what is actually free rather than failing a large request.
        let grant = requested.min(selector.available_count());
        let ids = selector.allocate(grant, verify)?;
        for &id in &ids {
            ledger.set_core(id, true, self.my_pid)?;
        }
        Ok(ids)
    }

    /// Release a previously acquired core set. Unknown ids are logged and
    /// tolerated.
    pub fn release(&mut self, spec: &str, timeout_sec: f32) -> Result<(), ArbiterError> {
        let ids = parse_id_spec(spec).map_err(|e| ArbiterError::BadIdSpec(e.to_string()))?;
        if !self.gate.lock_timeout(timeout_sec)? {
            return Err(ArbiterError::Timeout);
        }
        let result = (|| -> Result<(), ArbiterError> {
            let mut ledger = Ledger::over_shm(&self.shm);
            ledger.verify()?;
            let num_cores = ledger.num_cores();
            for id in ids {
                if id >= num_cores {
                    warn!(core = id, "release of unknown core id ignored");
                    continue;
                }
                ledger.set_core(id, false, 0)?;
            }
            Ok(())
        })();
        self.gate.unlock()?;
        result?;
        info!(spec, pid = self.my_pid, "cores released");
        Ok(())
    }

    // Records owned by processes that no longer exist are freed in place.
    // Runs under the gate.
    fn release_dead_owners(&mut self) -> Result<(), ArbiterError> {
        let mut ledger = Ledger::over_shm(&self.shm);
        let num_cores = ledger.num_cores();
        for core_id in 0..num_cores {
            let (occupied, pid) = ledger.core(core_id)?;
            if !occupied || pid == self.my_pid {
                continue;
            }
            let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0
                || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
            if !alive {
                warn!(core = core_id, pid, "freeing core of dead owner");
                ledger.set_core(core_id, false, 0)?;
            }
        }
        Ok(())
    }

    /// Human-readable topology and ledger summary.
    pub fn describe_topology(&self) -> String {
        let ledger = Ledger::over_shm(&self.shm);
        format!(
            "{}{}{}",
            self.sockets.describe(),
            self.numa.describe(),
            ledger.describe(),
        )
    }

    /// Lock-free ledger dump for diagnostics; may observe torn values.
    pub fn dump_ledger(&self) -> String {
        Ledger::over_shm(&self.shm).describe()
    }

    /// Force-remove the host's shared state (kernel objects). Creator or
    /// root only.
    pub fn remove_shared_state(test_mode: bool) -> Result<(), ArbiterError> {
        let gate_key = if test_mode { GATE_TEST_KEY } else { GATE_KEY };
        let shm_key = if test_mode { SHM_TEST_KEY } else { SHM_KEY };
        if Gate::exists(gate_key) {
            let (gate, _) = Gate::open(gate_key)?;
            gate.remove()?;
        }
        ShmRegion::remove(shm_key)?;
        Ok(())
    }
}

enum OpenRace {
    Retry(String),
    Fatal(ArbiterError),
}

fn fatal_gate(e: GateError) -> OpenRace {
    OpenRace::Fatal(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The test gate/ledger are host-global kernel objects; serialize every
    // test touching them.
    static TEST_STATE: Mutex<()> = Mutex::new(());

    fn fresh_manager() -> AffinityManager {
        let _ = AffinityManager::remove_shared_state(true);
        AffinityManager::with_profile("localhost", true).expect("attach test state")
    }

    fn teardown(mgr: AffinityManager) {
        drop(mgr);
        let _ = AffinityManager::remove_shared_state(true);
    }

    #[test]
    fn acquire_then_release_round_trip() {
        let _guard = TEST_STATE.lock().unwrap();
        let mut mgr = fresh_manager();

        let spec = mgr.acquire(2, 5.0, true).unwrap();
        let ids = parse_id_spec(&spec).unwrap();
        assert_eq!(ids.len(), 2);

        // The ledger now shows our pid on those cores.
        let dump = mgr.dump_ledger();
        assert!(dump.contains(&format!("pid {}", mgr.my_pid())));

        mgr.release(&spec, 5.0).unwrap();
        let dump = mgr.dump_ledger();
        assert!(dump.contains("0/"), "all cores free again: {dump}");
        teardown(mgr);
    }

    #[test]
    fn competing_pids_get_disjoint_sets() {
        let _guard = TEST_STATE.lock().unwrap();
        let mut mgr = fresh_manager();

        mgr.set_my_pid_for_tests(910_000_001);
        let first = parse_id_spec(&mgr.acquire(2, 5.0, true).unwrap()).unwrap();
        mgr.set_my_pid_for_tests(910_000_002);
        let second = parse_id_spec(&mgr.acquire(2, 5.0, true).unwrap()).unwrap();

        for id in &second {
            assert!(!first.contains(id), "{first:?} vs {second:?}");
        }
        teardown(mgr);
    }

    #[test]
    fn oversized_request_is_clamped_never_partial_on_error() {
        let _guard = TEST_STATE.lock().unwrap();
        let mut mgr = fresh_manager();
        let total = mgr.describe_topology(); // smoke: renders without panic
        assert!(total.contains("sockets:"));

        let spec = mgr.acquire(1_000_000, 5.0, false).unwrap();
        let ids = parse_id_spec(&spec).unwrap();
        let num_cores = SocketTopology::probe("localhost").unwrap().total_cores();
        assert_eq!(ids.len(), num_cores);

        // Nothing left: the next caller gets an empty set, not an error.
        mgr.set_my_pid_for_tests(910_000_099);
        let leftovers = mgr.acquire(1, 5.0, false).unwrap();
        assert_eq!(leftovers, "");
        teardown(mgr);
    }

    #[test]
    fn held_gate_times_out_without_mutation() {
        let _guard = TEST_STATE.lock().unwrap();
        let mut mgr = fresh_manager();

        let (outside, _) = Gate::open(GATE_TEST_KEY).unwrap();
        assert!(outside.lock_timeout(5.0).unwrap());
        let err = mgr.acquire(1, 0.0, false).unwrap_err();
        assert!(matches!(err, ArbiterError::Timeout));
        outside.unlock().unwrap();

        let dump = mgr.dump_ledger();
        assert!(dump.contains("0/"), "no records written: {dump}");
        teardown(mgr);
    }

    #[test]
    fn dead_owner_records_are_reclaimed() {
        let _guard = TEST_STATE.lock().unwrap();
        let mut mgr = fresh_manager();

        // Forge a record owned by a pid near pid_max that will not exist.
        {
            let mut ledger = Ledger::over_shm(&mgr.shm);
            ledger.set_core(0, true, 3_999_999).unwrap();
        }
        let spec = mgr.acquire(1, 5.0, false).unwrap();
        assert!(!spec.is_empty());
        let ledger = Ledger::over_shm(&mgr.shm);
        let (occupied, pid) = ledger.core(0).unwrap();
        assert!(!occupied || pid == mgr.my_pid(), "stale record survived");
        teardown(mgr);
    }

    #[test]
    fn release_tolerates_unknown_ids() {
        let _guard = TEST_STATE.lock().unwrap();
        let mut mgr = fresh_manager();
        mgr.release("123456,999999", 5.0).unwrap();
        assert!(matches!(
            mgr.release("not-a-spec", 5.0),
            Err(ArbiterError::BadIdSpec(_))
        ));
        teardown(mgr);
    }
}
