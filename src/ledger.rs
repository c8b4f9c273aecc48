//! Shared-memory ledger of per-core ownership records.
//!
//! The ledger is a fixed-offset byte layout living in a SysV shared-memory
//! segment attached by every render process on the host:
//!
//! ```text
//! offset  0 : head message, "affinityInfo" NUL-padded to 64 bytes
//! offset 64 : region size (u64)
//! offset 72 : semaphore-init hash (20 bytes)
//! offset 92 : numCores (u32)
//! offset 96 : record[i] at 96 + 16*i
//!             +0 occupied (u8, in an 8-byte lane)
//!             +8 owner pid (u64)
//! ```
//!
//! Fields never move; new fields may only be appended so old binaries keep
//! reading the prefix. Mutating sequences run under the gate; diagnostic
//! readers may go lock-free and accept torn values, which is why all access
//! is volatile.

use std::marker::PhantomData;

/// Fixed head-message constant identifying an affinity ledger region.
pub const HEAD_MESSAGE: &str = "affinityInfo";
/// Width of the head-message field.
pub const HEAD_MESSAGE_SIZE: usize = 64;
/// Width of the semaphore-init hash field (SHA-1).
pub const SEM_INIT_HASH_SIZE: usize = 20;

const OFFSET_HEAD_MESSAGE: usize = 0;
const OFFSET_DATA_SIZE: usize = OFFSET_HEAD_MESSAGE + HEAD_MESSAGE_SIZE;
const OFFSET_SEM_INIT_HASH: usize = OFFSET_DATA_SIZE + 8;
const OFFSET_NUM_CORES: usize = OFFSET_SEM_INIT_HASH + SEM_INIT_HASH_SIZE;
const OFFSET_RECORDS: usize = OFFSET_NUM_CORES + 4;
const RECORD_SIZE: usize = 16;
const RECORD_OFFSET_OCCUPIED: usize = 0;
const RECORD_OFFSET_PID: usize = 8;

/// Ledger access failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger corrupt: {0}")]
    Corrupt(String),
    #[error("core id {core_id} out of range ({num_cores} cores)")]
    BadCoreId { core_id: u32, num_cores: u32 },
    #[error("shared memory: {0}")]
    Os(String),
    #[error("only the creator or root may remove the shared memory segment")]
    PermissionDenied,
}

/// Total region size for a host with `num_cores` cores.
pub fn ledger_size(num_cores: u32) -> usize {
    OFFSET_RECORDS + RECORD_SIZE * num_cores as usize
}

/// Typed view over a raw ledger region (shared memory or, in tests, heap).
///
/// All reads and writes are volatile: other processes mutate the same bytes
/// and lock-free diagnostic readers must not have accesses folded away.
pub struct Ledger<'a> {
    mem: *mut u8,
    size: usize,
    _region: PhantomData<&'a mut [u8]>,
}

// The raw pointer is only dereferenced through volatile accessors.
unsafe impl Send for Ledger<'_> {}

impl<'a> Ledger<'a> {
    /// View over a heap buffer (tests, diagnostics).
    pub fn over_slice(buf: &'a mut [u8]) -> Self {
        Self {
            mem: buf.as_mut_ptr(),
            size: buf.len(),
            _region: PhantomData,
        }
    }

    /// View over an attached shared-memory region.
    pub fn over_shm(region: &'a ShmRegion) -> Self {
        Self {
            mem: region.addr() as *mut u8,
            size: region.size(),
            _region: PhantomData,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), LedgerError> {
        if offset + len > self.size {
            return Err(LedgerError::Corrupt(format!(
                "access {offset}+{len} beyond region of {}",
                self.size
            )));
        }
        Ok(())
    }

    fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.size);
        for (i, b) in out.iter_mut().enumerate() {
            *b = unsafe { self.mem.add(offset + i).read_volatile() };
        }
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.size);
        for (i, &b) in data.iter().enumerate() {
            unsafe { self.mem.add(offset + i).write_volatile(b) };
        }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(offset, &mut b);
        u64::from_ne_bytes(b)
    }

    fn write_u64(&mut self, offset: usize, v: u64) {
        self.write_bytes(offset, &v.to_ne_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(offset, &mut b);
        u32::from_ne_bytes(b)
    }

    /// Initialize a fresh region: head message, size, zero hash, core count,
    /// all records free.
    pub fn init(&mut self, num_cores: u32) -> Result<(), LedgerError> {
        self.check(0, ledger_size(num_cores))?;
        let mut head = [0u8; HEAD_MESSAGE_SIZE];
        head[..HEAD_MESSAGE.len()].copy_from_slice(HEAD_MESSAGE.as_bytes());
        self.write_bytes(OFFSET_HEAD_MESSAGE, &head);
        self.write_u64(OFFSET_DATA_SIZE, self.size as u64);
        self.set_sem_init_hash(&[0u8; SEM_INIT_HASH_SIZE]);
        self.write_bytes(OFFSET_NUM_CORES, &num_cores.to_ne_bytes());
        for core_id in 0..num_cores {
            self.set_core(core_id, false, 0)?;
        }
        Ok(())
    }

    /// Check head message and recorded size against the attached region.
    pub fn verify(&self) -> Result<(), LedgerError> {
        self.check(0, OFFSET_RECORDS)?;
        let head = self.head_message();
        if head != HEAD_MESSAGE {
            return Err(LedgerError::Corrupt(format!(
                "head message {head:?}, expected {HEAD_MESSAGE:?}"
            )));
        }
        let recorded = self.read_u64(OFFSET_DATA_SIZE);
        if recorded != self.size as u64 {
            return Err(LedgerError::Corrupt(format!(
                "recorded size {recorded} != region size {}",
                self.size
            )));
        }
        let num_cores = self.num_cores();
        if ledger_size(num_cores) != self.size {
            return Err(LedgerError::Corrupt(format!(
                "{num_cores} cores need {} bytes, region is {}",
                ledger_size(num_cores),
                self.size
            )));
        }
        Ok(())
    }

    pub fn head_message(&self) -> String {
        let mut b = [0u8; HEAD_MESSAGE_SIZE];
        self.read_bytes(OFFSET_HEAD_MESSAGE, &mut b);
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        String::from_utf8_lossy(&b[..end]).into_owned()
    }

    pub fn recorded_size(&self) -> u64 {
        self.read_u64(OFFSET_DATA_SIZE)
    }

    pub fn sem_init_hash(&self) -> [u8; SEM_INIT_HASH_SIZE] {
        let mut b = [0u8; SEM_INIT_HASH_SIZE];
        self.read_bytes(OFFSET_SEM_INIT_HASH, &mut b);
        b
    }

    pub fn set_sem_init_hash(&mut self, hash: &[u8; SEM_INIT_HASH_SIZE]) {
        self.write_bytes(OFFSET_SEM_INIT_HASH, hash);
    }

    pub fn num_cores(&self) -> u32 {
        self.read_u32(OFFSET_NUM_CORES)
    }

    fn record_offset(&self, core_id: u32) -> Result<usize, LedgerError> {
        let num_cores = self.num_cores();
        if core_id >= num_cores {
            return Err(LedgerError::BadCoreId { core_id, num_cores });
        }
        Ok(OFFSET_RECORDS + RECORD_SIZE * core_id as usize)
    }

    /// Read one core record: (occupied, owner pid).
    pub fn core(&self, core_id: u32) -> Result<(bool, u64), LedgerError> {
        let off = self.record_offset(core_id)?;
        let mut occ = [0u8; 1];
        self.read_bytes(off + RECORD_OFFSET_OCCUPIED, &mut occ);
        let pid = self.read_u64(off + RECORD_OFFSET_PID);
        Ok((occ[0] != 0, pid))
    }

    pub fn set_core(&mut self, core_id: u32, occupied: bool, pid: u64) -> Result<(), LedgerError> {
        let off = self.record_offset(core_id)?;
        // Keep the whole occupancy lane deterministic, not just its first
        // byte.
        let mut lane = [0u8; 8];
        lane[0] = occupied as u8;
        self.write_bytes(off + RECORD_OFFSET_OCCUPIED, &lane);
        self.write_u64(off + RECORD_OFFSET_PID, pid);
        Ok(())
    }

    /// Visit every record; the closure may stop the walk by returning false.
    pub fn for_each_core(
        &self,
        mut f: impl FnMut(u32, bool, u64) -> bool,
    ) -> Result<(), LedgerError> {
        for core_id in 0..self.num_cores() {
            let (occupied, pid) = self.core(core_id)?;
            if !f(core_id, occupied, pid) {
                break;
            }
        }
        Ok(())
    }

    /// Occupancy summary for operator tooling.
    pub fn describe(&self) -> String {
        let num_cores = self.num_cores();
        let mut out = format!(
            "ledger: {:?} size:{} cores:{} hash:{}\n",
            self.head_message(),
            self.recorded_size(),
            num_cores,
            hex::encode(self.sem_init_hash()),
        );
        let mut used = 0u32;
        let _ = self.for_each_core(|core_id, occupied, pid| {
            if occupied {
                used += 1;
                out.push_str(&format!("  core {core_id}: pid {pid}\n"));
            }
            true
        });
        out.push_str(&format!("  {used}/{num_cores} cores occupied\n"));
        out
    }
}

// ---------------------------------------------------------------------------
// SysV shared-memory region
// ---------------------------------------------------------------------------

/// Fold a stable key string into a non-zero SysV key.
pub(crate) fn ipc_key_from_str(key_str: &str) -> libc::key_t {
    // FNV-1a, folded to 31 bits; zero is IPC_PRIVATE and must not be used.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in key_str.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    let folded = ((h >> 31) ^ h) & 0x7fff_ffff;
    let key = folded as libc::key_t;
    if key == 0 {
        1
    } else {
        key
    }
}

/// Attached SysV shared-memory segment. Detaches on drop; the kernel object
/// persists until explicitly removed.
#[derive(Debug)]
pub struct ShmRegion {
    shm_id: libc::c_int,
    addr: *mut libc::c_void,
    size: usize,
    created: bool,
}

unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create the segment (sized for `size` bytes) or attach the existing
    /// one. Returns the region and whether it already existed.
    pub fn create_or_attach(key_str: &str, size: usize) -> Result<(Self, bool), LedgerError> {
        let key = ipc_key_from_str(key_str);
        let id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o666) };
        if id >= 0 {
            let region = Self::attach_id(id, true)?;
            return Ok((region, false));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(LedgerError::Os(format!("shmget({key_str}): {err}")));
        }
        Ok((Self::attach_existing(key_str)?, true))
    }

    /// Attach an existing segment; fails when none exists.
    pub fn attach_existing(key_str: &str) -> Result<Self, LedgerError> {
        let key = ipc_key_from_str(key_str);
        let id = unsafe { libc::shmget(key, 0, 0o666) };
        if id < 0 {
            return Err(LedgerError::Os(format!(
                "shmget({key_str}): {}",
                std::io::Error::last_os_error()
            )));
        }
        Self::attach_id(id, false)
    }

    fn attach_id(id: libc::c_int, created: bool) -> Result<Self, LedgerError> {
        let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut stat) } != 0 {
            return Err(LedgerError::Os(format!(
                "shmctl(IPC_STAT): {}",
                std::io::Error::last_os_error()
            )));
        }
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(LedgerError::Os(format!(
                "shmat: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            shm_id: id,
            addr,
            size: stat.shm_segsz,
            created,
        })
    }

    /// Does a segment with this key exist?
    pub fn exists(key_str: &str) -> bool {
        let key = ipc_key_from_str(key_str);
        unsafe { libc::shmget(key, 0, 0o666) >= 0 }
    }

    /// Remove the kernel object. Only the creator or root may; everyone else
    /// gets [`LedgerError::PermissionDenied`].
    pub fn remove(key_str: &str) -> Result<(), LedgerError> {
        let key = ipc_key_from_str(key_str);
        let id = unsafe { libc::shmget(key, 0, 0o666) };
        if id < 0 {
            return Ok(()); // nothing to remove
        }
        if unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(LedgerError::PermissionDenied);
            }
            return Err(LedgerError::Os(format!("shmctl(IPC_RMID): {err}")));
        }
        Ok(())
    }

    pub fn addr(&self) -> *mut libc::c_void {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn shm_id(&self) -> libc::c_int {
        self.shm_id
    }

    /// Whether this process created the segment (first attacher).
    pub fn created_here(&self) -> bool {
        self.created
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_are_pinned() {
        assert_eq!(OFFSET_HEAD_MESSAGE, 0);
        assert_eq!(OFFSET_DATA_SIZE, 64);
        assert_eq!(OFFSET_SEM_INIT_HASH, 72);
        assert_eq!(OFFSET_NUM_CORES, 92);
        assert_eq!(OFFSET_RECORDS, 96);
        assert_eq!(ledger_size(8), 96 + 8 * 16);
    }

    #[test]
    fn init_verify_and_record_round_trip() {
        let mut buf = vec![0u8; ledger_size(4)];
        let mut ledger = Ledger::over_slice(&mut buf);
        ledger.init(4).unwrap();
        ledger.verify().unwrap();

        assert_eq!(ledger.head_message(), HEAD_MESSAGE);
        assert_eq!(ledger.num_cores(), 4);
        assert_eq!(ledger.sem_init_hash(), [0u8; SEM_INIT_HASH_SIZE]);

        ledger.set_core(2, true, 4321).unwrap();
        assert_eq!(ledger.core(2).unwrap(), (true, 4321));
        assert_eq!(ledger.core(0).unwrap(), (false, 0));
        assert!(matches!(
            ledger.core(4),
            Err(LedgerError::BadCoreId { core_id: 4, .. })
        ));

        ledger.set_core(2, false, 0).unwrap();
        assert_eq!(ledger.core(2).unwrap(), (false, 0));
    }

    #[test]
    fn verify_rejects_foreign_regions() {
        let mut buf = vec![0u8; ledger_size(2)];
        {
            let ledger = Ledger::over_slice(&mut buf);
            assert!(matches!(ledger.verify(), Err(LedgerError::Corrupt(_))));
        }
        {
            let mut ledger = Ledger::over_slice(&mut buf);
            ledger.init(2).unwrap();
        }
        // Clobber the head message.
        buf[0] = b'x';
        let ledger = Ledger::over_slice(&mut buf);
        assert!(matches!(ledger.verify(), Err(LedgerError::Corrupt(_))));
    }

    #[test]
    fn verify_rejects_size_mismatch() {
        let mut buf = vec![0u8; ledger_size(2) + 16];
        let mut ledger = Ledger::over_slice(&mut buf);
        // init() records the *region* size; numCores=2 then disagrees with
        // the padded region.
        ledger.init(2).unwrap();
        assert!(matches!(ledger.verify(), Err(LedgerError::Corrupt(_))));
    }

    #[test]
    fn ipc_keys_are_stable_and_distinct() {
        let a = ipc_key_from_str("AffinityInfoSharedMemoryKey");
        let b = ipc_key_from_str("AffinityInfoSharedMemoryTestKey");
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(a, ipc_key_from_str("AffinityInfoSharedMemoryKey"));
    }

    #[test]
    fn shm_region_create_attach_remove() {
        const KEY: &str = "PackgridLedgerUnitTest";
        let _ = ShmRegion::remove(KEY); // stale runs

        let size = ledger_size(4);
        let (region, existed) = ShmRegion::create_or_attach(KEY, size).unwrap();
        assert!(!existed);
        assert!(region.created_here());
        assert_eq!(region.size(), size);
        {
            let mut ledger = Ledger::over_shm(&region);
            ledger.init(4).unwrap();
            ledger.set_core(1, true, 777).unwrap();
        }

        // A second attach sees the same bytes.
        let second = ShmRegion::attach_existing(KEY).unwrap();
        {
            let ledger = Ledger::over_shm(&second);
            ledger.verify().unwrap();
            assert_eq!(ledger.core(1).unwrap(), (true, 777));
        }
        drop(second);
        drop(region);

        ShmRegion::remove(KEY).unwrap();
        assert!(!ShmRegion::exists(KEY));
    }
}
