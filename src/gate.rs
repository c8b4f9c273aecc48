//! Cross-process gate protecting the affinity ledger.
//!
//! One binary SysV semaphore, keyed by a stable string (a separate test key
//! keeps unit tests away from production state). Locking blocks with a
//! caller-supplied fractional-second timeout and reports expiry as a plain
//! `false` rather than an error. All operations use SEM_UNDO so the kernel
//! releases a holder that dies mid-section.
//!
//! Creation is racy by SysV design: a process can attach the semaphore
//! before its creator finished initializing the protected state. The ledger
//! resolves this with an init-completion hash: the creator takes the lock,
//! initializes every record, then publishes the SHA-1 of the key phrase
//! concatenated with the decimal semaphore id. Attachers wait (bounded) for
//! that hash before trusting the ledger and may remove-and-recreate a
//! semaphore whose creator died before publishing.

use sha1::{Digest, Sha1};

use crate::ledger::ipc_key_from_str;

/// Production semaphore key.
pub const GATE_KEY: &str = "AffinityMapTable";
/// Isolated key for tests.
pub const GATE_TEST_KEY: &str = "AffinityMapTableTest";

/// Key phrase hashed (with the decimal semaphore id appended) into the
/// ledger once initialization completed.
pub const INIT_COMPLETE_PHRASE: &str = "AffinityMapTableSemaphoreInitialized";

/// Gate failures. A lock timeout is not an error.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("semaphore: {0}")]
    Os(String),
    #[error("semaphore was removed while in use")]
    Removed,
    #[error("only the creator or root may remove the semaphore")]
    PermissionDenied,
}

/// One binary SysV semaphore.
#[derive(Debug)]
pub struct Gate {
    sem_id: libc::c_int,
    created: bool,
}

impl Gate {
    /// Create the semaphore (initialized unlocked) or attach the existing
    /// one. Returns the gate and whether this call created it.
    pub fn open(key_str: &str) -> Result<(Self, bool), GateError> {
        let key = ipc_key_from_str(key_str);
        let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | 0o666) };
        if id >= 0 {
            // Fresh semaphore: publish it unlocked.
            if unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as libc::c_int) } != 0 {
                return Err(GateError::Os(format!(
                    "semctl(SETVAL): {}",
                    std::io::Error::last_os_error()
                )));
            }
            return Ok((
                Self {
                    sem_id: id,
                    created: true,
                },
                true,
            ));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(GateError::Os(format!("semget({key_str}): {err}")));
        }
        let id = unsafe { libc::semget(key, 1, 0o666) };
        if id < 0 {
            return Err(GateError::Os(format!(
                "semget({key_str}): {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok((
            Self {
                sem_id: id,
                created: false,
            },
            false,
        ))
    }

    /// Does a semaphore with this key exist?
    pub fn exists(key_str: &str) -> bool {
        let key = ipc_key_from_str(key_str);
        unsafe { libc::semget(key, 1, 0o666) >= 0 }
    }

    pub fn sem_id(&self) -> libc::c_int {
        self.sem_id
    }

    pub fn created_here(&self) -> bool {
        self.created
    }

    /// Take the gate, blocking up to `timeout_sec` (fractional seconds).
    /// Returns false on deadline expiry without taking the gate.
    pub fn lock_timeout(&self, timeout_sec: f32) -> Result<bool, GateError> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: -1,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        let timeout_sec = timeout_sec.max(0.0) as f64;
        let timeout = libc::timespec {
            tv_sec: timeout_sec as libc::time_t,
            tv_nsec: ((timeout_sec.fract()) * 1e9) as libc::c_long,
        };
        loop {
            // libc doesn't expose a semtimedop wrapper (glibc only versioned
            // it recently), so call the syscall directly.
            let rc = unsafe {
                libc::syscall(libc::SYS_semtimedop, self.sem_id, &mut op, 1usize, &timeout)
            };
            if rc == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false), // deadline expired
                Some(libc::EINTR) => continue,
                Some(libc::EIDRM) | Some(libc::EINVAL) => return Err(GateError::Removed),
                _ => return Err(GateError::Os(format!("semtimedop: {err}"))),
            }
        }
    }

    /// Release the gate.
    pub fn unlock(&self) -> Result<(), GateError> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: 1,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        if unsafe { libc::semop(self.sem_id, &mut op, 1) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EIDRM) {
                return Err(GateError::Removed);
            }
            return Err(GateError::Os(format!("semop(unlock): {err}")));
        }
        Ok(())
    }

    /// Remove the kernel object (creator or root only).
    pub fn remove(&self) -> Result<(), GateError> {
        if unsafe { libc::semctl(self.sem_id, 0, libc::IPC_RMID) } != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EPERM) => Err(GateError::PermissionDenied),
                Some(libc::EIDRM) | Some(libc::EINVAL) => Ok(()), // already gone
                _ => Err(GateError::Os(format!("semctl(IPC_RMID): {err}"))),
            };
        }
        Ok(())
    }

    /// Init-completion hash: SHA-1 of the key phrase followed by the
    /// decimal semaphore id. The textual form is wire-observable; tests pin
    /// it.
    pub fn init_hash(sem_id: libc::c_int) -> [u8; 20] {
        let digest = Sha1::digest(format!("{INIT_COMPLETE_PHRASE}{sem_id}").as_bytes());
        digest.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_hash_uses_decimal_id() {
        let expected: [u8; 20] =
            Sha1::digest(b"AffinityMapTableSemaphoreInitialized42").into();
        assert_eq!(Gate::init_hash(42), expected);
        assert_ne!(Gate::init_hash(42), Gate::init_hash(43));
    }

    #[test]
    fn lock_unlock_and_timeout() {
        const KEY: &str = "PackgridGateUnitTest";
        let (gate, _) = Gate::open(KEY).unwrap();

        assert!(gate.lock_timeout(1.0).unwrap());
        // Held: a zero-timeout attempt reports expiry, not an error.
        assert!(!gate.lock_timeout(0.0).unwrap());
        gate.unlock().unwrap();
        assert!(gate.lock_timeout(0.0).unwrap());
        gate.unlock().unwrap();

        gate.remove().unwrap();
        assert!(!Gate::exists(KEY));
    }

    #[test]
    fn reopen_attaches_existing() {
        const KEY: &str = "PackgridGateReopenTest";
        let (first, created) = Gate::open(KEY).unwrap();
        assert!(created);
        let (second, created_again) = Gate::open(KEY).unwrap();
        assert!(!created_again);
        assert_eq!(first.sem_id(), second.sem_id());
        first.remove().unwrap();
    }
}
