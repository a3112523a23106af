// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the segment and lock primitives: an anonymous
// System V shared memory segment, and pthread mutex/rwlock objects
// initialised in process-shared mode at caller-provided addresses inside a
// segment.

use std::io;
use std::mem;
use std::ptr;

use log::warn;

// ---------------------------------------------------------------------------
// Robust mutex symbols, not exposed by the `libc` crate on all platforms.
// On macOS robust mutexes are not available, so they are not used there.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// SysvShm: anonymous System V shared memory segment
// ---------------------------------------------------------------------------

/// An attached System V shared memory segment.
///
/// A freshly acquired segment is created with `IPC_PRIVATE` and has its
/// identifier removed (`IPC_RMID`) immediately after the attach, so the
/// kernel reaps it when the last mapping drops, even on abnormal exit.
/// Other processes (or additional mappings in this one) join via
/// [`SysvShm::attach`] with the segment id, which stays valid for attaching
/// on Linux until the final detach.
pub struct SysvShm {
    shmid: i32,
    base: *mut u8,
    size: usize,
}

// Safety: the mapping is process-shared; every mutation of its contents is
// synchronized by locks living inside the segment.
unsafe impl Send for SysvShm {}
unsafe impl Sync for SysvShm {}

impl SysvShm {
    /// Create and attach a private segment of `size` bytes.
    ///
    /// With `hugetlb` set the segment is backed by huge pages on Linux; on
    /// other Unix systems the flag is ignored with a warning.
    pub fn acquire(size: usize, hugetlb: bool) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        #[allow(unused_mut)]
        let mut shmflag: libc::c_int = 0o600 | libc::IPC_CREAT | libc::IPC_EXCL;
        if hugetlb {
            #[cfg(target_os = "linux")]
            {
                shmflag |= libc::SHM_HUGETLB;
            }
            #[cfg(not(target_os = "linux"))]
            warn!("huge pages requested but not supported on this platform");
        }

        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, shmflag) };
        if shmid < 0 {
            return Err(io::Error::last_os_error());
        }

        let base = unsafe { libc::shmat(shmid, ptr::null(), 0) };

        // Remove the identifier right away so the segment is released when
        // the last mapping drops. If shmat failed, nobody maps it and the
        // kernel reclaims it immediately.
        unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };

        if base as isize == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            shmid,
            base: base as *mut u8,
            size,
        })
    }

    /// Attach an existing segment by id, recovering its size from the kernel.
    pub fn attach(shmid: i32) -> io::Result<Self> {
        let mut ds: libc::shmid_ds = unsafe { mem::zeroed() };
        if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let base = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if base as isize == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            shmid,
            base: base as *mut u8,
            size: ds.shm_segsz as usize,
        })
    }

    /// Mapping base in this process.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Segment length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The System V segment identifier.
    pub fn shmid(&self) -> i32 {
        self.shmid
    }
}

impl Drop for SysvShm {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        let ret = unsafe { libc::shmdt(self.base as *const libc::c_void) };
        if ret != 0 {
            warn!(
                "shmdt failed: {}, shmid {}, base {:p}",
                io::Error::last_os_error(),
                self.shmid,
                self.base
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Process-shared pthread mutex
// ---------------------------------------------------------------------------

/// Initialise a process-shared mutex at `mtx`.
///
/// The attribute object is destroyed before returning on every path; on
/// failure the storage at `mtx` must not be used. Non-macOS builds also set
/// `PTHREAD_MUTEX_ROBUST` so a holder dying does not wedge other processes.
///
/// # Safety
/// `mtx` must point to suitably aligned, writable storage of at least
/// `size_of::<pthread_mutex_t>()` bytes that no thread is currently using as
/// a live mutex.
pub unsafe fn mutex_init(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    #[cfg(not(target_os = "macos"))]
    {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
    }

    eno = libc::pthread_mutex_init(mtx, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Lock the mutex, recovering from `EOWNERDEAD` on robust builds.
///
/// # Safety
/// `mtx` must point to a mutex initialised by [`mutex_init`] inside a live
/// mapping.
pub unsafe fn mutex_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_lock(mtx);
    match eno {
        0 => Ok(()),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx);
            if eno2 != 0 {
                return Err(io::Error::from_raw_os_error(eno2));
            }
            Ok(())
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// Try to lock the mutex without blocking. `Ok(false)` means contended.
///
/// # Safety
/// Same contract as [`mutex_lock`].
pub unsafe fn mutex_trylock(mtx: *mut libc::pthread_mutex_t) -> io::Result<bool> {
    let eno = libc::pthread_mutex_trylock(mtx);
    match eno {
        0 => Ok(true),
        libc::EBUSY => Ok(false),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx);
            if eno2 != 0 {
                return Err(io::Error::from_raw_os_error(eno2));
            }
            Ok(true)
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// Unlock the mutex.
///
/// # Safety
/// Same contract as [`mutex_lock`]; the caller must hold the lock.
pub unsafe fn mutex_unlock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_unlock(mtx);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Process-shared pthread rwlock
// ---------------------------------------------------------------------------

/// Initialise a process-shared read-write lock at `rw`.
///
/// # Safety
/// `rw` must point to suitably aligned, writable storage of at least
/// `size_of::<pthread_rwlock_t>()` bytes that is not a live rwlock.
pub unsafe fn rwlock_init(rw: *mut libc::pthread_rwlock_t) -> io::Result<()> {
    ptr::write_bytes(rw, 0, 1);

    let mut attr: libc::pthread_rwlockattr_t = mem::zeroed();
    let mut eno = libc::pthread_rwlockattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_rwlockattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_rwlock_init(rw, &attr);
    libc::pthread_rwlockattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Acquire the lock shared.
///
/// # Safety
/// `rw` must point to a rwlock initialised by [`rwlock_init`] inside a live
/// mapping.
pub unsafe fn rwlock_rdlock(rw: *mut libc::pthread_rwlock_t) -> io::Result<()> {
    let eno = libc::pthread_rwlock_rdlock(rw);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Acquire the lock exclusive.
///
/// # Safety
/// Same contract as [`rwlock_rdlock`].
pub unsafe fn rwlock_wrlock(rw: *mut libc::pthread_rwlock_t) -> io::Result<()> {
    let eno = libc::pthread_rwlock_wrlock(rw);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Release a shared or exclusive hold.
///
/// # Safety
/// Same contract as [`rwlock_rdlock`]; the caller must hold the lock.
pub unsafe fn rwlock_unlock(rw: *mut libc::pthread_rwlock_t) -> io::Result<()> {
    let eno = libc::pthread_rwlock_unlock(rw);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}
