// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Buddy allocator over a System V shared memory segment.
//
// The segment starts with `ShmHead` (free-list sentinels, per-class
// counters, the segment mutex) and the rest is carved into power-of-two
// chunks. Everything inside the segment is linked by offsets, never
// pointers, so every attaching process sees a consistent structure at its
// own mapping base. A single process-shared mutex in the header serializes
// all free-list and chunk-header mutation.

use std::fmt;
use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use log::{trace, warn};

use crate::offset::{self, Offset};
use crate::platform::posix;
use crate::platform::SysvShm;
use crate::shm_list::{self, ShmList};

/// Smallest size class: `2^6` = 64 bytes.
pub const MCLASS_MIN_BITS: u32 = 6;
/// Largest size class: `2^31` = 2 GiB.
pub const MCLASS_MAX_BITS: u32 = 31;
/// Physical size of the smallest chunk.
pub const MCLASS_MIN_SIZE: usize = 1 << MCLASS_MIN_BITS;

const NUM_CLASSES: usize = MCLASS_MAX_BITS as usize + 1;

/// Header at the start of every chunk, free or allocated. Callers receive the
/// address of the `list` field; the class and active flag sit immediately
/// before it and are recovered by the fixed displacement `CHUNK_OVERHEAD`.
#[repr(C)]
struct ShmChunk {
    mclass: u8,
    active: bool,
    list: ShmList,
}

const CHUNK_OVERHEAD: usize = mem::offset_of!(ShmChunk, list);

/// Segment header, always at offset 0. Never freed; its lifetime is the
/// segment's.
#[repr(C)]
struct ShmHead {
    shmid: i32,
    segment_size: u64,
    free_list: [ShmList; NUM_CLASSES],
    num_active: [u32; NUM_CLASSES],
    num_free: [u32; NUM_CLASSES],
    lock: libc::pthread_mutex_t,
}

fn chunk_of_node(node: *mut ShmList) -> *mut ShmChunk {
    (node as *mut u8).wrapping_sub(CHUNK_OVERHEAD) as *mut ShmChunk
}

fn chunk_of_payload(addr: *mut u8) -> *mut ShmChunk {
    addr.wrapping_sub(CHUNK_OVERHEAD) as *mut ShmChunk
}

/// Size class for a request: the smallest class whose chunk holds `size`
/// payload bytes plus the chunk header prefix. `None` when the request can
/// never be satisfied.
fn request_class(size: usize) -> Option<u32> {
    let bytes = size.checked_add(CHUNK_OVERHEAD)?;
    let mut mclass = usize::BITS - (bytes - 1).leading_zeros();
    if mclass < MCLASS_MIN_BITS {
        mclass = MCLASS_MIN_BITS;
    }
    if mclass > MCLASS_MAX_BITS {
        return None;
    }
    Some(mclass)
}

// RAII hold on the segment mutex. Unlock failures in Drop are ignored.
struct SegmentGuard {
    lock: *mut libc::pthread_mutex_t,
}

impl SegmentGuard {
    unsafe fn acquire(head: *mut ShmHead) -> io::Result<Self> {
        let lock = ptr::addr_of_mut!((*head).lock);
        posix::mutex_lock(lock)?;
        Ok(Self { lock })
    }
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        let _ = unsafe { posix::mutex_unlock(self.lock) };
    }
}

/// A shared-memory chunk pool.
///
/// One process bootstraps the segment; any number of processes attach it by
/// segment id. Dropping the pool detaches this process's mapping; the kernel
/// reaps the segment itself once the last mapping is gone (the identifier
/// was removed at bootstrap).
pub struct ShmPool {
    shm: SysvShm,
}

// Safety: all mutable header state is protected by the in-segment
// process-shared mutex, and allocated payloads are owned by their callers.
unsafe impl Send for ShmPool {}
unsafe impl Sync for ShmPool {}

impl ShmPool {
    /// Create a segment of `size` bytes, carve the header, seed the free
    /// lists and initialise the segment mutex.
    ///
    /// `size` must be large enough to hold the segment header and at most
    /// `2^MCLASS_MAX_BITS` (2 GiB), the largest range a single size class
    /// can describe.
    pub fn bootstrap(size: usize, hugetlb: bool) -> io::Result<Self> {
        if size < mem::size_of::<ShmHead>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment smaller than the segment header",
            ));
        }
        if size as u64 > 1u64 << MCLASS_MAX_BITS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment larger than the maximum size class",
            ));
        }

        let shm = SysvShm::acquire(size, hugetlb)?;
        let pool = Self { shm };
        unsafe { pool.format()? };
        Ok(pool)
    }

    /// Attach an existing, already bootstrapped segment by id.
    ///
    /// The header (including its mutex) was initialised exactly once by the
    /// bootstrapping process and is never re-initialised here.
    pub fn attach(shmid: i32) -> io::Result<Self> {
        let shm = SysvShm::attach(shmid)?;
        let pool = Self { shm };
        let head = pool.head();
        if unsafe { (*head).segment_size } != pool.shm.size() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment header does not match the attached mapping",
            ));
        }
        Ok(pool)
    }

    fn head(&self) -> *mut ShmHead {
        self.shm.base() as *mut ShmHead
    }

    /// This process's mapping base.
    pub fn base(&self) -> *mut u8 {
        self.shm.base()
    }

    /// Segment length in bytes.
    pub fn segment_size(&self) -> usize {
        self.shm.size()
    }

    /// The System V id other processes attach with.
    pub fn shmid(&self) -> i32 {
        self.shm.shmid()
    }

    /// Offset of an address in this pool's mapping. Null maps to 0.
    pub fn addr_to_offset(&self, addr: *const u8) -> Offset {
        offset::addr_to_offset(self.base(), addr)
    }

    /// Address of an offset in this pool's mapping. 0 maps to null.
    pub fn offset_to_addr(&self, off: Offset) -> *mut u8 {
        offset::offset_to_addr(self.base(), off)
    }

    /// Allocate a chunk with at least `size` usable bytes.
    ///
    /// Returns `None` when the request exceeds the largest class or the
    /// segment cannot supply a chunk even after splitting larger ones; the
    /// pool state is unchanged in that case.
    pub fn alloc(&self, size: usize) -> Option<*mut u8> {
        let mclass = request_class(size)?;
        let head = self.head();
        let base = self.base();

        unsafe {
            let _guard = SegmentGuard::acquire(head).ok()?;

            let sentinel = ptr::addr_of_mut!((*head).free_list[mclass as usize]);
            if shm_list::is_empty(base, sentinel) && !self.split(mclass + 1) {
                return None;
            }

            let node = offset::offset_to_addr(base, (*sentinel).next) as *mut ShmList;
            let chunk = chunk_of_node(node);
            debug_assert_eq!((*chunk).mclass as u32, mclass);
            debug_assert!(!(*chunk).active);

            shm_list::del(base, node);
            (*head).num_free[mclass as usize] -= 1;
            (*chunk).active = true;
            (*head).num_active[mclass as usize] += 1;

            Some(ptr::addr_of_mut!((*chunk).list) as *mut u8)
        }
    }

    /// Return a chunk to the pool and eagerly coalesce it with its buddy as
    /// far as the free lists allow.
    ///
    /// # Safety
    /// `addr` must be a value previously returned by [`ShmPool::alloc`] on a
    /// pool mapping this same segment, not freed since. Null is ignored.
    pub unsafe fn free(&self, addr: *mut u8) {
        if addr.is_null() {
            return;
        }
        let head = self.head();
        let base = self.base();
        let mut chunk = chunk_of_payload(addr);

        let guard = match SegmentGuard::acquire(head) {
            Ok(g) => g,
            Err(e) => {
                warn!("segment lock failed in free: {e}");
                return;
            }
        };

        let mut mclass = (*chunk).mclass as u32;
        debug_assert!((MCLASS_MIN_BITS..=MCLASS_MAX_BITS).contains(&mclass));
        debug_assert!((*chunk).active);

        (*chunk).active = false;
        (*head).num_active[mclass as usize] -= 1;

        let segment_size = (*head).segment_size;
        let mut off = offset::addr_to_offset(base, chunk as *const u8);

        // While the buddy is also free and of the same class, absorb it and
        // promote the surviving chunk one class up.
        while mclass < MCLASS_MAX_BITS {
            let buddy_off = off ^ (1u64 << mclass);

            // The first carved chunk's buddy position lands inside the
            // segment header; the last one's can stick out past an uncarved
            // tail. Neither is a chunk.
            if (buddy_off as usize) < mem::size_of::<ShmHead>() {
                break;
            }
            if buddy_off + (1u64 << mclass) > segment_size {
                break;
            }

            let buddy = offset::offset_to_addr(base, buddy_off) as *mut ShmChunk;
            if (*buddy).active || (*buddy).mclass as u32 != mclass {
                break;
            }

            shm_list::del(base, ptr::addr_of_mut!((*buddy).list));
            (*head).num_free[mclass as usize] -= 1;

            mclass += 1;
            off &= !((1u64 << mclass) - 1);
            chunk = offset::offset_to_addr(base, off) as *mut ShmChunk;
            (*chunk).mclass = mclass as u8;
            (*chunk).active = false;
        }

        shm_list::add(
            base,
            ptr::addr_of_mut!((*head).free_list[mclass as usize]),
            ptr::addr_of_mut!((*chunk).list),
        );
        (*head).num_free[mclass as usize] += 1;

        drop(guard);
    }

    // Take a free chunk of `mclass` (splitting upward as needed) and divide
    // it into two buddies of the class below. Called with the segment lock
    // held; false means nothing splittable exists at or above `mclass`.
    unsafe fn split(&self, mclass: u32) -> bool {
        if mclass > MCLASS_MAX_BITS {
            return false;
        }
        debug_assert!(mclass > MCLASS_MIN_BITS);

        let head = self.head();
        let base = self.base();

        let sentinel = ptr::addr_of_mut!((*head).free_list[mclass as usize]);
        if shm_list::is_empty(base, sentinel) && !self.split(mclass + 1) {
            return false;
        }

        let node = offset::offset_to_addr(base, (*sentinel).next) as *mut ShmList;
        let chunk = chunk_of_node(node);
        debug_assert_eq!((*chunk).mclass as u32, mclass);

        shm_list::del(base, node);
        (*head).num_free[mclass as usize] -= 1;

        let half = mclass - 1;
        let off = offset::addr_to_offset(base, chunk as *const u8);
        let buddy = offset::offset_to_addr(base, off + (1u64 << half)) as *mut ShmChunk;

        (*chunk).mclass = half as u8;
        (*chunk).active = false;
        (*buddy).mclass = half as u8;
        (*buddy).active = false;

        let half_sentinel = ptr::addr_of_mut!((*head).free_list[half as usize]);
        shm_list::add(base, half_sentinel, ptr::addr_of_mut!((*chunk).list));
        shm_list::add(base, half_sentinel, ptr::addr_of_mut!((*buddy).list));
        (*head).num_free[half as usize] += 2;

        true
    }

    // Write the segment header and seed the free lists. The seeding loop
    // always emits the largest chunk the current offset is aligned to, so
    // every carved chunk starts on a multiple of its own size and buddy
    // arithmetic holds from the first free.
    unsafe fn format(&self) -> io::Result<()> {
        let head = self.head();
        let base = self.base();

        (*head).shmid = self.shm.shmid();
        (*head).segment_size = self.shm.size() as u64;

        for m in 0..NUM_CLASSES {
            shm_list::init(base, ptr::addr_of_mut!((*head).free_list[m]));
            (*head).num_active[m] = 0;
            (*head).num_free[m] = 0;
        }

        // The allocatable region starts at the smallest power of two
        // strictly beyond the header, and never below the smallest class.
        let mut off = (mem::size_of::<ShmHead>() as u64 + 1).next_power_of_two();
        if off < MCLASS_MIN_SIZE as u64 {
            off = MCLASS_MIN_SIZE as u64;
        }

        let segment_size = (*head).segment_size;
        while segment_size.saturating_sub(off) >= MCLASS_MIN_SIZE as u64 {
            let mut mclass = off.trailing_zeros().min(MCLASS_MAX_BITS);
            while mclass > 0 && off + (1u64 << mclass) > segment_size {
                mclass -= 1;
            }
            if mclass < MCLASS_MIN_BITS {
                break;
            }

            let chunk = offset::offset_to_addr(base, off) as *mut ShmChunk;
            (*chunk).mclass = mclass as u8;
            (*chunk).active = false;
            shm_list::add(
                base,
                ptr::addr_of_mut!((*head).free_list[mclass as usize]),
                ptr::addr_of_mut!((*chunk).list),
            );
            (*head).num_free[mclass as usize] += 1;

            trace!("seeded chunk: offset {off:#x}, class {mclass}");
            off += 1u64 << mclass;
        }

        posix::mutex_init(ptr::addr_of_mut!((*head).lock))
    }

    /// Snapshot the per-class counters under the segment lock.
    pub fn stats(&self) -> io::Result<SegmentStats> {
        let head = self.head();
        unsafe {
            let _guard = SegmentGuard::acquire(head)?;
            Ok(SegmentStats {
                shmid: (*head).shmid,
                segment_size: (*head).segment_size,
                num_active: (*head).num_active,
                num_free: (*head).num_free,
            })
        }
    }

    /// Every free chunk as `(offset, mclass)`, walked under the segment
    /// lock. Diagnostic helper; the order is the free-list order.
    pub fn free_chunks(&self) -> io::Result<Vec<(Offset, u32)>> {
        let head = self.head();
        let base = self.base();
        let mut out = Vec::new();
        unsafe {
            let _guard = SegmentGuard::acquire(head)?;
            for m in MCLASS_MIN_BITS..=MCLASS_MAX_BITS {
                let sentinel = ptr::addr_of_mut!((*head).free_list[m as usize]);
                let mut node = offset::offset_to_addr(base, (*sentinel).next) as *mut ShmList;
                while node != sentinel {
                    let chunk = chunk_of_node(node);
                    out.push((
                        offset::addr_to_offset(base, chunk as *const u8),
                        (*chunk).mclass as u32,
                    ));
                    node = offset::offset_to_addr(base, (*node).next) as *mut ShmList;
                }
            }
        }
        Ok(out)
    }
}

/// A counter snapshot taken by [`ShmPool::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub shmid: i32,
    pub segment_size: u64,
    pub num_active: [u32; NUM_CLASSES],
    pub num_free: [u32; NUM_CLASSES],
}

impl SegmentStats {
    /// Bytes currently handed out to callers (whole chunks, headers
    /// included).
    pub fn total_active_bytes(&self) -> u64 {
        (0..NUM_CLASSES)
            .map(|m| self.num_active[m] as u64 * (1u64 << m))
            .sum()
    }

    /// Bytes currently sitting on free lists.
    pub fn total_free_bytes(&self) -> u64 {
        (0..NUM_CLASSES)
            .map(|m| self.num_free[m] as u64 * (1u64 << m))
            .sum()
    }
}

// Human-only dump; not a stable interface.
impl fmt::Display for SegmentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "segment id: {}, size: {}",
            self.shmid, self.segment_size
        )?;
        for m in MCLASS_MIN_BITS as usize..NUM_CLASSES {
            let (scaled, unit) = match m {
                0..=9 => (1u64 << m, "B"),
                10..=19 => (1u64 << (m - 10), "KB"),
                20..=29 => (1u64 << (m - 20), "MB"),
                _ => (1u64 << (m - 30), "GB"),
            };
            writeln!(
                f,
                "{:>4}{:<2}: {:>8} used, {:>8} free",
                scaled, unit, self.num_active[m], self.num_free[m]
            )?;
        }
        writeln!(f, "total active: {}", self.total_active_bytes())?;
        writeln!(f, "total free:   {}", self.total_free_bytes())?;
        write!(
            f,
            "total size:   {}",
            self.total_active_bytes() + self.total_free_bytes()
        )
    }
}

// ---------------------------------------------------------------------------
// Process-wide pool
// ---------------------------------------------------------------------------

fn global_pool() -> &'static OnceLock<ShmPool> {
    static POOL: OnceLock<ShmPool> = OnceLock::new();
    &POOL
}

/// The process-wide pool published by [`init`], if any.
pub fn global() -> Option<&'static ShmPool> {
    global_pool().get()
}

/// Bootstrap a segment and publish it as the process-wide pool.
///
/// Fails with `AlreadyExists` if a pool was already published; the extra
/// segment created by the losing caller is detached and reaped.
pub fn init(size: usize, hugetlb: bool) -> io::Result<&'static ShmPool> {
    init_with(size, hugetlb, |_| Ok(()))
}

/// Like [`init`], but runs `buf_init` (typically the buffer manager's own
/// setup) against the published pool before returning. An error from the
/// callback is propagated; the pool itself stays published.
pub fn init_with<F>(size: usize, hugetlb: bool, buf_init: F) -> io::Result<&'static ShmPool>
where
    F: FnOnce(&'static ShmPool) -> io::Result<()>,
{
    let pool = ShmPool::bootstrap(size, hugetlb)?;
    if global_pool().set(pool).is_err() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "shared memory pool already initialized",
        ));
    }
    let Some(published) = global() else {
        return Err(io::Error::other("pool missing after publish"));
    };
    buf_init(published)?;
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_class_reserves_header_room() {
        // 56 payload bytes + 8 header bytes exactly fill the smallest chunk.
        assert_eq!(request_class(1), Some(MCLASS_MIN_BITS));
        assert_eq!(request_class(56), Some(MCLASS_MIN_BITS));
        assert_eq!(request_class(57), Some(MCLASS_MIN_BITS + 1));
        assert_eq!(request_class(100), Some(7));
    }

    #[test]
    fn request_class_rejects_oversize() {
        assert_eq!(request_class(usize::MAX), None);
        assert_eq!(request_class((1usize << MCLASS_MAX_BITS) + 1), None);
    }

    #[test]
    fn chunk_header_layout() {
        // The payload pointer is the list field; class and flag sit in the
        // bytes before it.
        assert_eq!(CHUNK_OVERHEAD, 8);
        assert_eq!(mem::size_of::<ShmChunk>(), 24);
    }
}
