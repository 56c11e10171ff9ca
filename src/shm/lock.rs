//! Process-shared locks stored inline in the region header.
//!
//! Three kinds are supported, in order of preference:
//!   1. robust process-shared pthread mutex (Linux)
//!   2. process-shared POSIX semaphore (Linux)
//!   3. atomic spinlock, usable everywhere but not crash safe
//!
//! The kind is recorded in the header by the process that initializes the
//! region; every other process builds the same kind over the same bytes.
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::layout::LOCK_STORAGE_SIZE;
use crate::error::Corruption;

/// Lock primitive recorded in the header. Zero is never a valid kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LockKind {
    Mutex = 1,
    Semaphore = 2,
    Spin = 3,
}

impl LockKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(LockKind::Mutex),
            2 => Some(LockKind::Semaphore),
            3 => Some(LockKind::Spin),
            _ => None,
        }
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Whether the primitive stays correct when several processes map it.
    pub fn is_cross_process(self) -> bool {
        !matches!(self, LockKind::Spin)
    }

    /// Whether this build can construct the primitive at all.
    pub fn is_supported(self) -> bool {
        match self {
            LockKind::Spin => true,
            LockKind::Mutex | LockKind::Semaphore => cfg!(target_os = "linux"),
        }
    }
}

/// A lock living in shared memory.
pub trait RegionLock: Sized {
    /// Construct the primitive in place.
    ///
    /// # Safety
    /// `ptr` must point to `LOCK_STORAGE_SIZE` writable bytes, suitably
    /// aligned, that nobody else is using yet.
    unsafe fn init(ptr: *mut u8) -> io::Result<Self>;

    /// Use a primitive another process already constructed.
    ///
    /// # Safety
    /// `ptr` must point to storage previously passed to `init`, and stay
    /// mapped for as long as the lock is used.
    unsafe fn attach(ptr: *mut u8) -> Self;

    /// Block until the lock is held or `timeout` passes.
    fn acquire(&self, timeout: Duration) -> Result<(), Corruption>;

    fn release(&self);
}

/// Number of CAS attempts before yielding the CPU.
const SPIN_TRIES: u32 = 50;

/// Test-and-test-and-set spinlock over one u32 in shared memory.
pub struct SpinLock {
    word: *const AtomicU32,
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

impl RegionLock for SpinLock {
    unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
        std::ptr::write_bytes(ptr, 0, LOCK_STORAGE_SIZE);
        let lock = Self::attach(ptr);
        (*lock.word).store(0, Ordering::Release);
        Ok(lock)
    }

    unsafe fn attach(ptr: *mut u8) -> Self {
        SpinLock {
            word: ptr as *const AtomicU32,
        }
    }

    fn acquire(&self, timeout: Duration) -> Result<(), Corruption> {
        let word = unsafe { &*self.word };
        let deadline = Instant::now() + timeout;
        loop {
            for _ in 0..SPIN_TRIES {
                if word.load(Ordering::Relaxed) == 0
                    && word
                        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return Ok(());
                }
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return Err(Corruption::LockTimeout);
            }
            std::thread::yield_now();
        }
    }

    fn release(&self) {
        unsafe { &*self.word }.store(0, Ordering::Release);
    }
}

#[cfg(target_os = "linux")]
mod posix {
    use std::io;
    use std::time::Duration;

    use super::RegionLock;
    use crate::error::Corruption;
    use crate::shm::layout::LOCK_STORAGE_SIZE;

    const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= LOCK_STORAGE_SIZE);
    const _: () = assert!(std::mem::size_of::<libc::sem_t>() <= LOCK_STORAGE_SIZE);

    /// Absolute CLOCK_REALTIME deadline `timeout` from now.
    fn deadline_after(timeout: Duration) -> libc::timespec {
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let mut deadline = now;
        deadline.tv_sec = now.tv_sec.saturating_add(timeout.as_secs() as libc::time_t);
        deadline.tv_nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec = deadline.tv_sec.saturating_add(1);
            deadline.tv_nsec -= 1_000_000_000;
        }
        deadline
    }

    fn errno() -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// Robust, process-shared pthread mutex.
    pub struct MutexLock {
        mutex: *mut libc::pthread_mutex_t,
    }

    unsafe impl Send for MutexLock {}
    unsafe impl Sync for MutexLock {}

    impl RegionLock for MutexLock {
        unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
            std::ptr::write_bytes(ptr, 0, LOCK_STORAGE_SIZE);
            let mutex = ptr as *mut libc::pthread_mutex_t;

            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            let mut rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            }
            if rc == 0 {
                rc = libc::pthread_mutex_init(mutex, &attr);
            }
            libc::pthread_mutexattr_destroy(&mut attr);

            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(MutexLock { mutex })
        }

        unsafe fn attach(ptr: *mut u8) -> Self {
            MutexLock {
                mutex: ptr as *mut libc::pthread_mutex_t,
            }
        }

        fn acquire(&self, timeout: Duration) -> Result<(), Corruption> {
            let deadline = deadline_after(timeout);
            match unsafe { libc::pthread_mutex_timedlock(self.mutex, &deadline) } {
                0 => Ok(()),
                libc::EOWNERDEAD => {
                    // The data it guarded may be half written. Hand the lock
                    // back in a usable state and let the caller rebuild.
                    unsafe {
                        libc::pthread_mutex_consistent(self.mutex);
                        libc::pthread_mutex_unlock(self.mutex);
                    }
                    Err(Corruption::LockOwnerDied)
                }
                libc::ETIMEDOUT => Err(Corruption::LockTimeout),
                rc => Err(Corruption::LockFailed(rc)),
            }
        }

        fn release(&self) {
            unsafe { libc::pthread_mutex_unlock(self.mutex) };
        }
    }

    /// Process-shared POSIX semaphore with an initial count of one.
    pub struct SemaphoreLock {
        sem: *mut libc::sem_t,
    }

    unsafe impl Send for SemaphoreLock {}
    unsafe impl Sync for SemaphoreLock {}

    impl RegionLock for SemaphoreLock {
        unsafe fn init(ptr: *mut u8) -> io::Result<Self> {
            std::ptr::write_bytes(ptr, 0, LOCK_STORAGE_SIZE);
            let sem = ptr as *mut libc::sem_t;
            if libc::sem_init(sem, 1, 1) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(SemaphoreLock { sem })
        }

        unsafe fn attach(ptr: *mut u8) -> Self {
            SemaphoreLock {
                sem: ptr as *mut libc::sem_t,
            }
        }

        fn acquire(&self, timeout: Duration) -> Result<(), Corruption> {
            let deadline = deadline_after(timeout);
            loop {
                if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                    return Ok(());
                }
                match errno() {
                    libc::EINTR => continue,
                    libc::ETIMEDOUT => return Err(Corruption::LockTimeout),
                    rc => return Err(Corruption::LockFailed(rc)),
                }
            }
        }

        fn release(&self) {
            unsafe { libc::sem_post(self.sem) };
        }
    }

    /// Build and tear down a scratch mutex to see whether the platform
    /// supports robust process-shared mutexes.
    pub fn mutex_works() -> bool {
        let mut scratch = [0u64; LOCK_STORAGE_SIZE / 8];
        let ptr = scratch.as_mut_ptr() as *mut u8;
        match unsafe { MutexLock::init(ptr) } {
            Ok(lock) => {
                unsafe { libc::pthread_mutex_destroy(lock.mutex) };
                true
            }
            Err(_) => false,
        }
    }

    pub fn semaphore_works() -> bool {
        let mut scratch = [0u64; LOCK_STORAGE_SIZE / 8];
        let ptr = scratch.as_mut_ptr() as *mut u8;
        match unsafe { SemaphoreLock::init(ptr) } {
            Ok(lock) => {
                unsafe { libc::sem_destroy(lock.sem) };
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(target_os = "linux")]
pub use posix::{MutexLock, SemaphoreLock};

/// Pick the best lock kind this platform can actually construct.
pub fn probe() -> LockKind {
    #[cfg(target_os = "linux")]
    {
        if posix::mutex_works() {
            return LockKind::Mutex;
        }
        if posix::semaphore_works() {
            return LockKind::Semaphore;
        }
    }
    tracing::warn!("no process-shared lock available, falling back to a spinlock");
    LockKind::Spin
}

/// Concrete enum over every lock kind, dispatching without a vtable.
pub enum SharedLock {
    #[cfg(target_os = "linux")]
    Mutex(MutexLock),
    #[cfg(target_os = "linux")]
    Semaphore(SemaphoreLock),
    Spin(SpinLock),
}

impl SharedLock {
    /// Construct a lock of `kind` in place.
    ///
    /// # Safety
    /// Same contract as [`RegionLock::init`].
    pub unsafe fn init(kind: LockKind, ptr: *mut u8) -> io::Result<Self> {
        match kind {
            #[cfg(target_os = "linux")]
            LockKind::Mutex => MutexLock::init(ptr).map(SharedLock::Mutex),
            #[cfg(target_os = "linux")]
            LockKind::Semaphore => SemaphoreLock::init(ptr).map(SharedLock::Semaphore),
            LockKind::Spin => SpinLock::init(ptr).map(SharedLock::Spin),
            #[allow(unreachable_patterns)]
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{other:?} locks are not available on this platform"),
            )),
        }
    }

    /// Attach to the lock recorded in a header as `raw_kind`.
    ///
    /// # Safety
    /// Same contract as [`RegionLock::attach`].
    pub unsafe fn attach(raw_kind: u32, ptr: *mut u8) -> Result<Self, Corruption> {
        let kind = LockKind::from_raw(raw_kind).ok_or(Corruption::UnsupportedLock(raw_kind))?;
        match kind {
            #[cfg(target_os = "linux")]
            LockKind::Mutex => Ok(SharedLock::Mutex(MutexLock::attach(ptr))),
            #[cfg(target_os = "linux")]
            LockKind::Semaphore => Ok(SharedLock::Semaphore(SemaphoreLock::attach(ptr))),
            LockKind::Spin => Ok(SharedLock::Spin(SpinLock::attach(ptr))),
            #[allow(unreachable_patterns)]
            _ => Err(Corruption::UnsupportedLock(raw_kind)),
        }
    }

    pub fn kind(&self) -> LockKind {
        match self {
            #[cfg(target_os = "linux")]
            Self::Mutex(_) => LockKind::Mutex,
            #[cfg(target_os = "linux")]
            Self::Semaphore(_) => LockKind::Semaphore,
            Self::Spin(_) => LockKind::Spin,
        }
    }

    #[inline]
    pub fn acquire(&self, timeout: Duration) -> Result<(), Corruption> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Mutex(l) => l.acquire(timeout),
            #[cfg(target_os = "linux")]
            Self::Semaphore(l) => l.acquire(timeout),
            Self::Spin(l) => l.acquire(timeout),
        }
    }

    #[inline]
    pub fn release(&self) {
        match self {
            #[cfg(target_os = "linux")]
            Self::Mutex(l) => l.release(),
            #[cfg(target_os = "linux")]
            Self::Semaphore(l) => l.release(),
            Self::Spin(l) => l.release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Box<[u64; LOCK_STORAGE_SIZE / 8]> {
        Box::new([0u64; LOCK_STORAGE_SIZE / 8])
    }

    fn exercise(kind: LockKind) {
        let mut buf = storage();
        let ptr = buf.as_mut_ptr() as *mut u8;
        let lock = unsafe { SharedLock::init(kind, ptr) }.unwrap();
        assert_eq!(lock.kind(), kind);

        lock.acquire(Duration::from_secs(1)).unwrap();
        let other = unsafe { SharedLock::attach(kind.as_raw(), ptr) }.unwrap();
        assert_eq!(
            other.acquire(Duration::from_millis(20)),
            Err(Corruption::LockTimeout)
        );
        lock.release();
        other.acquire(Duration::from_secs(1)).unwrap();
        other.release();
    }

    #[test]
    fn spin_lock_times_out_while_held() {
        exercise(LockKind::Spin);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn semaphore_times_out_while_held() {
        exercise(LockKind::Semaphore);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mutex_times_out_while_held_by_another_thread() {
        // A pthread mutex cannot be re-locked by its owner, so hold it from
        // a second thread.
        let mut buf = storage();
        let addr = buf.as_mut_ptr() as usize;
        let lock = unsafe { SharedLock::init(LockKind::Mutex, addr as *mut u8) }.unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            let lock = unsafe { SharedLock::attach(1, addr as *mut u8) }.unwrap();
            lock.acquire(Duration::from_secs(1)).unwrap();
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            lock.release();
        });

        held_rx.recv().unwrap();
        assert_eq!(
            lock.acquire(Duration::from_millis(20)),
            Err(Corruption::LockTimeout)
        );
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        lock.acquire(Duration::from_secs(1)).unwrap();
        lock.release();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mutex_reports_dead_owner() {
        let mut buf = storage();
        let addr = buf.as_mut_ptr() as usize;
        let lock = unsafe { SharedLock::init(LockKind::Mutex, addr as *mut u8) }.unwrap();

        // Thread exits while holding a robust mutex.
        std::thread::spawn(move || {
            let lock = unsafe { SharedLock::attach(1, addr as *mut u8) }.unwrap();
            lock.acquire(Duration::from_secs(1)).unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(
            lock.acquire(Duration::from_secs(1)),
            Err(Corruption::LockOwnerDied)
        );
        // Made consistent and released, so usable again.
        lock.acquire(Duration::from_secs(1)).unwrap();
        lock.release();
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [LockKind::Mutex, LockKind::Semaphore, LockKind::Spin] {
            assert_eq!(LockKind::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(LockKind::from_raw(0), None);
        assert!(!LockKind::Spin.is_cross_process());
        assert!(LockKind::Mutex.is_cross_process());
    }

    #[test]
    fn unknown_kind_is_corruption() {
        let mut buf = storage();
        let ptr = buf.as_mut_ptr() as *mut u8;
        assert!(matches!(
            unsafe { SharedLock::attach(0, ptr) },
            Err(Corruption::UnsupportedLock(0))
        ));
        assert!(matches!(
            unsafe { SharedLock::attach(7, ptr) },
            Err(Corruption::UnsupportedLock(7))
        ));
    }

    #[test]
    fn probe_returns_a_supported_kind() {
        assert!(probe().is_supported());
    }
}
