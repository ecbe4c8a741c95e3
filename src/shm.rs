//! Named shared-memory segments.
//!
//! A queue pair lives in one POSIX shared-memory object. Whichever endpoint
//! wins the exclusive create becomes the *creator*: it sizes the object,
//! zero-fills it and runs the backend's one-time slot initialization before
//! the peer is allowed past `open`. The other endpoint opens the existing
//! object and becomes the *joiner*. The role also decides which half of the
//! mapping is the endpoint's transmit direction, so "creator TX" and
//! "joiner RX" always alias the same ring.
//!
//! Two endpoints may race `open` for the same name; exactly one wins the
//! exclusive create. So that the loser can never observe half-initialized
//! slots, the mapping carries one guard cache line past the payload with a
//! readiness word: the creator release-stores it after the init closure has
//! run, and a joiner blocks until the object is fully sized and that word
//! reads back. Payload offsets are unaffected by the guard line.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeSet;
use std::ffi::CString;

use spin::RwLock;
use tracing::debug;

use crate::{Errno, Error, LastErrno};

/// Readiness word once the creator's one-time initialization is complete.
const SEGMENT_READY: u64 = 0xC1EA_4E51_5245_4459;

/// Which side of the segment this endpoint ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Won the exclusive create; owns initialization and the name's lifetime.
    Creator,
    /// Attached to an object initialized by the peer.
    Joiner,
}

/// Set of (name, role) pairs attached in this process.
///
/// Each ring direction is strictly single-producer/single-consumer, so a
/// second endpoint with the same role on the same segment would silently
/// corrupt the cursors. Refuse it at construction time instead.
struct AttachSet {
    inner: RwLock<BTreeSet<(String, Role)>>,
}

static ATTACHED: AttachSet = AttachSet {
    inner: RwLock::new(BTreeSet::new()),
};

impl AttachSet {
    fn insert(&self, name: &str, role: Role) -> bool {
        let mut lock = self.inner.write();
        lock.insert((name.to_owned(), role))
    }

    fn remove(&self, name: &str, role: Role) {
        let mut lock = self.inner.write();
        lock.remove(&(name.to_owned(), role));
    }
}

/// A mapped shared-memory object underlying one queue pair.
#[derive(Debug)]
pub struct Segment {
    name: String,
    base: NonNull<u8>,
    /// Payload bytes, as requested by the caller.
    len: usize,
    /// Payload plus the trailing guard line; what is actually mapped.
    map_len: usize,
    role: Role,
}

// The mapping is shared with the peer by design; the `Segment` value itself
// has a single owner which may move between threads.
unsafe impl Send for Segment {}

impl From<LastErrno> for Error {
    fn from(LastErrno: LastErrno) -> Self {
        Error::InitQueue(Errno::new())
    }
}

impl Segment {
    /// Open the shared object `name`, creating it if it does not exist.
    ///
    /// The name follows `shm_open` conventions (a leading `/`, no further
    /// slashes). Exactly one of the endpoints racing this call observes a
    /// successful exclusive create and is handed [`Role::Creator`]; its
    /// `init` closure runs over the zero-filled payload before the object
    /// is published. A joiner's `init` never runs; the call blocks instead
    /// until the creator's initialization is visible.
    pub fn open(
        name: &str,
        len: usize,
        init: impl FnOnce(NonNull<u8>),
    ) -> Result<Self, Error> {
        assert!(len > 0, "empty segment requested");
        let cname =
            CString::new(name).map_err(|_| Error::InitQueue(Errno(libc::EINVAL)))?;

        // The readiness word lives in one guard line past the payload.
        let guard = len.next_multiple_of(64);
        let map_len = guard + 64;

        let mut role = Role::Creator;
        let mut fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };

        if fd < 0 {
            if Errno::new().raw() != libc::EEXIST {
                return Err(LastErrno)?;
            }

            role = Role::Joiner;
            fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
            if fd < 0 {
                return Err(LastErrno)?;
            }
        }

        struct OwnedFd(libc::c_int);

        impl Drop for OwnedFd {
            fn drop(&mut self) {
                unsafe { libc::close(self.0) };
            }
        }

        // The descriptor is only needed until the mapping exists.
        let fd = OwnedFd(fd);

        match role {
            Role::Creator => {
                // Sizing the fresh object also zero-fills it.
                if unsafe { libc::ftruncate(fd.0, map_len as libc::off_t) } != 0 {
                    unsafe { libc::shm_unlink(cname.as_ptr()) };
                    return Err(LastErrno)?;
                }
            }
            Role::Joiner => {
                // The object exists as soon as the creator's shm_open
                // returns, some time before it is sized; wait that out.
                loop {
                    let mut stat = unsafe { core::mem::zeroed::<libc::stat>() };
                    if unsafe { libc::fstat(fd.0, &mut stat) } != 0 {
                        return Err(LastErrno)?;
                    }
                    if stat.st_size as usize >= map_len {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }

        let mmap = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.0,
                0,
            )
        };

        if mmap == libc::MAP_FAILED {
            if role == Role::Creator {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
            return Err(LastErrno)?;
        }

        if !ATTACHED.insert(name, role) {
            unsafe { libc::munmap(mmap, map_len) };
            return Err(Error::InitQueue(Errno(libc::EBUSY)));
        }

        assert!(!mmap.is_null());
        // Safety: mmap succeeded, hence non-null.
        let base = unsafe { NonNull::new_unchecked(mmap as *mut u8) };
        // Safety: `guard` is in bounds and 8-aligned by construction.
        let ready =
            unsafe { &*(base.as_ptr().add(guard) as *const AtomicU64) };

        match role {
            Role::Creator => {
                init(base);
                // Publishes the initialized payload along with the flag.
                ready.store(SEGMENT_READY, Ordering::Release);
            }
            Role::Joiner => {
                while ready.load(Ordering::Acquire) != SEGMENT_READY {
                    std::thread::yield_now();
                }
            }
        }

        debug!(name, ?role, len, "attached shared segment");
        Ok(Segment {
            name: name.to_owned(),
            base,
            len,
            map_len,
            role,
        })
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_creator(&self) -> bool {
        self.role == Role::Creator
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut _, self.map_len) };

        if self.role == Role::Creator {
            if let Ok(cname) = CString::new(self.name.as_str()) {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
            }
        }

        ATTACHED.remove(&self.name, self.role);
        debug!(name = %self.name, role = ?self.role, "detached shared segment");
    }
}
