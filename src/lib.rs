//! Shared-memory point-to-point descriptor queues.
//!
//! Two endpoints register large memory regions, then exchange fixed-size
//! descriptors naming sub-ranges of those regions over lock-free
//! single-producer/single-consumer rings. Payloads are never copied; a
//! descriptor transfers *ownership* of its sub-range, and the sender must
//! not touch the bytes until the peer hands them back on the reverse ring.
//!
//! Two shared-memory backends are provided. [`ffq`] packs each message into
//! a single cache line and signals slot occupancy in-band through a reserved
//! sentinel word. [`ipcq`] spends a cache-line-isolated acknowledge counter
//! per direction and a 64-bit sequence number per slot, which makes the
//! flow-control arithmetic explicit. [`loopback`] is a trivial in-process
//! backend for exercising the contract without a peer.
//!
//! The [`debug::DebugQueue`] wrapper shadows the local endpoint's buffer
//! ownership and turns protocol violations (double enqueue, returning a
//! buffer the receiver never owned) into errors before they corrupt memory.

/// Wire-format slot layouts and command encoding shared with the peer.
pub mod proto;

/// Named shared mappings (creator/joiner role resolution over `shm_open`).
pub mod shm;

pub mod queue;

pub mod ffq;
pub mod ipcq;
pub mod loopback;

pub use queue::debug;

pub use proto::DescFlags;
pub use queue::pool::{RegionId, RegionPool};
pub use queue::{Backend, Descriptor, Event, Queue, RegionCap};

pub(crate) struct LastErrno;

/// An OS error code captured from `errno`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub(crate) libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// The raw `errno` value.
    pub fn raw(self) -> libc::c_int {
        self.0
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

/// The single flat error type of every queue operation.
///
/// `QueueFull` and `QueueEmpty` are ordinary outcomes of a non-blocking data
/// path and callers retry them. `InvalidBufferArgs` and `BufferNotInUse`
/// indicate a protocol violation by the local caller or the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A descriptor lies outside its region or its valid range is inconsistent.
    #[error("descriptor out of region bounds or valid range inconsistent")]
    InvalidBufferArgs,
    /// No free slot in the transmit ring; retry after the peer drains.
    #[error("transmit ring is full")]
    QueueFull,
    /// No message pending in the receive ring.
    #[error("receive ring is empty")]
    QueueEmpty,
    /// The referenced region ID is not live on this endpoint.
    #[error("unknown region id")]
    InvalidRegionId,
    /// The candidate region overlaps a live registration or is empty.
    #[error("invalid region: empty or overlapping an existing registration")]
    InvalidRegionArgs,
    /// Teardown attempted while buffers are still outstanding.
    #[error("region still has outstanding buffers")]
    RegionDestroy,
    /// The peer returned a buffer this endpoint believed it still owned.
    #[error("dequeued buffer was not in flight")]
    BufferNotInUse,
    /// Setting up the queue or its shared mapping failed.
    #[error("queue setup failed: {0}")]
    InitQueue(Errno),
}
