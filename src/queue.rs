//! The backend-independent queue contract.
//!
//! A [`Queue`] binds a [`RegionPool`] to one transport [`Backend`]. All
//! descriptor traffic passes through the pool's bounds checks: outbound to
//! stop the local application from describing memory it never registered,
//! inbound to stop a buggy or malicious peer from handing us one. In-band
//! region commands surfaced by the backend are applied to the pool and
//! reported through the user callbacks before `dequeue` returns the next
//! data descriptor, so both endpoints agree on the live region IDs without
//! a side channel.

use tracing::{debug, trace};

use crate::proto::DescFlags;
use crate::Error;

pub mod debug;
pub mod pool;

use pool::{RegionId, RegionPool};

/// `control` request answered by every in-tree backend: usable ring slots.
pub const CTRL_CAPACITY: u64 = 0;

/// A buffer descriptor, the unit of exchange.
///
/// Identifies `[offset, offset + length)` within a registered region, with a
/// valid sub-range `[valid_data, valid_data + valid_length)` relative to the
/// buffer start. Enqueueing a descriptor transfers ownership of the whole
/// buffer range to the peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub region: RegionId,
    pub offset: u64,
    pub length: u64,
    pub valid_data: u64,
    pub valid_length: u64,
    pub flags: DescFlags,
}

impl Descriptor {
    /// A descriptor whose valid range spans the whole buffer.
    pub fn new(region: RegionId, offset: u64, length: u64) -> Self {
        Descriptor {
            region,
            offset,
            length,
            valid_data: 0,
            valid_length: length,
            flags: DescFlags::empty(),
        }
    }
}

/// A capability describing a contiguous memory region.
///
/// Base addresses are opaque to the queue; only the physical range takes
/// part in overlap checks. The region bytes themselves are owned and mapped
/// by the application.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegionCap {
    /// Virtual base address in the registering endpoint.
    pub vaddr: u64,
    /// Physical (or otherwise endpoint-independent) base address.
    pub paddr: u64,
    /// Region length in bytes.
    pub len: u64,
}

impl RegionCap {
    pub fn new(vaddr: u64, paddr: u64, len: u64) -> Self {
        RegionCap { vaddr, paddr, len }
    }
}

/// One message surfaced by a backend's receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An application data descriptor.
    Data(Descriptor),
    /// The peer registered a region; mirror it under the same ID.
    Registered { rid: RegionId, cap: RegionCap },
    /// The peer deregistered a region.
    Deregistered { rid: RegionId },
}

/// Transport operations a queue backend supplies.
///
/// Every hook is synchronous and non-blocking; `enqueue`/`dequeue` report
/// [`Error::QueueFull`]/[`Error::QueueEmpty`] instead of waiting (backends
/// may spin on the command path in `register`/`deregister` only). Each ring
/// direction is strictly single-producer/single-consumer: a backend value
/// is the sole handle to its endpoint state.
pub trait Backend {
    /// Place a (pre-validated) descriptor into the transmit ring.
    fn enqueue(&mut self, desc: &Descriptor) -> Result<(), Error>;

    /// Take the next message out of the receive ring.
    ///
    /// The ring cursor advances even when the caller later rejects the
    /// descriptor, so one malformed message never wedges the channel.
    fn dequeue(&mut self) -> Result<Event, Error>;

    /// Announce a locally registered region to the peer.
    fn register(&mut self, rid: RegionId, cap: RegionCap) -> Result<(), Error>;

    /// Announce a local deregistration to the peer.
    fn deregister(&mut self, rid: RegionId) -> Result<(), Error>;

    /// Kick the peer. Shared-memory transports signal through the ring
    /// write itself, so the default is a no-op.
    fn notify(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Backend-specific tuning. Request [`CTRL_CAPACITY`] reports the
    /// usable slot count; other codes are reserved.
    fn control(&mut self, req: u64, value: u64) -> Result<u64, Error>;
}

type RegisteredFn = Box<dyn FnMut(RegionId, RegionCap) + Send>;
type DeregisteredFn = Box<dyn FnMut(RegionId) + Send>;

/// A descriptor queue endpoint over backend `B`.
pub struct Queue<B> {
    pool: RegionPool,
    backend: B,
    on_registered: Option<RegisteredFn>,
    on_deregistered: Option<DeregisteredFn>,
}

impl<B: Backend> Queue<B> {
    /// Bind `backend` to a fresh region pool.
    pub fn new(backend: B) -> Self {
        Queue::with_pool(backend, RegionPool::new())
    }

    /// Bind `backend` to a caller-constructed pool (deterministic seeds in
    /// tests).
    pub fn with_pool(backend: B, pool: RegionPool) -> Self {
        Queue {
            pool,
            backend,
            on_registered: None,
            on_deregistered: None,
        }
    }

    /// Install a callback invoked inside [`dequeue`](Self::dequeue) after a
    /// peer-originated registration has been applied to the local pool.
    pub fn on_region_registered(
        &mut self,
        f: impl FnMut(RegionId, RegionCap) + Send + 'static,
    ) {
        self.on_registered = Some(Box::new(f));
    }

    /// Install a callback invoked after a peer-originated deregistration.
    pub fn on_region_deregistered(&mut self, f: impl FnMut(RegionId) + Send + 'static) {
        self.on_deregistered = Some(Box::new(f));
    }

    /// Hand ownership of the buffer named by `desc` to the peer.
    pub fn enqueue(&mut self, desc: Descriptor) -> Result<(), Error> {
        self.pool.validate(&desc)?;
        self.backend.enqueue(&desc)
    }

    /// Receive the next data descriptor, applying any pending in-band
    /// region commands on the way.
    pub fn dequeue(&mut self) -> Result<Descriptor, Error> {
        loop {
            match self.backend.dequeue()? {
                Event::Data(desc) => {
                    // The slot is already consumed; a bad peer descriptor
                    // costs one message, not the channel.
                    self.pool.validate(&desc)?;
                    return Ok(desc);
                }
                Event::Registered { rid, cap } => {
                    trace!(rid = rid.0, ?cap, "applying peer registration");
                    self.pool.add_with_id(cap, rid)?;
                    if let Some(cb) = &mut self.on_registered {
                        cb(rid, cap);
                    }
                }
                Event::Deregistered { rid } => {
                    trace!(rid = rid.0, "applying peer deregistration");
                    self.pool.remove(rid)?;
                    if let Some(cb) = &mut self.on_deregistered {
                        cb(rid);
                    }
                }
            }
        }
    }

    /// Register a region, reserving a local ID and announcing it to the
    /// peer. The ID is valid for local use as soon as this returns.
    pub fn register(&mut self, cap: RegionCap) -> Result<RegionId, Error> {
        let rid = self.pool.add(cap)?;

        if let Err(err) = self.backend.register(rid, cap) {
            // Without the announcement the peer would reject every
            // descriptor for this ID; undo the reservation.
            let _ = self.pool.remove(rid);
            return Err(err);
        }

        debug!(rid = rid.0, len = cap.len, "registered region");
        Ok(rid)
    }

    /// Deregister a live region, returning its capability.
    pub fn deregister(&mut self, rid: RegionId) -> Result<RegionCap, Error> {
        let cap = self.pool.remove(rid)?;

        if let Err(err) = self.backend.deregister(rid) {
            let _ = self.pool.add_with_id(cap, rid);
            return Err(err);
        }

        debug!(rid = rid.0, "deregistered region");
        Ok(cap)
    }

    /// Kick the peer (backend-defined, usually a no-op).
    pub fn notify(&mut self) -> Result<(), Error> {
        self.backend.notify()
    }

    /// Backend-specific tuning; see [`Backend::control`].
    pub fn control(&mut self, req: u64, value: u64) -> Result<u64, Error> {
        self.backend.control(req, value)
    }

    /// Tear the queue down, reporting [`Error::RegionDestroy`] if regions
    /// were still registered (the leak check of the pool). The backend and
    /// its shared mapping are released either way.
    pub fn destroy(mut self) -> Result<(), Error> {
        self.pool.destroy()?;
        Ok(())
    }

    /// The local region pool.
    pub fn pool(&self) -> &RegionPool {
        &self.pool
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
