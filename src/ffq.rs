//! The sentinel-flow-control backend.
//!
//! Each direction is an array of cache-line slots whose first word carries
//! both the message's region ID and the flow control: [`SLOT_EMPTY`] means
//! the producer may write, anything else means the consumer may read. There
//! are no shared cursors at all; each side keeps a private position and the
//! slot contents alone synchronize the pair, which keeps a message to a
//! single cache-line transfer.
//!
//! Region commands share the ring with data, multiplexed into the low bits
//! of the `flags` word, so a registration is ordered with the data
//! descriptors that follow it on the same direction.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use tracing::debug;

use crate::proto::{
    DescFlags, FfqSlot, CMD_DATA, CMD_DEREGISTER, CMD_MASK, CMD_REGISTER, SLOT_EMPTY,
};
use crate::queue::pool::RegionId;
use crate::queue::{Backend, Descriptor, Event, Queue, RegionCap, CTRL_CAPACITY};
use crate::shm::{Role, Segment};
use crate::Error;

/// Default slot count per direction.
pub const FFQ_SLOTS: u32 = 64;

/// Construction parameters of an FFQ pair.
///
/// Both endpoints must be configured identically; the slot count determines
/// the shared mapping's size and must be a power of two.
#[derive(Debug, Clone)]
pub struct FfqConfig {
    /// Slots per direction.
    pub slots: u32,
}

impl Default for FfqConfig {
    fn default() -> Self {
        FfqConfig { slots: FFQ_SLOTS }
    }
}

/// State shared by both ring views: the slot array and a private position.
struct FfqRing {
    slots: NonNull<FfqSlot>,
    mask: u32,
    /// Free-running; masked on every slot access.
    pos: u32,
}

impl FfqRing {
    /// # Safety
    ///
    /// `base` must point to `count` initialized `FfqSlot`s that outlive the
    /// ring and are only ever accessed by one producer and one consumer.
    unsafe fn new(base: NonNull<u8>, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        FfqRing {
            slots: base.cast(),
            mask: count - 1,
            pos: 0,
        }
    }

    fn slot(&self) -> &FfqSlot {
        let offset = (self.pos & self.mask) as usize;
        // Safety: in-bounds by the mask; aliasing with the peer goes through
        // the atomic head and the UnsafeCell body.
        unsafe { &*self.slots.as_ptr().add(offset) }
    }
}

/// The producer view of one direction.
struct RingProd {
    inner: FfqRing,
}

/// The consumer view of one direction.
struct RingCons {
    inner: FfqRing,
}

impl RingProd {
    /// Publish the six-word frame, word 0 last.
    fn send(&mut self, frame: [u64; 6]) -> Result<(), Error> {
        debug_assert!(frame[0] != SLOT_EMPTY, "frame head collides with the sentinel");

        let slot = self.inner.slot();
        if slot.head.load(Ordering::Acquire) != SLOT_EMPTY {
            return Err(Error::QueueFull);
        }

        // Safety: the sentinel proves the consumer is done with this slot.
        unsafe {
            *slot.body.get() = [frame[1], frame[2], frame[3], frame[4], frame[5]];
        }
        // The body writes above must be visible to whoever observes the head.
        slot.head.store(frame[0], Ordering::Release);

        self.inner.pos = self.inner.pos.wrapping_add(1);
        Ok(())
    }
}

impl RingCons {
    /// Take the next frame out and hand the slot back to the producer.
    fn recv(&mut self) -> Result<[u64; 6], Error> {
        let slot = self.inner.slot();
        let head = slot.head.load(Ordering::Acquire);
        if head == SLOT_EMPTY {
            return Err(Error::QueueEmpty);
        }

        // Safety: a published head proves the producer finished the body.
        let body = unsafe { *slot.body.get() };
        // Our body reads must complete before the producer may overwrite.
        slot.head.store(SLOT_EMPTY, Ordering::Release);

        self.inner.pos = self.inner.pos.wrapping_add(1);
        Ok([head, body[0], body[1], body[2], body[3], body[4]])
    }
}

/// An FFQ endpoint: two rings over one shared mapping.
pub struct Ffq {
    tx: RingProd,
    rx: RingCons,
    slots: u32,
    // Keeps the mapping (and the rings' backing memory) alive; dropped last.
    _seg: Segment,
}

// The raw slot pointers target the segment owned by this value; the
// endpoint as a whole may move between threads.
unsafe impl Send for Ffq {}

/// A ready-to-use FFQ endpoint with a fresh region pool.
pub fn queue(name: &str, config: &FfqConfig) -> Result<Queue<Ffq>, Error> {
    Ok(Queue::new(Ffq::open(name, config)?))
}

impl Ffq {
    /// Attach to (or create) the queue pair named `name`.
    ///
    /// The endpoint that wins the exclusive create marks every slot empty
    /// during the segment's one-time initialization (a zero head word would
    /// otherwise read as a published message) and takes the first half of
    /// the mapping as its transmit ring; the joiner blocks until that clear
    /// is published, then takes the mirror image, so each direction has
    /// exactly one producer and one consumer.
    pub fn open(name: &str, config: &FfqConfig) -> Result<Ffq, Error> {
        let slots = config.slots;
        if slots == 0 || !slots.is_power_of_two() {
            return Err(Error::InitQueue(crate::Errno(libc::EINVAL)));
        }

        let half = slots as usize * core::mem::size_of::<FfqSlot>();
        let seg = Segment::open(name, 2 * half, |base| {
            let all = base.cast::<FfqSlot>();
            for i in 0..(2 * slots) as usize {
                // Safety: the closure runs over the zero-filled payload
                // before any other endpoint can observe it.
                let slot = unsafe { &*all.as_ptr().add(i) };
                slot.head.store(SLOT_EMPTY, Ordering::Relaxed);
            }
        })?;
        let base = seg.as_ptr();
        debug_assert!(base.as_ptr() as usize % 64 == 0);

        let (tx_base, rx_base) = match seg.role() {
            Role::Creator => (base, unsafe { offset_ptr(base, half) }),
            Role::Joiner => (unsafe { offset_ptr(base, half) }, base),
        };

        debug!(name, role = ?seg.role(), slots, "ffq endpoint ready");
        Ok(Ffq {
            // Safety: both halves are inside the mapping, creator-initialized,
            // and the segment role guarantees the SPSC pairing.
            tx: RingProd {
                inner: unsafe { FfqRing::new(tx_base, slots) },
            },
            rx: RingCons {
                inner: unsafe { FfqRing::new(rx_base, slots) },
            },
            slots,
            _seg: seg,
        })
    }
}

/// # Safety
///
/// `bytes` must stay within the allocation `base` points into.
unsafe fn offset_ptr(base: NonNull<u8>, bytes: usize) -> NonNull<u8> {
    NonNull::new_unchecked(base.as_ptr().add(bytes))
}

impl Backend for Ffq {
    fn enqueue(&mut self, desc: &Descriptor) -> Result<(), Error> {
        let flags = desc.flags.bits();
        // The command bits belong to the transport on this ring.
        if flags & CMD_MASK != CMD_DATA {
            return Err(Error::InvalidBufferArgs);
        }

        self.tx.send([
            desc.region.0 as u64,
            desc.offset,
            desc.length,
            desc.valid_data,
            desc.valid_length,
            flags,
        ])
    }

    fn dequeue(&mut self) -> Result<Event, Error> {
        let frame = self.rx.recv()?;
        let rid = RegionId(frame[0] as u32);

        match frame[5] & CMD_MASK {
            CMD_REGISTER => Ok(Event::Registered {
                rid,
                cap: RegionCap {
                    vaddr: frame[1],
                    len: frame[2],
                    paddr: frame[3],
                },
            }),
            CMD_DEREGISTER => Ok(Event::Deregistered { rid }),
            CMD_DATA => Ok(Event::Data(Descriptor {
                region: rid,
                offset: frame[1],
                length: frame[2],
                valid_data: frame[3],
                valid_length: frame[4],
                flags: DescFlags::from_bits_retain(frame[5]),
            })),
            // The slot is already released; drop the frame, keep the ring.
            _ => Err(Error::InvalidBufferArgs),
        }
    }

    fn register(&mut self, rid: RegionId, cap: RegionCap) -> Result<(), Error> {
        // A REGISTER travels in the descriptor frame: (offset, length,
        // valid_data) carry (virtual base, byte length, physical base).
        self.tx.send([
            rid.0 as u64,
            cap.vaddr,
            cap.len,
            cap.paddr,
            0,
            CMD_REGISTER,
        ])
    }

    fn deregister(&mut self, rid: RegionId) -> Result<(), Error> {
        self.tx.send([rid.0 as u64, 0, 0, 0, 0, CMD_DEREGISTER])
    }

    fn control(&mut self, req: u64, _value: u64) -> Result<u64, Error> {
        match req {
            CTRL_CAPACITY => Ok(self.slots as u64),
            _ => Ok(0),
        }
    }
}
