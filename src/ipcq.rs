//! The sequence-counter backend.
//!
//! Where [`ffq`](crate::ffq) folds all flow control into the slot contents,
//! this backend keeps it explicit: every slot carries a monotonically
//! increasing 64-bit sequence number, and each direction has one
//! cache-line-isolated acknowledge counter written by the consumer and
//! polled by the producer. The arithmetic (`sent - acked < usable`) makes
//! the capacity reasoning direct, at the cost of one extra cache line per
//! direction. One slot per ring is held back so a full ring and an empty
//! ring are never confused.
//!
//! Commands travel as ordinary slots with a non-zero `cmd` word. The
//! command send path is the only place allowed to busy-wait: a registration
//! must not be reordered after data descriptors enqueued later on the same
//! side.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use tracing::debug;

use crate::proto::{AckLine, DescFlags, IpcMsg, IpcSlot, CMD_DATA, CMD_DEREGISTER, CMD_REGISTER};
use crate::queue::pool::RegionId;
use crate::queue::{Backend, Descriptor, Event, Queue, RegionCap, CTRL_CAPACITY};
use crate::shm::{Role, Segment};
use crate::Error;

/// Default slot count per direction (one of which is reserved).
pub const IPCQ_SLOTS: u32 = 64;

/// Construction parameters of an IPCQ pair.
#[derive(Debug, Clone)]
pub struct IpcqConfig {
    /// Slots per direction; usable capacity is one less.
    pub slots: u32,
}

impl Default for IpcqConfig {
    fn default() -> Self {
        IpcqConfig { slots: IPCQ_SLOTS }
    }
}

/// Producer view of one direction: writes slots, polls the peer's acks.
struct IpcProd {
    ack: NonNull<AckLine>,
    slots: NonNull<IpcSlot>,
    mask: u64,
    usable: u64,
    /// Messages published so far.
    sent: u64,
}

/// Consumer view of one direction: reads slots, publishes its ack count.
struct IpcCons {
    ack: NonNull<AckLine>,
    slots: NonNull<IpcSlot>,
    mask: u64,
    /// Messages consumed so far.
    consumed: u64,
}

impl IpcProd {
    /// # Safety
    ///
    /// `chan` must point to an initialized channel (ack line followed by
    /// `count` slots) outliving this view, with this side as sole producer.
    unsafe fn new(chan: NonNull<u8>, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        IpcProd {
            ack: chan.cast(),
            slots: offset_ptr(chan, core::mem::size_of::<AckLine>()).cast(),
            mask: u64::from(count) - 1,
            usable: u64::from(count) - 1,
            sent: 0,
        }
    }

    fn can_send(&self) -> bool {
        let acked = unsafe { self.ack.as_ref() }.value.load(Ordering::Acquire);
        self.sent - acked < self.usable
    }

    fn send(&mut self, msg: IpcMsg) -> Result<(), Error> {
        if !self.can_send() {
            return Err(Error::QueueFull);
        }

        let slot = unsafe { &*self.slots.as_ptr().add((self.sent & self.mask) as usize) };
        // Safety: the capacity predicate proves the consumer acknowledged
        // the previous lap of this slot.
        unsafe {
            *slot.body.get() = msg;
        }
        // Publish: a zero-filled mapping means "nothing sent", so the slot
        // word is the 1-based message number.
        slot.seq.store(self.sent + 1, Ordering::Release);
        self.sent += 1;
        Ok(())
    }
}

impl IpcCons {
    /// # Safety
    ///
    /// As for [`IpcProd::new`], with this side as sole consumer.
    unsafe fn new(chan: NonNull<u8>, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        IpcCons {
            ack: chan.cast(),
            slots: offset_ptr(chan, core::mem::size_of::<AckLine>()).cast(),
            mask: u64::from(count) - 1,
            consumed: 0,
        }
    }

    fn recv(&mut self) -> Result<IpcMsg, Error> {
        let slot =
            unsafe { &*self.slots.as_ptr().add((self.consumed & self.mask) as usize) };
        if slot.seq.load(Ordering::Acquire) <= self.consumed {
            return Err(Error::QueueEmpty);
        }

        // Safety: the sequence word published this lap's body.
        let msg = unsafe { *slot.body.get() };
        self.consumed += 1;
        // Our body read is ordered before the ack that frees the slot.
        unsafe { self.ack.as_ref() }
            .value
            .store(self.consumed, Ordering::Release);
        Ok(msg)
    }
}

/// # Safety
///
/// `bytes` must stay within the allocation `base` points into.
unsafe fn offset_ptr(base: NonNull<u8>, bytes: usize) -> NonNull<u8> {
    NonNull::new_unchecked(base.as_ptr().add(bytes))
}

/// An IPCQ endpoint: two channels over one shared mapping.
pub struct Ipcq {
    tx: IpcProd,
    rx: IpcCons,
    // Keeps the mapping alive; dropped last.
    _seg: Segment,
}

// Raw pointers target the owned segment; single owner, movable.
unsafe impl Send for Ipcq {}

/// A ready-to-use IPCQ endpoint with a fresh region pool.
pub fn queue(name: &str, config: &IpcqConfig) -> Result<Queue<Ipcq>, Error> {
    Ok(Queue::new(Ipcq::open(name, config)?))
}

impl Ipcq {
    /// Attach to (or create) the queue pair named `name`.
    ///
    /// Mapping layout, from the creator's point of view: its transmit
    /// channel (ack line, then slots) at offset 0 and its receive channel at
    /// `chan_bytes`. The joiner takes the mirror image. A fresh zero-filled
    /// mapping is already the valid initial state (sequence words start
    /// publishing at 1 and ack counters at 0), so the creator's one-time
    /// initialization has nothing to do.
    pub fn open(name: &str, config: &IpcqConfig) -> Result<Ipcq, Error> {
        let slots = config.slots;
        if slots < 2 || !slots.is_power_of_two() {
            return Err(Error::InitQueue(crate::Errno(libc::EINVAL)));
        }

        let chan_bytes = core::mem::size_of::<AckLine>()
            + slots as usize * core::mem::size_of::<IpcSlot>();
        let seg = Segment::open(name, 2 * chan_bytes, |_| {})?;
        let base = seg.as_ptr();
        debug_assert!(base.as_ptr() as usize % 64 == 0);

        let (tx_chan, rx_chan) = match seg.role() {
            Role::Creator => (base, unsafe { offset_ptr(base, chan_bytes) }),
            Role::Joiner => (unsafe { offset_ptr(base, chan_bytes) }, base),
        };

        debug!(name, role = ?seg.role(), slots, "ipcq endpoint ready");
        Ok(Ipcq {
            // Safety: the channels are disjoint halves of the mapping and
            // the segment role guarantees the SPSC pairing.
            tx: unsafe { IpcProd::new(tx_chan, slots) },
            rx: unsafe { IpcCons::new(rx_chan, slots) },
            _seg: seg,
        })
    }
}

impl Backend for Ipcq {
    fn enqueue(&mut self, desc: &Descriptor) -> Result<(), Error> {
        self.tx.send(IpcMsg {
            cmd: CMD_DATA,
            region: desc.region.0 as u64,
            offset: desc.offset,
            length: desc.length,
            valid_data: desc.valid_data,
            valid_length: desc.valid_length,
            flags: desc.flags.bits(),
        })
    }

    fn dequeue(&mut self) -> Result<Event, Error> {
        let msg = self.rx.recv()?;
        let rid = RegionId(msg.region as u32);

        match msg.cmd {
            CMD_DATA => Ok(Event::Data(Descriptor {
                region: rid,
                offset: msg.offset,
                length: msg.length,
                valid_data: msg.valid_data,
                valid_length: msg.valid_length,
                flags: DescFlags::from_bits_retain(msg.flags),
            })),
            CMD_REGISTER => Ok(Event::Registered {
                rid,
                cap: RegionCap {
                    vaddr: msg.offset,
                    len: msg.length,
                    paddr: msg.valid_data,
                },
            }),
            CMD_DEREGISTER => Ok(Event::Deregistered { rid }),
            // Slot already consumed and acked; drop the frame, keep the ring.
            _ => Err(Error::InvalidBufferArgs),
        }
    }

    fn register(&mut self, rid: RegionId, cap: RegionCap) -> Result<(), Error> {
        let msg = IpcMsg {
            cmd: CMD_REGISTER,
            region: rid.0 as u64,
            offset: cap.vaddr,
            length: cap.len,
            valid_data: cap.paddr,
            ..Default::default()
        };
        loop {
            match self.tx.send(msg) {
                Ok(()) => return Ok(()),
                Err(Error::QueueFull) => core::hint::spin_loop(),
                Err(err) => return Err(err),
            }
        }
    }

    fn deregister(&mut self, rid: RegionId) -> Result<(), Error> {
        let msg = IpcMsg {
            cmd: CMD_DEREGISTER,
            region: rid.0 as u64,
            ..Default::default()
        };
        loop {
            match self.tx.send(msg) {
                Ok(()) => return Ok(()),
                Err(Error::QueueFull) => core::hint::spin_loop(),
                Err(err) => return Err(err),
            }
        }
    }

    fn control(&mut self, req: u64, _value: u64) -> Result<u64, Error> {
        match req {
            CTRL_CAPACITY => Ok(self.tx.usable),
            _ => Ok(0),
        }
    }
}
