//! On-wire layout of the shared rings.
//!
//! Everything in this module is mapped into memory shared with the peer, so
//! the exact byte layout is part of the protocol. All slots occupy one
//! 64-byte cache line: the producer and consumer each poll a single line per
//! message and never falsely share it with a neighboring slot.

use core::cell::UnsafeCell;
use core::sync::atomic::AtomicU64;

/// In-band command discriminator: an ordinary data descriptor.
pub const CMD_DATA: u64 = 0;
/// In-band command discriminator: mirror a region registration to the peer.
pub const CMD_REGISTER: u64 = 1;
/// In-band command discriminator: retire a mirrored region.
pub const CMD_DEREGISTER: u64 = 2;
/// Mask extracting the command bits from a descriptor `flags` word on rings
/// that multiplex commands in-band.
pub const CMD_MASK: u64 = 0x3;

/// The "slot empty" sentinel in the first word of a sentinel-flow-control
/// slot. Region IDs are 32 bits, so the first word of a published message is
/// always well below this value.
pub const SLOT_EMPTY: u64 = u64::MAX;

/// Number of payload words following the publish word of a [`FfqSlot`].
pub const FFQ_BODY_WORDS: usize = 5;

bitflags::bitflags! {
    /// The opaque per-descriptor flags word.
    ///
    /// The queue does not interpret flags beyond the bits named here; any
    /// other bit travels to the peer unchanged. On sentinel-flow-control
    /// rings the low two bits are reserved for in-band commands and must be
    /// zero in application descriptors.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u64 {
        /// Marks the final descriptor of a chain.
        const LAST = 1 << 30;
    }
}

/// One slot of a sentinel-flow-control ring.
///
/// The layout is six 64-bit words plus padding to a full cache line:
///
/// ```text
/// word 0   publish word: SLOT_EMPTY, or the region ID of a message
/// word 1   offset
/// word 2   length
/// word 3   valid_data       (REGISTER: physical base address)
/// word 4   valid_length
/// word 5   flags            (low two bits carry the command)
/// ```
///
/// For a `CMD_REGISTER` frame, words 1 and 2 carry the region's virtual base
/// and byte length instead.
///
/// The publish word doubles as the flow control: the consumer resets it to
/// [`SLOT_EMPTY`] once the body has been copied out, which is what hands the
/// slot back to the producer. Body words are only written while the slot is
/// empty and only read after an acquire load of the publish word, hence the
/// plain (non-atomic) cell.
#[repr(C, align(64))]
pub struct FfqSlot {
    /// Publish word, written last by the producer with release ordering.
    pub head: AtomicU64,
    /// Payload words 1..=5.
    pub body: UnsafeCell<[u64; FFQ_BODY_WORDS]>,
    _pad: [u64; 2],
}

impl FfqSlot {
    /// An empty slot, as the creator initializes the shared array.
    pub const fn new_empty() -> Self {
        FfqSlot {
            head: AtomicU64::new(SLOT_EMPTY),
            body: UnsafeCell::new([0; FFQ_BODY_WORDS]),
            _pad: [0; 2],
        }
    }
}

/// Message body of a sequence-flow-control slot.
///
/// `cmd` and `region` are widened to 64 bits so the struct tiles a cache
/// line without internal padding.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IpcMsg {
    pub cmd: u64,
    pub region: u64,
    pub offset: u64,
    pub length: u64,
    pub valid_data: u64,
    pub valid_length: u64,
    pub flags: u64,
}

/// One slot of a sequence-flow-control ring.
///
/// `seq` publishes the slot: the producer stores `messages_sent + 1` with
/// release ordering after filling the body, and the consumer treats the slot
/// as readable once an acquire load observes a value greater than its own
/// consumed count. A fresh zero-filled mapping therefore reads as "nothing
/// published" everywhere.
#[repr(C, align(64))]
pub struct IpcSlot {
    pub seq: AtomicU64,
    pub body: UnsafeCell<IpcMsg>,
}

impl IpcSlot {
    /// A never-published slot, equal to the zero-filled initial state.
    pub const fn new_empty() -> Self {
        IpcSlot {
            seq: AtomicU64::new(0),
            body: UnsafeCell::new(IpcMsg {
                cmd: 0,
                region: 0,
                offset: 0,
                length: 0,
                valid_data: 0,
                valid_length: 0,
                flags: 0,
            }),
        }
    }
}

/// A consumer-owned acknowledge counter, padded to a full cache line so the
/// producer polling it never contends with the descriptor slots.
#[repr(C, align(64))]
pub struct AckLine {
    pub value: AtomicU64,
    _pad: [u64; 7],
}

impl AckLine {
    pub const fn new() -> Self {
        AckLine {
            value: AtomicU64::new(0),
            _pad: [0; 7],
        }
    }
}

impl Default for AckLine {
    fn default() -> Self {
        Self::new()
    }
}

const _NO_PADDING: () = {
    // Each shared structure must tile cache lines exactly. Keep in sync.
    assert!(core::mem::size_of::<FfqSlot>() == 64);
    assert!(core::mem::align_of::<FfqSlot>() == 64);
    assert!(core::mem::size_of::<IpcMsg>() == 56);
    assert!(core::mem::size_of::<IpcSlot>() == 64);
    assert!(core::mem::align_of::<IpcSlot>() == 64);
    assert!(core::mem::size_of::<AckLine>() == 64);
};
