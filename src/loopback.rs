//! In-process loopback backend.
//!
//! A bounded FIFO where the endpoint talks to itself: whatever it enqueues
//! comes back on its own dequeue path. No shared memory, no peer and no
//! commands: the reference implementation of the [`Backend`](crate::Backend)
//! contract and the substrate for exercising layers above it.

use std::collections::VecDeque;

use crate::queue::pool::RegionId;
use crate::queue::{Backend, Descriptor, Event, Queue, RegionCap, CTRL_CAPACITY};
use crate::Error;

/// Default FIFO capacity, matching the shared-memory rings.
pub const LOOPBACK_SLOTS: usize = 64;

/// The self-connected FIFO backend.
pub struct Loopback {
    ring: VecDeque<Descriptor>,
    slots: usize,
}

/// A loopback endpoint with a fresh pool.
pub fn queue() -> Queue<Loopback> {
    Queue::new(Loopback::default())
}

impl Loopback {
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0);
        Loopback {
            ring: VecDeque::with_capacity(slots),
            slots,
        }
    }

    /// Messages currently in the FIFO.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Loopback::new(LOOPBACK_SLOTS)
    }
}

impl Backend for Loopback {
    fn enqueue(&mut self, desc: &Descriptor) -> Result<(), Error> {
        if self.ring.len() == self.slots {
            return Err(Error::QueueFull);
        }
        self.ring.push_back(*desc);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Event, Error> {
        match self.ring.pop_front() {
            Some(desc) => Ok(Event::Data(desc)),
            None => Err(Error::QueueEmpty),
        }
    }

    // Both ends of the loop share one pool, which the queue layer has
    // already updated; there is no peer to inform.
    fn register(&mut self, _rid: RegionId, _cap: RegionCap) -> Result<(), Error> {
        Ok(())
    }

    fn deregister(&mut self, _rid: RegionId) -> Result<(), Error> {
        Ok(())
    }

    fn control(&mut self, req: u64, _value: u64) -> Result<u64, Error> {
        match req {
            CTRL_CAPACITY => Ok(self.slots as u64),
            _ => Ok(0),
        }
    }
}
