//! Ownership debugging.
//!
//! [`DebugQueue`] wraps a [`Queue`] and shadows, per region, the set of byte
//! ranges the local endpoint currently owns (is free to enqueue). Every
//! operation is checked against that shadow before it reaches the wrapped
//! backend, which turns the two classic descriptor-queue bugs (enqueueing a
//! buffer twice, and receiving back a buffer we never gave away) into
//! immediate errors instead of silent data races.
//!
//! The shadow is an ordered map from interval start to interval length, one
//! entry per disjoint owned range. A freshly registered region owns its full
//! extent; enqueueing carves a hole, a successful dequeue fills one back in,
//! coalescing with its neighbors.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::warn;

use crate::queue::pool::RegionId;
use crate::queue::{Backend, Descriptor, Queue, RegionCap};
use crate::Error;

struct ShadowRegion {
    len: u64,
    /// The length was learned by watching descriptors, not from a local
    /// registration; it may still grow as larger offsets are observed.
    grows: bool,
    /// start -> length of each owned interval, pairwise disjoint.
    free: BTreeMap<u64, u64>,
}

/// Operation tag in the post-mortem history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOp {
    Enqueue,
    Dequeue,
    Register,
    Deregister,
}

/// One recorded operation.
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry {
    pub op: HistoryOp,
    pub region: RegionId,
    pub offset: u64,
    pub length: u64,
    /// Whether the operation passed the ownership checks.
    pub ok: bool,
}

/// Number of operations retained for post-mortem inspection.
pub const HISTORY_DEPTH: usize = 128;

struct History {
    ring: VecDeque<HistoryEntry>,
    depth: usize,
}

impl History {
    fn record(&mut self, entry: HistoryEntry) {
        if self.ring.len() == self.depth {
            self.ring.pop_front();
        }
        self.ring.push_back(entry);
    }
}

/// An ownership-checking wrapper around a [`Queue`].
pub struct DebugQueue<B> {
    inner: Queue<B>,
    regions: HashMap<RegionId, ShadowRegion>,
    history: History,
}

impl<B: Backend> DebugQueue<B> {
    pub fn new(inner: Queue<B>) -> Self {
        Self::with_history_depth(inner, HISTORY_DEPTH)
    }

    pub fn with_history_depth(inner: Queue<B>, depth: usize) -> Self {
        DebugQueue {
            inner,
            regions: HashMap::new(),
            history: History {
                ring: VecDeque::with_capacity(depth),
                depth,
            },
        }
    }

    /// Enqueue `desc`, first proving the local endpoint owns its range.
    ///
    /// A range that is not fully inside one owned interval (because it was
    /// already enqueued, or never belonged to the region) fails with
    /// [`Error::InvalidBufferArgs`] and the wrapped backend is not invoked.
    pub fn enqueue(&mut self, desc: Descriptor) -> Result<(), Error> {
        let res = self.enqueue_checked(&desc);
        self.history.record(HistoryEntry {
            op: HistoryOp::Enqueue,
            region: desc.region,
            offset: desc.offset,
            length: desc.length,
            ok: res.is_ok(),
        });
        res
    }

    fn enqueue_checked(&mut self, desc: &Descriptor) -> Result<(), Error> {
        let end = desc
            .offset
            .checked_add(desc.length)
            .ok_or(Error::InvalidBufferArgs)?;

        let region = self
            .regions
            .get(&desc.region)
            .ok_or(Error::InvalidRegionId)?;

        // The owned interval that could contain the buffer is the one with
        // the greatest start <= offset.
        let owned = region
            .free
            .range(..=desc.offset)
            .next_back()
            .map(|(&start, &len)| (start, len));
        let (start, len) = match owned {
            Some((start, len)) if end <= start + len => (start, len),
            _ => {
                warn!(
                    rid = desc.region.0,
                    offset = desc.offset,
                    length = desc.length,
                    "enqueue of a buffer the endpoint does not own"
                );
                return Err(Error::InvalidBufferArgs);
            }
        };

        self.inner.enqueue(*desc)?;

        // Ownership moved to the peer: carve the range out. Depending on
        // alignment this removes, trims or splits the interval.
        let region = self.regions.get_mut(&desc.region).expect("checked above");
        region.free.remove(&start);
        if desc.offset > start {
            region.free.insert(start, desc.offset - start);
        }
        if end < start + len {
            region.free.insert(end, start + len - end);
        }
        Ok(())
    }

    /// Dequeue the next descriptor and reclaim ownership of its range.
    ///
    /// A returned range that overlaps something the endpoint already owns
    /// means the peer violated the protocol; it fails with
    /// [`Error::BufferNotInUse`].
    pub fn dequeue(&mut self) -> Result<Descriptor, Error> {
        let desc = self.inner.dequeue()?;
        // Bounds were validated by the inner queue, the sum cannot wrap.
        let end = desc.offset + desc.length;

        let region = self
            .regions
            .entry(desc.region)
            .or_insert_with(|| ShadowRegion {
                // First sighting of a region the peer registered: track what
                // has been observed of it so far.
                len: end,
                grows: true,
                free: BTreeMap::new(),
            });
        if region.grows && end > region.len {
            region.len = end;
        }

        // Any owned interval starting below `end` whose end reaches past
        // `offset` intersects the returned range.
        let clash = region
            .free
            .range(..end)
            .next_back()
            .is_some_and(|(&start, &len)| start + len > desc.offset);
        let ok = !clash;

        self.history.record(HistoryEntry {
            op: HistoryOp::Dequeue,
            region: desc.region,
            offset: desc.offset,
            length: desc.length,
            ok,
        });

        if clash {
            warn!(
                rid = desc.region.0,
                offset = desc.offset,
                length = desc.length,
                "peer returned a buffer this endpoint still owned"
            );
            return Err(Error::BufferNotInUse);
        }

        // Insert, coalescing with an abutting predecessor and successor.
        let mut start = desc.offset;
        let mut len = desc.length;
        if let Some((&prev, &prev_len)) = region.free.range(..start).next_back() {
            if prev + prev_len == start {
                region.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = region.free.get(&end) {
            region.free.remove(&end);
            len += next_len;
        }
        region.free.insert(start, len);

        Ok(desc)
    }

    /// Register a region locally; the endpoint starts out owning all of it.
    pub fn register(&mut self, cap: RegionCap) -> Result<RegionId, Error> {
        let rid = self.inner.register(cap)?;
        self.regions.insert(
            rid,
            ShadowRegion {
                len: cap.len,
                grows: false,
                free: BTreeMap::from([(0, cap.len)]),
            },
        );
        self.history.record(HistoryEntry {
            op: HistoryOp::Register,
            region: rid,
            offset: 0,
            length: cap.len,
            ok: true,
        });
        Ok(rid)
    }

    /// Deregister a region. Refused with [`Error::RegionDestroy`] unless the
    /// endpoint owns the region's entire extent again (no buffer in flight).
    pub fn deregister(&mut self, rid: RegionId) -> Result<RegionCap, Error> {
        let region = self.regions.get(&rid).ok_or(Error::InvalidRegionId)?;
        let whole =
            region.free.len() == 1 && region.free.get(&0) == Some(&region.len);

        self.history.record(HistoryEntry {
            op: HistoryOp::Deregister,
            region: rid,
            offset: 0,
            length: region.len,
            ok: whole,
        });

        if !whole {
            warn!(rid = rid.0, "deregistration with buffers in flight");
            return Err(Error::RegionDestroy);
        }

        let cap = self.inner.deregister(rid)?;
        self.regions.remove(&rid);
        Ok(cap)
    }

    pub fn notify(&mut self) -> Result<(), Error> {
        self.inner.notify()
    }

    pub fn control(&mut self, req: u64, value: u64) -> Result<u64, Error> {
        self.inner.control(req, value)
    }

    pub fn destroy(self) -> Result<(), Error> {
        self.inner.destroy()
    }

    /// The wrapped queue (e.g. to install region callbacks).
    pub fn inner(&self) -> &Queue<B> {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Queue<B> {
        &mut self.inner
    }

    /// The intervals of `rid` the endpoint currently owns, in offset order.
    pub fn owned_intervals(&self, rid: RegionId) -> Option<Vec<(u64, u64)>> {
        let region = self.regions.get(&rid)?;
        Some(region.free.iter().map(|(&o, &l)| (o, l)).collect())
    }

    /// The recorded operation history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.ring.iter()
    }

    /// Render the recorded history oldest-first, one operation per line,
    /// for post-mortem logs.
    pub fn dump(&self) -> String {
        use core::fmt::Write as _;

        let mut out = String::new();
        for entry in &self.history.ring {
            let verdict = if entry.ok { "ok" } else { "violation" };
            let _ = writeln!(
                out,
                "{:?} region {:#010x} [{:#x}, {:#x}) {}",
                entry.op,
                entry.region.0,
                entry.offset,
                entry.offset + entry.length,
                verdict,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Loopback;

    fn debug_queue() -> DebugQueue<Loopback> {
        DebugQueue::new(Queue::with_pool(
            Loopback::default(),
            crate::RegionPool::with_seed(0xDEB),
        ))
    }

    fn region(dq: &mut DebugQueue<Loopback>, len: u64) -> RegionId {
        dq.register(RegionCap::new(0x10_0000, 0x10_0000, len)).unwrap()
    }

    #[test]
    fn double_enqueue_is_caught_before_the_backend() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 64 * 2048);

        dq.enqueue(Descriptor::new(rid, 0, 2048)).unwrap();
        assert_eq!(
            dq.enqueue(Descriptor::new(rid, 0, 2048)),
            Err(Error::InvalidBufferArgs)
        );

        // Only the first enqueue reached the ring.
        assert!(dq.dequeue().is_ok());
        assert_eq!(dq.inner_mut().dequeue(), Err(Error::QueueEmpty));
    }

    #[test]
    fn partial_overlap_and_outside_ranges_are_caught() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 0x4000);

        dq.enqueue(Descriptor::new(rid, 0x1000, 0x1000)).unwrap();
        // Straddles the in-flight hole.
        assert_eq!(
            dq.enqueue(Descriptor::new(rid, 0x800, 0x1000)),
            Err(Error::InvalidBufferArgs)
        );
        assert_eq!(
            dq.enqueue(Descriptor::new(rid, 0x1800, 0x1000)),
            Err(Error::InvalidBufferArgs)
        );
        // Unknown region entirely.
        assert_eq!(
            dq.enqueue(Descriptor::new(RegionId(7), 0, 0x1000)),
            Err(Error::InvalidRegionId)
        );
    }

    #[test]
    fn carving_and_coalescing() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 0x4000);

        // Interior enqueue splits the single interval.
        dq.enqueue(Descriptor::new(rid, 0x1000, 0x2000)).unwrap();
        assert_eq!(
            dq.owned_intervals(rid).unwrap(),
            vec![(0, 0x1000), (0x3000, 0x1000)]
        );

        // Start-aligned enqueue trims the head interval.
        dq.enqueue(Descriptor::new(rid, 0, 0x800)).unwrap();
        assert_eq!(
            dq.owned_intervals(rid).unwrap(),
            vec![(0x800, 0x800), (0x3000, 0x1000)]
        );

        // End-aligned enqueue trims the tail interval.
        dq.enqueue(Descriptor::new(rid, 0x3800, 0x800)).unwrap();
        assert_eq!(
            dq.owned_intervals(rid).unwrap(),
            vec![(0x800, 0x800), (0x3000, 0x800)]
        );

        // Exact-fit enqueue removes an interval.
        dq.enqueue(Descriptor::new(rid, 0x800, 0x800)).unwrap();
        assert_eq!(dq.owned_intervals(rid).unwrap(), vec![(0x3000, 0x800)]);

        // Draining the loopback reassembles the full extent.
        for _ in 0..4 {
            dq.dequeue().unwrap();
        }
        assert_eq!(dq.owned_intervals(rid).unwrap(), vec![(0, 0x4000)]);
    }

    #[test]
    fn peer_double_free_is_caught() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 0x4000);

        dq.enqueue(Descriptor::new(rid, 0, 0x1000)).unwrap();
        // Simulate a misbehaving peer returning the same buffer twice by
        // slipping a duplicate past the ownership layer.
        dq.inner_mut().enqueue(Descriptor::new(rid, 0, 0x1000)).unwrap();

        assert!(dq.dequeue().is_ok());
        assert_eq!(dq.dequeue(), Err(Error::BufferNotInUse));
    }

    #[test]
    fn deregister_requires_full_ownership() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 0x2000);

        dq.enqueue(Descriptor::new(rid, 0, 0x1000)).unwrap();
        assert_eq!(dq.deregister(rid), Err(Error::RegionDestroy));

        dq.dequeue().unwrap();
        let cap = dq.deregister(rid).unwrap();
        assert_eq!(cap.len, 0x2000);
        assert_eq!(dq.deregister(rid), Err(Error::InvalidRegionId));
    }

    #[test]
    fn observed_regions_grow_monotonically() {
        let mut dq = debug_queue();
        // Register through the inner queue so the ownership layer only ever
        // sees this region through dequeued descriptors.
        let rid = dq
            .inner_mut()
            .register(RegionCap::new(0x20_0000, 0x20_0000, 0x8000))
            .unwrap();

        dq.inner_mut().enqueue(Descriptor::new(rid, 0x1000, 0x1000)).unwrap();
        dq.inner_mut().enqueue(Descriptor::new(rid, 0x4000, 0x1000)).unwrap();

        dq.dequeue().unwrap();
        assert_eq!(dq.owned_intervals(rid).unwrap(), vec![(0x1000, 0x1000)]);

        // The second observation reaches further into the region.
        dq.dequeue().unwrap();
        assert_eq!(
            dq.owned_intervals(rid).unwrap(),
            vec![(0x1000, 0x1000), (0x4000, 0x1000)]
        );
    }

    #[test]
    fn history_records_verdicts() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 0x2000);

        dq.enqueue(Descriptor::new(rid, 0, 0x1000)).unwrap();
        let _ = dq.enqueue(Descriptor::new(rid, 0, 0x1000));

        let entries: Vec<_> = dq.history().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].op, HistoryOp::Register);
        assert!(entries[1].ok);
        assert!(!entries[2].ok);
    }

    #[test]
    fn dump_renders_the_history() {
        let mut dq = debug_queue();
        let rid = region(&mut dq, 0x2000);

        dq.enqueue(Descriptor::new(rid, 0, 0x1000)).unwrap();
        let _ = dq.enqueue(Descriptor::new(rid, 0, 0x1000));

        let dump = dq.dump();
        assert_eq!(dump.lines().count(), 3);
        assert!(dump.starts_with("Register"));
        assert!(dump.lines().last().unwrap().ends_with("violation"));
    }

    #[test]
    fn history_is_bounded() {
        let mut dq = DebugQueue::with_history_depth(
            Queue::with_pool(Loopback::default(), crate::RegionPool::with_seed(1)),
            4,
        );
        let rid = dq
            .register(RegionCap::new(0, 0, 0x100_000))
            .unwrap();

        for i in 0..16 {
            dq.enqueue(Descriptor::new(rid, i * 0x1000, 0x1000)).unwrap();
            dq.dequeue().unwrap();
        }
        assert_eq!(dq.history().count(), 4);
    }
}
