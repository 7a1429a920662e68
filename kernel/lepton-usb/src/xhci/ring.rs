//! TRB rings.
//!
//! Rings are circular single-producer/single-consumer DMA buffers with
//! the hardware as the other party. Producers stamp each TRB with the
//! current cycle bit; when the write index reaches `max_index - 1` a
//! LINK TRB with toggle-cycle is planted pointing at the base and the
//! producer cycle flips. Consumers accept TRBs whose cycle matches the
//! expected value and stop at the first stale entry.

use lepton_mm::page::DmaBuffer;

use super::trb::Trb;

/// Command ring capacity.
pub const CMD_RING_SIZE: usize = 256;
/// Event ring capacity.
pub const EVT_RING_SIZE: usize = 256;
/// Transfer ring capacity.
pub const XFER_RING_SIZE: usize = 256;
/// Segments per event-ring segment table.
pub const ERST_SIZE: usize = 1;

/// A circular TRB ring.
pub struct TrbRing {
    buf: DmaBuffer,
    index: usize,
    max_index: usize,
    cycle: bool,
}

impl TrbRing {
    /// Allocates a zeroed ring of `capacity` TRBs.
    pub fn new(capacity: usize) -> Option<TrbRing> {
        let buf = DmaBuffer::alloc(capacity * core::mem::size_of::<Trb>())?;
        Some(TrbRing {
            buf,
            index: 0,
            max_index: capacity,
            cycle: true,
        })
    }

    /// Current producer/consumer index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Ring capacity in TRBs.
    pub fn capacity(&self) -> usize {
        self.max_index
    }

    /// Current cycle state.
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    /// Ring size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.max_index * core::mem::size_of::<Trb>()
    }

    /// Physical address of the TRB at the current index (programmed
    /// into CRCR/ERDP/TR dequeue pointers).
    pub fn device_ptr(&self) -> u64 {
        self.buf.phys() + (self.index * core::mem::size_of::<Trb>()) as u64
    }

    /// Physical address of the ring base.
    pub fn base_phys(&self) -> u64 {
        self.buf.phys()
    }

    #[inline]
    fn trb_ptr(&self, index: usize) -> *mut Trb {
        debug_assert!(index < self.max_index);
        // The buffer is Trb-aligned (page-aligned) and large enough.
        (self.buf.addr() as *mut Trb).wrapping_add(index)
    }

    /// Reads the TRB at `index` (volatile: hardware writes the ring).
    pub fn read_trb(&self, index: usize) -> Trb {
        // SAFETY: index is bounds-checked; the buffer lives as long as
        // the ring.
        unsafe { core::ptr::read_volatile(self.trb_ptr(index)) }
    }

    /// Writes the TRB at `index` (volatile: hardware reads the ring).
    pub fn write_trb(&mut self, index: usize, trb: Trb) {
        // SAFETY: as above, and `&mut self` gives producer exclusivity.
        unsafe { core::ptr::write_volatile(self.trb_ptr(index), trb) }
    }

    /// Producer: appends a TRB, stamping the current cycle bit. Plants
    /// the LINK TRB and wraps when the penultimate slot is reached.
    /// Returns the physical address the TRB was written to.
    pub fn enqueue(&mut self, mut trb: Trb) -> u64 {
        debug_assert!(trb.trb_type() != 0, "enqueueing an empty TRB");
        trb.set_cycle(self.cycle);
        let phys = self.device_ptr();
        let index = self.index;
        self.write_trb(index, trb);
        self.index += 1;

        if self.index == self.max_index - 1 {
            let mut link = Trb::link(self.base_phys());
            link.set_cycle(self.cycle);
            let index = self.index;
            self.write_trb(index, link);
            self.index = 0;
            self.cycle = !self.cycle;
        }
        phys
    }

    /// Consumer: dequeues the next TRB if its cycle bit matches the
    /// expected value; `None` at the first stale entry.
    pub fn dequeue(&mut self) -> Option<Trb> {
        let trb = self.read_trb(self.index);
        if trb.cycle() != self.cycle || trb.trb_type() == 0 {
            return None;
        }
        self.index += 1;
        if self.index == self.max_index {
            self.index = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::xhci::trb::TRB_NOOP_CMD;

    /// Simulates the controller posting an event at the hardware-side
    /// producer cursor (tests play the hardware role).
    pub struct HwProducer {
        pub index: usize,
        pub cycle: bool,
    }

    impl HwProducer {
        pub fn new() -> HwProducer {
            HwProducer {
                index: 0,
                cycle: true,
            }
        }

        pub fn post(&mut self, ring: &mut TrbRing, mut trb: Trb) {
            trb.set_cycle(self.cycle);
            let index = self.index;
            ring.write_trb(index, trb);
            self.index += 1;
            if self.index == ring.capacity() {
                self.index = 0;
                self.cycle = !self.cycle;
            }
        }
    }

    #[test]
    fn enqueue_stamps_cycle() {
        let mut ring = TrbRing::new(8).unwrap();
        ring.enqueue(Trb::noop_cmd());
        let trb = ring.read_trb(0);
        assert_eq!(trb.trb_type(), TRB_NOOP_CMD);
        assert!(trb.cycle());
        assert_eq!(ring.index(), 1);
    }

    #[test]
    fn wrap_plants_link_and_toggles() {
        let capacity = 8;
        let mut ring = TrbRing::new(capacity).unwrap();

        // Fill to the wrap point: capacity-1 usable slots.
        for _ in 0..capacity - 1 {
            ring.enqueue(Trb::noop_cmd());
        }
        // The LINK TRB sits at max_index-1 with toggle-cycle, pointing
        // at the base, stamped with the pre-wrap cycle.
        let link = ring.read_trb(capacity - 1);
        assert!(link.is_link_toggle());
        assert_eq!(link.parameter(), ring.base_phys());
        assert!(link.cycle());

        // Producer wrapped and flipped its cycle.
        assert_eq!(ring.index(), 0);
        assert!(!ring.cycle());

        // Post-wrap TRBs are stamped with the new cycle.
        ring.enqueue(Trb::noop_cmd());
        assert!(!ring.read_trb(0).cycle());
    }

    #[test]
    fn full_rotation_keeps_link_invariant() {
        let capacity = 8;
        let mut ring = TrbRing::new(capacity).unwrap();
        // Three full laps.
        for _ in 0..3 * (capacity - 1) {
            ring.enqueue(Trb::noop_cmd());
        }
        let link = ring.read_trb(capacity - 1);
        assert!(link.is_link_toggle());
        // After an odd number of wraps the cycle has flipped 3 times.
        assert!(!ring.cycle());
    }

    #[test]
    fn consumer_stops_at_stale_cycle() {
        let mut ring = TrbRing::new(8).unwrap();
        let mut hw = HwProducer::new();
        hw.post(&mut ring, Trb::transfer_event(1, 0, 1, 1));
        hw.post(&mut ring, Trb::transfer_event(1, 0, 2, 1));

        assert_eq!(
            ring.dequeue().unwrap().as_transfer_event().unwrap().endpoint_id,
            1
        );
        assert_eq!(
            ring.dequeue().unwrap().as_transfer_event().unwrap().endpoint_id,
            2
        );
        // Next slot holds a stale (zero) entry.
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn consumer_follows_cycle_across_wrap() {
        let capacity = 4;
        let mut ring = TrbRing::new(capacity).unwrap();
        let mut hw = HwProducer::new();

        // Fill one lap plus two more events.
        for i in 0..capacity + 2 {
            // Drain as we go so the consumer stays behind the producer.
            hw.post(&mut ring, Trb::transfer_event(1, i as u32, 1, 1));
            let ev = ring.dequeue().unwrap().as_transfer_event().unwrap();
            assert_eq!(ev.remaining, i as u32);
        }
        // Ring wrapped once; consumer cycle flipped with it.
        assert!(!ring.cycle());
        assert!(ring.dequeue().is_none());
    }
}
