//! Fixed-size circular rings shared with the device.
//!
//! A [`Ring`] tracks local element indices (`wp`, `rp`) and knows where its
//! device-visible pointer mirrors live in the context record. Local/device
//! conversion is pure offset arithmetic against the ring's bus base.
//!
//! One slot is always left empty so that `wp == rp` unambiguously means
//! "empty": a ring of `n` elements holds at most `n - 1` entries.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::context::{CTX_RP, CTX_WP};
use crate::dma::DmaBus;
use crate::tre::{Tre, TRE_LEN};

#[derive(Debug)]
pub struct Ring {
    base: u64,
    elements: usize,
    ctxt: u64,
    wp: AtomicUsize,
    rp: AtomicUsize,
}

impl Ring {
    /// Producer-side ring (transfer or command ring). Both pointers start at
    /// the base.
    pub fn new(base: u64, elements: usize, ctxt: u64) -> Self {
        debug_assert!(elements >= 2, "ring needs at least two elements");
        Self {
            base,
            elements,
            ctxt,
            wp: AtomicUsize::new(0),
            rp: AtomicUsize::new(0),
        }
    }

    /// Event ring: the whole ring except one slot is handed to the device up
    /// front, so the write pointer starts on the last element.
    pub fn new_event(base: u64, elements: usize, ctxt: u64) -> Self {
        let ring = Self::new(base, elements, ctxt);
        ring.wp.store(elements - 1, Ordering::Relaxed);
        ring
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn elements(&self) -> usize {
        self.elements
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.elements * TRE_LEN
    }

    /// Bus address of the context record holding this ring's mirrors.
    #[inline]
    pub fn context(&self) -> u64 {
        self.ctxt
    }

    #[inline]
    pub fn wp(&self) -> usize {
        self.wp.load(Ordering::Acquire)
    }

    #[inline]
    pub fn rp(&self) -> usize {
        self.rp.load(Ordering::Acquire)
    }

    #[inline]
    pub fn next(&self, idx: usize) -> usize {
        if idx + 1 == self.elements {
            0
        } else {
            idx + 1
        }
    }

    #[inline]
    pub fn prev(&self, idx: usize) -> usize {
        if idx == 0 {
            self.elements - 1
        } else {
            idx - 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wp() == self.rp()
    }

    pub fn is_full(&self) -> bool {
        self.next(self.wp()) == self.rp()
    }

    /// Free descriptor slots.
    pub fn slots_available(&self) -> usize {
        let wp = self.wp();
        let rp = self.rp();
        if wp < rp {
            rp - wp - 1
        } else {
            rp + (self.elements - wp) - 1
        }
    }

    /// Entries handed to the consumer and not yet retired.
    pub fn occupied(&self) -> usize {
        self.elements - 1 - self.slots_available()
    }

    pub fn advance_write(&self) {
        debug_assert!(!self.is_full(), "advance_write on a full ring");
        let wp = self.wp.load(Ordering::Relaxed);
        self.wp.store(self.next(wp), Ordering::Release);
    }

    pub fn advance_read(&self) {
        debug_assert!(!self.is_empty(), "advance_read on an empty ring");
        let rp = self.rp.load(Ordering::Relaxed);
        self.rp.store(self.next(rp), Ordering::Release);
    }

    pub(crate) fn set_pointers(&self, rp: usize, wp: usize) {
        debug_assert!(rp < self.elements && wp < self.elements);
        self.rp.store(rp, Ordering::Release);
        self.wp.store(wp, Ordering::Release);
    }

    /// Converts a device-visible address into a local element index.
    ///
    /// Returns `None` for addresses outside the ring or not on an element
    /// boundary.
    pub fn to_local(&self, paddr: u64) -> Option<usize> {
        let off = paddr.checked_sub(self.base)?;
        if off % TRE_LEN as u64 != 0 {
            return None;
        }
        let idx = usize::try_from(off / TRE_LEN as u64).ok()?;
        (idx < self.elements).then_some(idx)
    }

    #[inline]
    pub fn to_device(&self, idx: usize) -> u64 {
        debug_assert!(idx < self.elements);
        self.base + (idx * TRE_LEN) as u64
    }

    pub fn read_element(&self, bus: &dyn DmaBus, idx: usize) -> Tre {
        Tre::read_from(bus, self.to_device(idx))
    }

    pub fn write_element(&self, bus: &dyn DmaBus, idx: usize, tre: &Tre) {
        tre.write_to(bus, self.to_device(idx));
    }

    /// Mirrors the local write pointer into the context record and returns
    /// the doorbell value.
    pub fn publish_wp(&self, bus: &dyn DmaBus) -> u64 {
        fence(Ordering::Release);
        let db = self.to_device(self.wp());
        bus.write_u64(self.ctxt + CTX_WP, db);
        db
    }

    /// Device-owned pointer from the context record, as a local index.
    pub fn device_rp(&self, bus: &dyn DmaBus) -> Option<usize> {
        let raw = bus.read_u64(self.ctxt + CTX_RP);
        fence(Ordering::Acquire);
        self.to_local(raw)
    }

    /// Returns a consumed event-ring element to the device.
    ///
    /// The local write pointer and its device-visible mirror advance
    /// together, then the read pointer follows. Must be called with the
    /// event ring lock held.
    pub fn recycle_event(&self, bus: &dyn DmaBus) {
        let wp = self.next(self.wp.load(Ordering::Relaxed));
        self.wp.store(wp, Ordering::Release);
        bus.write_u64(self.ctxt + CTX_WP, self.to_device(wp));
        let rp = self.next(self.rp.load(Ordering::Relaxed));
        self.rp.store(rp, Ordering::Release);
        fence(Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_reserves_one_slot() {
        let r = Ring::new(0x1000, 4, 0);
        assert!(r.is_empty());
        assert!(!r.is_full());
        assert_eq!(r.slots_available(), 3);
        r.advance_write();
        r.advance_write();
        r.advance_write();
        assert!(r.is_full());
        assert_eq!(r.slots_available(), 0);
        assert_eq!(r.occupied(), 3);
    }

    #[test]
    fn slots_available_handles_wraparound() {
        let r = Ring::new(0x1000, 4, 0);
        r.set_pointers(3, 1);
        // wp < rp: only the slot before rp is reserved.
        assert_eq!(r.slots_available(), 1);
        r.advance_write();
        assert!(r.is_full());
        r.advance_read();
        assert_eq!(r.rp(), 0);
        assert_eq!(r.slots_available(), 1);
    }

    #[test]
    fn address_translation_is_offset_math() {
        let r = Ring::new(0x8000, 8, 0);
        assert_eq!(r.to_device(0), 0x8000);
        assert_eq!(r.to_device(7), 0x8000 + 7 * TRE_LEN as u64);
        assert_eq!(r.to_local(0x8000 + 3 * TRE_LEN as u64), Some(3));
        assert_eq!(r.to_local(0x8000 + 8 * TRE_LEN as u64), None);
        assert_eq!(r.to_local(0x8004), None);
        assert_eq!(r.to_local(0x7ff0), None);
    }

    #[test]
    fn event_ring_starts_with_device_owning_all_but_one_slot() {
        let r = Ring::new_event(0x8000, 8, 0);
        assert_eq!(r.rp(), 0);
        assert_eq!(r.wp(), 7);
    }
}
