//! Reference-counted device wake votes.
//!
//! The wake line is asserted while at least one vote is held. Releasing the
//! last vote may defer the deassert by a grace period so that bursts of
//! short transactions do not bounce the device in and out of sleep.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

#[derive(Debug, Default)]
struct WakeLine {
    asserted: bool,
    deassert_at: Option<Instant>,
}

#[derive(Debug)]
pub struct WakeVote {
    votes: AtomicI32,
    line: Mutex<WakeLine>,
    grace: Duration,
}

impl WakeVote {
    pub fn new(grace: Duration) -> Self {
        Self {
            votes: AtomicI32::new(0),
            line: Mutex::new(WakeLine::default()),
            grace,
        }
    }

    pub fn votes(&self) -> i32 {
        self.votes.load(Ordering::Acquire)
    }

    pub fn asserted(&self) -> bool {
        lock(&self.line).asserted
    }

    /// Takes a vote; asserts the line on the first one, or always when
    /// `force` is set. `assert` performs the register write and is called
    /// with the line lock held so assert/deassert writes cannot reorder.
    pub fn toggle(&self, force: bool, assert: impl FnOnce()) {
        let mut line = lock(&self.line);
        self.votes.fetch_add(1, Ordering::AcqRel);
        line.deassert_at = None;
        if force || !line.asserted {
            line.asserted = true;
            assert();
        }
    }

    /// Drops a vote. On the last one the line is deasserted now, or after the
    /// grace period when `defer` is set.
    pub fn release(&self, defer: bool, deassert: impl FnOnce()) {
        let mut line = lock(&self.line);
        let prev = self.votes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "wake vote underflow");
        if prev != 1 || !line.asserted {
            return;
        }
        if defer && !self.grace.is_zero() {
            line.deassert_at = Some(Instant::now() + self.grace);
        } else {
            line.asserted = false;
            line.deassert_at = None;
            deassert();
        }
    }

    /// Toggle followed by an immediate release: nudges a sleeping device
    /// without holding it awake.
    pub fn pulse(&self, assert: impl FnOnce(), deassert: impl FnOnce()) {
        self.toggle(false, assert);
        self.release(false, deassert);
    }

    /// Completes a deferred deassert whose grace period elapsed. Returns true
    /// if the line was dropped.
    pub fn flush_deferred(&self, now: Instant, deassert: impl FnOnce()) -> bool {
        let mut line = lock(&self.line);
        match line.deassert_at {
            Some(at) if now >= at && self.votes() == 0 => {
                line.asserted = false;
                line.deassert_at = None;
                deassert();
                true
            }
            _ => false,
        }
    }

    pub fn deassert_pending(&self) -> bool {
        lock(&self.line).deassert_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn line_follows_first_and_last_vote() {
        let w = WakeVote::new(Duration::ZERO);
        let writes = Cell::new(0);
        w.toggle(false, || writes.set(writes.get() + 1));
        w.toggle(false, || writes.set(writes.get() + 1));
        assert_eq!(writes.get(), 1);
        assert!(w.asserted());
        w.release(false, || writes.set(writes.get() + 10));
        assert!(w.asserted());
        w.release(false, || writes.set(writes.get() + 10));
        assert_eq!(writes.get(), 11);
        assert!(!w.asserted());
        assert_eq!(w.votes(), 0);
    }

    #[test]
    fn deferred_release_waits_for_grace_period() {
        let w = WakeVote::new(Duration::from_millis(50));
        w.toggle(false, || {});
        w.release(true, || panic!("deassert must be deferred"));
        assert!(w.asserted());
        assert!(w.deassert_pending());

        let start = Instant::now();
        assert!(!w.flush_deferred(start, || panic!("too early")));
        let dropped = Cell::new(false);
        assert!(w.flush_deferred(start + Duration::from_secs(1), || dropped.set(true)));
        assert!(dropped.get());
        assert!(!w.asserted());
    }

    #[test]
    fn new_vote_cancels_deferred_deassert() {
        let w = WakeVote::new(Duration::from_millis(50));
        w.toggle(false, || {});
        w.release(true, || {});
        w.toggle(false, || panic!("line is still asserted"));
        assert!(!w.deassert_pending());
        assert!(!w.flush_deferred(Instant::now() + Duration::from_secs(1), || {}));
    }

    #[test]
    fn pulse_leaves_no_vote_behind() {
        let w = WakeVote::new(Duration::ZERO);
        let seq = std::cell::RefCell::new(Vec::new());
        w.pulse(|| seq.borrow_mut().push("assert"), || seq.borrow_mut().push("deassert"));
        assert_eq!(*seq.borrow(), ["assert", "deassert"]);
        assert_eq!(w.votes(), 0);
    }
}
