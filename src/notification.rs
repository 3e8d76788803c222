//! Notification capability payload (spec 3, 4.6).
//!
//! A 256-bit edge-accumulating bitmap shared by every capability derived
//! from the same root. `set` ORs bits in and wakes any blocked waiter whose
//! wait mask now overlaps the bitmap, in FIFO order among waiters registered
//! at the same instant (spec 4.6, I-NOT-1). Bits persist across a wakeup;
//! only an explicit `reset` clears them.

use alloc::vec::Vec;

use crate::priv_bits::Bitmap256;
use crate::thread::Tid;

struct Waiter {
    tid: Tid,
    mask: Bitmap256,
}

#[derive(Default)]
pub struct NotificationPayload {
    bits: Bitmap256,
    waiters: Vec<Waiter>,
}

impl NotificationPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR `mask` into the bitmap, then unblock the single earliest-registered
    /// waiter whose mask now overlaps the bitmap - "the first such thread",
    /// singular (spec 4.6). Every other overlapping waiter stays blocked;
    /// a later `set` call (even one that changes no bits, since the payload
    /// is idempotent - spec 8) will find and wake the next one in turn.
    pub fn set(&mut self, mask: Bitmap256) -> Option<Tid> {
        self.bits.union_with(&mask);
        let pos = self.waiters.iter().position(|w| self.bits.intersects(&w.mask))?;
        Some(self.waiters.remove(pos).tid)
    }

    /// Clear `mask` from the bitmap. Never wakes anyone.
    pub fn reset(&mut self, mask: Bitmap256) {
        for id in 0u16..256 {
            if mask.get(id) {
                self.bits.clear(id);
            }
        }
    }

    /// Bits of `mask` currently set, without side effects.
    pub fn check(&self, mask: Bitmap256) -> Bitmap256 {
        self.bits.intersection(&mask)
    }

    /// Registers `tid` to block on `mask`. Returns `Some` immediately -
    /// without blocking - if the mask already overlaps the current bitmap.
    pub fn wait(&mut self, tid: Tid, mask: Bitmap256) -> Option<Bitmap256> {
        let hit = self.bits.intersection(&mask);
        if !hit.is_empty() {
            return Some(hit);
        }
        self.waiters.push(Waiter { tid, mask });
        None
    }

    /// Drops a thread from the waiter list without waking it, used when a
    /// blocked thread is terminated out from under its wait (spec 4.4).
    pub fn cancel_wait(&mut self, tid: Tid) {
        self.waiters.retain(|w| w.tid != tid);
    }
}
