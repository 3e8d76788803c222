//! Privilege algebra (spec 4.1).
//!
//! A capability carries one generic privilege word. Every derivation,
//! degradation and invocation check reduces to the single `derivable`
//! predicate: a bitset is derivable from a parent iff it is a bitwise subset.

use bitflags::bitflags;

bitflags! {
    /// Generic privilege word carried by every capability.
    ///
    /// Bits 0-1 are type-independent (`DERIVE`, `UNPACK`); bits 16-31 are
    /// reserved per payload type (spec 6). PCB, TCB and Memory each define
    /// their own named subset of that range via `From`/`Into` below.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct PrivFlags: u64 {
        /// Holder may derive children from this capability at all. A
        /// capability missing `DERIVE` may still be invoked, just not
        /// propagated (spec 4.1).
        const DERIVE = 1 << 0;
        /// Holder may unpack the capability's payload pointer directly.
        const UNPACK = 1 << 1;

        // PCB-capability bits (spec 4.3)
        const PCB_EXIT          = 1 << 16;
        const PCB_FORK          = 1 << 17;
        const PCB_GETPID        = 1 << 18;
        const PCB_CREATE_THREAD = 1 << 19;
        const PCB_ENUM_CAPS     = 1 << 20;
        const PCB_MIGRATE_CAPS  = 1 << 21;

        // TCB-capability bits (spec 4.4)
        const TCB_SET_PRIORITY      = 1 << 16;
        const TCB_SUSPEND           = 1 << 17;
        const TCB_RESUME            = 1 << 18;
        const TCB_TERMINATE         = 1 << 19;
        const TCB_YIELD             = 1 << 20;
        const TCB_WAIT_NOTIFICATION = 1 << 21;

        // Memory-capability bits (spec 4.5)
        const MEM_GETPADDR = 1 << 16;
        const MEM_MAP      = 1 << 17;
        const MEM_UNMAP    = 1 << 18;
        const MEM_READ     = 1 << 19;
        const MEM_WRITE    = 1 << 20;
        const MEM_EXEC     = 1 << 21;
        const MEM_SHARE    = 1 << 22;
        const MEM_UNSHARE  = 1 << 23;
    }
}

impl PrivFlags {
    /// All PCB-meaningful bits, used by tests and by full-privilege roots.
    pub const PCB_ALL: PrivFlags = PrivFlags::DERIVE
        .union(PrivFlags::UNPACK)
        .union(PrivFlags::PCB_EXIT)
        .union(PrivFlags::PCB_FORK)
        .union(PrivFlags::PCB_GETPID)
        .union(PrivFlags::PCB_CREATE_THREAD)
        .union(PrivFlags::PCB_ENUM_CAPS)
        .union(PrivFlags::PCB_MIGRATE_CAPS);

    pub const TCB_ALL: PrivFlags = PrivFlags::DERIVE
        .union(PrivFlags::UNPACK)
        .union(PrivFlags::TCB_SET_PRIORITY)
        .union(PrivFlags::TCB_SUSPEND)
        .union(PrivFlags::TCB_RESUME)
        .union(PrivFlags::TCB_TERMINATE)
        .union(PrivFlags::TCB_YIELD)
        .union(PrivFlags::TCB_WAIT_NOTIFICATION);

    pub const MEM_ALL: PrivFlags = PrivFlags::DERIVE
        .union(PrivFlags::UNPACK)
        .union(PrivFlags::MEM_GETPADDR)
        .union(PrivFlags::MEM_MAP)
        .union(PrivFlags::MEM_UNMAP)
        .union(PrivFlags::MEM_READ)
        .union(PrivFlags::MEM_WRITE)
        .union(PrivFlags::MEM_EXEC)
        .union(PrivFlags::MEM_SHARE)
        .union(PrivFlags::MEM_UNSHARE);
}

/// Bit-subset predicate: `child` is derivable from `parent` iff every bit set
/// in `child` is also set in `parent`.
pub fn derivable(parent: PrivFlags, child: PrivFlags) -> bool {
    parent.contains(child)
}

/// Shared privilege gate used by every syscall handler and by
/// `KernelContext`'s own capability-gated operations (spec 4.1, 4.3-4.6):
/// fails with `InsufficientPrivilege`, logged, if `held` is missing any bit
/// of `required`.
pub fn require(held: PrivFlags, required: PrivFlags) -> crate::error::KernelResult<()> {
    if held.contains(required) {
        Ok(())
    } else {
        log::warn!("privilege check failed: held {:?}, required {:?}", held, required);
        Err(crate::error::KernelError::InsufficientPrivilege)
    }
}

/// Fixed-width 256-bit bitmap backing Notification payloads and their
/// auxiliary `may_set`/`may_reset`/`may_check` masks (spec 3, 4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bitmap256([u64; crate::config::NOTIFICATION_WORDS]);

impl Bitmap256 {
    pub const EMPTY: Bitmap256 = Bitmap256([0; crate::config::NOTIFICATION_WORDS]);

    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// Build a bitmap with a single bit set, used pervasively in tests and
    /// by `wait`'s single-id convenience callers.
    pub fn single(id: u16) -> Self {
        let mut b = Self::EMPTY;
        b.set(id);
        b
    }

    fn word_bit(id: u16) -> (usize, u32) {
        (id as usize / 64, (id as u32) % 64)
    }

    pub fn get(&self, id: u16) -> bool {
        if id as usize >= 256 {
            return false;
        }
        let (w, b) = Self::word_bit(id);
        (self.0[w] >> b) & 1 != 0
    }

    pub fn set(&mut self, id: u16) {
        if (id as usize) < 256 {
            let (w, b) = Self::word_bit(id);
            self.0[w] |= 1 << b;
        }
    }

    pub fn clear(&mut self, id: u16) {
        if (id as usize) < 256 {
            let (w, b) = Self::word_bit(id);
            self.0[w] &= !(1 << b);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// True iff `self` and `other` share at least one set bit.
    pub fn intersects(&self, other: &Bitmap256) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    /// Bitwise AND, used to compute which ids actually fired.
    pub fn intersection(&self, other: &Bitmap256) -> Bitmap256 {
        let mut out = Bitmap256::EMPTY;
        for i in 0..crate::config::NOTIFICATION_WORDS {
            out.0[i] = self.0[i] & other.0[i];
        }
        out
    }

    pub fn union_with(&mut self, other: &Bitmap256) {
        for i in 0..crate::config::NOTIFICATION_WORDS {
            self.0[i] |= other.0[i];
        }
    }

    /// Bit-subset check, used for auxiliary-mask derivation (spec 4.2).
    pub fn is_subset_of(&self, other: &Bitmap256) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a & !b == 0)
    }
}
