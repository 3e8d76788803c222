//! Capability arena (spec 9, "Derivation forest with cross-address-space
//! children").
//!
//! A capability's `parent` may live in a different PCB than its children.
//! Rather than have capabilities borrow or own each other directly - which
//! Rust's borrow checker will not allow across a forest with cross-process
//! edges - capability objects are arena-allocated here and referred to by
//! the non-owning [`CapId`] handle. Ownership of a `CapNode` belongs to
//! whichever CSpace slot stores its id; revocation walks `children` without
//! ever dereferencing owner memory beyond the slot itself.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::cspace::CapabilityIndex;
use crate::memory::MemoryPayload;
use crate::notification::NotificationPayload;
use crate::priv_bits::{Bitmap256, PrivFlags};
use crate::process::Pid;
use crate::thread::Tid;

/// Opaque handle to a capability node inside the arena. Never forgeable by
/// user code - it only ever crosses the syscall boundary as the opaque
/// contents of a CSpace slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapId(pub(crate) u32);

/// Capability type discriminant (spec 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    Null,
    Pcb,
    Tcb,
    Memory,
    Notification,
}

/// The object a capability refers to (spec 3, "Payload").
///
/// `Memory` and `Notification` are reference-counted because multiple
/// capabilities (siblings derived from the same root) can share one
/// payload; `Pcb`/`Tcb` payloads are plain ids into the process/thread
/// tables, because a process's lifetime is governed by reaping, not by
/// capability refcounts (spec 3, "Lifecycles").
#[derive(Debug, Clone)]
pub enum Payload {
    Null,
    Pcb(Pid),
    Tcb(Tid),
    Memory(Arc<Mutex<MemoryPayload>>),
    Notification(Arc<Mutex<NotificationPayload>>),
}

impl Payload {
    pub fn kind(&self) -> CapKind {
        match self {
            Payload::Null => CapKind::Null,
            Payload::Pcb(_) => CapKind::Pcb,
            Payload::Tcb(_) => CapKind::Tcb,
            Payload::Memory(_) => CapKind::Memory,
            Payload::Notification(_) => CapKind::Notification,
        }
    }
}

/// Auxiliary privilege structure carried only by Notification capabilities
/// (spec 3, 4.6): three 256-bit masks selecting which notification ids the
/// holder may Set, Reset, or Check.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationAux {
    pub may_set: Bitmap256,
    pub may_reset: Bitmap256,
    pub may_check: Bitmap256,
}

/// One capability: a holder's handle to one payload (spec 3).
#[derive(Debug, Clone)]
pub struct CapNode {
    pub kind: CapKind,
    pub payload: Payload,
    pub priv_word: PrivFlags,
    pub aux: Option<NotificationAux>,
    pub owner: Pid,
    pub index: CapabilityIndex,
    pub parent: Option<CapId>,
    pub children: Vec<CapId>,
}

/// Global arena of capability nodes, owned by the kernel context
/// (spec 9, "Global mutable state").
#[derive(Default)]
pub struct CapArena {
    slots: Vec<Option<CapNode>>,
    free_list: Vec<u32>,
}

impl CapArena {
    pub const fn new() -> Self {
        CapArena {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    pub fn insert(&mut self, node: CapNode) -> CapId {
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(node);
            CapId(idx)
        } else {
            self.slots.push(Some(node));
            CapId((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: CapId) -> Option<&CapNode> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: CapId) -> Option<&mut CapNode> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Removes a node from the arena unconditionally. Callers are
    /// responsible for having already unlinked it from its owner's CSpace
    /// slot and from its parent's `children` list.
    pub fn remove(&mut self, id: CapId) -> Option<CapNode> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let node = slot.take();
        if node.is_some() {
            self.free_list.push(id.0);
        }
        node
    }

    pub fn len_live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
