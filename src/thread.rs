//! Thread control block (spec 3, 4.4).

use alloc::vec::Vec;

use crate::priv_bits::Bitmap256;
use crate::process::Pid;

/// Globally unique thread identifier, allocated monotonically by the
/// kernel context (spec 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

/// Thread scheduling state (spec 3, 4.4, 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    /// Blocked inside `wait_notification`, or suspended by another thread's
    /// `suspend` (spec 4.4 models both as the same state; `resume` always
    /// transitions Blocked -> Ready regardless of which put it there).
    Blocked,
    /// Entered by a voluntary `yield` (spec 4.4): a deschedule that does not
    /// preserve the thread's remaining quantum, unlike quantum expiry.
    Yielding,
    Zombie,
}

/// Architecture-opaque saved register state (spec 6: trap entry/exit is a
/// contract, not reimplemented here). Only the fields the scheduler and
/// syscall layer need to read or write directly are named; everything else
/// lives behind `Arch::save`/`Arch::restore`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegCtx {
    pub ip: u64,
    pub sp: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub ret0: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Rt,
    Service,
    User,
    Daemon,
}

impl Priority {
    /// Decodes a `set_priority`/`create_thread` syscall argument (spec 4.3,
    /// 4.4). Unknown values are `BadArgument` (spec 7), not a silent clamp.
    pub fn from_u64(n: u64) -> Option<Priority> {
        Some(match n {
            0 => Priority::Rt,
            1 => Priority::Service,
            2 => Priority::User,
            3 => Priority::Daemon,
            _ => return None,
        })
    }
}

pub struct Tcb {
    pub tid: Tid,
    pub owner: Pid,
    pub state: ThreadState,
    pub priority: Priority,
    pub regs: RegCtx,
    pub kstack: Vec<u8>,
    /// Quantum remaining, meaningful only for rp1/rp2 (spec 4.7).
    pub quantum_left: u32,
    /// Accumulated run time, meaningful only for rp3's fair ordering (spec 4.7).
    pub run_time: u64,
    /// Mask this thread is blocked waiting on, valid only while `state ==
    /// Blocked` (spec 4.4, 4.6).
    pub wait_mask: Bitmap256,
}

impl Tcb {
    pub fn new(tid: Tid, owner: Pid, priority: Priority, kstack_size: usize) -> Self {
        Tcb {
            tid,
            owner,
            state: ThreadState::Ready,
            priority,
            regs: RegCtx::default(),
            kstack: alloc::vec![0u8; kstack_size],
            quantum_left: 0,
            run_time: 0,
            wait_mask: Bitmap256::EMPTY,
        }
    }
}
