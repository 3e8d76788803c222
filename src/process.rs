//! Process control block (spec 3, 4.3).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::cspace::CSpaceTable;
use crate::memory::TaskMemory;
use crate::thread::{Priority, Tid};

/// Globally unique process identifier, allocated monotonically by the
/// kernel context (spec 9). PID 0 is reserved for the idle process
/// (spec 4.7 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl Pid {
    pub const IDLE: Pid = Pid(0);
}

/// Process scheduling state (spec 3, 4.3, 4.7). A process is `Zombie` from
/// `exit` until reaped by its parent; it is never removed implicitly.
/// `Yielding` mirrors the TCB vocabulary (spec 3 gives PCB and TCB the same
/// state set); nothing in this core currently drives a PCB into it directly,
/// since yielding is a per-thread operation (spec 4.4), but the variant is
/// kept so the two state machines stay in the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Yielding,
    Zombie,
}

/// Real-time priority level a process's threads are scheduled at
/// (spec 4.7): rp0 real-time, rp1 service, rp2 user, rp3 daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RpLevel {
    Rp0 = 0,
    Rp1 = 1,
    Rp2 = 2,
    Rp3 = 3,
}

impl RpLevel {
    /// The scheduler class every thread of a process at this level runs
    /// at (spec 4.7: processes, not individual threads, are assigned to an
    /// rp level; all of a process's threads inherit it).
    pub fn priority(self) -> Priority {
        match self {
            RpLevel::Rp0 => Priority::Rt,
            RpLevel::Rp1 => Priority::Service,
            RpLevel::Rp2 => Priority::User,
            RpLevel::Rp3 => Priority::Daemon,
        }
    }
}

pub struct Pcb {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub state: ProcessState,
    pub rp_level: RpLevel,
    pub run_time: u64,
    pub memory: Box<dyn TaskMemory + Send>,
    pub main_thread: Option<Tid>,
    pub threads: Vec<Tid>,
    pub children: Vec<Pid>,
    pub cspaces: CSpaceTable,
    pub entrypoint: u64,
}

impl Pcb {
    pub fn new(
        pid: Pid,
        parent: Option<Pid>,
        rp_level: RpLevel,
        memory: Box<dyn TaskMemory + Send>,
        entrypoint: u64,
    ) -> Self {
        Pcb {
            pid,
            parent,
            state: ProcessState::Ready,
            rp_level,
            run_time: 0,
            memory,
            main_thread: None,
            threads: Vec::new(),
            children: Vec::new(),
            cspaces: CSpaceTable::new(),
            entrypoint,
        }
    }
}
