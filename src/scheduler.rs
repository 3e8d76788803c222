//! Four-class preemptive scheduler (spec 4.7).
//!
//! rp0 is real-time and runs to completion: once selected, a thread stays
//! current until it yields, blocks, or terminates - never preempted by a
//! lower class or by quantum expiry. rp1 and rp2 are quantum-scheduled
//! round-robin queues (`Q1`, `Q2` ticks respectively). rp3 is a daemon class
//! ordered by accumulated run time, so no single daemon thread can starve
//! its siblings. When every queue is empty the scheduler falls back to a
//! dedicated idle thread that is never itself subject to selection.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::config::{Q1, Q2};
use crate::error::{KernelError, KernelResult};
use crate::process::RpLevel;
use crate::thread::{Priority, RegCtx, Tcb, ThreadState, Tid};

pub struct Scheduler {
    threads: BTreeMap<Tid, Tcb>,
    rp0: VecDeque<Tid>,
    rp1: VecDeque<Tid>,
    rp2: VecDeque<Tid>,
    /// Daemon queue, kept sorted ascending by `run_time` so the front is
    /// always the least-run thread (spec 4.7).
    rp3: Vec<Tid>,
    current: Option<Tid>,
    idle: Tid,
}

impl Scheduler {
    /// `idle` must already be inserted via `add_thread` before this is
    /// called, with a priority/level that keeps it out of every rp queue.
    pub fn new(idle: Tid, mut idle_tcb: Tcb) -> Self {
        idle_tcb.state = ThreadState::Ready;
        let mut threads = BTreeMap::new();
        threads.insert(idle, idle_tcb);
        Scheduler {
            threads,
            rp0: VecDeque::new(),
            rp1: VecDeque::new(),
            rp2: VecDeque::new(),
            rp3: Vec::new(),
            current: None,
            idle,
        }
    }

    pub fn get(&self, tid: Tid) -> Option<&Tcb> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Tcb> {
        self.threads.get_mut(&tid)
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    fn level_of(&self, tid: Tid) -> RpLevel {
        match self.threads.get(&tid).map(|t| t.priority) {
            Some(Priority::Rt) => RpLevel::Rp0,
            Some(Priority::Service) => RpLevel::Rp1,
            Some(Priority::User) => RpLevel::Rp2,
            Some(Priority::Daemon) | None => RpLevel::Rp3,
        }
    }

    fn enqueue(&mut self, tid: Tid) {
        match self.level_of(tid) {
            RpLevel::Rp0 => self.rp0.push_back(tid),
            RpLevel::Rp1 => {
                if let Some(t) = self.threads.get_mut(&tid) {
                    t.quantum_left = Q1;
                }
                self.rp1.push_back(tid);
            }
            RpLevel::Rp2 => {
                if let Some(t) = self.threads.get_mut(&tid) {
                    t.quantum_left = Q2;
                }
                self.rp2.push_back(tid);
            }
            RpLevel::Rp3 => self.insert_rp3_sorted(tid),
        }
    }

    fn insert_rp3_sorted(&mut self, tid: Tid) {
        let run_time = self.threads.get(&tid).map(|t| t.run_time).unwrap_or(0);
        let pos = self
            .rp3
            .iter()
            .position(|&t| self.threads.get(&t).map(|x| x.run_time).unwrap_or(0) > run_time)
            .unwrap_or(self.rp3.len());
        self.rp3.insert(pos, tid);
    }

    pub fn add_thread(&mut self, tid: Tid, tcb: Tcb) {
        self.threads.insert(tid, tcb);
        self.enqueue(tid);
    }

    /// Removes a running thread from consideration without destroying it
    /// (spec 4.4, `wait_notification`).
    pub fn block_current(&mut self) {
        if let Some(tid) = self.current.take() {
            if let Some(t) = self.threads.get_mut(&tid) {
                t.state = ThreadState::Blocked;
            }
        }
    }

    /// Moves a blocked thread back onto its rp queue (spec 4.6, notification wakeup).
    pub fn unblock(&mut self, tid: Tid) {
        if let Some(t) = self.threads.get_mut(&tid) {
            if t.state == ThreadState::Blocked {
                t.state = ThreadState::Ready;
                self.enqueue(tid);
            }
        }
    }

    /// Retires the current thread permanently (spec 4.3, `exit`; spec 4.4, `terminate`).
    pub fn terminate_current(&mut self) {
        if let Some(tid) = self.current.take() {
            if let Some(t) = self.threads.get_mut(&tid) {
                t.state = ThreadState::Zombie;
            }
        }
    }

    /// Transitions `tid` - which must be the currently running thread - to
    /// `Yielding`, a voluntary deschedule that does not preserve its
    /// leftover quantum (spec 4.4, `yield`). Fails if `tid` isn't the thread
    /// actually running.
    pub fn yield_current(&mut self, tid: Tid) -> KernelResult<()> {
        if self.current != Some(tid) {
            return Err(KernelError::BadArgument);
        }
        let t = self.threads.get_mut(&tid).ok_or(KernelError::NoSuchCapability)?;
        if t.state != ThreadState::Running {
            return Err(KernelError::BadArgument);
        }
        t.state = ThreadState::Yielding;
        Ok(())
    }

    /// Running -> Blocked (spec 4.4, `suspend`). Only the thread currently
    /// occupying the CPU can be suspended in this single-hardware-thread
    /// model, so a non-`Running` target is `BadArgument`.
    pub fn suspend(&mut self, tid: Tid) -> KernelResult<()> {
        let t = self.threads.get_mut(&tid).ok_or(KernelError::NoSuchCapability)?;
        if t.state != ThreadState::Running {
            return Err(KernelError::BadArgument);
        }
        t.state = ThreadState::Blocked;
        if self.current == Some(tid) {
            self.current = None;
        }
        Ok(())
    }

    /// Blocked -> Ready (spec 4.4, `resume`), requeued onto its rp class.
    pub fn resume(&mut self, tid: Tid) -> KernelResult<()> {
        let t = self.threads.get_mut(&tid).ok_or(KernelError::NoSuchCapability)?;
        if t.state != ThreadState::Blocked {
            return Err(KernelError::BadArgument);
        }
        t.state = ThreadState::Ready;
        self.enqueue(tid);
        Ok(())
    }

    /// Changes `tid`'s scheduling priority (spec 4.4, `set_priority`),
    /// moving it between rp classes if it is currently sitting in a ready
    /// queue. A thread that is `Running`, `Blocked` or `Zombie` simply has
    /// its priority field updated; it is re-queued under the new class the
    /// next time it becomes `Ready`.
    pub fn set_priority(&mut self, tid: Tid, priority: Priority) -> KernelResult<()> {
        if !self.threads.contains_key(&tid) {
            return Err(KernelError::NoSuchCapability);
        }
        self.rp0.retain(|&t| t != tid);
        self.rp1.retain(|&t| t != tid);
        self.rp2.retain(|&t| t != tid);
        self.rp3.retain(|&t| t != tid);

        let was_ready = {
            let t = self.threads.get_mut(&tid).unwrap();
            t.priority = priority;
            t.state == ThreadState::Ready
        };
        if was_ready {
            self.enqueue(tid);
        }
        Ok(())
    }

    pub fn terminate(&mut self, tid: Tid) {
        self.rp0.retain(|&t| t != tid);
        self.rp1.retain(|&t| t != tid);
        self.rp2.retain(|&t| t != tid);
        self.rp3.retain(|&t| t != tid);
        if self.current == Some(tid) {
            self.current = None;
        }
        if let Some(t) = self.threads.get_mut(&tid) {
            t.state = ThreadState::Zombie;
        }
    }

    /// Consumes one timer tick for the current thread. Returns `true` if
    /// the current thread's quantum just ran out and a reschedule is due
    /// (spec 4.7). rp0 threads never consume quantum - real-time classes
    /// run to completion.
    pub fn tick_current(&mut self) -> bool {
        let Some(tid) = self.current else { return false };
        let level = self.level_of(tid);
        if !matches!(level, RpLevel::Rp1 | RpLevel::Rp2) {
            return false;
        }
        if let Some(t) = self.threads.get_mut(&tid) {
            t.run_time += 1;
            if t.quantum_left > 0 {
                t.quantum_left -= 1;
            }
            t.quantum_left == 0
        } else {
            false
        }
    }

    /// Runs the selection algorithm (spec 4.7):
    /// 1. If the outgoing thread is still `Running`, requeue it onto its
    ///    own rp class (quantum expiry or voluntary yield).
    /// 2. rp0 is checked first; a ready rp0 thread always wins and is never
    ///    preempted once selected.
    /// 3. rp1, then rp2, round-robin within their own class.
    /// 4. rp3 picks the least-run daemon thread.
    /// 5. If nothing is ready anywhere, fall back to the idle thread.
    pub fn select_next(&mut self) -> Tid {
        if let Some(prev) = self.current.take() {
            let still_runnable = matches!(
                self.threads.get(&prev).map(|t| t.state),
                Some(ThreadState::Running) | Some(ThreadState::Yielding)
            );
            if still_runnable {
                if let Some(t) = self.threads.get_mut(&prev) {
                    t.state = ThreadState::Ready;
                }
                self.enqueue(prev);
            }
        }

        let next = self
            .rp0
            .pop_front()
            .or_else(|| self.rp1.pop_front())
            .or_else(|| self.rp2.pop_front())
            .or_else(|| {
                if self.rp3.is_empty() {
                    None
                } else {
                    Some(self.rp3.remove(0))
                }
            })
            .unwrap_or(self.idle);

        if let Some(t) = self.threads.get_mut(&next) {
            t.state = ThreadState::Running;
        }
        self.current = Some(next);
        next
    }

    pub fn regs_mut(&mut self, tid: Tid) -> Option<&mut RegCtx> {
        self.threads.get_mut(&tid).map(|t| &mut t.regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pid;

    fn tcb(tid: Tid, prio: Priority) -> Tcb {
        Tcb::new(tid, Pid(1), prio, 64)
    }

    fn sched_with_idle() -> Scheduler {
        Scheduler::new(Tid(0), tcb(Tid(0), Priority::Daemon))
    }

    #[test]
    fn rt_thread_always_wins_over_lower_classes() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        s.add_thread(Tid(2), tcb(Tid(2), Priority::Rt));
        assert_eq!(s.select_next(), Tid(2));
    }

    #[test]
    fn rt_thread_keeps_running_until_it_yields() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::Rt));
        assert_eq!(s.select_next(), Tid(1));
        // still Running, still the only rp0 entrant: selection picks it again
        assert_eq!(s.select_next(), Tid(1));
    }

    #[test]
    fn falls_back_to_idle_when_nothing_ready() {
        let mut s = sched_with_idle();
        assert_eq!(s.select_next(), Tid(0));
    }

    #[test]
    fn rp3_picks_least_run_thread() {
        let mut s = sched_with_idle();
        let mut a = tcb(Tid(1), Priority::Daemon);
        a.run_time = 50;
        let b = tcb(Tid(2), Priority::Daemon);
        s.add_thread(Tid(1), a);
        s.add_thread(Tid(2), b);
        assert_eq!(s.select_next(), Tid(2));
    }

    #[test]
    fn quantum_expiry_requeues_to_back_of_class() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        s.add_thread(Tid(2), tcb(Tid(2), Priority::User));

        assert_eq!(s.select_next(), Tid(1));
        for _ in 0..Q2 {
            s.tick_current();
        }
        assert_eq!(s.select_next(), Tid(2));
        assert_eq!(s.select_next(), Tid(1));
    }

    #[test]
    fn unblock_requeues_a_blocked_thread() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        s.select_next();
        s.block_current();
        assert_eq!(s.get(Tid(1)).unwrap().state, ThreadState::Blocked);
        assert_eq!(s.select_next(), Tid(0)); // idle, nothing ready

        s.unblock(Tid(1));
        assert_eq!(s.select_next(), Tid(1));
    }

    #[test]
    fn yield_then_select_next_requeues_with_fresh_quantum() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        s.add_thread(Tid(2), tcb(Tid(2), Priority::User));

        assert_eq!(s.select_next(), Tid(1));
        s.yield_current(Tid(1)).unwrap();
        assert_eq!(s.select_next(), Tid(2));
        assert_eq!(s.select_next(), Tid(1));
        assert_eq!(s.get(Tid(1)).unwrap().quantum_left, Q2);
    }

    #[test]
    fn yield_current_rejects_a_non_running_thread() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        assert_eq!(s.yield_current(Tid(1)).unwrap_err(), KernelError::BadArgument);
    }

    #[test]
    fn suspend_blocks_the_running_thread() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        assert_eq!(s.select_next(), Tid(1));
        s.suspend(Tid(1)).unwrap();
        assert_eq!(s.get(Tid(1)).unwrap().state, ThreadState::Blocked);
        assert_eq!(s.current(), None);
    }

    #[test]
    fn resume_requeues_a_suspended_thread() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        s.select_next();
        s.suspend(Tid(1)).unwrap();
        s.resume(Tid(1)).unwrap();
        assert_eq!(s.get(Tid(1)).unwrap().state, ThreadState::Ready);
        assert_eq!(s.select_next(), Tid(1));
    }

    #[test]
    fn set_priority_moves_thread_between_queues() {
        let mut s = sched_with_idle();
        s.add_thread(Tid(1), tcb(Tid(1), Priority::User));
        s.set_priority(Tid(1), Priority::Rt).unwrap();
        s.add_thread(Tid(2), tcb(Tid(2), Priority::User));
        // Tid(1) now sits in rp0, so it wins over Tid(2)'s rp2 even though
        // Tid(1) was enqueued first under the old class.
        assert_eq!(s.select_next(), Tid(1));
    }
}
