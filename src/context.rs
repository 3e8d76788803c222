//! Kernel context: the one piece of global mutable state (spec 9,
//! "Global mutable state ... Model them as a typed kernel context owned by
//! the scheduler module, initialized once at boot").
//!
//! Everything that used to be a collection of separate kernel-wide statics
//! in the teacher (`KERNEL_CSPACE`, a bare `SCHEDULER` mutex) is folded into
//! one `KernelContext<A>` here, generic over the `Arch` implementation so
//! tests can run it against `FakeArch` without touching real hardware.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::arch::Arch;
use crate::arena::{CapArena, CapKind, NotificationAux, Payload};
use crate::capability;
use crate::cspace::CapabilityIndex;
use crate::error::{KernelError, KernelResult};
use crate::memory::{MemoryPayload, VmaList};
use crate::notification::NotificationPayload;
use crate::priv_bits::{self, Bitmap256, PrivFlags};
use crate::process::{Pcb, Pid, ProcessState, RpLevel};
use crate::scheduler::Scheduler;
use crate::thread::{Priority, Tcb, ThreadState, Tid};

use alloc::sync::Arc;
use spin::Mutex;

pub struct KernelContext<A: Arch> {
    pub arch: A,
    pub arena: CapArena,
    pub processes: BTreeMap<Pid, Pcb>,
    pub scheduler: Scheduler,
    next_pid: u64,
    next_tid: u64,
}

const KSTACK: usize = crate::config::KERNEL_STACK_SIZE;

impl<A: Arch> KernelContext<A> {
    /// Boots a fresh kernel context with PID 0 / TID 0 reserved for the
    /// idle process (spec 4.7 step 7).
    pub fn new(arch: A) -> Self {
        let idle_tid = Tid(0);
        let mut idle_tcb = Tcb::new(idle_tid, Pid::IDLE, Priority::Daemon, KSTACK);
        idle_tcb.state = ThreadState::Ready;

        let mut idle_pcb = Pcb::new(Pid::IDLE, None, RpLevel::Rp3, Box::new(VmaList::new()), 0);
        idle_pcb.main_thread = Some(idle_tid);
        idle_pcb.threads.push(idle_tid);

        let mut processes = BTreeMap::new();
        processes.insert(Pid::IDLE, idle_pcb);

        KernelContext {
            arch,
            arena: CapArena::new(),
            processes,
            scheduler: Scheduler::new(idle_tid, idle_tcb),
            next_pid: 1,
            next_tid: 1,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Creates a fresh process with one running thread at `entry`
    /// (spec 4.3, `new_task`): sets up a stack VMA, grants the new process
    /// a self-PCB capability carrying exit/fork/getpid/create_thread, and
    /// passes that capability's index as syscall argument 0.
    pub fn spawn_process(
        &mut self,
        parent: Option<Pid>,
        rp_level: RpLevel,
        entry: u64,
        stack_top: u64,
    ) -> KernelResult<(Pid, Tid)> {
        let pid = self.alloc_pid();
        let tid = self.alloc_tid();

        let mut memory = VmaList::new();
        memory.add_vma(stack_top - 0x1000, 0x1000, stack_top - 0x1000, true);

        let mut pcb = Pcb::new(pid, parent, rp_level, Box::new(memory), entry);
        pcb.main_thread = Some(tid);
        pcb.threads.push(tid);

        let mut tcb = Tcb::new(tid, pid, rp_level.priority(), KSTACK);
        self.arch.arch_setup_proc(&mut tcb.regs, entry, stack_top);

        let self_cap = capability::create(
            &mut self.arena,
            &mut pcb.cspaces,
            pid,
            CapKind::Pcb,
            Payload::Pcb(pid),
            PrivFlags::DERIVE
                | PrivFlags::PCB_EXIT
                | PrivFlags::PCB_FORK
                | PrivFlags::PCB_GETPID
                | PrivFlags::PCB_CREATE_THREAD,
            None,
        )?;
        self.arch.arch_setup_argument(&mut tcb.regs, 0, self_cap.to_word());

        self.processes.insert(pid, pcb);
        self.scheduler.add_thread(tid, tcb);
        if let Some(parent_pid) = parent {
            if let Some(p) = self.processes.get_mut(&parent_pid) {
                p.children.push(pid);
            }
        }
        Ok((pid, tid))
    }

    /// Clones `parent`'s address space and the calling thread's saved
    /// register context into a brand-new child process (spec 4.3, `fork`;
    /// spec 8, S1). The child's saved PC is advanced one instruction past
    /// the trapping syscall, so both parent and child resume just after it;
    /// the child gets `0` in its primary return, the parent gets the child's
    /// pid written into its secondary return register by the caller (the
    /// `Fork` syscall handler owns that half, since only it has the parent's
    /// own `Tid` to address). Returns a freshly-minted PCB capability over
    /// the child, carrying the same privilege set `parent_priv` the parent
    /// held on itself, plus the new child's pid.
    pub fn fork(
        &mut self,
        parent: Pid,
        caller_tid: Tid,
        parent_priv: PrivFlags,
        child_stack_top: u64,
    ) -> KernelResult<(CapabilityIndex, Pid)> {
        let rp_level = self
            .processes
            .get(&parent)
            .map(|p| p.rp_level)
            .ok_or_else(|| {
                log::warn!("fork: parent process {:?} not found", parent);
                KernelError::NoSuchCapability
            })?;
        let entry = self.processes.get(&parent).map(|p| p.entrypoint).unwrap();
        let parent_vmas: Vec<_> = self.processes.get(&parent).map(|p| p.memory.vmas().to_vec()).unwrap_or_default();

        let caller_tcb = self.scheduler.get(caller_tid).ok_or_else(|| {
            log::warn!("fork: calling thread {:?} not found", caller_tid);
            KernelError::NoSuchCapability
        })?;
        let mut child_regs = caller_tcb.regs;
        let caller_priority = caller_tcb.priority;
        child_regs.sp = child_stack_top;
        child_regs.ip += self.arch.instruction_length();
        child_regs.ret0 = 0;

        let child_pid = self.alloc_pid();
        let child_tid = self.alloc_tid();

        let mut memory = VmaList::new();
        for v in &parent_vmas {
            memory.add_vma(v.vaddr, v.size, v.paddr, v.writable);
        }

        let mut child_pcb = Pcb::new(child_pid, Some(parent), rp_level, Box::new(memory), entry);
        child_pcb.main_thread = Some(child_tid);
        child_pcb.threads.push(child_tid);

        let mut child_tcb = Tcb::new(child_tid, child_pid, caller_priority, KSTACK);
        child_tcb.regs = child_regs;

        let self_cap = capability::create(
            &mut self.arena,
            &mut child_pcb.cspaces,
            child_pid,
            CapKind::Pcb,
            Payload::Pcb(child_pid),
            PrivFlags::DERIVE
                | PrivFlags::PCB_EXIT
                | PrivFlags::PCB_FORK
                | PrivFlags::PCB_GETPID
                | PrivFlags::PCB_CREATE_THREAD,
            None,
        )?;
        self.arch.arch_setup_argument(&mut child_tcb.regs, 0, self_cap.to_word());

        self.processes.insert(child_pid, child_pcb);
        self.scheduler.add_thread(child_tid, child_tcb);
        if let Some(p) = self.processes.get_mut(&parent) {
            p.children.push(child_pid);
        }

        let parent_pcb = self.processes.get_mut(&parent).ok_or(KernelError::NoSuchCapability)?;
        let child_cap_idx = capability::create(
            &mut self.arena,
            &mut parent_pcb.cspaces,
            parent,
            CapKind::Pcb,
            Payload::Pcb(child_pid),
            parent_priv,
            None,
        )?;

        Ok((child_cap_idx, child_pid))
    }

    /// Marks `pid` a zombie and retires every one of its threads
    /// (spec 4.3, `exit`). The PCB stays in `processes` until reaped;
    /// reaping itself is out of scope (spec 1).
    pub fn exit(&mut self, pid: Pid) -> KernelResult<()> {
        let threads = self.processes.get(&pid).map(|p| p.threads.clone()).ok_or_else(|| {
            log::warn!("exit: process {:?} not found", pid);
            KernelError::NoSuchCapability
        })?;
        for tid in threads {
            self.scheduler.terminate(tid);
        }
        if let Some(p) = self.processes.get_mut(&pid) {
            p.state = ProcessState::Zombie;
        }
        Ok(())
    }

    pub fn getpid(&self, pid: Pid) -> u64 {
        pid.0
    }

    /// Creates a new thread inside `owner` at the caller-chosen `priority`,
    /// which may diverge from the process's own rp level (spec 4.3,
    /// `create_thread`; spec 4.7). Seeds the new thread's register context,
    /// hands it a self-TCB capability as its first argument, and enqueues
    /// it Ready. Returns the new thread's id and that minted capability.
    pub fn create_thread(&mut self, owner: Pid, entry: u64, priority: Priority) -> KernelResult<(Tid, CapabilityIndex)> {
        if !self.processes.contains_key(&owner) {
            log::warn!("create_thread: owner process {:?} not found", owner);
            return Err(KernelError::NoSuchCapability);
        }
        let tid = self.alloc_tid();
        let mut tcb = Tcb::new(tid, owner, priority, KSTACK);
        let stack_top = tcb.kstack.as_ptr() as u64 + tcb.kstack.len() as u64;
        self.arch.arch_setup_proc(&mut tcb.regs, entry, stack_top);

        let pcb = self.processes.get_mut(&owner).ok_or(KernelError::NoSuchCapability)?;
        let self_cap = capability::create(
            &mut self.arena,
            &mut pcb.cspaces,
            owner,
            CapKind::Tcb,
            Payload::Tcb(tid),
            PrivFlags::TCB_ALL,
            None,
        )?;
        self.arch.arch_setup_argument(&mut tcb.regs, 0, self_cap.to_word());

        pcb.threads.push(tid);
        self.scheduler.add_thread(tid, tcb);
        Ok((tid, self_cap))
    }

    /// Destroys a capability and everything derived from it, unlinking
    /// each destroyed node from whichever process's CSpace it actually
    /// lives in (spec 4.2, `I-CAP-3`).
    pub fn revoke(&mut self, owner: Pid, idx: CapabilityIndex) -> KernelResult<()> {
        let owner_pcb = self.processes.get(&owner).ok_or(KernelError::NoSuchCapability)?;
        let cap_id = capability::fetch(&owner_pcb.cspaces, idx)?;

        let mut processes = core::mem::take(&mut self.processes);
        let result = capability::revoke(&mut self.arena, cap_id, |node| {
            if let Some(p) = processes.get_mut(&node.owner) {
                p.cspaces.remove(node.index);
            }
        });
        self.processes = processes;
        result
    }

    /// Creates a fresh Notification capability payload owned by `owner`
    /// (spec 4.6).
    pub fn create_notification(&mut self, owner: Pid, aux: NotificationAux) -> KernelResult<CapabilityIndex> {
        let payload = Arc::new(Mutex::new(NotificationPayload::new()));
        let pcb = self.processes.get_mut(&owner).ok_or(KernelError::NoSuchCapability)?;
        capability::create(
            &mut self.arena,
            &mut pcb.cspaces,
            owner,
            CapKind::Notification,
            Payload::Notification(payload),
            PrivFlags::DERIVE | PrivFlags::UNPACK,
            Some(aux),
        )
    }

    fn notification_payload(&self, owner: Pid, idx: CapabilityIndex) -> KernelResult<Arc<Mutex<NotificationPayload>>> {
        let pcb = self.processes.get(&owner).ok_or(KernelError::NoSuchCapability)?;
        let node = capability::fetch_node(&self.arena, &pcb.cspaces, idx)?;
        match &node.payload {
            Payload::Notification(p) => Ok(p.clone()),
            _ => {
                log::warn!("notification_payload: {:?} is not a Notification capability", idx);
                Err(KernelError::WrongType)
            }
        }
    }

    fn notification_aux(&self, owner: Pid, idx: CapabilityIndex) -> KernelResult<NotificationAux> {
        let pcb = self.processes.get(&owner).ok_or(KernelError::NoSuchCapability)?;
        let node = capability::fetch_node(&self.arena, &pcb.cspaces, idx)?;
        if node.kind != CapKind::Notification {
            log::warn!("notification_aux: {:?} is not a Notification capability", idx);
            return Err(KernelError::WrongType);
        }
        node.aux.ok_or_else(|| {
            log::warn!("notification_aux: {:?} carries no aux mask", idx);
            KernelError::WrongType
        })
    }

    /// Sets `mask`'s bits, privilege-checked against `may_set`, and wakes
    /// any thread it unblocks (spec 4.6).
    pub fn set_notification(&mut self, owner: Pid, idx: CapabilityIndex, mask: Bitmap256) -> KernelResult<()> {
        let aux = self.notification_aux(owner, idx)?;
        if !mask.is_subset_of(&aux.may_set) {
            log::warn!("set_notification: {:?} not within may_set for {:?}", mask, idx);
            return Err(KernelError::InsufficientPrivilege);
        }
        let payload = self.notification_payload(owner, idx)?;
        let woken = payload.lock().set(mask);
        if let Some(tid) = woken {
            self.scheduler.unblock(tid);
        }
        Ok(())
    }

    pub fn reset_notification(&mut self, owner: Pid, idx: CapabilityIndex, mask: Bitmap256) -> KernelResult<()> {
        let aux = self.notification_aux(owner, idx)?;
        if !mask.is_subset_of(&aux.may_reset) {
            log::warn!("reset_notification: {:?} not within may_reset for {:?}", mask, idx);
            return Err(KernelError::InsufficientPrivilege);
        }
        let payload = self.notification_payload(owner, idx)?;
        payload.lock().reset(mask);
        Ok(())
    }

    pub fn check_notification(&mut self, owner: Pid, idx: CapabilityIndex, mask: Bitmap256) -> KernelResult<Bitmap256> {
        let aux = self.notification_aux(owner, idx)?;
        if !mask.is_subset_of(&aux.may_check) {
            log::warn!("check_notification: {:?} not within may_check for {:?}", mask, idx);
            return Err(KernelError::InsufficientPrivilege);
        }
        let payload = self.notification_payload(owner, idx)?;
        Ok(payload.lock().check(mask))
    }

    /// Blocks `tid` on `mask` unless it is already satisfied (spec 4.4,
    /// `wait_notification`). Returns the bits that were already set, if
    /// any, without ever touching the scheduler.
    pub fn wait_notification(
        &mut self,
        owner: Pid,
        tid: Tid,
        idx: CapabilityIndex,
        mask: Bitmap256,
    ) -> KernelResult<Option<Bitmap256>> {
        let aux = self.notification_aux(owner, idx)?;
        if !mask.is_subset_of(&aux.may_check) {
            log::warn!("wait_notification: {:?} not within may_check for {:?}", mask, idx);
            return Err(KernelError::InsufficientPrivilege);
        }
        let payload = self.notification_payload(owner, idx)?;
        let hit = payload.lock().wait(tid, mask);
        if hit.is_none() {
            self.scheduler.block_current();
        }
        Ok(hit)
    }

    /// Creates a fresh Memory capability payload owned by `owner`, covering
    /// `[paddr, paddr + size)` (spec 4.5).
    pub fn create_memory(&mut self, owner: Pid, paddr: u64, size: u64, mmio: bool) -> KernelResult<CapabilityIndex> {
        let mut payload = MemoryPayload::new(paddr, size);
        payload.mmio = mmio;
        let payload = Arc::new(Mutex::new(payload));
        let pcb = self.processes.get_mut(&owner).ok_or_else(|| {
            log::warn!("create_memory: owner process {:?} not found", owner);
            KernelError::NoSuchCapability
        })?;
        capability::create(
            &mut self.arena,
            &mut pcb.cspaces,
            owner,
            CapKind::Memory,
            Payload::Memory(payload),
            PrivFlags::MEM_ALL,
            None,
        )
    }

    fn memory_node_priv(&self, owner: Pid, idx: CapabilityIndex) -> KernelResult<(Arc<Mutex<MemoryPayload>>, PrivFlags)> {
        let pcb = self.processes.get(&owner).ok_or_else(|| {
            log::warn!("memory op: owner process {:?} not found", owner);
            KernelError::NoSuchCapability
        })?;
        let node = capability::fetch_node(&self.arena, &pcb.cspaces, idx)?;
        if node.kind != CapKind::Memory {
            log::warn!("memory op: {:?} is not a Memory capability", idx);
            return Err(KernelError::WrongType);
        }
        match &node.payload {
            Payload::Memory(p) => Ok((p.clone(), node.priv_word)),
            _ => {
                log::warn!("memory op: {:?} carries no Memory payload", idx);
                Err(KernelError::WrongType)
            }
        }
    }

    /// Returns the payload's `(paddr, size)` (spec 4.5, `MEM_GETPADDR`).
    pub fn mem_getpaddr(&self, owner: Pid, idx: CapabilityIndex) -> KernelResult<(u64, u64)> {
        let (payload, priv_word) = self.memory_node_priv(owner, idx)?;
        priv_bits::require(priv_word, PrivFlags::MEM_GETPADDR)?;
        let p = payload.lock();
        Ok((p.paddr, p.size))
    }

    /// Maps the payload's physical range into `owner`'s address space at
    /// `vaddr`, writable iff the capability carries `MEM_WRITE` (spec 4.5,
    /// `MEM_MAP`).
    pub fn mem_map(&mut self, owner: Pid, idx: CapabilityIndex, vaddr: u64) -> KernelResult<()> {
        let (payload, priv_word) = self.memory_node_priv(owner, idx)?;
        priv_bits::require(priv_word, PrivFlags::MEM_MAP)?;
        let (paddr, size) = {
            let p = payload.lock();
            (p.paddr, p.size)
        };
        let writable = priv_word.contains(PrivFlags::MEM_WRITE);
        let pcb = self.processes.get_mut(&owner).ok_or(KernelError::NoSuchCapability)?;
        pcb.memory.add_vma(vaddr, size, paddr, writable);
        Ok(())
    }

    /// Removes whichever mapping at `vaddr` this capability installed
    /// (spec 4.5, `MEM_UNMAP`).
    pub fn mem_unmap(&mut self, owner: Pid, idx: CapabilityIndex, vaddr: u64) -> KernelResult<()> {
        let (_payload, priv_word) = self.memory_node_priv(owner, idx)?;
        priv_bits::require(priv_word, PrivFlags::MEM_UNMAP)?;
        let pcb = self.processes.get_mut(&owner).ok_or(KernelError::NoSuchCapability)?;
        pcb.memory.remove_vma(vaddr);
        Ok(())
    }

    /// Marks the payload shared, permitting it to be derived/mapped into
    /// other address spaces without losing its backing frames on a single
    /// revoke (spec 4.5, `MEM_SHARE`).
    pub fn mem_share(&mut self, owner: Pid, idx: CapabilityIndex) -> KernelResult<()> {
        let (payload, priv_word) = self.memory_node_priv(owner, idx)?;
        priv_bits::require(priv_word, PrivFlags::MEM_SHARE)?;
        payload.lock().shared = true;
        Ok(())
    }

    /// Clears the payload's shared flag (spec 4.5, `MEM_UNSHARE`).
    pub fn mem_unshare(&mut self, owner: Pid, idx: CapabilityIndex) -> KernelResult<()> {
        let (payload, priv_word) = self.memory_node_priv(owner, idx)?;
        priv_bits::require(priv_word, PrivFlags::MEM_UNSHARE)?;
        payload.lock().shared = false;
        Ok(())
    }

    /// Derives `src_idx` (a capability owned by `owner`) into `dest_pid`'s
    /// CSpace table, narrowed to `child_priv` (spec 4.2 `derive_cap`,
    /// spec 5: "Derivation across processes requires a PCB capability on the
    /// destination"). `dest_pcb_idx` must be a Pcb capability over the
    /// destination process, carrying `PCB_MIGRATE_CAPS`.
    pub fn migrate_caps(
        &mut self,
        owner: Pid,
        dest_pcb_idx: CapabilityIndex,
        src_idx: CapabilityIndex,
        child_priv: PrivFlags,
    ) -> KernelResult<CapabilityIndex> {
        let (dest_pid, src_id) = {
            let owner_pcb = self.processes.get(&owner).ok_or_else(|| {
                log::warn!("migrate_caps: owner process {:?} not found", owner);
                KernelError::NoSuchCapability
            })?;
            let dest_node = capability::fetch_node(&self.arena, &owner_pcb.cspaces, dest_pcb_idx)?;
            if dest_node.kind != CapKind::Pcb {
                log::warn!("migrate_caps: {:?} is not a Pcb capability", dest_pcb_idx);
                return Err(KernelError::WrongType);
            }
            priv_bits::require(dest_node.priv_word, PrivFlags::PCB_MIGRATE_CAPS)?;
            let dest_pid = match &dest_node.payload {
                Payload::Pcb(pid) => *pid,
                _ => {
                    log::warn!("migrate_caps: {:?} carries no Pcb payload", dest_pcb_idx);
                    return Err(KernelError::WrongType);
                }
            };
            let src_id = capability::fetch(&owner_pcb.cspaces, src_idx)?;
            (dest_pid, src_id)
        };

        let mut dest_pcb = self.processes.remove(&dest_pid).ok_or_else(|| {
            log::warn!("migrate_caps: destination process {:?} not found", dest_pid);
            KernelError::NoSuchCapability
        })?;
        let result = capability::derive(&mut self.arena, src_id, dest_pid, &mut dest_pcb.cspaces, child_priv);
        self.processes.insert(dest_pid, dest_pcb);
        result
    }

    /// Lists every occupied capability slot of the process named by the
    /// `PCB_ENUM_CAPS`-carrying capability `pcb_idx` (spec 4.3, 5). The
    /// syscall boundary exposes only the count, since marshalling a
    /// variable-length capability list across scalar registers is out of
    /// scope (spec 1); this operation itself returns the full list.
    pub fn enum_caps(&self, owner: Pid, pcb_idx: CapabilityIndex) -> KernelResult<Vec<CapabilityIndex>> {
        let pcb = self.processes.get(&owner).ok_or_else(|| {
            log::warn!("enum_caps: owner process {:?} not found", owner);
            KernelError::NoSuchCapability
        })?;
        let node = capability::fetch_node(&self.arena, &pcb.cspaces, pcb_idx)?;
        if node.kind != CapKind::Pcb {
            log::warn!("enum_caps: {:?} is not a Pcb capability", pcb_idx);
            return Err(KernelError::WrongType);
        }
        priv_bits::require(node.priv_word, PrivFlags::PCB_ENUM_CAPS)?;
        let target_pid = match &node.payload {
            Payload::Pcb(pid) => *pid,
            _ => {
                log::warn!("enum_caps: {:?} carries no Pcb payload", pcb_idx);
                return Err(KernelError::WrongType);
            }
        };
        let target_pcb = self.processes.get(&target_pid).ok_or_else(|| {
            log::warn!("enum_caps: target process {:?} not found", target_pid);
            KernelError::NoSuchCapability
        })?;
        Ok(target_pcb.cspaces.occupied_indices())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::FakeArch;

    fn boot() -> KernelContext<FakeArch> {
        KernelContext::new(FakeArch::new())
    }

    #[test]
    fn spawn_grants_self_capability_at_arg0() {
        let mut ctx = boot();
        let (pid, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let regs = ctx.scheduler.get(tid).unwrap().regs;
        let idx = CapabilityIndex::from_word(regs.arg0);
        let pcb = ctx.processes.get(&pid).unwrap();
        let cap_id = capability::fetch(&pcb.cspaces, idx).unwrap();
        assert_eq!(ctx.arena.get(cap_id).unwrap().kind, CapKind::Pcb);
    }

    #[test]
    fn fork_creates_independent_child_with_cloned_memory() {
        let mut ctx = boot();
        let (parent, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let parent_priv = PrivFlags::DERIVE | PrivFlags::PCB_EXIT | PrivFlags::PCB_FORK;
        let (child_cap, child) = ctx.fork(parent, tid, parent_priv, 0xa000).unwrap();
        assert_ne!(parent, child);
        assert_eq!(ctx.processes.get(&child).unwrap().memory.vmas().len(), 1);
        assert!(ctx.processes.get(&parent).unwrap().children.contains(&child));

        // The parent gets back a freshly-minted PCB capability over the
        // child, carrying exactly the privilege it held on itself.
        let parent_pcb = ctx.processes.get(&parent).unwrap();
        let cap_id = capability::fetch(&parent_pcb.cspaces, child_cap).unwrap();
        let node = ctx.arena.get(cap_id).unwrap();
        assert_eq!(node.kind, CapKind::Pcb);
        assert_eq!(node.priv_word, parent_priv);
        assert!(matches!(node.payload, Payload::Pcb(p) if p == child));
    }

    #[test]
    fn fork_advances_child_pc_and_zeroes_its_primary_return() {
        let mut ctx = boot();
        let (parent, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let parent_ip = ctx.scheduler.get(tid).unwrap().regs.ip;
        let (_cap, child) = ctx.fork(parent, tid, PrivFlags::PCB_EXIT, 0xa000).unwrap();
        let child_tid = ctx.processes.get(&child).unwrap().main_thread.unwrap();
        let child_regs = ctx.scheduler.get(child_tid).unwrap().regs;
        assert_eq!(child_regs.ip, parent_ip + ctx.arch.instruction_length());
        assert_eq!(child_regs.ret0, 0);
        assert_eq!(child_regs.sp, 0xa000);
    }

    #[test]
    fn exit_zombifies_and_retires_threads() {
        let mut ctx = boot();
        let (pid, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        ctx.exit(pid).unwrap();
        assert_eq!(ctx.processes.get(&pid).unwrap().state, ProcessState::Zombie);
        assert_eq!(ctx.scheduler.get(tid).unwrap().state, ThreadState::Zombie);
    }

    #[test]
    fn wait_then_set_wakes_the_blocked_thread() {
        let mut ctx = boot();
        let (pid, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let aux = NotificationAux {
            may_set: Bitmap256::single(1),
            may_reset: Bitmap256::single(1),
            may_check: Bitmap256::single(1),
        };
        let idx = ctx.create_notification(pid, aux).unwrap();

        ctx.scheduler.select_next();
        let hit = ctx.wait_notification(pid, tid, idx, Bitmap256::single(1)).unwrap();
        assert!(hit.is_none());
        assert_eq!(ctx.scheduler.get(tid).unwrap().state, ThreadState::Blocked);

        ctx.set_notification(pid, idx, Bitmap256::single(1)).unwrap();
        assert_eq!(ctx.scheduler.get(tid).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn revoke_removes_from_owning_process_cspace() {
        let mut ctx = boot();
        let (pid, _tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let aux = NotificationAux::default();
        let idx = ctx.create_notification(pid, aux).unwrap();
        ctx.revoke(pid, idx).unwrap();
        let pcb = ctx.processes.get(&pid).unwrap();
        assert!(!pcb.cspaces.is_occupied(idx));
    }

    #[test]
    fn create_thread_honors_caller_chosen_priority_and_mints_self_cap() {
        let mut ctx = boot();
        let (pid, _tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let (new_tid, cap) = ctx.create_thread(pid, 0x2000, Priority::Rt).unwrap();
        assert_eq!(ctx.scheduler.get(new_tid).unwrap().priority, Priority::Rt);

        let regs = ctx.scheduler.get(new_tid).unwrap().regs;
        assert_eq!(CapabilityIndex::from_word(regs.arg0), cap);

        let pcb = ctx.processes.get(&pid).unwrap();
        let cap_id = capability::fetch(&pcb.cspaces, cap).unwrap();
        assert_eq!(ctx.arena.get(cap_id).unwrap().kind, CapKind::Tcb);
        assert!(pcb.threads.contains(&new_tid));
    }

    #[test]
    fn mem_map_installs_a_vma_and_unmap_removes_it() {
        let mut ctx = boot();
        let (pid, _tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let idx = ctx.create_memory(pid, 0x20000, 0x1000, false).unwrap();
        assert_eq!(ctx.mem_getpaddr(pid, idx).unwrap(), (0x20000, 0x1000));

        ctx.mem_map(pid, idx, 0x40000).unwrap();
        assert!(ctx.processes.get(&pid).unwrap().memory.find_vma(0x40000).is_some());

        ctx.mem_unmap(pid, idx, 0x40000).unwrap();
        assert!(ctx.processes.get(&pid).unwrap().memory.find_vma(0x40000).is_none());
    }

    #[test]
    fn mem_map_rejects_a_capability_missing_the_map_bit() {
        let mut ctx = boot();
        let (pid, _tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let idx = ctx.create_memory(pid, 0x20000, 0x1000, false).unwrap();
        {
            let pcb = ctx.processes.get(&pid).unwrap();
            let cap_id = capability::fetch(&pcb.cspaces, idx).unwrap();
            capability::degrade(&mut ctx.arena, cap_id, PrivFlags::MEM_GETPADDR).unwrap();
        }
        assert_eq!(ctx.mem_map(pid, idx, 0x40000).unwrap_err(), KernelError::InsufficientPrivilege);
    }

    #[test]
    fn mem_share_and_unshare_toggle_the_shared_flag() {
        let mut ctx = boot();
        let (pid, _tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let idx = ctx.create_memory(pid, 0x20000, 0x1000, false).unwrap();
        ctx.mem_share(pid, idx).unwrap();
        let pcb = ctx.processes.get(&pid).unwrap();
        let cap_id = capability::fetch(&pcb.cspaces, idx).unwrap();
        let payload = match &ctx.arena.get(cap_id).unwrap().payload {
            Payload::Memory(p) => p.clone(),
            _ => panic!("expected Memory payload"),
        };
        assert!(payload.lock().shared);
        ctx.mem_unshare(pid, idx).unwrap();
        assert!(!payload.lock().shared);
    }

    #[test]
    fn migrate_caps_derives_into_the_destination_process() {
        let mut ctx = boot();
        let (src_pid, src_tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        // fork hands the caller back a Pcb capability over the new process,
        // carrying whatever privilege we ask for - reuse it as the
        // destination capability migrate_caps itself requires.
        let (dest_pcb_idx, dest_pid) = ctx.fork(src_pid, src_tid, PrivFlags::PCB_MIGRATE_CAPS, 0xa000).unwrap();

        let aux = NotificationAux::default();
        let notif_idx = ctx.create_notification(src_pid, aux).unwrap();

        let migrated = ctx
            .migrate_caps(src_pid, dest_pcb_idx, notif_idx, PrivFlags::DERIVE)
            .unwrap();

        let dest_pcb = ctx.processes.get(&dest_pid).unwrap();
        assert!(dest_pcb.cspaces.is_occupied(migrated));
        let cap_id = capability::fetch(&dest_pcb.cspaces, migrated).unwrap();
        assert_eq!(ctx.arena.get(cap_id).unwrap().kind, CapKind::Notification);
    }

    #[test]
    fn enum_caps_lists_target_processs_occupied_slots() {
        let mut ctx = boot();
        let (parent, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let (child_cap, child) = ctx.fork(parent, tid, PrivFlags::PCB_ENUM_CAPS, 0xa000).unwrap();

        let before = ctx.enum_caps(parent, child_cap).unwrap();
        ctx.create_notification(child, NotificationAux::default()).unwrap();
        let after = ctx.enum_caps(parent, child_cap).unwrap();
        assert_eq!(after.len(), before.len() + 1);
    }

    #[test]
    fn enum_caps_rejects_a_capability_missing_the_enum_bit() {
        let mut ctx = boot();
        let (parent, tid) = ctx
            .spawn_process(None, RpLevel::Rp2, 0x1000, 0x9000)
            .unwrap();
        let (child_cap, _child) = ctx.fork(parent, tid, PrivFlags::PCB_EXIT, 0xa000).unwrap();
        assert_eq!(ctx.enum_caps(parent, child_cap).unwrap_err(), KernelError::InsufficientPrivilege);
    }
}
