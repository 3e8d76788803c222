//! Capability-based microkernel core: CSpace, typed capabilities, the
//! process/thread model and the four-class preemptive scheduler.
//!
//! Real trap entry/exit, paging, the physical frame allocator, a device
//! tree, and an ELF/user-space runtime are out of scope (spec 1) - this
//! crate is the decision-making core those pieces would be built around,
//! not a bootable kernel by itself.
//!
//! `no_std` except under `cfg(test)`, where `std`/`alloc` back the test
//! harness directly - the same split `sys/kerncore` uses, so `cargo test`
//! never needs a cross target. rust-analyzer defaults to the `test` cfg, so
//! don't be surprised seeing `std` resolve in an editor; real builds never
//! see it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod arena;
pub mod capability;
pub mod config;
pub mod context;
pub mod cspace;
pub mod error;
pub mod klog;
pub mod memory;
pub mod notification;
pub mod priv_bits;
pub mod process;
pub mod scheduler;
pub mod syscall;
pub mod thread;

pub use arch::{Arch, FakeArch};
pub use context::KernelContext;
pub use error::{KernelError, KernelResult};
