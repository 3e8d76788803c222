//! Compile-time configuration constants.
//!
//! This core has no runtime configuration file to parse - a kernel image is
//! loaded cold each boot and reconstructs all state (spec 6). The usual
//! "configuration layer" here is a set of compile-time constants, the way
//! the teacher keeps `TASK_STACK_SIZE` next to `Task` in `task.rs`.

/// Number of CSpaces a process may lazily allocate (`cspace` component range).
pub const PROC_CSPACES: usize = 4;

/// Number of slots per CSpace (`cindex` component range).
pub const CSPACE_ITEMS: usize = 1024;

/// Service-class (rp1) time slice, in scheduling ticks.
pub const Q1: u32 = 5;

/// User-class (rp2) time slice, in scheduling ticks.
pub const Q2: u32 = 3;

/// Kernel stack size for a freshly created thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Number of 64-bit words backing a 256-bit notification bitmap.
pub const NOTIFICATION_WORDS: usize = 4;
