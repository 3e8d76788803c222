//! Kernel error taxonomy (spec 7).
//!
//! Every capability-path failure returns one of these and, at the call
//! site, emits a structured log record - never a panic. The one exception is
//! the scheduler's unrecoverable-invariant hard halt (spec 7), which is
//! modeled as a dedicated function rather than a `KernelError` variant
//! because there is no caller left to hand a `Result` to.

use thiserror::Error;

/// Abstract error kinds shared by every core subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// `(cspace, cindex)` out of range, or the reserved `(0,0)` index.
    #[error("invalid capability index")]
    InvalidIndex,

    /// Slot empty, or the CSpace it would live in was never allocated.
    #[error("no such capability")]
    NoSuchCapability,

    /// Capability type does not match the operation requested of it.
    #[error("capability is the wrong type for this operation")]
    WrongType,

    /// `derivable` check against required privilege bits failed.
    #[error("insufficient privilege")]
    InsufficientPrivilege,

    /// No free slot and all CSpaces for the process are allocated.
    #[error("capability table full")]
    TableFull,

    /// Explicit `insert_at` targeted an already-populated slot.
    #[error("slot already occupied")]
    SlotOccupied,

    /// Null payload pointer, bad priority, or unknown syscall number.
    #[error("bad argument")]
    BadArgument,

    /// Kernel allocation failure.
    #[error("resource exhausted")]
    ResourceExhausted,
}

pub type KernelResult<T> = Result<T, KernelError>;
