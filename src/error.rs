// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Error kinds returned by the virtual memory core.
//!
//! Every fallible operation in this crate collapses to one of these
//! variants. Callers that sit at a trap-handler boundary (`handle_fault`,
//! `mmap`) are expected to further collapse this into a bare `bool`/`null`,
//! matching the source kernel's convention that a terminated process is
//! reported by the surrounding OS, not by this crate.

use core::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmError {
    /// `spt_insert` or `mmap` found the virtual address already mapped.
    VaAlreadyMapped,
    /// The swap pool has no free slots left to receive an evicted page.
    NoSwapSpace,
    /// The physical allocator is out of frames and no victim could be evicted.
    NoPhysicalFrame,
    /// `mmap` arguments failed validation (alignment, length, range, file length).
    MmapArgsInvalid,
    /// An uninit page's initializer closure reported failure.
    LazyLoadFailed,
    /// The fault is outside the SPT and does not satisfy the stack-growth predicate.
    IllegalAccess,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VmError::VaAlreadyMapped => "virtual address already mapped",
            VmError::NoSwapSpace => "swap pool exhausted",
            VmError::NoPhysicalFrame => "no physical frame available and no victim to evict",
            VmError::MmapArgsInvalid => "mmap arguments failed validation",
            VmError::LazyLoadFailed => "lazy page initializer failed",
            VmError::IllegalAccess => "fault is not a known page and not a stack-growth candidate",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;
