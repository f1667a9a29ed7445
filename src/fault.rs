// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Page fault handling and stack growth (spec.md §4.8), grounded on
//! `pintos/vm/vm.c`'s `vm_try_handle_fault` and `vm_stack_growth`.

use log::{debug, trace, warn};

use crate::config::{page_round_down, STACK_GROWTH_WINDOW, STACK_MAX, USER_STACK};
use crate::device::SwapDevice;
use crate::error::{VmError, VmResult};
use crate::mmu::{AddressSpaceId, Mmu};
use crate::palloc::PhysicalAllocator;
use crate::system::VmSystem;

/// Outcome of a fault, for callers (the trap handler) that need to decide
/// whether to resume the faulting instruction or kill the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is now present and the instruction can be retried.
    Resolved,
    /// Not a page this subsystem can service; the caller should terminate
    /// the faulting process.
    Reject,
}

/// Is `addr` close enough below the current stack pointer to be a valid
/// stack-growth request? Uses the raw (non-page-aligned) fault address, per
/// the original's comparison against `f->rsp`, since a push instruction can
/// fault a few bytes below the current stack pointer before the pointer
/// itself is updated.
fn is_stack_growth_candidate(addr: usize, rsp: usize) -> bool {
    if addr >= USER_STACK {
        return false;
    }
    let floor = USER_STACK.saturating_sub(STACK_MAX);
    if addr < floor {
        return false;
    }
    rsp.saturating_sub(addr) <= STACK_GROWTH_WINDOW
}

impl<M: Mmu, A: PhysicalAllocator, D: SwapDevice> VmSystem<M, A, D> {
    /// `vm_try_handle_fault` (spec.md §4.8): decide what a fault at `addr`
    /// means and, if it is one this subsystem handles, make the page
    /// present.
    ///
    /// `saved_rsp` is the stack pointer at the time of the fault (the
    /// kernel's own rsp when the fault happened in kernel mode while
    /// accessing a user buffer, or the trap frame's rsp for a user-mode
    /// fault — the caller is responsible for picking the right one, as the
    /// original does via `f->rsp` vs. the saved `thread_current()->rsp`).
    pub fn handle_fault(
        &mut self,
        pid: AddressSpaceId,
        addr: usize,
        saved_rsp: usize,
        user: bool,
        write: bool,
        not_present: bool,
    ) -> FaultOutcome {
        if !not_present {
            // The page is present: this is a protection violation (e.g. a
            // write to a read-only page). Never recoverable here.
            warn!("rejecting protection-violation fault: pid={pid} addr={addr:#x} write={write}");
            return FaultOutcome::Reject;
        }

        let va = page_round_down(addr);
        let already_mapped = self.process(pid).map(|p| p.spt.contains(va)).unwrap_or(false);

        if already_mapped {
            if write && !self.process(pid).and_then(|p| p.spt.find(va)).map(|p| p.writable).unwrap_or(false) {
                warn!("rejecting write fault on read-only page: pid={pid} addr={addr:#x}");
                return FaultOutcome::Reject;
            }
            return match self.claim(pid, va) {
                Ok(()) => {
                    trace!("claimed existing page: pid={pid} addr={addr:#x}");
                    FaultOutcome::Resolved
                }
                Err(e) => {
                    warn!("claim failed for pid={pid} addr={addr:#x}: {e}");
                    FaultOutcome::Reject
                }
            };
        }

        if user && is_stack_growth_candidate(addr, saved_rsp) {
            debug!("growing stack: pid={pid} addr={addr:#x} rsp={saved_rsp:#x}");
            return match self.grow_stack(pid, va) {
                Ok(()) => FaultOutcome::Resolved,
                Err(e) => {
                    warn!("stack growth failed for pid={pid} addr={addr:#x}: {e}");
                    FaultOutcome::Reject
                }
            };
        }

        warn!("rejecting fault with no backing page: pid={pid} addr={addr:#x}");
        FaultOutcome::Reject
    }

    /// `vm_stack_growth`: register a fresh anonymous page at `va` and claim
    /// it immediately, so the faulting instruction can be retried against a
    /// present page.
    fn grow_stack(&mut self, pid: AddressSpaceId, va: usize) -> VmResult<()> {
        self.register_lazy_anon(pid, va, true)?;
        if let Err(e) = self.claim(pid, va) {
            // Don't leave a registered-but-unreachable page behind.
            if let Some(proc) = self.processes.get_mut(&pid) {
                proc.spt.remove_entry(va);
            }
            return Err(e);
        }
        Ok(())
    }
}
