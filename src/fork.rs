// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! `fork`'s address-space duplication (spec.md §4.10), grounded on
//! `pintos/userprog/process.c`'s `supplemental_page_table_copy` and the
//! `duplicate_pte` walk it drives.
//!
//! The original copies the page-table-entry level, calling into the SPT for
//! each present mapping; here the SPT owns the full picture already, so the
//! copy walks `src`'s pages directly. Per spec.md §9's Open Question
//! decision, file-backed mappings (mmap'd or not yet resident) are never
//! inherited by `fork` — only anonymous memory is, whether still uninit or
//! already resident. A resident anon page is duplicated by allocating a
//! fresh frame in the child, claiming it, and copying bytes across (an
//! eager copy; this design has no copy-on-write path, spec.md's Non-goals).

use std::slice;

use crate::config::PGSIZE;
use crate::device::SwapDevice;
use crate::error::VmResult;
use crate::mmu::{AddressSpaceId, Mmu};
use crate::page::{PageKind, PageType};
use crate::palloc::PhysicalAllocator;
use crate::swap::SwapSlot;
use crate::system::VmSystem;

/// What a source anon page contributes to the child: either it has no
/// contents yet (still uninit, or the initializer simply hasn't run) and
/// the child gets a fresh lazy page, or it has bytes somewhere (resident in
/// a frame, or parked in a swap slot) that must be copied across verbatim.
enum AnonContent {
    Uninit,
    Bytes(Vec<u8>),
}

impl<M: Mmu, A: PhysicalAllocator, D: SwapDevice> VmSystem<M, A, D> {
    /// `spt_copy`: populate `dst`'s (already-`spt_init`'d) address space
    /// with a copy of every anonymous page in `src`'s. `dst` must be empty
    /// of any conflicting VA; a collision aborts that one page's copy and
    /// continues with the rest (spec.md: "no rollback on failure").
    pub fn spt_copy(&mut self, src: AddressSpaceId, dst: AddressSpaceId) -> VmResult<()> {
        let entries: Vec<(usize, bool, Option<usize>, Option<SwapSlot>)> = {
            let proc = match self.processes.get(&src) {
                Some(p) => p,
                None => return Ok(()),
            };
            proc.spt
                .iter()
                .filter(|p| p.page_type() == PageType::Anon)
                .map(|p| {
                    let slot = match &p.kind {
                        PageKind::Anon(a) => a.slot,
                        _ => None,
                    };
                    (p.va, p.writable, p.frame, slot)
                })
                .collect()
        };

        for (va, writable, frame, slot) in entries {
            let content = match (frame, slot) {
                (Some(_), _) => {
                    // Resident: read the live bytes out of the parent's frame.
                    let kva = self.mmu.resolve(src, va).expect("resident page must have an installed PTE");
                    AnonContent::Bytes(unsafe { slice::from_raw_parts(kva as *const u8, PGSIZE) }.to_vec())
                }
                (None, Some(slot)) => {
                    // Swapped out: peek the slot without releasing it, so
                    // the parent's own page is untouched by the copy.
                    let mut bytes = vec![0u8; PGSIZE];
                    self.swap.read_page(slot, &mut bytes);
                    AnonContent::Bytes(bytes)
                }
                (None, None) => AnonContent::Uninit,
            };

            if self.register_lazy_anon(dst, va, writable).is_err() {
                continue;
            }
            if let AnonContent::Bytes(bytes) = content {
                if self.claim(dst, va).is_err() {
                    continue;
                }
                let dst_kva = self.mmu.resolve(dst, va).expect("just claimed");
                unsafe { slice::from_raw_parts_mut(dst_kva as *mut u8, PGSIZE) }.copy_from_slice(&bytes);
            }
        }
        Ok(())
    }
}
