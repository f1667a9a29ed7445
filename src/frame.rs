// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The system-wide frame table (spec.md §2.2, §4.2), grounded on
//! `pintos/vm/vm.c`'s static `frame_table` list plus `next` clock cursor
//! (`vm_get_victim`/`vm_evict_frame`/`vm_get_frame`/`free_frame`) and the
//! teacher's convention of a process-wide singleton guarded by one lock
//! (`kernel/src/mem.rs`'s `MemoryManager`).
//!
//! Per the Design Notes in spec.md §9, the Page<->Frame back-reference is
//! expressed as two non-owning handles rather than owning pointers: a
//! `Frame` only remembers *which* `(space, va)` currently owns it, never a
//! pointer into the page itself. The page is found again by looking it up
//! in that address space's SPT when eviction needs to call `swap_out`.

use log::trace;

use crate::config::{EVICTION_SCAN_MULTIPLIER, PGSIZE};
use crate::mmu::{AddressSpaceId, Mmu};
use crate::palloc::PhysicalAllocator;

pub type FrameId = usize;

pub struct Frame {
    /// Kernel virtual address of the backing physical page.
    pub kva: usize,
    /// The page currently using this frame, if any.
    pub owner: Option<(AddressSpaceId, usize)>,
    /// True while a claim is in progress: prevents eviction from stealing
    /// a frame that has not yet been filled in by `swap_in`.
    pub pinned: bool,
}

/// A singly-owned, process-wide registry of allocated frames, insertion
/// order preserved in `ring` so the clock hand has a stable iteration
/// order. Frames are stored in a slot array indexed by `FrameId` so that a
/// `Page`'s stored `FrameId` never dangles across an unrelated frame's
/// release (unlike a `Vec::swap_remove`, which would silently relocate a
/// different frame into the freed slot).
pub struct FrameTable<A: PhysicalAllocator> {
    allocator: A,
    slots: Vec<Option<Frame>>,
    ring: Vec<FrameId>,
    cursor: usize,
}

impl<A: PhysicalAllocator> FrameTable<A> {
    pub fn new(allocator: A) -> Self { FrameTable { allocator, slots: Vec::new(), ring: Vec::new(), cursor: 0 } }

    pub fn len(&self) -> usize { self.ring.len() }

    pub fn is_empty(&self) -> bool { self.ring.is_empty() }

    pub fn get(&self, id: FrameId) -> Option<&Frame> { self.slots.get(id).and_then(|s| s.as_ref()) }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> { self.slots.get_mut(id).and_then(|s| s.as_mut()) }

    /// Obtain a fresh physical user frame, pinned and with no attached
    /// page. If the physical allocator is exhausted, picks an eviction
    /// victim via `pick_victim` instead of allocating a new one; the
    /// caller is responsible for swapping the victim's current page out
    /// (its old bytes are still live at this point) and then calling
    /// `zero` before handing the frame to a fresh page (the frame table
    /// itself has no way to reach the page's operations, which live in
    /// another process's SPT). A recycled victim is *not* zero-filled by
    /// this call — only the fresh-allocation branch is, for free, by the
    /// physical allocator.
    pub fn obtain(&mut self, mmu: &mut dyn Mmu) -> Option<FrameId> {
        if let Some(kva) = self.allocator.alloc_user_zero() {
            let id = self.slots.len();
            self.slots.push(Some(Frame { kva, owner: None, pinned: true }));
            self.ring.push(id);
            return Some(id);
        }
        trace!("physical allocator exhausted, evicting");
        let victim = self.pick_victim(mmu)?;
        if let Some(f) = self.get_mut(victim) {
            f.pinned = true;
        }
        Some(victim)
    }

    /// Zero the physical bytes backing `id`. Called once a recycled
    /// victim's old contents have been written out by `swap_out` (or
    /// discarded, if the victim had no owner) — this is the step that
    /// makes a recycled frame satisfy the same "zero-filled" guarantee a
    /// freshly allocated frame gets from the physical allocator, which
    /// `Page::swap_in`'s first-touch anon arm relies on without doing any
    /// zeroing of its own.
    pub fn zero(&mut self, id: FrameId) {
        if let Some(f) = self.get(id) {
            let kva = f.kva;
            unsafe { std::slice::from_raw_parts_mut(kva as *mut u8, PGSIZE) }.fill(0);
        }
    }

    /// Detach any current page (the caller must have already cleared the
    /// PTE and run `destroy`/`swap_out` on the owning page), remove the
    /// frame from the ring, and free the physical page.
    pub fn release(&mut self, id: FrameId) {
        let kva = match self.slots.get(id).and_then(|s| s.as_ref()) {
            Some(f) => f.kva,
            None => return,
        };
        self.ring.retain(|&r| r != id);
        if self.cursor > 0 && self.cursor >= self.ring.len() {
            self.cursor = 0;
        }
        self.slots[id] = None;
        self.allocator.free(kva);
    }

    /// Clock algorithm (spec.md §4.2): starting at the cursor, skip pinned
    /// frames and frames with no attached page; for each candidate, clear
    /// the accessed bit and grant a second chance if it was set, otherwise
    /// return it as the victim. Bounded to `2 * ring.len()` iterations.
    /// If the bound is exhausted without finding an unaccessed candidate
    /// (e.g. every live frame keeps getting re-accessed), fall back to the
    /// first unpinned frame seen during the scan, so any ring with at
    /// least one unpinned, owned frame always yields a victim.
    fn pick_victim(&mut self, mmu: &mut dyn Mmu) -> Option<FrameId> {
        if self.ring.is_empty() {
            return None;
        }
        let n = self.ring.len();
        let bound = n * EVICTION_SCAN_MULTIPLIER;
        if self.cursor >= n {
            self.cursor = 0;
        }
        let mut fallback: Option<FrameId> = None;
        for _ in 0..bound {
            let id = self.ring[self.cursor];
            self.cursor = (self.cursor + 1) % n;

            let (owner, pinned) = match self.get(id) {
                Some(f) => (f.owner, f.pinned),
                None => continue,
            };
            let (space, va) = match owner {
                Some(ov) => ov,
                None => continue,
            };
            if pinned {
                continue;
            }
            if fallback.is_none() {
                fallback = Some(id);
            }
            if mmu.is_accessed(space, va) {
                mmu.set_accessed(space, va, false);
                continue;
            }
            trace!("clock picked victim frame {id} owned by (space={space}, va={va:#x})");
            return Some(id);
        }
        if let Some(id) = fallback {
            trace!("clock scan exhausted, falling back to frame {id}");
        }
        fallback
    }
}
