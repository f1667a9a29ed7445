// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Top-level wiring: the process-wide frame table and swap store, plus a
//! registry of per-process address spaces (spec.md §2, §5). Grounded on
//! the teacher's `MemoryManager` (`kernel/src/mem.rs`) as the
//! single-instance, explicitly-initialized subsystem that the rest of the
//! kernel reaches through one handle, per the Design Notes in spec.md §9
//! ("encapsulate as explicitly-initialized subsystems... accessed via a
//! single module-level handle set once at boot").
//!
//! `claim` and the eviction it may trigger are the one place frame-table
//! bookkeeping, the swap store, the MMU and a (possibly different
//! process's) SPT all have to be visited in the same critical section —
//! this is the orchestration spec.md §2's control-flow paragraph
//! describes ("frame obtain -> PTE install -> swap_in", with "eviction...
//! driven from inside frame allocation").

use std::collections::HashMap;
use std::slice;

use crate::config::{page_round_down, PGSIZE};
use crate::device::SwapDevice;
use crate::error::{VmError, VmResult};
use crate::file::FileHandle;
use crate::frame::{FrameId, FrameTable};
use crate::mmu::{AddressSpaceId, Mmu};
use crate::page::Page;
use crate::palloc::PhysicalAllocator;
use crate::spt::SupplementalPageTable;
use crate::swap::SwapStore;

/// One mmap'd region of a process (spec.md §3's `mmap Region` entity).
pub struct MmapRegion {
    pub start: usize,
    pub page_count: usize,
    pub file: Box<dyn FileHandle>,
}

#[derive(Default)]
pub struct Process {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) regions: Vec<MmapRegion>,
}

pub struct VmSystem<M: Mmu, A: PhysicalAllocator, D: SwapDevice> {
    pub(crate) mmu: M,
    pub(crate) frames: FrameTable<A>,
    pub(crate) swap: SwapStore<D>,
    pub(crate) processes: HashMap<AddressSpaceId, Process>,
}

impl<M: Mmu, A: PhysicalAllocator, D: SwapDevice> VmSystem<M, A, D> {
    pub fn new(mmu: M, allocator: A, swap_device: D) -> Self {
        VmSystem {
            mmu,
            frames: FrameTable::new(allocator),
            swap: SwapStore::init(swap_device),
            processes: HashMap::new(),
        }
    }

    pub fn mmu(&self) -> &M { &self.mmu }

    pub fn mmu_mut(&mut self) -> &mut M { &mut self.mmu }

    pub fn frame_count(&self) -> usize { self.frames.len() }

    pub fn swap_in_use_count(&self) -> usize { self.swap.in_use_count() }

    /// `spt_init`: create an empty address space for `pid`.
    pub fn spt_init(&mut self, pid: AddressSpaceId) { self.processes.insert(pid, Process::default()); }

    /// `spt_kill`: destroy every page and region belonging to `pid`,
    /// writing back dirty file pages transitively, then drop the process
    /// entry. A no-op if `pid` is unknown.
    pub fn spt_kill(&mut self, pid: AddressSpaceId) {
        let Some(mut proc) = self.processes.remove(&pid) else { return };
        let frames = &mut self.frames;
        proc.spt.kill(
            |id| {
                let kva = frames.get(id).expect("page.frame always names a live frame").kva;
                let bytes = unsafe { slice::from_raw_parts(kva as *const u8, PGSIZE) }.to_vec();
                frames.release(id);
                bytes
            },
            &mut self.swap,
            &mut self.mmu,
        );
        for region in proc.regions.drain(..) {
            region.file.close();
        }
    }

    pub fn process(&self, pid: AddressSpaceId) -> Option<&Process> { self.processes.get(&pid) }

    /// `register_lazy` for an anonymous page (spec.md §6).
    pub fn register_lazy_anon(&mut self, pid: AddressSpaceId, va: usize, writable: bool) -> VmResult<()> {
        let proc = self.processes.get_mut(&pid).ok_or(VmError::IllegalAccess)?;
        proc.spt.insert(Page::new_anon(pid, page_round_down(va), writable))
    }

    /// `register_lazy` for a file-backed page (spec.md §6).
    pub fn register_lazy_file(
        &mut self,
        pid: AddressSpaceId,
        va: usize,
        writable: bool,
        file: Box<dyn FileHandle>,
        offset: u64,
        read_bytes: usize,
    ) -> VmResult<()> {
        let proc = self.processes.get_mut(&pid).ok_or(VmError::IllegalAccess)?;
        proc.spt.insert(Page::new_file(pid, page_round_down(va), writable, file, offset, read_bytes))
    }

    /// `claim(va)` (spec.md §4.8): obtain a frame (evicting if necessary),
    /// pin it, install the PTE, run the page's `swap_in`, then unpin.
    /// Unwinds (releases the frame, leaves no PTE installed) on any
    /// failure.
    pub fn claim(&mut self, pid: AddressSpaceId, va: usize) -> VmResult<()> {
        let va = page_round_down(va);
        let writable = self
            .processes
            .get(&pid)
            .and_then(|p| p.spt.find(va))
            .map(|p| p.writable)
            .ok_or(VmError::IllegalAccess)?;

        let frame_id = self.obtain_frame()?;
        let kva = self.frames.get(frame_id).expect("just obtained").kva;

        if !self.mmu.set_pte(pid, va, kva, writable) {
            self.frames.release(frame_id);
            return Err(VmError::NoPhysicalFrame);
        }

        let frame_bytes = unsafe { slice::from_raw_parts_mut(kva as *mut u8, PGSIZE) };
        let page = self
            .processes
            .get_mut(&pid)
            .and_then(|p| p.spt.find_mut(va))
            .expect("checked present above; SPT is only mutated by the owning thread");

        match page.swap_in(frame_bytes, &mut self.swap) {
            Ok(()) => {
                page.frame = Some(frame_id);
                let frame = self.frames.get_mut(frame_id).expect("just obtained");
                frame.owner = Some((pid, va));
                frame.pinned = false;
                Ok(())
            }
            Err(e) => {
                self.mmu.clear_pte(pid, va);
                self.frames.release(frame_id);
                Err(e)
            }
        }
    }

    /// Obtain a frame ready to receive a new page's contents, evicting the
    /// current occupant first if the allocator had to recycle one. A
    /// recycled frame is zeroed only *after* eviction has written its old
    /// occupant's bytes to backing store — `FrameTable::obtain` itself
    /// cannot zero it up front without destroying the very bytes
    /// `swap_out` still needs to persist.
    pub(crate) fn obtain_frame(&mut self) -> VmResult<FrameId> {
        let frame_id = self.frames.obtain(&mut self.mmu).ok_or(VmError::NoPhysicalFrame)?;
        let owner = self.frames.get(frame_id).expect("just obtained").owner;
        if let Some((space, va)) = owner {
            self.evict(frame_id, space, va)?;
            self.frames.zero(frame_id);
        }
        Ok(frame_id)
    }

    fn evict(&mut self, frame_id: FrameId, space: AddressSpaceId, va: usize) -> VmResult<()> {
        let kva = self.frames.get(frame_id).expect("frame exists during eviction").kva;
        let frame_bytes = unsafe { slice::from_raw_parts(kva as *const u8, PGSIZE) };
        let page = self
            .processes
            .get_mut(&space)
            .and_then(|p| p.spt.find_mut(va))
            .ok_or(VmError::NoPhysicalFrame)?;
        page.swap_out(frame_bytes, &mut self.swap, &mut self.mmu)?;
        page.frame = None;
        self.frames.get_mut(frame_id).expect("frame exists during eviction").owner = None;
        Ok(())
    }

    /// Read-only access to a resident page's bytes, for tests and
    /// diagnostics (spec.md §8 property 4 relies on being able to observe
    /// the bytes a claim produced).
    pub fn resolve_bytes(&self, pid: AddressSpaceId, va: usize) -> Option<&[u8]> {
        let kva = self.mmu.resolve(pid, page_round_down(va))?;
        Some(unsafe { slice::from_raw_parts(kva as *const u8, PGSIZE) })
    }
}
