// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! `mmap`/`munmap` (spec.md §4.9), grounded on `pintos/userprog/syscall.c`'s
//! `mmap`/`munmap` handlers and `vm/file.c`'s `do_mmap`/`do_munmap` (the
//! original leaves both bodies as stubs; this is a full implementation).
//!
//! The original reopens the caller's file once per mapping so the mapping
//! survives the caller closing its own descriptor, and stores the reopened
//! handle on the `mmap_file` struct it threads through every page in the
//! region for later `munmap`/process-exit teardown. The same shape is kept
//! here: `mmap` reopens once for the region (`MmapRegion::file`, closed on
//! teardown) and once more per page, since each `Page` owns its
//! `FileHandle` outright rather than sharing one behind a `Rc`.

use std::slice;

use log::{debug, warn};

use crate::config::{page_round_down, PGSIZE};
use crate::device::SwapDevice;
use crate::error::{VmError, VmResult};
use crate::file::FileHandle;
use crate::mmu::{AddressSpaceId, Mmu};
use crate::palloc::PhysicalAllocator;
use crate::system::{MmapRegion, VmSystem};

impl<M: Mmu, A: PhysicalAllocator, D: SwapDevice> VmSystem<M, A, D> {
    /// Map `length` bytes of `file` starting at `offset` into `pid`'s
    /// address space at `addr`. Fails the whole call, leaving no partial
    /// mapping behind, if any page in the range is already mapped or a
    /// later page's registration fails after earlier ones succeeded.
    pub fn mmap(
        &mut self,
        pid: AddressSpaceId,
        addr: usize,
        length: usize,
        writable: bool,
        file: &dyn FileHandle,
        offset: u64,
    ) -> VmResult<usize> {
        if length == 0 || addr == 0 || addr != page_round_down(addr) || offset % PGSIZE as u64 != 0 {
            return Err(VmError::MmapArgsInvalid);
        }
        if file.length() == 0 {
            return Err(VmError::MmapArgsInvalid);
        }
        let end = addr.checked_add(length).ok_or(VmError::MmapArgsInvalid)?;
        if end > crate::config::USER_STACK {
            return Err(VmError::MmapArgsInvalid);
        }
        let page_count = (length + PGSIZE - 1) / PGSIZE;

        {
            let proc = self.processes.get(&pid).ok_or(VmError::IllegalAccess)?;
            for i in 0..page_count {
                if proc.spt.contains(addr + i * PGSIZE) {
                    return Err(VmError::MmapArgsInvalid);
                }
            }
        }

        let region_file = file.reopen().map_err(|_| VmError::MmapArgsInvalid)?;
        let file_len = region_file.length();

        let mut mapped_vas = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let va = addr + i * PGSIZE;
            let page_offset = offset + (i * PGSIZE) as u64;
            let in_mapping = length - i * PGSIZE;
            let read_bytes = if page_offset >= file_len {
                0
            } else {
                ((file_len - page_offset) as usize).min(PGSIZE).min(in_mapping)
            };

            let page_file = match region_file.reopen() {
                Ok(f) => f,
                Err(_) => {
                    self.rollback_mmap(pid, &mapped_vas);
                    return Err(VmError::MmapArgsInvalid);
                }
            };
            match self.register_lazy_file(pid, va, writable, page_file, page_offset, read_bytes) {
                Ok(()) => mapped_vas.push(va),
                Err(e) => {
                    self.rollback_mmap(pid, &mapped_vas);
                    return Err(e);
                }
            }
        }

        let proc = self.processes.get_mut(&pid).expect("checked present above");
        proc.regions.push(MmapRegion { start: addr, page_count, file: region_file });
        Ok(addr)
    }

    /// Undo a partially-registered mapping: the affected pages were only
    /// ever `register_lazy`'d, never claimed, so they are dropped directly
    /// rather than run through `Page::destroy`.
    fn rollback_mmap(&mut self, pid: AddressSpaceId, vas: &[usize]) {
        if let Some(proc) = self.processes.get_mut(&pid) {
            for &va in vas {
                proc.spt.remove_entry(va);
            }
        }
    }

    /// Unmap the region that starts at `addr` in `pid`'s address space.
    /// Each page is torn down through `Page::destroy`, which writes back
    /// any dirty file bytes before the frame (if any) is released. Fails
    /// if `addr` does not name the start of a currently-mapped region.
    pub fn munmap(&mut self, pid: AddressSpaceId, addr: usize) -> VmResult<()> {
        if addr != page_round_down(addr) {
            return Err(VmError::MmapArgsInvalid);
        }
        let proc = self.processes.get_mut(&pid).ok_or(VmError::IllegalAccess)?;
        let idx = proc.regions.iter().position(|r| r.start == addr).ok_or(VmError::MmapArgsInvalid)?;
        let region = proc.regions.remove(idx);

        for i in 0..region.page_count {
            let va = addr + i * PGSIZE;
            let frame_id = proc.spt.find(va).and_then(|p| p.frame);
            let bytes = frame_id.map(|id| {
                let kva = self.frames.get(id).expect("page.frame names a live frame").kva;
                unsafe { slice::from_raw_parts(kva as *const u8, PGSIZE) }.to_vec()
            });
            proc.spt.remove(va, bytes.as_deref(), &mut self.swap, &mut self.mmu);
            if let Some(id) = frame_id {
                self.frames.release(id);
            }
        }
        region.file.close();
        Ok(())
    }
}
