// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The swap store (spec.md §2.1, §4.1), grounded on `pintos/vm/anon.c`'s
//! `swap_table` bitmap over `SECTOR_PER_PAGE`-sized slots, and the
//! teacher's `swap.rs` which also manages a fixed pool of page-sized slots
//! on a dedicated device (though the teacher's slot bookkeeping is encoded
//! in-band in an allocation-table entry per physical page rather than a
//! bitmap; this module follows the simpler bitmap the Pintos original
//! uses, since there is no physical-allocation epoch to track here).

use log::warn;

use crate::config::SECTORS_PER_PAGE;
use crate::device::SwapDevice;
use crate::error::{VmError, VmResult};

pub type SwapSlot = usize;

pub struct SwapStore<D: SwapDevice> {
    device: D,
    /// `true` at index `i` iff slot `i` is currently occupied.
    in_use: Vec<bool>,
}

impl<D: SwapDevice> SwapStore<D> {
    /// Binds `device` and partitions it into equal-size slots, each
    /// holding exactly one page (`SECTORS_PER_PAGE` sectors).
    pub fn init(device: D) -> Self {
        let slot_count = device.size_in_sectors() / SECTORS_PER_PAGE;
        SwapStore { device, in_use: vec![false; slot_count] }
    }

    pub fn capacity(&self) -> usize { self.in_use.len() }

    pub fn in_use_count(&self) -> usize { self.in_use.iter().filter(|&&b| b).count() }

    /// First-free-slot scan, atomic with respect to the caller holding
    /// whatever lock serializes concurrent swap-outs (spec.md §5): two
    /// evictions racing to allocate a slot must not receive the same
    /// index, so callers are expected to hold the store behind a mutex
    /// and call `allocate` + mark-in-use as a single critical section.
    pub fn allocate(&mut self) -> VmResult<SwapSlot> {
        let slot = self.in_use.iter().position(|&used| !used).ok_or_else(|| {
            warn!("swap store exhausted: {} slots all in use", self.in_use.len());
            VmError::NoSwapSpace
        })?;
        self.in_use[slot] = true;
        Ok(slot)
    }

    pub fn release(&mut self, slot: SwapSlot) { self.in_use[slot] = false; }

    /// Write an entire page to `slot`. Synchronous: returns only once the
    /// transfer has completed.
    pub fn write_page(&mut self, slot: SwapSlot, page: &[u8]) {
        debug_assert_eq!(page.len() % crate::config::DISK_SECTOR_SIZE, 0);
        for i in 0..SECTORS_PER_PAGE {
            let start = i * crate::config::DISK_SECTOR_SIZE;
            let end = start + crate::config::DISK_SECTOR_SIZE;
            self.device.sector_write(slot * SECTORS_PER_PAGE + i, &page[start..end]);
        }
    }

    /// Read an entire page back from `slot`.
    pub fn read_page(&mut self, slot: SwapSlot, page: &mut [u8]) {
        debug_assert_eq!(page.len() % crate::config::DISK_SECTOR_SIZE, 0);
        for i in 0..SECTORS_PER_PAGE {
            let start = i * crate::config::DISK_SECTOR_SIZE;
            let end = start + crate::config::DISK_SECTOR_SIZE;
            self.device.sector_read(slot * SECTORS_PER_PAGE + i, &mut page[start..end]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PGSIZE;
    use crate::device::MemSwapDevice;

    fn store(pages: usize) -> SwapStore<MemSwapDevice> {
        SwapStore::init(MemSwapDevice::new(pages * SECTORS_PER_PAGE))
    }

    #[test]
    fn allocate_and_release_reuses_slots() {
        let mut s = store(2);
        let a = s.allocate().unwrap();
        let b = s.allocate().unwrap();
        assert_ne!(a, b);
        assert!(s.allocate().is_err());
        s.release(a);
        assert_eq!(s.allocate().unwrap(), a);
    }

    #[test]
    fn round_trips_a_page() {
        let mut s = store(1);
        let slot = s.allocate().unwrap();
        let page = vec![0x42u8; PGSIZE];
        s.write_page(slot, &page);
        let mut out = vec![0u8; PGSIZE];
        s.read_page(slot, &mut out);
        assert_eq!(out, page);
    }

    #[test]
    fn exhaustion_is_no_swap_space() {
        let mut s = store(0);
        assert_eq!(s.allocate(), Err(VmError::NoSwapSpace));
    }
}
