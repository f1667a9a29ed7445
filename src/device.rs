// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! The swap block device this core consumes (spec.md §6), modeled on
//! `pintos/vm/anon.c`'s `disk_read`/`disk_write`/`disk_size` calls against
//! a fixed-sector-size disk.

use crate::config::DISK_SECTOR_SIZE;

pub trait SwapDevice {
    /// Read one `DISK_SECTOR_SIZE`-byte sector into `buf`. `buf` must be
    /// exactly `DISK_SECTOR_SIZE` bytes.
    fn sector_read(&mut self, sector: usize, buf: &mut [u8]);

    /// Write one `DISK_SECTOR_SIZE`-byte sector from `buf`.
    fn sector_write(&mut self, sector: usize, buf: &[u8]);

    /// Total sector count on the device.
    fn size_in_sectors(&self) -> usize;
}

/// An in-memory swap device for tests: a flat byte buffer sized to a
/// fixed sector count.
pub struct MemSwapDevice {
    sectors: Vec<[u8; DISK_SECTOR_SIZE]>,
}

impl MemSwapDevice {
    pub fn new(sector_count: usize) -> Self { MemSwapDevice { sectors: vec![[0u8; DISK_SECTOR_SIZE]; sector_count] } }
}

impl SwapDevice for MemSwapDevice {
    fn sector_read(&mut self, sector: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), DISK_SECTOR_SIZE);
        buf.copy_from_slice(&self.sectors[sector]);
    }

    fn sector_write(&mut self, sector: usize, buf: &[u8]) {
        assert_eq!(buf.len(), DISK_SECTOR_SIZE);
        self.sectors[sector].copy_from_slice(buf);
    }

    fn size_in_sectors(&self) -> usize { self.sectors.len() }
}
