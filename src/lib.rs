// SPDX-FileCopyrightText: 2020 Sean Cross <sean@xobs.io>
// SPDX-License-Identifier: Apache-2.0

//! Demand-paged virtual memory: a supplemental page table per address
//! space, a process-wide frame table with clock eviction, and uninit/
//! anon/file-backed pages, wired together by [`system::VmSystem`].
//!
//! This crate is deliberately hosted rather than `no_std`: the surrounding
//! kernel's physical allocator, page-table walker and swap device are each
//! represented by a trait ([`palloc::PhysicalAllocator`], [`mmu::Mmu`],
//! [`device::SwapDevice`]) with a `std`-backed mock implementation, so the
//! eviction and fault-handling logic can be exercised directly under
//! `cargo test` instead of only on real hardware.

pub mod config;
pub mod device;
pub mod error;
pub mod fault;
pub mod file;
pub mod fork;
pub mod frame;
pub mod mmap;
pub mod mmu;
pub mod page;
pub mod palloc;
pub mod spt;
pub mod swap;
pub mod system;

pub use error::{VmError, VmResult};
pub use fault::FaultOutcome;
pub use system::VmSystem;
